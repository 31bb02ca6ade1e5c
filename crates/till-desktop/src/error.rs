use till_service::ServiceName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InterpreterNotFound,
    Environment,
    PortInUse,
    SpawnFailed,
    AlreadyRunning,
    ShuttingDown,
    ServiceUnhealthy,
    StartupTimeout,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("no usable Python 3 interpreter found; tried:\n{}", .tried.join("\n"))]
    InterpreterNotFound { tried: Vec<String> },

    #[error("failed to prepare backend environment: {message}")]
    Environment { message: String },

    #[error("port {port} required by the {service} service is already in use")]
    PortInUse { service: ServiceName, port: u16 },

    #[error("failed to start the {service} service: {message}")]
    SpawnFailed {
        service: ServiceName,
        message: String,
    },

    #[error("the {service} service is already running (pid {pid:?})")]
    AlreadyRunning {
        service: ServiceName,
        pid: Option<u32>,
    },

    #[error("the {service} service was not started because the app is shutting down")]
    ShuttingDown { service: ServiceName },

    #[error("the {service} service did not become healthy at {url} after {attempts} attempts")]
    ServiceUnhealthy {
        service: ServiceName,
        url: String,
        attempts: u32,
    },

    #[error("startup took too long (more than {seconds}s)")]
    StartupTimeout { seconds: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StartupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StartupError::InterpreterNotFound { .. } => ErrorKind::InterpreterNotFound,
            StartupError::Environment { .. } => ErrorKind::Environment,
            StartupError::PortInUse { .. } => ErrorKind::PortInUse,
            StartupError::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            StartupError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            StartupError::ShuttingDown { .. } => ErrorKind::ShuttingDown,
            StartupError::ServiceUnhealthy { .. } => ErrorKind::ServiceUnhealthy,
            StartupError::StartupTimeout { .. } => ErrorKind::StartupTimeout,
            StartupError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        StartupError::Environment {
            message: message.into(),
        }
    }

    pub fn remediation(&self) -> Vec<String> {
        match self {
            StartupError::InterpreterNotFound { .. } | StartupError::Environment { .. } => vec![
                "Install Python 3 from https://www.python.org/downloads/".to_string(),
                "Make sure `python3` (or `py -3` on Windows) is on PATH".to_string(),
                "Delete the backend `venv` directory and restart to rebuild it".to_string(),
            ],
            StartupError::PortInUse { port, .. } => vec![
                format!("Close the application that is listening on port {port}"),
                "Check whether another copy of Till is already running".to_string(),
                "Set TILL_BACKEND_PORT / TILL_FRONTEND_PORT to free ports".to_string(),
            ],
            StartupError::StartupTimeout { .. } | StartupError::ServiceUnhealthy { .. } => vec![
                "The first start can be slow while dependencies install; try again".to_string(),
                "Check that antivirus software is not blocking the backend".to_string(),
                "Raise TILL_HEALTH_RETRIES or TILL_STARTUP_TIMEOUT_MS".to_string(),
            ],
            StartupError::SpawnFailed { .. } => vec![
                "Reinstall the application to restore missing files".to_string(),
                "Check the log output for the failing command".to_string(),
            ],
            StartupError::AlreadyRunning { .. } => {
                vec!["Stop the service before starting it again".to_string()]
            }
            StartupError::ShuttingDown { .. } | StartupError::Internal(_) => {
                vec!["Restart the application".to_string()]
            }
        }
    }
}

pub type Result<T, E = StartupError> = std::result::Result<T, E>;

pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_follows_kind_not_message_text() {
        // Mentions "port" but is an environment failure.
        let err = StartupError::environment("pip could not open port 443 to PyPI");
        assert_eq!(err.kind(), ErrorKind::Environment);
        assert!(err.remediation()[0].contains("Python"));

        let err = StartupError::PortInUse {
            service: ServiceName::Backend,
            port: 5000,
        };
        assert!(err.to_string().contains("backend"));
        assert!(err.remediation()[0].contains("5000"));
    }

    #[test]
    fn interpreter_not_found_lists_every_location() {
        let err = StartupError::InterpreterNotFound {
            tried: vec!["bundled: /a".to_string(), "system: python3".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("bundled: /a"));
        assert!(msg.contains("system: python3"));
    }

    #[test]
    fn format_error_chain_skips_duplicate_links() {
        let err = anyhow::anyhow!("inner").context("outer");
        let err = StartupError::from(err);
        assert_eq!(format_error_chain(&err), "outer: inner");
    }
}
