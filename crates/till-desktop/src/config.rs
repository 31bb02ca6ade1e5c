use std::{path::PathBuf, time::Duration};

use till_service::ServiceName;

use crate::health::HealthPolicy;

const DEFAULT_BACKEND_PORT: u16 = 5000;
const DEFAULT_FRONTEND_PORT: u16 = 3001;
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 90_000;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse::<u16>().ok())
}

pub(crate) fn env_u32(name: &str) -> Option<u32> {
    env_string(name).and_then(|v| v.parse::<u32>().ok())
}

pub(crate) fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub(crate) fn env_bool(name: &str) -> bool {
    env_string(name).is_some_and(|v| parse_bool(&v))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub health_path: String,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("{}{}", self.url(), path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DesktopConfig {
    pub backend: Endpoint,
    pub frontend: Endpoint,
    pub ready: HealthPolicy,
    pub window: WindowSize,
    /// Development launch commands (`npm run dev`, reload-friendly backend).
    pub dev: bool,
    /// Running from an installed bundle rather than a source checkout.
    pub packaged: bool,
    pub resources_dir: PathBuf,
    pub backend_dir: PathBuf,
    pub frontend_dir: PathBuf,
    pub backend_entry: String,
    pub marker_package: String,
    pub bridge_port: u16,
    pub startup_timeout: Duration,
    pub log_dir: Option<PathBuf>,
    pub log_max_lines: usize,
}

fn default_resources_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("resources")))
        .unwrap_or_else(|| PathBuf::from("resources"))
}

impl DesktopConfig {
    /// Defaults rooted at `resources_dir`, ignoring the environment.
    pub fn with_resources_dir(resources_dir: PathBuf) -> Self {
        Self {
            backend: Endpoint {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_BACKEND_PORT,
                health_path: "/api/health".to_string(),
            },
            frontend: Endpoint {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_FRONTEND_PORT,
                health_path: "/".to_string(),
            },
            ready: HealthPolicy::default(),
            window: WindowSize {
                width: 1400,
                height: 900,
            },
            dev: false,
            packaged: false,
            backend_dir: resources_dir.join("backend"),
            frontend_dir: resources_dir.join("frontend"),
            resources_dir,
            backend_entry: "app.py".to_string(),
            marker_package: "flask".to_string(),
            bridge_port: 0,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            log_dir: None,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
        }
    }

    pub fn endpoint(&self, name: ServiceName) -> &Endpoint {
        match name {
            ServiceName::Backend => &self.backend,
            ServiceName::Frontend => &self.frontend,
        }
    }

    pub fn from_env() -> Self {
        let resources_dir = env_string("TILL_RESOURCES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_resources_dir);
        let mut cfg = Self::with_resources_dir(resources_dir);

        if let Some(v) = env_string("TILL_BACKEND_HOST") {
            cfg.backend.host = v;
        }
        if let Some(v) = env_u16("TILL_BACKEND_PORT").filter(|p| *p != 0) {
            cfg.backend.port = v;
        }
        if let Some(v) = env_string("TILL_BACKEND_HEALTH_PATH") {
            cfg.backend.health_path = v;
        }
        if let Some(v) = env_string("TILL_FRONTEND_HOST") {
            cfg.frontend.host = v;
        }
        if let Some(v) = env_u16("TILL_FRONTEND_PORT").filter(|p| *p != 0) {
            cfg.frontend.port = v;
        }
        if let Some(v) = env_string("TILL_FRONTEND_HEALTH_PATH") {
            cfg.frontend.health_path = v;
        }

        cfg.ready = HealthPolicy {
            max_retries: env_u32("TILL_HEALTH_RETRIES")
                .map(|v| v.clamp(1, 10_000))
                .unwrap_or(cfg.ready.max_retries),
            retry_delay: env_u64("TILL_HEALTH_RETRY_DELAY_MS")
                .map(|v| Duration::from_millis(v.clamp(10, 60_000)))
                .unwrap_or(cfg.ready.retry_delay),
            timeout: env_u64("TILL_HEALTH_TIMEOUT_MS")
                .map(|v| Duration::from_millis(v.clamp(100, 120_000)))
                .unwrap_or(cfg.ready.timeout),
        };

        cfg.window = WindowSize {
            width: env_u32("TILL_WINDOW_WIDTH")
                .map(|v| v.clamp(640, 7680))
                .unwrap_or(cfg.window.width),
            height: env_u32("TILL_WINDOW_HEIGHT")
                .map(|v| v.clamp(480, 4320))
                .unwrap_or(cfg.window.height),
        };

        cfg.dev = env_bool("TILL_DEV");
        cfg.packaged = env_bool("TILL_PACKAGED");

        if let Some(v) = env_string("TILL_BACKEND_DIR") {
            cfg.backend_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("TILL_FRONTEND_DIR") {
            cfg.frontend_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("TILL_BACKEND_ENTRY") {
            cfg.backend_entry = v;
        }
        if let Some(v) = env_string("TILL_MARKER_PACKAGE") {
            cfg.marker_package = v;
        }

        cfg.bridge_port = env_u16("TILL_BRIDGE_PORT").unwrap_or(0);
        cfg.startup_timeout = Duration::from_millis(
            env_u64("TILL_STARTUP_TIMEOUT_MS")
                .map(|v| v.clamp(1000, 30 * 60 * 1000))
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
        );
        cfg.log_dir = env_string("TILL_LOG_DIR").map(PathBuf::from);
        cfg.log_max_lines = env_usize("TILL_LOG_MAX_LINES")
            .map(|v| v.clamp(100, 50_000))
            .unwrap_or(DEFAULT_LOG_MAX_LINES);

        cfg
    }
}
