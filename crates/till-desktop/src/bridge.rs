use std::{
    future::Future,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde_json::json;

use till_service::ServiceName;

use crate::error::StartupError;
use crate::supervisor::Supervisor;

const MAX_ERROR_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 2 * 1024;
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const DEFAULT_TAIL_LIMIT: usize = 200;
const MAX_TAIL_LIMIT: usize = 5000;

fn default_tail_limit() -> usize {
    DEFAULT_TAIL_LIMIT
}

/// One call from the UI shell.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum BridgeRequest {
    GetServiceStatus {
        #[serde(default)]
        name: Option<ServiceName>,
    },
    StartService {
        name: ServiceName,
    },
    StopService {
        name: ServiceName,
    },
    RestartService {
        name: ServiceName,
    },
    TailLogs {
        name: ServiceName,
        #[serde(default)]
        cursor: u64,
        #[serde(default = "default_tail_limit")]
        limit: usize,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        contents: String,
    },
    GetAppInfo,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BridgeReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl BridgeReply {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            hint: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            success: false,
            error: Some(clip(error.into(), MAX_ERROR_BYTES)),
            hint: hint.map(|h| clip(h, MAX_HINT_BYTES)),
            data: None,
        }
    }
}

const CLIPPED: &str = " [clipped]";

/// Caps `text` at `max_bytes` including the marker, cutting on a char
/// boundary.
fn clip(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let budget = max_bytes.saturating_sub(CLIPPED.len());
    let end = text
        .char_indices()
        .map(|(at, ch)| at + ch.len_utf8())
        .take_while(|&end| end <= budget)
        .last()
        .unwrap_or(0);
    text.truncate(end);
    text.push_str(CLIPPED);
    text
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("path must be absolute")]
    RelativePath,

    #[error("access to {} is not allowed", .0.display())]
    PathNotAllowed(PathBuf),

    #[error("{} is not a file", .0.display())]
    NotAFile(PathBuf),

    #[error("file is too large ({size} bytes, limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("{action} failed for {}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Service(#[from] StartupError),
}

impl BridgeError {
    fn hint(&self) -> Option<String> {
        match self {
            BridgeError::RelativePath | BridgeError::PathNotAllowed(_) => Some(
                "Only files in the app data, documents, downloads, desktop and temp folders can be used"
                    .to_string(),
            ),
            BridgeError::Service(e) => {
                let steps = e.remediation();
                (!steps.is_empty()).then(|| steps.join("; "))
            }
            _ => None,
        }
    }
}

/// Resolves `.` and `..` without touching the filesystem. Relative paths are
/// rejected.
pub fn normalize_path(raw: &str) -> Result<PathBuf, BridgeError> {
    let raw = raw.trim();
    let p = Path::new(raw);
    if raw.is_empty() || !p.is_absolute() {
        return Err(BridgeError::RelativePath);
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => out.push(c.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    Ok(out)
}

/// Canonicalizes the deepest ancestor of `path` that exists and re-appends
/// the remaining (not yet created) components.
async fn resolve_links(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut pending = Vec::new();
    loop {
        if let Ok(real) = tokio::fs::canonicalize(existing).await {
            return pending.iter().rev().fold(real, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                pending.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// App data dir plus the OS-standard user folders that exist on this machine.
pub fn default_allowed_roots() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = [
        dirs::data_dir().map(|d| d.join("till")),
        dirs::document_dir(),
        dirs::download_dir(),
        dirs::desktop_dir(),
        Some(std::env::temp_dir()),
    ]
    .into_iter()
    .flatten()
    .collect();
    roots.dedup();
    roots
}

#[derive(Clone)]
pub struct Bridge {
    supervisor: Supervisor,
    allowed_roots: Arc<Vec<PathBuf>>,
}

impl Bridge {
    pub fn new(supervisor: Supervisor) -> Self {
        Self::with_allowed_roots(supervisor, default_allowed_roots())
    }

    /// Roots are kept as given; symlinks in them are resolved per check.
    pub fn with_allowed_roots(supervisor: Supervisor, roots: Vec<PathBuf>) -> Self {
        let roots = roots
            .iter()
            .filter_map(|r| normalize_path(&r.to_string_lossy()).ok())
            .collect();
        Self {
            supervisor,
            allowed_roots: Arc::new(roots),
        }
    }

    /// Normalizes `raw`, resolves symlinks in its longest existing prefix
    /// and checks the result is one of the allowed roots or nested under one.
    /// Returns the resolved path, which is what the file operation uses.
    pub async fn check_path(&self, raw: &str) -> Result<PathBuf, BridgeError> {
        let path = resolve_links(&normalize_path(raw)?).await;
        for root in self.allowed_roots.iter() {
            if path.starts_with(resolve_links(root).await) {
                return Ok(path);
            }
        }
        Err(BridgeError::PathNotAllowed(path))
    }

    pub async fn handle(&self, req: BridgeRequest) -> BridgeReply {
        let action = action_name(&req);
        match self.dispatch(req).await {
            Ok(data) => BridgeReply::ok(data),
            Err(e) => {
                tracing::warn!(action, error = %e, "bridge request failed");
                let message = crate::error::format_error_chain(&e);
                BridgeReply::failure(message, e.hint())
            }
        }
    }

    async fn dispatch(&self, req: BridgeRequest) -> Result<serde_json::Value, BridgeError> {
        let sup = &self.supervisor;
        match req {
            BridgeRequest::GetServiceStatus { name: Some(name) } => {
                Ok(json!(sup.get_service_status(name).await))
            }
            BridgeRequest::GetServiceStatus { name: None } => {
                Ok(json!(sup.get_all_statuses().await))
            }
            BridgeRequest::StartService { name } => {
                sup.start_service(name).await?;
                Ok(json!(sup.get_service_status(name).await))
            }
            BridgeRequest::StopService { name } => {
                sup.stop_service(name).await?;
                Ok(json!(sup.get_service_status(name).await))
            }
            BridgeRequest::RestartService { name } => {
                let retries = sup.settings().restart.max_retries;
                sup.restart_service(name, retries).await?;
                Ok(json!(sup.get_service_status(name).await))
            }
            BridgeRequest::TailLogs {
                name,
                cursor,
                limit,
            } => {
                let limit = limit.clamp(1, MAX_TAIL_LIMIT);
                Ok(json!(sup.tail_logs(name, cursor, limit).await))
            }
            BridgeRequest::ReadFile { path } => {
                let path = self.check_path(&path).await?;
                let contents = read_file(&path).await?;
                Ok(json!({ "path": path.display().to_string(), "contents": contents }))
            }
            BridgeRequest::WriteFile { path, contents } => {
                let path = self.check_path(&path).await?;
                write_file(&path, &contents).await?;
                Ok(json!({ "path": path.display().to_string(), "bytes": contents.len() }))
            }
            BridgeRequest::GetAppInfo => Ok(self.app_info()),
        }
    }

    fn app_info(&self) -> serde_json::Value {
        let cfg = self.supervisor.config();
        json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "dev": cfg.dev,
            "packaged": cfg.packaged,
            "backend_url": cfg.backend.url(),
            "frontend_url": cfg.frontend.url(),
            "window": { "width": cfg.window.width, "height": cfg.window.height },
        })
    }
}

fn action_name(req: &BridgeRequest) -> &'static str {
    match req {
        BridgeRequest::GetServiceStatus { .. } => "get-service-status",
        BridgeRequest::StartService { .. } => "start-service",
        BridgeRequest::StopService { .. } => "stop-service",
        BridgeRequest::RestartService { .. } => "restart-service",
        BridgeRequest::TailLogs { .. } => "tail-logs",
        BridgeRequest::ReadFile { .. } => "read-file",
        BridgeRequest::WriteFile { .. } => "write-file",
        BridgeRequest::GetAppInfo => "get-app-info",
    }
}

async fn read_file(path: &Path) -> Result<String, BridgeError> {
    let meta = tokio::fs::metadata(path).await.map_err(|source| BridgeError::Io {
        action: "stat",
        path: path.to_path_buf(),
        source,
    })?;
    if !meta.is_file() {
        return Err(BridgeError::NotAFile(path.to_path_buf()));
    }
    if meta.len() > MAX_FILE_BYTES {
        return Err(BridgeError::TooLarge {
            size: meta.len(),
            limit: MAX_FILE_BYTES,
        });
    }
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BridgeError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        })
}

async fn write_file(path: &Path, contents: &str) -> Result<(), BridgeError> {
    if contents.len() as u64 > MAX_FILE_BYTES {
        return Err(BridgeError::TooLarge {
            size: contents.len() as u64,
            limit: MAX_FILE_BYTES,
        });
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| BridgeError::Io {
            action: "write",
            path: path.to_path_buf(),
            source,
        })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn bridge_endpoint(
    State(bridge): State<Bridge>,
    Json(body): Json<serde_json::Value>,
) -> Json<BridgeReply> {
    let reply = match serde_json::from_value::<BridgeRequest>(body) {
        Ok(req) => bridge.handle(req).await,
        Err(e) => BridgeReply::failure(format!("invalid bridge request: {e}"), None),
    };
    Json(reply)
}

pub fn router(bridge: Bridge) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/bridge", post(bridge_endpoint))
        .with_state(bridge)
}

/// Serves the bridge on loopback until `shutdown` resolves.
pub async fn serve<F>(bridge: Bridge, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bridge listening");
    serve_on(listener, bridge, shutdown).await
}

pub async fn serve_on<F>(
    listener: tokio::net::TcpListener,
    bridge: Bridge,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DesktopConfig;
    use crate::platform::current_platform;
    use crate::supervisor::SupervisorSettings;

    fn bridge(roots: Vec<PathBuf>) -> Bridge {
        let cfg = DesktopConfig::with_resources_dir(std::env::temp_dir().join("till-bridge"));
        let settings = SupervisorSettings::from_config(&cfg);
        let sup = Supervisor::with_settings(cfg, settings, current_platform());
        Bridge::with_allowed_roots(sup, roots)
    }

    #[test]
    fn normalize_resolves_dots_lexically() {
        let root = std::env::temp_dir();
        let raw = root.join("a").join(".").join("b").join("..").join("c.txt");
        let p = normalize_path(&raw.to_string_lossy()).unwrap();
        assert_eq!(p, normalize_path(&root.join("a").join("c.txt").to_string_lossy()).unwrap());
    }

    #[test]
    fn normalize_rejects_relative_paths() {
        assert!(matches!(
            normalize_path("notes/today.txt"),
            Err(BridgeError::RelativePath)
        ));
        assert!(matches!(normalize_path("  "), Err(BridgeError::RelativePath)));
    }

    #[tokio::test]
    async fn allow_list_accepts_root_and_nested_paths_only() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("docs");
        let b = bridge(vec![root.clone()]);

        assert!(b.check_path(&root.to_string_lossy()).await.is_ok());
        assert!(b.check_path(&root.join("x/y.txt").to_string_lossy()).await.is_ok());

        let sibling = tmp.path().join("docs-private").join("x.txt");
        assert!(matches!(
            b.check_path(&sibling.to_string_lossy()).await,
            Err(BridgeError::PathNotAllowed(_))
        ));
        let escape = root.join("..").join("other.txt");
        assert!(matches!(
            b.check_path(&escape.to_string_lossy()).await,
            Err(BridgeError::PathNotAllowed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_an_allowed_root_is_refused() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("id_rsa"), "key").unwrap();
        let link = allowed.path().join("ssh");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let b = bridge(vec![allowed.path().to_path_buf()]);
        for target in [link.join("id_rsa"), link.join("new.txt")] {
            assert!(matches!(
                b.check_path(&target.to_string_lossy()).await,
                Err(BridgeError::PathNotAllowed(_))
            ));
        }

        let inner = allowed.path().join("real");
        std::fs::create_dir(&inner).unwrap();
        std::os::unix::fs::symlink(&inner, allowed.path().join("alias")).unwrap();
        let ok = b
            .check_path(&allowed.path().join("alias/notes.txt").to_string_lossy())
            .await
            .unwrap();
        assert!(ok.ends_with("real/notes.txt"));
    }

    #[test]
    fn requests_parse_from_tagged_json() {
        let req: BridgeRequest =
            serde_json::from_str(r#"{"action":"get-service-status"}"#).unwrap();
        assert_eq!(req, BridgeRequest::GetServiceStatus { name: None });

        let req: BridgeRequest =
            serde_json::from_str(r#"{"action":"tail-logs","name":"backend"}"#).unwrap();
        assert_eq!(
            req,
            BridgeRequest::TailLogs {
                name: ServiceName::Backend,
                cursor: 0,
                limit: DEFAULT_TAIL_LIMIT
            }
        );

        assert!(serde_json::from_str::<BridgeRequest>(r#"{"action":"open-dialog"}"#).is_err());
    }

    #[test]
    fn failure_clips_long_errors_on_char_boundaries() {
        let reply = BridgeReply::failure("é".repeat(MAX_ERROR_BYTES), Some("short".to_string()));
        let err = reply.error.unwrap();
        assert!(err.len() <= MAX_ERROR_BYTES);
        assert!(err.ends_with(CLIPPED));
        assert!(err.trim_end_matches(CLIPPED).chars().all(|c| c == 'é'));
        assert_eq!(reply.hint.as_deref(), Some("short"));
        assert!(!reply.success);
    }

    #[tokio::test]
    async fn file_round_trip_inside_allowed_root() {
        let tmp = tempfile::tempdir().unwrap();
        let b = bridge(vec![tmp.path().to_path_buf()]);
        let path = tmp.path().join("receipt.txt").to_string_lossy().into_owned();

        let reply = b
            .handle(BridgeRequest::WriteFile {
                path: path.clone(),
                contents: "total: 42".to_string(),
            })
            .await;
        assert!(reply.success, "{reply:?}");

        let reply = b.handle(BridgeRequest::ReadFile { path }).await;
        assert!(reply.success, "{reply:?}");
        let data = reply.data.unwrap();
        assert_eq!(data["contents"], "total: 42");
    }

    #[tokio::test]
    async fn file_access_outside_roots_is_refused() {
        let allowed = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let target = other.path().join("secret.txt");
        std::fs::write(&target, "x").unwrap();

        let b = bridge(vec![allowed.path().to_path_buf()]);
        let reply = b
            .handle(BridgeRequest::ReadFile {
                path: target.to_string_lossy().into_owned(),
            })
            .await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("not allowed"));
        assert!(reply.hint.is_some());
    }

    #[tokio::test]
    async fn status_and_stop_work_without_running_services() {
        let b = bridge(Vec::new());

        let reply = b.handle(BridgeRequest::GetServiceStatus { name: None }).await;
        assert!(reply.success);
        assert_eq!(reply.data.unwrap().as_array().unwrap().len(), 2);

        let reply = b
            .handle(BridgeRequest::StopService {
                name: ServiceName::Frontend,
            })
            .await;
        assert!(reply.success);
        assert_eq!(reply.data.unwrap()["state"], "stopped");
    }

    #[tokio::test]
    async fn tail_logs_of_an_idle_service_is_empty() {
        let b = bridge(Vec::new());
        let reply = b
            .handle(BridgeRequest::TailLogs {
                name: ServiceName::Backend,
                cursor: 7,
                limit: 0,
            })
            .await;
        assert!(reply.success);
        let data = reply.data.unwrap();
        assert_eq!(data["lines"].as_array().unwrap().len(), 0);
        assert_eq!(data["cursor"], 7);
    }

    #[tokio::test]
    async fn start_without_configuration_reports_an_error() {
        let b = bridge(Vec::new());
        let reply = b
            .handle(BridgeRequest::StartService {
                name: ServiceName::Backend,
            })
            .await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn http_endpoint_answers_with_the_envelope() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_on(listener, bridge(Vec::new()), async move {
            let _ = stop_rx.await;
        }));

        let client = reqwest::Client::new();
        let reply: BridgeReply = client
            .post(format!("http://{addr}/bridge"))
            .json(&json!({ "action": "get-app-info" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(reply.success);
        assert_eq!(reply.data.unwrap()["frontend_url"], "http://127.0.0.1:3001");

        let reply: BridgeReply = client
            .post(format!("http://{addr}/bridge"))
            .json(&json!({ "action": "print" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!reply.success);

        let _ = stop_tx.send(());
        server.await.unwrap().unwrap();
    }
}
