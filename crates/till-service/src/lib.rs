use specta::Type;

/// One of the two services the desktop host supervises.
///
/// NOTE: This is a closed set. The host maps each name to a fixed launch spec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Backend,
    Frontend,
}

impl ServiceName {
    pub const ALL: [ServiceName; 2] = [ServiceName::Backend, ServiceName::Frontend];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceName::Backend => "backend",
            ServiceName::Frontend => "frontend",
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a single spawned process of a service; a restart gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Restarting,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct ServiceStatus {
    pub name: ServiceName,
    pub state: ServiceState,
    pub running: bool,
    pub pid: Option<u32>,
    pub run_id: Option<RunId>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
    pub url: String,
    pub health_url: String,
    pub port: u16,
    pub message: Option<String>,
}
