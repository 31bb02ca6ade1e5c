pub mod launch;
mod process;

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, mpsc, watch};

use till_service::{RunId, ServiceName, ServiceState, ServiceStatus};

use crate::config::{DesktopConfig, Endpoint};
use crate::error::{Result, StartupError};
use crate::health::{HealthPolicy, is_port_in_use, wait_for_ready};
use crate::logs::{LogBuffer, LogStream, LogTail};
use crate::platform::{Platform, current_platform};
use crate::runtime::{ResolvedInterpreter, RuntimeLayout, RuntimeLocator};

pub use launch::{
    LaunchSpec, LaunchStrategy, ServiceDefinition, backend_definition, frontend_definition,
};
pub use process::ExitInfo;

use process::RunningProcess;

const EVENT_CAPACITY: usize = 64;

/// Automatic restart after an unexpected exit. Fixed cooldown, fixed health
/// budget, bounded attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub cooldown: Duration,
    pub health: HealthPolicy,
    pub max_retries: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(2),
            health: HealthPolicy {
                max_retries: 10,
                retry_delay: Duration::from_secs(1),
                timeout: Duration::from_secs(5),
            },
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub ready: HealthPolicy,
    pub restart: RestartPolicy,
    /// How long a graceful stop may take before the forceful signal.
    pub stop_grace: Duration,
    pub log_max_lines: usize,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &DesktopConfig) -> Self {
        Self {
            ready: cfg.ready,
            restart: RestartPolicy::default(),
            stop_grace: Duration::from_secs(5),
            log_max_lines: cfg.log_max_lines,
        }
    }
}

/// Lifecycle notifications. Exit handling is observable here so callers can
/// await a transition instead of sleeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned {
        service: ServiceName,
        pid: Option<u32>,
        run_id: RunId,
    },
    Exited {
        service: ServiceName,
        run_id: RunId,
        code: Option<i32>,
        signal: Option<i32>,
        /// Stop requested, shutdown in progress, or a clean exit.
        expected: bool,
    },
    RestartRequested {
        service: ServiceName,
    },
    RestartAttempt {
        service: ServiceName,
        attempt: u32,
        retries_left: u32,
    },
    Restarted {
        service: ServiceName,
        pid: Option<u32>,
    },
    RestartGaveUp {
        service: ServiceName,
        attempts: u32,
    },
    /// A stop request or shutdown ended a restart before it spawned again.
    RestartCancelled {
        service: ServiceName,
    },
    Stopped {
        service: ServiceName,
    },
}

#[derive(Debug)]
struct ServiceEntry {
    endpoint: Endpoint,
    definition: Option<ServiceDefinition>,
    state: ServiceState,
    process: Option<RunningProcess>,
    exit_code: Option<i32>,
    restart_count: u32,
    message: Option<String>,
    restarting: bool,
    /// Set by an explicit stop while a restart loop owns the service.
    restart_cancelled: bool,
    logs: Arc<Mutex<LogBuffer>>,
}

impl ServiceEntry {
    fn new(endpoint: Endpoint, log_max_lines: usize) -> Self {
        Self {
            endpoint,
            definition: None,
            state: ServiceState::Stopped,
            process: None,
            exit_code: None,
            restart_count: 0,
            message: None,
            restarting: false,
            restart_cancelled: false,
            logs: Arc::new(Mutex::new(LogBuffer::new(log_max_lines))),
        }
    }

    fn status(&self, name: ServiceName) -> ServiceStatus {
        ServiceStatus {
            name,
            state: self.state,
            running: self.process.is_some(),
            pid: self.process.as_ref().and_then(|p| p.pid),
            run_id: self.process.as_ref().map(|p| p.run_id.clone()),
            exit_code: self.exit_code,
            restart_count: self.restart_count,
            url: self.endpoint.url(),
            health_url: self.endpoint.health_url(),
            port: self.endpoint.port,
            message: self.message.clone(),
        }
    }
}

struct Inner {
    config: DesktopConfig,
    settings: SupervisorSettings,
    platform: &'static dyn Platform,
    services: Mutex<BTreeMap<ServiceName, ServiceEntry>>,
    shutting_down: AtomicBool,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Owns the backend and frontend child processes.
///
/// The service map and the shutdown flag are only mutated through this type.
/// At most one process handle is held per service.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: DesktopConfig) -> Self {
        let settings = SupervisorSettings::from_config(&config);
        Self::with_settings(config, settings, current_platform())
    }

    pub fn with_settings(
        config: DesktopConfig,
        settings: SupervisorSettings,
        platform: &'static dyn Platform,
    ) -> Self {
        let services = ServiceName::ALL
            .into_iter()
            .map(|name| {
                let entry = ServiceEntry::new(config.endpoint(name).clone(), settings.log_max_lines);
                (name, entry)
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                settings,
                platform,
                services: Mutex::new(services),
                shutting_down: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn config(&self) -> &DesktopConfig {
        &self.inner.config
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Resolves the backend interpreter (preparing its environment if needed)
    /// and builds both launch definitions.
    pub async fn initialize(&self) -> Result<ResolvedInterpreter> {
        let layout = RuntimeLayout::from_config(&self.inner.config, self.inner.platform);
        let locator = RuntimeLocator::new(layout, self.inner.platform);
        let interpreter = locator.resolve_interpreter().await?;
        tracing::info!(
            interpreter = %interpreter.path.display(),
            source = ?interpreter.source,
            "backend interpreter resolved"
        );
        self.configure(&interpreter.path).await;
        Ok(interpreter)
    }

    pub async fn configure(&self, interpreter: &Path) {
        let cfg = &self.inner.config;
        let backend = backend_definition(cfg, interpreter);
        let frontend = frontend_definition(cfg, self.inner.platform, &backend.url());
        tracing::debug!(
            backend = %backend.launch.display(),
            frontend = %frontend.launch.display(),
            "service definitions built"
        );
        self.set_definition(backend).await;
        self.set_definition(frontend).await;
    }

    pub async fn set_definition(&self, def: ServiceDefinition) {
        let mut map = self.inner.services.lock().await;
        if let Some(entry) = map.get_mut(&def.name) {
            entry.endpoint = def.endpoint.clone();
            entry.definition = Some(def);
        }
    }

    async fn definitions(&self) -> Result<Vec<ServiceDefinition>> {
        let map = self.inner.services.lock().await;
        let mut out = Vec::with_capacity(map.len());
        for (name, entry) in map.iter() {
            let def = entry
                .definition
                .clone()
                .ok_or_else(|| anyhow::anyhow!("the {name} service is not configured"))?;
            out.push(def);
        }
        Ok(out)
    }

    pub fn begin_shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown started; automatic restarts disabled");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Checks both ports, launches both children concurrently, then waits for
    /// both health checks. If either launch fails the other is stopped again.
    pub async fn start_all(&self) -> Result<()> {
        self.start_all_reporting(&|_, _| {}).await
    }

    /// `start_all` with a progress callback for the launch and the health wait.
    pub async fn start_all_reporting(
        &self,
        progress: &(dyn Fn(u8, &str) + Send + Sync),
    ) -> Result<()> {
        progress(40, "Starting services");
        self.launch_all().await?;
        progress(60, "Waiting for services to respond");
        self.wait_for_all_services().await
    }

    async fn launch_all(&self) -> Result<()> {
        let defs = self.definitions().await?;
        for def in &defs {
            if is_port_in_use(def.port()) {
                return Err(StartupError::PortInUse {
                    service: def.name,
                    port: def.port(),
                });
            }
        }

        let (backend, frontend) = tokio::join!(
            self.start_service(ServiceName::Backend),
            self.start_service(ServiceName::Frontend),
        );
        if let Err(e) = backend.and(frontend) {
            let _ = tokio::join!(
                self.stop_service(ServiceName::Backend),
                self.stop_service(ServiceName::Frontend),
            );
            return Err(e);
        }
        Ok(())
    }

    /// Polls both health URLs concurrently with the readiness policy.
    pub async fn wait_for_all_services(&self) -> Result<()> {
        let defs = self.definitions().await?;
        let policy = &self.inner.settings.ready;
        let checks = defs.iter().map(|def| async move {
            let url = def.health_url();
            let ok = wait_for_ready(&url, policy).await;
            (def, url, ok)
        });
        let results = futures_util::future::join_all(checks).await;
        for (def, url, ok) in results {
            if !ok {
                return Err(StartupError::ServiceUnhealthy {
                    service: def.name,
                    url,
                    attempts: policy.max_retries,
                });
            }
            tracing::info!(service = %def.name, url = %def.url(), "service ready");
        }
        Ok(())
    }

    pub async fn start_service(&self, name: ServiceName) -> Result<Option<u32>> {
        self.spawn_service(name, false).await
    }

    /// Shutdown and, for a restart, a cancelling stop are checked under the
    /// map lock so neither can slip in between the check and the spawn.
    async fn spawn_service(&self, name: ServiceName, for_restart: bool) -> Result<Option<u32>> {
        let mut map = self.inner.services.lock().await;
        let entry = map
            .get_mut(&name)
            .ok_or_else(|| anyhow::anyhow!("unknown service: {name}"))?;

        if self.is_shutting_down() {
            return Err(StartupError::ShuttingDown { service: name });
        }
        if for_restart && entry.restart_cancelled {
            return Err(anyhow::anyhow!("restart of the {name} service was cancelled").into());
        }
        if let Some(p) = &entry.process {
            return Err(StartupError::AlreadyRunning {
                service: name,
                pid: p.pid,
            });
        }
        let def = entry
            .definition
            .clone()
            .ok_or_else(|| anyhow::anyhow!("the {name} service is not configured"))?;

        entry.state = ServiceState::Starting;
        entry.message = None;
        tracing::info!(
            service = %name,
            command = %def.launch.display(),
            cwd = %def.launch.cwd.display(),
            "starting service"
        );

        let mut child = match process::build_command(&def).spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {e}", def.launch.display());
                tracing::error!(service = %name, error = %e, "spawn failed");
                entry.state = ServiceState::Crashed;
                entry.message = Some(message.clone());
                return Err(StartupError::SpawnFailed {
                    service: name,
                    message,
                });
            }
        };

        let pid = child.id();
        let run_id = RunId::new();
        if let Some(out) = child.stdout.take() {
            process::forward_output(name, run_id.clone(), LogStream::Stdout, out, entry.logs.clone());
        }
        if let Some(err) = child.stderr.take() {
            process::forward_output(name, run_id.clone(), LogStream::Stderr, err, entry.logs.clone());
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        entry.process = Some(RunningProcess {
            run_id: run_id.clone(),
            pid,
            signals: signal_tx,
            exited: exit_rx,
        });
        entry.state = ServiceState::Running;
        entry.exit_code = None;
        drop(map);

        let sup = self.clone();
        let monitor_run = run_id.clone();
        tokio::spawn(async move {
            let exit = process::watch_child(child, pid, signal_rx).await;
            sup.handle_exit(name, monitor_run, exit).await;
            let _ = exit_tx.send(Some(exit));
        });

        tracing::info!(service = %name, pid, run_id = %run_id.0, "service spawned");
        self.emit(SupervisorEvent::Spawned {
            service: name,
            pid,
            run_id,
        });
        Ok(pid)
    }

    async fn handle_exit(&self, name: ServiceName, run_id: RunId, exit: ExitInfo) {
        let (expected, restart) = {
            let mut map = self.inner.services.lock().await;
            let Some(entry) = map.get_mut(&name) else {
                return;
            };
            if entry.process.as_ref().map(|p| &p.run_id) != Some(&run_id) {
                return;
            }
            let stopping = entry.state == ServiceState::Stopping;
            let expected = stopping || self.is_shutting_down() || exit.success();
            entry.process = None;
            entry.exit_code = exit.code;
            entry.message = Some(exit.describe());
            entry.state = if expected {
                ServiceState::Stopped
            } else {
                ServiceState::Crashed
            };
            let restart = !expected && !entry.restarting;
            if restart {
                entry.restarting = true;
                entry.restart_cancelled = false;
            }
            (expected, restart)
        };

        if expected {
            tracing::info!(service = %name, code = ?exit.code, signal = ?exit.signal, "service exited");
        } else {
            tracing::warn!(service = %name, code = ?exit.code, signal = ?exit.signal, "service exited unexpectedly");
        }
        self.emit(SupervisorEvent::Exited {
            service: name,
            run_id,
            code: exit.code,
            signal: exit.signal,
            expected,
        });

        if restart {
            self.emit(SupervisorEvent::RestartRequested { service: name });
            let sup = self.clone();
            tokio::spawn(async move {
                let retries = sup.inner.settings.restart.max_retries;
                let result = sup.restart_with_retries(name, retries).await;
                sup.release_restart(name).await;
                if let Err(e) = result {
                    tracing::error!(service = %name, error = %e, "automatic restart failed");
                }
            });
        }
    }

    /// Graceful signal first; the forceful one only if the child is still
    /// around after `stop_grace`. Also cancels a restart that is waiting to
    /// respawn the service. No-op when nothing is running.
    pub async fn stop_service(&self, name: ServiceName) -> Result<()> {
        {
            let mut map = self.inner.services.lock().await;
            if let Some(entry) = map.get_mut(&name) {
                if entry.restarting && !entry.restart_cancelled {
                    tracing::info!(service = %name, "stop requested; pending restart cancelled");
                    entry.restart_cancelled = true;
                }
            }
        }
        self.stop_process(name).await
    }

    async fn stop_process(&self, name: ServiceName) -> Result<()> {
        let (signals, mut exited, pid) = {
            let mut map = self.inner.services.lock().await;
            let Some(entry) = map.get_mut(&name) else {
                return Ok(());
            };
            let Some(p) = entry.process.as_ref() else {
                return Ok(());
            };
            let handles = (p.signals.clone(), p.exited.clone(), p.pid);
            entry.state = ServiceState::Stopping;
            entry.message = Some("stopping".to_string());
            handles
        };

        tracing::info!(service = %name, pid, "stopping service");
        let grace = self.inner.settings.stop_grace;
        let sequence = self.inner.platform.kill_signal_sequence();
        for (i, signal) in sequence.iter().enumerate() {
            let _ = signals.send(*signal);
            if i + 1 == sequence.len() {
                wait_exit(&mut exited).await;
                break;
            }
            if tokio::time::timeout(grace, wait_exit(&mut exited)).await.is_ok() {
                break;
            }
            tracing::warn!(
                service = %name,
                pid,
                grace_ms = grace.as_millis() as u64,
                "service ignored graceful stop; killing"
            );
        }

        self.emit(SupervisorEvent::Stopped { service: name });
        Ok(())
    }

    /// Disables automatic restart, then stops both services concurrently.
    pub async fn stop_all(&self) -> Result<()> {
        self.begin_shutdown();
        let stops = ServiceName::ALL.map(|name| self.stop_service(name));
        futures_util::future::join_all(stops)
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn claim_restart(&self, name: ServiceName) -> bool {
        let mut map = self.inner.services.lock().await;
        match map.get_mut(&name) {
            Some(entry) if !entry.restarting => {
                entry.restarting = true;
                entry.restart_cancelled = false;
                true
            }
            _ => false,
        }
    }

    async fn release_restart(&self, name: ServiceName) {
        if let Some(entry) = self.inner.services.lock().await.get_mut(&name) {
            entry.restarting = false;
        }
    }

    /// Stop, cool down, start, health check. Retried `retries_left` more
    /// times on failure, then the service is left down.
    pub async fn restart_service(&self, name: ServiceName, retries_left: u32) -> Result<()> {
        if !self.claim_restart(name).await {
            return Err(anyhow::anyhow!("a restart of the {name} service is already in progress").into());
        }
        let result = self.restart_with_retries(name, retries_left).await;
        self.release_restart(name).await;
        result
    }

    // Boxed because a restart re-enters spawn_service, whose exit handler
    // can schedule another restart.
    fn restart_with_retries(
        &self,
        name: ServiceName,
        retries_left: u32,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let attempts = retries_left.saturating_add(1);
            let mut last_err = None;

            for attempt in 1..=attempts {
                if let Some(outcome) = self.restart_halted(name).await {
                    return outcome;
                }
                self.emit(SupervisorEvent::RestartAttempt {
                    service: name,
                    attempt,
                    retries_left: attempts - attempt,
                });
                self.set_state(name, ServiceState::Restarting, None).await;

                match self.restart_once(name).await {
                    Ok(pid) => {
                        {
                            let mut map = self.inner.services.lock().await;
                            if let Some(entry) = map.get_mut(&name) {
                                entry.restart_count = entry.restart_count.saturating_add(1);
                            }
                        }
                        tracing::info!(service = %name, pid, attempt, "service restarted");
                        self.emit(SupervisorEvent::Restarted { service: name, pid });
                        return Ok(());
                    }
                    Err(e) => {
                        if let Some(outcome) = self.restart_halted(name).await {
                            return outcome;
                        }
                        tracing::warn!(service = %name, attempt, error = %e, "restart attempt failed");
                        last_err = Some(e);
                    }
                }
            }

            tracing::error!(service = %name, attempts, "giving up on restarting service");
            self.set_state(
                name,
                ServiceState::Crashed,
                Some(format!("restart failed after {attempts} attempts")),
            )
            .await;
            self.emit(SupervisorEvent::RestartGaveUp {
                service: name,
                attempts,
            });
            Err(last_err.unwrap_or_else(|| {
                anyhow::anyhow!("restart of the {name} service failed").into()
            }))
        })
    }

    /// Whether the restart loop must stop now: `Ok` for a cancelling stop
    /// request, `ShuttingDown` once shutdown has begun.
    async fn restart_halted(&self, name: ServiceName) -> Option<Result<()>> {
        let shutting_down = self.is_shutting_down();
        {
            let mut map = self.inner.services.lock().await;
            let entry = map.get_mut(&name)?;
            if !shutting_down && !entry.restart_cancelled {
                return None;
            }
            if entry.process.is_none() {
                entry.state = ServiceState::Stopped;
                entry.message = Some("restart cancelled".to_string());
            }
        }
        tracing::info!(service = %name, shutting_down, "restart abandoned");
        self.emit(SupervisorEvent::RestartCancelled { service: name });
        Some(if shutting_down {
            Err(StartupError::ShuttingDown { service: name })
        } else {
            Ok(())
        })
    }

    async fn restart_once(&self, name: ServiceName) -> Result<Option<u32>> {
        let policy = self.inner.settings.restart;
        self.stop_process(name).await?;
        tokio::time::sleep(policy.cooldown).await;
        // stop_all may have run during the cooldown.
        if self.is_shutting_down() {
            return Err(StartupError::ShuttingDown { service: name });
        }
        let pid = self.spawn_service(name, true).await?;

        let url = self.get_service_status(name).await.health_url;
        if wait_for_ready(&url, &policy.health).await {
            Ok(pid)
        } else {
            Err(StartupError::ServiceUnhealthy {
                service: name,
                url,
                attempts: policy.health.max_retries,
            })
        }
    }

    async fn set_state(&self, name: ServiceName, state: ServiceState, message: Option<String>) {
        let mut map = self.inner.services.lock().await;
        let Some(entry) = map.get_mut(&name) else {
            return;
        };
        // A live handle keeps its own state until it exits.
        if entry.process.is_none() {
            entry.state = state;
        }
        if message.is_some() {
            entry.message = message;
        }
    }

    pub async fn get_service_status(&self, name: ServiceName) -> ServiceStatus {
        let map = self.inner.services.lock().await;
        match map.get(&name) {
            Some(entry) => entry.status(name),
            None => ServiceEntry::new(self.inner.config.endpoint(name).clone(), 1).status(name),
        }
    }

    pub async fn get_all_statuses(&self) -> Vec<ServiceStatus> {
        let map = self.inner.services.lock().await;
        map.iter().map(|(name, entry)| entry.status(*name)).collect()
    }

    /// Captured output lines after `cursor`, across restarts, and the cursor
    /// to resume from.
    pub async fn tail_logs(&self, name: ServiceName, cursor: u64, limit: usize) -> LogTail {
        let logs = {
            let map = self.inner.services.lock().await;
            match map.get(&name) {
                Some(entry) => entry.logs.clone(),
                None => {
                    return LogTail {
                        lines: Vec::new(),
                        cursor,
                    };
                }
            }
        };
        let buf = logs.lock().await;
        buf.tail(cursor, limit)
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    rx.wait_for(|e| e.is_some()).await.ok().and_then(|r| *r)
}
