use std::process::ExitCode;

use till_desktop::bridge::{self, Bridge};
use till_desktop::config::DesktopConfig;
use till_desktop::error::format_error_chain;
use till_desktop::startup;
use till_desktop::supervisor::Supervisor;
use tracing_appender::non_blocking::WorkerGuard;

fn init_logging(cfg: &DesktopConfig) -> Option<WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = None;
    let file_layer = cfg.log_dir.as_ref().and_then(|dir| {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("till-desktop")
            .filename_suffix("log")
            .build(dir);
        match appender {
            Ok(appender) => {
                let (writer, g) = tracing_appender::non_blocking(appender);
                guard = Some(g);
                Some(fmt::layer().with_ansi(false).with_writer(writer))
            }
            Err(e) => {
                eprintln!("file logging disabled ({}): {e}", dir.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl-C"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl-C");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = DesktopConfig::from_env();
    let _log_guard = init_logging(&cfg);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        resources = %cfg.resources_dir.display(),
        dev = cfg.dev,
        packaged = cfg.packaged,
        "till-desktop starting"
    );

    let supervisor = Supervisor::new(cfg.clone());
    let report = match startup::run_startup(&supervisor, |percent, message| {
        tracing::info!(percent, "{message}");
    })
    .await
    {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), error = %format_error_chain(&e), "startup failed");
            eprintln!("{}", startup::fatal_report(&e));
            if let Err(e) = supervisor.stop_all().await {
                tracing::warn!(error = %e, "cleanup after failed startup");
            }
            return ExitCode::from(1);
        }
    };
    tracing::info!(
        url = %report.frontend_url,
        width = report.window.width,
        height = report.window.height,
        "services ready"
    );

    if cfg.bridge_port != 0 {
        let bridge = Bridge::new(supervisor.clone());
        if let Err(e) = bridge::serve(bridge, cfg.bridge_port, shutdown_signal()).await {
            tracing::error!(port = cfg.bridge_port, error = %e, "bridge stopped");
            shutdown_signal().await;
        }
    } else {
        shutdown_signal().await;
    }

    tracing::info!("shutting down services");
    match supervisor.stop_all().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format_error_chain(&e), "shutdown failed");
            ExitCode::FAILURE
        }
    }
}
