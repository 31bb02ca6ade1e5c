use std::sync::Arc;

use crate::config::WindowSize;
use crate::error::{Result, StartupError, format_error_chain};
use crate::runtime::ResolvedInterpreter;
use crate::supervisor::Supervisor;

/// What the window shell needs once both services answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub interpreter: ResolvedInterpreter,
    pub frontend_url: String,
    pub window: WindowSize,
}

/// Resolve the interpreter, start both services and wait for them, all under
/// the configured wall-clock limit.
///
/// The sequence runs on its own task. When the limit wins, the task is left
/// running and only the returned future settles with `StartupTimeout`.
pub async fn run_startup<P>(supervisor: &Supervisor, progress: P) -> Result<StartupReport>
where
    P: Fn(u8, &str) + Send + Sync + 'static,
{
    let limit = supervisor.config().startup_timeout;
    let sup = supervisor.clone();
    let progress = Arc::new(progress);
    let task = tokio::spawn(async move { startup_sequence(&sup, &*progress).await });

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(anyhow::anyhow!("startup task failed: {join}").into()),
        Err(_) => {
            tracing::error!(timeout_ms = limit.as_millis() as u64, "startup timed out");
            Err(StartupError::StartupTimeout {
                seconds: limit.as_secs(),
            })
        }
    }
}

async fn startup_sequence(
    sup: &Supervisor,
    progress: &(dyn Fn(u8, &str) + Send + Sync),
) -> Result<StartupReport> {
    progress(5, "Locating Python runtime");
    let interpreter = sup.initialize().await?;
    progress(30, &format!("Backend runtime ready ({:?})", interpreter.source));

    sup.start_all_reporting(progress).await?;

    let cfg = sup.config();
    let report = StartupReport {
        interpreter,
        frontend_url: cfg.frontend.url(),
        window: cfg.window,
    };
    progress(
        100,
        &format!(
            "Loading {} ({}x{})",
            report.frontend_url, report.window.width, report.window.height
        ),
    );
    Ok(report)
}

/// The single user-facing failure text: message, then numbered remediation.
pub fn fatal_report(err: &StartupError) -> String {
    let mut out = format!("Till could not start.\n\n{}\n", format_error_chain(err));
    let steps = err.remediation();
    if !steps.is_empty() {
        out.push_str("\nTry the following:\n");
        for (i, step) in steps.iter().enumerate() {
            out.push_str(&format!("  {}. {step}\n", i + 1));
        }
    }
    out
}
