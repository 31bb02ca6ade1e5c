use std::{process::Stdio, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{Mutex, mpsc, watch},
};

use till_service::{RunId, ServiceName};

use crate::logs::{LogBuffer, LogStream};
use crate::platform::StopSignal;

use super::launch::ServiceDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => format!("killed by signal {sig}"),
            (None, None) => "exited".to_string(),
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Handle to one live child. Owned by the supervisor's service map.
#[derive(Debug)]
pub(crate) struct RunningProcess {
    pub(crate) run_id: RunId,
    pub(crate) pid: Option<u32>,
    pub(crate) signals: mpsc::UnboundedSender<StopSignal>,
    pub(crate) exited: watch::Receiver<Option<ExitInfo>>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the desktop host dies, take the child down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn build_command(def: &ServiceDefinition) -> Command {
    let launch = &def.launch;
    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args)
        .current_dir(&launch.cwd)
        .envs(&launch.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session so signals reach the whole tree (npm -> node).
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

pub(crate) fn forward_output<R>(
    service: ServiceName,
    run_id: RunId,
    stream: LogStream,
    reader: R,
    logs: Arc<Mutex<LogBuffer>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(
                target: "till_desktop::child",
                service = %service,
                stream = stream.as_str(),
                "{line}"
            );
            logs.lock().await.push(&run_id, stream, line);
        }
    });
}

#[cfg(unix)]
fn deliver_signal(child: &mut Child, pgid: Option<u32>, signal: StopSignal) {
    let signo = match signal {
        StopSignal::Graceful => libc::SIGTERM,
        StopSignal::Forceful => libc::SIGKILL,
    };
    match pgid {
        Some(pgid) => unsafe {
            libc::kill(-(pgid as i32), signo);
        },
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut Child, _pgid: Option<u32>, _signal: StopSignal) {
    let _ = child.start_kill();
}

/// Waits for the child while relaying stop signals to it. Resolves with the
/// exit information once the OS reports the child gone.
pub(crate) async fn watch_child(
    mut child: Child,
    pid: Option<u32>,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
) -> ExitInfo {
    let mut signals_open = true;
    loop {
        tokio::select! {
            res = child.wait() => {
                return match res {
                    Ok(status) => ExitInfo::from_status(status),
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "wait on child failed");
                        ExitInfo { code: None, signal: None }
                    }
                };
            }
            sig = signals.recv(), if signals_open => {
                match sig {
                    Some(sig) => deliver_signal(&mut child, pid, sig),
                    None => signals_open = false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_prefers_exit_code() {
        let e = ExitInfo {
            code: Some(1),
            signal: None,
        };
        assert!(!e.success());
        assert_eq!(e.describe(), "exited with code 1");

        let e = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert!(!e.success());
        assert_eq!(e.describe(), "killed by signal 9");
    }
}
