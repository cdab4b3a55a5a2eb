//! Process helpers: liveness checks for stale-route cleanup and stopping the
//! command supervised by `hostgate run`

use std::time::Duration;
use tokio::process::Child;
use tracing::{info, warn};

/// Check whether a process with the given id exists on this machine.
///
/// Uses `kill(pid, 0)`, which performs permission and existence checks without
/// delivering a signal. `EPERM` means the process exists but belongs to another
/// user, so it counts as alive; only `ESRCH` counts as dead.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // pid 0 and negative values address process groups, not a single process
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }

    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Without a portable existence check every route is kept.
#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Id of the process that started this one, e.g. the shell running a CLI command
#[cfg(unix)]
pub fn parent_pid() -> u32 {
    let ppid = unsafe { libc::getppid() };
    u32::try_from(ppid).unwrap_or(0)
}

/// Without a parent lookup the caller's own id is the best available owner.
#[cfg(not(unix))]
pub fn parent_pid() -> u32 {
    std::process::id()
}

/// Ask a child to exit with SIGTERM, then SIGKILL it after `grace_period`
pub async fn stop_child(child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to child");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "Child exited");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for child to exit");
        }
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}
