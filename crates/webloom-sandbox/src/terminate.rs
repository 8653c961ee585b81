use std::time::Duration;

use tokio::time::sleep;

use webloom_types::StopOutcome;

const SETTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Stop a sandbox server by pid: graceful signal first, then a forceful
/// kill if the process survives the settling interval. Double termination
/// is idempotent from the caller's view — an already-gone pid reports
/// `NotFound` and the caller clears `server_pid` either way.
pub async fn stop_server(pid: u32) -> StopOutcome {
    stop_server_with_settle(pid, SETTLE_INTERVAL).await
}

#[cfg(unix)]
pub async fn stop_server_with_settle(pid: u32, settle: Duration) -> StopOutcome {
    if let Err(errno) = send_signal(pid, libc::SIGTERM) {
        if errno == libc::ESRCH {
            tracing::warn!(pid, "process not found");
            return StopOutcome::NotFound;
        }
        let message = std::io::Error::from_raw_os_error(errno).to_string();
        tracing::error!(pid, %message, "error stopping server process");
        return StopOutcome::Failed { message };
    }

    sleep(settle).await;

    // Zero-effect probe: still alive means the graceful signal was ignored.
    if send_signal(pid, 0).is_ok() {
        if let Err(errno) = send_signal(pid, libc::SIGKILL) {
            if errno != libc::ESRCH {
                let message = std::io::Error::from_raw_os_error(errno).to_string();
                tracing::error!(pid, %message, "error force killing server process");
                return StopOutcome::Failed { message };
            }
        } else {
            tracing::warn!(pid, "force killed server process");
        }
    }

    tracing::info!(pid, "server process stopped");
    StopOutcome::Stopped
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<(), i32> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

#[cfg(not(unix))]
pub async fn stop_server_with_settle(pid: u32, _settle: Duration) -> StopOutcome {
    tracing::error!(pid, "signal-based termination is unsupported on this platform");
    StopOutcome::Failed {
        message: "signal-based termination is unsupported on this platform".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn live_process_is_stopped_and_second_stop_reports_not_found() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        let outcome = stop_server_with_settle(pid, Duration::from_millis(50)).await;
        assert_eq!(outcome, StopOutcome::Stopped);

        // Reap so the pid leaves the process table before the second attempt.
        let _ = child.wait();

        let outcome = stop_server_with_settle(pid, Duration::from_millis(10)).await;
        assert_eq!(outcome, StopOutcome::NotFound);
    }

    #[tokio::test]
    async fn sigterm_immune_process_falls_back_to_sigkill() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .expect("spawn trap");
        let pid = child.id();

        // Give the shell a moment to install the trap.
        sleep(Duration::from_millis(100)).await;

        let outcome = stop_server_with_settle(pid, Duration::from_millis(200)).await;
        assert_eq!(outcome, StopOutcome::Stopped);

        let status = child.wait().expect("wait");
        assert!(!status.success());
    }
}
