//! Process signalling utilities for the launched container process.

/// Send `signal` to a process.
///
/// # Returns
/// * `true` - Signal was delivered
/// * `false` - Process does not exist, permission denied, or `pid` would
///   address a process group (0, or above `i32::MAX`)
pub fn signal_process(pid: u32, signal: i32) -> bool {
    match i32::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, signal) == 0 },
        _ => false,
    }
}

/// Kill a process with SIGKILL.
///
/// # Returns
/// * `true` - Process was killed or doesn't exist
/// * `false` - Failed to kill (permission denied)
pub fn kill_process(pid: u32) -> bool {
    signal_process(pid, libc::SIGKILL) || !is_process_alive(pid)
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    signal_process(pid, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        let current_pid = std::process::id();
        assert!(is_process_alive(current_pid));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        // u32::MAX becomes -1 when cast to i32, which has special meaning in kill()
        assert!(!is_process_alive(999999999));
        assert!(!is_process_alive(888888888));
    }

    #[test]
    fn test_group_pids_are_never_signalled() {
        assert!(!signal_process(0, 0));
        assert!(!signal_process(u32::MAX, 0));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_kill_exited_child() {
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(kill_process(pid));
    }

    #[test]
    fn test_kill_running_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(kill_process(pid));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
