//! Platform process-tree termination primitives.
//!
//! Grounded on the distilled source's `ProcessManager`: graceful stop sends
//! a polite signal and escalates on timeout; forceful stop walks the
//! process's descendants and kills leaves before the root, falling back to
//! an OS-native tree-kill command if the primitive walk fails. Both paths
//! must be idempotent — killing an already-dead pid is not an error.

use std::time::Duration;

#[cfg(unix)]
pub async fn terminate_gracefully(pid: u32, timeout: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if is_alive(pid) {
        kill_tree(pid);
    }
}

#[cfg(windows)]
pub async fn terminate_gracefully(pid: u32, _timeout: Duration) {
    // Windows has no portable equivalent of SIGTERM for an arbitrary child;
    // graceful and forceful stop collapse to the same tree-kill.
    kill_tree(pid);
}

#[cfg(unix)]
pub fn kill_tree(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    for child_pid in descendants(pid) {
        let _ = kill(Pid::from_raw(child_pid as i32), Signal::SIGKILL);
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);

    if is_alive(pid) {
        // Primitive tree-walk failed to fully clear the tree; fall back to
        // killing the whole process group the child was spawned into.
        let _ = std::process::Command::new("kill")
            .arg("-9")
            .arg(format!("-{pid}"))
            .status();
    }
}

#[cfg(windows)]
pub fn kill_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .status();
}

#[cfg(unix)]
fn descendants(pid: u32) -> Vec<u32> {
    let mut result = Vec::new();
    let mut frontier = vec![pid];
    while let Some(current) = frontier.pop() {
        let children_path = format!("/proc/{current}/task/{current}/children");
        let Ok(text) = std::fs::read_to_string(&children_path) else { continue };
        for token in text.split_whitespace() {
            if let Ok(child) = token.parse::<u32>() {
                result.push(child);
                frontier.push(child);
            }
        }
    }
    result
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}")])
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()),
        Err(_) => false,
    }
}
