//! Process liveness probing.
//!
//! Everything OS-specific about "is the holder of this lock still running"
//! lives here so the lock manager itself stays platform neutral.

/// Answers whether a process recorded in a lock file still exists.
pub trait ProcessProbe: Send + Sync + std::fmt::Debug {
    /// Returns `true` if `pid` refers to a live process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

/// Check whether a given PID is alive.
///
/// Sends signal 0, which checks for existence without delivering anything.
/// PID 0 and values outside the platform's `pid_t` range are never alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Check whether a given PID is alive.
///
/// There is no cheap probe here, so every non-zero PID counts as alive and
/// locks are never reclaimed on a guess.
#[cfg(not(unix))]
pub fn is_pid_alive(pid: u32) -> bool {
    pid != 0
}

/// Hostname recorded in lock files, used to tell whether a holder PID is
/// ours to evaluate.
#[cfg(unix)]
pub fn current_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

/// Hostname recorded in lock files, used to tell whether a holder PID is
/// ours to evaluate.
#[cfg(not(unix))]
pub fn current_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.is_empty())
}
