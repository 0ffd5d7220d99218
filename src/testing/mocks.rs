//! Mock implementations of testing seams.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::lock::ProcessProbe;

/// Process probe backed by an explicit set of live PIDs.
///
/// Clones share the same set, so a test can keep one handle and kill or
/// spawn processes while lock managers hold the others.
///
/// # Example
///
/// ```
/// use ralph_loop::lock::ProcessProbe;
/// use ralph_loop::testing::MockProcessProbe;
///
/// let probe = MockProcessProbe::alive([42]);
/// assert!(probe.is_alive(42));
/// probe.kill(42);
/// assert!(!probe.is_alive(42));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockProcessProbe {
    alive: Arc<Mutex<HashSet<u32>>>,
}

impl MockProcessProbe {
    /// Probe that reports exactly `pids` as alive.
    #[must_use]
    pub fn alive(pids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            alive: Arc::new(Mutex::new(pids.into_iter().collect())),
        }
    }

    pub fn spawn(&self, pid: u32) {
        self.pids().insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        self.pids().remove(&pid);
    }

    fn pids(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.alive.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessProbe for MockProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.pids().contains(&pid)
    }
}
