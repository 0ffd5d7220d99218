//! Feature-list completion oracle.
//!
//! The feature list is an external JSON array maintained by the agent (or a
//! human) while the loop runs:
//!
//! ```json
//! [
//!   {"description": "login form", "passes": true},
//!   {"description": "password reset", "passes": false}
//! ]
//! ```
//!
//! The loop only cares about how many entries exist and how many pass.

use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{RalphError, Result};
use crate::lock::{AcquireOptions, LockManager};

/// One entry of the feature list. Other fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureRecord {
    #[serde(default)]
    pub passes: Option<bool>,
}

/// Passing vs. total feature counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureProgress {
    pub total: usize,
    pub passing: usize,
}

impl FeatureProgress {
    #[must_use]
    pub fn from_records(records: &[FeatureRecord]) -> Self {
        Self {
            total: records.len(),
            passing: records.iter().filter(|r| r.passes == Some(true)).count(),
        }
    }

    /// An empty list is never complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.passing == self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.passing)
    }
}

impl std::fmt::Display for FeatureProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} features passing", self.passing, self.total)
    }
}

/// Count features in the JSON text of a feature list.
pub fn parse_feature_list(text: &str) -> Result<FeatureProgress> {
    let records: Vec<FeatureRecord> = serde_json::from_str(text)?;
    Ok(FeatureProgress::from_records(&records))
}

async fn read_text(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads feature lists under the advisory lock protocol.
#[derive(Debug, Clone)]
pub struct FeatureOracle {
    locks: LockManager,
    timeout: Duration,
}

impl FeatureOracle {
    #[must_use]
    pub fn new(locks: LockManager, timeout: Duration) -> Self {
        Self { locks, timeout }
    }

    /// Progress of the feature list at `path`, or `None` if it does not
    /// exist.
    ///
    /// The file is read while holding its lock so a concurrent writer is
    /// never observed mid-update. If the lock cannot be acquired in time the
    /// file is read anyway.
    pub async fn progress(&self, path: &Path) -> Result<Option<FeatureProgress>> {
        if !path.exists() {
            return Ok(None);
        }

        let opts = AcquireOptions::default().with_timeout(self.timeout);
        let text = match self.locks.with_lock(path, &opts, || read_text(path)).await {
            Err(RalphError::LockTimeout { holder_pid, .. }) => {
                warn!(
                    ?holder_pid,
                    "Feature list {} is locked, reading without lock",
                    path.display()
                );
                read_text(path).await?
            }
            other => other?,
        };

        text.map(|t| parse_feature_list(&t)).transpose()
    }
}
