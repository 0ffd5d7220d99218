//! Testing infrastructure for ralph-loop.
//!
//! - **Mocks**: a controllable [`ProcessProbe`](crate::lock::ProcessProbe)
//!   so tests can simulate competing lock holders and their deaths
//! - **Fixtures**: temporary project directories with state files,
//!   transcripts, and feature lists (test-only)
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_loop::lock::LockManager;
//! use ralph_loop::testing::MockProcessProbe;
//!
//! let probe = MockProcessProbe::alive([1001, 1002]);
//! let first = LockManager::new().with_identity(1001, None).with_probe(probe.clone());
//! let second = LockManager::new().with_identity(1002, None).with_probe(probe.clone());
//! probe.kill(1001);
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;

#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
