//! Kernel packet-comparison proxy adapter (component G).
//!
//! Mirrors `net/colo-nic.c`'s four-operation surface
//! (`colo_proxy_init`/`colo_proxy_destroy`/`colo_proxy_checkpoint`/
//! `colo_proxy_failover`) plus the poll entry point
//! (`colo_proxy_compare`), narrowed to a trait so this crate can carry a
//! pure in-memory double for tests without touching a real kernel module.

use std::io;

use crate::config::Mode;

/// Outcome of one `compare_poll` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Nothing notable happened.
    NoChange,
    /// The comparer detected a divergence; a checkpoint should be taken.
    CheckpointNeeded,
    /// The comparer itself failed (e.g. the kernel module went away). Not
    /// fatal to the coordinator by itself: the checkpoint loop falls back
    /// to its `max_period` deadline and logs the condition.
    Error,
}

/// Narrow interface onto the external packet-comparison proxy.
pub trait NicProxyAdapter: Send + Sync {
    fn init(&self, mode: Mode) -> io::Result<()>;
    fn destroy(&self, mode: Mode);
    fn checkpoint_signal(&self, mode: Mode) -> io::Result<()>;
    fn failover(&self) -> io::Result<()>;
    fn compare_poll(&self) -> PollResult;
}

/// In-memory proxy double: always idle, every call succeeds. Used by tests
/// and by embedders that run COLO without the kernel comparison module.
#[derive(Debug, Default)]
pub struct NullProxy;

impl NicProxyAdapter for NullProxy {
    fn init(&self, _mode: Mode) -> io::Result<()> {
        Ok(())
    }

    fn destroy(&self, _mode: Mode) {}

    fn checkpoint_signal(&self, _mode: Mode) -> io::Result<()> {
        Ok(())
    }

    fn failover(&self) -> io::Result<()> {
        Ok(())
    }

    fn compare_poll(&self) -> PollResult {
        PollResult::NoChange
    }
}
