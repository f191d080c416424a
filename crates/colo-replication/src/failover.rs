//! Failover promotion (component F).
//!
//! Grounded on `migration/colo-failover.c`: failover is an edge-triggered
//! request flag (`failover_request_set`/`_clear`/`_is_set`) observed by a
//! running coordinator, not a direct call into it. `FailoverController`
//! models that flag with an `AtomicBool` instead of a bottom-half, since
//! this crate has no event-loop of its own for the coordinator to poll
//! from; callers are expected to check `is_requested()` at the same points
//! the coordinator loops already check for shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::config::Mode;
use crate::driver::{DeviceMode, ReplicationDriver};
use crate::error::DriverError;
use crate::proxy::NicProxyAdapter;

/// Edge-triggered failover request flag, shared between whatever observes
/// the failure condition (a lost heartbeat, an operator command) and the
/// coordinator loop that watches it.
#[derive(Clone, Default)]
pub struct FailoverController {
    requested: Arc<AtomicBool>,
}

impl FailoverController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// VM control surface failover needs on the primary side; a subset of
/// `coordinator::VmControl`.
pub trait PrimaryFailoverControl: Send + Sync {
    fn force_stop(&self);
    fn resume(&self);
}

/// Runs the secondary-side failover path: wait out any in-progress
/// VM-state load, tear down the proxy, then promote by flushing the
/// replication driver's buffer to the backing device.
pub fn run_secondary_failover(
    vmstate_loading: &AtomicBool,
    proxy: &dyn NicProxyAdapter,
    driver: &ReplicationDriver,
) -> Result<(), DriverError> {
    if driver.mode() != DeviceMode::SecondaryReplicating {
        warn!(mode = ?driver.mode(), "secondary failover entered from a non-replicating mode");
    }
    while vmstate_loading.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    if let Err(e) = proxy.failover() {
        warn!(error = %e, "nic proxy failover call failed, continuing promotion anyway");
    }
    proxy.destroy(Mode::Secondary);
    driver.stop_replication(true)
}

/// Runs the primary-side failover path: force-stop the VM, tear down the
/// proxy, then resume as a standalone (no longer replicated) VM.
pub fn run_primary_failover(vm: &dyn PrimaryFailoverControl, proxy: &dyn NicProxyAdapter) {
    vm.force_stop();
    proxy.destroy(Mode::Primary);
    vm.resume();
}
