//! Per-device replication state machine (component C).
//!
//! Writes and reads route differently depending on `DeviceMode`; the COW
//! interception flow runs in front of any secondary-local write while
//! replicating.

use std::io;
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, warn};

use crate::buffer::DiskBuffer;
use crate::config::{DriverConfig, Mode};
use crate::cow::CowEngine;
use crate::device::BlockDevice;
use crate::error::{BackingIoError, DriverError};
use crate::sector::{sectors_to_clusters, SectorCount, SectorIndex};

/// Replication mode of one backing device. `PrimaryReplicating` is kept
/// distinct from `Unprotected` for the coordinator's bookkeeping even
/// though the two are routed identically here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Unprotected,
    PrimaryReplicating,
    SecondaryReplicating,
    FailoverDone,
}

struct DriverState {
    mode: DeviceMode,
    buffer: DiskBuffer,
    error_latched: bool,
}

/// Drives one backing device through the COLO replication lifecycle:
/// staging forwarded primary writes, overlaying them on reads, intercepting
/// SVM-local writes for COW capture, and flushing on checkpoint/failover.
pub struct ReplicationDriver {
    backing: Arc<dyn BlockDevice>,
    cow: CowEngine,
    state: Mutex<DriverState>,
    cluster_sectors: u32,
    sector_size: u32,
    self_ref: Weak<ReplicationDriver>,
}

impl ReplicationDriver {
    /// Returns an `Arc` rather than a bare `Self`: `start_replication` needs
    /// to hand the backing device a hook closure that calls back into this
    /// driver, so the driver has to know its own `Arc` handle up front.
    pub fn new(backing: Arc<dyn BlockDevice>, config: &DriverConfig) -> Result<Arc<Self>, DriverError> {
        config.validate()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            backing,
            cow: CowEngine::new(),
            state: Mutex::new(DriverState {
                mode: DeviceMode::Unprotected,
                buffer: DiskBuffer::new(config.sector_size),
                error_latched: false,
            }),
            cluster_sectors: config.cluster_sectors,
            sector_size: config.sector_size,
            self_ref: self_ref.clone(),
        }))
    }

    pub fn mode(&self) -> DeviceMode {
        self.state.lock().unwrap().mode
    }

    fn latch_error(&self) {
        let mut state = self.state.lock().unwrap();
        state.error_latched = true;
        error!("COW capture failed; error latch set, next checkpoint will be refused");
    }

    /// Transitions `Unprotected -> SecondaryReplicating`, matching
    /// `switch_mode`'s only non-trivial direction. Fails if the backing
    /// device is read-only, mirroring `blk_is_read_only` in
    /// `blkcolo_start_replication`.
    pub fn start_replication(&self, mode: Mode) -> Result<(), DriverError> {
        if mode != Mode::Secondary {
            return Err(DriverError::ModeTransition(
                "only secondary-mode start_replication is implemented by this driver",
            ));
        }
        if self.backing.is_read_only() {
            warn!("refusing to start replication on a read-only backing device");
            return Err(DriverError::ReadOnly);
        }
        let mut state = self.state.lock().unwrap();
        if state.mode != DeviceMode::Unprotected {
            return Err(DriverError::ModeTransition(
                "start_replication is only valid from Unprotected",
            ));
        }
        state.mode = DeviceMode::SecondaryReplicating;
        state.error_latched = false;
        state.buffer.clear();
        drop(state);

        let self_ref = self.self_ref.clone();
        self.backing.register_before_write_hook(Box::new(move |start, n| {
            match self_ref.upgrade() {
                Some(driver) => driver
                    .before_local_write(start, n)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())),
                None => Ok(()),
            }
        }));
        Ok(())
    }

    /// Acknowledges a completed checkpoint: clears the staging buffer, or
    /// refuses if a prior COW capture failed and latched an error.
    pub fn do_checkpoint(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.mode != DeviceMode::SecondaryReplicating {
            return Err(DriverError::ModeTransition(
                "do_checkpoint is only valid while SecondaryReplicating",
            ));
        }
        if state.error_latched {
            return Err(DriverError::Latched);
        }
        state.buffer.clear();
        Ok(())
    }

    /// Stops replication, flushing any staged writes to the backing device.
    /// `failover` selects the destination mode: `Unprotected` for a
    /// graceful stop, `FailoverDone` for promotion.
    pub fn stop_replication(&self, failover: bool) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.mode != DeviceMode::SecondaryReplicating {
            return Err(DriverError::ModeTransition(
                "stop_replication is only valid while SecondaryReplicating",
            ));
        }
        state.buffer.flush_and_clear(self.backing.as_ref())?;
        state.mode = if failover {
            DeviceMode::FailoverDone
        } else {
            DeviceMode::Unprotected
        };
        self.backing.unregister_before_write_hook();
        Ok(())
    }

    /// Read path. While `SecondaryReplicating`, staged writes are overlaid
    /// on top of whatever the backing device returns; every other mode
    /// passes straight through.
    pub fn read(&self, start: SectorIndex, n: SectorCount, iov: &mut [u8]) -> Result<(), DriverError> {
        let mode = self.mode();
        self.backing.read(start, n, iov).map_err(BackingIoError)?;
        if mode == DeviceMode::SecondaryReplicating {
            let state = self.state.lock().unwrap();
            state.buffer.read(iov, start, n);
        }
        Ok(())
    }

    /// Write path for forwarded primary writes. While
    /// `SecondaryReplicating`, writes are staged in the buffer instead of
    /// touching the backing device, always with `overwrite = true` (the
    /// primary's view wins even over an existing COW pre-image). Every
    /// other mode passes straight through.
    pub fn write(&self, start: SectorIndex, n: SectorCount, iov: &[u8]) -> Result<(), DriverError> {
        match self.mode() {
            DeviceMode::SecondaryReplicating => {
                let mut state = self.state.lock().unwrap();
                state.buffer.write(iov, start, n, true)?;
                Ok(())
            }
            _ => {
                self.backing.write(start, n, iov).map_err(BackingIoError)?;
                Ok(())
            }
        }
    }

    /// COW interception, invoked before a secondary-local guest write
    /// reaches the backing device. A no-op unless `SecondaryReplicating`.
    pub fn before_local_write(&self, start: SectorIndex, n: SectorCount) -> Result<(), DriverError> {
        if self.mode() != DeviceMode::SecondaryReplicating {
            return Ok(());
        }
        let clusters = sectors_to_clusters(start, n, self.cluster_sectors);
        let _guard = self.cow.guard(clusters);

        for k in clusters.start..clusters.end {
            let cluster_start = k * self.cluster_sectors as u64;
            let needs_capture = {
                let state = self.state.lock().unwrap();
                state.buffer.has_empty_range(cluster_start, self.cluster_sectors)
            };
            if !needs_capture {
                continue;
            }
            let mut bounce = vec![0u8; self.cluster_sectors as usize * self.sector_size as usize];
            if let Err(e) = self.backing.read(cluster_start, self.cluster_sectors, &mut bounce) {
                self.latch_error();
                return Err(DriverError::BackingIo(e.into()));
            }
            let mut state = self.state.lock().unwrap();
            if let Err(e) = state.buffer.write(&bounce, cluster_start, self.cluster_sectors, false) {
                drop(state);
                self.latch_error();
                return Err(DriverError::Buffer(e));
            }
        }
        Ok(())
    }
}
