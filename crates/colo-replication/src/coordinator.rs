//! Checkpoint handshake driver (component E).
//!
//! Grounded on `include/migration/migration-colo.h` and
//! `migration/colo-failover.c`: two independent loops (one per side of the
//! pair), each driving `CheckpointChannel` through the five-step handshake
//! while racing against a failover request.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::channel::{CheckpointChannel, Tag};
use crate::driver::ReplicationDriver;
use crate::error::CoordinatorError;
use crate::failover::FailoverController;
use crate::proxy::{NicProxyAdapter, PollResult};

/// VM control surface the coordinator needs: suspend/resume vCPUs and
/// serialize/deserialize guest state. Implementations are responsible for
/// acquiring whatever coarse lock guards these operations against the rest
/// of the VM.
pub trait VmControl: Send + Sync {
    fn resume(&self);
    fn suspend(&self);
    fn force_stop(&self);
    fn reset_devices(&self);
    fn serialize(&self) -> std::io::Result<Vec<u8>>;
    fn deserialize(&self, data: &[u8]) -> std::io::Result<()>;
}

/// Edge-triggered shutdown request flag, same shape as
/// [`FailoverController`].
#[derive(Clone, Default)]
pub struct ShutdownRequest(Arc<AtomicBool>);

impl ShutdownRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a coordinator loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColoExitReason {
    FailoverRequested,
    Shutdown,
}

/// Timing parameters for the checkpoint loop: a checkpoint is never taken
/// sooner than `min_period` after the last one, and always taken by
/// `max_period` even with no signal from the comparison proxy.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointTiming {
    pub min_period: Duration,
    pub max_period: Duration,
    pub poll_interval: Duration,
}

fn log_exit(role: &str, result: &Result<ColoExitReason, CoordinatorError>) {
    match result {
        Ok(reason) => info!(role, ?reason, "colo exit"),
        Err(e) => warn!(role, error = %e, "colo exit"),
    }
}

/// Runs the primary side of the checkpoint handshake until failover is
/// requested, shutdown is requested, or a fatal error occurs.
pub fn run_primary<S: Read + Write>(
    mut channel: CheckpointChannel<S>,
    vm: Arc<dyn VmControl>,
    proxy: Arc<dyn NicProxyAdapter>,
    failover: FailoverController,
    shutdown: ShutdownRequest,
    timing: CheckpointTiming,
) -> Result<ColoExitReason, CoordinatorError> {
    let result = run_primary_inner(&mut channel, &*vm, &*proxy, &failover, &shutdown, &timing);
    log_exit("primary", &result);
    result
}

fn run_primary_inner<S: Read + Write>(
    channel: &mut CheckpointChannel<S>,
    vm: &dyn VmControl,
    proxy: &dyn NicProxyAdapter,
    failover: &FailoverController,
    shutdown: &ShutdownRequest,
    timing: &CheckpointTiming,
) -> Result<ColoExitReason, CoordinatorError> {
    channel.get_expected(Tag::Ready)?;
    vm.resume();

    let mut last_checkpoint = Instant::now();
    loop {
        if failover.is_requested() {
            return Ok(ColoExitReason::FailoverRequested);
        }

        let comparer_wants_checkpoint = match proxy.compare_poll() {
            PollResult::CheckpointNeeded => true,
            PollResult::NoChange => false,
            PollResult::Error => {
                warn!("nic proxy compare_poll reported an error; relying on max_period deadline");
                false
            }
        };
        let deadline_elapsed = last_checkpoint.elapsed() >= timing.max_period;
        if deadline_elapsed {
            warn!("max_period elapsed without a comparer-triggered checkpoint");
        }

        if !comparer_wants_checkpoint && !deadline_elapsed {
            std::thread::sleep(timing.poll_interval);
            continue;
        }

        let since_last = last_checkpoint.elapsed();
        if since_last < timing.min_period {
            std::thread::sleep(timing.min_period - since_last);
        }

        run_checkpoint_transaction_primary(channel, vm, proxy)?;
        last_checkpoint = Instant::now();
        info!("checkpoint transaction complete");

        if shutdown.is_requested() {
            channel.put(Tag::Shutdown)?;
            channel.flush()?;
            return Ok(ColoExitReason::Shutdown);
        }
    }
}

fn run_checkpoint_transaction_primary<S: Read + Write>(
    channel: &mut CheckpointChannel<S>,
    vm: &dyn VmControl,
    proxy: &dyn NicProxyAdapter,
) -> Result<(), CoordinatorError> {
    channel.put(Tag::New)?;
    channel.flush()?;
    channel.get_expected(Tag::Suspended)?;

    vm.suspend();
    let payload = vm.serialize().map_err(CoordinatorError::Serialize)?;
    info!(bytes = payload.len(), "VM state serialized for checkpoint");

    proxy.checkpoint_signal(crate::config::Mode::Primary).map_err(CoordinatorError::Proxy)?;

    channel.put(Tag::Send)?;
    channel.write_payload(&payload)?;
    channel.flush()?;
    channel.get_expected(Tag::Received)?;
    channel.get_expected(Tag::Loaded)?;
    vm.resume();
    Ok(())
}

/// Runs the secondary side of the checkpoint handshake until a `SHUTDOWN`
/// tag is received, failover is requested, or a fatal error occurs.
pub fn run_secondary<S: Read + Write>(
    mut channel: CheckpointChannel<S>,
    vm: Arc<dyn VmControl>,
    proxy: Arc<dyn NicProxyAdapter>,
    driver: Arc<ReplicationDriver>,
    failover: FailoverController,
    vmstate_loading: Arc<AtomicBool>,
) -> Result<ColoExitReason, CoordinatorError> {
    let result = run_secondary_inner(&mut channel, &*vm, &*proxy, &driver, &failover, &vmstate_loading);
    log_exit("secondary", &result);
    result
}

fn run_secondary_inner<S: Read + Write>(
    channel: &mut CheckpointChannel<S>,
    vm: &dyn VmControl,
    proxy: &dyn NicProxyAdapter,
    driver: &ReplicationDriver,
    failover: &FailoverController,
    vmstate_loading: &AtomicBool,
) -> Result<ColoExitReason, CoordinatorError> {
    let mut ram_cache: Vec<u8> = Vec::new();

    channel.put(Tag::Ready)?;
    channel.flush()?;
    vm.resume();

    loop {
        if failover.is_requested() {
            return Ok(ColoExitReason::FailoverRequested);
        }

        let tag = channel.get_tag()?;
        match tag {
            Tag::New => {
                vm.suspend();
                if failover.is_requested() {
                    return Ok(ColoExitReason::FailoverRequested);
                }

                channel.put(Tag::Suspended)?;
                channel.flush()?;
                proxy
                    .checkpoint_signal(crate::config::Mode::Secondary)
                    .map_err(CoordinatorError::Proxy)?;

                channel.get_expected(Tag::Send)?;
                channel.read_payload_into(&mut ram_cache)?;
                channel.put(Tag::Received)?;
                channel.flush()?;

                vm.reset_devices();
                vmstate_loading.store(true, Ordering::SeqCst);
                let load_result = vm.deserialize(&ram_cache);
                vmstate_loading.store(false, Ordering::SeqCst);
                load_result.map_err(CoordinatorError::Deserialize)?;

                channel.put(Tag::Loaded)?;
                channel.flush()?;
                driver.do_checkpoint()?;
                vm.resume();
                info!("checkpoint applied");
            }
            Tag::Shutdown => return Ok(ColoExitReason::Shutdown),
            other => {
                return Err(CoordinatorError::Protocol(crate::error::ProtocolError::UnexpectedTag {
                    expected: None,
                    got: other as u64,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeVm {
        state: StdMutex<Vec<u8>>,
        suspended: StdMutex<bool>,
    }

    impl VmControl for FakeVm {
        fn resume(&self) {
            *self.suspended.lock().unwrap() = false;
        }
        fn suspend(&self) {
            *self.suspended.lock().unwrap() = true;
        }
        fn force_stop(&self) {
            *self.suspended.lock().unwrap() = true;
        }
        fn reset_devices(&self) {}
        fn serialize(&self) -> std::io::Result<Vec<u8>> {
            Ok(self.state.lock().unwrap().clone())
        }
        fn deserialize(&self, data: &[u8]) -> std::io::Result<()> {
            *self.state.lock().unwrap() = data.to_vec();
            Ok(())
        }
    }

    #[test]
    fn shutdown_request_flag_round_trips() {
        let s = ShutdownRequest::new();
        assert!(!s.is_requested());
        s.request();
        assert!(s.is_requested());
    }

    /// A loopback duplex with independent read/write cursors, since a
    /// single `Cursor<Vec<u8>>` would have writes clobber not-yet-read
    /// bytes at the shared position.
    struct DuplexPipe {
        inbound: std::io::Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Read for DuplexPipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }

    impl Write for DuplexPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn secondary_deserializes_payload_sent_by_primary_transaction() {
        use crate::config::Mode;
        use crate::device::MemDisk;
        use crate::proxy::NullProxy;
        use std::io::Cursor;

        // Pre-script the inbound bytes a primary would have sent for a
        // single checkpoint transaction, then drive the secondary loop
        // over them; its own replies land in a separate outbound buffer.
        let mut inbound = Vec::new();
        {
            let mut ch = CheckpointChannel::new(Cursor::new(&mut inbound));
            ch.put(Tag::New).unwrap();
            ch.write_payload(b"vmstate-v1").unwrap();
            ch.put(Tag::Shutdown).unwrap();
        }

        let vm = Arc::new(FakeVm {
            state: StdMutex::new(Vec::new()),
            suspended: StdMutex::new(false),
        });
        let backing = Arc::new(MemDisk::new(16, 512, false));
        let config = crate::config::DriverConfig::new(Mode::Secondary, Duration::from_secs(1))
            .with_export("colo0");
        let driver = ReplicationDriver::new(backing, &config).unwrap();
        driver.start_replication(Mode::Secondary).unwrap();

        let pipe = DuplexPipe {
            inbound: Cursor::new(inbound),
            outbound: Vec::new(),
        };
        let channel = CheckpointChannel::new(pipe);
        let failover = FailoverController::new();
        let vmstate_loading = Arc::new(AtomicBool::new(false));
        let proxy: Arc<dyn NicProxyAdapter> = Arc::new(NullProxy);

        let result = run_secondary(channel, vm.clone(), proxy, driver, failover, vmstate_loading);
        assert_eq!(result.unwrap(), ColoExitReason::Shutdown);
        assert_eq!(*vm.state.lock().unwrap(), b"vmstate-v1");
    }

    #[test]
    fn unexpected_reply_to_new_is_fatal_to_the_primary_transaction() {
        use crate::proxy::NullProxy;
        use std::io::Cursor;

        // Secondary replies RECEIVED where SUSPENDED was expected.
        let mut inbound = Vec::new();
        CheckpointChannel::new(Cursor::new(&mut inbound)).put(Tag::Received).unwrap();

        let mut pipe = CheckpointChannel::new(DuplexPipe {
            inbound: Cursor::new(inbound),
            outbound: Vec::new(),
        });
        let vm = FakeVm {
            state: StdMutex::new(Vec::new()),
            suspended: StdMutex::new(false),
        };

        let err = run_checkpoint_transaction_primary(&mut pipe, &vm, &NullProxy).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Protocol(crate::error::ProtocolError::UnexpectedTag { .. })
        ));
    }
}
