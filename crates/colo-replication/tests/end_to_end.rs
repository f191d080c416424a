//! End-to-end scenarios spanning multiple modules: a live checkpoint
//! handshake between a primary and secondary coordinator over a real
//! socket pair, with a replication driver on the secondary side staging
//! and then committing writes across checkpoints.

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colo_replication::{
    BlockDevice, CheckpointChannel, CheckpointTiming, ColoExitReason, DriverConfig,
    FailoverController, MemDisk, Mode, NullProxy, ReplicationDriver, ShutdownRequest, VmControl,
};

struct CountingVm {
    counter: Mutex<u64>,
}

impl CountingVm {
    fn new() -> Self {
        Self { counter: Mutex::new(0) }
    }
}

impl VmControl for CountingVm {
    fn resume(&self) {}
    fn suspend(&self) {}
    fn force_stop(&self) {}
    fn reset_devices(&self) {}

    fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut c = self.counter.lock().unwrap();
        *c += 1;
        Ok(c.to_be_bytes().to_vec())
    }

    fn deserialize(&self, data: &[u8]) -> io::Result<()> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "expected 8-byte vmstate counter")
        })?;
        *self.counter.lock().unwrap() = u64::from_be_bytes(bytes);
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn primary_and_secondary_checkpoint_and_then_shut_down_together() {
    init_tracing();
    let (primary_sock, secondary_sock) = UnixStream::pair().unwrap();

    let primary_vm = Arc::new(CountingVm::new());
    let secondary_vm = Arc::new(CountingVm::new());

    let failover = FailoverController::new();
    let shutdown = ShutdownRequest::new();

    let backing = Arc::new(MemDisk::new(16, 512, false));
    let config = DriverConfig::new(Mode::Secondary, Duration::from_millis(30)).with_export("colo0");
    let driver = ReplicationDriver::new(backing.clone(), &config).unwrap();
    driver.start_replication(Mode::Secondary).unwrap();

    let timing = CheckpointTiming {
        min_period: Duration::from_millis(5),
        max_period: Duration::from_millis(20),
        poll_interval: Duration::from_millis(2),
    };

    let primary_channel = CheckpointChannel::new(primary_sock);
    let primary_failover = failover.clone();
    let primary_shutdown = shutdown.clone();
    let primary_vm_handle = primary_vm.clone();
    let primary_thread = std::thread::spawn(move || {
        colo_replication::coordinator::run_primary(
            primary_channel,
            primary_vm_handle,
            Arc::new(NullProxy),
            primary_failover,
            primary_shutdown,
            timing,
        )
    });

    let secondary_channel = CheckpointChannel::new(secondary_sock);
    let secondary_failover = failover.clone();
    let secondary_vm_handle = secondary_vm.clone();
    let vmstate_loading = Arc::new(AtomicBool::new(false));
    let driver_handle = driver.clone();
    let secondary_thread = std::thread::spawn(move || {
        colo_replication::coordinator::run_secondary(
            secondary_channel,
            secondary_vm_handle,
            Arc::new(NullProxy),
            driver_handle,
            secondary_failover,
            vmstate_loading,
        )
    });

    // Let a few checkpoint transactions run on the `max_period` deadline.
    std::thread::sleep(Duration::from_millis(120));
    shutdown.request();

    let primary_result = primary_thread.join().unwrap();
    let secondary_result = secondary_thread.join().unwrap();

    assert_eq!(primary_result.unwrap(), ColoExitReason::Shutdown);
    assert_eq!(secondary_result.unwrap(), ColoExitReason::Shutdown);

    // Every checkpoint replaced the secondary's counter with the primary's,
    // so after at least one round trip they agree and neither is zero.
    let primary_count = *primary_vm.counter.lock().unwrap();
    let secondary_count = *secondary_vm.counter.lock().unwrap();
    assert!(primary_count >= 1);
    assert_eq!(primary_count, secondary_count);
}

#[test]
fn failover_promotes_secondary_by_flushing_buffered_writes() {
    let backing = Arc::new(MemDisk::new(16, 512, false));
    let config = DriverConfig::new(Mode::Secondary, Duration::from_secs(1)).with_export("colo0");
    let driver = ReplicationDriver::new(backing.clone(), &config).unwrap();
    driver.start_replication(Mode::Secondary).unwrap();

    driver.write(0, 2, &vec![7u8; 2 * 512]).unwrap();

    let mut backing_before = vec![0u8; 2 * 512];
    backing.read(0, 2, &mut backing_before).unwrap();
    assert!(backing_before.iter().all(|&x| x == 0), "write must stay staged, not hit backing yet");

    let vmstate_loading = AtomicBool::new(false);
    colo_replication::failover::run_secondary_failover(&vmstate_loading, &NullProxy, &driver).unwrap();

    assert_eq!(driver.mode(), colo_replication::DeviceMode::FailoverDone);
    let mut backing_after = vec![0u8; 2 * 512];
    backing.read(0, 2, &mut backing_after).unwrap();
    assert!(backing_after.iter().all(|&x| x == 7), "failover must flush staged writes to backing");
}
