//! Backing block device contract and an in-memory reference implementation
//! used by tests and embedders without a real virtio stack.
//!
//! A narrow synchronous read/write/discard surface plus a size and a
//! read-only flag, deliberately without any virtio queue or feature
//! negotiation machinery — this crate sits one layer below that.

use std::io;
use std::sync::Mutex;

use crate::sector::{SectorCount, SectorIndex};

/// Signature of the notifier the driver registers with the backing device
/// to intercept secondary-local writes before they land.
pub type BeforeWriteHook = Box<dyn Fn(SectorIndex, SectorCount) -> io::Result<()> + Send + Sync>;

/// The backing store a `ReplicationDriver` stages writes onto and reads
/// through. Implementations are expected to be cheaply `Arc`-shared and
/// safe to call from a single worker thread.
pub trait BlockDevice: Send + Sync {
    fn read(&self, start: SectorIndex, n: SectorCount, iov: &mut [u8]) -> io::Result<()>;
    fn write(&self, start: SectorIndex, n: SectorCount, iov: &[u8]) -> io::Result<()>;
    fn discard(&self, start: SectorIndex, n: SectorCount) -> io::Result<()>;
    fn length_sectors(&self) -> SectorIndex;
    fn is_read_only(&self) -> bool;

    /// Registers the hook the driver calls before an SVM-local write is
    /// allowed to proceed. At most one hook may be registered at a time;
    /// registering a new one replaces the old.
    fn register_before_write_hook(&self, hook: BeforeWriteHook);
    fn unregister_before_write_hook(&self);
}

/// Plain in-memory block device, useful as a backing store in tests and as
/// the reference implementation the examples build on.
pub struct MemDisk {
    sector_size: u32,
    read_only: bool,
    data: Mutex<Vec<u8>>,
    hook: Mutex<Option<BeforeWriteHook>>,
}

impl MemDisk {
    pub fn new(n_sectors: u64, sector_size: u32, read_only: bool) -> Self {
        Self {
            sector_size,
            read_only,
            data: Mutex::new(vec![0u8; n_sectors as usize * sector_size as usize]),
            hook: Mutex::new(None),
        }
    }

    fn bounds(&self, start: SectorIndex, n: SectorCount) -> (usize, usize) {
        let sector_size = self.sector_size as u64;
        let off = (start * sector_size) as usize;
        let len = (n as u64 * sector_size) as usize;
        (off, len)
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, start: SectorIndex, n: SectorCount, iov: &mut [u8]) -> io::Result<()> {
        let (off, len) = self.bounds(start, n);
        let data = self.data.lock().unwrap();
        if off + len > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of device"));
        }
        iov[..len].copy_from_slice(&data[off..off + len]);
        Ok(())
    }

    fn write(&self, start: SectorIndex, n: SectorCount, iov: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "device is read-only"));
        }
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(start, n)?;
        }
        let (off, len) = self.bounds(start, n);
        let mut data = self.data.lock().unwrap();
        if off + len > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "write past end of device"));
        }
        data[off..off + len].copy_from_slice(&iov[..len]);
        Ok(())
    }

    fn discard(&self, start: SectorIndex, n: SectorCount) -> io::Result<()> {
        let (off, len) = self.bounds(start, n);
        let mut data = self.data.lock().unwrap();
        data[off..off + len].fill(0);
        Ok(())
    }

    fn length_sectors(&self) -> SectorIndex {
        self.data.lock().unwrap().len() as u64 / self.sector_size as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn register_before_write_hook(&self, hook: BeforeWriteHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    fn unregister_before_write_hook(&self) {
        *self.hook.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let d = MemDisk::new(8, 512, false);
        d.write(0, 1, &vec![7u8; 512]).unwrap();
        let mut out = vec![0u8; 512];
        d.read(0, 1, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 7));
    }

    #[test]
    fn write_rejected_when_read_only() {
        let d = MemDisk::new(8, 512, true);
        assert!(d.write(0, 1, &vec![1u8; 512]).is_err());
    }

    #[test]
    fn before_write_hook_runs_before_write_lands() {
        let d = MemDisk::new(8, 512, false);
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        d.register_before_write_hook(Box::new(move |start, n| {
            seen2.lock().unwrap().push((start, n));
            Ok(())
        }));
        d.write(3, 1, &vec![1u8; 512]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(3, 1)]);
    }
}
