//! Checkpoint handshake wire protocol (component D).
//!
//! A framed, big-endian, 8-byte-tag protocol: every command is a `u64` tag,
//! and the `SEND` command is followed by a `u64` length prefix and that
//! many bytes of opaque VM-state payload. Commands are fixed-layout values
//! read in a defined byte order over a plain duplex stream.

use std::io::{Read, Write};

use tracing::debug;

use crate::error::ProtocolError;

/// One handshake command. Values are QEMU-COLO-legacy compatible: `Ready`
/// keeps the historical `0x46` wire value, the rest are allocated in
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Tag {
    Ready = 0x46,
    New = 0x47,
    Suspended = 0x48,
    Send = 0x49,
    Received = 0x4a,
    Loaded = 0x4b,
    Shutdown = 0x4c,
}

impl Tag {
    fn from_u64(v: u64) -> Result<Self, ProtocolError> {
        Ok(match v {
            0x46 => Tag::Ready,
            0x47 => Tag::New,
            0x48 => Tag::Suspended,
            0x49 => Tag::Send,
            0x4a => Tag::Received,
            0x4b => Tag::Loaded,
            0x4c => Tag::Shutdown,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

/// A framed duplex stream carrying the checkpoint handshake between a
/// primary and secondary `CheckpointCoordinator`.
pub struct CheckpointChannel<S> {
    stream: S,
}

impl<S: Read + Write> CheckpointChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn put(&mut self, tag: Tag) -> Result<(), ProtocolError> {
        debug!(?tag, "checkpoint channel: put tag");
        self.put_u64(tag as u64)
    }

    pub fn put_u64(&mut self, n: u64) -> Result<(), ProtocolError> {
        self.stream.write_all(&n.to_be_bytes())?;
        Ok(())
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads the next tag without checking it against an expectation.
    pub fn get_tag(&mut self) -> Result<Tag, ProtocolError> {
        let v = self.get_u64()?;
        let tag = Tag::from_u64(v)?;
        debug!(?tag, "checkpoint channel: got tag");
        Ok(tag)
    }

    /// Reads the next tag and fails if it isn't `expected`.
    pub fn get_expected(&mut self, expected: Tag) -> Result<(), ProtocolError> {
        let got = self.get_u64()?;
        if got != expected as u64 {
            return Err(ProtocolError::UnexpectedTag {
                expected: Some(expected as u64),
                got,
            });
        }
        debug!(tag = ?expected, "checkpoint channel: got expected tag");
        Ok(())
    }

    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), ProtocolError> {
        self.stream.read_exact(dst).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::ShortRead {
                    expected: dst.len(),
                    got: 0,
                }
            } else {
                ProtocolError::Io(e)
            }
        })
    }

    /// Writes a `u64` length prefix followed by `payload`.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.put_u64(payload.len() as u64)?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    /// Reads a `u64` length prefix followed by that many bytes into `cache`,
    /// resizing it as needed. Reuses `cache`'s allocation across calls,
    /// mirroring the original's RAM cache staging buffer.
    pub fn read_payload_into(&mut self, cache: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let len = self.get_u64()? as usize;
        cache.resize(len, 0);
        self.read_exact(cache)
    }

    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        self.stream.flush()?;
        Ok(())
    }
}
