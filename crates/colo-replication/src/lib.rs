//! Secondary-side block replication core for COLO (COarse-grain
//! LOck-stepping) fault tolerance.
//!
//! This crate implements the block-replication half of a COLO pair: the
//! in-memory staging buffer that forwarded primary writes land in, the
//! copy-on-write interlock that protects pre-images from the secondary's
//! own local writes, the per-device mode machine that routes reads and
//! writes depending on replication state, the checkpoint handshake wire
//! protocol, the coordinator loops that drive that handshake, failover
//! promotion, and the adapter onto the external packet-comparison proxy.
//!
//! It does not implement VM migration, guest-state (de)serialization, or
//! the kernel packet-comparison module itself — those are represented here
//! as narrow traits ([`coordinator::VmControl`], [`proxy::NicProxyAdapter`])
//! an embedder supplies.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod cow;
pub mod device;
pub mod driver;
pub mod error;
pub mod failover;
pub mod proxy;
pub mod sector;

pub use buffer::{BufferedRegion, DiskBuffer};
pub use channel::{CheckpointChannel, Tag};
pub use config::{DriverConfig, Mode};
pub use coordinator::{ColoExitReason, CheckpointTiming, ShutdownRequest, VmControl};
pub use cow::{CowEngine, CowGuard, CowRequest};
pub use device::{BeforeWriteHook, BlockDevice, MemDisk};
pub use driver::{DeviceMode, ReplicationDriver};
pub use failover::FailoverController;
pub use proxy::{NicProxyAdapter, NullProxy, PollResult};
pub use sector::{ClusterRange, SectorRange};
