//! Activity-log and resync-tracking core for a block-level synchronous
//! replication engine.
//!
//! # Threading model
//!
//! Every mutation of AL or resync state goes through [`device::Device`]'s
//! single internal mutex (the AL lock), paired with one condition variable
//! (the AL waitset) that every blocking path — `begin_io_prepare`,
//! `rs_begin_io`, and anyone waiting for a transaction in flight — sleeps
//! on and that every state change capable of unblocking one of them wakes.
//! The transaction lock described in the design notes is folded into the
//! same mutex as a plain `tx_locked` flag rather than a separate
//! test-and-set object, since the two are never contended independently.
//!
//! AL transactions are written through [`metadata_io`]'s gate, which
//! serializes access to the single shared 4 KiB metadata buffer and
//! escalates the device to a failed state on a disk-timeout expiry.
//! [`device::Device::begin_io_commit`] can run that write on a dedicated
//! [`worker::Worker`] thread instead of the caller's, so a caller already
//! on the block I/O submission path can't deadlock a nested submission.
//!
//! # Logging
//!
//! This crate logs through the `log` facade rather than printing directly;
//! a binary wires in whatever subscriber it likes (`env_logger` in this
//! crate's own tests). Acquisition/eviction/commit steps log at `trace` or
//! `debug`, step-aside and recount events at `warn`, and terminal I/O
//! failures or out-of-range accesses at `error`.

pub mod activity_log;
pub mod bitmap;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod lru;
pub mod metadata_io;
pub mod peer;
pub mod resync;
pub mod sync_state;
pub mod transaction;
pub mod worker;

pub use config::Config;
pub use device::{Device, NullPeerIo, PeerIo};
pub use error::{Error, Result};
pub use peer::{Peer, ReplicationState};
