//! Resync tracker (component E): per-peer BM-extent bookkeeping layered on
//! top of the same generic [`crate::lru::Lru`] collaborator the activity log
//! uses, keyed by BM extent number instead of AL extent number.
//!
//! This module holds the tracker's data types and the pieces of its logic
//! that don't need the device lock or I/O (the blocking retry loop and the
//! step-aside algorithm live on `Device` in `device.rs`, since they need to
//! sleep and wake on the shared waitset).

use crate::geometry;
use crate::lru::Lru;
use crate::peer::Peer;

bitflags::bitflags! {
    /// Per-BM-extent fence flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BmeFlags: u32 {
        /// Application writes into this extent must step aside for resync.
        const NO_WRITES = 1 << 0;
        /// Forcibly taken after the step-aside retry budget is exhausted;
        /// implies [`BmeFlags::NO_WRITES`].
        const LOCKED    = 1 << 1;
        /// An application write is waiting on this extent and wants
        /// priority over the resync side.
        const PRIORITY  = 1 << 2;
    }
}

/// Per-BM-extent resync bookkeeping: bits still to resync, bits that failed,
/// and the fence flags gating concurrent application writes.
#[derive(Debug, Clone)]
pub struct BmExtentState {
    /// Bits remaining to resync in this extent.
    pub rs_left: u32,
    /// Bits that failed to resync in this extent.
    pub rs_failed: u32,
    /// Fence flags.
    pub flags: BmeFlags,
}

impl Default for BmExtentState {
    fn default() -> Self {
        BmExtentState {
            rs_left: 0,
            rs_failed: 0,
            flags: BmeFlags::empty(),
        }
    }
}

impl BmExtentState {
    /// Whether this invariant holds: `LOCKED` implies `NO_WRITES`.
    pub fn flags_consistent(&self) -> bool {
        !self.flags.contains(BmeFlags::LOCKED) || self.flags.contains(BmeFlags::NO_WRITES)
    }
}

/// One peer's resync tracker: a bounded LRU of BM extent slots.
pub struct ResyncCore {
    pub lru: Lru<BmExtentState>,
}

impl ResyncCore {
    /// Create a tracker with `capacity` slots.
    pub fn new(capacity: u32) -> Self {
        ResyncCore {
            lru: Lru::new(capacity, capacity),
        }
    }

    /// Acquire (or re-hit) `bm_enr`, committing immediately: unlike the AL,
    /// the resync LRU has no on-disk transaction log of its own, only the
    /// bitmap itself is persisted, so there is nothing to defer a commit
    /// for.
    pub fn acquire(&mut self, bm_enr: u32) -> Option<u16> {
        let acquired = self.lru.get(bm_enr)?;
        self.lru.committed();
        Some(acquired.index)
    }
}

/// Whether every AL extent under `bm_enr` is currently free of an active
/// slot in `al`.
pub fn al_clear(al: &crate::activity_log::AlCore, bm_enr: u32) -> bool {
    geometry::bm_enr_to_al_enr_range(bm_enr).all(|al_enr| al.lru.find(al_enr).is_none())
}

/// Whether `bm_enr` is in sync from `peer`'s point of view (component
/// E.4). `Established` peers answer from the bitmap alone; a local
/// `SyncSource` must additionally confirm no AL activity overlaps the
/// extent and that its tracked `rs_left` has reached zero.
pub fn extent_in_sync(peer: &mut Peer, al: &crate::activity_log::AlCore, bm_enr: u32) -> bool {
    use crate::peer::ReplicationState;
    match peer.state {
        ReplicationState::Established => {
            let (first, last) = (
                geometry::bm_enr_to_first_bit(bm_enr),
                geometry::bm_enr_to_last_bit(bm_enr),
            );
            peer.bitmap.total_weight() == 0 || peer.bitmap.count_bits(first, last) == 0
        }
        ReplicationState::SyncSource => {
            let Some(index) = peer.bme_get(bm_enr) else {
                return false;
            };
            let in_sync = al_clear(al, bm_enr) && peer.resync.lru.element_by_index(index).data.rs_left == 0;
            peer.bme_put(index);
            in_sync
        }
        ReplicationState::SyncTarget | ReplicationState::Off => false,
    }
}
