//! Per-peer replication state: bitmap, resync tracker, and the small amount
//! of link/role bookkeeping the resync tracker needs to decide whether an
//! extent is "in sync" from this peer's point of view.

use std::time::{Duration, Instant};

use crate::bitmap::PeerBitmap;
use crate::resync::ResyncCore;

/// Coarse replication state of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Connected, bitmaps in sync, no resync in flight.
    Established,
    /// This side is the source of an in-flight resync.
    SyncSource,
    /// This side is the target of an in-flight resync.
    SyncTarget,
    /// Not connected.
    Off,
}

/// Number of rate-tracking marks kept (a ring of recent `rs_left` samples).
pub const SYNC_MARKS: usize = 8;
/// Minimum spacing between successive marks.
pub const SYNC_MARK_STEP: Duration = Duration::from_secs(3);

/// Ring buffer of recent `rs_left` samples, used to estimate resync
/// throughput and time-to-completion. Advanced at most once per
/// [`SYNC_MARK_STEP`].
pub struct RateTracker {
    marks: [u64; SYNC_MARKS],
    idx: usize,
    last: Instant,
}

impl RateTracker {
    /// Start a fresh tracker, its whole ring seeded with `initial_left`.
    pub fn new(initial_left: u64) -> Self {
        RateTracker {
            marks: [initial_left; SYNC_MARKS],
            idx: 0,
            last: Instant::now(),
        }
    }

    /// Record a sample if at least [`SYNC_MARK_STEP`] has elapsed since the
    /// last one.
    pub fn advance(&mut self, rs_left: u64) {
        let now = Instant::now();
        if now.duration_since(self.last) >= SYNC_MARK_STEP {
            self.idx = (self.idx + 1) % SYNC_MARKS;
            self.marks[self.idx] = rs_left;
            self.last = now;
        }
    }

    /// Oldest sample still held in the ring.
    pub fn oldest(&self) -> u64 {
        self.marks[(self.idx + 1) % SYNC_MARKS]
    }

    /// Most recent sample.
    pub fn newest(&self) -> u64 {
        self.marks[self.idx]
    }
}

/// One peer connection: its out-of-sync bitmap, resync tracker, and the
/// link/role facts [`crate::resync`]'s `extent_in_sync` needs.
pub struct Peer {
    /// Stable index of this peer within the device's peer table.
    pub id: u32,
    /// Bitmap slot this peer occupies (`set_sync`'s per-peer mask index).
    pub bitmap_index: u32,
    /// Current replication state.
    pub state: ReplicationState,
    /// Negotiated wire protocol version.
    pub protocol_version: u32,
    /// Whether the local node is the sync source for this peer.
    pub is_local_sync_source: bool,
    /// Out-of-sync bitmap against this peer.
    pub bitmap: PeerBitmap,
    /// Resync tracker (BM extent LRU) for this peer.
    pub resync: ResyncCore,
    /// Count of BM extents currently held with `NO_WRITES` set, bounded to
    /// `nr_elements / 2` by [`Peer::bme_get`].
    pub resync_locked: u32,
    /// The single BM extent number [`crate::resync`]'s non-blocking path
    /// remembers across calls (`resync_wenr`).
    pub resync_wenr: Option<u32>,
    /// Resync throughput estimator.
    pub rate: RateTracker,
}

impl Peer {
    /// Create a peer with a bitmap of `total_bits` bits and a resync LRU of
    /// `resync_capacity` slots.
    pub fn new(
        id: u32,
        bitmap_index: u32,
        total_bits: u64,
        bitmap_base_sector: u64,
        resync_capacity: u32,
    ) -> Self {
        Peer {
            id,
            bitmap_index,
            state: ReplicationState::Established,
            protocol_version: 110,
            is_local_sync_source: false,
            bitmap: PeerBitmap::new(total_bits, bitmap_base_sector),
            resync: ResyncCore::new(resync_capacity),
            resync_locked: 0,
            resync_wenr: None,
            rate: RateTracker::new(0),
        }
    }

    /// Acquire (or re-hit) the resync slot for `bm_enr`, refusing if doing
    /// so would push `resync_locked` past `nr_elements / 2` (`_bme_get`).
    pub fn bme_get(&mut self, bm_enr: u32) -> Option<u16> {
        let cap = self.resync.lru.nr_elements();
        let already_held = self.resync.lru.find(bm_enr).is_some();
        if !already_held && self.resync_locked * 2 >= cap {
            return None;
        }
        let was_used = self
            .resync
            .lru
            .find(bm_enr)
            .map(|i| self.resync.lru.element_by_index(i).refcnt > 0)
            .unwrap_or(false);
        let acquired = self.resync.acquire(bm_enr)?;
        if !was_used {
            self.resync
                .lru
                .element_by_index_mut(acquired)
                .data
                .flags
                .insert(crate::resync::BmeFlags::NO_WRITES);
            self.resync_locked += 1;
        }
        Some(acquired)
    }

    /// Release one reference on a resync slot, clearing its fence flags and
    /// decrementing `resync_locked` once the last reference drops.
    pub fn bme_put(&mut self, index: u16) -> u32 {
        let refcnt = self.resync.lru.put(index);
        if refcnt == 0 {
            let slot = self.resync.lru.element_by_index_mut(index);
            let was_no_writes = slot.data.flags.contains(crate::resync::BmeFlags::NO_WRITES);
            slot.data.flags = crate::resync::BmeFlags::empty();
            if was_no_writes {
                self.resync_locked = self.resync_locked.saturating_sub(1);
            }
        }
        refcnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bme_get_bounds_to_half_capacity() {
        let mut peer = Peer::new(0, 0, 1 << 20, 0, 4);
        assert!(peer.bme_get(0).is_some());
        assert!(peer.bme_get(1).is_some());
        assert!(peer.bme_get(2).is_none(), "capacity bound is nr_elements/2");
    }

    #[test]
    fn bme_put_clears_flags_but_keeps_accounting() {
        let mut peer = Peer::new(0, 0, 1 << 20, 0, 4);
        let index = peer.bme_get(0).unwrap();
        peer.resync.lru.element_by_index_mut(index).data.rs_left = 7;
        peer.bme_put(index);
        assert_eq!(peer.resync_locked, 0);
        assert_eq!(peer.resync.lru.element_by_index(index).data.rs_left, 7);
        assert!(
            peer.resync
                .lru
                .element_by_index(index)
                .data
                .flags
                .is_empty()
        );
    }

    #[test]
    fn rate_tracker_holds_initial_sample_until_step() {
        let tracker = RateTracker::new(500);
        assert_eq!(tracker.newest(), 500);
        assert_eq!(tracker.oldest(), 500);
    }
}
