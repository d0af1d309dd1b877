//! Activity log (component D): the AL extent LRU plus the acquisition logic
//! shared by the fast path, the blocking prepare path, and the non-blocking
//! path. The transaction-building and commit orchestration (which need the
//! device lock, the worker thread, and I/O) live on `Device` in
//! `device.rs`; this module holds the pure, lock-free pieces so they can be
//! tested directly.

use crate::geometry;
use crate::lru::Lru;
use crate::peer::Peer;

/// The AL proper: its LRU of extent slots plus the counters a written
/// transaction advances.
pub struct AlCore {
    /// LRU of active AL extents. Payload `()`: the AL itself carries no
    /// per-slot data beyond the extent number the generic LRU already
    /// tracks.
    pub lru: Lru<()>,
    /// Next transaction sequence number to write.
    pub tr_number: u32,
    /// Cyclic cursor into the LRU used to spread `context` snapshots across
    /// successive transactions (`al_tr_cycle`).
    pub tr_cycle: u32,
    /// Count of transactions actually written to disk (`al_writ_cnt`).
    pub writ_cnt: u64,
}

impl AlCore {
    /// Create an AL with `capacity` extent slots.
    pub fn new(capacity: u32) -> Self {
        AlCore {
            lru: Lru::new(capacity, crate::transaction::AL_UPDATES_PER_TRANSACTION as u32),
            tr_number: 0,
            tr_cycle: 0,
            writ_cnt: 0,
        }
    }
}

/// The inclusive AL extent range `[sector, sector + size)` covers.
/// `size` is in bytes and must be a non-zero multiple of 512.
pub fn al_extent_range(sector: u64, size: u64) -> (u32, u32) {
    debug_assert!(size > 0 && size % geometry::SECTOR_SIZE == 0);
    let last_sector = sector + size / geometry::SECTOR_SIZE - 1;
    (
        geometry::sector_to_al_enr(sector),
        geometry::sector_to_al_enr(last_sector),
    )
}

/// Outcome of an internal AL acquisition attempt (`_al_get`).
pub enum AlGetResult {
    /// The extent was acquired (hit or fresh eviction).
    Acquired(crate::lru::Acquired),
    /// An overlapping BM extent has `NO_WRITES` set; `priority_newly_set`
    /// is true iff this call was the one to set `BME_PRIORITY` on it.
    Busy { priority_newly_set: bool },
    /// No AL slot is available right now (starvation or budget exhausted).
    NoSlot,
}

/// Attempt to acquire AL extent `enr`, checking every peer's resync tracker
/// for an overlapping extent under `NO_WRITES` first (`_al_get`). When such
/// an overlap exists this call raises `BME_PRIORITY` on it so the resync
/// side's step-aside algorithm knows an application write is waiting.
pub fn al_get(al: &mut AlCore, peers: &mut [Peer], enr: u32, nonblock: bool) -> AlGetResult {
    let bm_enr = geometry::al_enr_to_bm_enr(enr);
    for peer in peers.iter_mut() {
        if let Some(index) = peer.resync.lru.find(bm_enr) {
            let slot = peer.resync.lru.element_by_index_mut(index);
            if slot.data.flags.contains(crate::resync::BmeFlags::NO_WRITES) {
                let newly_set = !slot.data.flags.contains(crate::resync::BmeFlags::PRIORITY);
                slot.data.flags.insert(crate::resync::BmeFlags::PRIORITY);
                return AlGetResult::Busy {
                    priority_newly_set: newly_set,
                };
            }
        }
    }

    let acquired = if nonblock {
        al.lru.try_get(enr)
    } else {
        al.lru.get(enr)
    };
    match acquired {
        Some(a) => AlGetResult::Acquired(a),
        None => AlGetResult::NoSlot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_range_spans_multiple_extents() {
        let (first, last) = al_extent_range(0, geometry::AL_EXTENT_SIZE * 2);
        assert_eq!(first, 0);
        assert_eq!(last, 1);
    }

    #[test]
    fn get_hits_clean_slot() {
        let mut al = AlCore::new(4);
        let mut peers: Vec<Peer> = Vec::new();
        match al_get(&mut al, &mut peers, 0, false) {
            AlGetResult::Acquired(a) => assert!(a.needs_transaction),
            _ => panic!("expected a fresh acquisition"),
        }
    }

    #[test]
    fn get_reports_busy_and_sets_priority_once() {
        let mut al = AlCore::new(4);
        let mut peer = Peer::new(0, 0, 1 << 20, 0, 8);
        let index = peer.bme_get(0).unwrap();
        assert!(
            peer.resync
                .lru
                .element_by_index(index)
                .data
                .flags
                .contains(crate::resync::BmeFlags::NO_WRITES)
        );
        let mut peers = vec![peer];

        match al_get(&mut al, &mut peers, 0, false) {
            AlGetResult::Busy { priority_newly_set } => assert!(priority_newly_set),
            _ => panic!("expected Busy"),
        }
        match al_get(&mut al, &mut peers, 0, false) {
            AlGetResult::Busy { priority_newly_set } => assert!(!priority_newly_set),
            _ => panic!("expected Busy"),
        }
    }
}
