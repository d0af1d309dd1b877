//! Bitmap sync-state mutators (component F).
//!
//! These operate on a single peer's bitmap and resync bookkeeping; the
//! uniform "always take the AL lock first" rule ([`crate::device::Device`]'s
//! decided resolution of the open question over whether a single-peer path
//! may skip it) is enforced by the caller in `device.rs`, not here.

use crate::geometry;
use crate::peer::Peer;

/// Mark `[sector, sector + size)` in sync, rounding the start up and the
/// end down to whole 4 KiB blocks, except that the device's trailing
/// (possibly partial) block is always included when the range reaches it.
/// Returns the count of bits that actually changed from out-of-sync to
/// in-sync, and advances the peer's rate tracker.
pub fn set_in_sync(peer: &mut Peer, sector: u64, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    if size % geometry::SECTOR_SIZE != 0 {
        log::error!(target: "resync", "set_in_sync: size {size} is not sector-aligned, rejecting");
        return 0;
    }
    let sectors = size / geometry::SECTOR_SIZE;
    let end_sector = sector + sectors;
    let device_end_sector = peer.bitmap.total_bits() * geometry::SECTORS_PER_BIT;

    let reaches_end = end_sector >= device_end_sector;
    let mut first_bit = sector.div_ceil(geometry::SECTORS_PER_BIT);
    let last_bit = if reaches_end {
        peer.bitmap.total_bits().saturating_sub(1)
    } else {
        let whole_bits = end_sector / geometry::SECTORS_PER_BIT;
        if whole_bits == 0 {
            return 0;
        }
        whole_bits - 1
    };

    // The device's trailing block is forced in regardless of whether the
    // request's start rounds past it; nothing follows it to round against.
    if reaches_end && first_bit > last_bit {
        first_bit = last_bit;
    }
    if first_bit > last_bit {
        return 0;
    }
    let changed = peer.bitmap.clear_bits(first_bit, last_bit);
    peer.rate.advance(peer.bitmap.total_weight());
    changed
}

/// Mark `[sector, sector + size)` out of sync. Unlike [`set_in_sync`], no
/// rounding is applied: any sector touched marks its whole 4 KiB block.
///
/// For every BM extent the range overlaps, if that extent already has a
/// resync LRU entry, its `rs_left` is bumped by the count of bits newly
/// dirtied within that extent — a resync in flight there must see the
/// freshly out-of-sync bits or it can declare the extent finished early.
pub fn set_out_of_sync(peer: &mut Peer, sector: u64, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    if size % geometry::SECTOR_SIZE != 0 {
        log::error!(target: "resync", "set_out_of_sync: size {size} is not sector-aligned, rejecting");
        return 0;
    }
    let sectors = size / geometry::SECTOR_SIZE;
    let end_sector = sector + sectors - 1;
    let first_bit = geometry::sector_to_bit(sector);
    let last_bit = geometry::sector_to_bit(end_sector);

    let (first_bm, last_bm) = geometry::bm_extent_range(sector, size);
    let before: Vec<u64> = (first_bm..=last_bm)
        .map(|bm_enr| {
            let (lo, hi) = clamp_to_bm_extent(bm_enr, first_bit, last_bit);
            peer.bitmap.count_bits(lo, hi)
        })
        .collect();

    let changed = peer.bitmap.set_bits(first_bit, last_bit);

    for (i, bm_enr) in (first_bm..=last_bm).enumerate() {
        let (lo, hi) = clamp_to_bm_extent(bm_enr, first_bit, last_bit);
        let delta = peer.bitmap.count_bits(lo, hi).saturating_sub(before[i]);
        if delta == 0 {
            continue;
        }
        if let Some(index) = peer.resync.lru.find(bm_enr) {
            peer.resync.lru.element_by_index_mut(index).data.rs_left += delta as u32;
        }
    }
    changed
}

fn clamp_to_bm_extent(bm_enr: u32, first_bit: u64, last_bit: u64) -> (u64, u64) {
    let ext_first = geometry::bm_enr_to_first_bit(bm_enr);
    let ext_last = geometry::bm_enr_to_last_bit(bm_enr);
    (first_bit.max(ext_first), last_bit.min(ext_last))
}

/// Unconditionally mark a peer's entire bitmap out of sync (used when a
/// peer's disk is declared fully stale and needs a complete resync).
pub fn set_all_out_of_sync(peer: &mut Peer) -> u64 {
    let last = peer.bitmap.total_bits().saturating_sub(1);
    peer.bitmap.set_bits(0, last)
}

/// Record a failed resync I/O against the BM extent covering `sector`
/// without touching the bitmap itself; [`crate::resync::BmExtentState::rs_failed`]
/// is the ledger [`crate::resync`]'s completion accounting consults.
pub fn rs_failed_io(peer: &mut Peer, sector: u64, size: u64) {
    let bm_enr = geometry::sector_to_bm_enr(sector);
    let count = (size / geometry::BM_BIT_SIZE).max(1) as u32;
    if let Some(index) = peer.bme_get(bm_enr) {
        peer.resync.lru.element_by_index_mut(index).data.rs_failed += count;
        peer.bme_put(index);
    }
}
