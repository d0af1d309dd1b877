//! Top-level `Device`: owns the activity log, every peer's bitmap and
//! resync tracker, and the concurrency primitives (`al_lock`/`al_wait`,
//! the transaction lock, the metadata I/O gate, and the worker thread)
//! that bind them into the operations the rest of this crate documents as
//! components D, E, and F.
//!
//! `Device` is a cheap-to-clone handle over a single `Arc<Inner>`, mirroring
//! the teacher's `Shared<T>` wrapper shape but with blocking `std::sync`
//! primitives instead of an async mutex: callers hand a cloned `Device` to
//! the worker thread closure in [`Device::begin_io_commit`] rather than
//! threading a borrowed reference through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use blocksync_device::{Block, MetadataStore};

use crate::activity_log::{self, AlCore, AlGetResult};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::geometry;
use crate::lru::Acquired;
use crate::metadata_io::{self, MetadataIoGate};
use crate::peer::Peer;
use crate::resync;
use crate::sync_state;
use crate::transaction::{
    AlTransaction, SlotUpdate, AL_CONTEXT_PER_TRANSACTION, AL_TR_UPDATE, AL_UPDATES_PER_TRANSACTION,
    NO_UPDATE_SLOT,
};
use crate::worker::Worker;

/// Number of times `rs_begin_io` steps aside for a higher-priority
/// application write before forcibly taking the extent.
const STEP_ASIDE_RETRIES: u32 = 200;
/// Sleep between step-aside retries.
const STEP_ASIDE_SLEEP: Duration = Duration::from_millis(100);

/// Hand-off point to whatever sits above this core: sending
/// `peers_in_sync` and noticing a peer's resync has fully drained.
/// Default-implemented as a no-op; higher-level replication state is out
/// of scope for this crate.
pub trait PeerIo: Send + Sync {
    /// Notify peers named in `peer_mask` that `[sector, sector+size_bytes)`
    /// is now known in sync (protocol >= 110, sync-source only).
    fn peers_in_sync(&self, peer_mask: u64, sector: u64, size_bytes: u64);

    /// A peer's resync has just reached zero outstanding bits.
    fn on_resync_finished(&self, peer_id: u32);
}

/// No-op [`PeerIo`], used when nothing above this core needs the hook.
#[derive(Debug, Default)]
pub struct NullPeerIo;

impl PeerIo for NullPeerIo {
    fn peers_in_sync(&self, _peer_mask: u64, _sector: u64, _size_bytes: u64) {}
    fn on_resync_finished(&self, _peer_id: u32) {}
}

struct Core {
    al: AlCore,
    peers: Vec<Peer>,
    tx_locked: bool,
}

pub(crate) struct Inner {
    config: Config,
    store: Mutex<Box<dyn MetadataStore>>,
    gate: MetadataIoGate,
    worker: Worker,
    peer_io: Box<dyn PeerIo>,
    core: Mutex<Core>,
    al_wait: Condvar,
}

/// A cheap-to-clone handle to a device's activity log, peer bitmaps, and
/// resync trackers.
#[derive(Clone)]
pub struct Device(Arc<Inner>);

impl Device {
    /// Create a device over `store`, with no peers attached yet.
    pub fn new(config: Config, store: Box<dyn MetadataStore>, peer_io: Box<dyn PeerIo>) -> Result<Self> {
        config.validate()?;
        let al = AlCore::new(config.al_extents);
        Ok(Device(Arc::new(Inner {
            config,
            store: Mutex::new(store),
            gate: MetadataIoGate::new(),
            worker: Worker::spawn(),
            peer_io,
            core: Mutex::new(Core {
                al,
                peers: Vec::new(),
                tx_locked: false,
            }),
            al_wait: Condvar::new(),
        })))
    }

    /// Attach a peer, returning its index for use in every per-peer method
    /// below.
    pub fn add_peer(&self, peer: Peer) -> usize {
        let mut core = self.0.core.lock().unwrap();
        core.peers.push(peer);
        core.peers.len() - 1
    }

    /// Count of AL transactions actually written to disk so far
    /// (`al_writ_cnt`).
    pub fn al_writ_cnt(&self) -> u64 {
        self.0.core.lock().unwrap().al.writ_cnt
    }

    /// Whether the metadata I/O gate has escalated the device to failed.
    pub fn is_failed(&self) -> bool {
        self.0.gate.is_failed()
    }

    fn disk_timeout(&self) -> Duration {
        Duration::from_millis(self.0.config.disk_timeout as u64 * 100)
    }

    // ---- component D: activity log --------------------------------

    /// Try to take the fast path: succeeds only when `[sector, size)` lies
    /// within a single already-active AL extent with no overlapping resync
    /// fence.
    pub fn begin_io_fastpath(&self, sector: u64, size: u64) -> bool {
        let (first, last) = activity_log::al_extent_range(sector, size);
        if first != last {
            return false;
        }
        let mut core = self.0.core.lock().unwrap();
        if has_overlapping_no_writes(&core, first) {
            return false;
        }
        match core.al.lru.find(first) {
            Some(index) => {
                core.al.lru.bump_hit(index);
                true
            }
            None => false,
        }
    }

    /// Blocking slow path: acquire every AL extent `[sector, size)` spans,
    /// waiting out resync fences and LRU starvation. Returns whether any
    /// acquisition introduced a pending change that needs a transaction
    /// before the caller may submit its I/O.
    pub fn begin_io_prepare(&self, sector: u64, size: u64) -> Result<bool> {
        let (first, last) = activity_log::al_extent_range(sector, size);
        let mut need_tx = false;
        let mut core = self.0.core.lock().unwrap();
        for enr in first..=last {
            loop {
                let core_ref = &mut *core;
                match activity_log::al_get(&mut core_ref.al, &mut core_ref.peers, enr, false) {
                    AlGetResult::Acquired(a) => {
                        need_tx |= a.needs_transaction;
                        break;
                    }
                    AlGetResult::Busy { priority_newly_set } => {
                        if priority_newly_set {
                            self.0.al_wait.notify_all();
                        }
                        core = self.0.al_wait.wait(core).unwrap();
                    }
                    AlGetResult::NoSlot => {
                        core = self.0.al_wait.wait(core).unwrap();
                    }
                }
            }
        }
        Ok(need_tx)
    }

    /// Non-blocking slow path: acquire every AL extent `[sector, size)`
    /// spans without ever sleeping, rolling back everything acquired so
    /// far on the first extent that can't be had immediately.
    pub fn begin_io_nonblock(&self, sector: u64, size: u64) -> Result<()> {
        let (first, last) = activity_log::al_extent_range(sector, size);
        let mut core = self.0.core.lock().unwrap();
        let mut acquired: Vec<Acquired> = Vec::new();

        for enr in first..=last {
            let core_ref = &mut *core;
            match activity_log::al_get(&mut core_ref.al, &mut core_ref.peers, enr, true) {
                AlGetResult::Acquired(a) => acquired.push(a),
                AlGetResult::Busy { priority_newly_set } => {
                    roll_back(&mut core.al, &acquired);
                    if priority_newly_set {
                        drop(core);
                        self.0.al_wait.notify_all();
                        return Err(Error::Busy);
                    }
                    return Err(Error::WouldBlock);
                }
                AlGetResult::NoSlot => {
                    roll_back(&mut core.al, &acquired);
                    return Err(Error::WouldBlock);
                }
            }
        }
        Ok(())
    }

    /// Commit every AL extent acquisition that still needs a transaction.
    /// If `delegate` is set, the actual disk write runs on the device's
    /// worker thread rather than the caller's, so a caller on the block
    /// I/O submission path can't deadlock a nested submission.
    pub fn begin_io_commit(&self, delegate: bool) -> Result<()> {
        loop {
            let mut core = self.0.core.lock().unwrap();
            if core.al.lru.pending_changes() == 0 {
                return Ok(());
            }
            if core.tx_locked {
                core = self.0.al_wait.wait(core).unwrap();
                continue;
            }
            core.tx_locked = true;

            let batch = core.al.lru.to_be_changed().to_vec();
            mark_evicted_ranges_for_writeout(&mut core, &batch);
            let block = build_transaction_block(&mut core.al, &batch);
            let tr_number = core.al.tr_number;
            drop(core);

            return if delegate {
                let this = self.clone();
                self.0.worker
                    .delegate(move || this.run_transaction_and_commit(tr_number, block, batch))
            } else {
                self.run_transaction_and_commit(tr_number, block, batch)
            };
        }
    }

    fn run_transaction_and_commit(&self, tr_number: u32, mut block: Block, batch: Vec<u16>) -> Result<()> {
        {
            let mut store = self.0.store.lock().unwrap();
            let mut core = self.0.core.lock().unwrap();
            for peer in core.peers.iter_mut() {
                peer.bitmap.write_hinted(&mut **store)?;
            }
        }

        let write_result = if self.0.config.al_updates {
            let sector = self.0.config.transaction_sector(tr_number as u64);
            metadata_io::sync_page_io(&self.0.gate, &self.0.store, sector, &mut block, true, self.disk_timeout())
        } else {
            Ok(())
        };

        let mut core = self.0.core.lock().unwrap();
        let result = match write_result {
            Ok(()) => {
                core.al.lru.commit_batch(&batch);
                core.al.tr_number = core.al.tr_number.wrapping_add(1);
                core.al.writ_cnt += 1;
                Ok(())
            }
            Err(e) => {
                core.al.lru.cancel_batch(&batch);
                log::error!("AL transaction {tr_number} write failed: {e}");
                Err(e)
            }
        };
        core.tx_locked = false;
        drop(core);
        self.0.al_wait.notify_all();
        result
    }

    /// Release the AL extents `[sector, size)` spans, acquired by a prior
    /// `begin_io_*` call.
    pub fn complete_io(&self, sector: u64, size: u64) {
        let (first, last) = activity_log::al_extent_range(sector, size);
        let mut core = self.0.core.lock().unwrap();
        let mut woke = false;
        for enr in first..=last {
            if let Some(index) = core.al.lru.find(enr) {
                if core.al.lru.put(index) == 0 {
                    woke = true;
                }
            }
        }
        drop(core);
        if woke {
            self.0.al_wait.notify_all();
        }
    }

    /// Drop every unreferenced AL extent, freeing its slot.
    pub fn shrink(&self) -> u32 {
        self.0.core.lock().unwrap().al.lru.shrink_unreferenced()
    }

    // ---- component E: resync tracker -------------------------------

    /// Blocking, interruptible acquisition of the BM extent covering
    /// `sector` for `peer_idx`'s resync I/O. Implements the step-aside
    /// algorithm: an application write waiting on this extent (signaled
    /// by `BME_PRIORITY`) gets up to [`STEP_ASIDE_RETRIES`] chances to run
    /// first before this call forcibly takes the extent.
    pub fn rs_begin_io(&self, peer_idx: usize, sector: u64, cancel: &AtomicBool) -> Result<()> {
        let bm_enr = geometry::sector_to_bm_enr(sector);
        let mut retries_left = STEP_ASIDE_RETRIES;

        'outer: loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            let mut core = self.0.core.lock().unwrap();
            let index = loop {
                if cancel.load(Ordering::Relaxed) {
                    return Err(Error::Interrupted);
                }
                match core.peers[peer_idx].bme_get(bm_enr) {
                    Some(i) => break i,
                    None => core = self.0.al_wait.wait(core).unwrap(),
                }
            };

            loop {
                if cancel.load(Ordering::Relaxed) {
                    core.peers[peer_idx].bme_put(index);
                    return Err(Error::Interrupted);
                }
                if resync::al_clear(&core.al, bm_enr) {
                    lock_bme(&mut core, peer_idx, index);
                    return Ok(());
                }
                let priority = core.peers[peer_idx]
                    .resync
                    .lru
                    .element_by_index(index)
                    .data
                    .flags
                    .contains(resync::BmeFlags::PRIORITY);
                if priority {
                    retries_left -= 1;
                    if retries_left == 0 {
                        lock_bme(&mut core, peer_idx, index);
                        return Ok(());
                    }
                    core.peers[peer_idx].bme_put(index);
                    drop(core);
                    std::thread::sleep(STEP_ASIDE_SLEEP);
                    continue 'outer;
                }
                core = self.0.al_wait.wait(core).unwrap();
            }
        }
    }

    /// Non-sleeping acquisition: fails immediately with
    /// [`Error::WouldBlock`] if AL activity overlaps, remembering the
    /// extent (`resync_wenr`) so the next call on the same extent doesn't
    /// re-pay the acquisition cost.
    pub fn try_rs_begin_io(&self, peer_idx: usize, sector: u64) -> Result<()> {
        let bm_enr = geometry::sector_to_bm_enr(sector);
        let mut core = self.0.core.lock().unwrap();

        if let Some(prev) = core.peers[peer_idx].resync_wenr {
            if prev != bm_enr {
                if let Some(idx) = core.peers[peer_idx].resync.lru.find(prev) {
                    core.peers[peer_idx].bme_put(idx);
                }
                core.peers[peer_idx].resync_wenr = None;
            }
        }

        let index = match core.peers[peer_idx].bme_get(bm_enr) {
            Some(i) => i,
            None => return Err(Error::WouldBlock),
        };

        if resync::al_clear(&core.al, bm_enr) {
            lock_bme(&mut core, peer_idx, index);
            core.peers[peer_idx].resync_wenr = None;
            Ok(())
        } else {
            core.peers[peer_idx].bme_put(index);
            core.peers[peer_idx].resync_wenr = Some(bm_enr);
            Err(Error::WouldBlock)
        }
    }

    /// Release the resync extent covering `sector` for `peer_idx`.
    pub fn rs_complete_io(&self, peer_idx: usize, sector: u64) -> Result<()> {
        let bm_enr = geometry::sector_to_bm_enr(sector);
        let mut core = self.0.core.lock().unwrap();
        let index = core.peers[peer_idx]
            .resync
            .lru
            .find(bm_enr)
            .ok_or_else(|| Error::invariant("rs_complete_io with no matching rs_begin_io"))?;
        let refcnt = core.peers[peer_idx].bme_put(index);
        drop(core);
        if refcnt == 0 {
            self.0.al_wait.notify_all();
        }
        Ok(())
    }

    /// Abandon a peer's whole resync tracker without persisting anything.
    pub fn rs_cancel_all(&self, peer_idx: usize) {
        let mut core = self.0.core.lock().unwrap();
        core.peers[peer_idx].resync.lru.reset();
        core.peers[peer_idx].resync_locked = 0;
        core.peers[peer_idx].resync_wenr = None;
        drop(core);
        self.0.al_wait.notify_all();
    }

    /// Gracefully remove every slot in a peer's resync tracker, refusing
    /// if any extent still has a live reference.
    pub fn rs_del_all(&self, peer_idx: usize) -> Result<()> {
        let mut core = self.0.core.lock().unwrap();
        if !core.peers[peer_idx].resync.lru.del_all() {
            return Err(Error::Busy);
        }
        core.peers[peer_idx].resync_locked = 0;
        core.peers[peer_idx].resync_wenr = None;
        Ok(())
    }

    /// Record `count` bits of a BM extent's resync as finished (or
    /// failed), recounting from the bitmap if the running totals go
    /// inconsistent, and finishing the extent (flushing its bitmap range
    /// and considering `peers_in_sync`) once `rs_left == rs_failed`.
    pub fn try_clear_on_disk_bm(
        &self,
        peer_idx: usize,
        bm_enr: u32,
        count: u32,
        success: bool,
    ) -> Result<()> {
        let mut core = self.0.core.lock().unwrap();
        self.try_clear_on_disk_bm_locked(&mut core, peer_idx, bm_enr, count, success)
    }

    /// Body of [`Device::try_clear_on_disk_bm`] for a caller that already
    /// holds `core` (used by `set_in_sync`/`set_sync`, which must update the
    /// bitmap and drive this finish-accounting under the same lock).
    fn try_clear_on_disk_bm_locked(
        &self,
        core: &mut Core,
        peer_idx: usize,
        bm_enr: u32,
        count: u32,
        success: bool,
    ) -> Result<()> {
        let index = match core.peers[peer_idx].resync.lru.find(bm_enr) {
            Some(i) => i,
            None => {
                let acquired = core.peers[peer_idx]
                    .resync
                    .acquire(bm_enr)
                    .ok_or_else(|| Error::invariant("no resync slot available"))?;
                let weight = bm_weight(&mut core.peers[peer_idx], bm_enr);
                let slot = core.peers[peer_idx].resync.lru.element_by_index_mut(acquired);
                slot.data.rs_left = weight;
                slot.data.rs_failed = 0;
                acquired
            }
        };

        {
            let slot = core.peers[peer_idx].resync.lru.element_by_index_mut(index);
            if success {
                slot.data.rs_left = slot.data.rs_left.saturating_sub(count);
            } else {
                slot.data.rs_failed += count;
            }
        }

        let (rs_left, rs_failed) = {
            let slot = core.peers[peer_idx].resync.lru.element_by_index(index);
            (slot.data.rs_left, slot.data.rs_failed)
        };
        if rs_left < rs_failed {
            log::warn!(target: "resync", "rs_left < rs_failed on bm extent {bm_enr}, recounting");
            let weight = bm_weight(&mut core.peers[peer_idx], bm_enr);
            core.peers[peer_idx]
                .resync
                .lru
                .element_by_index_mut(index)
                .data
                .rs_left = weight;
        }

        let finished = {
            let slot = core.peers[peer_idx].resync.lru.element_by_index(index);
            slot.data.rs_left == slot.data.rs_failed
        };
        if finished {
            core.peers[peer_idx]
                .resync
                .lru
                .element_by_index_mut(index)
                .data
                .rs_failed = 0;
            self.finish_bm_extent(core, peer_idx, bm_enr)?;
        }
        Ok(())
    }

    fn finish_bm_extent(&self, core: &mut Core, peer_idx: usize, bm_enr: u32) -> Result<()> {
        let first = geometry::bm_enr_to_first_bit(bm_enr);
        let last = geometry::bm_enr_to_last_bit(bm_enr);
        core.peers[peer_idx].bitmap.clear_bits(first, last);
        {
            let mut store = self.0.store.lock().unwrap();
            core.peers[peer_idx].bitmap.write_range(&mut **store, first, last)?;
        }

        let mut mask: u64 = 0u64;
        for i in 0..core.peers.len() {
            let core_ref = &mut *core;
            let al = &core_ref.al;
            let peer = &mut core_ref.peers[i];
            if resync::extent_in_sync(peer, al, bm_enr) {
                mask |= 1 << i;
            }
        }

        let peer = &core.peers[peer_idx];
        if mask != 0 && peer.protocol_version >= 110 && peer.is_local_sync_source {
            self.0.peer_io
                .peers_in_sync(mask, geometry::bm_enr_to_sector(bm_enr), geometry::BM_EXTENT_SIZE);
        }
        if core.peers[peer_idx].bitmap.total_weight() == 0 {
            self.0.peer_io.on_resync_finished(peer_idx as u32);
        }
        Ok(())
    }

    /// Whether `bm_enr` is currently in sync from `peer_idx`'s point of
    /// view.
    pub fn extent_in_sync(&self, peer_idx: usize, bm_enr: u32) -> bool {
        let mut core = self.0.core.lock().unwrap();
        let core_ref = &mut *core;
        let al = &core_ref.al;
        let peer = &mut core_ref.peers[peer_idx];
        resync::extent_in_sync(peer, al, bm_enr)
    }

    // ---- component F: bitmap sync-state mutators --------------------

    /// Mark `[sector, size)` in sync against `peer_idx`. Per cleared bit
    /// count in each BM extent the range spans, drives
    /// [`Device::try_clear_on_disk_bm`]'s finish accounting (writeout,
    /// `peers_in_sync`, resync-finished hook) under the same lock.
    pub fn set_in_sync(&self, peer_idx: usize, sector: u64, size: u64) -> u64 {
        let mut core = self.0.core.lock().unwrap();
        self.set_in_sync_locked(&mut core, peer_idx, sector, size)
    }

    fn set_in_sync_locked(&self, core: &mut Core, peer_idx: usize, sector: u64, size: u64) -> u64 {
        if size == 0 || size % geometry::SECTOR_SIZE != 0 {
            return sync_state::set_in_sync(&mut core.peers[peer_idx], sector, size);
        }
        let (first_bm, last_bm) = geometry::bm_extent_range(sector, size);
        let before: Vec<u32> = (first_bm..=last_bm)
            .map(|bm_enr| bm_weight(&mut core.peers[peer_idx], bm_enr))
            .collect();

        let changed = sync_state::set_in_sync(&mut core.peers[peer_idx], sector, size);

        if changed > 0 {
            for (i, bm_enr) in (first_bm..=last_bm).enumerate() {
                let after = bm_weight(&mut core.peers[peer_idx], bm_enr);
                let cleared = before[i].saturating_sub(after);
                // Only drive the finish ledger for extents a resync is
                // already tracking: try_clear_on_disk_bm's refill-on-miss
                // path reads the bitmap weight *after* our clear above and
                // would double-count `cleared` against it for an extent
                // with no resync in flight.
                if cleared == 0 || core.peers[peer_idx].resync.lru.find(bm_enr).is_none() {
                    continue;
                }
                if let Err(e) = self.try_clear_on_disk_bm_locked(core, peer_idx, bm_enr, cleared, true) {
                    log::error!(target: "resync", "set_in_sync: finish accounting for bm extent {bm_enr} failed: {e}");
                }
            }
        }
        changed
    }

    /// Mark `[sector, size)` out of sync against `peer_idx`.
    pub fn set_out_of_sync(&self, peer_idx: usize, sector: u64, size: u64) -> u64 {
        let mut core = self.0.core.lock().unwrap();
        sync_state::set_out_of_sync(&mut core.peers[peer_idx], sector, size)
    }

    /// Composite sync-state mutator: for each peer whose index is set in
    /// `mask`, if the corresponding bit of `bits` is set the range is
    /// marked out of sync (unrounded) for that peer, else in sync (rounded,
    /// driving the same finish accounting as [`Device::set_in_sync`]).
    /// Peers named in `mask` but absent from the runtime peer list have no
    /// bitmap of their own to update and are skipped.
    pub fn set_sync(&self, sector: u64, size: u64, bits: u64, mask: u64) -> u64 {
        let mut core = self.0.core.lock().unwrap();
        let mut total = 0;
        for i in 0..u64::BITS {
            if mask & (1 << i) == 0 {
                continue;
            }
            let idx = i as usize;
            if idx >= core.peers.len() {
                log::debug!(target: "resync", "set_sync: peer {i} in mask has no runtime peer, skipping");
                continue;
            }
            total += if bits & (1 << i) != 0 {
                sync_state::set_out_of_sync(&mut core.peers[idx], sector, size)
            } else {
                self.set_in_sync_locked(&mut core, idx, sector, size)
            };
        }
        total
    }

    /// Unconditionally mark the entire bitmap out of sync against
    /// `peer_idx`.
    pub fn set_all_out_of_sync(&self, peer_idx: usize) -> u64 {
        let mut core = self.0.core.lock().unwrap();
        sync_state::set_all_out_of_sync(&mut core.peers[peer_idx])
    }

    /// Record a failed resync I/O against `peer_idx` without touching the
    /// bitmap.
    pub fn rs_failed_io(&self, peer_idx: usize, sector: u64, size: u64) {
        let mut core = self.0.core.lock().unwrap();
        sync_state::rs_failed_io(&mut core.peers[peer_idx], sector, size)
    }
}

fn lock_bme(core: &mut Core, peer_idx: usize, index: u16) {
    core.peers[peer_idx]
        .resync
        .lru
        .element_by_index_mut(index)
        .data
        .flags
        .insert(resync::BmeFlags::LOCKED);
}

fn bm_weight(peer: &mut Peer, bm_enr: u32) -> u32 {
    let first = geometry::bm_enr_to_first_bit(bm_enr);
    let last = geometry::bm_enr_to_last_bit(bm_enr).min(peer.bitmap.total_bits().saturating_sub(1));
    peer.bitmap.count_bits(first, last) as u32
}

fn has_overlapping_no_writes(core: &Core, al_enr: u32) -> bool {
    let bm_enr = geometry::al_enr_to_bm_enr(al_enr);
    core.peers.iter().any(|peer| {
        peer.resync
            .lru
            .find(bm_enr)
            .map(|i| {
                peer.resync
                    .lru
                    .element_by_index(i)
                    .data
                    .flags
                    .contains(resync::BmeFlags::NO_WRITES)
            })
            .unwrap_or(false)
    })
}

fn roll_back(al: &mut AlCore, acquired: &[Acquired]) {
    let pending: Vec<u16> = acquired
        .iter()
        .filter(|a| a.needs_transaction)
        .map(|a| a.index)
        .collect();
    al.lru.cancel_batch(&pending);
    for a in acquired {
        if !a.needs_transaction {
            al.lru.put(a.index);
        }
    }
}

fn mark_evicted_ranges_for_writeout(core: &mut Core, batch: &[u16]) {
    for &index in batch {
        let old_number = core.al.lru.element_by_index(index).number;
        if old_number == geometry::LC_FREE {
            continue;
        }
        let bm_enr = geometry::al_enr_to_bm_enr(old_number);
        let first = geometry::bm_enr_to_first_bit(bm_enr);
        let last = geometry::bm_enr_to_last_bit(bm_enr);
        for peer in core.peers.iter_mut() {
            peer.bitmap.mark_range_for_writeout(first, last);
        }
    }
}

/// Build the on-disk transaction block for `batch` (a snapshot of
/// `al.lru.to_be_changed()`), advancing `al.tr_cycle` past the context
/// window this transaction carries.
fn build_transaction_block(al: &mut AlCore, batch: &[u16]) -> Block {
    let mut updates = [SlotUpdate {
        slot_nr: NO_UPDATE_SLOT,
        extent_nr: geometry::LC_FREE,
    }; AL_UPDATES_PER_TRANSACTION];
    for (i, &index) in batch.iter().enumerate() {
        updates[i] = SlotUpdate {
            slot_nr: index,
            extent_nr: al.lru.element_by_index(index).new_number,
        };
    }

    let total = al.lru.nr_elements().max(1);
    let window = (AL_CONTEXT_PER_TRANSACTION as u32).min(total);
    let start = al.tr_cycle % total;
    let mut context = Box::new([geometry::LC_FREE; AL_CONTEXT_PER_TRANSACTION]);
    for i in 0..window {
        let idx = ((start + i) % total) as u16;
        context[i as usize] = al.lru.element_by_index(idx).number;
    }
    al.tr_cycle = (start + window) % total;

    AlTransaction {
        tr_number: al.tr_number,
        transaction_type: AL_TR_UPDATE,
        n_updates: batch.len() as u16,
        context_size: total.min(u16::MAX as u32) as u16,
        context_start_slot_nr: start as u16,
        updates,
        context,
    }
    .serialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_device::InMemoryStore;

    fn device(al_extents: u32) -> Device {
        let config = Config {
            al_extents,
            ..Config::default()
        };
        Device::new(config, Box::new(InMemoryStore::new(4096)), Box::new(NullPeerIo)).unwrap()
    }

    #[test]
    fn fastpath_misses_when_extent_not_active() {
        let dev = device(4);
        assert!(!dev.begin_io_fastpath(0, 4096));
    }

    #[test]
    fn prepare_then_commit_then_fastpath_hits() {
        let dev = device(4);
        let need_tx = dev.begin_io_prepare(0, 4096).unwrap();
        assert!(need_tx);
        dev.begin_io_commit(false).unwrap();
        assert_eq!(dev.al_writ_cnt(), 1);
        assert!(dev.begin_io_fastpath(0, 4096));
        dev.complete_io(0, 4096);
        dev.complete_io(0, 4096);
    }

    #[test]
    fn nonblock_rolls_back_on_starvation() {
        let dev = device(1);
        dev.begin_io_prepare(0, 4096).unwrap();
        dev.begin_io_commit(false).unwrap();
        // Extent 0 is active and referenced; a disjoint extent can't be
        // acquired in a 1-slot AL without evicting it, and eviction is
        // blocked by the live reference, so this starves.
        let far = geometry::AL_EXTENT_SIZE;
        let err = dev.begin_io_nonblock(far, 4096).unwrap_err();
        assert!(matches!(err, Error::WouldBlock));
        assert_eq!(dev.0.core.lock().unwrap().al.lru.pending_changes(), 0);
    }

    #[test]
    fn resync_blocks_al_acquisition_until_priority_forces_step_aside() {
        let dev = device(8);
        let peer_idx = dev.add_peer(Peer::new(0, 0, 1 << 20, 0, 8));
        dev.0.core.lock().unwrap().peers[peer_idx].state = crate::peer::ReplicationState::SyncSource;

        let cancel = AtomicBool::new(false);
        dev.rs_begin_io(peer_idx, 0, &cancel).unwrap();

        // AL acquisition over the same region is fenced: it must not hang
        // forever, so use the non-blocking path and expect Busy once
        // priority has been raised.
        let first_try = dev.begin_io_nonblock(0, 4096);
        assert!(matches!(first_try, Err(Error::Busy) | Err(Error::WouldBlock)));

        dev.rs_complete_io(peer_idx, 0).unwrap();
        assert!(dev.begin_io_nonblock(0, 4096).is_ok());
    }

    #[test]
    fn try_clear_on_disk_bm_finishes_extent() {
        let dev = device(8);
        let peer_idx = dev.add_peer(Peer::new(0, 0, 1 << 20, 0, 8));
        dev.set_all_out_of_sync(peer_idx);
        let weight = {
            let core = dev.0.core.lock().unwrap();
            let first = geometry::bm_enr_to_first_bit(0);
            let last = geometry::bm_enr_to_last_bit(0);
            core.peers[peer_idx].bitmap.count_bits(first, last) as u32
        };
        dev.try_clear_on_disk_bm(peer_idx, 0, weight, true).unwrap();
        assert!(dev.extent_in_sync(peer_idx, 0));
    }
}
