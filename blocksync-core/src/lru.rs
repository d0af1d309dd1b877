//! Generic fixed-capacity LRU cache of extent slots.
//!
//! Both the activity log (keyed by AL extent number, payload `()`) and the
//! resync tracker (keyed by BM extent number, payload [`crate::resync::BmExtentState`])
//! are instances of this same collaborator: a fixed array of slots, looked
//! up by linear scan (mirroring the scan-for-LRU-victim idiom used
//! elsewhere in this crate for small, bounded caches), with refcounts and a
//! two-phase pending-change/commit protocol so that an eviction can be
//! journaled before it takes effect.

/// Sentinel meaning "this LRU slot holds no extent".
pub const LC_FREE: u32 = u32::MAX;

bitflags::bitflags! {
    /// Cache-wide condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LcFlags: u32 {
        /// The last `get` failed to find a free or evictable slot; callers
        /// should back off rather than spin.
        const STARVING = 1 << 0;
        /// The cache is locked for an in-flight transaction.
        const LOCKED   = 1 << 1;
    }
}

/// One slot in the LRU.
#[derive(Debug, Clone)]
pub struct Slot<T> {
    /// Extent number currently installed, or [`LC_FREE`].
    pub number: u32,
    /// Extent number that will be installed once the pending change
    /// commits; equal to `number` when there is no pending change.
    pub new_number: u32,
    /// Fixed index of this slot within the LRU (`lc_index`).
    pub index: u16,
    /// Number of live references (in-flight I/O) against this slot.
    pub refcnt: u32,
    /// Collaborator-specific payload (e.g. resync bookkeeping).
    pub data: T,
    last_access: u64,
}

impl<T> Slot<T> {
    /// Whether this slot has a pending, uncommitted change.
    pub fn has_pending_change(&self) -> bool {
        self.new_number != self.number
    }
}

/// Outcome of a [`Lru::get`] / [`Lru::try_get`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// Slot index acquired.
    pub index: u16,
    /// Whether this acquisition introduced a pending change requiring a
    /// transaction before the slot can be used.
    pub needs_transaction: bool,
}

/// A fixed-capacity LRU of extent slots, generic over a per-slot payload.
pub struct Lru<T> {
    slots: Vec<Slot<T>>,
    to_be_changed: Vec<u16>,
    max_pending_changes: u32,
    tx_locked: bool,
    clock: u64,
    flags: LcFlags,
}

impl<T: Default + Clone> Lru<T> {
    /// Create an LRU with `capacity` slots and a pending-change budget of
    /// `max_pending_changes` (normally `AL_UPDATES_PER_TRANSACTION`).
    pub fn new(capacity: u32, max_pending_changes: u32) -> Self {
        let slots = (0..capacity)
            .map(|i| Slot {
                number: LC_FREE,
                new_number: LC_FREE,
                index: i as u16,
                refcnt: 0,
                data: T::default(),
                last_access: 0,
            })
            .collect();
        Lru {
            slots,
            to_be_changed: Vec::new(),
            max_pending_changes,
            tx_locked: false,
            clock: 0,
            flags: LcFlags::empty(),
        }
    }

    /// Total slot count.
    pub fn nr_elements(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Count of slots currently holding a non-free extent.
    pub fn used(&self) -> u32 {
        self.slots.iter().filter(|s| s.number != LC_FREE).count() as u32
    }

    /// Number of slots with an uncommitted pending change.
    pub fn pending_changes(&self) -> u32 {
        self.to_be_changed.len() as u32
    }

    /// Budget of pending changes one transaction may carry.
    pub fn max_pending_changes(&self) -> u32 {
        self.max_pending_changes
    }

    /// Current cache-wide condition flags.
    pub fn flags(&self) -> LcFlags {
        self.flags
    }

    /// Borrow a slot by its fixed index.
    pub fn element_by_index(&self, index: u16) -> &Slot<T> {
        &self.slots[index as usize]
    }

    /// Mutably borrow a slot by its fixed index.
    pub fn element_by_index_mut(&mut self, index: u16) -> &mut Slot<T> {
        &mut self.slots[index as usize]
    }

    /// Whether the slot at `index` has a live reference.
    pub fn is_used(&self, index: u16) -> bool {
        self.slots[index as usize].refcnt > 0
    }

    /// Find the slot currently holding `number`, without acquiring it.
    pub fn find(&self, number: u32) -> Option<u16> {
        self.slots
            .iter()
            .find(|s| s.number == number)
            .map(|s| s.index)
    }

    fn bump_access(&mut self, index: u16) {
        self.clock += 1;
        self.slots[index as usize].last_access = self.clock;
    }

    fn find_victim(&self) -> Option<u16> {
        self.slots
            .iter()
            .filter(|s| s.refcnt == 0 && !s.has_pending_change())
            .min_by_key(|s| s.last_access)
            .map(|s| s.index)
    }

    /// Acquire `number`, non-blocking: succeeds only if a hit, or a slot
    /// can be evicted within the pending-change budget. Never sleeps.
    pub fn try_get(&mut self, number: u32) -> Option<Acquired> {
        self.get_impl(number, true)
    }

    /// Acquire `number`; identical contract to [`Lru::try_get`] in this
    /// implementation (blocking is implemented by the caller retrying
    /// after waiting on the device's waitset, not internally here).
    pub fn get(&mut self, number: u32) -> Option<Acquired> {
        self.get_impl(number, false)
    }

    fn get_impl(&mut self, number: u32, nonblock: bool) -> Option<Acquired> {
        if let Some(index) = self.find(number) {
            self.bump_access(index);
            self.slots[index as usize].refcnt += 1;
            self.flags.remove(LcFlags::STARVING);
            return Some(Acquired {
                index,
                needs_transaction: false,
            });
        }

        if nonblock && self.pending_changes() >= self.max_pending_changes {
            self.flags.insert(LcFlags::STARVING);
            return None;
        }

        let index = self.find_victim()?;
        self.bump_access(index);
        let slot = &mut self.slots[index as usize];
        slot.new_number = number;
        slot.refcnt += 1;
        self.to_be_changed.push(index);
        self.flags.remove(LcFlags::STARVING);
        Some(Acquired {
            index,
            needs_transaction: true,
        })
    }

    /// Bump a hit on an already-installed slot without going through
    /// [`Lru::get`]'s lookup (the activity log's fast path already knows
    /// the index).
    pub fn bump_hit(&mut self, index: u16) {
        self.bump_access(index);
        self.slots[index as usize].refcnt += 1;
        self.flags.remove(LcFlags::STARVING);
    }

    /// Release one reference on `index`. Returns the slot's new refcount.
    pub fn put(&mut self, index: u16) -> u32 {
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.refcnt > 0, "refcount underflow on lc slot");
        slot.refcnt = slot.refcnt.saturating_sub(1);
        slot.refcnt
    }

    /// Indices with an uncommitted pending change, in commit order.
    pub fn to_be_changed(&self) -> &[u16] {
        &self.to_be_changed
    }

    /// Commit all pending changes: `number` becomes `new_number` for every
    /// slot named in `to_be_changed`.
    pub fn committed(&mut self) {
        for index in self.to_be_changed.drain(..) {
            let slot = &mut self.slots[index as usize];
            slot.number = slot.new_number;
        }
    }

    /// Abort all pending changes: `new_number` reverts to `number`, and the
    /// reference taken in [`Lru::get`]/[`Lru::try_get`] is released.
    pub fn cancel(&mut self) {
        for index in self.to_be_changed.drain(..) {
            let slot = &mut self.slots[index as usize];
            slot.new_number = slot.number;
            slot.refcnt = slot.refcnt.saturating_sub(1);
        }
    }

    /// Commit only the indices in `batch` (a prior [`Lru::to_be_changed`]
    /// snapshot), leaving any entries pushed after that snapshot untouched.
    /// Needed because a transaction writer drops the device lock across the
    /// actual disk write, during which another caller may have pushed new
    /// entries onto `to_be_changed` that were never part of the buffer just
    /// written; a plain [`Lru::committed`] would wrongly mark those as done.
    pub fn commit_batch(&mut self, batch: &[u16]) {
        for &index in batch {
            let slot = &mut self.slots[index as usize];
            slot.number = slot.new_number;
        }
        self.to_be_changed.retain(|i| !batch.contains(i));
    }

    /// Abort only the indices in `batch`; see [`Lru::commit_batch`].
    pub fn cancel_batch(&mut self, batch: &[u16]) {
        for &index in batch {
            let slot = &mut self.slots[index as usize];
            slot.new_number = slot.number;
            slot.refcnt = slot.refcnt.saturating_sub(1);
        }
        self.to_be_changed.retain(|i| !batch.contains(i));
    }

    /// Try to become the single committer for the next transaction
    /// (test-and-set).
    pub fn try_lock_for_transaction(&mut self) -> bool {
        if self.tx_locked {
            false
        } else {
            self.tx_locked = true;
            self.flags.insert(LcFlags::LOCKED);
            true
        }
    }

    /// Release the transaction lock taken by
    /// [`Lru::try_lock_for_transaction`].
    pub fn unlock(&mut self) {
        self.tx_locked = false;
        self.flags.remove(LcFlags::LOCKED);
    }

    /// Unconditionally clear every slot (`rs_cancel_all`): used when a
    /// resync is being abandoned and no persistence of the current state
    /// is required.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.number = LC_FREE;
            slot.new_number = LC_FREE;
            slot.refcnt = 0;
            slot.data = T::default();
        }
        self.to_be_changed.clear();
        self.flags = LcFlags::empty();
    }

    /// Gracefully remove every slot, refusing if any still has a live
    /// reference (`rs_del_all`).
    pub fn del_all(&mut self) -> bool {
        if self.slots.iter().any(|s| s.refcnt > 0) {
            return false;
        }
        self.reset();
        true
    }

    /// Drop every installed slot whose refcount is zero (`shrink`).
    /// Returns the count of slots cleared.
    pub fn shrink_unreferenced(&mut self) -> u32 {
        let mut cleared = 0;
        for slot in &mut self.slots {
            if slot.number != LC_FREE && slot.refcnt == 0 && !slot.has_pending_change() {
                slot.number = LC_FREE;
                slot.new_number = LC_FREE;
                slot.data = T::default();
                cleared += 1;
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_increments_refcount_without_transaction() {
        let mut lru: Lru<()> = Lru::new(2, 64);
        let a = lru.get(5).unwrap();
        assert!(a.needs_transaction);
        lru.committed();
        let b = lru.get(5).unwrap();
        assert!(!b.needs_transaction);
        assert_eq!(a.index, b.index);
    }

    #[test]
    fn eviction_requires_transaction_and_commit() {
        let mut lru: Lru<()> = Lru::new(1, 64);
        let a = lru.get(1).unwrap();
        lru.committed();
        lru.put(a.index);

        let b = lru.get(2).unwrap();
        assert!(b.needs_transaction);
        assert_eq!(lru.pending_changes(), 1);
        lru.committed();
        assert_eq!(lru.find(2), Some(b.index));
        assert_eq!(lru.find(1), None);
    }

    #[test]
    fn cancel_reverts_pending_change_and_refcount() {
        let mut lru: Lru<()> = Lru::new(1, 64);
        let a = lru.get(9).unwrap();
        lru.cancel();
        assert_eq!(lru.element_by_index(a.index).refcnt, 0);
        assert_eq!(lru.find(9), None);
    }

    #[test]
    fn no_victim_when_all_referenced() {
        let mut lru: Lru<()> = Lru::new(1, 64);
        lru.get(1).unwrap();
        lru.committed();
        assert!(lru.get(2).is_none());
    }

    #[test]
    fn transaction_lock_is_exclusive() {
        let mut lru: Lru<()> = Lru::new(1, 64);
        assert!(lru.try_lock_for_transaction());
        assert!(!lru.try_lock_for_transaction());
        lru.unlock();
        assert!(lru.try_lock_for_transaction());
    }
}
