//! Frame Table
//!
//! Registry of every frame currently loaned to user processes. Entries live
//! in an arena addressed by [`FrameId`] and are linked into a circular
//! sequence; a persistent hand marks where the eviction scan resumes.
//!
//! # Invariants
//! - Every live entry holds at least one [`FrameRef`]; the entry is unlinked
//!   and its page returned to the pool in the same call that drops the last
//!   reference
//! - A (process, virtual address) pair is referenced by at most one entry
//! - The hand is `Some` exactly when the table is non-empty and always names
//!   a live entry
//!
//! The table carries no lock of its own. Callers that share it wrap the whole
//! table in one mutex, since scanning, hand movement and relinking are not
//! safe to interleave.

mod eviction;

use alloc::vec::Vec;

use log::{debug, error, trace, warn};

pub use eviction::{AccessBits, EvictionPolicy};

use super::address::{PhysAddr, VirtAddr};
use super::phys::PageSource;
use crate::process::Pid;

/// Stable handle of a frame table entry inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

/// One (process, virtual address) mapping of a frame.
///
/// The process is named by identifier only; the table never owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub pid: Pid,
    pub vaddr: VirtAddr,
}

/// Bookkeeping record for one live frame.
#[derive(Debug)]
pub struct FrameEntry {
    paddr: PhysAddr,
    refs: Vec<FrameRef>,
    /// Epoch of the last observed use (allocation or accessed bit).
    last_used: u64,
    /// Selected as a victim and not accessed since.
    reclaim_pending: bool,
    prev: FrameId,
    next: FrameId,
}

impl FrameEntry {
    #[inline]
    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Number of distinct mappings of this frame.
    #[inline]
    pub fn reference_count(&self) -> usize {
        self.refs.len()
    }

    #[inline]
    pub fn references(&self) -> &[FrameRef] {
        &self.refs
    }

    #[inline]
    pub fn last_used(&self) -> u64 {
        self.last_used
    }
}

/// Counters describing frame table activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames handed out.
    pub allocated: u64,
    /// Frames returned to the pool.
    pub freed: u64,
    /// Victim selections performed.
    pub victim_scans: u64,
}

/// Outcome of [`FrameTable::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The table does not track this frame.
    Untracked,
    /// The frame is tracked but the caller holds no reference to it.
    NotReferenced,
    /// The caller's reference was dropped; others remain.
    Shared { remaining: usize },
    /// The last reference was dropped and the page went back to the pool.
    Freed,
}

/// Error type for frame table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The pool is exhausted and reclaiming the victim is not supported.
    #[error("out of frames (victim: {victim:?})")]
    OutOfFrames { victim: Option<PhysAddr> },
    /// Allocating bookkeeping for the entry or reference failed.
    #[error("no memory for frame bookkeeping")]
    NoMemory,
    /// The (process, address) pair already references a frame.
    #[error("{pid} already maps a frame at {vaddr}")]
    DuplicateReference { pid: Pid, vaddr: VirtAddr },
    /// No live entry owns this frame.
    #[error("frame {0} is not tracked")]
    NotTracked(PhysAddr),
}

/// Circular registry of user frames on top of a [`PageSource`].
pub struct FrameTable<P: PageSource> {
    pool: P,
    slots: Vec<Option<FrameEntry>>,
    vacant: Vec<FrameId>,
    hand: Option<FrameId>,
    len: usize,
    policy: EvictionPolicy,
    epoch: u64,
    stats: FrameStats,
}

impl<P: PageSource> FrameTable<P> {
    /// Create an empty table drawing pages from `pool`.
    pub fn new(pool: P, policy: EvictionPolicy) -> Self {
        Self {
            pool,
            slots: Vec::new(),
            vacant: Vec::new(),
            hand: None,
            len: 0,
            policy,
            epoch: 0,
            stats: FrameStats::default(),
        }
    }

    /// Obtain a zero-filled frame for `vaddr` in process `pid`.
    ///
    /// Zeroing is left to [`PageSource::acquire_zeroed_page`].
    ///
    /// When the pool is exhausted a victim is selected once and reported in
    /// [`FrameError::OutOfFrames`]; reclaiming it needs swap, which this
    /// table does not do.
    pub fn allocate<A: AccessBits>(
        &mut self,
        pid: Pid,
        vaddr: VirtAddr,
        bits: &mut A,
    ) -> Result<PhysAddr, FrameError> {
        if self.find_reference(pid, vaddr).is_some() {
            return Err(FrameError::DuplicateReference { pid, vaddr });
        }

        let Some(paddr) = self.pool.acquire_zeroed_page() else {
            let victim = self.select_victim(bits);
            error!(
                "frame: out of frames for {} at {}, victim {:?} needs swap",
                pid, vaddr, victim
            );
            return Err(FrameError::OutOfFrames { victim });
        };

        let mut refs = Vec::new();
        if refs.try_reserve_exact(1).is_err() {
            self.pool.release_page(paddr);
            return Err(FrameError::NoMemory);
        }
        refs.push(FrameRef { pid, vaddr });

        let id = match self.vacant_slot() {
            Some(id) => id,
            None => {
                self.pool.release_page(paddr);
                return Err(FrameError::NoMemory);
            }
        };

        self.epoch += 1;
        self.slots[id.0] = Some(FrameEntry {
            paddr,
            refs,
            last_used: self.epoch,
            reclaim_pending: false,
            prev: id,
            next: id,
        });
        self.link_tail(id);
        self.stats.allocated += 1;

        debug!("frame: {} -> {} for {}", vaddr, paddr, pid);
        Ok(paddr)
    }

    /// Add a reference from (`pid`, `vaddr`) to the live frame `paddr`.
    pub fn share(&mut self, paddr: PhysAddr, pid: Pid, vaddr: VirtAddr) -> Result<(), FrameError> {
        if self.find_reference(pid, vaddr).is_some() {
            return Err(FrameError::DuplicateReference { pid, vaddr });
        }

        let id = self.find(paddr).ok_or(FrameError::NotTracked(paddr))?;
        let entry = self.entry_mut(id);
        entry
            .refs
            .try_reserve(1)
            .map_err(|_| FrameError::NoMemory)?;
        entry.refs.push(FrameRef { pid, vaddr });

        trace!("frame: {} shared with {} at {}", paddr, pid, vaddr);
        Ok(())
    }

    /// Drop the first reference `pid` holds on `paddr`.
    ///
    /// Releasing a frame the table does not track is a no-op.
    pub fn release(&mut self, pid: Pid, paddr: PhysAddr) -> Release {
        let Some(id) = self.find(paddr) else {
            trace!("frame: release of untracked {}", paddr);
            return Release::Untracked;
        };

        self.drop_reference(id, |r| r.pid == pid)
    }

    /// Drop the reference for the mapping (`pid`, `vaddr`) of `paddr`.
    ///
    /// Unlike [`release`](Self::release), this picks the exact mapping when
    /// one process maps the same frame at several addresses.
    pub fn release_mapping(&mut self, pid: Pid, vaddr: VirtAddr, paddr: PhysAddr) -> Release {
        let Some(id) = self.find(paddr) else {
            trace!("frame: release of untracked {}", paddr);
            return Release::Untracked;
        };
        self.drop_reference(id, |r| r.pid == pid && r.vaddr == vaddr)
    }

    /// Remove the first reference of `id` matching `matches`, freeing the
    /// entry once no reference is left.
    fn drop_reference(&mut self, id: FrameId, matches: impl Fn(&FrameRef) -> bool) -> Release {
        let entry = self.entry_mut(id);
        let Some(pos) = entry.refs.iter().position(matches) else {
            warn!("frame: {} released by a mapping that does not reference it", entry.paddr);
            return Release::NotReferenced;
        };
        entry.refs.remove(pos);

        let remaining = entry.refs.len();
        if remaining > 0 {
            return Release::Shared { remaining };
        }

        self.free_entry(id);
        Release::Freed
    }

    /// Drop every reference held by `pid`. Returns the number of frames
    /// that went back to the pool.
    pub fn release_process(&mut self, pid: Pid) -> usize {
        let ids: Vec<FrameId> = self
            .ring()
            .filter(|&id| self.entry(id).refs.iter().any(|r| r.pid == pid))
            .collect();

        let mut freed = 0;
        for id in ids {
            let entry = self.entry_mut(id);
            entry.refs.retain(|r| r.pid != pid);
            if entry.refs.is_empty() {
                self.free_entry(id);
                freed += 1;
            }
        }

        debug!("frame: {} teardown freed {} frames", pid, freed);
        freed
    }

    /// Advance the logical clock by `ticks`.
    pub fn advance_clock(&mut self, ticks: u64) {
        self.epoch += ticks;
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of live frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    #[inline]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Frame under the clock hand.
    pub fn hand(&self) -> Option<PhysAddr> {
        self.hand.map(|id| self.entry(id).paddr)
    }

    /// Entry owning `paddr`.
    pub fn get(&self, paddr: PhysAddr) -> Option<&FrameEntry> {
        self.find(paddr).map(|id| self.entry(id))
    }

    pub fn contains(&self, paddr: PhysAddr) -> bool {
        self.find(paddr).is_some()
    }

    pub fn reference_count(&self, paddr: PhysAddr) -> Option<usize> {
        self.get(paddr).map(FrameEntry::reference_count)
    }

    /// Live entries in circular order, starting at the hand.
    pub fn iter(&self) -> impl Iterator<Item = &FrameEntry> + '_ {
        self.ring().map(|id| self.entry(id))
    }

    /// The page pool backing this table.
    #[inline]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    #[inline]
    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    /// Arena ids in circular order starting at the hand.
    fn ring(&self) -> Ring<'_, P> {
        Ring {
            table: self,
            cursor: self.hand,
            remaining: self.len,
        }
    }

    /// Linear scan from the hand for the entry owning `paddr`.
    fn find(&self, paddr: PhysAddr) -> Option<FrameId> {
        self.ring().find(|&id| self.entry(id).paddr == paddr)
    }

    fn find_reference(&self, pid: Pid, vaddr: VirtAddr) -> Option<FrameId> {
        self.ring().find(|&id| {
            self.entry(id)
                .refs
                .iter()
                .any(|r| r.pid == pid && r.vaddr == vaddr)
        })
    }

    fn entry(&self, id: FrameId) -> &FrameEntry {
        match self.slots.get(id.0).and_then(Option::as_ref) {
            Some(entry) => entry,
            None => panic!("frame table slot {} is vacant", id.0),
        }
    }

    fn entry_mut(&mut self, id: FrameId) -> &mut FrameEntry {
        match self.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(entry) => entry,
            None => panic!("frame table slot {} is vacant", id.0),
        }
    }

    /// Reserve an arena slot, reusing vacated ones first.
    fn vacant_slot(&mut self) -> Option<FrameId> {
        if let Some(id) = self.vacant.pop() {
            return Some(id);
        }
        self.slots.try_reserve(1).ok()?;
        self.vacant.try_reserve(1).ok()?;
        self.slots.push(None);
        Some(FrameId(self.slots.len() - 1))
    }

    /// Insert `id` at the tail of the sequence, just behind the hand.
    fn link_tail(&mut self, id: FrameId) {
        match self.hand {
            None => {
                let entry = self.entry_mut(id);
                entry.prev = id;
                entry.next = id;
                self.hand = Some(id);
            }
            Some(head) => {
                let tail = self.entry(head).prev;
                let entry = self.entry_mut(id);
                entry.prev = tail;
                entry.next = head;
                self.entry_mut(tail).next = id;
                self.entry_mut(head).prev = id;
            }
        }
        self.len += 1;
    }

    /// Unlink `id`, moving the hand to the next live entry if it pointed here.
    fn unlink(&mut self, id: FrameId) -> FrameEntry {
        let entry = match self.slots.get_mut(id.0).and_then(Option::take) {
            Some(entry) => entry,
            None => panic!("frame table slot {} is vacant", id.0),
        };

        if entry.next == id {
            self.hand = None;
        } else {
            self.entry_mut(entry.prev).next = entry.next;
            self.entry_mut(entry.next).prev = entry.prev;
            if self.hand == Some(id) {
                self.hand = Some(entry.next);
            }
        }

        self.vacant.push(id);
        self.len -= 1;
        entry
    }

    fn free_entry(&mut self, id: FrameId) {
        let entry = self.unlink(id);
        self.pool.release_page(entry.paddr);
        self.stats.freed += 1;
        debug!("frame: {} returned to pool", entry.paddr);
    }
}

/// Iterator over arena ids in circular order, visiting each live entry once.
struct Ring<'a, P: PageSource> {
    table: &'a FrameTable<P>,
    cursor: Option<FrameId>,
    remaining: usize,
}

impl<P: PageSource> Iterator for Ring<'_, P> {
    type Item = FrameId;

    fn next(&mut self) -> Option<FrameId> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.cursor?;
        self.cursor = Some(self.table.entry(id).next);
        self.remaining -= 1;
        Some(id)
    }
}
