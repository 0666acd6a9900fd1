//! Victim selection.
//!
//! Both policies walk the circular sequence from the hand and leave the hand
//! just past the frame they pick. Neither evicts anything: unmapping and
//! write-back belong to the caller.

use log::trace;

use super::{FrameId, FrameTable};
use crate::config::DEFAULT_WS_WINDOW;
use crate::mm::address::{PhysAddr, VirtAddr};
use crate::mm::phys::PageSource;
use crate::process::Pid;

/// Recency indicators for a (process, virtual page) mapping.
///
/// Implemented by whatever owns the page tables; the frame table only knows
/// process identifiers.
pub trait AccessBits {
    fn is_accessed(&self, pid: Pid, vaddr: VirtAddr) -> bool;
    fn clear_accessed(&mut self, pid: Pid, vaddr: VirtAddr);
    fn is_dirty(&self, pid: Pid, vaddr: VirtAddr) -> bool;
}

/// Eviction strategy used by [`FrameTable::select_victim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Second-chance clock.
    Clock,
    /// Working-set clock: prefer clean frames unused for more than `window`
    /// epochs, then fall back to the clock rule.
    WsClock { window: u64 },
}

impl EvictionPolicy {
    /// Policy selected by the `wsclock` cargo feature.
    pub const fn build_default() -> Self {
        if cfg!(feature = "wsclock") {
            Self::WsClock {
                window: DEFAULT_WS_WINDOW,
            }
        } else {
            Self::Clock
        }
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::build_default()
    }
}

impl<P: PageSource> FrameTable<P> {
    /// Pick the frame to reclaim next, or `None` when the table is empty.
    ///
    /// The scan is bounded by two full passes. A frame already picked and
    /// not accessed since is passed over while any other candidate exists.
    pub fn select_victim<A: AccessBits>(&mut self, bits: &mut A) -> Option<PhysAddr> {
        let start = self.hand?;
        self.stats.victim_scans += 1;

        let victim = match self.policy {
            EvictionPolicy::Clock => self.clock_scan(bits),
            EvictionPolicy::WsClock { window } => self.wsclock_scan(bits, window),
        }
        .unwrap_or(start);

        let entry = self.entry_mut(victim);
        entry.reclaim_pending = true;
        let (paddr, next) = (entry.paddr, entry.next);
        self.hand = Some(next);

        trace!("frame: victim {} ({:?})", paddr, self.policy);
        Some(paddr)
    }

    /// Test-and-clear the accessed bits of every mapping of `id`.
    ///
    /// A hot frame is no longer a pending victim and counts as used now.
    fn take_accessed<A: AccessBits>(&mut self, id: FrameId, bits: &mut A) -> bool {
        let epoch = self.epoch;
        let entry = self.entry_mut(id);
        let mut hot = false;
        for r in &entry.refs {
            if bits.is_accessed(r.pid, r.vaddr) {
                bits.clear_accessed(r.pid, r.vaddr);
                hot = true;
            }
        }
        if hot {
            entry.last_used = epoch;
            entry.reclaim_pending = false;
        }
        hot
    }

    fn is_dirty<A: AccessBits>(&self, id: FrameId, bits: &A) -> bool {
        self.entry(id)
            .refs
            .iter()
            .any(|r| bits.is_dirty(r.pid, r.vaddr))
    }

    fn clock_scan<A: AccessBits>(&mut self, bits: &mut A) -> Option<FrameId> {
        let mut cursor = self.hand?;
        for _ in 0..2 * self.len {
            let next = self.entry(cursor).next;
            if !self.take_accessed(cursor, bits) && !self.entry(cursor).reclaim_pending {
                return Some(cursor);
            }
            cursor = next;
        }
        None
    }

    fn wsclock_scan<A: AccessBits>(&mut self, bits: &mut A, window: u64) -> Option<FrameId> {
        let mut cursor = self.hand?;
        let mut fallback = None;
        for _ in 0..2 * self.len {
            let next = self.entry(cursor).next;
            if !self.take_accessed(cursor, bits) && !self.entry(cursor).reclaim_pending {
                let age = self.epoch.saturating_sub(self.entry(cursor).last_used);
                if age > window && !self.is_dirty(cursor, bits) {
                    return Some(cursor);
                }
                fallback.get_or_insert(cursor);
            }
            cursor = next;
        }
        fallback
    }
}
