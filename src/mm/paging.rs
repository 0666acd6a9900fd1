//! Per-Process Page Tables
//!
//! Maps user virtual pages to frames handed out by the frame table and
//! carries the hardware-style accessed/dirty indicators the eviction
//! policies read.
//!
//! # Properties
//! - Only user addresses (below `USER_TOP`) can be mapped
//! - Mappings are page-granular; both addresses must be aligned
//! - Kernel translation never sets accessed/dirty bits

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use super::address::{PhysAddr, VirtAddr};

bitflags! {
    /// Page table entry flags, laid out like the x86 PTE low bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Entry maps a frame.
        const PRESENT = 1 << 0;
        /// User code may write through this mapping.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;
        /// Set by the MMU on any access.
        const ACCESSED = 1 << 5;
        /// Set by the MMU on write.
        const DIRTY = 1 << 6;

        /// Read-only user page.
        const USER_RO = Self::PRESENT.bits() | Self::USER.bits();
        /// Read/write user page.
        const USER_RW = Self::USER_RO.bits() | Self::WRITABLE.bits();
    }
}

/// A single page table entry: the mapped frame plus its flags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    frame: PhysAddr,
    flags: PageFlags,
}

impl PageTableEntry {
    #[inline]
    pub const fn page(frame: PhysAddr, flags: PageFlags) -> Self {
        Self { frame, flags }
    }

    /// Frame this entry maps.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        self.frame
    }

    #[inline]
    pub const fn flags(self) -> PageFlags {
        self.flags
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE(addr={}, flags={:?})", self.frame, self.flags)
    }
}

/// Sparse page table for one user address space, keyed by virtual page number.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<usize, PageTableEntry>,
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Map the user page at `virt` to `frame`.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        frame: PhysAddr,
        writable: bool,
    ) -> Result<(), MappingError> {
        if !virt.is_user() {
            return Err(MappingError::KernelAddress);
        }

        if !virt.is_aligned() || !frame.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }

        if self.entries.contains_key(&virt.page_number()) {
            return Err(MappingError::AlreadyMapped);
        }

        let flags = if writable {
            PageFlags::USER_RW
        } else {
            PageFlags::USER_RO
        };
        self.entries
            .insert(virt.page_number(), PageTableEntry::page(frame, flags));
        Ok(())
    }

    /// Remove the mapping for the page containing `virt`, returning its frame.
    pub fn unmap(&mut self, virt: VirtAddr) -> Result<PhysAddr, MappingError> {
        self.entries
            .remove(&virt.page_number())
            .map(PageTableEntry::addr)
            .ok_or(MappingError::NotMapped)
    }

    /// Entry for the page containing `virt`.
    #[inline]
    pub fn entry(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        self.entries.get(&virt.page_number()).copied()
    }

    /// Translate `virt` to the physical address it maps to, offset included.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.entry(virt)
            .map(|entry| entry.addr().offset(virt.page_offset()))
    }

    /// Whether the page containing `virt` is mapped.
    #[inline]
    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.entries.contains_key(&virt.page_number())
    }

    /// Record a user access the way the MMU would.
    pub fn touch(&mut self, virt: VirtAddr, write: bool) {
        if let Some(entry) = self.entries.get_mut(&virt.page_number()) {
            entry.flags |= PageFlags::ACCESSED;
            if write {
                entry.flags |= PageFlags::DIRTY;
            }
        }
    }

    pub fn is_accessed(&self, virt: VirtAddr) -> bool {
        self.entry(virt)
            .is_some_and(|e| e.flags.contains(PageFlags::ACCESSED))
    }

    pub fn is_dirty(&self, virt: VirtAddr) -> bool {
        self.entry(virt)
            .is_some_and(|e| e.flags.contains(PageFlags::DIRTY))
    }

    /// Clear the accessed bit of the page containing `virt`.
    pub fn clear_accessed(&mut self, virt: VirtAddr) {
        if let Some(entry) = self.entries.get_mut(&virt.page_number()) {
            entry.flags.remove(PageFlags::ACCESSED);
        }
    }

    /// Iterate over all mappings as (page address, entry).
    pub fn iter(&self) -> impl Iterator<Item = (VirtAddr, PageTableEntry)> + '_ {
        self.entries.iter().map(|(&vpn, &entry)| {
            (VirtAddr::from_page_number(vpn), entry)
        })
    }

    /// Drop every mapping, returning the (page, frame) pairs that were mapped.
    pub fn clear(&mut self) -> impl Iterator<Item = (VirtAddr, PhysAddr)> {
        core::mem::take(&mut self.entries)
            .into_iter()
            .map(|(vpn, entry)| {
                (VirtAddr::from_page_number(vpn), entry.addr())
            })
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a mapping change was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// The page already has a mapping.
    #[error("virtual address already mapped")]
    AlreadyMapped,
    #[error("virtual address not mapped")]
    NotMapped,
    /// A page or frame address was not page-aligned.
    #[error("address not properly aligned")]
    MisalignedAddress,
    /// Attempted to map a kernel address into a user page table.
    #[error("address lies in kernel space")]
    KernelAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::USER_TOP;

    #[test]
    fn test_map_translate_unmap() {
        let mut pt = PageTable::new();
        let va = VirtAddr::new(0x0804_8000);
        let pa = PhysAddr::new(0x0010_3000);

        pt.map(va, pa, true).unwrap();
        assert_eq!(
            pt.translate(VirtAddr::new(0x0804_8123)),
            Some(PhysAddr::new(0x0010_3123))
        );
        assert_eq!(pt.map(va, pa, false), Err(MappingError::AlreadyMapped));
        assert_eq!(pt.unmap(va), Ok(pa));
        assert_eq!(pt.unmap(va), Err(MappingError::NotMapped));
        assert!(pt.translate(va).is_none());
    }

    #[test]
    fn test_rejects_kernel_and_misaligned() {
        let mut pt = PageTable::new();
        let pa = PhysAddr::new(0x0010_0000);
        assert_eq!(
            pt.map(VirtAddr::new(USER_TOP), pa, true),
            Err(MappingError::KernelAddress)
        );
        assert_eq!(
            pt.map(VirtAddr::new(0x1001), pa, true),
            Err(MappingError::MisalignedAddress)
        );
    }

    #[test]
    fn test_access_bits() {
        let mut pt = PageTable::new();
        let va = VirtAddr::new(0x1000);
        pt.map(va, PhysAddr::new(0x0010_0000), true).unwrap();
        assert!(!pt.is_accessed(va));

        pt.touch(VirtAddr::new(0x1ff0), true);
        assert!(pt.is_accessed(va));
        assert!(pt.is_dirty(va));

        pt.clear_accessed(va);
        assert!(!pt.is_accessed(va));
        assert!(pt.is_dirty(va));
    }
}
