//! Address types and the user/kernel split
//!
//! Frames and user pages are named by distinct newtypes so a user pointer
//! can never be handed to the page pool, or a frame to the translator.
//!
//! # Address Space Layout
//! - User space: `[0, USER_TOP)`
//! - Kernel space: `[USER_TOP, usize::MAX]`
//! - User frames are handed out from a pool starting at `USER_POOL_BASE`

use core::fmt;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// First address that belongs to the kernel. Every user address is strictly
/// below this boundary.
pub const USER_TOP: usize = 0xC000_0000;

/// Physical address of the first frame in the user page pool.
pub const USER_POOL_BASE: usize = 0x0010_0000;

/// Address of a byte of user-pool memory.
///
/// Physical addresses cannot be dereferenced directly; the kernel reaches
/// frame contents through a [`PageSource`](super::phys::PageSource).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Start of the frame containing this address.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// The address `offset` bytes further on. Frame addresses never come
    /// near `usize::MAX`, so this does not check for overflow.
    #[inline]
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A virtual memory address as seen by a user process.
///
/// Nothing about a `VirtAddr` says it is safe to touch: user-supplied values
/// have to go through the translator in [`crate::syscall::uaccess`] first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Start of the user page containing this address.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Virtual page number, the key page tables are indexed by.
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// First address of virtual page `vpn`.
    #[inline]
    pub const fn from_page_number(vpn: usize) -> Self {
        Self(vpn << PAGE_SHIFT)
    }

    /// Number of bytes from this address to the end of its page.
    #[inline]
    pub const fn bytes_to_page_end(self) -> usize {
        PAGE_SIZE - self.page_offset()
    }

    /// Add an offset, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// At or above the user/kernel split.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        !self.is_user()
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < USER_TOP
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_kernel_split() {
        assert!(VirtAddr::new(USER_TOP - 1).is_user());
        assert!(VirtAddr::new(USER_TOP).is_kernel());
        assert!(!VirtAddr::new(USER_TOP).is_user());
    }

    #[test]
    fn test_offsets_within_page() {
        let addr = PhysAddr::new(0x0010_1234);
        assert_eq!(addr.page_offset(), 0x234);
        assert!(addr.align_down().is_aligned());
        assert_eq!(addr.align_down().offset(0x234), addr);

        let va = VirtAddr::new(0x0804_8ffe);
        assert_eq!(va.bytes_to_page_end(), 2);
        assert_eq!(va.align_down(), VirtAddr::new(0x0804_8000));
        assert_eq!(VirtAddr::from_page_number(va.page_number()), va.align_down());
    }

    #[test]
    fn test_checked_add_overflow() {
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
        assert_eq!(
            VirtAddr::new(0x1000).checked_add(0x10),
            Some(VirtAddr::new(0x1010))
        );
    }
}
