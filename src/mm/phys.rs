//! User Page Pool
//!
//! The pages user frames are carved from. The pool is a block of host memory
//! with one occupancy bit per page, so the whole kernel core runs hosted.
//!
//! # Properties
//! - Pages are zeroed when they are acquired
//! - Releasing a page twice, or one the pool never owned, panics

use alloc::vec;
use alloc::vec::Vec;

use super::address::{PhysAddr, PAGE_SHIFT, PAGE_SIZE, USER_POOL_BASE};

/// Source of physical pages for the frame table.
///
/// This is the page allocator the frame table sits on top of. It also gives
/// the kernel access to frame contents, since physical addresses cannot be
/// dereferenced directly.
pub trait PageSource {
    /// Take one free page and zero it. `None` when the pool is exhausted.
    fn acquire_zeroed_page(&mut self) -> Option<PhysAddr>;

    /// Return a page previously handed out by `acquire_zeroed_page`.
    fn release_page(&mut self, page: PhysAddr);

    /// Contents of the page containing `page`, if it belongs to this source.
    fn page(&self, page: PhysAddr) -> Option<&[u8]>;

    /// Mutable contents of the page containing `page`.
    fn page_mut(&mut self, page: PhysAddr) -> Option<&mut [u8]>;
}

/// Bitmap-managed pool of user frames backed by host memory.
pub struct PhysMemory {
    base: PhysAddr,
    /// One bit per page, set while the page is handed out.
    bitmap: Vec<u8>,
    /// Page contents, `PAGE_SIZE` bytes each.
    frames: Vec<u8>,
    free_count: usize,
    total_frames: usize,
}

impl PhysMemory {
    /// Create a pool of `frames` pages starting at [`USER_POOL_BASE`].
    pub fn new(frames: usize) -> Self {
        Self::with_base(PhysAddr::new(USER_POOL_BASE), frames)
    }

    /// Create a pool of `frames` pages starting at `base`.
    ///
    /// # Panics
    /// Panics if `base` is not page-aligned.
    pub fn with_base(base: PhysAddr, frames: usize) -> Self {
        assert!(base.is_aligned(), "Unaligned user pool base: {:?}", base);

        Self {
            base,
            bitmap: vec![0; frames.div_ceil(8)],
            frames: vec![0; frames * PAGE_SIZE],
            free_count: frames,
            total_frames: frames,
        }
    }

    /// Bitmap byte and mask for `frame`.
    #[inline]
    const fn bit(frame: usize) -> (usize, u8) {
        (frame / 8, 1 << (frame % 8))
    }

    fn mark(&mut self, frame: usize, in_use: bool) {
        let (byte, mask) = Self::bit(frame);
        if in_use {
            self.bitmap[byte] |= mask;
            self.free_count -= 1;
        } else {
            self.bitmap[byte] &= !mask;
            self.free_count += 1;
        }
    }

    /// Frames past the end of the pool read as taken.
    #[inline]
    fn is_allocated(&self, frame: usize) -> bool {
        let (byte, mask) = Self::bit(frame);
        self.bitmap.get(byte).map_or(true, |b| b & mask != 0)
    }

    /// Frame index of `addr` inside this pool.
    fn frame_index(&self, addr: PhysAddr) -> Option<usize> {
        let offset = addr.as_usize().checked_sub(self.base.as_usize())?;
        let frame = offset >> PAGE_SHIFT;
        (frame < self.total_frames).then_some(frame)
    }

    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Total number of frames in the pool.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Whether `addr` is a frame currently handed out by this pool.
    pub fn is_in_use(&self, addr: PhysAddr) -> bool {
        self.frame_index(addr)
            .is_some_and(|frame| self.is_allocated(frame))
    }
}

impl PageSource for PhysMemory {
    fn acquire_zeroed_page(&mut self) -> Option<PhysAddr> {
        if self.free_count == 0 {
            return None;
        }

        let frame = (0..self.total_frames).find(|&frame| !self.is_allocated(frame))?;
        self.mark(frame, true);

        let start = frame * PAGE_SIZE;
        self.frames[start..start + PAGE_SIZE].fill(0);

        Some(self.base.offset(frame << PAGE_SHIFT))
    }

    fn release_page(&mut self, page: PhysAddr) {
        assert!(page.is_aligned(), "Release of unaligned page {:?}", page);
        let Some(frame) = self.frame_index(page) else {
            panic!("Release of page outside the pool: {:?}", page);
        };
        if !self.is_allocated(frame) {
            panic!("Double free detected for frame: {:?}", page);
        }
        self.mark(frame, false);
    }

    fn page(&self, page: PhysAddr) -> Option<&[u8]> {
        let frame = self.frame_index(page)?;
        let start = frame * PAGE_SIZE;
        Some(&self.frames[start..start + PAGE_SIZE])
    }

    fn page_mut(&mut self, page: PhysAddr) -> Option<&mut [u8]> {
        let frame = self.frame_index(page)?;
        let start = frame * PAGE_SIZE;
        Some(&mut self.frames[start..start + PAGE_SIZE])
    }
}
