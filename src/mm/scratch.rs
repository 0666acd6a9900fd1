//! Kernel Scratch Pages
//!
//! One page of kernel memory that receives copies of user data (file names,
//! command lines, write buffers) before any kernel logic looks at them.
//!
//! # Properties
//! - Contents are scrubbed with volatile writes when the page is dropped
//! - The scrub cannot be optimized away

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

use super::address::PAGE_SIZE;

/// A zero-initialised, page-sized kernel buffer that zeroes itself on drop.
pub struct ScratchPage {
    bytes: Box<[u8; PAGE_SIZE]>,
}

impl ScratchPage {
    /// Allocate a fresh zeroed page.
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0; PAGE_SIZE]),
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }

    /// Bytes up to (not including) the first NUL.
    pub fn c_str(&self) -> &[u8] {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PAGE_SIZE);
        &self.bytes[..end]
    }
}

impl Default for ScratchPage {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ScratchPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ScratchPage({} bytes)", PAGE_SIZE)
    }
}

impl Drop for ScratchPage {
    fn drop(&mut self) {
        for byte in self.bytes.iter_mut() {
            // SAFETY: `byte` is a valid, exclusive reference into the page.
            unsafe { ptr::write_volatile(byte, 0) };
        }
        compiler_fence(Ordering::SeqCst);
    }
}
