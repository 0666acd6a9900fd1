//! User Memory Access
//!
//! Translates user virtual addresses into kernel-accessible bytes and copies
//! data across the user/kernel boundary.
//!
//! # Principles
//! - Nothing supplied by user code is dereferenced before translation
//! - Translation is page-granular: each page is re-validated before it is
//!   read, so a range is consumed as a sequence of page spans
//! - Copies land in kernel buffers before any kernel logic inspects them
//! - A translation failure is a [`Fault`]; the dispatcher turns every fault
//!   into termination of the calling process

use crate::mm::address::{VirtAddr, PAGE_SIZE};
use crate::mm::paging::PageTable;
use crate::mm::phys::PageSource;

/// Reasons a user address cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// Address at or above the user/kernel boundary.
    #[error("user address {0} lies in kernel space")]
    KernelAddress(VirtAddr),
    /// No mapping for the page containing the address.
    #[error("user address {0} is not mapped")]
    Unmapped(VirtAddr),
    /// The page is mapped read-only but the kernel must write to it.
    #[error("user address {0} is not writable")]
    ReadOnly(VirtAddr),
    /// The range wraps around the address space.
    #[error("user range overflows the address space")]
    Overflow,
}

/// Read-only view of one process's user memory.
pub struct UserMemory<'a, P: PageSource> {
    table: &'a PageTable,
    memory: &'a P,
}

impl<P: PageSource> Clone for UserMemory<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: PageSource> Copy for UserMemory<'_, P> {}

impl<'a, P: PageSource> UserMemory<'a, P> {
    pub fn new(table: &'a PageTable, memory: &'a P) -> Self {
        Self { table, memory }
    }

    /// Translate `va` into the bytes from `va` to the end of its page.
    ///
    /// Rejects addresses at or above `USER_TOP` and unmapped pages.
    pub fn translate(&self, va: VirtAddr) -> Result<&'a [u8], Fault> {
        if !va.is_user() {
            return Err(Fault::KernelAddress(va));
        }
        let pa = self.table.translate(va).ok_or(Fault::Unmapped(va))?;
        let page = self
            .memory
            .page(pa.align_down())
            .ok_or(Fault::Unmapped(va))?;
        Ok(&page[pa.page_offset()..])
    }

    /// Page spans covering `len` bytes from `va`, translated lazily.
    pub fn spans(&self, va: VirtAddr, len: usize) -> UserSpans<'a, P> {
        UserSpans {
            mem: *self,
            cursor: Some(va),
            remaining: len,
        }
    }

    /// Check that every page of `[va, va + len)` translates.
    pub fn check_range(&self, va: VirtAddr, len: usize) -> Result<(), Fault> {
        self.spans(va, len).try_for_each(|span| span.map(drop))
    }

    /// Check that every page of `[va, va + len)` is mapped writable.
    pub fn check_writable(&self, va: VirtAddr, len: usize) -> Result<(), Fault> {
        let mut cursor = va;
        let mut remaining = len;
        while remaining > 0 {
            if !cursor.is_user() {
                return Err(Fault::KernelAddress(cursor));
            }
            let entry = self.table.entry(cursor).ok_or(Fault::Unmapped(cursor))?;
            if !entry.is_writable() {
                return Err(Fault::ReadOnly(cursor));
            }
            let n = cursor.bytes_to_page_end().min(remaining);
            remaining -= n;
            if remaining > 0 {
                cursor = cursor.checked_add(n).ok_or(Fault::Overflow)?;
            }
        }
        Ok(())
    }

    /// Copy exactly `dst.len()` bytes from `va`.
    pub fn copy_in(&self, va: VirtAddr, dst: &mut [u8]) -> Result<(), Fault> {
        let mut copied = 0;
        for span in self.spans(va, dst.len()) {
            let span = span?;
            dst[copied..copied + span.len()].copy_from_slice(span);
            copied += span.len();
        }
        Ok(())
    }

    /// Read one little-endian machine word at `va`.
    pub fn read_word(&self, va: VirtAddr) -> Result<u32, Fault> {
        let mut word = [0u8; 4];
        self.copy_in(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Copy the NUL-terminated string at `va` into `dst`.
    ///
    /// At most `dst.len() - 1` bytes are read; a longer string is truncated.
    /// `dst` is always NUL-terminated and the copied length (without the
    /// terminator) is returned. Each page is translated only when the copy
    /// reaches it, so no page past the terminator or the bound is touched.
    pub fn copy_in_str(&self, va: VirtAddr, dst: &mut [u8]) -> Result<usize, Fault> {
        let Some(limit) = dst.len().checked_sub(1) else {
            return Ok(0);
        };

        let mut copied = 0;
        for span in self.spans(va, limit) {
            let span = span?;
            let end = span.iter().position(|&b| b == 0);
            let chunk = &span[..end.unwrap_or(span.len())];
            dst[copied..copied + chunk.len()].copy_from_slice(chunk);
            copied += chunk.len();
            dst[copied] = 0;
            if end.is_some() {
                return Ok(copied);
            }
        }

        dst[copied] = 0;
        Ok(copied)
    }
}

/// Iterator over the page-sized spans of a user range.
///
/// Each item is the translated part of one page; translation of the next
/// page happens only when the next item is requested. Iteration stops after
/// the first fault.
pub struct UserSpans<'a, P: PageSource> {
    mem: UserMemory<'a, P>,
    cursor: Option<VirtAddr>,
    remaining: usize,
}

impl<'a, P: PageSource> Iterator for UserSpans<'a, P> {
    type Item = Result<&'a [u8], Fault>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let Some(va) = self.cursor else {
            self.remaining = 0;
            return Some(Err(Fault::Overflow));
        };

        match self.mem.translate(va) {
            Ok(page) => {
                let n = page.len().min(self.remaining);
                self.remaining -= n;
                self.cursor = va.checked_add(n);
                Some(Ok(&page[..n]))
            }
            Err(fault) => {
                self.remaining = 0;
                Some(Err(fault))
            }
        }
    }
}

/// Writable view of one process's user memory.
pub struct UserMemoryMut<'a, P: PageSource> {
    table: &'a PageTable,
    memory: &'a mut P,
}

impl<'a, P: PageSource> UserMemoryMut<'a, P> {
    pub fn new(table: &'a PageTable, memory: &'a mut P) -> Self {
        Self { table, memory }
    }

    /// Translate `va` for writing: the page must be mapped writable.
    pub fn translate_mut(&mut self, va: VirtAddr) -> Result<&mut [u8], Fault> {
        if !va.is_user() {
            return Err(Fault::KernelAddress(va));
        }
        let entry = self.table.entry(va).ok_or(Fault::Unmapped(va))?;
        if !entry.is_writable() {
            return Err(Fault::ReadOnly(va));
        }
        let page = self
            .memory
            .page_mut(entry.addr())
            .ok_or(Fault::Unmapped(va))?;
        Ok(&mut page[va.page_offset()..])
    }

    /// Check that every page of `[va, va + len)` is mapped writable.
    pub fn check_range(&self, va: VirtAddr, len: usize) -> Result<(), Fault> {
        UserMemory::new(self.table, &*self.memory).check_writable(va, len)
    }

    /// Copy `src` to user memory at `va`.
    ///
    /// The whole destination is validated first, so a fault leaves user
    /// memory untouched.
    pub fn copy_out(&mut self, va: VirtAddr, src: &[u8]) -> Result<(), Fault> {
        self.check_range(va, src.len())?;

        let mut cursor = va;
        let mut written = 0;
        while written < src.len() {
            let page = self.translate_mut(cursor)?;
            let n = page.len().min(src.len() - written);
            page[..n].copy_from_slice(&src[written..written + n]);
            written += n;
            if written < src.len() {
                cursor = cursor.checked_add(n).ok_or(Fault::Overflow)?;
            }
        }
        Ok(())
    }
}

/// Largest chunk the byte copier moves per step: one scratch page.
pub const CHUNK_SIZE: usize = PAGE_SIZE;
