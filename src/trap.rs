//! Trap frames
//!
//! The slice of saved user state the system-call path needs: the user stack
//! pointer (arguments live there) and the return-value register.

use crate::mm::address::VirtAddr;

/// Size of one argument slot on the user stack.
pub const WORD_SIZE: usize = 4;

/// User context saved on kernel entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// User stack pointer at the time of the trap.
    pub esp: usize,
    /// Return-value register.
    pub eax: u32,
}

impl TrapFrame {
    pub const fn new(esp: usize) -> Self {
        Self { esp, eax: 0 }
    }

    #[inline]
    pub const fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.esp)
    }
}

/// What happens to the trapping process once the kernel is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Return to user mode.
    Resume,
    /// The process was terminated with this status.
    Exit(i32),
    /// The machine was powered off.
    Halt,
}
