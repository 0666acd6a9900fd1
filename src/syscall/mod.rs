//! System Call Interface
//!
//! The boundary user programs cross to reach the kernel.
//!
//! # Safety Model
//! - Every user pointer, the stack pointer included, goes through the
//!   translator in [`uaccess`] before it is read
//! - Strings and buffers are copied into kernel scratch pages first
//! - Any invalid pointer or unknown call terminates the calling process with
//!   status -1; the kernel itself never panics on user input

mod handler;
pub mod uaccess;

pub use handler::{numbers, stack_words, Syscall, SyscallError, READDIR_MAX_LEN};
pub use uaccess::{Fault, UserMemory, UserMemoryMut, UserSpans};
