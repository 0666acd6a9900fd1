//! Frameguard - frame management and user-memory boundary for a teaching kernel
//!
//! The core of a small x86 user-program kernel: a frame table that loans
//! physical pages to user processes and picks eviction victims, a translator
//! and copier that move bytes across the user/kernel boundary one page at a
//! time, and the system-call dispatcher that ties them together.
//!
//! # Safety Features
//! - User pointers are never dereferenced before translation
//! - Every invalid pointer kills the offending process, never the kernel
//! - Memory exhaustion is a recoverable error, not a halt
//! - Kernel copies of user data are scrubbed on drop
//!
//! # Collaborators
//! The scheduler, the program loader and the on-disk filesystem live outside
//! this crate and are reached through [`ProcessHost`] and [`FileSystem`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod syscall;
pub mod trap;

pub use config::KernelConfig;
pub use drivers::console::{BufferConsole, Console};
pub use fs::{File, FileSystem};
pub use kernel::{Kernel, KernelError};
pub use process::{Pid, ProcessHost};
pub use trap::{Flow, TrapFrame};
