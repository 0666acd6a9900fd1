//! Memory management
//!
//! Provides:
//! - Typed physical and virtual addresses
//! - The physical page pool user frames are drawn from
//! - Per-process page tables with accessed/dirty tracking
//! - The frame table and its eviction policies
//! - Self-scrubbing kernel scratch pages

pub mod address;
pub mod frame_table;
pub mod paging;
pub mod phys;
pub mod scratch;

pub use address::{PhysAddr, VirtAddr, PAGE_SIZE, USER_TOP};
pub use frame_table::{EvictionPolicy, FrameError, FrameTable, Release};
