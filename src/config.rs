//! Build-time constants and boot configuration.

use crate::mm::frame_table::EvictionPolicy;

/// Frames in the user pool when no explicit size is configured (1 MiB).
pub const DEFAULT_USER_FRAMES: usize = 256;

/// Working-set window of the WSclock policy, in frame table epochs.
pub const DEFAULT_WS_WINDOW: u64 = 64;

/// Configuration handed to [`Kernel::new`](crate::Kernel::new).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of frames in the user page pool.
    pub user_frames: usize,
    /// Victim selection strategy of the frame table.
    pub eviction: EvictionPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_frames: DEFAULT_USER_FRAMES,
            eviction: EvictionPolicy::build_default(),
        }
    }
}
