//! Filesystem collaborator interface.
//!
//! The on-disk filesystem is not part of this crate. System calls reach it
//! through these traits, always with names and data already copied into
//! kernel memory.

/// An open file handle. Dropping the handle closes the file.
pub trait File {
    /// Size of the file in bytes.
    fn length(&self) -> u32;

    /// Read at the current position, returning the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write at the current position, returning the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Move the position to `pos` bytes from the start.
    fn seek(&mut self, pos: u32);

    /// Current position in bytes from the start.
    fn tell(&self) -> u32;
}

/// Name-based filesystem operations.
pub trait FileSystem {
    type File: File;

    fn open(&mut self, name: &str) -> Option<Self::File>;

    fn create(&mut self, name: &str, initial_size: u32) -> bool;

    fn remove(&mut self, name: &str) -> bool;
}
