//! Per-process kernel state.
//!
//! The scheduler and the loader live outside this crate; what the kernel
//! core needs from a process is kept here: its page table, its open-file
//! list and its exit status.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::mm::address::VirtAddr;
use crate::mm::frame_table::AccessBits;
use crate::mm::paging::PageTable;

/// Descriptor reserved for console input.
pub const STDIN_FILENO: i32 = 0;
/// Descriptor reserved for console output.
pub const STDOUT_FILENO: i32 = 1;

/// Process lifecycle services provided by the scheduler and loader.
pub trait ProcessHost {
    /// Create a process running `cmd_line` on behalf of `parent`.
    fn execute(&self, parent: Pid, cmd_line: &str) -> Option<Pid>;

    /// Block until `child` has finished loading. Returns whether the load
    /// succeeded.
    fn wait_loaded(&self, child: Pid) -> bool;

    /// Wait for `child` to exit and return its status.
    fn wait(&self, parent: Pid, child: Pid) -> i32;

    /// Called once the kernel core has torn down an exiting process.
    fn exited(&self, _pid: Pid, _status: i32) {}

    fn power_off(&self);
}

/// Process identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// One entry of a process's open-file list.
#[derive(Debug)]
pub struct OpenFile<F> {
    pub fd: i32,
    pub file: F,
}

/// Open files of one process.
///
/// Descriptors come from a counter that only moves forward, so a closed
/// descriptor is never handed out again during the process's lifetime.
#[derive(Debug)]
pub struct FileTable<F> {
    last_fd: i32,
    open: Vec<OpenFile<F>>,
}

impl<F> FileTable<F> {
    pub const fn new() -> Self {
        Self {
            last_fd: STDOUT_FILENO,
            open: Vec::new(),
        }
    }

    /// Store `file` under a new descriptor.
    ///
    /// On failure the handle is given back and the counter is unchanged.
    pub fn install(&mut self, file: F) -> Result<i32, F> {
        let Some(fd) = self.last_fd.checked_add(1) else {
            return Err(file);
        };
        if self.open.try_reserve(1).is_err() {
            return Err(file);
        }
        self.last_fd = fd;
        self.open.push(OpenFile { fd, file });
        Ok(fd)
    }

    pub fn get(&self, fd: i32) -> Option<&F> {
        self.open.iter().find(|of| of.fd == fd).map(|of| &of.file)
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut F> {
        self.open
            .iter_mut()
            .find(|of| of.fd == fd)
            .map(|of| &mut of.file)
    }

    /// Remove the entry for `fd`, handing back its file.
    pub fn remove(&mut self, fd: i32) -> Option<F> {
        let pos = self.open.iter().position(|of| of.fd == fd)?;
        Some(self.open.remove(pos).file)
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = OpenFile<F>> + '_ {
        self.open.drain(..)
    }

    /// Highest descriptor handed out so far.
    pub fn last_fd(&self) -> i32 {
        self.last_fd
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

impl<F> Default for FileTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
}

/// Kernel-side record of a user process.
#[derive(Debug)]
pub struct Process<F> {
    pid: Pid,
    name: String,
    pub page_table: PageTable,
    pub files: FileTable<F>,
    state: ProcessState,
}

impl<F> Process<F> {
    pub fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: String::from(name),
            page_table: PageTable::new(),
            files: FileTable::new(),
            state: ProcessState::Running,
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Exit status, once the process has exited.
    pub fn exit_status(&self) -> Option<i32> {
        match self.state {
            ProcessState::Exited(status) => Some(status),
            ProcessState::Running => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub(crate) fn set_exited(&mut self, status: i32) {
        self.state = ProcessState::Exited(status);
    }
}

/// Registry of processes known to the kernel core.
#[derive(Debug)]
pub struct ProcessTable<F> {
    procs: BTreeMap<Pid, Process<F>>,
    next_pid: u32,
}

impl<F> ProcessTable<F> {
    pub const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            next_pid: 1,
        }
    }

    /// Register a new process and return its identifier.
    pub fn spawn(&mut self, name: &str) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        self.procs.insert(pid, Process::new(pid, name));
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Process<F>> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process<F>> {
        self.procs.get_mut(&pid)
    }

    /// Forget an exited process.
    pub fn reap(&mut self, pid: Pid) -> Option<Process<F>> {
        self.procs.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

impl<F> Default for ProcessTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> AccessBits for ProcessTable<F> {
    fn is_accessed(&self, pid: Pid, vaddr: VirtAddr) -> bool {
        self.get(pid)
            .is_some_and(|p| p.page_table.is_accessed(vaddr))
    }

    fn clear_accessed(&mut self, pid: Pid, vaddr: VirtAddr) {
        if let Some(p) = self.get_mut(pid) {
            p.page_table.clear_accessed(vaddr);
        }
    }

    fn is_dirty(&self, pid: Pid, vaddr: VirtAddr) -> bool {
        self.get(pid).is_some_and(|p| p.page_table.is_dirty(vaddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::PhysAddr;

    #[test]
    fn test_descriptors_are_never_reused() {
        let mut files: FileTable<&str> = FileTable::new();
        let a = files.install("a").unwrap();
        let b = files.install("b").unwrap();
        assert_eq!(a, 2);
        assert_eq!(b, 3);

        assert_eq!(files.remove(a), Some("a"));
        assert_eq!(files.remove(a), None);
        let c = files.install("c").unwrap();
        assert_eq!(c, 4);
        assert_eq!(files.get(b), Some(&"b"));
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_descriptor_exhaustion_returns_handle() {
        let mut files: FileTable<u8> = FileTable::new();
        files.last_fd = i32::MAX;
        assert_eq!(files.install(7), Err(7));
        assert_eq!(files.last_fd(), i32::MAX);
    }

    #[test]
    fn test_access_bits_through_process_table() {
        let mut procs: ProcessTable<()> = ProcessTable::new();
        let pid = procs.spawn("init");
        let va = VirtAddr::new(0x1000);
        let p = procs.get_mut(pid).unwrap();
        p.page_table.map(va, PhysAddr::new(0x0010_0000), true).unwrap();
        p.page_table.touch(va, false);

        assert!(procs.is_accessed(pid, va));
        assert!(!procs.is_dirty(pid, va));
        procs.clear_accessed(pid, va);
        assert!(!procs.is_accessed(pid, va));
        assert!(!procs.is_accessed(Pid::new(99), va));
    }

    #[test]
    fn test_exit_status() {
        let mut p: Process<()> = Process::new(Pid::new(4), "child");
        assert!(p.is_running());
        assert_eq!(p.exit_status(), None);
        p.set_exited(-1);
        assert_eq!(p.exit_status(), Some(-1));
    }
}
