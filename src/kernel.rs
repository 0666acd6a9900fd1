//! Kernel core state
//!
//! Owns the frame table, the process table and the collaborators the system
//! call layer talks to. Every shared resource sits behind its own
//! `spin::Mutex`.
//!
//! # Lock Order
//! `processes` before `frames`. `fs` and `console` are taken on their own.
//! No lock is held while a caller blocks in [`ProcessHost::wait_loaded`].

use alloc::vec::Vec;

use log::{debug, info, warn};
use spin::{Mutex, MutexGuard};

use crate::config::KernelConfig;
use crate::drivers::console::Console;
use crate::fs::FileSystem;
use crate::mm::address::{PhysAddr, VirtAddr};
use crate::mm::frame_table::{FrameError, FrameTable, Release};
use crate::mm::paging::MappingError;
use crate::mm::phys::PhysMemory;
use crate::process::{Pid, ProcessHost, ProcessTable};
use crate::syscall::uaccess::{Fault, UserMemory, UserMemoryMut};
use crate::trap::Flow;

/// Errors surfaced by kernel-core operations outside the system-call path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("{0} is not a live process")]
    NoSuchProcess(Pid),
}

/// The frame-management and system-call core of the kernel.
pub struct Kernel<FS: FileSystem, C: Console, H: ProcessHost> {
    pub(crate) frames: Mutex<FrameTable<PhysMemory>>,
    pub(crate) processes: Mutex<ProcessTable<FS::File>>,
    pub(crate) fs: Mutex<FS>,
    pub(crate) console: Mutex<C>,
    pub(crate) host: H,
}

impl<FS: FileSystem, C: Console, H: ProcessHost> Kernel<FS, C, H> {
    /// Boot-time initialisation: an empty frame table over a fresh pool.
    pub fn new(config: KernelConfig, fs: FS, console: C, host: H) -> Self {
        info!(
            "kernel: {} user frames, {:?} eviction",
            config.user_frames, config.eviction
        );
        Self {
            frames: Mutex::new(FrameTable::new(
                PhysMemory::new(config.user_frames),
                config.eviction,
            )),
            processes: Mutex::new(ProcessTable::new()),
            fs: Mutex::new(fs),
            console: Mutex::new(console),
            host,
        }
    }

    /// Register a user process with an empty address space.
    pub fn create_process(&self, name: &str) -> Pid {
        let pid = self.processes.lock().spawn(name);
        debug!("kernel: created {} ({})", pid, name);
        pid
    }

    /// Back the user page at `va` with a fresh frame.
    ///
    /// This is the path the loader and page-fault handler use to obtain
    /// memory for a process.
    pub fn map_user_page(
        &self,
        pid: Pid,
        va: VirtAddr,
        writable: bool,
    ) -> Result<PhysAddr, KernelError> {
        let mut procs = self.processes.lock();
        if !procs.get(pid).is_some_and(|p| p.is_running()) {
            return Err(KernelError::NoSuchProcess(pid));
        }

        let mut frames = self.frames.lock();
        let pa = frames.allocate(pid, va, &mut *procs)?;

        let process = procs.get_mut(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        if let Err(e) = process.page_table.map(va, pa, writable) {
            frames.release_mapping(pid, va, pa);
            return Err(e.into());
        }
        Ok(pa)
    }

    /// Unmap the user page at `va` and give its frame back.
    pub fn unmap_user_page(&self, pid: Pid, va: VirtAddr) -> Result<Release, KernelError> {
        let mut procs = self.processes.lock();
        let process = procs.get_mut(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        let pa = process.page_table.unmap(va)?;
        Ok(self.frames.lock().release_mapping(pid, va, pa))
    }

    /// Copy `bytes` into writable user memory of `pid`.
    pub fn copy_to_user(&self, pid: Pid, va: VirtAddr, bytes: &[u8]) -> Result<(), KernelError> {
        let procs = self.processes.lock();
        let process = procs.get(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        let mut frames = self.frames.lock();
        UserMemoryMut::new(&process.page_table, frames.pool_mut()).copy_out(va, bytes)?;
        Ok(())
    }

    /// Copy `dst.len()` bytes out of user memory of `pid`.
    pub fn copy_from_user(&self, pid: Pid, va: VirtAddr, dst: &mut [u8]) -> Result<(), KernelError> {
        let procs = self.processes.lock();
        let process = procs.get(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        let frames = self.frames.lock();
        UserMemory::new(&process.page_table, frames.pool()).copy_in(va, dst)?;
        Ok(())
    }

    /// Record a user access to `va` the way the MMU would.
    pub fn touch_user_page(&self, pid: Pid, va: VirtAddr, write: bool) {
        if let Some(process) = self.processes.lock().get_mut(pid) {
            process.page_table.touch(va, write);
        }
    }

    /// Terminate `pid` with `status`.
    ///
    /// Releases every frame the process references, unmaps its address
    /// space and closes its files before the host is told.
    pub fn terminate(&self, pid: Pid, status: i32) -> Flow {
        let (name, files) = {
            let mut procs = self.processes.lock();
            let Some(process) = procs.get_mut(pid).filter(|p| p.is_running()) else {
                warn!("kernel: terminate of dead {}", pid);
                return Flow::Exit(status);
            };

            process.set_exited(status);
            let unmapped = process.page_table.clear().count();
            let files: Vec<FS::File> = process.files.drain().map(|of| of.file).collect();
            let name = alloc::string::String::from(process.name());

            let freed = self.frames.lock().release_process(pid);
            debug!(
                "kernel: {} unmapped {} pages, freed {} frames",
                pid, unmapped, freed
            );
            (name, files)
        };
        drop(files);

        info!("{}: exit({})", name, status);
        self.host.exited(pid, status);
        Flow::Exit(status)
    }

    /// Exit status of `pid`, once it has exited.
    pub fn exit_status(&self, pid: Pid) -> Option<i32> {
        self.processes.lock().get(pid).and_then(|p| p.exit_status())
    }

    /// Advance the frame table's logical clock (timer tick).
    pub fn tick(&self, ticks: u64) {
        self.frames.lock().advance_clock(ticks);
    }

    pub fn frames(&self) -> MutexGuard<'_, FrameTable<PhysMemory>> {
        self.frames.lock()
    }

    pub fn processes(&self) -> MutexGuard<'_, ProcessTable<FS::File>> {
        self.processes.lock()
    }

    pub fn console(&self) -> MutexGuard<'_, C> {
        self.console.lock()
    }

    pub fn fs(&self) -> MutexGuard<'_, FS> {
        self.fs.lock()
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}
