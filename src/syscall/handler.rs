//! System Call Handler
//!
//! Decodes a trap, validates its arguments and dispatches to the individual
//! system call implementations.
//!
//! Each trap runs through the same stages: the stack pointer is translated,
//! the call number and argument words are read from the user stack through
//! the translator, pointer arguments are validated (strings are copied into
//! scratch pages) and only then does a handler run. Any failure before or
//! during a handler terminates the calling process with status -1.

use alloc::vec::Vec;

use log::{debug, info, trace, warn};

use crate::drivers::console::Console;
use crate::fs::{File, FileSystem};
use crate::kernel::Kernel;
use crate::mm::address::VirtAddr;
use crate::mm::phys::PhysMemory;
use crate::mm::scratch::ScratchPage;
use crate::process::{Pid, ProcessHost, STDIN_FILENO, STDOUT_FILENO};
use crate::trap::{Flow, TrapFrame, WORD_SIZE};

use super::uaccess::{Fault, UserMemory, UserMemoryMut, CHUNK_SIZE};

/// System call numbers
pub mod numbers {
    pub const SYS_HALT: u32 = 0;
    pub const SYS_EXIT: u32 = 1;
    pub const SYS_EXEC: u32 = 2;
    pub const SYS_WAIT: u32 = 3;
    pub const SYS_CREATE: u32 = 4;
    pub const SYS_REMOVE: u32 = 5;
    pub const SYS_OPEN: u32 = 6;
    pub const SYS_FILESIZE: u32 = 7;
    pub const SYS_READ: u32 = 8;
    pub const SYS_WRITE: u32 = 9;
    pub const SYS_SEEK: u32 = 10;
    pub const SYS_TELL: u32 = 11;
    pub const SYS_CLOSE: u32 = 12;
    pub const SYS_MMAP: u32 = 13;
    pub const SYS_MUNMAP: u32 = 14;
    pub const SYS_CHDIR: u32 = 15;
    pub const SYS_MKDIR: u32 = 16;
    pub const SYS_READDIR: u32 = 17;
    pub const SYS_ISDIR: u32 = 18;
    pub const SYS_INUMBER: u32 = 19;
}

/// Longest file name `readdir` returns, without the terminator.
pub const READDIR_MAX_LEN: usize = 14;

const MAX_ARGS: usize = 3;

/// A known system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt,
    Exit,
    Exec,
    Wait,
    Create,
    Remove,
    Open,
    Filesize,
    Read,
    Write,
    Seek,
    Tell,
    Close,
    Mmap,
    Munmap,
    Chdir,
    Mkdir,
    Readdir,
    Isdir,
    Inumber,
}

impl Syscall {
    pub fn from_number(number: u32) -> Option<Self> {
        use numbers::*;
        Some(match number {
            SYS_HALT => Self::Halt,
            SYS_EXIT => Self::Exit,
            SYS_EXEC => Self::Exec,
            SYS_WAIT => Self::Wait,
            SYS_CREATE => Self::Create,
            SYS_REMOVE => Self::Remove,
            SYS_OPEN => Self::Open,
            SYS_FILESIZE => Self::Filesize,
            SYS_READ => Self::Read,
            SYS_WRITE => Self::Write,
            SYS_SEEK => Self::Seek,
            SYS_TELL => Self::Tell,
            SYS_CLOSE => Self::Close,
            SYS_MMAP => Self::Mmap,
            SYS_MUNMAP => Self::Munmap,
            SYS_CHDIR => Self::Chdir,
            SYS_MKDIR => Self::Mkdir,
            SYS_READDIR => Self::Readdir,
            SYS_ISDIR => Self::Isdir,
            SYS_INUMBER => Self::Inumber,
            _ => return None,
        })
    }

    pub const fn number(self) -> u32 {
        use numbers::*;
        match self {
            Self::Halt => SYS_HALT,
            Self::Exit => SYS_EXIT,
            Self::Exec => SYS_EXEC,
            Self::Wait => SYS_WAIT,
            Self::Create => SYS_CREATE,
            Self::Remove => SYS_REMOVE,
            Self::Open => SYS_OPEN,
            Self::Filesize => SYS_FILESIZE,
            Self::Read => SYS_READ,
            Self::Write => SYS_WRITE,
            Self::Seek => SYS_SEEK,
            Self::Tell => SYS_TELL,
            Self::Close => SYS_CLOSE,
            Self::Mmap => SYS_MMAP,
            Self::Munmap => SYS_MUNMAP,
            Self::Chdir => SYS_CHDIR,
            Self::Mkdir => SYS_MKDIR,
            Self::Readdir => SYS_READDIR,
            Self::Isdir => SYS_ISDIR,
            Self::Inumber => SYS_INUMBER,
        }
    }

    /// Number of argument words the call takes from the user stack.
    pub const fn arity(self) -> usize {
        match self {
            Self::Halt => 0,
            Self::Read | Self::Write => 3,
            Self::Create | Self::Seek | Self::Mmap | Self::Readdir => 2,
            _ => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Halt => "halt",
            Self::Exit => "exit",
            Self::Exec => "exec",
            Self::Wait => "wait",
            Self::Create => "create",
            Self::Remove => "remove",
            Self::Open => "open",
            Self::Filesize => "filesize",
            Self::Read => "read",
            Self::Write => "write",
            Self::Seek => "seek",
            Self::Tell => "tell",
            Self::Close => "close",
            Self::Mmap => "mmap",
            Self::Munmap => "munmap",
            Self::Chdir => "chdir",
            Self::Mkdir => "mkdir",
            Self::Readdir => "readdir",
            Self::Isdir => "isdir",
            Self::Inumber => "inumber",
        }
    }
}

/// Reasons a trap kills the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SyscallError {
    /// A user pointer (stack, argument or buffer) failed translation.
    #[error("bad user address: {0}")]
    BadAddress(#[from] Fault),
    /// The call number is not one the kernel implements.
    #[error("unknown system call {0}")]
    UnknownCall(u32),
    /// The trapping process is not live.
    #[error("{0} is not a live process")]
    NoSuchProcess(Pid),
}

/// A decoded call whose pointer arguments have been validated.
#[derive(Debug)]
enum Request {
    Halt,
    Exit { status: i32 },
    Exec { cmd_line: ScratchPage },
    Wait { child: Pid },
    Create { name: ScratchPage, initial_size: u32 },
    Remove { name: ScratchPage },
    Open { name: ScratchPage },
    Filesize { fd: i32 },
    Read { fd: i32, buf: VirtAddr, len: usize },
    Write { fd: i32, buf: VirtAddr, len: usize },
    Seek { fd: i32, pos: u32 },
    Tell { fd: i32 },
    Close { fd: i32 },
    Mmap { fd: i32, addr: VirtAddr },
    Munmap { mapping: i32 },
    Chdir { dir: ScratchPage },
    Mkdir { dir: ScratchPage },
    Readdir { fd: i32, name: VirtAddr },
    Isdir { fd: i32 },
    Inumber { fd: i32 },
}

/// What a handler hands back to the trap path.
enum Outcome {
    /// Store this value in the return register.
    Value(i32),
    /// Nothing to return.
    Void,
    Exit(i32),
    Halt,
}

impl Outcome {
    fn flag(ok: bool) -> Self {
        Self::Value(ok as i32)
    }
}

/// Copy the string argument at `arg` into a fresh scratch page.
fn copy_str_arg(mem: &UserMemory<'_, PhysMemory>, arg: u32) -> Result<ScratchPage, Fault> {
    let mut page = ScratchPage::new();
    mem.copy_in_str(user_ptr(arg), page.as_bytes_mut())?;
    Ok(page)
}

#[inline]
fn user_ptr(arg: u32) -> VirtAddr {
    VirtAddr::new(arg as usize)
}

/// The copied string as UTF-8, or `None` if it is not.
fn as_str(page: &ScratchPage) -> Option<&str> {
    core::str::from_utf8(page.c_str()).ok()
}

impl<FS: FileSystem, C: Console, H: ProcessHost> Kernel<FS, C, H> {
    /// Handle a system call trap from `pid`.
    ///
    /// On return the result (if any) is in `frame.eax`. A process that is
    /// killed or exits is torn down before this returns.
    pub fn handle_syscall(&self, pid: Pid, frame: &mut TrapFrame) -> Flow {
        let request = match self.decode(pid, frame.stack_pointer()) {
            Ok(request) => request,
            Err(e) => return self.kill(pid, e),
        };
        trace!("syscall: {} {:?}", pid, request);

        match self.dispatch(pid, request) {
            Ok(Outcome::Value(value)) => {
                frame.eax = value as u32;
                Flow::Resume
            }
            Ok(Outcome::Void) => Flow::Resume,
            Ok(Outcome::Exit(status)) => self.terminate(pid, status),
            Ok(Outcome::Halt) => {
                info!("syscall: halt requested by {}", pid);
                self.host.power_off();
                Flow::Halt
            }
            Err(e) => self.kill(pid, e),
        }
    }

    fn kill(&self, pid: Pid, err: SyscallError) -> Flow {
        warn!("syscall: killing {}: {}", pid, err);
        self.terminate(pid, -1)
    }

    /// Run `f` against a read-only view of `pid`'s user memory.
    fn with_user<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&UserMemory<'_, PhysMemory>) -> Result<R, Fault>,
    ) -> Result<R, SyscallError> {
        let procs = self.processes.lock();
        let process = procs
            .get(pid)
            .filter(|p| p.is_running())
            .ok_or(SyscallError::NoSuchProcess(pid))?;
        let frames = self.frames.lock();
        let mem = UserMemory::new(&process.page_table, frames.pool());
        Ok(f(&mem)?)
    }

    /// Validate the stack, read the call and its arguments, and validate
    /// every pointer argument.
    fn decode(&self, pid: Pid, esp: VirtAddr) -> Result<Request, SyscallError> {
        let procs = self.processes.lock();
        let process = procs
            .get(pid)
            .filter(|p| p.is_running())
            .ok_or(SyscallError::NoSuchProcess(pid))?;
        let frames = self.frames.lock();
        let mem = UserMemory::new(&process.page_table, frames.pool());

        mem.translate(esp)?;
        let number = mem.read_word(esp)?;
        let call = Syscall::from_number(number).ok_or(SyscallError::UnknownCall(number))?;

        let mut args = [0u32; MAX_ARGS];
        for (i, slot) in args.iter_mut().take(call.arity()).enumerate() {
            let va = esp
                .checked_add(WORD_SIZE * (i + 1))
                .ok_or(Fault::Overflow)?;
            *slot = mem.read_word(va)?;
        }
        trace!("syscall: {} {}({:?})", pid, call.name(), &args[..call.arity()]);

        let fd = args[0] as i32;
        let request = match call {
            Syscall::Halt => Request::Halt,
            Syscall::Exit => Request::Exit {
                status: args[0] as i32,
            },
            Syscall::Exec => Request::Exec {
                cmd_line: copy_str_arg(&mem, args[0])?,
            },
            Syscall::Wait => Request::Wait {
                child: Pid::new(args[0]),
            },
            Syscall::Create => Request::Create {
                name: copy_str_arg(&mem, args[0])?,
                initial_size: args[1],
            },
            Syscall::Remove => Request::Remove {
                name: copy_str_arg(&mem, args[0])?,
            },
            Syscall::Open => Request::Open {
                name: copy_str_arg(&mem, args[0])?,
            },
            Syscall::Filesize => Request::Filesize { fd },
            Syscall::Read => {
                let (buf, len) = (user_ptr(args[1]), args[2] as usize);
                mem.check_writable(buf, len)?;
                Request::Read { fd, buf, len }
            }
            Syscall::Write => {
                let (buf, len) = (user_ptr(args[1]), args[2] as usize);
                mem.check_range(buf, len)?;
                Request::Write { fd, buf, len }
            }
            Syscall::Seek => Request::Seek { fd, pos: args[1] },
            Syscall::Tell => Request::Tell { fd },
            Syscall::Close => Request::Close { fd },
            Syscall::Mmap => Request::Mmap {
                fd,
                addr: user_ptr(args[1]),
            },
            Syscall::Munmap => Request::Munmap { mapping: fd },
            Syscall::Chdir => Request::Chdir {
                dir: copy_str_arg(&mem, args[0])?,
            },
            Syscall::Mkdir => Request::Mkdir {
                dir: copy_str_arg(&mem, args[0])?,
            },
            Syscall::Readdir => {
                let name = user_ptr(args[1]);
                mem.check_writable(name, READDIR_MAX_LEN + 1)?;
                Request::Readdir { fd, name }
            }
            Syscall::Isdir => Request::Isdir { fd },
            Syscall::Inumber => Request::Inumber { fd },
        };
        Ok(request)
    }

    fn dispatch(&self, pid: Pid, request: Request) -> Result<Outcome, SyscallError> {
        let outcome = match request {
            Request::Halt => Outcome::Halt,
            Request::Exit { status } => Outcome::Exit(status),
            Request::Exec { cmd_line } => Outcome::Value(self.sys_exec(pid, cmd_line)),
            Request::Wait { child } => Outcome::Value(self.host.wait(pid, child)),
            Request::Create { name, initial_size } => Outcome::flag(
                as_str(&name).is_some_and(|name| self.fs.lock().create(name, initial_size)),
            ),
            Request::Remove { name } => {
                Outcome::flag(as_str(&name).is_some_and(|name| self.fs.lock().remove(name)))
            }
            Request::Open { name } => Outcome::Value(self.sys_open(pid, &name)?),
            Request::Filesize { fd } => {
                Outcome::Value(self.with_file(pid, fd, |f| byte_count(f.length()))?.unwrap_or(-1))
            }
            Request::Read { fd, buf, len } => Outcome::Value(self.sys_read(pid, fd, buf, len)?),
            Request::Write { fd, buf, len } => Outcome::Value(self.sys_write(pid, fd, buf, len)?),
            Request::Seek { fd, pos } => {
                self.with_file(pid, fd, |f| f.seek(pos))?;
                Outcome::Void
            }
            Request::Tell { fd } => {
                Outcome::Value(self.with_file(pid, fd, |f| byte_count(f.tell()))?.unwrap_or(-1))
            }
            Request::Close { fd } => {
                let file = self
                    .processes
                    .lock()
                    .get_mut(pid)
                    .and_then(|p| p.files.remove(fd));
                if file.is_none() {
                    debug!("syscall: {} close of unknown fd {}", pid, fd);
                }
                Outcome::Void
            }
            Request::Mmap { fd, addr } => {
                info!("SYS_MMAP");
                debug!("syscall: mmap(fd {}, {}) is not supported", fd, addr);
                Outcome::Value(0)
            }
            Request::Munmap { mapping } => {
                info!("SYS_MUNMAP");
                debug!("syscall: munmap({}) is not supported", mapping);
                Outcome::Void
            }
            Request::Chdir { dir } => {
                info!("SYS_CHDIR");
                drop(dir);
                Outcome::flag(false)
            }
            Request::Mkdir { dir } => {
                info!("SYS_MKDIR");
                drop(dir);
                Outcome::flag(false)
            }
            Request::Readdir { fd, name } => {
                info!("SYS_READDIR");
                debug!("syscall: readdir(fd {}, {}) is not supported", fd, name);
                Outcome::flag(false)
            }
            Request::Isdir { fd } => {
                info!("SYS_ISDIR");
                debug!("syscall: isdir(fd {}) is not supported", fd);
                Outcome::flag(false)
            }
            Request::Inumber { fd } => {
                info!("SYS_INUMBER");
                debug!("syscall: inumber(fd {}) is not supported", fd);
                Outcome::Value(0)
            }
        };
        Ok(outcome)
    }

    /// Start `cmd_line` and wait until it has loaded.
    ///
    /// Runs with no lock held: the caller blocks until the child reports.
    fn sys_exec(&self, pid: Pid, cmd_line: ScratchPage) -> i32 {
        let child = match as_str(&cmd_line) {
            Some(cmd) => self.host.execute(pid, cmd),
            None => None,
        };
        drop(cmd_line);

        match child {
            Some(child) if self.host.wait_loaded(child) => child.as_u32() as i32,
            Some(child) => {
                debug!("syscall: {} failed to load", child);
                -1
            }
            None => -1,
        }
    }

    fn sys_open(&self, pid: Pid, name: &ScratchPage) -> Result<i32, SyscallError> {
        let Some(file) = as_str(name).and_then(|name| self.fs.lock().open(name)) else {
            return Ok(-1);
        };

        let mut procs = self.processes.lock();
        let process = procs
            .get_mut(pid)
            .ok_or(SyscallError::NoSuchProcess(pid))?;
        match process.files.install(file) {
            Ok(fd) => Ok(fd),
            Err(file) => {
                warn!("syscall: {} has no descriptor left", pid);
                drop(file);
                Ok(-1)
            }
        }
    }

    /// Apply `f` to the open file `fd` of `pid`; `None` if there is none.
    fn with_file<R>(
        &self,
        pid: Pid,
        fd: i32,
        f: impl FnOnce(&mut FS::File) -> R,
    ) -> Result<Option<R>, SyscallError> {
        let mut procs = self.processes.lock();
        let process = procs
            .get_mut(pid)
            .ok_or(SyscallError::NoSuchProcess(pid))?;
        Ok(process.files.get_mut(fd).map(f))
    }

    /// Copy the user buffer in page-sized chunks and hand each chunk to the
    /// console or the open file.
    fn sys_write(&self, pid: Pid, fd: i32, buf: VirtAddr, len: usize) -> Result<i32, SyscallError> {
        if fd == STDIN_FILENO {
            return Ok(-1);
        }
        if fd != STDOUT_FILENO && self.with_file(pid, fd, |_| ())?.is_none() {
            return Ok(-1);
        }

        let mut scratch = ScratchPage::new();
        let mut written = 0;
        while written < len {
            let n = CHUNK_SIZE.min(len - written);
            let src = buf.checked_add(written).ok_or(Fault::Overflow)?;
            let chunk = &mut scratch.as_bytes_mut()[..n];
            self.with_user(pid, |mem| mem.copy_in(src, chunk))?;

            let chunk = &scratch.as_bytes()[..n];
            let accepted = if fd == STDOUT_FILENO {
                self.console.lock().putbuf(chunk);
                n
            } else {
                self.with_file(pid, fd, |f| f.write(chunk))?.unwrap_or(0)
            };
            written += accepted;
            if accepted < n {
                break;
            }
        }
        Ok(byte_count(written))
    }

    /// Fill the user buffer from console input or an open file.
    fn sys_read(&self, pid: Pid, fd: i32, buf: VirtAddr, len: usize) -> Result<i32, SyscallError> {
        if fd == STDOUT_FILENO {
            return Ok(-1);
        }
        if fd != STDIN_FILENO && self.with_file(pid, fd, |_| ())?.is_none() {
            return Ok(-1);
        }

        let mut scratch = ScratchPage::new();
        let mut read = 0;
        while read < len {
            let want = CHUNK_SIZE.min(len - read);
            let chunk = &mut scratch.as_bytes_mut()[..want];
            let got = if fd == STDIN_FILENO {
                let mut console = self.console.lock();
                let mut got = 0;
                while got < want {
                    match console.getc() {
                        Some(byte) => {
                            chunk[got] = byte;
                            got += 1;
                        }
                        None => break,
                    }
                }
                got
            } else {
                self.with_file(pid, fd, |f| f.read(chunk))?.unwrap_or(0)
            };

            let dst = buf.checked_add(read).ok_or(Fault::Overflow)?;
            self.copy_out(pid, dst, &scratch.as_bytes()[..got])?;
            read += got;
            if got < want {
                break;
            }
        }
        Ok(byte_count(read))
    }

    fn copy_out(&self, pid: Pid, va: VirtAddr, bytes: &[u8]) -> Result<(), SyscallError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let procs = self.processes.lock();
        let process = procs
            .get(pid)
            .ok_or(SyscallError::NoSuchProcess(pid))?;
        let mut frames = self.frames.lock();
        UserMemoryMut::new(&process.page_table, frames.pool_mut()).copy_out(va, bytes)?;
        Ok(())
    }
}

/// A byte count or file offset as an `eax` value, saturating at `i32::MAX`.
fn byte_count<N: TryInto<i32>>(n: N) -> i32 {
    n.try_into().unwrap_or(i32::MAX)
}

/// User-stack image of a call: the number followed by its argument words,
/// as a loader or test harness places them at the stack pointer.
pub fn stack_words(call: Syscall, args: &[u32]) -> Vec<u8> {
    core::iter::once(call.number())
        .chain(args.iter().copied())
        .flat_map(u32::to_le_bytes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_round_trip() {
        for number in 0..=numbers::SYS_INUMBER {
            let call = Syscall::from_number(number).unwrap();
            assert_eq!(call.number(), number);
        }
        assert_eq!(Syscall::from_number(numbers::SYS_INUMBER + 1), None);
        assert_eq!(Syscall::from_number(u32::MAX), None);
    }

    #[test]
    fn test_arity() {
        assert_eq!(Syscall::Halt.arity(), 0);
        assert_eq!(Syscall::Exit.arity(), 1);
        assert_eq!(Syscall::Create.arity(), 2);
        assert_eq!(Syscall::Write.arity(), 3);
        assert!(Syscall::Read.arity() <= MAX_ARGS);
    }

    #[test]
    fn test_byte_count_saturates() {
        assert_eq!(byte_count(0usize), 0);
        assert_eq!(byte_count(4096usize), 4096);
        assert_eq!(byte_count(i32::MAX as usize), i32::MAX);
        assert_eq!(byte_count(i32::MAX as usize + 1), i32::MAX);
        assert_eq!(byte_count(u32::MAX), i32::MAX);
        assert_eq!(byte_count(usize::MAX), i32::MAX);
    }

    #[test]
    fn test_stack_words_layout() {
        let words = stack_words(Syscall::Write, &[1, 0x0804_8000, 2]);
        assert_eq!(words.len(), 4 * WORD_SIZE);
        assert_eq!(&words[..4], &numbers::SYS_WRITE.to_le_bytes());
        assert_eq!(&words[8..12], &0x0804_8000u32.to_le_bytes());
    }
}
