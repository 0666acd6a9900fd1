//! End-to-end system call scenarios against an in-memory filesystem, a
//! buffer console and a scripted process host.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use frameguard::mm::address::{VirtAddr, PAGE_SIZE, USER_TOP};
use frameguard::mm::frame_table::{EvictionPolicy, FrameError};
use frameguard::syscall::{stack_words, Syscall};
use frameguard::{
    BufferConsole, File, FileSystem, Flow, Kernel, KernelConfig, KernelError, Pid, ProcessHost,
    TrapFrame,
};

const DATA: usize = 0x0804_8000;
const STACK_PAGE: usize = USER_TOP - PAGE_SIZE;
const ESP: usize = STACK_PAGE + 0x800;

struct MemFile {
    data: Rc<RefCell<Vec<u8>>>,
    pos: usize,
}

impl File for MemFile {
    fn length(&self) -> u32 {
        self.data.borrow().len() as u32
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let data = self.data.borrow();
        let n = buf.len().min(data.len().saturating_sub(self.pos));
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let mut data = self.data.borrow_mut();
        let end = self.pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        buf.len()
    }

    fn seek(&mut self, pos: u32) {
        self.pos = pos as usize;
    }

    fn tell(&self) -> u32 {
        self.pos as u32
    }
}

#[derive(Default)]
struct MemFs {
    files: BTreeMap<String, Rc<RefCell<Vec<u8>>>>,
}

impl FileSystem for MemFs {
    type File = MemFile;

    fn open(&mut self, name: &str) -> Option<MemFile> {
        self.files.get(name).map(|data| MemFile {
            data: Rc::clone(data),
            pos: 0,
        })
    }

    fn create(&mut self, name: &str, initial_size: u32) -> bool {
        if name.is_empty() || self.files.contains_key(name) {
            return false;
        }
        let data = vec![0; initial_size as usize];
        self.files.insert(name.to_owned(), Rc::new(RefCell::new(data)));
        true
    }

    fn remove(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }
}

/// Loads any command line starting with "ok"; everything else fails to load.
#[derive(Default)]
struct ScriptedHost {
    next_child: Cell<u32>,
    commands: RefCell<Vec<String>>,
    loaded: RefCell<BTreeMap<Pid, bool>>,
    exits: RefCell<Vec<(Pid, i32)>>,
    powered_off: Cell<bool>,
}

impl ProcessHost for ScriptedHost {
    fn execute(&self, _parent: Pid, cmd_line: &str) -> Option<Pid> {
        self.commands.borrow_mut().push(cmd_line.to_owned());
        let child = Pid::new(100 + self.next_child.get());
        self.next_child.set(self.next_child.get() + 1);
        self.loaded
            .borrow_mut()
            .insert(child, cmd_line.starts_with("ok"));
        Some(child)
    }

    fn wait_loaded(&self, child: Pid) -> bool {
        self.loaded.borrow().get(&child).copied().unwrap_or(false)
    }

    fn wait(&self, _parent: Pid, child: Pid) -> i32 {
        child.as_u32() as i32 * 2
    }

    fn exited(&self, pid: Pid, status: i32) {
        self.exits.borrow_mut().push((pid, status));
    }

    fn power_off(&self) {
        self.powered_off.set(true);
    }
}

struct Harness {
    kernel: Kernel<MemFs, BufferConsole, ScriptedHost>,
    pid: Pid,
}

impl Harness {
    /// A process with `data_pages` writable data pages and one stack page.
    fn boot(frames: usize, data_pages: usize) -> Self {
        let config = KernelConfig {
            user_frames: frames,
            eviction: EvictionPolicy::Clock,
        };
        let kernel = Kernel::new(config, MemFs::default(), BufferConsole::new(), ScriptedHost::default());
        let pid = kernel.create_process("proc-a");
        for n in 0..data_pages {
            kernel
                .map_user_page(pid, VirtAddr::new(DATA + n * PAGE_SIZE), true)
                .unwrap();
        }
        kernel
            .map_user_page(pid, VirtAddr::new(STACK_PAGE), true)
            .unwrap();
        Self { kernel, pid }
    }

    fn put(&self, va: usize, bytes: &[u8]) {
        self.kernel
            .copy_to_user(self.pid, VirtAddr::new(va), bytes)
            .unwrap();
    }

    fn call_at(&self, esp: usize, call: Syscall, args: &[u32]) -> (Flow, u32) {
        self.put(esp, &stack_words(call, args));
        let mut frame = TrapFrame::new(esp);
        let flow = self.kernel.handle_syscall(self.pid, &mut frame);
        (flow, frame.eax)
    }

    fn call(&self, call: Syscall, args: &[u32]) -> (Flow, u32) {
        self.call_at(ESP, call, args)
    }

    fn value(&self, call: Syscall, args: &[u32]) -> i32 {
        let (flow, eax) = self.call(call, args);
        assert_eq!(flow, Flow::Resume, "{} did not resume", call.name());
        eax as i32
    }

    fn console(&self) -> Vec<u8> {
        self.kernel.console().output().to_vec()
    }

    fn exit_status(&self) -> Option<i32> {
        self.kernel.exit_status(self.pid)
    }
}

fn ptr(va: usize) -> u32 {
    va as u32
}

#[test]
fn create_open_and_write_to_console() {
    let h = Harness::boot(8, 1);
    h.put(DATA, b"foo\0");
    h.put(DATA + 0x100, b"hi");

    assert_eq!(h.value(Syscall::Create, &[ptr(DATA), 0]), 1);
    let fd = h.value(Syscall::Open, &[ptr(DATA)]);
    assert!(fd > 1);
    assert_eq!(h.value(Syscall::Write, &[1, ptr(DATA + 0x100), 2]), 2);
    assert_eq!(h.console(), b"hi");
}

#[test]
fn write_one_page_past_mapping_kills_without_output() {
    let h = Harness::boot(8, 1);
    let (flow, _) = h.call(Syscall::Write, &[1, ptr(DATA + PAGE_SIZE), 2]);
    assert_eq!(flow, Flow::Exit(-1));
    assert_eq!(h.exit_status(), Some(-1));
    assert!(h.console().is_empty());
    assert_eq!(*h.kernel.host().exits.borrow(), [(h.pid, -1)]);
}

#[test]
fn write_straddling_into_unmapped_page_emits_nothing() {
    let h = Harness::boot(8, 1);
    h.put(DATA + PAGE_SIZE - 1, b"x");
    let (flow, _) = h.call(Syscall::Write, &[1, ptr(DATA + PAGE_SIZE - 1), 2]);
    assert_eq!(flow, Flow::Exit(-1));
    assert!(h.console().is_empty());
}

#[test]
fn exhausted_pool_selects_one_older_victim() {
    let h = Harness::boot(4, 1);
    h.kernel
        .map_user_page(h.pid, VirtAddr::new(DATA + PAGE_SIZE), true)
        .unwrap();
    let newest = h
        .kernel
        .map_user_page(h.pid, VirtAddr::new(DATA + 2 * PAGE_SIZE), true)
        .unwrap();
    assert_eq!(h.kernel.frames().pool().free_frames(), 0);
    let scans = h.kernel.frames().stats().victim_scans;

    let err = h
        .kernel
        .map_user_page(h.pid, VirtAddr::new(DATA + 3 * PAGE_SIZE), true)
        .unwrap_err();
    let KernelError::Frame(FrameError::OutOfFrames { victim: Some(victim) }) = err else {
        panic!("unexpected error {:?}", err);
    };
    assert_eq!(h.kernel.frames().stats().victim_scans, scans + 1);
    assert_ne!(victim, newest);
    assert!(h.kernel.frames().contains(victim));
    assert_eq!(h.exit_status(), None);
}

#[test]
fn stack_pointer_at_boundary_kills() {
    let h = Harness::boot(8, 1);
    let mut frame = TrapFrame::new(USER_TOP);
    assert_eq!(h.kernel.handle_syscall(h.pid, &mut frame), Flow::Exit(-1));
    assert_eq!(h.exit_status(), Some(-1));
}

#[test]
fn unmapped_stack_pointer_kills() {
    let h = Harness::boot(8, 1);
    let mut frame = TrapFrame::new(DATA + 16 * PAGE_SIZE);
    assert_eq!(h.kernel.handle_syscall(h.pid, &mut frame), Flow::Exit(-1));
}

#[test]
fn argument_past_stack_top_kills() {
    let h = Harness::boot(8, 1);
    // The call number is readable but its argument lies at USER_TOP.
    let esp = USER_TOP - 4;
    h.put(esp, &Syscall::Exit.number().to_le_bytes());
    let mut frame = TrapFrame::new(esp);
    assert_eq!(h.kernel.handle_syscall(h.pid, &mut frame), Flow::Exit(-1));
}

#[test]
fn unknown_call_kills() {
    let h = Harness::boot(8, 1);
    h.put(ESP, &99u32.to_le_bytes());
    let mut frame = TrapFrame::new(ESP);
    assert_eq!(h.kernel.handle_syscall(h.pid, &mut frame), Flow::Exit(-1));
    assert_eq!(h.exit_status(), Some(-1));
}

#[test]
fn exit_records_status_and_releases_frames() {
    let h = Harness::boot(8, 2);
    h.put(DATA, b"foo\0");
    assert_eq!(h.value(Syscall::Create, &[ptr(DATA), 4]), 1);
    assert!(h.value(Syscall::Open, &[ptr(DATA)]) > 1);
    assert_eq!(h.kernel.frames().len(), 3);

    assert_eq!(h.call(Syscall::Exit, &[3]).0, Flow::Exit(3));
    assert_eq!(h.exit_status(), Some(3));
    assert!(h.kernel.frames().is_empty());
    assert_eq!(h.kernel.frames().pool().free_frames(), 8);
    assert!(h.kernel.processes().get(h.pid).unwrap().files.is_empty());
}

#[test]
fn exec_returns_pid_only_for_loaded_children() {
    let h = Harness::boot(8, 1);
    h.put(DATA, b"ok-child arg\0");
    h.put(DATA + 0x40, b"broken\0");

    assert_eq!(h.value(Syscall::Exec, &[ptr(DATA)]), 100);
    assert_eq!(h.value(Syscall::Exec, &[ptr(DATA + 0x40)]), -1);
    assert_eq!(
        *h.kernel.host().commands.borrow(),
        ["ok-child arg".to_owned(), "broken".to_owned()]
    );
    assert_eq!(h.value(Syscall::Wait, &[100]), 200);
}

#[test]
fn exec_with_bad_command_pointer_kills() {
    let h = Harness::boot(8, 1);
    let (flow, _) = h.call(Syscall::Exec, &[ptr(USER_TOP)]);
    assert_eq!(flow, Flow::Exit(-1));
    assert!(h.kernel.host().commands.borrow().is_empty());
}

#[test]
fn file_name_straddling_pages_is_copied_whole() {
    let h = Harness::boot(8, 2);
    let name = DATA + PAGE_SIZE - 3;
    h.put(name, b"split\0");
    assert_eq!(h.value(Syscall::Create, &[ptr(name), 0]), 1);
    assert!(h.kernel.fs().files.contains_key("split"));
}

#[test]
fn descriptors_are_not_reused_after_close() {
    let h = Harness::boot(8, 1);
    h.put(DATA, b"foo\0");
    h.value(Syscall::Create, &[ptr(DATA), 0]);

    let first = h.value(Syscall::Open, &[ptr(DATA)]);
    assert_eq!(h.call(Syscall::Close, &[first as u32]).0, Flow::Resume);
    let second = h.value(Syscall::Open, &[ptr(DATA)]);
    assert!(second > first);
    assert_eq!(h.value(Syscall::Filesize, &[first as u32]), -1);
}

#[test]
fn open_missing_file_fails() {
    let h = Harness::boot(8, 1);
    h.put(DATA, b"nope\0");
    assert_eq!(h.value(Syscall::Open, &[ptr(DATA)]), -1);
    assert_eq!(h.value(Syscall::Remove, &[ptr(DATA)]), 0);
}

#[test]
fn file_write_seek_read_round_trip() {
    let h = Harness::boot(8, 1);
    h.put(DATA, b"log\0");
    h.put(DATA + 0x100, b"payload");
    h.value(Syscall::Create, &[ptr(DATA), 0]);
    let fd = h.value(Syscall::Open, &[ptr(DATA)]) as u32;

    assert_eq!(h.value(Syscall::Write, &[fd, ptr(DATA + 0x100), 7]), 7);
    assert_eq!(h.value(Syscall::Tell, &[fd]), 7);
    assert_eq!(h.value(Syscall::Filesize, &[fd]), 7);
    assert_eq!(h.call(Syscall::Seek, &[fd, 3]).0, Flow::Resume);
    assert_eq!(h.value(Syscall::Read, &[fd, ptr(DATA + 0x200), 16]), 4);

    let mut buf = [0u8; 4];
    h.kernel
        .copy_from_user(h.pid, VirtAddr::new(DATA + 0x200), &mut buf)
        .unwrap();
    assert_eq!(&buf, b"load");
    assert!(h.console().is_empty());
}

#[test]
fn read_into_read_only_page_kills() {
    let h = Harness::boot(8, 1);
    let ro = DATA + PAGE_SIZE;
    h.kernel
        .map_user_page(h.pid, VirtAddr::new(ro), false)
        .unwrap();
    h.kernel.console().push_input(b"abc");
    let (flow, _) = h.call(Syscall::Read, &[0, ptr(ro), 3]);
    assert_eq!(flow, Flow::Exit(-1));
}

#[test]
fn read_from_console_input() {
    let h = Harness::boot(8, 1);
    h.kernel.console().push_input(b"abc");
    assert_eq!(h.value(Syscall::Read, &[0, ptr(DATA), 8]), 3);
    let mut buf = [0u8; 3];
    h.kernel
        .copy_from_user(h.pid, VirtAddr::new(DATA), &mut buf)
        .unwrap();
    assert_eq!(&buf, b"abc");
}

#[test]
fn bad_descriptors_return_minus_one() {
    let h = Harness::boot(8, 1);
    assert_eq!(h.value(Syscall::Write, &[0, ptr(DATA), 1]), -1);
    assert_eq!(h.value(Syscall::Write, &[42, ptr(DATA), 1]), -1);
    assert_eq!(h.value(Syscall::Read, &[1, ptr(DATA), 1]), -1);
    assert_eq!(h.value(Syscall::Tell, &[42]), -1);
    assert_eq!(h.exit_status(), None);
}

#[test]
fn large_console_write_is_chunked_in_order() {
    let h = Harness::boot(8, 3);
    let bytes: Vec<u8> = (0..2 * PAGE_SIZE + 10).map(|i| b'a' + (i % 26) as u8).collect();
    h.put(DATA + 5, &bytes);
    let len = bytes.len() as u32;
    assert_eq!(h.value(Syscall::Write, &[1, ptr(DATA + 5), len]), len as i32);
    assert_eq!(h.console(), bytes);
}

#[test]
fn placeholders_return_neutral_values() {
    let h = Harness::boot(8, 1);
    h.put(DATA, b"dir\0");
    assert_eq!(h.value(Syscall::Mmap, &[2, ptr(DATA)]), 0);
    assert_eq!(h.value(Syscall::Mkdir, &[ptr(DATA)]), 0);
    assert_eq!(h.value(Syscall::Chdir, &[ptr(DATA)]), 0);
    assert_eq!(h.value(Syscall::Readdir, &[2, ptr(DATA)]), 0);
    assert_eq!(h.value(Syscall::Isdir, &[2]), 0);
    assert_eq!(h.value(Syscall::Inumber, &[2]), 0);

    let mut frame = TrapFrame::new(ESP);
    frame.eax = 0xdead;
    h.put(ESP, &stack_words(Syscall::Munmap, &[1]));
    assert_eq!(h.kernel.handle_syscall(h.pid, &mut frame), Flow::Resume);
    assert_eq!(frame.eax, 0xdead);
}

#[test]
fn halt_powers_off() {
    let h = Harness::boot(8, 1);
    assert_eq!(h.call(Syscall::Halt, &[]).0, Flow::Halt);
    assert!(h.kernel.host().powered_off.get());
    assert_eq!(h.exit_status(), None);
}
