//! Console driver interface.
//!
//! User writes to descriptor 1 end up here, one copied chunk at a time.
//! Kernel diagnostics go through `log`, never through the console.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt::{self, Write};

/// Byte-oriented console device.
pub trait Console {
    /// Emit `bytes` in order.
    fn putbuf(&mut self, bytes: &[u8]);

    /// Next input byte, if one is available.
    fn getc(&mut self) -> Option<u8> {
        None
    }
}

/// In-memory console: records output and serves queued input.
#[derive(Debug, Default)]
pub struct BufferConsole {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

impl BufferConsole {
    pub const fn new() -> Self {
        Self {
            output: Vec::new(),
            input: VecDeque::new(),
        }
    }

    /// Everything written so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Take the recorded output, leaving the buffer empty.
    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.output)
    }

    /// Queue bytes to be returned by `getc`.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }
}

impl Console for BufferConsole {
    fn putbuf(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}

impl Write for BufferConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.putbuf(s.as_bytes());
        Ok(())
    }
}
