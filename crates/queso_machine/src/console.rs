//! The console device.
//!
//! A byte queue for input and a growing buffer for output, exposed through
//! the same [`OpenFile`] seam the file system uses so the kernel can mount
//! the device as fd 0 and fd 1.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::fs::OpenFile;

#[derive(Default)]
struct ConsoleInner {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

/// The machine console. Cheap to clone; all clones share the device.
#[derive(Clone, Default)]
pub struct Console {
    inner: Arc<ConsoleInner>,
}

impl Console {
    pub fn new(input: Vec<u8>) -> Self {
        let console = Self::default();
        console.feed(&input);
        console
    }

    /// Appends bytes to the pending input.
    pub fn feed(&self, bytes: &[u8]) {
        self.inner.input.lock().unwrap().extend(bytes);
    }

    /// Takes everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.output.lock().unwrap())
    }

    /// A handle that drains console input.
    pub fn open_for_reading(&self) -> Box<dyn OpenFile> {
        Box::new(ConsoleReader {
            console: self.clone(),
        })
    }

    /// A handle that appends to console output.
    pub fn open_for_writing(&self) -> Box<dyn OpenFile> {
        Box::new(ConsoleWriter {
            console: self.clone(),
        })
    }
}

struct ConsoleReader {
    console: Console,
}

impl OpenFile for ConsoleReader {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut input = self.console.inner.input.lock().unwrap();
        let n = buf.len().min(input.len());
        for slot in &mut buf[..n] {
            *slot = input.pop_front().unwrap();
        }
        n
    }

    fn write(&mut self, _data: &[u8]) -> usize {
        0
    }
}

struct ConsoleWriter {
    console: Console,
}

impl OpenFile for ConsoleWriter {
    fn read(&mut self, _buf: &mut [u8]) -> usize {
        0
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.console.inner.output.lock().unwrap().extend(data);
        data.len()
    }
}
