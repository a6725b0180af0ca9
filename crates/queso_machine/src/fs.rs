//! The file system seam and its in-memory stub.
//!
//! The kernel only ever sees [`FileSystem`] and [`OpenFile`]; path syntax,
//! storage layout and executables-by-name are the stub's business.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::loader::Binary;

/// What the kernel consumes: open (optionally creating) and remove.
pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str, create: bool) -> Option<Box<dyn OpenFile>>;
    fn remove(&self, name: &str) -> bool;
}

/// A stream-positioned open file.
pub trait OpenFile: Send {
    /// Reads up to `buf.len()` bytes; 0 means end of data.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Writes `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> usize;
}

type FileData = Arc<Mutex<Vec<u8>>>;

/// An in-memory file system.
///
/// Removal unlinks the name; open handles keep the data alive, so a file
/// can be read and written after it has been unlinked.
#[derive(Default)]
pub struct MemFileSystem {
    files: Mutex<HashMap<String, FileData>>,
    binaries: Mutex<HashMap<String, Binary>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executable under `name`.
    pub fn install_binary(&self, name: &str, binary: Binary) {
        self.binaries.lock().unwrap().insert(name.to_owned(), binary);
    }

    /// Looks up an executable previously installed under `name`.
    pub fn binary(&self, name: &str) -> Option<Binary> {
        self.binaries.lock().unwrap().get(name).cloned()
    }

    /// Snapshot of a file's contents, for tests and tools.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        let data = self.files.lock().unwrap().get(name)?.clone();
        let data = data.lock().unwrap();
        Some(data.clone())
    }
}

impl FileSystem for MemFileSystem {
    fn open(&self, name: &str, create: bool) -> Option<Box<dyn OpenFile>> {
        let mut files = self.files.lock().unwrap();
        let data = match files.get(name) {
            Some(data) => data.clone(),
            None if create => {
                let data = FileData::default();
                files.insert(name.to_owned(), data.clone());
                data
            }
            None => return None,
        };
        Some(Box::new(MemFile { data, pos: 0 }))
    }

    fn remove(&self, name: &str) -> bool {
        self.files.lock().unwrap().remove(name).is_some()
    }
}

struct MemFile {
    data: FileData,
    pos: usize,
}

impl OpenFile for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(self.pos));
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut file = self.data.lock().unwrap();
        if file.len() < self.pos + data.len() {
            file.resize(self.pos + data.len(), 0);
        }
        file[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        data.len()
    }
}
