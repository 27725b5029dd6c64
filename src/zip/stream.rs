
//! Descriptor table for open file streams.
//!
//! Every open on the device hands out an external descriptor that maps to
//! a logical file and a descriptor on the scratch filesystem. On error
//! teardown streams are aborted rather than closed.

use crate::error::{Error, Result, UnitResult};
use crate::fs::{Fd, FileSystem};


/// One open stream.
#[derive(Debug)]
pub(crate) struct FileStream {

    /// Index of the logical file in the device's file arena.
    pub file: usize,

    /// Descriptor on the scratch filesystem.
    pub scratch_fd: Fd,

    /// Whether writes are permitted through this stream.
    pub writable: bool,

    /// Whether this open holds the file exclusively.
    pub exclusive: bool,
}

/// All open streams of one device.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    streams: Vec<Option<FileStream>>,
}

impl StreamTable {

    /// Register a stream, returning its external descriptor.
    pub fn insert(&mut self, stream: FileStream) -> Fd {
        match self.streams.iter().position(Option::is_none) {
            Some(free) => {
                self.streams[free] = Some(stream);
                free as Fd + 1
            },

            None => {
                self.streams.push(Some(stream));
                self.streams.len() as Fd
            },
        }
    }

    pub fn get(&self, fd: Fd) -> Result<&FileStream> {
        self.streams.get(fd as usize - 1)
            .and_then(Option::as_ref)
            .ok_or(Error::invalid("bad file descriptor"))
    }

    pub fn remove(&mut self, fd: Fd) -> Result<FileStream> {
        if fd < 1 { return Err(Error::invalid("bad file descriptor")); }

        self.streams.get_mut(fd as usize - 1)
            .and_then(Option::take)
            .ok_or(Error::invalid("bad file descriptor"))
    }

    /// Whether any stream refers to the given file.
    pub fn any_open_on(&self, file: usize) -> bool {
        self.streams.iter().flatten().any(|stream| stream.file == file)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileStream> {
        self.streams.iter().flatten()
    }

    /// Abort every stream, for error teardown and dismount.
    pub fn abort_all(&mut self, fs: &dyn FileSystem) -> UnitResult {
        for stream in self.streams.iter_mut().filter_map(Option::take) {
            fs.abort(stream.scratch_fd)?;
        }

        self.streams.clear();
        Ok(())
    }
}
