
//! The scratch-filesystem contract.
//!
//! Both cores of this crate park bytes on a host filesystem: the image store
//! spills purged blocks into its spill files, and the ZIP device extracts
//! archive entries into scratch files. Hosts plug in whatever storage they
//! have by implementing [`FileSystem`]; the crate ships a [`MemoryFileSystem`]
//! for tests and RAM-backed configurations and a [`DiskFileSystem`] over
//! `std::fs`.

pub mod memory;
pub mod disk;

pub use memory::MemoryFileSystem;
pub use disk::DiskFileSystem;

use crate::error::{Result, UnitResult};

bitflags::bitflags! {

    /// How a scratch file is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ     = 0x01;
        const WRITE    = 0x02;

        /// Create the file if it does not exist.
        const CREATE   = 0x04;

        /// Discard existing contents.
        const TRUNCATE = 0x08;

        /// Position writes at the end.
        const APPEND   = 0x10;

        /// Fail if the file is already held by anyone.
        const EXCL     = 0x20;
    }
}

/// Where a seek offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {

    /// From the start of the file.
    Set,

    /// From the current position.
    Incr,

    /// From the end of the file.
    Xtnd,
}

/// Descriptor for an open scratch file, unique per filesystem instance.
pub type Fd = i32;

/// What `stat` reports about a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {

    /// Current size in bytes.
    pub bytes: u64,

    /// Modification time in seconds since the epoch, if the host tracks one.
    pub mtime: Option<u64>,
}

/// Free and total space, as far as the host knows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStatus {
    pub free_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

/// An in-progress directory listing. Dropping it ends the listing.
pub trait FileList {

    /// The next matching name, or `None` at the end.
    fn next_name(&mut self) -> Option<String>;
}


/// The backing device contract. All methods take `&self`: implementations
/// are shared between a device and its open streams and synchronize
/// internally.
pub trait FileSystem: Send + Sync {

    /// Open a file, returning a descriptor.
    fn open(&self, name: &str, flags: OpenFlags) -> Result<Fd>;

    /// Read into the buffer, returning the byte count; 0 means end of file.
    fn read(&self, fd: Fd, buffer: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer, returning the byte count.
    fn write(&self, fd: Fd, buffer: &[u8]) -> Result<usize>;

    /// Move the file position, returning the new absolute position.
    /// Seeking past the end extends the file with zeroes on the next write.
    fn seek(&self, fd: Fd, offset: i64, mode: SeekMode) -> Result<u64>;

    /// Close a descriptor, flushing as needed.
    fn close(&self, fd: Fd) -> UnitResult;

    /// Tear down a descriptor on an error path, without flushing.
    fn abort(&self, fd: Fd) -> UnitResult;

    /// Size and times for a name.
    fn stat(&self, name: &str) -> Result<FileStat>;

    /// Remove a file by name. The file must not be open.
    fn delete(&self, name: &str) -> UnitResult;

    /// Rename a file. The file must not be open.
    fn rename(&self, from: &str, to: &str) -> UnitResult;

    /// Begin iterating names matching a `*` glob pattern.
    fn start_list(&self, pattern: &str) -> Result<Box<dyn FileList>>;

    /// Device-specific control. The base contract recognizes no opcodes.
    fn ioctl(&self, _fd: Fd, _opcode: i32, _arg: i32) -> Result<i32> {
        Err(crate::error::Error::invalid("unknown ioctl opcode"))
    }

    /// The transfer size this device performs best at.
    fn preferred_buffer_size(&self) -> usize { 16384 }

    /// Capacity information, if the host can provide it.
    fn device_status(&self) -> DeviceStatus { DeviceStatus::default() }
}


/// Match a name against a pattern where `*` matches any run of characters.
pub(crate) fn pattern_matches(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            pattern_matches(&pattern[1..], name)
                || (!name.is_empty() && pattern_matches(pattern, &name[1..]))
        },
        (Some(&p), Some(&n)) if p == n => pattern_matches(&pattern[1..], &name[1..]),
        _ => false,
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn patterns(){
        assert!(pattern_matches(b"*", b"anything/at.all"));
        assert!(pattern_matches(b"ZIP/*", b"ZIP/0a000001"));
        assert!(!pattern_matches(b"ZIP/*", b"ZAP/0a000001"));
        assert!(pattern_matches(b"*.piece", b"foo.xml/[0].piece"));
        assert!(pattern_matches(b"", b""));
        assert!(!pattern_matches(b"", b"x"));
    }
}
