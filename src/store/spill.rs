
//! Disk spill files for purged blocks.
//!
//! Blocks are kept in three files: full standard-size blocks in one,
//! 512-byte-aligned data in another, and everything else in a third.
//! This gives the best alignment, contiguity and clustering, all of which
//! help read performance when blocks stream back in during rendering.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result, UnitResult};
use crate::fs::{Fd, FileSystem, OpenFlags, SeekMode};
use super::BLOCK_DEFAULT_SIZE;

/// Alignment unit of the middle spill bucket.
pub const BLOCK_MIN: usize = 512;


/// Which of the three spill files a block landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillBucket {

    /// Exactly one standard block.
    Standard,

    /// A multiple of the minimum block size.
    Aligned,

    /// Anything else.
    Variable,
}

impl SpillBucket {

    /// Classify a byte count into its bucket.
    pub fn for_size(bytes: usize) -> Self {
        if bytes == BLOCK_DEFAULT_SIZE { SpillBucket::Standard }
        else if bytes % BLOCK_MIN == 0 { SpillBucket::Aligned }
        else { SpillBucket::Variable }
    }

    fn index(self) -> usize {
        match self {
            SpillBucket::Standard => 0,
            SpillBucket::Aligned => 1,
            SpillBucket::Variable => 2,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            SpillBucket::Standard => "IM/b16384",
            SpillBucket::Aligned => "IM/b512",
            SpillBucket::Variable => "IM/bvar",
        }
    }
}

/// Where a spilled block lives, and how long it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillAddress {
    pub bucket: SpillBucket,
    pub offset: u64,
    pub bytes: usize,
}

#[derive(Debug, Default)]
struct BucketState {
    fd: Option<Fd>,
    next_offset: u64,
}

/// The three spill files, shared by all stores for locality.
/// Offsets are only ever handed out once, so writes never overlap and
/// the files need no free list.
pub struct SpillSet {
    fs: Arc<dyn FileSystem>,
    buckets: Mutex<[BucketState; 3]>,
}

impl std::fmt::Debug for SpillSet {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("SpillSet").finish()
    }
}

impl SpillSet {

    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs, buckets: Mutex::new(Default::default()) }
    }

    /// Write block bytes, returning where they can be read back from.
    pub fn write_block(&self, data: &[u8]) -> Result<SpillAddress> {
        let bucket = SpillBucket::for_size(data.len());
        let mut buckets = self.buckets.lock().unwrap();
        let state = &mut buckets[bucket.index()];

        let fd = match state.fd {
            Some(fd) => fd,
            None => {
                let fd = self.fs.open(
                    bucket.file_name(),
                    OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE | OpenFlags::TRUNCATE
                )?;
                state.fd = Some(fd);
                fd
            }
        };

        let offset = state.next_offset;
        self.fs.seek(fd, offset as i64, SeekMode::Set)?;
        self.fs.write(fd, data)?;
        state.next_offset = offset + data.len() as u64;

        log::debug!("spilled {} block bytes to {:?} at {}", data.len(), bucket, offset);
        Ok(SpillAddress { bucket, offset, bytes: data.len() })
    }

    /// Read back a previously written block.
    pub fn read_block(&self, address: SpillAddress, into: &mut [u8]) -> UnitResult {
        let buckets = self.buckets.lock().unwrap();
        let state = &buckets[address.bucket.index()];
        let fd = state.fd.ok_or(Error::Internal("spill file never written"))?;

        self.fs.seek(fd, address.offset as i64, SeekMode::Set)?;

        let mut filled = 0;
        while filled < into.len() {
            let count = self.fs.read(fd, &mut into[filled ..])?;
            if count == 0 { return Err(Error::corrupt("spill file truncated")); }
            filled += count;
        }

        Ok(())
    }

    /// Close and delete all spill files.
    pub fn clear(&self) -> UnitResult {
        let mut buckets = self.buckets.lock().unwrap();

        for (index, state) in buckets.iter_mut().enumerate() {
            if let Some(fd) = state.fd.take() {
                self.fs.close(fd)?;

                let bucket = [SpillBucket::Standard, SpillBucket::Aligned, SpillBucket::Variable][index];
                self.fs.delete(bucket.file_name())?;
            }

            state.next_offset = 0;
        }

        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::MemoryFileSystem;

    #[test]
    fn buckets(){
        assert_eq!(SpillBucket::for_size(16384), SpillBucket::Standard);
        assert_eq!(SpillBucket::for_size(512), SpillBucket::Aligned);
        assert_eq!(SpillBucket::for_size(1536), SpillBucket::Aligned);
        assert_eq!(SpillBucket::for_size(1000), SpillBucket::Variable);
    }

    #[test]
    fn write_read_back(){
        let spill = SpillSet::new(Arc::new(MemoryFileSystem::new()));

        let small: Vec<u8> = (0..1000_u32).map(|value| value as u8).collect();
        let aligned = vec![7_u8; 1024];

        let at_small = spill.write_block(&small).unwrap();
        let at_aligned = spill.write_block(&aligned).unwrap();
        let at_small2 = spill.write_block(&small).unwrap();

        assert_ne!(at_small.offset, at_small2.offset);
        assert_ne!(at_small.bucket, at_aligned.bucket);

        let mut readback = vec![0_u8; 1000];
        spill.read_block(at_small2, &mut readback).unwrap();
        assert_eq!(readback, small);

        let mut readback = vec![0_u8; 1024];
        spill.read_block(at_aligned, &mut readback).unwrap();
        assert_eq!(readback, aligned);
    }
}
