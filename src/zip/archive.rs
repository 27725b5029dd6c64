
//! Byte-level access to an archive source.
//!
//! An archive is either seekable, in which case the central directory
//! drives everything, or a forward-only stream discovered record by
//! record. The creating side never reads.

use std::io::SeekFrom;

use crate::error::{Error, Result, UnitResult};
use crate::io::{Read, Seek};
use super::records::{ALL_SIGNATURES, SIG_END_CDIR};


/// Window size for raw transfers and the end-of-directory back-scan.
pub const ARCHIVE_BUFFER_SIZE: usize = 16384;

/// A readable, seekable archive source.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

enum Source {
    Seekable(Box<dyn ReadSeek>),
    Streamed(Box<dyn Read>),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(match self {
            Source::Seekable(_) => "Source::Seekable",
            Source::Streamed(_) => "Source::Streamed",
        })
    }
}

/// One mounted archive's byte source.
#[derive(Debug)]
pub struct ZipArchive {
    source: Source,

    /// Total size; only known for seekable sources.
    extent: u64,

    /// Current read offset from the start of the archive.
    position: u64,

    /// Whether every entry of the archive has been seen.
    complete: bool,
}

impl ZipArchive {

    /// Open a seekable source, measuring its extent.
    pub fn seekable(mut read: Box<dyn ReadSeek>) -> Result<Self> {
        let extent = read.seek(SeekFrom::End(0))?;
        read.seek(SeekFrom::Start(0))?;

        Ok(ZipArchive {
            source: Source::Seekable(read),
            extent,
            position: 0,
            complete: false,
        })
    }

    /// Wrap a forward-only stream.
    pub fn streamed(read: Box<dyn Read>) -> Self {
        ZipArchive {
            source: Source::Streamed(read),
            extent: 0,
            position: 0,
            complete: false,
        }
    }

    pub fn is_streamed(&self) -> bool {
        matches!(self.source, Source::Streamed(_))
    }

    pub fn is_complete(&self) -> bool { self.complete }

    pub fn set_complete(&mut self) { self.complete = true; }

    /// Total archive size. Zero for streams.
    pub fn extent(&self) -> u64 { self.extent }

    /// Current read offset.
    pub fn position(&self) -> u64 { self.position }

    /// The transfer size this source performs best at.
    pub fn buffer_size(&self) -> usize { ARCHIVE_BUFFER_SIZE }

    /// Seek to an absolute offset. Streams cannot seek.
    pub fn set_position(&mut self, position: u64) -> UnitResult {
        match &mut self.source {
            Source::Seekable(read) => {
                read.seek(SeekFrom::Start(position))?;
                self.position = position;
                Ok(())
            },

            Source::Streamed(_) => Err(Error::Internal("seek on a streamed archive")),
        }
    }

    /// Read up to the buffer's length, returning the byte count.
    pub fn read_raw(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let source: &mut dyn Read = match &mut self.source {
            Source::Seekable(read) => read,
            Source::Streamed(read) => read,
        };

        let mut filled = 0;
        while filled < buffer.len() {
            let count = source.read(&mut buffer[filled ..])?;
            if count == 0 { break; }
            filled += count;
        }

        self.position += filled as u64;
        Ok(filled)
    }

    /// Read exactly the buffer's length or fail.
    pub fn read_exact(&mut self, buffer: &mut [u8]) -> UnitResult {
        if self.read_raw(buffer)? != buffer.len() {
            return Err(Error::corrupt("unexpected end of archive"));
        }

        Ok(())
    }

    /// Consume bytes without a destination.
    pub fn skip(&mut self, mut bytes: u64) -> UnitResult {
        if let Source::Seekable(_) = self.source {
            let target = self.position + bytes;
            return self.set_position(target);
        }

        let mut buffer = [0_u8; ARCHIVE_BUFFER_SIZE];
        while bytes > 0 {
            let step = (bytes as usize).min(ARCHIVE_BUFFER_SIZE);
            self.read_exact(&mut buffer[.. step])?;
            bytes -= step as u64;
        }

        Ok(())
    }

    /// Read a 4-byte signature, failing on anything unrecognized.
    pub fn read_sig(&mut self) -> Result<u32> {
        let mut buffer = [0_u8; 4];
        self.read_exact(&mut buffer)?;

        let sig = u32::from_le_bytes(buffer);
        if ALL_SIGNATURES.contains(&sig) { Ok(sig) }
        else { Err(Error::corrupt("unrecognized record signature")) }
    }

    /// Scan forward for the next recognized signature, leaving the source
    /// positioned after it. Realigns on every `P` so signatures are found
    /// at any offset.
    pub fn next_sig(&mut self) -> Result<u32> {
        match self.next_sig_or_end()? {
            Some(sig) => Ok(sig),
            None => Err(Error::corrupt("unexpected end of archive")),
        }
    }

    /// Like [`Self::next_sig`], but a clean end of the source before any
    /// further signature yields `None` instead of an error.
    pub fn next_sig_or_end(&mut self) -> Result<Option<u32>> {
        let mut buffer = [0_u8; 4];

        match self.read_raw(&mut buffer)? {
            0 => return Ok(None),
            4 => {},
            _ => return Err(Error::corrupt("unexpected end of archive")),
        }

        loop {
            let mut index = 0;
            while index < 4 {
                if buffer[index] == b'P' {
                    if index > 0 {
                        buffer.copy_within(index .. 4, 0);
                        self.read_exact(&mut buffer[4 - index ..])?;
                    }

                    let sig = u32::from_le_bytes(buffer);
                    if ALL_SIGNATURES.contains(&sig) {
                        return Ok(Some(sig));
                    }

                    index = 0;
                }

                index += 1;
            }

            match self.read_raw(&mut buffer)? {
                0 => return Ok(None),
                4 => {},
                _ => return Err(Error::corrupt("unexpected end of archive")),
            }
        }
    }

    /// Scan backward from the end of a seekable archive for the
    /// end-of-central-directory signature. Returns with the source
    /// positioned just after the signature, ready to read the record,
    /// and also returns that position.
    ///
    /// Windows overlap by three bytes so a signature straddling two
    /// windows is still seen; the overlap starts zeroed so the first
    /// window cannot produce a false match.
    pub fn find_end_cdir(&mut self) -> Result<u64> {
        if self.is_streamed() {
            return Err(Error::Internal("back-scan on a streamed archive"));
        }

        let signature = SIG_END_CDIR.to_le_bytes();
        let mut buffer = [0_u8; ARCHIVE_BUFFER_SIZE + 3];
        let mut window_start = self.extent;
        let mut window_size = ARCHIVE_BUFFER_SIZE;

        loop {
            if window_start == 0 { return Err(Error::corrupt("no end of central directory")); }

            // move back a window, shrinking at the start of the file
            let overlap = [buffer[0], buffer[1], buffer[2]];

            if window_start < ARCHIVE_BUFFER_SIZE as u64 {
                window_size = window_start as usize;
                window_start = 0;
            } else {
                window_start -= ARCHIVE_BUFFER_SIZE as u64;
            }

            buffer[window_size .. window_size + 3].copy_from_slice(&overlap);

            self.set_position(window_start)?;
            self.read_exact(&mut buffer[.. window_size])?;

            for index in 0 .. window_size {
                if buffer[index .. index + 4] == signature {
                    let position = window_start + index as u64 + 4;
                    self.set_position(position)?;
                    return Ok(position);
                }
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn next_sig_skips_garbage(){
        // garbage containing stray Ps, then a data descriptor signature
        let mut bytes = b"xxPxPKxxPK\x01PK\x07\x08rest".to_vec();
        bytes.extend_from_slice(&[0; 16]);

        let mut archive = ZipArchive::streamed(Box::new(Cursor::new(bytes)));
        assert_eq!(archive.next_sig().unwrap(), super::super::records::SIG_DATA_DESCRIPTOR);

        // positioned just after the signature, which ends at byte 15
        assert_eq!(archive.position(), 15);
    }

    #[test]
    fn find_end_cdir_across_window_boundary(){
        // place the signature so it straddles the 16 KiB window boundary
        let total = ARCHIVE_BUFFER_SIZE + 2;
        let mut bytes = vec![0_u8; total];
        let position = total - ARCHIVE_BUFFER_SIZE - 2; // two bytes in the early window
        bytes[position .. position + 4].copy_from_slice(b"PK\x05\x06");

        let mut archive = ZipArchive::seekable(Box::new(Cursor::new(bytes))).unwrap();
        let found = archive.find_end_cdir().unwrap();
        assert_eq!(found, position as u64 + 4);
    }

    #[test]
    fn find_end_cdir_missing(){
        let bytes = vec![b'P'; 100];
        let mut archive = ZipArchive::seekable(Box::new(Cursor::new(bytes))).unwrap();
        assert!(archive.find_end_cdir().is_err());
    }
}
