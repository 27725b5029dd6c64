
//! Logical files and on-demand extraction.
//!
//! A logical file is an ordered list of pieces, each backed by one
//! physical archive entry. Readers never touch archive bytes directly:
//! data is extracted into a scratch file as far as a read requires, and
//! the scratch file serves all further traffic.

use std::convert::TryInto;

use smallvec::SmallVec;

use crate::error::{Error, Result, UnitResult};
use crate::flate::RawInflater;
use crate::fs::{Fd, FileSystem, OpenFlags, SeekMode};
use super::archive::ZipArchive;
use super::records::{
    DataDescriptor, LocalFile, METHOD_DEFLATE, SIG_DATA_DESCRIPTOR, SIG_LOCAL_FILE,
    DATA_DESCRIPTOR_SIZE, ZIP64_DATA_DESCRIPTOR_SIZE,
};
use super::reader::EntryInfo;


/// Extraction transfer size.
pub const FILE_BUFFER_SIZE: usize = 16384;


/// How a piece's bytes come out of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractMode {

    /// Raw copy clipped to the known size.
    StoreKnown,

    /// Byte-by-byte through a read-ahead window until the data
    /// descriptor announces the end.
    StoreUnknown,

    /// Inflate from a window of known compressed size.
    FlateKnown,

    /// Inflate one byte at a time until the stream ends.
    FlateUnknown,
}

/// One physical entry contributing a slice of a logical file.
#[derive(Debug)]
pub(crate) struct Piece {
    pub number: u32,
    pub last: bool,

    /// Offset of the local file header in a seekable archive.
    pub local_header_offset: u64,

    /// Where the next compressed byte sits in a seekable archive.
    /// `None` until the piece is set up, and always `None` for streams.
    next_read_pos: Option<u64>,

    mode: Option<ExtractMode>,

    pub compression: u16,
    pub has_data_descriptor: bool,
    pub zip64: bool,

    /// Compressed size as declared, untouched by extraction.
    pub compressed_size: u64,

    pub compressed_left: u64,
    pub uncompressed_size: u64,

    /// False while a streamed piece has not yet seen its descriptor.
    pub size_known: bool,

    /// Uncompressed bytes extracted from this piece so far.
    pub extracted: u64,

    pub crc_expected: Option<u32>,
    hasher: crc32fast::Hasher,

    /// Window for [`ExtractMode::StoreUnknown`].
    read_ahead: Vec<u8>,

    /// Unconsumed compressed input carried between extract calls.
    in_buffer: Vec<u8>,
    in_pos: usize,

    flate_end: bool,
    pub done: bool,
}

impl Piece {

    pub fn new(number: u32, last: bool, info: &EntryInfo, streamed: bool) -> Self {
        let sizes_deferred = streamed && info.has_data_descriptor();

        Piece {
            number,
            last,
            local_header_offset: info.local_header_offset,
            next_read_pos: None,
            mode: None,
            compression: info.compression,

            // sizes and checksum come from the central directory on
            // seekable archives, so the descriptor is irrelevant there
            has_data_descriptor: sizes_deferred,

            zip64: info.zip64,
            compressed_size: info.compressed,
            compressed_left: info.compressed,
            uncompressed_size: info.uncompressed,
            size_known: !sizes_deferred,
            extracted: 0,
            crc_expected: if sizes_deferred { None } else { Some(info.crc32) },
            hasher: crc32fast::Hasher::new(),
            read_ahead: Vec::new(),
            in_buffer: Vec::new(),
            in_pos: 0,
            flate_end: false,
            done: false,
        }
    }

    /// Position the archive at the piece's data and choose the extractor.
    fn setup(&mut self, archive: &mut ZipArchive, inflater: &mut Option<RawInflater>) -> UnitResult {
        if !archive.is_streamed() {
            // find the start of the piece data behind its local header,
            // whose extras can differ from the central directory's
            archive.set_position(self.local_header_offset)?;

            let mut sig = [0_u8; 4];
            archive.read_exact(&mut sig)?;
            if u32::from_le_bytes(sig) != SIG_LOCAL_FILE {
                return Err(Error::corrupt("local file header expected"));
            }

            LocalFile::read(&mut ArchiveReader(archive))?;
            self.next_read_pos = Some(archive.position());
        }

        let flate = self.compression == METHOD_DEFLATE;

        self.mode = Some(match (flate, self.has_data_descriptor && archive.is_streamed()) {
            (false, false) => ExtractMode::StoreKnown,
            (false, true) => ExtractMode::StoreUnknown,
            (true, false) => ExtractMode::FlateKnown,
            (true, true) => ExtractMode::FlateUnknown,
        });

        if flate {
            match inflater {
                Some(inflater) => inflater.reset(),
                None => *inflater = Some(RawInflater::new()),
            }
        }
        else {
            *inflater = None;
        }

        Ok(())
    }

    /// The CRC accumulated over extracted bytes so far.
    fn running_crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Extract at most one buffer's worth. Returning 0 means the piece
    /// has delivered all its data.
    fn extract_chunk(
        &mut self, archive: &mut ZipArchive, inflater: &mut Option<RawInflater>, out: &mut [u8],
    ) -> Result<usize> {
        debug_assert!(!out.is_empty());

        let count = match self.mode.expect("piece extracted before setup") {
            ExtractMode::StoreKnown => self.extract_store_known(archive, out)?,
            ExtractMode::StoreUnknown => return self.extract_store_unknown(archive, out),
            ExtractMode::FlateKnown => self.extract_flate(archive, inflater, out, true)?,
            ExtractMode::FlateUnknown => self.extract_flate(archive, inflater, out, false)?,
        };

        // the stored-unknown engine maintains its checksum per byte;
        // everyone else checksums whole output chunks here
        self.hasher.update(&out[.. count]);
        self.extracted += count as u64;
        Ok(count)
    }

    fn seek_to_data(&mut self, archive: &mut ZipArchive) -> UnitResult {
        if let Some(position) = self.next_read_pos {
            if archive.position() != position {
                archive.set_position(position)?;
            }
        }

        Ok(())
    }

    fn note_read(&mut self, bytes: u64) {
        if let Some(position) = self.next_read_pos.as_mut() {
            *position += bytes;
        }
    }

    fn extract_store_known(&mut self, archive: &mut ZipArchive, out: &mut [u8]) -> Result<usize> {
        let remaining = self.uncompressed_size - self.extracted;
        let count = (out.len() as u64).min(remaining) as usize;
        if count == 0 { return Ok(0); }

        self.seek_to_data(archive)?;
        archive.read_exact(&mut out[.. count])?;
        self.note_read(count as u64);
        Ok(count)
    }

    /// The end of a stored piece of unknown size is found by matching the
    /// read-ahead window against a data descriptor: an optional signature,
    /// then the running CRC, then a compressed size equal to the byte
    /// count extracted so far. The test runs before the first byte, so a
    /// zero-length piece terminates immediately.
    fn extract_store_unknown(&mut self, archive: &mut ZipArchive, out: &mut [u8]) -> Result<usize> {
        if self.size_known {
            return Ok(0);
        }

        // read ahead by the size of a data descriptor less its signature
        let window = if self.zip64 { ZIP64_DATA_DESCRIPTOR_SIZE } else { DATA_DESCRIPTOR_SIZE };

        if self.extracted == 0 && self.read_ahead.is_empty() {
            self.read_ahead = vec![0_u8; window];
            archive.read_exact(&mut self.read_ahead)?;
        }

        let mut count = 0;

        while count < out.len() {
            let buffer = &self.read_ahead;
            let signature_present =
                u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) == SIG_DATA_DESCRIPTOR;

            let candidate = if signature_present { &buffer[4 ..] } else { &buffer[..] };
            let crc_candidate = u32::from_le_bytes([candidate[0], candidate[1], candidate[2], candidate[3]]);

            let at_end = crc_candidate == self.running_crc() && {
                let size = if self.zip64 {
                    u64::from_le_bytes([
                        candidate[4], candidate[5], candidate[6], candidate[7],
                        candidate[8], candidate[9], candidate[10], candidate[11],
                    ])
                } else {
                    u64::from(u32::from_le_bytes([candidate[4], candidate[5], candidate[6], candidate[7]]))
                };

                size == self.extracted
            };

            if at_end {
                self.crc_expected = Some(crc_candidate);
                self.uncompressed_size = self.extracted;
                self.size_known = true;

                // with a signature, part of the uncompressed size is
                // still in the source
                if signature_present {
                    let mut rest = [0_u8; 4];
                    archive.read_exact(&mut rest)?;
                }

                break;
            }

            // pass the head byte through and top the window back up
            let byte = self.read_ahead[0];
            out[count] = byte;
            count += 1;
            self.hasher.update(&[byte]);
            self.extracted += 1;

            self.read_ahead.copy_within(1 .., 0);
            let last = self.read_ahead.len() - 1;
            archive.read_exact(std::slice::from_mut(&mut self.read_ahead[last]))?;
        }

        Ok(count)
    }

    fn extract_flate(
        &mut self, archive: &mut ZipArchive, inflater: &mut Option<RawInflater>,
        out: &mut [u8], bounded: bool,
    ) -> Result<usize> {
        if self.flate_end { return Ok(0); }

        let inflater = inflater.as_mut().ok_or(Error::Internal("flate piece without inflater"))?;
        let mut written = 0;

        loop {
            // a bounded piece can refill eagerly: every byte up to the
            // compressed size belongs to this piece
            if bounded && self.in_pos == self.in_buffer.len() && self.compressed_left > 0 {
                let step = (archive.buffer_size() as u64).min(self.compressed_left) as usize;

                self.seek_to_data(archive)?;
                self.in_buffer.resize(step, 0);
                self.in_pos = 0;

                let got = archive.read_raw(&mut self.in_buffer)?;
                if got == 0 {
                    return Err(Error::corrupt("deflate data ends before its stream"));
                }

                self.in_buffer.truncate(got);
                self.note_read(got as u64);
                self.compressed_left -= got as u64;
            }

            let progress = inflater.inflate(
                &self.in_buffer[self.in_pos ..],
                &mut out[written ..],
            )?;

            self.in_pos += progress.consumed;
            written += progress.written;

            if progress.finished {
                self.flate_end = true;
                break;
            }

            if written == out.len() { break; }

            if progress.consumed == 0 && progress.written == 0 {
                if bounded {
                    if self.compressed_left == 0 {
                        return Err(Error::corrupt("deflate stream did not end"));
                    }
                    // eager refill handles the rest
                }
                else {
                    // unknown extent: creep up on the data descriptor one
                    // byte at a time, reading only when decoding stalls so
                    // the descriptor itself is never consumed here
                    let mut byte = 0_u8;
                    if archive.read_raw(std::slice::from_mut(&mut byte))? == 0 {
                        return Err(Error::corrupt("deflate data ends before its stream"));
                    }

                    self.in_buffer.clear();
                    self.in_buffer.push(byte);
                    self.in_pos = 0;
                }
            }
        }

        Ok(written)
    }

    /// Run once all data is out: absorb the trailing data descriptor of
    /// an unbounded flate piece, then verify the checksum if asked to.
    fn finish(&mut self, archive: &mut ZipArchive, crc_check: bool) -> UnitResult {
        if self.mode == Some(ExtractMode::FlateUnknown) && !self.size_known {
            let descriptor = read_trailing_descriptor(archive, self.zip64)?;

            if descriptor.uncompressed != self.extracted {
                return Err(Error::corrupt("data descriptor size mismatch"));
            }

            self.crc_expected = Some(descriptor.crc32);
            self.uncompressed_size = self.extracted;
            self.size_known = true;
        }

        if crc_check {
            if let Some(expected) = self.crc_expected {
                if expected != self.running_crc() {
                    return Err(Error::corrupt("entry checksum mismatch"));
                }
            }
        }

        self.done = true;
        Ok(())
    }
}

/// Read the descriptor that follows an entry's data, with or without its
/// optional signature.
fn read_trailing_descriptor(archive: &mut ZipArchive, zip64: bool) -> Result<DataDescriptor> {
    let mut first = [0_u8; 4];
    archive.read_exact(&mut first)?;

    if u32::from_le_bytes(first) == SIG_DATA_DESCRIPTOR {
        DataDescriptor::read(&mut ArchiveReader(archive), zip64)
    }
    else {
        // the four bytes already read were the checksum
        let crc32 = u32::from_le_bytes(first);

        let (compressed, uncompressed) = if zip64 {
            let mut sizes = [0_u8; 16];
            archive.read_exact(&mut sizes)?;
            (
                u64::from_le_bytes(sizes[.. 8].try_into().expect("slice length")),
                u64::from_le_bytes(sizes[8 ..].try_into().expect("slice length")),
            )
        } else {
            let mut sizes = [0_u8; 8];
            archive.read_exact(&mut sizes)?;
            (
                u64::from(u32::from_le_bytes(sizes[.. 4].try_into().expect("slice length"))),
                u64::from(u32::from_le_bytes(sizes[4 ..].try_into().expect("slice length"))),
            )
        };

        Ok(DataDescriptor { crc32, compressed, uncompressed })
    }
}

struct ArchiveReader<'a>(&'a mut ZipArchive);

impl std::io::Read for ArchiveReader<'_> {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        self.0.read_raw(buffer).map_err(|error|
            std::io::Error::new(std::io::ErrorKind::Other, error.to_string()))
    }
}


/// What an extraction attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Extracted {

    /// The requested extent is in the scratch file.
    Enough,

    /// All pieces seen so far are exhausted and the final piece has not
    /// appeared yet; more archive parsing is needed.
    NeedNextPiece,

    /// The whole file is in the scratch file.
    Complete,
}


/// One logical file of a mounted archive.
#[derive(Debug)]
pub(crate) struct ZipFile {

    /// Canonical name: as stored, or normalized when the device
    /// normalizes.
    pub name: Vec<u8>,

    /// Lookup key: lowercased when the device ignores case.
    pub lookup_name: Vec<u8>,

    pub date_time: u32,

    /// Backing file on the scratch device.
    pub scratch_name: String,

    pub pieces: SmallVec<[Piece; 1]>,
    pub last_piece_seen: bool,

    /// Index into `pieces` of the piece currently being extracted.
    current_piece: usize,

    /// Total uncompressed bytes extracted into the scratch file.
    pub extracted: u64,

    pub open_count: u32,
    pub exclusive: bool,

    /// Whether archive entries back this file at all.
    pub from_archive: bool,

    /// Whether extraction has finished and the scratch file is the file.
    pub on_disk: bool,

    pub crc_check: bool,

    inflater: Option<RawInflater>,
    extract_fd: Option<Fd>,
}

impl ZipFile {

    pub fn new(
        name: Vec<u8>, lookup_name: Vec<u8>, date_time: u32,
        scratch_name: String, from_archive: bool, crc_check: bool,
    ) -> Self {
        ZipFile {
            name, lookup_name, date_time, scratch_name,
            pieces: SmallVec::new(),
            last_piece_seen: false,
            current_piece: 0,
            extracted: 0,
            open_count: 0,
            exclusive: false,
            from_archive,
            on_disk: !from_archive,
            crc_check,
            inflater: None,
            extract_fd: None,
        }
    }

    /// Add one physical entry as a piece. The list stays ordered by piece
    /// number with the last piece as its maximum; pieces of a streamed
    /// archive additionally must arrive in order, since their data is
    /// extracted as encountered.
    pub fn add_piece(&mut self, number: u32, last: bool, info: &EntryInfo, streamed: bool) -> UnitResult {
        if self.last_piece_seen {
            return Err(Error::invalid("piece after the last piece"));
        }

        if self.pieces.iter().any(|piece| piece.number == number) {
            return Err(Error::invalid("duplicate piece number"));
        }

        if last {
            if self.pieces.iter().any(|piece| piece.number > number) {
                return Err(Error::invalid("last piece is not the maximum"));
            }

            self.last_piece_seen = true;
        }

        if streamed {
            if self.pieces.last().map_or(false, |piece| piece.number > number) {
                return Err(Error::invalid("stream delivered pieces out of order"));
            }

            self.pieces.push(Piece::new(number, last, info, true));
        }
        else {
            let position = self.pieces.iter()
                .position(|piece| piece.number > number)
                .unwrap_or(self.pieces.len());

            self.pieces.insert(position, Piece::new(number, last, info, false));
        }

        Ok(())
    }

    /// Total size, when every piece size is known.
    pub fn known_size(&self) -> Option<u64> {
        if !self.from_archive { return None; }
        if !self.last_piece_seen { return None; }
        if self.pieces.iter().any(|piece| !piece.size_known) { return None; }

        Some(self.pieces.iter().map(|piece| piece.uncompressed_size).sum())
    }

    fn scratch_write_fd(&mut self, fs: &dyn FileSystem) -> Result<Fd> {
        match self.extract_fd {
            Some(fd) => Ok(fd),
            None => {
                let fd = fs.open(
                    &self.scratch_name,
                    OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE,
                )?;

                self.extract_fd = Some(fd);
                Ok(fd)
            }
        }
    }

    /// Release the extraction descriptor, e.g. before device dismount.
    pub fn close_extraction(&mut self, fs: &dyn FileSystem) {
        if let Some(fd) = self.extract_fd.take() {
            let _ = fs.close(fd);
        }
    }

    /// Make sure at least `target` bytes of the file sit in the scratch
    /// file, extracting in buffer-size steps.
    pub fn ensure_extracted(
        &mut self, archive: &mut ZipArchive, fs: &dyn FileSystem, target: u64,
    ) -> Result<Extracted> {
        if self.on_disk || !self.from_archive {
            return Ok(Extracted::Complete);
        }

        let mut buffer = vec![0_u8; FILE_BUFFER_SIZE];

        while self.extracted < target {
            if self.current_piece >= self.pieces.len() {
                if self.last_piece_seen {
                    self.on_disk = true;
                    self.close_extraction(fs);
                    return Ok(Extracted::Complete);
                }

                return Ok(Extracted::NeedNextPiece);
            }

            if self.pieces[self.current_piece].mode.is_none() {
                self.pieces[self.current_piece].setup(archive, &mut self.inflater)?;
            }

            let count = self.pieces[self.current_piece]
                .extract_chunk(archive, &mut self.inflater, &mut buffer)?;

            if count == 0 {
                // piece exhausted
                self.pieces[self.current_piece].finish(archive, self.crc_check)?;
                self.current_piece += 1;
                continue;
            }

            let fd = self.scratch_write_fd(fs)?;
            fs.seek(fd, self.extracted as i64, SeekMode::Set)?;
            fs.write(fd, &buffer[.. count])?;
            self.extracted += count as u64;
        }

        Ok(Extracted::Enough)
    }

    /// Extract everything that remains. `NeedNextPiece` still ends the
    /// call early when the stream has not shown the last piece yet.
    pub fn extract_all(&mut self, archive: &mut ZipArchive, fs: &dyn FileSystem) -> Result<Extracted> {
        loop {
            match self.ensure_extracted(archive, fs, u64::MAX)? {
                Extracted::Enough => continue,
                other => return Ok(other),
            }
        }
    }

    /// Whether the piece currently being extracted still holds the
    /// streamed archive's position.
    pub fn mid_piece(&self) -> bool {
        self.current_piece < self.pieces.len()
            && self.pieces[self.current_piece].mode.is_some()
            && !self.pieces[self.current_piece].done
    }

    /// Finish the piece the stream is currently inside, so parsing can
    /// continue past its data.
    pub fn finish_current_piece(&mut self, archive: &mut ZipArchive, fs: &dyn FileSystem) -> UnitResult {
        let target_piece = self.current_piece;
        let mut buffer = vec![0_u8; FILE_BUFFER_SIZE];

        while self.current_piece == target_piece && self.current_piece < self.pieces.len() {
            if self.pieces[self.current_piece].mode.is_none() {
                self.pieces[self.current_piece].setup(archive, &mut self.inflater)?;
            }

            let count = self.pieces[self.current_piece]
                .extract_chunk(archive, &mut self.inflater, &mut buffer)?;

            if count == 0 {
                self.pieces[self.current_piece].finish(archive, self.crc_check)?;
                self.current_piece += 1;
                break;
            }

            let fd = self.scratch_write_fd(fs)?;
            fs.seek(fd, self.extracted as i64, SeekMode::Set)?;
            fs.write(fd, &buffer[.. count])?;
            self.extracted += count as u64;
        }

        Ok(())
    }

    /// Drop the archive backing entirely, leaving an empty scratch file.
    pub fn truncate(&mut self, fs: &dyn FileSystem) -> UnitResult {
        self.close_extraction(fs);
        self.pieces.clear();
        self.last_piece_seen = false;
        self.current_piece = 0;
        self.extracted = 0;
        self.from_archive = false;
        self.on_disk = true;
        self.inflater = None;

        let fd = fs.open(
            &self.scratch_name,
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
        )?;
        fs.close(fd)
    }
}


/// Read past one streamed entry whose data nobody wants, for example a
/// directory entry with payload. Uses the same extraction engines with
/// the output thrown away.
pub(crate) fn skip_entry_data(archive: &mut ZipArchive, info: &EntryInfo) -> UnitResult {
    let streamed = archive.is_streamed();

    // the easy case: a known extent can simply be skipped over
    if !(streamed && info.has_data_descriptor()) {
        return archive.skip(info.compressed);
    }

    let mut piece = Piece::new(0, true, info, true);
    let mut inflater = None;
    piece.setup(archive, &mut inflater)?;

    let mut sink = vec![0_u8; FILE_BUFFER_SIZE];
    loop {
        let count = piece.extract_chunk(archive, &mut inflater, &mut sink)?;
        if count == 0 { break; }
    }

    piece.finish(archive, false)
}


#[cfg(test)]
mod test {
    use super::*;

    fn entry(compressed: u64, uncompressed: u64, flags: u16) -> EntryInfo {
        EntryInfo {
            name: b"part".to_vec(),
            flags,
            compression: 0,
            date_time: 0,
            crc32: 0,
            compressed,
            uncompressed,
            local_header_offset: 0,
            zip64: false,
            directory: false,
        }
    }

    #[test]
    fn piece_ordering(){
        let mut file = ZipFile::new(
            b"foo.xml".to_vec(), b"foo.xml".to_vec(), 0, "ZIP/00000001".into(), true, false,
        );

        // out of order arrival on a seekable archive sorts itself
        file.add_piece(2, true, &entry(5, 5, 0), false).unwrap();
        file.add_piece(0, false, &entry(5, 5, 0), false).unwrap();
        file.add_piece(1, false, &entry(5, 5, 0), false).unwrap();

        let numbers: Vec<u32> = file.pieces.iter().map(|piece| piece.number).collect();
        assert_eq!(numbers, [0, 1, 2]);
        assert_eq!(file.known_size(), Some(15));

        // nothing may follow the last piece
        assert!(file.add_piece(3, false, &entry(5, 5, 0), false).is_err());
    }

    #[test]
    fn duplicate_and_misordered_pieces(){
        let mut file = ZipFile::new(
            b"foo".to_vec(), b"foo".to_vec(), 0, "ZIP/00000001".into(), true, false,
        );

        file.add_piece(1, false, &entry(5, 5, 0), false).unwrap();
        assert!(file.add_piece(1, false, &entry(5, 5, 0), false).is_err());

        // a "last" piece below an existing number is inconsistent
        assert!(file.add_piece(0, true, &entry(5, 5, 0), false).is_err());
    }
}
