
//! Discover archive entries: from the central directory of a seekable
//! archive, or record by record from a stream. Also classifies entry
//! names into logical-file pieces.

use crate::error::{Error, Result, UnitResult};
use super::archive::ZipArchive;
use super::records::{
    CentralFile, DataDescriptor, EndCdir, LocalFile, Zip64EndCdir, Zip64Extra, Zip64Locator,
    FLAG_REJECTED, FLAG_USE_DATA_DESCRIPTOR, METHOD_DEFLATE, METHOD_STORE,
    SIG_CENTRAL_FILE, SIG_DATA_DESCRIPTOR, SIG_END_CDIR, SIG_LOCAL_FILE,
    SIG_ZIP64_END_CDIR, SIG_ZIP64_LOCATOR, ZIP64_LONG, ZIP64_SHORT,
};


/// Everything the device needs to know about one physical archive entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name: Vec<u8>,
    pub flags: u16,
    pub compression: u16,
    pub date_time: u32,
    pub crc32: u32,
    pub compressed: u64,
    pub uncompressed: u64,

    /// Offset of the local file header. Meaningless for streams.
    pub local_header_offset: u64,

    pub zip64: bool,
    pub directory: bool,
}

impl EntryInfo {

    /// Reject entries we cannot extract: anything encrypted or patched,
    /// and any compression other than store or deflate.
    pub fn validate_extractable(&self) -> UnitResult {
        if self.flags & FLAG_REJECTED != 0 {
            return Err(Error::unsupported("encrypted or patched archive entry"));
        }

        if self.compression != METHOD_STORE && self.compression != METHOD_DEFLATE {
            return Err(Error::unsupported("archive entry compression method"));
        }

        Ok(())
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_USE_DATA_DESCRIPTOR != 0
    }
}

fn entry_from_central(header: &CentralFile) -> Result<EntryInfo> {
    let zip64 = header.is_zip64();

    let extra = Zip64Extra::find(
        &header.extras,
        header.uncompressed_size == ZIP64_LONG,
        header.compressed_size == ZIP64_LONG,
        header.local_header_offset == ZIP64_LONG,
        header.start_disk == ZIP64_SHORT,
    )?;

    let resolve_u32 = |raw: u32, resolved: Option<u64>| -> Result<u64> {
        if raw == ZIP64_LONG {
            resolved.ok_or(Error::corrupt("zip64 field missing from extra"))
        } else {
            Ok(u64::from(raw))
        }
    };

    let extra = extra.unwrap_or_default();

    Ok(EntryInfo {
        name: header.name.clone(),
        flags: header.flags,
        compression: header.compression,
        date_time: (u32::from(header.mod_date) << 16) | u32::from(header.mod_time),
        crc32: header.crc32,
        compressed: resolve_u32(header.compressed_size, extra.compressed_size)?,
        uncompressed: resolve_u32(header.uncompressed_size, extra.uncompressed_size)?,
        local_header_offset: resolve_u32(header.local_header_offset, extra.local_header_offset)?,
        zip64: zip64,
        directory: header.is_directory(),
    })
}

fn entry_from_local(header: &LocalFile) -> Result<EntryInfo> {
    let zip64 = header.is_zip64();

    let extra = Zip64Extra::find(
        &header.extras,
        header.uncompressed_size == ZIP64_LONG,
        header.compressed_size == ZIP64_LONG,
        false, false,
    )?.unwrap_or_default();

    let resolve_u32 = |raw: u32, resolved: Option<u64>| -> Result<u64> {
        if raw == ZIP64_LONG {
            resolved.ok_or(Error::corrupt("zip64 field missing from extra"))
        } else {
            Ok(u64::from(raw))
        }
    };

    Ok(EntryInfo {
        name: header.name.clone(),
        flags: header.flags,
        compression: header.compression,
        date_time: header.date_time(),
        crc32: header.crc32,
        compressed: resolve_u32(header.compressed_size, extra.compressed_size)?,
        uncompressed: resolve_u32(header.uncompressed_size, extra.uncompressed_size)?,
        local_header_offset: 0,
        zip64,
        directory: header.name.last() == Some(&b'/'),
    })
}


/// Enumerate a seekable archive through its central directory,
/// following the zip64 records when present.
pub fn read_central_directory(archive: &mut ZipArchive) -> Result<Vec<EntryInfo>> {
    let end_position = archive.find_end_cdir()?;
    let end = EndCdir::read(&mut Reader(archive))?;
    end.validate_single_disk()?;

    let mut entry_count = u64::from(end.entries_total);
    let mut cdir_offset = u64::from(end.cdir_offset);

    // a zip64 locator, when present, sits immediately before the
    // end-of-directory record
    let locator_position = (end_position - 4).checked_sub(20);
    if let Some(locator_position) = locator_position {
        archive.set_position(locator_position)?;

        let mut sig = [0_u8; 4];
        archive.read_exact(&mut sig)?;

        if u32::from_le_bytes(sig) == SIG_ZIP64_LOCATOR {
            let locator = Zip64Locator::read(&mut Reader(archive))?;

            if locator.total_disks > 1 {
                return Err(Error::unsupported("spanned archive"));
            }

            archive.set_position(locator.end_cdir_offset)?;
            let mut sig = [0_u8; 4];
            archive.read_exact(&mut sig)?;

            if u32::from_le_bytes(sig) != SIG_ZIP64_END_CDIR {
                return Err(Error::corrupt("zip64 locator points nowhere"));
            }

            let end64 = Zip64EndCdir::read(&mut Reader(archive))?;

            if entry_count == u64::from(ZIP64_SHORT) { entry_count = end64.entries_total; }
            if cdir_offset == u64::from(ZIP64_LONG) { cdir_offset = end64.cdir_offset; }
        }
    }

    archive.set_position(cdir_offset)?;
    let mut entries = Vec::with_capacity(entry_count.min(1 << 16) as usize);

    for _ in 0 .. entry_count {
        let mut sig = [0_u8; 4];
        archive.read_exact(&mut sig)?;

        if u32::from_le_bytes(sig) != SIG_CENTRAL_FILE {
            return Err(Error::corrupt("central directory entry expected"));
        }

        let header = CentralFile::read(&mut Reader(archive))?;
        entries.push(entry_from_central(&header)?);
    }

    archive.set_complete();
    Ok(entries)
}


/// What streamed parsing found next.
#[derive(Debug)]
pub enum StreamRecord {

    /// An entry; the source is positioned at the start of its data.
    File(EntryInfo),

    /// The central directory begins here: all entries have been seen.
    CentralDirectory,

    /// The source ended without a central directory.
    End,
}

/// Advance a streamed archive to the next interesting record.
pub fn next_stream_record(archive: &mut ZipArchive) -> Result<StreamRecord> {
    loop {
        let sig = match archive.next_sig_or_end()? {
            Some(sig) => sig,
            None => return Ok(StreamRecord::End),
        };

        match sig {
            SIG_LOCAL_FILE => {
                let header = LocalFile::read(&mut Reader(archive))?;
                return Ok(StreamRecord::File(entry_from_local(&header)?));
            },

            SIG_CENTRAL_FILE | SIG_END_CDIR | SIG_ZIP64_END_CDIR | SIG_ZIP64_LOCATOR => {
                return Ok(StreamRecord::CentralDirectory);
            },

            SIG_DATA_DESCRIPTOR => {
                // a descriptor for data we already consumed; read the
                // short form and let the scan realign if it was zip64
                DataDescriptor::read(&mut Reader(archive), false)?;
            },

            _ => return Err(Error::corrupt("unexpected record in stream")),
        }
    }
}


/// Adapter so record codecs can read from an archive.
struct Reader<'a>(&'a mut ZipArchive);

impl std::io::Read for Reader<'_> {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        self.0.read_raw(buffer).map_err(|error|
            std::io::Error::new(std::io::ErrorKind::Other, error.to_string()))
    }
}


/// How a physical entry name maps onto a logical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceName {

    /// Length of the logical name prefix.
    pub stem_len: usize,

    /// Position of this piece in the logical file.
    pub number: u32,

    /// Whether this is the final piece.
    pub last: bool,

    /// Directory entries carry no data and join no logical file.
    pub directory: bool,
}

/// Classify an entry name. With merging enabled, interleaved part names of
/// the form `stem/[n].piece` and `stem/[n].last.piece` contribute piece
/// `n` to the logical file `stem`; anything that fails the grammar at any
/// point is an ordinary single-piece name.
pub fn classify_piece_name(name: &[u8], merge: bool) -> PieceName {
    if name.last() == Some(&b'/') {
        return PieceName { stem_len: name.len(), number: 0, last: false, directory: true };
    }

    let plain = PieceName { stem_len: name.len(), number: 0, last: true, directory: false };
    if !merge { return plain; }

    // find the start of the piece suffix: the last slash
    let slash = match name.iter().rposition(|&byte| byte == b'/') {
        Some(slash) => slash,
        None => return plain,
    };

    fn eat<'n>(rest: &mut &'n [u8], prefix: &[u8]) -> bool {
        if rest.starts_with(prefix) { *rest = &rest[prefix.len() ..]; true }
        else { false }
    }

    let mut rest = &name[slash ..];
    if !eat(&mut rest, b"/[") { return plain; }

    // a non-empty run of decimal digits
    let digits = rest.iter().take_while(|byte| byte.is_ascii_digit()).count();
    if digits == 0 || digits > 9 { return plain; }

    let mut number = 0_u32;
    for &byte in &rest[.. digits] {
        number = number * 10 + u32::from(byte - b'0');
    }
    rest = &rest[digits ..];

    if !eat(&mut rest, b"].") { return plain; }
    let last = eat(&mut rest, b"last.");
    if !(eat(&mut rest, b"piece") && rest.is_empty()) { return plain; }

    PieceName { stem_len: slash, number, last, directory: false }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn piece_grammar(){
        let classify = |name: &[u8]| classify_piece_name(name, true);

        assert_eq!(classify(b"foo.xml/[0].piece"), PieceName {
            stem_len: 7, number: 0, last: false, directory: false,
        });

        assert_eq!(classify(b"foo.xml/[2].last.piece"), PieceName {
            stem_len: 7, number: 2, last: true, directory: false,
        });

        assert_eq!(classify(b"a/b/c.xml/[17].piece").stem_len, 9);

        // failures of the grammar are ordinary single-piece names
        for plain in [
            &b"foo.xml"[..], b"foo.xml/[].piece", b"foo.xml/[x].piece",
            b"foo.xml/[0]piece", b"foo.xml/[0].pieces", b"foo.xml/[0].last.piec",
            b"noslash[0].piece",
        ] {
            let classified = classify(plain);
            assert_eq!(classified.stem_len, plain.len(), "{:?}", String::from_utf8_lossy(plain));
            assert!(classified.last);
            assert_eq!(classified.number, 0);
        }

        // directories
        assert!(classify(b"somewhere/").directory);

        // merging disabled treats everything as a whole name
        assert_eq!(classify_piece_name(b"foo.xml/[0].piece", false).stem_len, 17);
    }
}
