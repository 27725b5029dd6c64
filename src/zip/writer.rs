
//! Archive creation: a write-only device that deflates entries straight
//! into a growing archive, and re-archiving of a populated read device.

use std::collections::HashSet;
use std::io::SeekFrom;

use crate::calendar::{dos_date_time, Calendar};
use crate::error::{Error, IoError, UnitResult};
use crate::flate::RawDeflater;
use crate::fs::{OpenFlags, SeekMode};
use crate::io::{Seek, Write};
use super::device::ZipDevice;
use super::file::FILE_BUFFER_SIZE;
use super::records::{
    CentralFile, DataDescriptor, EndCdir, LocalFile, Zip64EndCdir, Zip64Extra, Zip64Locator,
    FLAG_USE_DATA_DESCRIPTOR, MADE_BY_MSDOS, METHOD_DEFLATE, SIG_LOCAL_FILE,
    VERSION_DEFLATE, VERSION_ZIP64, ZIP64_LONG, ZIP64_SHORT,
};


/// A writable, seekable archive target.
pub trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

/// Staging buffer for deflated entry data.
const STAGING_SIZE: usize = 16384;


/// One finished entry, staged for the central directory.
#[derive(Debug, Clone)]
struct ArchiveItem {
    name: Vec<u8>,
    date_time: u32,
    crc32: u32,
    compressed: u64,
    uncompressed: u64,
    compression: u16,
    flags: u16,
    local_header_offset: u64,
    zip64: bool,
}

/// The entry currently receiving data.
struct OpenItem {
    name: Vec<u8>,
    date_time: u32,
    local_header_offset: u64,
    deflater: RawDeflater,
    hasher: crc32fast::Hasher,
    compressed: u64,
    uncompressed: u64,
    zip64: bool,
}

/// Decide the central directory layout: clamp the small record's fields
/// and emit the zip64 records when anything does not fit.
fn write_central_directory(
    out: &mut impl Write, position: u64, items: &[ArchiveItem],
) -> UnitResult {
    let cdir_offset = position;
    let mut cdir_size = 0_u64;

    for item in items {
        let mut record = CentralFile {
            made_by: MADE_BY_MSDOS,
            version_needed: if item.zip64 { VERSION_ZIP64 } else { VERSION_DEFLATE },
            flags: item.flags,
            compression: item.compression,
            mod_time: (item.date_time & 0xffff) as u16,
            mod_date: (item.date_time >> 16) as u16,
            crc32: item.crc32,
            name: item.name.clone(),
            ..Default::default()
        };

        let sizes_fit = item.compressed < u64::from(ZIP64_LONG)
            && item.uncompressed < u64::from(ZIP64_LONG);
        let offset_fits = item.local_header_offset < u64::from(ZIP64_LONG);

        if item.zip64 || !sizes_fit || !offset_fits {
            record.compressed_size = ZIP64_LONG;
            record.uncompressed_size = ZIP64_LONG;
            record.local_header_offset = ZIP64_LONG;

            record.extras = Zip64Extra {
                uncompressed_size: Some(item.uncompressed),
                compressed_size: Some(item.compressed),
                local_header_offset: Some(item.local_header_offset),
                start_disk: None,
            }.encode();

            record.version_needed = VERSION_ZIP64;
        }
        else {
            record.compressed_size = item.compressed as u32;
            record.uncompressed_size = item.uncompressed as u32;
            record.local_header_offset = item.local_header_offset as u32;
        }

        record.write(out)?;
        cdir_size += record.wire_size();
    }

    let entries = items.len() as u64;
    let needs_zip64 = entries > u64::from(ZIP64_SHORT)
        || cdir_size >= u64::from(ZIP64_LONG)
        || cdir_offset >= u64::from(ZIP64_LONG);

    if needs_zip64 {
        let zip64_end_offset = cdir_offset + cdir_size;

        Zip64EndCdir {
            record_size: 44,
            made_by: MADE_BY_MSDOS,
            version_needed: VERSION_ZIP64,
            disk_number: 0,
            cdir_start_disk: 0,
            entries_this_disk: entries,
            entries_total: entries,
            cdir_size,
            cdir_offset,
        }.write(out)?;

        Zip64Locator {
            cdir_start_disk: 0,
            end_cdir_offset: zip64_end_offset,
            total_disks: 1,
        }.write(out)?;
    }

    EndCdir {
        disk_number: 0,
        cdir_start_disk: 0,
        entries_this_disk: if entries > u64::from(ZIP64_SHORT) { ZIP64_SHORT } else { entries as u16 },
        entries_total: if entries > u64::from(ZIP64_SHORT) { ZIP64_SHORT } else { entries as u16 },
        cdir_size: if cdir_size >= u64::from(ZIP64_LONG) { ZIP64_LONG } else { cdir_size as u32 },
        cdir_offset: if cdir_offset >= u64::from(ZIP64_LONG) { ZIP64_LONG } else { cdir_offset as u32 },
        comment: Vec::new(),
    }.write(out)
}


/// Accepts one file at a time and deflates it into a growing archive.
/// Every entry carries a data descriptor, so the output never needs to
/// seek backward.
pub struct WriteonlyZipDevice<'w> {
    out: Box<dyn Write + 'w>,
    calendar: Box<dyn Calendar>,
    items: Vec<ArchiveItem>,
    names: HashSet<Vec<u8>>,
    current: Option<OpenItem>,
    position: u64,
    zip64_files: bool,
    errored: bool,
    finished: bool,
}

impl std::fmt::Debug for WriteonlyZipDevice<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("WriteonlyZipDevice")
            .field("items", &self.items.len())
            .finish()
    }
}

impl<'w> WriteonlyZipDevice<'w> {

    pub fn new(out: Box<dyn Write + 'w>, calendar: Box<dyn Calendar>, zip64_files: bool) -> Self {
        WriteonlyZipDevice {
            out, calendar,
            items: Vec::new(),
            names: HashSet::new(),
            current: None,
            position: 0,
            zip64_files,
            errored: false,
            finished: false,
        }
    }

    fn guard_writable(&self) -> UnitResult {
        if self.errored || self.finished {
            Err(Error::Io(IoError::new(std::io::ErrorKind::Other, "archive is closed or errored")))
        } else {
            Ok(())
        }
    }

    /// The host closed the underlying file out-of-band; everything from
    /// here on fails cleanly and no central directory is written.
    pub fn mark_underlying_closed(&mut self) {
        self.errored = true;
    }

    /// Begin a new entry. Only one may be open at a time, and names must
    /// be unique within the archive.
    pub fn open_file(&mut self, name: &str) -> UnitResult {
        self.guard_writable()?;

        if self.current.is_some() {
            return Err(Error::AccessDenied);
        }

        let name = name.as_bytes().to_vec();
        if !self.names.insert(name.clone()) {
            return Err(Error::invalid("duplicate entry name"));
        }

        let date_time = dos_date_time(self.calendar.get_time());
        let local_header_offset = self.position;
        let zip64 = self.zip64_files;

        let mut header = LocalFile {
            version_needed: if zip64 { VERSION_ZIP64 } else { VERSION_DEFLATE },
            flags: FLAG_USE_DATA_DESCRIPTOR,
            compression: METHOD_DEFLATE,
            mod_time: (date_time & 0xffff) as u16,
            mod_date: (date_time >> 16) as u16,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            name,
            extras: Vec::new(),
        };

        if zip64 {
            // real sizes follow in the data descriptor
            header.compressed_size = ZIP64_LONG;
            header.uncompressed_size = ZIP64_LONG;
            header.extras = Zip64Extra {
                uncompressed_size: Some(0),
                compressed_size: Some(0),
                local_header_offset: None,
                start_disk: None,
            }.encode();
        }

        let result = header.write(&mut self.out);
        if result.is_err() { self.errored = true; }
        result?;

        self.position += header.wire_size();

        self.current = Some(OpenItem {
            name: header.name,
            date_time,
            local_header_offset,
            deflater: RawDeflater::new(),
            hasher: crc32fast::Hasher::new(),
            compressed: 0,
            uncompressed: 0,
            zip64,
        });

        Ok(())
    }

    /// Deflate a buffer of the open entry's data into the archive.
    pub fn write(&mut self, mut buffer: &[u8]) -> UnitResult {
        self.guard_writable()?;

        let item = self.current.as_mut().ok_or(Error::AccessDenied)?;
        item.hasher.update(buffer);
        item.uncompressed += buffer.len() as u64;

        let mut staging = [0_u8; STAGING_SIZE];

        while !buffer.is_empty() {
            let progress = match item.deflater.deflate(buffer, &mut staging) {
                Ok(progress) => progress,
                Err(error) => { self.errored = true; return Err(error); }
            };

            buffer = &buffer[progress.consumed ..];

            if progress.written > 0 {
                if let Err(error) = self.out.write_all(&staging[.. progress.written]) {
                    self.errored = true;
                    return Err(error.into());
                }

                item.compressed += progress.written as u64;
                self.position += progress.written as u64;
            }
        }

        Ok(())
    }

    /// Finish the open entry: flush the deflate stream and append the
    /// data descriptor.
    pub fn close_file(&mut self) -> UnitResult {
        self.guard_writable()?;

        let mut item = self.current.take().ok_or(Error::AccessDenied)?;
        let mut staging = [0_u8; STAGING_SIZE];

        loop {
            let progress = match item.deflater.finish(&mut staging) {
                Ok(progress) => progress,
                Err(error) => { self.errored = true; return Err(error); }
            };

            if progress.written > 0 {
                if let Err(error) = self.out.write_all(&staging[.. progress.written]) {
                    self.errored = true;
                    return Err(error.into());
                }

                item.compressed += progress.written as u64;
                self.position += progress.written as u64;
            }

            if progress.finished { break; }
        }

        let crc32 = item.hasher.finalize();

        let descriptor = DataDescriptor {
            crc32,
            compressed: item.compressed,
            uncompressed: item.uncompressed,
        };

        let mut bytes = Vec::new();
        descriptor.write(&mut bytes, item.zip64, true)?;

        if let Err(error) = self.out.write_all(&bytes) {
            self.errored = true;
            return Err(error.into());
        }

        self.position += bytes.len() as u64;

        self.items.push(ArchiveItem {
            name: item.name,
            date_time: item.date_time,
            crc32,
            compressed: item.compressed,
            uncompressed: item.uncompressed,
            compression: METHOD_DEFLATE,
            flags: FLAG_USE_DATA_DESCRIPTOR,
            local_header_offset: item.local_header_offset,
            zip64: item.zip64,
        });

        Ok(())
    }

    /// Emit the central directory and close the archive. An errored
    /// archive emits nothing.
    pub fn close_archive(&mut self) -> UnitResult {
        if self.errored {
            return Err(Error::Io(IoError::new(std::io::ErrorKind::Other, "archive is errored")));
        }

        if self.finished { return Ok(()); }

        if self.current.is_some() {
            self.close_file()?;
        }

        write_central_directory(&mut self.out, self.position, &self.items)?;
        self.out.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Entries written so far.
    pub fn file_count(&self) -> usize {
        self.items.len() + usize::from(self.current.is_some())
    }
}


/// Emit every file of a read device as a new archive.
///
/// Untouched single-piece archive entries are copied through compressed
/// as they are; everything else is read from its scratch file and
/// deflated afresh. The local header of a re-deflated entry is written
/// with zero sizes and patched once the data has gone through.
pub(crate) fn write_device_archive(device: &mut ZipDevice, mut out: Box<dyn WriteSeek + '_>) -> UnitResult {
    let mut position = 0_u64;
    let mut items: Vec<ArchiveItem> = Vec::new();
    let indices: Vec<usize> = device.chain.clone();

    for index in indices {
        let (name, date_time, copy_source) = {
            let file = match device.files[index].as_ref() { Some(file) => file, None => continue };

            // copy fast-path: one untouched piece on a seekable archive
            let seekable = device.archive.as_ref().map_or(false, |archive| !archive.is_streamed());

            let copy = if file.from_archive && seekable && file.pieces.len() == 1 && file.last_piece_seen {
                let piece = &file.pieces[0];

                piece.crc_expected.map(|crc32| (
                    piece.local_header_offset,
                    piece.compressed_size,
                    piece.uncompressed_size,
                    crc32,
                    piece.compression,
                ))
            } else { None };

            (file.name.clone(), file.date_time, copy)
        };

        let local_header_offset = position;
        let zip64_entry = device.zip64_files
            || copy_source.map_or(false, |(_, compressed, uncompressed, ..)|
                compressed >= u64::from(ZIP64_LONG) || uncompressed >= u64::from(ZIP64_LONG));

        match copy_source {
            Some((piece_offset, compressed, uncompressed, crc32, compression)) => {
                // raw copy with everything known up front
                let mut header = LocalFile {
                    version_needed: if zip64_entry { VERSION_ZIP64 } else { VERSION_DEFLATE },
                    flags: 0,
                    compression,
                    mod_time: (date_time & 0xffff) as u16,
                    mod_date: (date_time >> 16) as u16,
                    crc32,
                    compressed_size: compressed as u32,
                    uncompressed_size: uncompressed as u32,
                    name: name.clone(),
                    extras: Vec::new(),
                };

                if zip64_entry {
                    header.compressed_size = ZIP64_LONG;
                    header.uncompressed_size = ZIP64_LONG;
                    header.extras = Zip64Extra {
                        uncompressed_size: Some(uncompressed),
                        compressed_size: Some(compressed),
                        local_header_offset: None,
                        start_disk: None,
                    }.encode();
                }

                header.write(&mut out)?;
                position += header.wire_size();

                // locate the source data behind its local header
                let archive = device.archive.as_mut().expect("copy source implies archive");
                archive.set_position(piece_offset)?;
                let mut sig = [0_u8; 4];
                archive.read_exact(&mut sig)?;
                if u32::from_le_bytes(sig) != SIG_LOCAL_FILE {
                    return Err(Error::corrupt("local file header expected"));
                }
                LocalFile::read(&mut ArchiveToRecords(archive))?;

                let mut remaining = compressed;
                let mut buffer = [0_u8; FILE_BUFFER_SIZE];
                while remaining > 0 {
                    let step = (remaining as usize).min(FILE_BUFFER_SIZE);
                    archive.read_exact(&mut buffer[.. step])?;
                    out.write_all(&buffer[.. step])?;
                    remaining -= step as u64;
                    position += step as u64;
                }

                items.push(ArchiveItem {
                    name, date_time, crc32,
                    compressed, uncompressed, compression,
                    flags: 0,
                    local_header_offset,
                    zip64: zip64_entry,
                });
            },

            None => {
                // re-deflate from the scratch file, then patch the header
                device.ensure_file_extracted(index, u64::MAX)?;

                let header = LocalFile {
                    version_needed: if zip64_entry { VERSION_ZIP64 } else { VERSION_DEFLATE },
                    flags: 0,
                    compression: METHOD_DEFLATE,
                    mod_time: (date_time & 0xffff) as u16,
                    mod_date: (date_time >> 16) as u16,
                    crc32: 0,
                    compressed_size: if zip64_entry { ZIP64_LONG } else { 0 },
                    uncompressed_size: if zip64_entry { ZIP64_LONG } else { 0 },
                    name: name.clone(),
                    extras: if zip64_entry {
                        Zip64Extra {
                            uncompressed_size: Some(0),
                            compressed_size: Some(0),
                            local_header_offset: None,
                            start_disk: None,
                        }.encode()
                    } else { Vec::new() },
                };

                header.write(&mut out)?;
                position += header.wire_size();

                let scratch_name = device.files[index].as_ref().unwrap().scratch_name.clone();
                let fd = device.fs.open(&scratch_name, OpenFlags::CREATE | OpenFlags::READ)?;
                device.fs.seek(fd, 0, SeekMode::Set)?;

                let mut deflater = RawDeflater::new();
                let mut hasher = crc32fast::Hasher::new();
                let mut uncompressed = 0_u64;
                let mut compressed = 0_u64;
                let mut buffer = [0_u8; FILE_BUFFER_SIZE];
                let mut staging = [0_u8; STAGING_SIZE];

                loop {
                    let got = device.fs.read(fd, &mut buffer)?;
                    if got == 0 { break; }

                    hasher.update(&buffer[.. got]);
                    uncompressed += got as u64;

                    let mut chunk = &buffer[.. got];
                    while !chunk.is_empty() {
                        let progress = deflater.deflate(chunk, &mut staging)?;
                        chunk = &chunk[progress.consumed ..];
                        out.write_all(&staging[.. progress.written])?;
                        compressed += progress.written as u64;
                    }
                }

                loop {
                    let progress = deflater.finish(&mut staging)?;
                    out.write_all(&staging[.. progress.written])?;
                    compressed += progress.written as u64;
                    if progress.finished { break; }
                }

                device.fs.close(fd)?;
                position += compressed;

                let crc32 = hasher.finalize();

                // back-patch checksum and sizes into the local header
                out.seek(SeekFrom::Start(local_header_offset + 14))?;
                out.write_all(&crc32.to_le_bytes())?;

                if zip64_entry {
                    let extra_data = local_header_offset + 30 + name.len() as u64 + 4;
                    out.seek(SeekFrom::Start(extra_data))?;
                    out.write_all(&uncompressed.to_le_bytes())?;
                    out.write_all(&compressed.to_le_bytes())?;
                }
                else {
                    if compressed >= u64::from(ZIP64_LONG) || uncompressed >= u64::from(ZIP64_LONG) {
                        return Err(Error::invalid("entry too large for a non-zip64 archive"));
                    }

                    out.write_all(&(compressed as u32).to_le_bytes())?;
                    out.write_all(&(uncompressed as u32).to_le_bytes())?;
                }

                out.seek(SeekFrom::Start(position))?;

                items.push(ArchiveItem {
                    name, date_time, crc32,
                    compressed, uncompressed,
                    compression: METHOD_DEFLATE,
                    flags: 0,
                    local_header_offset,
                    zip64: zip64_entry,
                });
            },
        }
    }

    write_central_directory(&mut out, position, &items)?;
    out.flush()?;
    Ok(())
}

struct ArchiveToRecords<'a>(&'a mut super::archive::ZipArchive);

impl std::io::Read for ArchiveToRecords<'_> {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        self.0.read_raw(buffer).map_err(|error|
            std::io::Error::new(std::io::ErrorKind::Other, error.to_string()))
    }
}
