
//! The read-side archive filesystem device.
//!
//! Presents the entries of one mounted archive as a relative filesystem.
//! Logical files live in a hash table keyed by their (possibly lowercased,
//! possibly normalized) names, plus an insertion-ordered chain so listing
//! stays stable while new pieces keep appearing from a stream.

use std::collections::HashMap;
use std::sync::Arc;

use crate::calendar::{dos_date_time, Calendar};
use crate::error::{Error, IoError, Result, UnitResult};
use crate::fs::{Fd, FileStat, FileSystem, OpenFlags, SeekMode};
use crate::hash::{lowercase, string_hash};
use crate::io::Read;
use super::archive::{ReadSeek, ZipArchive};
use super::file::{skip_entry_data, Extracted, ZipFile, FILE_BUFFER_SIZE};
use super::reader::{
    classify_piece_name, next_stream_record, read_central_directory, EntryInfo, StreamRecord,
};
use super::stream::{FileStream, StreamTable};


/// Prefix of every scratch file this device creates.
pub const SCRATCH_PREFIX: &str = "ZIP/";

/// Highest scratch file sequence number; ids are six hex digits.
const MAX_FILE_SEQ: u32 = 0xff_ffff;


/// A typed device parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i32),
    Str(String),
}

/// One entry of the parameter listing.
#[derive(Debug, Clone)]
pub struct DeviceParam {
    pub name: &'static str,
    pub value: ParamValue,
    pub writeable: bool,
}


/// Delete scratch files surviving from a previous run. Call once at boot
/// before mounting any archive.
pub fn purge_stale_scratch(fs: &dyn FileSystem) -> UnitResult {
    let mut stale = Vec::new();
    let mut list = fs.start_list("ZIP/*")?;
    while let Some(name) = list.next_name() { stale.push(name); }
    drop(list);

    for name in stale {
        log::debug!("removing stale scratch file {}", name);
        fs.delete(&name)?;
    }

    Ok(())
}


/// An archive mounted as a filesystem device.
pub struct ZipDevice {
    pub(crate) fs: Arc<dyn FileSystem>,
    calendar: Box<dyn Calendar>,
    device_id: u8,

    pub(crate) archive: Option<ZipArchive>,

    /// A parse error closes the device for good.
    errored: bool,
    closed: bool,

    /// Logical files; tombstoned on delete so indices stay stable.
    pub(crate) files: Vec<Option<ZipFile>>,

    /// Name hash to file indices.
    buckets: HashMap<u32, Vec<usize>>,

    /// File indices in insertion order.
    pub(crate) chain: Vec<usize>,

    /// Active listing positions into `chain`, with their patterns.
    iterators: Vec<Option<(String, usize)>>,

    streams: StreamTable,
    next_file_seq: u32,

    /// The file whose piece currently holds the stream position.
    streaming_file: Option<usize>,

    check_crc: bool,
    ignore_case: bool,
    open_package: bool,
    readonly: bool,
    force_streamed: bool,
    pub(crate) zip64_files: bool,
    debug: i32,
    source_set: bool,
}

impl std::fmt::Debug for ZipDevice {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ZipDevice")
            .field("device_id", &self.device_id)
            .field("files", &self.chain.len())
            .finish()
    }
}

impl ZipDevice {

    /// A fresh device with no archive; set `Filename` or a data source to
    /// mount one, or use it empty as a writable filesystem.
    pub fn mount(fs: Arc<dyn FileSystem>, calendar: Box<dyn Calendar>, device_id: u8) -> Self {
        ZipDevice {
            fs, calendar, device_id,
            archive: None,
            errored: false,
            closed: false,
            files: Vec::new(),
            buckets: HashMap::new(),
            chain: Vec::new(),
            iterators: Vec::new(),
            streams: StreamTable::default(),
            next_file_seq: 0,
            streaming_file: None,
            check_crc: false,
            ignore_case: false,
            open_package: false,
            readonly: true,
            force_streamed: false,
            zip64_files: false,
            debug: 0,
            source_set: false,
        }
    }

    fn guard_usable(&self) -> UnitResult {
        if self.errored || self.closed {
            Err(Error::Io(IoError::new(std::io::ErrorKind::Other, "archive device is closed")))
        } else {
            Ok(())
        }
    }

    /// Record a fatal archive problem; all further operations fail cleanly.
    fn fail_archive(&mut self, error: Error) -> Error {
        if matches!(error, Error::CorruptArchive(_) | Error::Unsupported(_)) {
            log::warn!("archive unusable: {}", error);
            self.errored = true;
        }

        error
    }

    // ---- parameters ----

    /// Set a device parameter. `Filename` mounts a seekable archive
    /// unless `Streamed` was set first; an empty `Filename` leaves the
    /// device empty and writable.
    pub fn set_param(&mut self, name: &str, value: ParamValue) -> UnitResult {
        match (name, value) {
            ("CheckCRC32", ParamValue::Bool(value)) => self.check_crc = value,
            ("IgnoreCase", ParamValue::Bool(value)) => self.ignore_case = value,
            ("OpenPackage", ParamValue::Bool(value)) => self.open_package = value,
            ("ReadOnly", ParamValue::Bool(value)) => self.readonly = value,
            ("Streamed", ParamValue::Bool(value)) => self.force_streamed = value,
            ("ZIP64Files", ParamValue::Bool(value)) => self.zip64_files = value,
            ("Debug", ParamValue::Int(value)) => self.debug = value,

            ("Filename", ParamValue::Str(path)) => return self.set_filename(&path),

            ("ArchiveName", ParamValue::Str(path)) => return self.emit_archive(&path),

            ("Flush", ParamValue::Bool(true)) => return self.flush_stream(),
            ("Flush", ParamValue::Bool(false)) => {},

            ("Close", ParamValue::Bool(true)) => return self.close_device(),
            ("Close", ParamValue::Bool(false)) => {},

            ("Type", _) => return Err(Error::AccessDenied),

            _ => return Err(Error::invalid("unknown parameter or wrong type")),
        }

        Ok(())
    }

    pub fn get_param(&self, name: &str) -> Option<ParamValue> {
        match name {
            "Type" => Some(ParamValue::Str("FileSystem".into())),
            "CheckCRC32" => Some(ParamValue::Bool(self.check_crc)),
            "IgnoreCase" => Some(ParamValue::Bool(self.ignore_case)),
            "OpenPackage" => Some(ParamValue::Bool(self.open_package)),
            "ReadOnly" => Some(ParamValue::Bool(self.readonly)),
            "Streamed" => Some(ParamValue::Bool(self.force_streamed)),
            "ZIP64Files" => Some(ParamValue::Bool(self.zip64_files)),
            "Debug" => Some(ParamValue::Int(self.debug)),
            _ => None,
        }
    }

    pub fn param_list(&self) -> Vec<DeviceParam> {
        [
            "Type", "CheckCRC32", "IgnoreCase", "OpenPackage",
            "ReadOnly", "Streamed", "ZIP64Files", "Debug",
        ].iter().map(|&name| DeviceParam {
            name,
            value: self.get_param(name).expect("listed parameters always have values"),
            writeable: name != "Type",
        }).collect()
    }

    fn set_filename(&mut self, path: &str) -> UnitResult {
        self.guard_usable()?;

        if self.source_set {
            return Err(Error::invalid("archive source may only be set once"));
        }

        self.source_set = true;

        if path.is_empty() {
            // an empty, writable device with no archive behind it
            self.readonly = false;
            return Ok(());
        }

        let file = std::fs::File::open(path)?;

        if self.force_streamed {
            self.archive = Some(ZipArchive::streamed(Box::new(std::io::BufReader::new(file))));
            Ok(())
        }
        else {
            self.open_seekable(Box::new(std::io::BufReader::new(file)))
        }
    }

    /// Mount a readable handle the host evaluator produced; the streaming
    /// equivalent of `Filename`.
    pub fn set_data_source(&mut self, read: Box<dyn Read>) -> UnitResult {
        self.guard_usable()?;

        if self.source_set {
            return Err(Error::invalid("archive source may only be set once"));
        }

        self.source_set = true;
        self.archive = Some(ZipArchive::streamed(read));
        Ok(())
    }

    /// Mount a seekable handle directly, bypassing the host filesystem.
    pub fn set_seekable_source(&mut self, read: Box<dyn ReadSeek>) -> UnitResult {
        self.guard_usable()?;

        if self.source_set {
            return Err(Error::invalid("archive source may only be set once"));
        }

        self.source_set = true;

        if self.force_streamed {
            // a seekable source may still be parsed as a stream
            struct Forward(Box<dyn ReadSeek>);
            impl Read for Forward {
                fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> { self.0.read(buffer) }
            }

            self.archive = Some(ZipArchive::streamed(Box::new(Forward(read))));
            Ok(())
        }
        else {
            self.open_seekable(read)
        }
    }

    fn open_seekable(&mut self, read: Box<dyn ReadSeek>) -> UnitResult {
        let mut archive = ZipArchive::seekable(read)?;

        let entries = match read_central_directory(&mut archive) {
            Ok(entries) => entries,
            Err(error) => return Err(self.fail_archive(error)),
        };

        self.archive = Some(archive);

        for entry in entries {
            if let Err(error) = self.add_archive_entry(&entry) {
                return Err(self.fail_archive(error));
            }
        }

        Ok(())
    }

    // ---- the file table ----

    fn lookup_key(&self, canonical: &[u8]) -> Vec<u8> {
        if self.ignore_case { lowercase(canonical) } else { canonical.to_vec() }
    }

    fn find_file(&self, lookup: &[u8]) -> Option<usize> {
        let bucket = self.buckets.get(&string_hash(lookup))?;

        bucket.iter().copied().find(|&index| {
            self.files[index].as_ref()
                .map_or(false, |file| file.lookup_name == lookup)
        })
    }

    /// Look a name up, advancing a streamed archive until the name
    /// appears or the stream runs out of records.
    fn find_or_discover(&mut self, lookup: &[u8]) -> Result<Option<usize>> {
        loop {
            if let Some(index) = self.find_file(lookup) {
                return Ok(Some(index));
            }

            let can_pull = self.archive.as_ref()
                .map_or(false, |archive| archive.is_streamed() && !archive.is_complete());

            if !can_pull || !self.pull_next_record()? {
                return Ok(None);
            }
        }
    }

    fn next_scratch_name(&mut self) -> Result<String> {
        if self.next_file_seq > MAX_FILE_SEQ {
            return Err(Error::invalid("too many files on one archive device"));
        }

        let name = format!("{}{:02x}{:06x}", SCRATCH_PREFIX, self.device_id, self.next_file_seq);
        self.next_file_seq += 1;
        Ok(name)
    }

    fn insert_file(&mut self, file: ZipFile) -> usize {
        let hash = string_hash(&file.lookup_name);

        let index = match self.files.iter().position(Option::is_none) {
            Some(free) => { self.files[free] = Some(file); free },
            None => { self.files.push(Some(file)); self.files.len() - 1 },
        };

        self.buckets.entry(hash).or_default().push(index);
        self.chain.push(index);
        index
    }

    /// Accept one archive entry: ignore directories, merge pieces into
    /// their logical file, create the file on first sight.
    /// Returns the file index for piece entries.
    fn add_archive_entry(&mut self, entry: &EntryInfo) -> Result<Option<usize>> {
        entry.validate_extractable()?;

        // under package normalization the lowercased name is canonical
        let canonical = if self.open_package { lowercase(&entry.name) } else { entry.name.clone() };

        let piece = classify_piece_name(&canonical, self.open_package);
        if piece.directory {
            return Ok(None);
        }

        let stem = &canonical[.. piece.stem_len];
        let lookup = self.lookup_key(stem);
        let streamed = self.archive.as_ref().map_or(false, ZipArchive::is_streamed);

        let index = match self.find_file(&lookup) {
            Some(index) => index,
            None => {
                let scratch_name = self.next_scratch_name()?;
                self.insert_file(ZipFile::new(
                    stem.to_vec(), lookup, entry.date_time, scratch_name,
                    true, self.check_crc,
                ))
            }
        };

        self.files[index].as_mut().expect("file just resolved")
            .add_piece(piece.number, piece.last, entry, streamed)?;

        Ok(Some(index))
    }

    // ---- streamed parsing ----

    /// Advance a streamed archive by one record: finish the piece the
    /// stream sits in, then accept the next entry. Returns false when the
    /// archive has no more entries.
    fn pull_next_record(&mut self) -> Result<bool> {
        // finish whatever piece the stream is inside
        if let Some(index) = self.streaming_file.take() {
            let finished = {
                let Self { files, archive, fs, .. } = self;

                match (files[index].as_mut(), archive.as_mut()) {
                    (Some(file), Some(archive)) if file.mid_piece() =>
                        file.finish_current_piece(archive, fs.as_ref()),
                    _ => Ok(()),
                }
            };

            if let Err(error) = finished {
                return Err(self.fail_archive(error));
            }
        }

        let record = match self.archive.as_mut() {
            Some(archive) if archive.is_streamed() && !archive.is_complete() =>
                next_stream_record(archive),
            _ => return Ok(false),
        };

        let record = match record {
            Ok(record) => record,
            Err(error) => return Err(self.fail_archive(error)),
        };

        match record {
            StreamRecord::End | StreamRecord::CentralDirectory => {
                if let Some(archive) = self.archive.as_mut() { archive.set_complete(); }
                Ok(false)
            },

            StreamRecord::File(entry) => {
                let directory = entry.directory || {
                    let canonical = if self.open_package { lowercase(&entry.name) } else { entry.name.clone() };
                    classify_piece_name(&canonical, self.open_package).directory
                };

                if directory {
                    // directories still carry a data area in the stream
                    let skipped = {
                        let archive = self.archive.as_mut().expect("archive just matched");
                        skip_entry_data(archive, &entry)
                    };

                    return match skipped {
                        Ok(()) => Ok(true),
                        Err(error) => Err(self.fail_archive(error)),
                    };
                }

                match self.add_archive_entry(&entry) {
                    Ok(index) => { self.streaming_file = index; Ok(true) },
                    Err(error) => Err(self.fail_archive(error)),
                }
            },
        }
    }

    /// Extract a file at least up to `target`, pulling more of a streamed
    /// archive when its pieces have not all been seen.
    pub(crate) fn ensure_file_extracted(&mut self, index: usize, target: u64) -> UnitResult {
        loop {
            let status = {
                let Self { files, archive, fs, .. } = self;
                let file = files[index].as_mut().ok_or(Error::NotFound)?;

                match archive.as_mut() {
                    Some(archive) => file.ensure_extracted(archive, fs.as_ref(), target)?,
                    None if file.from_archive => return Err(Error::Internal("archive file without archive")),
                    None => return Ok(()),
                }
            };

            match status {
                Extracted::Enough | Extracted::Complete => return Ok(()),

                Extracted::NeedNextPiece => {
                    let complete = self.archive.as_ref().map_or(true, ZipArchive::is_complete);

                    if complete || !self.pull_next_record()? {
                        return Err(Error::Io(IoError::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "archive ended before the file's last piece",
                        )));
                    }
                },
            }
        }
    }

    /// Bytes of the file that can be served right now without error.
    fn available_bytes(&self, index: usize) -> u64 {
        self.files[index].as_ref().map_or(0, |file| file.extracted)
    }

    // ---- filesystem surface ----

    /// Open a file, creating it when asked to on a writable device.
    pub fn open(&mut self, name: &str, flags: OpenFlags) -> Result<Fd> {
        self.guard_usable()?;

        let canonical = if self.open_package { lowercase(name.as_bytes()) } else { name.as_bytes().to_vec() };
        let lookup = self.lookup_key(&canonical);

        let wants_write = flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::TRUNCATE);
        if wants_write && self.readonly {
            return Err(Error::AccessDenied);
        }

        let index = match self.find_or_discover(&lookup)? {
            Some(index) => index,

            None => {
                if !flags.contains(OpenFlags::CREATE) || self.readonly {
                    return Err(Error::NotFound);
                }

                let scratch_name = self.next_scratch_name()?;
                let date_time = dos_date_time(self.calendar.get_time());
                self.insert_file(ZipFile::new(
                    canonical.clone(), lookup.clone(), date_time, scratch_name,
                    false, self.check_crc,
                ))
            }
        };

        {
            let file = self.files[index].as_ref().expect("file just resolved");

            if file.exclusive || (flags.contains(OpenFlags::EXCL) && file.open_count > 0) {
                return Err(Error::AccessDenied);
            }
        }

        if flags.contains(OpenFlags::TRUNCATE) {
            let Self { files, fs, .. } = self;
            files[index].as_mut().unwrap().truncate(fs.as_ref())?;
        }

        let from_archive = self.files[index].as_ref().unwrap().from_archive;

        if wants_write && from_archive && !flags.contains(OpenFlags::APPEND) {
            // archive-backed contents only accept writes once truncated
            return Err(Error::AccessDenied);
        }

        if flags.contains(OpenFlags::APPEND) && from_archive {
            // appending needs the complete archive contents first
            self.ensure_file_extracted(index, u64::MAX)?;
        }

        // the scratch file must exist before a descriptor can be taken
        // on it, even for lazily extracted contents
        let scratch_name = self.files[index].as_ref().unwrap().scratch_name.clone();
        let mut scratch_flags = OpenFlags::CREATE | OpenFlags::READ;
        if wants_write { scratch_flags |= OpenFlags::WRITE; }
        if flags.contains(OpenFlags::APPEND) { scratch_flags |= OpenFlags::APPEND; }

        let scratch_fd = self.fs.open(&scratch_name, scratch_flags)?;

        {
            let file = self.files[index].as_mut().unwrap();
            file.open_count += 1;
            file.exclusive = flags.contains(OpenFlags::EXCL);
        }

        Ok(self.streams.insert(FileStream {
            file: index,
            scratch_fd,
            writable: wants_write,
            exclusive: flags.contains(OpenFlags::EXCL),
        }))
    }

    /// Read from an open stream, extracting archive bytes on demand.
    /// A short read happens at end of file, or when a streamed archive
    /// has delivered part of the file and the rest needs pieces that
    /// exist but are not reachable yet.
    pub fn read(&mut self, fd: Fd, buffer: &mut [u8]) -> Result<usize> {
        self.guard_usable()?;

        let (index, scratch_fd) = {
            let stream = self.streams.get(fd)?;
            (stream.file, stream.scratch_fd)
        };

        let position = self.fs.seek(scratch_fd, 0, SeekMode::Incr)?;
        let target = position + buffer.len() as u64;

        let from_archive = self.files[index].as_ref().ok_or(Error::NotFound)?.from_archive;

        if from_archive {
            match self.ensure_file_extracted(index, target) {
                Ok(()) => {},

                // partial data is fine as long as something is available
                Err(Error::Io(_)) if self.available_bytes(index) > position => {},
                Err(error) => return Err(error),
            }
        }

        self.fs.read(scratch_fd, buffer)
    }

    /// Write through an open stream. Only valid for streams opened
    /// writable, on non-archive or truncated files.
    pub fn write(&mut self, fd: Fd, buffer: &[u8]) -> Result<usize> {
        self.guard_usable()?;

        let stream = self.streams.get(fd)?;
        if !stream.writable { return Err(Error::AccessDenied); }

        self.fs.write(stream.scratch_fd, buffer)
    }

    /// Move a stream's position, extracting enough of the file that the
    /// target position exists in the scratch file.
    pub fn seek(&mut self, fd: Fd, offset: i64, mode: SeekMode) -> Result<u64> {
        self.guard_usable()?;

        let (index, scratch_fd) = {
            let stream = self.streams.get(fd)?;
            (stream.file, stream.scratch_fd)
        };

        let from_archive = self.files[index].as_ref().ok_or(Error::NotFound)?.from_archive;

        let target = match mode {
            SeekMode::Set => offset,
            SeekMode::Incr => self.fs.seek(scratch_fd, 0, SeekMode::Incr)? as i64 + offset,

            SeekMode::Xtnd => {
                // relative to the end, which must be materialized first
                if from_archive { self.ensure_file_extracted(index, u64::MAX)?; }
                let size = self.fs.stat(&self.files[index].as_ref().unwrap().scratch_name)?.bytes;
                size as i64 + offset
            },
        };

        if target < 0 { return Err(Error::invalid("seek before start of file")); }
        let target = target as u64;

        let extracted = self.available_bytes(index);
        if from_archive && target > extracted {
            self.ensure_file_extracted(index, target + FILE_BUFFER_SIZE as u64)?;
        }

        self.fs.seek(scratch_fd, target as i64, SeekMode::Set)
    }

    /// Close a stream.
    pub fn close(&mut self, fd: Fd) -> UnitResult {
        let stream = self.streams.remove(fd)?;
        self.fs.close(stream.scratch_fd)?;

        if let Some(file) = self.files[stream.file].as_mut() {
            file.open_count = file.open_count.saturating_sub(1);
            if stream.exclusive { file.exclusive = false; }
        }

        Ok(())
    }

    /// Tear a stream down without flushing.
    pub fn abort(&mut self, fd: Fd) -> UnitResult {
        let stream = self.streams.remove(fd)?;
        self.fs.abort(stream.scratch_fd)?;

        if let Some(file) = self.files[stream.file].as_mut() {
            file.open_count = file.open_count.saturating_sub(1);
            if stream.exclusive { file.exclusive = false; }
        }

        Ok(())
    }

    /// Size and time of a file. Forces extraction only when no piece
    /// accounting can answer the size.
    pub fn stat(&mut self, name: &str) -> Result<FileStat> {
        self.guard_usable()?;

        let canonical = if self.open_package { lowercase(name.as_bytes()) } else { name.as_bytes().to_vec() };
        let lookup = self.lookup_key(&canonical);
        let index = self.find_or_discover(&lookup)?.ok_or(Error::NotFound)?;

        let (known, from_archive, scratch_name) = {
            let file = self.files[index].as_ref().ok_or(Error::NotFound)?;
            (file.known_size(), file.from_archive, file.scratch_name.clone())
        };

        let bytes = match known {
            Some(size) => size,

            None if from_archive => {
                self.ensure_file_extracted(index, u64::MAX)?;
                self.available_bytes(index)
            },

            None => self.fs.stat(&scratch_name).map_or(0, |stat| stat.bytes),
        };

        Ok(FileStat { bytes, mtime: None })
    }

    fn remove_from_table(&mut self, index: usize) {
        if let Some(mut file) = self.files[index].take() {
            file.close_extraction(self.fs.as_ref());
            let hash = string_hash(&file.lookup_name);

            if let Some(bucket) = self.buckets.get_mut(&hash) {
                bucket.retain(|&entry| entry != index);
            }

            if let Some(chain_pos) = self.chain.iter().position(|&entry| entry == index) {
                self.chain.remove(chain_pos);

                // an iterator parked on the removed file now points at the
                // next one; iterators further along shift back with the chain
                for iterator in self.iterators.iter_mut().flatten() {
                    if iterator.1 > chain_pos { iterator.1 -= 1; }
                }
            }

            let _ = self.fs.delete(&file.scratch_name);
        }
    }

    /// Remove a file. Open or exclusively held files cannot go.
    pub fn delete(&mut self, name: &str) -> UnitResult {
        self.guard_usable()?;
        if self.readonly { return Err(Error::AccessDenied); }

        let canonical = if self.open_package { lowercase(name.as_bytes()) } else { name.as_bytes().to_vec() };
        let index = self.find_file(&self.lookup_key(&canonical)).ok_or(Error::NotFound)?;

        if self.files[index].as_ref().map_or(false, |file| file.open_count > 0)
            || self.streams.any_open_on(index)
        {
            return Err(Error::AccessDenied);
        }

        // reading past a streamed piece must not be cut short by deleting
        // the file mid-extraction
        if self.streaming_file == Some(index) {
            let Self { files, archive, fs, .. } = self;

            if let (Some(file), Some(archive)) = (files[index].as_mut(), archive.as_mut()) {
                if file.mid_piece() {
                    file.finish_current_piece(archive, fs.as_ref())?;
                }
            }

            self.streaming_file = None;
        }

        self.remove_from_table(index);
        Ok(())
    }

    /// Rename a file that is not currently open.
    pub fn rename(&mut self, from: &str, to: &str) -> UnitResult {
        self.guard_usable()?;
        if self.readonly { return Err(Error::AccessDenied); }

        let canonical_from = if self.open_package { lowercase(from.as_bytes()) } else { from.as_bytes().to_vec() };
        let index = self.find_file(&self.lookup_key(&canonical_from)).ok_or(Error::NotFound)?;

        if self.files[index].as_ref().map_or(false, |file| file.open_count > 0) {
            return Err(Error::AccessDenied);
        }

        let canonical_to = if self.open_package { lowercase(to.as_bytes()) } else { to.as_bytes().to_vec() };
        let lookup_to = self.lookup_key(&canonical_to);

        if self.find_file(&lookup_to).is_some() {
            return Err(Error::AccessDenied);
        }

        let old_hash = {
            let file = self.files[index].as_ref().unwrap();
            string_hash(&file.lookup_name)
        };

        if let Some(bucket) = self.buckets.get_mut(&old_hash) {
            bucket.retain(|&entry| entry != index);
        }

        {
            let file = self.files[index].as_mut().unwrap();
            file.name = canonical_to;
            file.lookup_name = lookup_to.clone();
        }

        self.buckets.entry(string_hash(&lookup_to)).or_default().push(index);
        Ok(())
    }

    // ---- listing ----

    /// Begin a listing of names matching a `*` glob. Names discovered
    /// later from a stream are still delivered to an iterator that has
    /// reached the end of the chain.
    pub fn start_list(&mut self, pattern: &str) -> usize {
        let state = Some((pattern.to_owned(), 0_usize));

        match self.iterators.iter().position(Option::is_none) {
            Some(free) => { self.iterators[free] = state; free },
            None => { self.iterators.push(state); self.iterators.len() - 1 },
        }
    }

    /// The next matching name, or `None` when the chain is exhausted.
    pub fn next_list(&mut self, handle: usize) -> Option<String> {
        loop {
            let (pattern, position) = self.iterators.get(handle)?.as_ref()?.clone();

            if position >= self.chain.len() { return None; }

            self.iterators[handle] = Some((pattern.clone(), position + 1));

            let index = self.chain[position];
            if let Some(file) = self.files[index].as_ref() {
                if crate::fs::pattern_matches(pattern.as_bytes(), &file.name) {
                    return Some(String::from_utf8_lossy(&file.name).into_owned());
                }
            }
        }
    }

    /// Finish a listing.
    pub fn end_list(&mut self, handle: usize) {
        if let Some(slot) = self.iterators.get_mut(handle) {
            *slot = None;
        }
    }

    // ---- whole-device operations ----

    /// Consume the rest of a streaming archive now.
    pub fn flush_stream(&mut self) -> UnitResult {
        self.guard_usable()?;

        if self.debug != 0 { log::debug!("flushing streamed archive"); }

        while self.pull_next_record()? {}
        Ok(())
    }

    /// Close the archive and discard every file.
    pub fn close_device(&mut self) -> UnitResult {
        if self.debug != 0 {
            for &index in &self.chain {
                if let Some(file) = self.files[index].as_ref() {
                    if file.open_count > 0 {
                        log::debug!("closing device with {} open", String::from_utf8_lossy(&file.name));
                    }
                }
            }
        }

        self.streams.abort_all(self.fs.as_ref())?;

        let indices: Vec<usize> = self.chain.clone();
        for index in indices {
            if let Some(file) = self.files[index].as_mut() {
                file.close_extraction(self.fs.as_ref());
            }
            self.remove_from_table(index);
        }

        self.archive = None;
        self.closed = true;
        Ok(())
    }

    /// Emit the device contents as a fresh archive at a host path.
    fn emit_archive(&mut self, path: &str) -> UnitResult {
        if path.is_empty() {
            return Err(Error::invalid("archive name"));
        }

        let out = std::fs::File::create(path)?;
        self.write_archive(Box::new(out))
    }

    /// Emit the device contents as a fresh archive into any seekable
    /// target, copying untouched entries through compressed.
    pub fn write_archive(&mut self, out: Box<dyn super::writer::WriteSeek + '_>) -> UnitResult {
        self.guard_usable()?;

        let streamed_incomplete = self.archive.as_ref()
            .map_or(false, |archive| archive.is_streamed() && !archive.is_complete());

        if streamed_incomplete {
            // everything must be known before it can be re-archived
            self.flush_stream()?;
        }

        super::writer::write_device_archive(self, out)
    }

    /// Number of files currently visible.
    pub fn file_count(&self) -> usize {
        self.chain.iter().filter(|&&index| self.files[index].is_some()).count()
    }
}

impl Drop for ZipDevice {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close_device();
        }
    }
}
