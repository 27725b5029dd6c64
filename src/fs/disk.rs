
//! A scratch filesystem rooted at a directory of the host filesystem.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result, UnitResult};
use super::{DeviceStatus, Fd, FileList, FileStat, FileSystem, OpenFlags, SeekMode, pattern_matches};


#[derive(Debug)]
struct OpenFile {
    file: fs::File,
    name: String,
    flags: OpenFlags,
}

#[derive(Debug, Default)]
struct State {
    open: HashMap<Fd, OpenFile>,
    open_names: HashMap<String, u32>,
    next_fd: Fd,
}

/// Scratch files as real files below a root directory.
/// Relative names map to paths below the root; name components never
/// escape it.
#[derive(Debug)]
pub struct DiskFileSystem {
    root: PathBuf,
    state: Mutex<State>,
}

impl DiskFileSystem {

    /// Use the given directory as the scratch root, creating it if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, state: Mutex::new(State::default()) })
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.starts_with('/') || name.split('/').any(|part| part == "..") {
            return Err(Error::invalid("scratch file name"));
        }

        Ok(self.root.join(name))
    }
}

struct NameList {
    names: std::vec::IntoIter<String>,
}

impl FileList for NameList {
    fn next_name(&mut self) -> Option<String> { self.names.next() }
}

/// Collect relative names of all files below `dir`.
fn collect_names(root: &Path, dir: &Path, into: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            collect_names(root, &path, into)?;
        }
        else if let Ok(relative) = path.strip_prefix(root) {
            into.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }

    Ok(())
}

impl FileSystem for DiskFileSystem {

    fn open(&self, name: &str, flags: OpenFlags) -> Result<Fd> {
        let path = self.resolve(name)?;
        let mut state = self.state.lock().unwrap();

        if flags.contains(OpenFlags::EXCL) && state.open_names.get(name).copied().unwrap_or(0) > 0 {
            return Err(Error::AccessDenied);
        }

        if flags.contains(OpenFlags::CREATE) {
            if let Some(parent) = path.parent() { fs::create_dir_all(parent)?; }
        }

        let mut file = fs::OpenOptions::new()
            .read(flags.contains(OpenFlags::READ))
            .write(flags.contains(OpenFlags::WRITE) || flags.contains(OpenFlags::APPEND))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .open(&path)?;

        if flags.contains(OpenFlags::APPEND) {
            file.seek(SeekFrom::End(0))?;
        }

        state.next_fd += 1;
        let fd = state.next_fd;
        state.open.insert(fd, OpenFile { file, name: name.to_owned(), flags });
        *state.open_names.entry(name.to_owned()).or_insert(0) += 1;
        Ok(fd)
    }

    fn read(&self, fd: Fd, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let open = state.open.get_mut(&fd).ok_or(Error::invalid("bad descriptor"))?;
        Ok(open.file.read(buffer)?)
    }

    fn write(&self, fd: Fd, buffer: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let open = state.open.get_mut(&fd).ok_or(Error::invalid("bad descriptor"))?;
        open.file.write_all(buffer)?;
        Ok(buffer.len())
    }

    fn seek(&self, fd: Fd, offset: i64, mode: SeekMode) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let open = state.open.get_mut(&fd).ok_or(Error::invalid("bad descriptor"))?;

        let from = match mode {
            SeekMode::Set => SeekFrom::Start(offset.max(0) as u64),
            SeekMode::Incr => SeekFrom::Current(offset),
            SeekMode::Xtnd => SeekFrom::End(offset),
        };

        Ok(open.file.seek(from)?)
    }

    fn close(&self, fd: Fd) -> UnitResult {
        let mut state = self.state.lock().unwrap();
        let open = state.open.remove(&fd).ok_or(Error::invalid("bad descriptor"))?;

        if open.flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND) {
            open.file.sync_all().map_err(Error::from)?;
        }

        if let Some(count) = state.open_names.get_mut(&open.name) {
            *count = count.saturating_sub(1);
        }

        Ok(())
    }

    fn abort(&self, fd: Fd) -> UnitResult {
        let mut state = self.state.lock().unwrap();

        if let Some(open) = state.open.remove(&fd) { // dropping the handle discards buffered state
            if let Some(count) = state.open_names.get_mut(&open.name) {
                *count = count.saturating_sub(1);
            }
        }

        Ok(())
    }

    fn stat(&self, name: &str) -> Result<FileStat> {
        let meta = fs::metadata(self.resolve(name)?)?;

        let mtime = meta.modified().ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs());

        Ok(FileStat { bytes: meta.len(), mtime })
    }

    fn delete(&self, name: &str) -> UnitResult {
        fs::remove_file(self.resolve(name)?)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> UnitResult {
        let to_path = self.resolve(to)?;
        if let Some(parent) = to_path.parent() { fs::create_dir_all(parent)?; }
        fs::rename(self.resolve(from)?, to_path)?;
        Ok(())
    }

    fn start_list(&self, pattern: &str) -> Result<Box<dyn FileList>> {
        let mut names = Vec::new();
        collect_names(&self.root, &self.root, &mut names)?;

        names.retain(|name| pattern_matches(pattern.as_bytes(), name.as_bytes()));
        names.sort();
        Ok(Box::new(NameList { names: names.into_iter() }))
    }

    fn device_status(&self) -> DeviceStatus {
        DeviceStatus::default()
    }
}
