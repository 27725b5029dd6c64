
//! A scratch filesystem held entirely in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result, UnitResult};
use super::{DeviceStatus, Fd, FileList, FileStat, FileSystem, OpenFlags, SeekMode, pattern_matches};


#[derive(Debug, Default)]
struct FileEntry {
    bytes: Vec<u8>,
    open_count: u32,
    exclusive: bool,
}

#[derive(Debug)]
struct OpenFile {
    name: String,
    position: u64,
    flags: OpenFlags,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<String, Arc<Mutex<FileEntry>>>,
    open: HashMap<Fd, OpenFile>,
    next_fd: Fd,
}

/// Files in a hash map, contents in plain vectors.
/// Fast, deterministic, and exactly what the tests want to inspect.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    state: Mutex<State>,
}

impl MemoryFileSystem {

    pub fn new() -> Self { Self::default() }

    /// Snapshot the contents of a file, bypassing descriptors.
    /// Intended for tests and debugging.
    pub fn peek(&self, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.files.get(name).map(|entry| entry.lock().unwrap().bytes.clone())
    }

    /// Preload a file, bypassing descriptors. Intended for tests.
    pub fn put(&self, name: &str, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(
            name.to_owned(),
            Arc::new(Mutex::new(FileEntry { bytes, open_count: 0, exclusive: false }))
        );
    }
}

struct NameList {
    names: std::vec::IntoIter<String>,
}

impl FileList for NameList {
    fn next_name(&mut self) -> Option<String> { self.names.next() }
}

impl FileSystem for MemoryFileSystem {

    fn open(&self, name: &str, flags: OpenFlags) -> Result<Fd> {
        let mut state = self.state.lock().unwrap();

        let exists = state.files.contains_key(name);
        if !exists && !flags.contains(OpenFlags::CREATE) {
            return Err(Error::NotFound);
        }

        if !exists {
            state.files.insert(name.to_owned(), Arc::new(Mutex::new(FileEntry::default())));
        }

        let entry = state.files.get(name).unwrap().clone();
        {
            let mut entry = entry.lock().unwrap();

            if entry.exclusive || (flags.contains(OpenFlags::EXCL) && entry.open_count > 0) {
                return Err(Error::AccessDenied);
            }

            if flags.contains(OpenFlags::TRUNCATE) {
                entry.bytes.clear();
            }

            entry.open_count += 1;
            entry.exclusive = flags.contains(OpenFlags::EXCL);
        }

        let position = if flags.contains(OpenFlags::APPEND) {
            entry.lock().unwrap().bytes.len() as u64
        } else { 0 };

        state.next_fd += 1;
        let fd = state.next_fd;
        state.open.insert(fd, OpenFile { name: name.to_owned(), position, flags });
        Ok(fd)
    }

    fn read(&self, fd: Fd, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();

        let (name, position) = {
            let open = state.open.get(&fd).ok_or(Error::invalid("bad descriptor"))?;
            if !open.flags.contains(OpenFlags::READ) { return Err(Error::AccessDenied); }
            (open.name.clone(), open.position)
        };

        let entry = state.files.get(&name).ok_or(Error::NotFound)?.clone();
        let entry = entry.lock().unwrap();

        let start = (position as usize).min(entry.bytes.len());
        let count = buffer.len().min(entry.bytes.len() - start);
        buffer[.. count].copy_from_slice(&entry.bytes[start .. start + count]);

        state.open.get_mut(&fd).unwrap().position += count as u64;
        Ok(count)
    }

    fn write(&self, fd: Fd, buffer: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();

        let (name, position) = {
            let open = state.open.get(&fd).ok_or(Error::invalid("bad descriptor"))?;
            if !open.flags.contains(OpenFlags::WRITE) { return Err(Error::AccessDenied); }
            (open.name.clone(), open.position)
        };

        let entry = state.files.get(&name).ok_or(Error::NotFound)?.clone();
        {
            let mut entry = entry.lock().unwrap();
            let end = position as usize + buffer.len();
            if entry.bytes.len() < end { entry.bytes.resize(end, 0); }
            entry.bytes[position as usize .. end].copy_from_slice(buffer);
        }

        state.open.get_mut(&fd).unwrap().position += buffer.len() as u64;
        Ok(buffer.len())
    }

    fn seek(&self, fd: Fd, offset: i64, mode: SeekMode) -> Result<u64> {
        let mut state = self.state.lock().unwrap();

        let (name, position) = {
            let open = state.open.get(&fd).ok_or(Error::invalid("bad descriptor"))?;
            (open.name.clone(), open.position)
        };

        let length = {
            let entry = state.files.get(&name).ok_or(Error::NotFound)?;
            entry.lock().unwrap().bytes.len() as i64
        };

        let target = match mode {
            SeekMode::Set => offset,
            SeekMode::Incr => position as i64 + offset,
            SeekMode::Xtnd => length + offset,
        };

        if target < 0 { return Err(Error::invalid("seek before start of file")); }

        let target = target as u64;
        state.open.get_mut(&fd).unwrap().position = target;
        Ok(target)
    }

    fn close(&self, fd: Fd) -> UnitResult {
        let mut state = self.state.lock().unwrap();
        let open = state.open.remove(&fd).ok_or(Error::invalid("bad descriptor"))?;

        if let Some(entry) = state.files.get(&open.name) {
            let mut entry = entry.lock().unwrap();
            entry.open_count = entry.open_count.saturating_sub(1);
            entry.exclusive = false;
        }

        Ok(())
    }

    fn abort(&self, fd: Fd) -> UnitResult {
        self.close(fd)
    }

    fn stat(&self, name: &str) -> Result<FileStat> {
        let state = self.state.lock().unwrap();
        let entry = state.files.get(name).ok_or(Error::NotFound)?;
        let bytes = entry.lock().unwrap().bytes.len() as u64;
        Ok(FileStat { bytes, mtime: None })
    }

    fn delete(&self, name: &str) -> UnitResult {
        let mut state = self.state.lock().unwrap();

        match state.files.get(name) {
            None => return Err(Error::NotFound),
            Some(entry) => if entry.lock().unwrap().open_count > 0 {
                return Err(Error::AccessDenied);
            },
        }

        state.files.remove(name);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> UnitResult {
        let mut state = self.state.lock().unwrap();

        match state.files.get(from) {
            None => return Err(Error::NotFound),
            Some(entry) => if entry.lock().unwrap().open_count > 0 {
                return Err(Error::AccessDenied);
            },
        }

        let entry = state.files.remove(from).unwrap();
        state.files.insert(to.to_owned(), entry);
        Ok(())
    }

    fn start_list(&self, pattern: &str) -> Result<Box<dyn FileList>> {
        let state = self.state.lock().unwrap();

        let mut names: Vec<String> = state.files.keys()
            .filter(|name| pattern_matches(pattern.as_bytes(), name.as_bytes()))
            .cloned()
            .collect();

        names.sort();
        Ok(Box::new(NameList { names: names.into_iter() }))
    }

    fn device_status(&self) -> DeviceStatus {
        DeviceStatus { free_bytes: None, total_bytes: None }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_write_read_seek(){
        let fs = MemoryFileSystem::new();

        let fd = fs.open("a/b", OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE).unwrap();
        assert_eq!(fs.write(fd, b"hello world").unwrap(), 11);

        fs.seek(fd, 6, SeekMode::Set).unwrap();
        let mut buffer = [0_u8; 16];
        assert_eq!(fs.read(fd, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"world");

        assert_eq!(fs.seek(fd, -5, SeekMode::Xtnd).unwrap(), 6);
        fs.close(fd).unwrap();

        assert_eq!(fs.stat("a/b").unwrap().bytes, 11);
    }

    #[test]
    fn exclusive_open(){
        let fs = MemoryFileSystem::new();
        let fd = fs.open("f", OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::EXCL).unwrap();

        assert!(matches!(fs.open("f", OpenFlags::READ), Err(Error::AccessDenied)));
        fs.close(fd).unwrap();
        fs.open("f", OpenFlags::READ).unwrap();
    }

    #[test]
    fn delete_open_file_denied(){
        let fs = MemoryFileSystem::new();
        let fd = fs.open("f", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        assert!(matches!(fs.delete("f"), Err(Error::AccessDenied)));
        fs.close(fd).unwrap();
        fs.delete("f").unwrap();
        assert!(matches!(fs.stat("f"), Err(Error::NotFound)));
    }

    #[test]
    fn listing(){
        let fs = MemoryFileSystem::new();
        fs.put("ZIP/0a000001", vec![1]);
        fs.put("ZIP/0a000002", vec![2]);
        fs.put("other", vec![3]);

        let mut list = fs.start_list("ZIP/*").unwrap();
        assert_eq!(list.next_name().unwrap(), "ZIP/0a000001");
        assert_eq!(list.next_name().unwrap(), "ZIP/0a000002");
        assert!(list.next_name().is_none());
    }
}
