
//! End-to-end archive behavior through the device surface.

use std::convert::TryInto;
use std::io::Cursor;
use std::sync::Arc;

use ripstore::calendar::NoCalendar;
use ripstore::error::Error;
use ripstore::fs::{FileSystem, MemoryFileSystem, OpenFlags, SeekMode};
use ripstore::zip::records::{
    CentralFile, DataDescriptor, EndCdir, LocalFile,
    FLAG_USE_DATA_DESCRIPTOR, METHOD_DEFLATE, METHOD_STORE,
};
use ripstore::zip::{ParamValue, WriteonlyZipDevice, ZipDevice};


fn crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn mount_seekable(bytes: Vec<u8>) -> ZipDevice {
    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 1,
    );

    device.set_seekable_source(Box::new(Cursor::new(bytes))).unwrap();
    device
}

/// A one-entry stored archive with a central directory.
fn stored_archive(name: &[u8], data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();

    let header = LocalFile {
        version_needed: 20,
        compression: METHOD_STORE,
        crc32: crc(data),
        compressed_size: data.len() as u32,
        uncompressed_size: data.len() as u32,
        name: name.to_vec(),
        ..Default::default()
    };

    header.write(&mut bytes).unwrap();
    bytes.extend_from_slice(data);

    let cdir_offset = bytes.len() as u32;

    let central = CentralFile {
        made_by: 20,
        version_needed: 20,
        compression: METHOD_STORE,
        crc32: crc(data),
        compressed_size: data.len() as u32,
        uncompressed_size: data.len() as u32,
        local_header_offset: 0,
        name: name.to_vec(),
        ..Default::default()
    };

    central.write(&mut bytes).unwrap();
    let cdir_size = bytes.len() as u32 - cdir_offset;

    EndCdir {
        entries_this_disk: 1,
        entries_total: 1,
        cdir_size,
        cdir_offset,
        ..Default::default()
    }.write(&mut bytes).unwrap();

    bytes
}


#[test]
fn empty_archive(){
    let mut bytes = Vec::new();
    EndCdir::default().write(&mut bytes).unwrap();
    assert_eq!(bytes.len(), 22);

    let mut device = mount_seekable(bytes);

    let list = device.start_list("*");
    assert!(device.next_list(list).is_none());
    device.end_list(list);

    assert!(matches!(device.stat("anything"), Err(Error::NotFound)));
}

#[test]
fn one_stored_entry_seekable(){
    let mut device = mount_seekable(stored_archive(b"hello.txt", b"hello world"));

    assert_eq!(device.stat("hello.txt").unwrap().bytes, 11);

    let fd = device.open("hello.txt", OpenFlags::READ).unwrap();

    let mut buffer = [0_u8; 11];
    assert_eq!(device.read(fd, &mut buffer).unwrap(), 11);
    assert_eq!(&buffer, b"hello world");

    // past the end there is nothing
    assert_eq!(device.read(fd, &mut [0_u8; 1]).unwrap(), 0);

    device.close(fd).unwrap();
}

/// A streamed one-entry archive: deflated data announced only by the
/// trailing data descriptor.
fn streamed_deflate_archive(name: &[u8], data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();

    LocalFile {
        version_needed: 20,
        flags: FLAG_USE_DATA_DESCRIPTOR,
        compression: METHOD_DEFLATE,
        crc32: 0,
        compressed_size: 0,
        uncompressed_size: 0,
        name: name.to_vec(),
        ..Default::default()
    }.write(&mut bytes).unwrap();

    let compressed = miniz_oxide::deflate::compress_to_vec(data, 6);
    bytes.extend_from_slice(&compressed);

    DataDescriptor {
        crc32: crc(data),
        compressed: compressed.len() as u64,
        uncompressed: data.len() as u64,
    }.write(&mut bytes, false, true).unwrap();

    bytes
}

#[test]
fn streamed_deflated_entry_with_descriptor(){
    let bytes = streamed_deflate_archive(b"hello.txt", b"hello world");

    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 2,
    );
    device.set_param("CheckCRC32", ParamValue::Bool(true)).unwrap();
    device.set_data_source(Box::new(Cursor::new(bytes))).unwrap();

    let fd = device.open("hello.txt", OpenFlags::READ).unwrap();

    let mut buffer = [0_u8; 32];
    assert_eq!(device.read(fd, &mut buffer).unwrap(), 11);
    assert_eq!(&buffer[.. 11], b"hello world");

    device.close(fd).unwrap();
}

#[test]
fn streamed_crc_mismatch_fails_the_read(){
    let mut bytes = streamed_deflate_archive(b"hello.txt", b"hello world");

    // flip one bit of the stored checksum so the payload no longer matches
    let descriptor_crc = bytes.len() - 12;
    bytes[descriptor_crc] ^= 0x01;

    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 3,
    );
    device.set_param("CheckCRC32", ParamValue::Bool(true)).unwrap();
    device.set_data_source(Box::new(Cursor::new(bytes))).unwrap();

    let fd = device.open("hello.txt", OpenFlags::READ).unwrap();
    assert!(device.read(fd, &mut [0_u8; 32]).is_err());
}

/// An archive of stored entries in the given order, with a matching
/// central directory.
fn multi_entry_archive(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut centrals = Vec::new();

    for (name, data) in entries {
        let offset = bytes.len() as u32;

        LocalFile {
            version_needed: 20,
            compression: METHOD_STORE,
            crc32: crc(data),
            compressed_size: data.len() as u32,
            uncompressed_size: data.len() as u32,
            name: name.to_vec(),
            ..Default::default()
        }.write(&mut bytes).unwrap();

        bytes.extend_from_slice(data);

        centrals.push(CentralFile {
            made_by: 20,
            version_needed: 20,
            compression: METHOD_STORE,
            crc32: crc(data),
            compressed_size: data.len() as u32,
            uncompressed_size: data.len() as u32,
            local_header_offset: offset,
            name: name.to_vec(),
            ..Default::default()
        });
    }

    let cdir_offset = bytes.len() as u32;
    for central in &centrals { central.write(&mut bytes).unwrap(); }
    let cdir_size = bytes.len() as u32 - cdir_offset;

    EndCdir {
        entries_this_disk: centrals.len() as u16,
        entries_total: centrals.len() as u16,
        cdir_size,
        cdir_offset,
        ..Default::default()
    }.write(&mut bytes).unwrap();

    bytes
}

#[test]
fn xps_pieces_merge_in_order(){
    // physical entries deliberately out of order
    let bytes = multi_entry_archive(&[
        (b"foo.xml/[2].last.piece", b"CCC"),
        (b"foo.xml/[0].piece", b"AAA"),
        (b"foo.xml/[1].piece", b"BBB"),
    ]);

    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 4,
    );
    device.set_param("OpenPackage", ParamValue::Bool(true)).unwrap();
    device.set_seekable_source(Box::new(Cursor::new(bytes))).unwrap();

    // a single logical file appears
    let list = device.start_list("*");
    assert_eq!(device.next_list(list).unwrap(), "foo.xml");
    assert!(device.next_list(list).is_none());
    device.end_list(list);

    assert_eq!(device.stat("foo.xml").unwrap().bytes, 9);

    let fd = device.open("foo.xml", OpenFlags::READ).unwrap();
    let mut buffer = [0_u8; 9];
    assert_eq!(device.read(fd, &mut buffer).unwrap(), 9);
    assert_eq!(&buffer, b"AAABBBCCC");
    device.close(fd).unwrap();
}

#[test]
fn piece_after_last_fails_the_mount(){
    let bytes = multi_entry_archive(&[
        (b"foo.xml/[0].piece", b"AAA"),
        (b"foo.xml/[1].last.piece", b"BBB"),
        (b"foo.xml/[2].piece", b"CCC"),
    ]);

    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 5,
    );
    device.set_param("OpenPackage", ParamValue::Bool(true)).unwrap();

    assert!(device.set_seekable_source(Box::new(Cursor::new(bytes))).is_err());
}

#[test]
fn directories_are_ignored(){
    let bytes = multi_entry_archive(&[
        (b"folder/", b""),
        (b"folder/file.txt", b"contents"),
    ]);

    let mut device = mount_seekable(bytes);

    assert!(matches!(device.stat("folder/"), Err(Error::NotFound)));
    assert_eq!(device.stat("folder/file.txt").unwrap().bytes, 8);
}

#[test]
fn case_insensitive_lookup(){
    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 6,
    );
    device.set_param("IgnoreCase", ParamValue::Bool(true)).unwrap();
    device.set_seekable_source(Box::new(Cursor::new(
        stored_archive(b"Mixed/Case.TXT", b"payload")
    ))).unwrap();

    assert_eq!(device.stat("mixed/case.txt").unwrap().bytes, 7);
    assert_eq!(device.stat("MIXED/CASE.txt").unwrap().bytes, 7);
}

#[test]
fn seek_and_partial_reads(){
    let mut device = mount_seekable(stored_archive(b"data.bin", b"0123456789"));
    let fd = device.open("data.bin", OpenFlags::READ).unwrap();

    device.seek(fd, 4, SeekMode::Set).unwrap();
    let mut buffer = [0_u8; 3];
    device.read(fd, &mut buffer).unwrap();
    assert_eq!(&buffer, b"456");

    device.seek(fd, -2, SeekMode::Xtnd).unwrap();
    let mut buffer = [0_u8; 8];
    assert_eq!(device.read(fd, &mut buffer).unwrap(), 2);
    assert_eq!(&buffer[.. 2], b"89");

    device.seek(fd, -4, SeekMode::Incr).unwrap();
    let mut buffer = [0_u8; 1];
    device.read(fd, &mut buffer).unwrap();
    assert_eq!(&buffer, b"6");

    device.close(fd).unwrap();
}

#[test]
fn new_files_on_a_writable_device(){
    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 7,
    );

    // empty Filename: an empty, writable device
    device.set_param("Filename", ParamValue::Str(String::new())).unwrap();

    let fd = device.open("notes.txt", OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::READ).unwrap();
    device.write(fd, b"jotted down").unwrap();
    device.seek(fd, 0, SeekMode::Set).unwrap();

    let mut buffer = [0_u8; 11];
    device.read(fd, &mut buffer).unwrap();
    assert_eq!(&buffer, b"jotted down");
    device.close(fd).unwrap();

    assert_eq!(device.stat("notes.txt").unwrap().bytes, 11);

    device.delete("notes.txt").unwrap();
    assert!(matches!(device.stat("notes.txt"), Err(Error::NotFound)));
}

#[test]
fn exclusive_open_blocks_others(){
    let mut device = mount_seekable(stored_archive(b"file", b"x"));

    let fd = device.open("file", OpenFlags::READ | OpenFlags::EXCL).unwrap();
    assert!(matches!(device.open("file", OpenFlags::READ), Err(Error::AccessDenied)));

    device.close(fd).unwrap();
    let fd = device.open("file", OpenFlags::READ).unwrap();
    device.close(fd).unwrap();
}

#[test]
fn archive_roundtrip_through_writer(){
    // build an archive with the write-only device, remount it, emit it
    // again from the read device, and remount that
    let mut first = Vec::new();
    {
        let mut writer = WriteonlyZipDevice::new(
            Box::new(Cursor::new(&mut first)), Box::new(NoCalendar), false,
        );

        for (name, data) in [("a.txt", "alpha"), ("b.txt", "beta"), ("c/d.txt", "delta")] {
            writer.open_file(name).unwrap();
            writer.write(data.as_bytes()).unwrap();
            writer.close_file().unwrap();
        }

        writer.close_archive().unwrap();
    }

    let mut device = mount_seekable(first);
    assert_eq!(device.file_count(), 3);
    assert_eq!(device.stat("b.txt").unwrap().bytes, 4);

    let mut second = Cursor::new(Vec::new());
    device.write_archive(Box::new(&mut second)).unwrap();

    let mut reread = mount_seekable(second.into_inner());
    assert_eq!(reread.file_count(), 3);

    for (name, data) in [("a.txt", &b"alpha"[..]), ("b.txt", &b"beta"[..]), ("c/d.txt", &b"delta"[..])] {
        let fd = reread.open(name, OpenFlags::READ).unwrap();
        let mut buffer = vec![0_u8; data.len() + 4];
        assert_eq!(reread.read(fd, &mut buffer).unwrap(), data.len());
        assert_eq!(&buffer[.. data.len()], data);
        reread.close(fd).unwrap();
    }
}

#[test]
fn errored_writer_emits_no_directory(){
    let mut bytes = Vec::new();
    {
        let mut writer = WriteonlyZipDevice::new(
            Box::new(Cursor::new(&mut bytes)), Box::new(NoCalendar), false,
        );

        writer.open_file("x").unwrap();
        writer.write(b"data").unwrap();
        writer.mark_underlying_closed();

        assert!(writer.write(b"more").is_err());
        assert!(writer.close_archive().is_err());
    }

    // nothing after the entry data: no central directory signature
    assert!(!bytes.windows(4).any(|window| window == b"PK\x01\x02"));
}

#[test]
fn scratch_files_are_named_and_purged(){
    let fs = Arc::new(MemoryFileSystem::new());

    {
        let mut device = ZipDevice::mount(fs.clone(), Box::new(NoCalendar), 0x0a);
        device.set_seekable_source(Box::new(Cursor::new(
            stored_archive(b"entry", b"payload")
        ))).unwrap();

        let fd = device.open("entry", OpenFlags::READ).unwrap();
        device.read(fd, &mut [0_u8; 7]).unwrap();
        device.close(fd).unwrap();

        // first file of device 0x0a
        assert_eq!(fs.peek("ZIP/0a000000").unwrap(), b"payload");
    }

    // the device dropped; simulate the next boot
    fs.put("ZIP/0a000000", b"stale".to_vec());
    ripstore::zip::purge_stale_scratch(fs.as_ref()).unwrap();
    assert!(fs.stat("ZIP/0a000000").is_err());
}

#[test]
fn zip64_promotion_with_many_files(){
    let mut bytes = Vec::new();
    {
        let mut writer = WriteonlyZipDevice::new(
            Box::new(Cursor::new(&mut bytes)), Box::new(NoCalendar), false,
        );

        for index in 0 .. 70_000_u32 {
            writer.open_file(&format!("f{:05}", index)).unwrap();
            writer.write(b"x").unwrap();
            writer.close_file().unwrap();
        }

        writer.close_archive().unwrap();
    }

    // the archive must end in a zip64 end of directory + locator + the
    // classic end record with the entry count clamped to the sentinel
    let end = &bytes[bytes.len() - 22 ..];
    assert_eq!(&end[.. 4], b"PK\x05\x06");
    assert_eq!(u16::from_le_bytes([end[8], end[9]]), 0xffff); // entries this disk
    assert_eq!(u16::from_le_bytes([end[10], end[11]]), 0xffff);

    let zip64_locator = &bytes[bytes.len() - 42 .. bytes.len() - 22];
    assert_eq!(&zip64_locator[.. 4], b"PK\x06\x07");

    let zip64_end = &bytes[bytes.len() - 42 - 56 .. bytes.len() - 42];
    assert_eq!(&zip64_end[.. 4], b"PK\x06\x06");
    assert_eq!(u64::from_le_bytes(zip64_end[24 .. 32].try_into().unwrap()), 70_000);

    // and it must remount completely
    let mut device = mount_seekable(bytes);
    assert_eq!(device.file_count(), 70_000);
    assert_eq!(device.stat("f69999").unwrap().bytes, 1);
}

#[test]
fn flush_consumes_a_stream(){
    let mut bytes = Vec::new();
    for (name, data) in [(&b"one"[..], &b"11"[..]), (&b"two"[..], &b"2222"[..])] {
        bytes.extend(streamed_deflate_archive(name, data));
    }

    let mut device = ZipDevice::mount(
        Arc::new(MemoryFileSystem::new()), Box::new(NoCalendar), 8,
    );
    device.set_data_source(Box::new(Cursor::new(bytes))).unwrap();

    // nothing discovered yet; flushing finds both entries
    device.set_param("Flush", ParamValue::Bool(true)).unwrap();
    assert_eq!(device.file_count(), 2);
    assert_eq!(device.stat("two").unwrap().bytes, 4);
}

#[test]
fn close_purges_everything(){
    let fs = Arc::new(MemoryFileSystem::new());
    let mut device = ZipDevice::mount(fs.clone(), Box::new(NoCalendar), 9);
    device.set_seekable_source(Box::new(Cursor::new(
        stored_archive(b"entry", b"payload")
    ))).unwrap();

    device.stat("entry").unwrap();
    device.set_param("Close", ParamValue::Bool(true)).unwrap();

    assert!(device.open("entry", OpenFlags::READ).is_err());
    assert!(fs.stat("ZIP/09000000").is_err());
}
