
//! Read and write the on-wire archive records.
//! Exact PKWARE APPNOTE 4.5 layouts; every multi-byte field is
//! little-endian. Readers assume the 4-byte signature has already been
//! consumed; writers emit it.

use crate::error::{Error, Result, UnitResult};
use crate::io::{Data, Read, Write};


/// `PK\x03\x04`
pub const SIG_LOCAL_FILE: u32 = 0x0403_4b50;

/// `PK\x01\x02`
pub const SIG_CENTRAL_FILE: u32 = 0x0201_4b50;

/// `PK\x05\x06`
pub const SIG_END_CDIR: u32 = 0x0605_4b50;

/// `PK\x07\x08`
pub const SIG_DATA_DESCRIPTOR: u32 = 0x0807_4b50;

/// `PK\x06\x06`
pub const SIG_ZIP64_END_CDIR: u32 = 0x0606_4b50;

/// `PK\x06\x07`
pub const SIG_ZIP64_LOCATOR: u32 = 0x0706_4b50;

/// Every signature this implementation recognizes.
pub const ALL_SIGNATURES: [u32; 6] = [
    SIG_LOCAL_FILE, SIG_CENTRAL_FILE, SIG_END_CDIR,
    SIG_DATA_DESCRIPTOR, SIG_ZIP64_END_CDIR, SIG_ZIP64_LOCATOR,
];

/// A 16-bit field holding this reads its true value from the zip64 extra.
pub const ZIP64_SHORT: u16 = 0xffff;

/// A 32-bit field holding this reads its true value from the zip64 extra.
pub const ZIP64_LONG: u32 = 0xffff_ffff;

/// Extra-field header id of the zip64 extended information record.
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

pub const FLAG_ENCRYPTED: u16 = 1 << 0;
pub const FLAG_USE_DATA_DESCRIPTOR: u16 = 1 << 3;
pub const FLAG_PATCHED_DATA: u16 = 1 << 5;
pub const FLAG_STRONG_ENCRYPTION: u16 = 1 << 6;
pub const FLAG_ENCRYPTED_CDIR: u16 = 1 << 13;

/// Flag bits that make an entry unextractable for us.
pub const FLAG_REJECTED: u16 =
    FLAG_ENCRYPTED | FLAG_PATCHED_DATA | FLAG_STRONG_ENCRYPTION | FLAG_ENCRYPTED_CDIR;

pub const METHOD_STORE: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;

/// Version 2.0, the baseline for deflate entries.
pub const VERSION_DEFLATE: u16 = 20;

/// Version 4.5, required for zip64 entries.
pub const VERSION_ZIP64: u16 = 45;

/// Made-by: MS-DOS compatibility, version 2.0.
pub const MADE_BY_MSDOS: u16 = 20;

/// MS-DOS external attribute bits marking directories and volume labels.
pub const EXTERNAL_DIRECTORY: u32 = 0x10;
pub const EXTERNAL_VOLUME: u32 = 0x08;

/// Data descriptor body sizes, signature not included.
pub const DATA_DESCRIPTOR_SIZE: usize = 12;
pub const ZIP64_DATA_DESCRIPTOR_SIZE: usize = 20;


fn read_name(read: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    if len > u16::MAX as usize {
        return Err(Error::corrupt("name length"));
    }

    u8::read_vec(read, len)
}


/// The record following an entry's data when general-purpose bit 3 is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed: u64,
    pub uncompressed: u64,
}

impl DataDescriptor {

    /// Read the body. Sizes are 8 bytes each in the zip64 variant.
    pub fn read(read: &mut impl Read, zip64: bool) -> Result<Self> {
        let crc32 = u32::read(read)?;

        let (compressed, uncompressed) = if zip64 {
            (u64::read(read)?, u64::read(read)?)
        } else {
            (u64::from(u32::read(read)?), u64::from(u32::read(read)?))
        };

        Ok(DataDescriptor { crc32, compressed, uncompressed })
    }

    /// Write the record with its optional signature.
    pub fn write(&self, write: &mut impl Write, zip64: bool, with_signature: bool) -> UnitResult {
        if with_signature { SIG_DATA_DESCRIPTOR.write(write)?; }
        self.crc32.write(write)?;

        if zip64 {
            self.compressed.write(write)?;
            self.uncompressed.write(write)?;
        }
        else {
            (self.compressed as u32).write(write)?;
            (self.uncompressed as u32).write(write)?;
        }

        Ok(())
    }
}


/// The header preceding each entry's data.
#[derive(Debug, Clone, Default)]
pub struct LocalFile {
    pub version_needed: u16,
    pub flags: u16,
    pub compression: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extras: Vec<u8>,
}

impl LocalFile {

    /// Read the record body, name and extras. The signature must already
    /// have been consumed.
    pub fn read(read: &mut impl Read) -> Result<Self> {
        let version_needed = u16::read(read)?;
        let flags = u16::read(read)?;
        let compression = u16::read(read)?;
        let mod_time = u16::read(read)?;
        let mod_date = u16::read(read)?;
        let crc32 = u32::read(read)?;
        let compressed_size = u32::read(read)?;
        let uncompressed_size = u32::read(read)?;
        let name_len = u16::read(read)?;
        let extras_len = u16::read(read)?;

        let name = read_name(read, usize::from(name_len))?;
        let extras = u8::read_vec(read, usize::from(extras_len))?;

        Ok(LocalFile {
            version_needed, flags, compression, mod_time, mod_date,
            crc32, compressed_size, uncompressed_size, name, extras,
        })
    }

    /// Write the signature, record body, name and extras.
    pub fn write(&self, write: &mut impl Write) -> UnitResult {
        SIG_LOCAL_FILE.write(write)?;
        self.version_needed.write(write)?;
        self.flags.write(write)?;
        self.compression.write(write)?;
        self.mod_time.write(write)?;
        self.mod_date.write(write)?;
        self.crc32.write(write)?;
        self.compressed_size.write(write)?;
        self.uncompressed_size.write(write)?;
        (self.name.len() as u16).write(write)?;
        (self.extras.len() as u16).write(write)?;
        u8::write_slice(write, &self.name)?;
        u8::write_slice(write, &self.extras)?;
        Ok(())
    }

    /// Total wire size of this record including the signature.
    pub fn wire_size(&self) -> u64 {
        30 + self.name.len() as u64 + self.extras.len() as u64
    }

    /// Combined DOS date and time.
    pub fn date_time(&self) -> u32 {
        (u32::from(self.mod_date) << 16) | u32::from(self.mod_time)
    }

    /// Whether any field defers to the zip64 extra.
    pub fn is_zip64(&self) -> bool {
        self.compressed_size == ZIP64_LONG || self.uncompressed_size == ZIP64_LONG
    }
}


/// One entry of the central directory.
#[derive(Debug, Clone, Default)]
pub struct CentralFile {
    pub made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub start_disk: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub local_header_offset: u32,
    pub name: Vec<u8>,
    pub extras: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralFile {

    pub fn read(read: &mut impl Read) -> Result<Self> {
        let made_by = u16::read(read)?;
        let version_needed = u16::read(read)?;
        let flags = u16::read(read)?;
        let compression = u16::read(read)?;
        let mod_time = u16::read(read)?;
        let mod_date = u16::read(read)?;
        let crc32 = u32::read(read)?;
        let compressed_size = u32::read(read)?;
        let uncompressed_size = u32::read(read)?;
        let name_len = u16::read(read)?;
        let extras_len = u16::read(read)?;
        let comment_len = u16::read(read)?;
        let start_disk = u16::read(read)?;
        let internal_attributes = u16::read(read)?;
        let external_attributes = u32::read(read)?;
        let local_header_offset = u32::read(read)?;

        let name = read_name(read, usize::from(name_len))?;
        let extras = u8::read_vec(read, usize::from(extras_len))?;
        let comment = u8::read_vec(read, usize::from(comment_len))?;

        Ok(CentralFile {
            made_by, version_needed, flags, compression, mod_time, mod_date,
            crc32, compressed_size, uncompressed_size, start_disk,
            internal_attributes, external_attributes, local_header_offset,
            name, extras, comment,
        })
    }

    pub fn write(&self, write: &mut impl Write) -> UnitResult {
        SIG_CENTRAL_FILE.write(write)?;
        self.made_by.write(write)?;
        self.version_needed.write(write)?;
        self.flags.write(write)?;
        self.compression.write(write)?;
        self.mod_time.write(write)?;
        self.mod_date.write(write)?;
        self.crc32.write(write)?;
        self.compressed_size.write(write)?;
        self.uncompressed_size.write(write)?;
        (self.name.len() as u16).write(write)?;
        (self.extras.len() as u16).write(write)?;
        (self.comment.len() as u16).write(write)?;
        self.start_disk.write(write)?;
        self.internal_attributes.write(write)?;
        self.external_attributes.write(write)?;
        self.local_header_offset.write(write)?;
        u8::write_slice(write, &self.name)?;
        u8::write_slice(write, &self.extras)?;
        u8::write_slice(write, &self.comment)?;
        Ok(())
    }

    /// Total wire size of this record including the signature.
    pub fn wire_size(&self) -> u64 {
        46 + self.name.len() as u64 + self.extras.len() as u64 + self.comment.len() as u64
    }

    /// Whether the entry names a directory: an explicit trailing slash, or
    /// the MS-DOS/NTFS directory or volume attribute bits.
    pub fn is_directory(&self) -> bool {
        if self.name.last() == Some(&b'/') { return true; }

        let host = self.made_by >> 8;
        let dos_like = host == 0 || host == 10 || host == 11 || host == 14;
        dos_like && (self.external_attributes & (EXTERNAL_DIRECTORY | EXTERNAL_VOLUME)) != 0
    }

    pub fn is_zip64(&self) -> bool {
        self.compressed_size == ZIP64_LONG
            || self.uncompressed_size == ZIP64_LONG
            || self.local_header_offset == ZIP64_LONG
            || self.start_disk == ZIP64_SHORT
    }
}


/// The record closing every archive.
#[derive(Debug, Clone, Default)]
pub struct EndCdir {
    pub disk_number: u16,
    pub cdir_start_disk: u16,
    pub entries_this_disk: u16,
    pub entries_total: u16,
    pub cdir_size: u32,
    pub cdir_offset: u32,
    pub comment: Vec<u8>,
}

impl EndCdir {

    pub fn read(read: &mut impl Read) -> Result<Self> {
        let disk_number = u16::read(read)?;
        let cdir_start_disk = u16::read(read)?;
        let entries_this_disk = u16::read(read)?;
        let entries_total = u16::read(read)?;
        let cdir_size = u32::read(read)?;
        let cdir_offset = u32::read(read)?;
        let comment_len = u16::read(read)?;
        let comment = u8::read_vec(read, usize::from(comment_len))?;

        Ok(EndCdir {
            disk_number, cdir_start_disk, entries_this_disk, entries_total,
            cdir_size, cdir_offset, comment,
        })
    }

    pub fn write(&self, write: &mut impl Write) -> UnitResult {
        SIG_END_CDIR.write(write)?;
        self.disk_number.write(write)?;
        self.cdir_start_disk.write(write)?;
        self.entries_this_disk.write(write)?;
        self.entries_total.write(write)?;
        self.cdir_size.write(write)?;
        self.cdir_offset.write(write)?;
        (self.comment.len() as u16).write(write)?;
        u8::write_slice(write, &self.comment)?;
        Ok(())
    }

    /// Spanned archives are not supported.
    pub fn validate_single_disk(&self) -> UnitResult {
        if self.disk_number != 0 && self.disk_number != ZIP64_SHORT {
            return Err(Error::unsupported("spanned archive"));
        }

        Ok(())
    }
}


/// The zip64 closing record, preceding the locator and the end record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zip64EndCdir {
    pub record_size: u64,
    pub made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub cdir_start_disk: u32,
    pub entries_this_disk: u64,
    pub entries_total: u64,
    pub cdir_size: u64,
    pub cdir_offset: u64,
}

impl Zip64EndCdir {

    /// Read the record. Real archives exist whose declared record size is
    /// shorter than the fixed layout; accept them as long as the fields
    /// we read fit.
    pub fn read(read: &mut impl Read) -> Result<Self> {
        let record_size = u64::read(read)?;
        let made_by = u16::read(read)?;
        let version_needed = u16::read(read)?;
        let disk_number = u32::read(read)?;
        let cdir_start_disk = u32::read(read)?;
        let entries_this_disk = u64::read(read)?;
        let entries_total = u64::read(read)?;
        let cdir_size = u64::read(read)?;
        let cdir_offset = u64::read(read)?;

        Ok(Zip64EndCdir {
            record_size, made_by, version_needed, disk_number, cdir_start_disk,
            entries_this_disk, entries_total, cdir_size, cdir_offset,
        })
    }

    pub fn write(&self, write: &mut impl Write) -> UnitResult {
        SIG_ZIP64_END_CDIR.write(write)?;

        // record size counts everything after this field; no extensible
        // data follows in our archives
        44_u64.write(write)?;

        self.made_by.write(write)?;
        self.version_needed.write(write)?;
        self.disk_number.write(write)?;
        self.cdir_start_disk.write(write)?;
        self.entries_this_disk.write(write)?;
        self.entries_total.write(write)?;
        self.cdir_size.write(write)?;
        self.cdir_offset.write(write)?;
        Ok(())
    }
}


/// Points backward from the end record to the zip64 end record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zip64Locator {
    pub cdir_start_disk: u32,
    pub end_cdir_offset: u64,
    pub total_disks: u32,
}

impl Zip64Locator {

    pub fn read(read: &mut impl Read) -> Result<Self> {
        Ok(Zip64Locator {
            cdir_start_disk: u32::read(read)?,
            end_cdir_offset: u64::read(read)?,
            total_disks: u32::read(read)?,
        })
    }

    pub fn write(&self, write: &mut impl Write) -> UnitResult {
        SIG_ZIP64_LOCATOR.write(write)?;
        self.cdir_start_disk.write(write)?;
        self.end_cdir_offset.write(write)?;
        self.total_disks.write(write)?;
        Ok(())
    }
}


/// The zip64 extended information extra field, with each value present
/// only when the corresponding header field holds its sentinel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zip64Extra {
    pub uncompressed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub local_header_offset: Option<u64>,
    pub start_disk: Option<u32>,
}

impl Zip64Extra {

    /// Find and decode the zip64 extra inside an extras block. The
    /// `need_*` flags say which header fields held sentinels; only those
    /// values are present on the wire, in this fixed order.
    pub fn find(
        extras: &[u8],
        need_uncompressed: bool, need_compressed: bool,
        need_offset: bool, need_disk: bool,
    ) -> Result<Option<Self>> {
        let mut remaining = extras;

        while remaining.len() >= 4 {
            let id = u16::from_le_bytes([remaining[0], remaining[1]]);
            let size = usize::from(u16::from_le_bytes([remaining[2], remaining[3]]));
            remaining = &remaining[4 ..];

            if remaining.len() < size {
                return Err(Error::corrupt("extra field overruns the extras block"));
            }

            if id != ZIP64_EXTRA_ID {
                remaining = &remaining[size ..];
                continue;
            }

            let mut field = &remaining[.. size];
            let mut take_u64 = || -> Result<u64> {
                if field.len() < 8 { return Err(Error::corrupt("zip64 extra too short")); }
                let value = u64::from_le_bytes([
                    field[0], field[1], field[2], field[3],
                    field[4], field[5], field[6], field[7],
                ]);
                field = &field[8 ..];
                Ok(value)
            };

            let uncompressed_size = if need_uncompressed { Some(take_u64()?) } else { None };
            let compressed_size = if need_compressed { Some(take_u64()?) } else { None };
            let local_header_offset = if need_offset { Some(take_u64()?) } else { None };

            let start_disk = if need_disk {
                if field.len() < 4 { return Err(Error::corrupt("zip64 extra too short")); }
                Some(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
            } else { None };

            return Ok(Some(Zip64Extra {
                uncompressed_size, compressed_size, local_header_offset, start_disk,
            }));
        }

        Ok(None)
    }

    /// Encode as an extras block fragment.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(28);

        for value in [self.uncompressed_size, self.compressed_size, self.local_header_offset] {
            if let Some(value) = value { body.extend_from_slice(&value.to_le_bytes()); }
        }

        if let Some(disk) = self.start_disk {
            body.extend_from_slice(&disk.to_le_bytes());
        }

        let mut bytes = Vec::with_capacity(4 + body.len());
        bytes.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&body);
        bytes
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_file_roundtrip(){
        let header = LocalFile {
            version_needed: VERSION_DEFLATE,
            flags: FLAG_USE_DATA_DESCRIPTOR,
            compression: METHOD_DEFLATE,
            mod_time: 0x7433,
            mod_date: 0x38cd,
            crc32: 0x85114a0d,
            compressed_size: 13,
            uncompressed_size: 11,
            name: b"hello.txt".to_vec(),
            extras: Vec::new(),
        };

        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, header.wire_size());
        assert_eq!(&bytes[..4], b"PK\x03\x04");

        let mut read = &bytes[4..];
        let reread = LocalFile::read(&mut read).unwrap();
        assert_eq!(reread.name, header.name);
        assert_eq!(reread.crc32, header.crc32);
        assert_eq!(reread.date_time(), header.date_time());
        assert!(!reread.is_zip64());
    }

    #[test]
    fn end_cdir_roundtrip(){
        let end = EndCdir {
            entries_this_disk: 3,
            entries_total: 3,
            cdir_size: 150,
            cdir_offset: 4096,
            ..Default::default()
        };

        let mut bytes = Vec::new();
        end.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 22);
        assert_eq!(&bytes[..4], b"PK\x05\x06");

        let mut read = &bytes[4..];
        let reread = EndCdir::read(&mut read).unwrap();
        assert_eq!(reread.entries_total, 3);
        assert_eq!(reread.cdir_offset, 4096);
        reread.validate_single_disk().unwrap();
    }

    #[test]
    fn zip64_extra_selective_presence(){
        // only the offset deferred to the extra
        let extra = Zip64Extra {
            local_header_offset: Some(0x1_0000_0000),
            ..Default::default()
        };

        let mut extras = vec![0x09, 0x00, 0x02, 0x00, 0xaa, 0xbb]; // some foreign extra first
        extras.extend(extra.encode());

        let found = Zip64Extra::find(&extras, false, false, true, false).unwrap().unwrap();
        assert_eq!(found.local_header_offset, Some(0x1_0000_0000));
        assert_eq!(found.uncompressed_size, None);
    }

    #[test]
    fn zip64_end_cdir_accepts_short_record_size(){
        let record = Zip64EndCdir {
            record_size: 44,
            entries_total: 70_000,
            cdir_size: 3_500_000,
            cdir_offset: 70_000,
            ..Default::default()
        };

        let mut bytes = Vec::new();
        record.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 56);

        // shrink the declared size below the minimum, as seen in the wild
        bytes[4 .. 12].copy_from_slice(&2_u64.to_le_bytes());

        let mut read = &bytes[4..];
        let reread = Zip64EndCdir::read(&mut read).unwrap();
        assert_eq!(reread.entries_total, 70_000);
    }

    #[test]
    fn data_descriptor_variants(){
        let descriptor = DataDescriptor { crc32: 0x85114a0d, compressed: 13, uncompressed: 11 };

        let mut plain = Vec::new();
        descriptor.write(&mut plain, false, false).unwrap();
        assert_eq!(plain.len(), DATA_DESCRIPTOR_SIZE);

        let mut signed = Vec::new();
        descriptor.write(&mut signed, true, true).unwrap();
        assert_eq!(signed.len(), 4 + ZIP64_DATA_DESCRIPTOR_SIZE);
        assert_eq!(&signed[..4], b"PK\x07\x08");

        let mut read = plain.as_slice();
        assert_eq!(DataDescriptor::read(&mut read, false).unwrap(), descriptor);
    }
}
