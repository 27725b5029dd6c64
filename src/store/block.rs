
//! One tile of one plane: its geometry, storage state, and the in-place
//! transforms that operate on a single block's data.

use std::sync::Arc;

use crate::error::{Error, Result};
use super::compress::BlockCompression;
use super::spill::SpillAddress;
use super::BlistId;


bitflags::bitflags! {

    /// Per-block state bits. Kept separate from the storage and compression
    /// enums so a flag can never collide with a storage value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {

        /// All rows of this block have been written.
        const WRITE_COMPLETE = 0x01;

        /// One thread is currently materializing this block's data;
        /// everyone else waits on the load condition.
        const IS_LOADING = 0x02;

        /// The block was trimmed and will never be read again.
        const NO_LONGER_NEEDED = 0x04;

        /// The uniform scan already ran; its verdict is memoized.
        const CHECKED_FOR_UNIFORM = 0x08;

        /// The uniform scan found a single color.
        const IS_UNIFORM = 0x10;
    }
}

/// Where a block's pixels currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStorage {

    /// Nothing stored yet, or trimmed away.
    None,

    /// Data (possibly compressed) is in memory.
    Memory,

    /// Data was spilled to a scratch file.
    Disk,

    /// The block is a single color and was never materialized.
    UniformBlock,

    /// The block turned out to be a single color during purging;
    /// a row's worth of data is expanded on demand.
    UniformVariant,
}


/// State of one (plane, bx, by) tile.
#[derive(Debug)]
pub(crate) struct Block {
    pub storage: BlockStorage,
    pub compression: BlockCompression,
    pub flags: BlockFlags,

    /// Number of readers currently holding this block's data.
    pub refcount: u8,

    /// Where the block went when spilled.
    pub spill: Option<SpillAddress>,

    /// Uncompressed pixel data, exactly `abytes` long when present.
    /// Readers hold clones of this arc; a block's slab can only move
    /// elsewhere once no reader clone remains.
    pub data: Option<Arc<Vec<u8>>>,

    /// Compressed form, when the purger kept one.
    pub cdata: Option<Vec<u8>>,

    /// Pixel extent of this block. Edge blocks may be shorter.
    pub xsize: usize,
    pub ysize: usize,

    /// Bytes from one row to the next.
    pub xbytes: usize,

    /// Bytes in one column of the pre-transpose layout.
    pub ybytes: usize,

    /// Bytes stored so far by row writes.
    pub sbytes: usize,

    /// Bytes a complete write must deliver. Differs from `tbytes`
    /// for transposed stores.
    pub rbytes: usize,

    /// Total data bytes in this block.
    pub tbytes: usize,

    /// Allocated bytes. Normally `tbytes`, but edge-row blocks reuse
    /// full-size slabs.
    pub abytes: usize,

    /// The single color of a uniform block.
    pub uniform_color: u16,

    /// Back-pointer into the slab pool, if a pooled slab backs this block.
    pub blist: Option<BlistId>,
}

/// Geometry shared by all blocks of a store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {

    /// Width of the image in pixels.
    pub width: usize,

    /// Height of the image in pixels.
    pub height: usize,

    /// log2 of bits per sample.
    pub bpps: u32,

    /// Bits per sample.
    pub bpp: usize,

    /// Bytes per row of a full block. Power of two.
    pub block_width: usize,

    /// Rows per full block. Power of two.
    pub block_height: usize,

    pub xblock: usize,
    pub yblock: usize,

    /// Whether rows arrive transposed and must be swapped on completion.
    pub xyswap: bool,
}

impl Geometry {

    /// Pixels across a full block.
    pub fn pixels_per_block(&self) -> usize {
        (self.block_width << 3) >> self.bpps
    }

    /// Bytes of one full image row.
    pub fn row_bytes(&self) -> usize {
        ((self.width << self.bpps) + 7) >> 3
    }

    /// The default slab size for this store, covering one full block,
    /// or the whole (possibly short) image extent when a dimension
    /// only spans a single block.
    pub fn default_block_bytes(&self) -> usize {
        let mut xbytes = self.row_bytes() & (self.block_width - 1);
        if xbytes == 0 || self.xblock > 1 { xbytes = self.block_width; }

        let mut ysize = self.height & (self.block_height - 1);
        if ysize == 0 || self.yblock > 1 { ysize = self.block_height; }

        if self.xyswap && self.bpps < 3 { ysize = (ysize + 7) & !7; }

        xbytes * ysize
    }
}

impl Block {

    /// A block with no storage at all.
    pub fn empty() -> Self {
        Block {
            storage: BlockStorage::None,
            compression: BlockCompression::None,
            flags: BlockFlags::empty(),
            refcount: 0,
            spill: None,
            data: None,
            cdata: None,
            xsize: 0, ysize: 0,
            xbytes: 0, ybytes: 0,
            sbytes: 0, rbytes: 0, tbytes: 0, abytes: 0,
            uniform_color: 0,
            blist: None,
        }
    }

    /// Compute the dimensions of the block at (bx, by).
    /// Blocks on the right and bottom edges may be shorter.
    pub fn setup(geometry: &Geometry, bx: usize, by: usize) -> Self {
        let mut block = Block::empty();

        let mut xbytes = geometry.block_width;
        let mut xsize = geometry.pixels_per_block();

        if bx == geometry.xblock - 1 {
            let edge_bytes = geometry.row_bytes() & (geometry.block_width - 1);
            let edge_pixels = geometry.width & (xsize - 1);

            if edge_bytes != 0 {
                xbytes = edge_bytes;
                xsize = edge_pixels;
            }
        }

        let mut ysize = geometry.block_height;
        if by == geometry.yblock - 1 {
            let edge_rows = geometry.height & (geometry.block_height - 1);
            if edge_rows != 0 { ysize = edge_rows; }
        }

        block.xsize = xsize;
        block.ysize = ysize;
        block.xbytes = xbytes;
        block.ybytes = ((ysize << geometry.bpps) + 7) >> 3;

        // sub-byte transposed blocks round the minor dimension up to
        // a whole number of bytes worth of rows
        block.tbytes = if geometry.xyswap && geometry.bpps < 3 {
            xbytes * ((ysize + 7) & !7)
        } else {
            xbytes * ysize
        };

        block.rbytes = if geometry.xyswap { block.ybytes * xsize } else { block.tbytes };

        block
    }

    /// Whether all rows were written.
    pub fn is_complete(&self) -> bool {
        self.flags.contains(BlockFlags::WRITE_COMPLETE)
    }

    /// Whether the block's slab may be taken away, because the pixels
    /// are recoverable from elsewhere or not needed at all.
    pub fn is_moveable(&self) -> bool {
        self.storage == BlockStorage::Disk
            || self.storage == BlockStorage::UniformVariant
            || self.compression.is_encoded()
            || self.flags.contains(BlockFlags::NO_LONGER_NEEDED)
    }

    /// Whether the slab may be donated to another block right now.
    pub fn is_usable(&self) -> bool {
        self.refcount == 0 && self.is_complete() && self.is_moveable()
    }

    /// Append one row's worth of bytes. 32-bit samples arrive in the
    /// opposite byte order and are swapped in place.
    pub fn append_row(&mut self, buffer: &[u8], bpp: usize) -> Result<()> {
        let data = self.data.as_mut().ok_or(Error::Internal("write to block without data"))?;
        let data = Arc::get_mut(data).ok_or(Error::Internal("write to block with readers"))?;

        let start = self.sbytes;
        let end = start + buffer.len();
        if end > self.rbytes {
            return Err(Error::invalid("wrote too many bytes into block"));
        }

        data[start .. end].copy_from_slice(buffer);

        if bpp == 32 {
            debug_assert_eq!(buffer.len() % 4, 0);
            for group in data[start .. end].chunks_exact_mut(4) {
                group.swap(0, 3);
                group.swap(1, 2);
            }
        }

        self.sbytes = end;
        Ok(())
    }

    /// Scan for a single color, memoizing the verdict. On success the
    /// storage becomes [`BlockStorage::UniformVariant`] and the data may
    /// be dropped. 16-bpp planes scan samples, everything else scans
    /// bytes over the whole stored extent, partial trailing byte included.
    pub fn uniform_check(&mut self, bpp: usize, free_data: bool) -> bool {
        if self.flags.contains(BlockFlags::CHECKED_FOR_UNIFORM) {
            return self.storage == BlockStorage::UniformVariant;
        }

        self.flags.insert(BlockFlags::CHECKED_FOR_UNIFORM);

        let data = match &self.data {
            Some(data) => data,
            None => return false, // compressed or trimmed
        };

        let uniform_color;
        if bpp == 16 {
            debug_assert_eq!(self.tbytes & 1, 0, "tbytes must be even for 16-bit data");
            let first = u16::from_le_bytes([data[0], data[1]]);

            if data[.. self.tbytes].chunks_exact(2)
                .any(|pair| u16::from_le_bytes([pair[0], pair[1]]) != first)
            { return false; }

            uniform_color = first;
        }
        else {
            let first = data[0];
            if data[1 .. self.tbytes].iter().any(|&byte| byte != first) { return false; }
            uniform_color = u16::from(first);
        }

        self.storage = BlockStorage::UniformVariant;
        self.uniform_color = uniform_color;
        self.flags.insert(BlockFlags::IS_UNIFORM);

        if free_data {
            debug_assert!(self.blist.is_none(), "did not expect a blist when freeing data");
            self.data = None;
        }

        true
    }

    /// Expand the uniform color into a single row of the given slab.
    pub fn expand_uniform(&self, slab: &mut [u8], bpp: usize) {
        if bpp == 16 {
            let bytes = self.uniform_color.to_le_bytes();
            for pair in slab[.. self.xbytes].chunks_exact_mut(2) {
                pair.copy_from_slice(&bytes);
            }
        }
        else {
            let byte = self.uniform_color as u8;
            for target in &mut slab[.. self.xbytes] { *target = byte; }
        }
    }

    /// Reset write state so a recycled store can refill this block.
    pub fn reopen(&mut self) {
        if self.storage == BlockStorage::UniformVariant {
            self.storage = BlockStorage::Memory;
        }

        self.flags.remove(BlockFlags::WRITE_COMPLETE | BlockFlags::CHECKED_FOR_UNIFORM);
        self.sbytes = 0;
    }

    /// One character per block for the plane report.
    pub fn storage_char(&self) -> char {
        match self.storage {
            BlockStorage::None => '0',
            BlockStorage::Memory => match self.compression {
                BlockCompression::None => 'm',
                BlockCompression::TooBig => '+',
                BlockCompression::Failed => '!',
                BlockCompression::Lzw => 'l',
                BlockCompression::Flate => 'f',
                BlockCompression::B32 => '3',
                BlockCompression::Copy => 'y',
            },
            BlockStorage::Disk => 'd',
            BlockStorage::UniformBlock => 'u',
            BlockStorage::UniformVariant => 'v',
        }
    }
}


/// The extents a transpose needs to know about.
#[derive(Clone, Copy)]
struct Dims {
    xsize: usize,
    ysize: usize,
    xbytes: usize,
    ybytes: usize,
}

// The eight scatter tables of the 1-bpp transpose. Table `bit` spreads
// the four bits of a source nibble into bit `bit` of each of four
// destination bytes held in one 32-bit word.
const fn rtab(bit: u32) -> [u32; 16] {
    let mut table = [0_u32; 16];
    let mut value = 0;

    while value < 16 {
        let mut word = 0_u32;
        let mut source_bit = 0;

        while source_bit < 4 {
            if value & (1 << (3 - source_bit)) != 0 {
                word |= 1 << (bit + (3 - source_bit as u32) * 8);
            }
            source_bit += 1;
        }

        table[value] = word;
        value += 1;
    }

    table
}

const RTABS: [[u32; 16]; 8] = [
    rtab(0), rtab(1), rtab(2), rtab(3), rtab(4), rtab(5), rtab(6), rtab(7),
];

/// Transpose a 1-bpp block from `source` (column-major, stride `ybytes`)
/// into `target` (row-major, stride `xbytes`). Works on one 8x8 bit tile
/// per step, two 32-bit words per tile.
fn transpose_1(dims: Dims, source: &[u8], target: &mut [u8]) {
    let mut x = 0;
    while x < dims.xsize {
        let mut y = 0;
        while y < dims.ysize {
            let mut data0 = 0_u32;
            let mut data1 = 0_u32;

            let mut source_index = (y >> 3) + x * dims.ybytes;
            for table in RTABS.iter().rev() {
                let value = source[source_index];
                data0 |= table[usize::from(value >> 4)];
                data1 |= table[usize::from(value & 15)];
                source_index += dims.ybytes;
            }

            let mut target_index = (x >> 3) + y * dims.xbytes;
            for shift in [24, 16, 8, 0] {
                target[target_index] = (data0 >> shift) as u8;
                target_index += dims.xbytes;
            }
            for shift in [24, 16, 8, 0] {
                target[target_index] = (data1 >> shift) as u8;
                target_index += dims.xbytes;
            }

            y += 8;
        }
        x += 8;
    }
}

fn transpose_2(dims: Dims, source: &[u8], target: &mut [u8]) {
    let mut x = 0;
    while x < dims.xsize {
        let mut y = 0;
        while y < dims.ysize {
            let mut source_index = (y >> 2) + x * dims.ybytes;
            let mut sources = [0_u32; 4];
            for value in &mut sources {
                *value = u32::from(source[source_index]);
                source_index += dims.ybytes;
            }

            let mut target_index = (x >> 2) + y * dims.xbytes;
            for row in 0..4_i32 {
                let shift = |value: u32, lane: i32| -> u32 {
                    let offset = 2 * row - 2 * lane;
                    let shifted = if offset >= 0 { value << offset } else { value >> -offset };
                    shifted & (0xc0 >> (2 * lane))
                };

                target[target_index] = (
                    shift(sources[0], 0) | shift(sources[1], 1) |
                    shift(sources[2], 2) | shift(sources[3], 3)
                ) as u8;

                target_index += dims.xbytes;
            }

            y += 4;
        }
        x += 4;
    }
}

fn transpose_4(dims: Dims, source: &[u8], target: &mut [u8]) {
    let mut x = 0;
    while x < dims.xsize {
        let mut y = 0;
        while y < dims.ysize {
            let source_index = (y >> 1) + x * dims.ybytes;
            let source0 = u32::from(source[source_index]);
            let source1 = u32::from(source[source_index + dims.ybytes]);

            let target_index = (x >> 1) + y * dims.xbytes;
            target[target_index] = ((source0 & 0xf0) | (source1 >> 4)) as u8;
            target[target_index + dims.xbytes] = (((source0 << 4) & 0xf0) | (source1 & 0x0f)) as u8;

            y += 2;
        }
        x += 2;
    }
}

fn transpose_8(dims: Dims, source: &[u8], target: &mut [u8]) {
    for x in 0 .. dims.xsize {
        let mut source_index = x * dims.ybytes;
        let mut target_index = x;

        for _ in 0 .. dims.ysize {
            target[target_index] = source[source_index];
            source_index += 1;
            target_index += dims.xbytes;
        }
    }
}

fn transpose_16(dims: Dims, source: &[u8], target: &mut [u8]) {
    for x in 0 .. dims.xsize {
        let mut source_index = x * dims.ybytes;
        let mut target_index = x * 2;

        for _ in 0 .. dims.ysize {
            target[target_index] = source[source_index];
            target[target_index + 1] = source[source_index + 1];
            source_index += 2;
            target_index += dims.xbytes;
        }
    }
}

/// Transpose a completed block from its transposed write layout into the
/// row-major read layout, using the store's swap buffer as scratch space.
pub(crate) fn transpose(block: &mut Block, swap: &mut [u8], bpp: usize) -> Result<()> {
    block.sbytes = block.tbytes;
    block.rbytes = block.tbytes;

    let arc = block.data.take().ok_or(Error::Internal("transpose without data"))?;
    let mut data = Arc::try_unwrap(arc).map_err(|_| Error::Internal("transpose with readers"))?;

    swap[.. block.tbytes].copy_from_slice(&data[.. block.tbytes]);

    let dims = Dims {
        xsize: block.xsize, ysize: block.ysize,
        xbytes: block.xbytes, ybytes: block.ybytes,
    };

    match bpp {
        1 => transpose_1(dims, swap, &mut data),
        2 => transpose_2(dims, swap, &mut data),
        4 => transpose_4(dims, swap, &mut data),
        8 => transpose_8(dims, swap, &mut data),
        16 => transpose_16(dims, swap, &mut data),
        _ => {
            block.data = Some(Arc::new(data));
            return Err(Error::Internal("no transpose for this depth"));
        },
    }

    block.data = Some(Arc::new(data));
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;

    fn test_geometry(bpp: usize, xyswap: bool) -> Geometry {
        let bpps = (bpp as u32).trailing_zeros();
        Geometry {
            width: 100, height: 50, bpp, bpps,
            block_width: 64, block_height: 32,
            xblock: ((((100 << bpps) + 7) >> 3) + 63) / 64,
            yblock: 2,
            xyswap,
        }
    }

    #[test]
    fn edge_blocks_are_shorter(){
        let geometry = test_geometry(8, false);
        assert_eq!(geometry.xblock, 2);

        let full = Block::setup(&geometry, 0, 0);
        assert_eq!((full.xsize, full.ysize, full.xbytes), (64, 32, 64));
        assert_eq!(full.tbytes, 64 * 32);

        let right = Block::setup(&geometry, 1, 0);
        assert_eq!((right.xsize, right.xbytes), (36, 36));

        let corner = Block::setup(&geometry, 1, 1);
        assert_eq!((corner.xsize, corner.ysize), (36, 18));
        assert_eq!(corner.tbytes, 36 * 18);
    }

    #[test]
    fn swapped_sub_byte_rounds_up(){
        let geometry = test_geometry(1, true);
        let corner = Block::setup(&geometry, geometry.xblock - 1, 1);

        // 18 rows round up to 24, a multiple of 8
        assert_eq!(corner.ysize, 18);
        assert_eq!(corner.tbytes, corner.xbytes * 24);
        assert_eq!(corner.rbytes, corner.ybytes * corner.xsize);
    }

    #[test]
    fn uniform_detection_and_memoization(){
        let geometry = test_geometry(8, false);
        let mut block = Block::setup(&geometry, 0, 0);
        block.data = Some(Arc::new(vec![0x5a_u8; block.tbytes]));
        block.storage = BlockStorage::Memory;

        assert!(block.uniform_check(8, false));
        assert_eq!(block.storage, BlockStorage::UniformVariant);
        assert_eq!(block.uniform_color, 0x5a);

        // memoized: result stays stable even though data is still there
        assert!(block.uniform_check(8, false));
        assert_eq!(block.storage, BlockStorage::UniformVariant);
    }

    #[test]
    fn non_uniform_detection(){
        let geometry = test_geometry(8, false);
        let mut block = Block::setup(&geometry, 0, 0);
        let mut bytes = vec![7_u8; block.tbytes];
        *bytes.last_mut().unwrap() = 8;

        block.data = Some(Arc::new(bytes));
        block.storage = BlockStorage::Memory;

        assert!(!block.uniform_check(8, false));
        assert_eq!(block.storage, BlockStorage::Memory);
        assert!(!block.uniform_check(8, false)); // memoized verdict
    }

    fn transpose_roundtrip(bpp: usize) {
        let bpps = (bpp as u32).trailing_zeros();
        let geometry = Geometry {
            width: 40, height: 24, bpp, bpps,
            block_width: 64, block_height: 32,
            xblock: 1, yblock: 1,
            xyswap: true,
        };

        let mut block = Block::setup(&geometry, 0, 0);
        block.abytes = block.tbytes;

        // fill the transposed (column-major) layout with a pattern
        let mut source = vec![0_u8; block.abytes];
        for (index, byte) in source[.. block.rbytes].iter_mut().enumerate() {
            *byte = (index * 37 + 11) as u8;
        }

        block.data = Some(Arc::new(source.clone()));
        block.sbytes = block.rbytes;

        let mut swap = vec![0_u8; block.abytes];
        transpose(&mut block, &mut swap, bpp).unwrap();

        // verify selected pixels moved to their transposed position
        let transposed = block.data.as_ref().unwrap();
        let sample = |data: &[u8], byte_index: usize, bit: usize, width: usize| -> u32 {
            match width {
                1 => u32::from(data[byte_index] >> (7 - bit)) & 1,
                2 => u32::from(data[byte_index] >> (6 - 2 * bit)) & 3,
                4 => u32::from(data[byte_index] >> (4 - 4 * bit)) & 15,
                _ => unreachable!(),
            }
        };

        for x in 0 .. block.xsize {
            for y in 0 .. block.ysize {
                let (original, swapped) = match bpp {
                    1 => (
                        sample(&source, x * block.ybytes + (y >> 3), y & 7, 1),
                        sample(transposed, y * block.xbytes + (x >> 3), x & 7, 1),
                    ),
                    2 => (
                        sample(&source, x * block.ybytes + (y >> 2), y & 3, 2),
                        sample(transposed, y * block.xbytes + (x >> 2), x & 3, 2),
                    ),
                    4 => (
                        sample(&source, x * block.ybytes + (y >> 1), y & 1, 4),
                        sample(transposed, y * block.xbytes + (x >> 1), x & 1, 4),
                    ),
                    8 => (
                        u32::from(source[x * block.ybytes + y]),
                        u32::from(transposed[y * block.xbytes + x]),
                    ),
                    16 => (
                        u32::from(source[x * block.ybytes + 2 * y]) | (u32::from(source[x * block.ybytes + 2 * y + 1]) << 8),
                        u32::from(transposed[y * block.xbytes + 2 * x]) | (u32::from(transposed[y * block.xbytes + 2 * x + 1]) << 8),
                    ),
                    _ => unreachable!(),
                };

                assert_eq!(original, swapped, "pixel ({}, {}) at {} bpp", x, y, bpp);
            }
        }
    }

    #[test]
    fn transpose_all_depths(){
        transpose_roundtrip(1);
        transpose_roundtrip(2);
        transpose_roundtrip(4);
        transpose_roundtrip(8);
        transpose_roundtrip(16);
    }
}
