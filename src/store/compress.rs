
//! Purge-time block compression.
//!
//! The method is chosen by plane depth: 1-bpp masks deflate well as-is,
//! 32-bit sample data goes through the byte-plane transform, and the
//! mid-range depths use LZW. Whatever the method, the result only counts
//! if it fits the size cap; otherwise the block is marked `TooBig` and the
//! purger falls back to a plain copy or a disk spill.

use crate::error::{Error, Result};
use crate::flate;
use super::{b32, lzw};


/// Blocks smaller than this are never worth a codec pass.
pub const MIN_COMPRESSION_SIZE: usize = 1024;

/// Compressed output must fit in this fraction of the uncompressed block.
/// Half, because a cache tier that barely shrinks data is pure overhead.
pub fn compression_cap(tbytes: usize) -> usize { tbytes / 2 }


/// How one block's data is held when not in plain memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCompression {

    /// Not compressed.
    None,

    /// Deflate, used for 1-bpp planes.
    Flate,

    /// LZW, used for 2- to 16-bpp planes.
    Lzw,

    /// Byte-plane transform + deflate, used for 32-bit samples.
    B32,

    /// A plain copy, kept only to free a pooled slab.
    Copy,

    /// Compression was attempted but did not fit the cap.
    TooBig,

    /// Compression produced data but memory for it could not be allocated.
    Failed,
}

impl BlockCompression {

    /// Whether block data actually exists in encoded form.
    pub fn is_encoded(self) -> bool {
        !matches!(self, BlockCompression::None | BlockCompression::TooBig | BlockCompression::Failed)
    }
}


/// Compress block data by depth. Returns `None` when the result
/// does not fit the cap.
pub fn compress_block(bpp: usize, data: &[u8], cap: usize) -> Option<(BlockCompression, Vec<u8>)> {
    let (method, compressed) = match bpp {
        1 => (BlockCompression::Flate, flate::compress_zlib(data)),
        32 => (BlockCompression::B32, b32::compress(data).ok()?),
        _ => (BlockCompression::Lzw, lzw::compress(data)),
    };

    if compressed.len() > cap { return None; }
    Some((method, compressed))
}

/// Decompress block data back into a buffer of the original size.
pub fn decompress_block(method: BlockCompression, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    match method {
        BlockCompression::Flate => flate::decompress_zlib(data, expected_len),
        BlockCompression::Lzw => lzw::decompress(data, expected_len),
        BlockCompression::B32 => b32::decompress(data, expected_len),
        BlockCompression::Copy => Ok(data.to_vec()),
        _ => Err(Error::Internal("block is not in an encoded form")),
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn depth_dispatch_roundtrips(){
        for &(bpp, period) in &[(1_usize, 2_usize), (8, 13), (16, 255), (32, 4)] {
            let data: Vec<u8> = (0..8192_u32).map(|index| (index as usize % period) as u8).collect();

            let (method, compressed) = compress_block(bpp, &data, compression_cap(data.len()))
                .expect("periodic data should compress");

            let restored = decompress_block(method, &compressed, data.len()).unwrap();
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn incompressible_hits_cap(){
        use rand::{Rng, SeedableRng};
        let mut random = rand::rngs::StdRng::seed_from_u64(3615);
        let noise: Vec<u8> = (0..4096).map(|_| random.random()).collect();

        assert!(compress_block(8, &noise, compression_cap(noise.len())).is_none());
    }
}
