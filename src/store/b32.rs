
//! Compression for blocks of 32-bit samples.
//!
//! Float and deep integer data rarely repeats byte-for-byte, but its bytes
//! correlate strongly within each lane of the 4-byte groups. Regrouping the
//! data into byte planes and delta-coding before deflate makes such blocks
//! compressible at all.

use crate::error::{Error, Result};
use crate::flate;


/// Regroup 4-byte samples into byte planes.
fn separate_sample_bytes(data: &[u8]) -> Vec<u8> {
    let mut separated = Vec::with_capacity(data.len());

    for lane in 0..4 {
        separated.extend(data.iter().skip(lane).step_by(4));
    }

    separated
}

/// Inverse of `separate_sample_bytes`.
fn interleave_sample_bytes(separated: &[u8]) -> Vec<u8> {
    let lane_length = separated.len() / 4;
    let mut data = vec![0_u8; separated.len()];

    for lane in 0..4 {
        for (index, &byte) in separated[lane * lane_length .. (lane+1) * lane_length].iter().enumerate() {
            data[index * 4 + lane] = byte;
        }
    }

    data
}

/// In-place forward delta over the whole buffer.
fn samples_to_differences(buffer: &mut [u8]) {
    let mut previous = 0_u8;

    for byte in buffer {
        let difference = byte.wrapping_sub(previous);
        previous = *byte;
        *byte = difference;
    }
}

/// In-place inverse delta.
fn differences_to_samples(buffer: &mut [u8]) {
    let mut previous = 0_u8;

    for byte in buffer {
        previous = previous.wrapping_add(*byte);
        *byte = previous;
    }
}


/// Compress a block of 32-bit samples. The length must be a multiple of 4.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % 4 != 0 {
        return Err(Error::Internal("32-bit block size not a multiple of 4"));
    }

    let mut separated = separate_sample_bytes(data);
    samples_to_differences(&mut separated);
    Ok(flate::compress_zlib(&separated))
}

/// Decompress a block of 32-bit samples, knowing the decompressed length.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut separated = flate::decompress_zlib(data, expected_len)?;

    if separated.len() != expected_len || expected_len % 4 != 0 {
        return Err(Error::corrupt("32-bit block data malformed"));
    }

    differences_to_samples(&mut separated);
    Ok(interleave_sample_bytes(&separated))
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_floats(){
        let samples: Vec<f32> = (0..2048).map(|index| index as f32 / 2048.0).collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|sample| sample.to_le_bytes()).collect();

        let compressed = compress(&bytes).unwrap();
        assert!(compressed.len() < bytes.len());

        let decompressed = decompress(&compressed, bytes.len()).unwrap();
        assert_eq!(decompressed, bytes);
    }

    #[test]
    fn roundtrip_empty(){
        let compressed = compress(&[]).unwrap();
        assert_eq!(decompress(&compressed, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn odd_length_rejected(){
        assert!(compress(&[1, 2, 3]).is_err());
    }
}
