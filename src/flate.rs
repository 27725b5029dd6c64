
//! Deflate plumbing shared by the block purger and the archive layer.
//!
//! Whole-buffer compression goes through `miniz_oxide`, whole-buffer
//! decompression through `zune_inflate` which is measurably faster on the
//! block reload path. Archive entries additionally need incremental raw
//! deflate streams, which wrap the `miniz_oxide` stream state machines.

use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};
use miniz_oxide::deflate::core::{create_comp_flags_from_zip_params, CompressorOxide};
use miniz_oxide::inflate::stream::InflateState;

use crate::error::{Error, Result};


/// The deflate effort used everywhere. Purged blocks and archive entries are
/// written once and read back rarely, so a mid-level setting wins overall.
pub const DEFAULT_LEVEL: u8 = 6;


/// Compress a whole buffer into a zlib stream.
pub fn compress_zlib(input: &[u8]) -> Vec<u8> {
    miniz_oxide::deflate::compress_to_vec_zlib(input, DEFAULT_LEVEL)
}

/// Decompress a whole zlib stream, knowing the decompressed length up front.
pub fn decompress_zlib(input: &[u8], expected_uncompressed_len: usize) -> Result<Vec<u8>> {
    let options = zune_inflate::DeflateOptions::default()
        .set_size_hint(expected_uncompressed_len);

    let mut decoder = zune_inflate::DeflateDecoder::new_with_options(input, options);

    decoder
        .decode_zlib()
        .map_err(|_| Error::corrupt("zlib-compressed data malformed"))
}


/// How far one incremental call got.
#[derive(Debug, Clone, Copy)]
pub struct StreamProgress {

    /// Input bytes consumed by this call.
    pub consumed: usize,

    /// Output bytes produced by this call.
    pub written: usize,

    /// Whether the stream has ended. For inflation this means the
    /// deflate stream signalled its final block; for deflation it means
    /// the `finish` call flushed everything.
    pub finished: bool,
}


/// Incremental raw-deflate decompressor for archive entries
/// (ZIP entry data carries no zlib header).
pub struct RawInflater {
    state: Box<InflateState>,
    finished: bool,
}

impl std::fmt::Debug for RawInflater {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("RawInflater").field("finished", &self.finished).finish()
    }
}

impl RawInflater {

    /// A fresh stream, positioned before the first deflate block.
    pub fn new() -> Self {
        Self { state: InflateState::new_boxed(DataFormat::Raw), finished: false }
    }

    /// Rewind the state machine for the next entry, avoiding reallocation.
    pub fn reset(&mut self) {
        self.state.reset(DataFormat::Raw);
        self.finished = false;
    }

    /// Whether the deflate stream has signalled its final block.
    pub fn is_finished(&self) -> bool { self.finished }

    /// Decompress as much as possible into `output`.
    /// Either consumes input, produces output, or reports the stream end;
    /// a call that can do none of these means the entry data is truncated
    /// or malformed, which the caller detects by seeing no progress.
    pub fn inflate(&mut self, input: &[u8], output: &mut [u8]) -> Result<StreamProgress> {
        if self.finished {
            return Ok(StreamProgress { consumed: 0, written: 0, finished: true });
        }

        let result = miniz_oxide::inflate::stream::inflate(
            &mut self.state, input, output, MZFlush::None
        );

        match result.status {
            Ok(MZStatus::StreamEnd) => self.finished = true,
            Ok(_) => {},

            // no progress possible with the buffers given; not fatal by itself
            Err(MZError::Buf) => {},

            Err(_) => return Err(Error::corrupt("deflate stream malformed")),
        }

        Ok(StreamProgress {
            consumed: result.bytes_consumed,
            written: result.bytes_written,
            finished: self.finished,
        })
    }
}


/// Incremental raw-deflate compressor for archive entries.
pub struct RawDeflater {
    state: Box<CompressorOxide>,
}

impl std::fmt::Debug for RawDeflater {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("RawDeflater").finish()
    }
}

impl RawDeflater {

    /// A fresh raw-deflate stream. Negative window bits select
    /// the headerless format that ZIP entries require.
    pub fn new() -> Self {
        let flags = create_comp_flags_from_zip_params(i32::from(DEFAULT_LEVEL), -15, 0);
        Self { state: Box::new(CompressorOxide::new(flags)) }
    }

    /// Rewind the state machine for the next entry.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Compress as much input as fits the output buffer.
    pub fn deflate(&mut self, input: &[u8], output: &mut [u8]) -> Result<StreamProgress> {
        self.run(input, output, MZFlush::None)
    }

    /// Flush the stream to its end. Call with empty input until `finished`.
    pub fn finish(&mut self, output: &mut [u8]) -> Result<StreamProgress> {
        self.run(&[], output, MZFlush::Finish)
    }

    fn run(&mut self, input: &[u8], output: &mut [u8], flush: MZFlush) -> Result<StreamProgress> {
        let result = miniz_oxide::deflate::stream::deflate(
            &mut self.state, input, output, flush
        );

        let finished = match result.status {
            Ok(MZStatus::StreamEnd) => true,
            Ok(_) => false,
            Err(MZError::Buf) => false,
            Err(_) => return Err(Error::Internal("deflate stream state broken")),
        };

        Ok(StreamProgress {
            consumed: result.bytes_consumed,
            written: result.bytes_written,
            finished,
        })
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zlib_roundtrip(){
        let data: Vec<u8> = (0..4096_u32).map(|value| (value % 251) as u8).collect();
        let compressed = compress_zlib(&data);
        assert!(compressed.len() < data.len());

        let decompressed = decompress_zlib(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn raw_streaming_roundtrip(){
        let data: Vec<u8> = (0..40_000_u32).map(|value| (value / 17 % 256) as u8).collect();

        // compress in small slices through the incremental interface
        let mut deflater = RawDeflater::new();
        let mut compressed = Vec::new();
        let mut buffer = [0_u8; 512];

        for chunk in data.chunks(777) {
            let mut chunk = chunk;
            while !chunk.is_empty() {
                let progress = deflater.deflate(chunk, &mut buffer).unwrap();
                compressed.extend_from_slice(&buffer[.. progress.written]);
                chunk = &chunk[progress.consumed ..];
            }
        }

        loop {
            let progress = deflater.finish(&mut buffer).unwrap();
            compressed.extend_from_slice(&buffer[.. progress.written]);
            if progress.finished { break; }
        }

        // decompress one byte of input at a time, like the streamed-archive path
        let mut inflater = RawInflater::new();
        let mut decompressed = Vec::new();
        let mut output = [0_u8; 512];
        let mut input = compressed.as_slice();

        while !inflater.is_finished() {
            let feed = &input[.. input.len().min(1)];
            let progress = inflater.inflate(feed, &mut output).unwrap();
            decompressed.extend_from_slice(&output[.. progress.written]);
            input = &input[progress.consumed ..];

            assert!(
                progress.consumed > 0 || progress.written > 0 || progress.finished,
                "no progress on valid stream"
            );
        }

        assert_eq!(decompressed, data);
    }
}
