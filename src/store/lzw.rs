
//! LZW codec for purged blocks of mid-depth planes.
//!
//! Variable-width codes from 9 to 12 bits, packed most significant bit
//! first, with the usual clear and end-of-information codes. The table is
//! reset well before the 12-bit ceiling so both sides stay in lock step.
//! This is a private cache format: blocks compressed here are only ever
//! decompressed by this module, never written into an archive.

use std::collections::HashMap;

use crate::error::{Error, Result};

const CLEAR_CODE: u16 = 256;
const END_CODE: u16 = 257;
const FIRST_FREE: u16 = 258;
const MIN_WIDTH: u32 = 9;
const MAX_WIDTH: u32 = 12;

/// Reset the dictionary once this many codes exist.
const RESET_AT: u16 = 4000;


struct BitWriter {
    bytes: Vec<u8>,
    accumulator: u32,
    filled: u32,
}

impl BitWriter {
    fn new() -> Self { Self { bytes: Vec::new(), accumulator: 0, filled: 0 } }

    fn put(&mut self, code: u16, width: u32) {
        self.accumulator = (self.accumulator << width) | u32::from(code);
        self.filled += width;

        while self.filled >= 8 {
            self.filled -= 8;
            self.bytes.push((self.accumulator >> self.filled) as u8);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.bytes.push((self.accumulator << (8 - self.filled)) as u8);
        }

        self.bytes
    }
}

struct BitReader<'b> {
    bytes: &'b [u8],
    accumulator: u32,
    filled: u32,
}

impl<'b> BitReader<'b> {
    fn new(bytes: &'b [u8]) -> Self { Self { bytes, accumulator: 0, filled: 0 } }

    fn take(&mut self, width: u32) -> Option<u16> {
        while self.filled < width {
            let (&next, rest) = self.bytes.split_first()?;
            self.accumulator = (self.accumulator << 8) | u32::from(next);
            self.filled += 8;
            self.bytes = rest;
        }

        self.filled -= width;
        Some(((self.accumulator >> self.filled) & ((1 << width) - 1)) as u16)
    }
}


/// Compress a block of bytes.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut writer = BitWriter::new();
    let mut table: HashMap<(u16, u8), u16> = HashMap::new();
    let mut next_code = FIRST_FREE;
    let mut width = MIN_WIDTH;

    writer.put(CLEAR_CODE, width);

    let mut current: Option<u16> = None;
    for &byte in data {
        let current_code = match current {
            None => { current = Some(u16::from(byte)); continue; },
            Some(code) => code,
        };

        if let Some(&combined) = table.get(&(current_code, byte)) {
            current = Some(combined);
            continue;
        }

        writer.put(current_code, width);
        current = Some(u16::from(byte));

        if next_code >= RESET_AT {
            writer.put(CLEAR_CODE, width);
            table.clear();
            next_code = FIRST_FREE;
            width = MIN_WIDTH;
        }
        else {
            table.insert((current_code, byte), next_code);
            next_code += 1;
            if next_code == (1 << width) && width < MAX_WIDTH { width += 1; }
        }
    }

    if let Some(code) = current { writer.put(code, width); }

    // the decoder has performed one table add fewer at this point, so its
    // width can differ from ours at exact power-of-two boundaries; emit the
    // end code with the width the decoder will actually read it with
    let mut end_width = MIN_WIDTH;
    while (1_u32 << end_width) <= u32::from(next_code) + 1 && end_width < MAX_WIDTH {
        end_width += 1;
    }

    writer.put(END_CODE, end_width);
    writer.finish()
}

/// Decompress a block of bytes, knowing the decompressed length up front.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut reader = BitReader::new(data);
    let mut output = Vec::with_capacity(expected_len);

    // table entry: (prefix code or sentinel, suffix byte)
    let mut prefixes: Vec<(u16, u8)> = Vec::with_capacity(4096);
    let mut next_code = FIRST_FREE;
    let mut width = MIN_WIDTH;
    let mut previous: Option<u16> = None;

    // expand a code into the output, returning the first byte of the expansion
    fn expand(code: u16, prefixes: &[(u16, u8)], output: &mut Vec<u8>) -> Result<u8> {
        let start = output.len();
        let mut code = code;

        loop {
            if code < 256 {
                output.push(code as u8);
                break;
            }

            let index = usize::from(code - FIRST_FREE);
            let &(prefix, suffix) = prefixes.get(index)
                .ok_or(Error::corrupt("lzw code out of range"))?;

            output.push(suffix);
            code = prefix;
        }

        output[start ..].reverse();
        Ok(output[start])
    }

    loop {
        let code = match reader.take(width) {
            Some(code) => code,
            None => break, // tolerate missing end code at end of input
        };

        if code == END_CODE { break; }

        if code == CLEAR_CODE {
            prefixes.clear();
            next_code = FIRST_FREE;
            width = MIN_WIDTH;
            previous = None;
            continue;
        }

        let first = match previous {
            None => {
                if code >= 256 { return Err(Error::corrupt("lzw stream must start with a literal")); }
                expand(code, &prefixes, &mut output)?
            },

            Some(previous_code) => {
                if code == next_code {
                    // the one code the encoder knows that we don't yet
                    let first = expand(previous_code, &prefixes, &mut output)?;
                    output.push(first);
                    first
                }
                else {
                    expand(code, &prefixes, &mut output)?
                }
            },
        };

        if let Some(previous_code) = previous {
            if next_code < RESET_AT {
                prefixes.push((previous_code, first));
                next_code += 1;

                // the decoder's table lags the encoder's by one entry,
                // so the width must grow one code earlier than on the
                // encoding side
                if next_code + 1 == (1 << width) && width < MAX_WIDTH { width += 1; }
            }
        }

        previous = Some(code);

        if output.len() > expected_len {
            return Err(Error::corrupt("lzw data longer than expected"));
        }
    }

    if output.len() != expected_len {
        return Err(Error::corrupt("lzw data shorter than expected"));
    }

    Ok(output)
}


#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(data: &[u8]) {
        let compressed = compress(data);
        let decompressed = decompress(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn empty(){ roundtrip(&[]); }

    #[test]
    fn repetitive(){
        roundtrip(&vec![42_u8; 10_000]);
        roundtrip(b"abababababababababab");
    }

    #[test]
    fn ramp(){
        let data: Vec<u8> = (0..30_000_u32).map(|value| (value % 256) as u8).collect();
        roundtrip(&data);
    }

    #[test]
    fn random_bytes(){
        use rand::{Rng, SeedableRng};
        let mut random = rand::rngs::StdRng::seed_from_u64(902);

        for length in [1, 2, 255, 256, 257, 5000, 70_000] {
            let data: Vec<u8> = (0..length).map(|_| random.random()).collect();
            roundtrip(&data);
        }
    }

    #[test]
    fn kwkwk_case(){
        // pattern that provokes the code == next_code branch
        roundtrip(b"aaabbbcccaaabbbcccaaabbbccc");
        roundtrip(b"aaaaaaa");
    }
}
