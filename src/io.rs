
//! Low level byte input and output.
//! Archive records are little-endian throughout, so all primitive
//! serialization goes through the little-endian routines of `lebe`.

pub use ::std::io::{Read, Write, Seek, SeekFrom};
use lebe::prelude::*;
use crate::error::{Error, Result, UnitResult, IoResult};


/// Skip the specified number of bytes without seeking.
pub fn skip_bytes(read: &mut impl Read, count: u64) -> UnitResult {
    let skipped = std::io::copy(
        &mut read.by_ref().take(count),
        &mut std::io::sink()
    )?;

    if skipped < count {
        return Err(Error::corrupt("unexpected end of input"));
    }

    Ok(())
}


/// Peek a single byte without consuming it.
pub struct PeekRead<T> {
    inner: T,
    peeked: Option<IoResult<u8>>,
}

impl<T: Read> PeekRead<T> {

    /// Wrap a reader to enable peeking.
    pub fn new(inner: T) -> Self {
        Self { inner, peeked: None }
    }

    /// Read a single byte without consuming it.
    /// The byte is returned again on the next read call.
    pub fn peek_u8(&mut self) -> &IoResult<u8> {
        self.peeked = self.peeked.take().or_else(|| Some(u8::read_from_little_endian(&mut self.inner)));
        self.peeked.as_ref().unwrap() // unwrap cannot fail because this was just set
    }
}

impl<T: Read> Read for PeekRead<T> {
    fn read(&mut self, target_buffer: &mut [u8]) -> IoResult<usize> {
        if target_buffer.is_empty() {
            return Ok(0)
        }

        match self.peeked.take() {
            None => self.inner.read(target_buffer),
            Some(peeked) => {
                target_buffer[0] = peeked?;
                Ok(1 + self.inner.read(&mut target_buffer[1..])?)
            }
        }
    }
}


/// Keep track of the byte position while writing.
/// The archive writer uses this to remember the offsets
/// that must be patched into the central directory later.
#[derive(Debug)]
pub struct Tracking<T> {
    inner: T,
    position: u64,
}

impl<T> Tracking<T> {

    /// Wrap an output, starting the position count at zero.
    pub fn new(inner: T) -> Self {
        Self { inner, position: 0 }
    }

    /// The number of bytes written so far.
    pub fn byte_position(&self) -> u64 { self.position }

    /// Destructure into the wrapped output.
    pub fn into_inner(self) -> T { self.inner }
}

impl<T: Write> Write for Tracking<T> {
    fn write(&mut self, buffer: &[u8]) -> IoResult<usize> {
        let written = self.inner.write(buffer)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> IoResult<()> {
        self.inner.flush()
    }
}


/// Extension trait for primitive types like numbers and arrays.
pub trait Data: Sized + Default + Clone {

    /// Number of bytes this would consume in a file.
    const BYTE_SIZE: usize = ::std::mem::size_of::<Self>();

    /// Read a value of this type.
    fn read(read: &mut impl Read) -> Result<Self>;

    /// Read as many values of this type as fit into the specified slice.
    fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Write this value.
    fn write(self, write: &mut impl Write) -> UnitResult;

    /// Write as many values of this type as the specified slice contains.
    fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult;

    /// Read the specified number of values into a new vector.
    #[inline]
    fn read_vec(read: &mut impl Read, data_size: usize) -> Result<Vec<Self>> {
        let mut vec = vec![Self::default(); data_size];
        Self::read_slice(read, vec.as_mut_slice())?;
        Ok(vec)
    }
}


macro_rules! implement_data_for_primitive {
    ($kind: ident) => {
        impl Data for $kind {
            fn read(read: &mut impl Read) -> Result<Self> {
                Ok(read.read_from_little_endian()?)
            }

            fn write(self, write: &mut impl Write) -> UnitResult {
                write.write_as_little_endian(&self)?;
                Ok(())
            }

            fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_little_endian_into(slice)?;
                Ok(())
            }

            fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_little_endian(slice)?;
                Ok(())
            }
        }
    };
}

implement_data_for_primitive!(u8);
implement_data_for_primitive!(i8);
implement_data_for_primitive!(i16);
implement_data_for_primitive!(u16);
implement_data_for_primitive!(u32);
implement_data_for_primitive!(i32);
implement_data_for_primitive!(i64);
implement_data_for_primitive!(u64);


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peek(){
        use lebe::prelude::*;
        let buffer: &[u8] = &[0,1,2,3];
        let mut peek = PeekRead::new(buffer);

        assert_eq!(peek.peek_u8().as_ref().unwrap(), &0);
        assert_eq!(peek.peek_u8().as_ref().unwrap(), &0);
        assert_eq!(u8::read_from_little_endian(&mut peek).unwrap(), 0_u8);

        assert_eq!(peek.read(&mut [0,0]).unwrap(), 2);

        assert_eq!(peek.peek_u8().as_ref().unwrap(), &3);
        assert_eq!(u8::read_from_little_endian(&mut peek).unwrap(), 3_u8);

        assert!(peek.peek_u8().is_err());
        assert!(u8::read_from_little_endian(&mut peek).is_err());
    }

    #[test]
    fn tracking_positions(){
        let mut tracked = Tracking::new(Vec::new());
        7_u32.write(&mut tracked).unwrap();
        assert_eq!(tracked.byte_position(), 4);

        u16::write_slice(&mut tracked, &[1, 2, 3]).unwrap();
        assert_eq!(tracked.byte_position(), 10);

        assert_eq!(tracked.into_inner(), vec![7, 0, 0, 0,  1, 0, 2, 0, 3, 0]);
    }
}
