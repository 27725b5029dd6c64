
//! Error type for all store and archive operations.

use std::borrow::Cow;
use std::fmt;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;

/// A result that may contain an error.
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains an error.
pub type UnitResult = Result<()>;


/// An error that may happen while managing an image store or a ZIP device.
/// Distinguishes between the failure modes the host cares about:
/// resource exhaustion, host I/O trouble, broken archives, and misuse.
#[derive(Debug)]
pub enum Error {

    /// No memory could be obtained for a block, not even by
    /// recycling slabs from other stores.
    OutOfMemory,

    /// The host filesystem or the archive source reported an error.
    Io(IoError),

    /// The archive bytes do not form a valid ZIP archive, or an entry's
    /// checksum did not match its data. The archive is unusable afterwards.
    CorruptArchive(Cow<'static, str>),

    /// The archive uses a feature this implementation does not extract,
    /// for example encryption or an exotic compression method.
    Unsupported(Cow<'static, str>),

    /// An argument was out of range or a flag combination was contradictory.
    InvalidArgument(Cow<'static, str>),

    /// The named file does not exist on the device.
    NotFound,

    /// The operation is not permitted: the device is read-only, the file is
    /// held exclusively, or it is still open elsewhere.
    AccessDenied,

    /// The host requested an interrupt while a thread was waiting.
    Interrupted,

    /// An internal invariant was violated. Always a bug in this crate.
    Internal(&'static str),
}

impl Error {

    /// Create an error describing a corrupt archive.
    pub(crate) fn corrupt(message: impl Into<Cow<'static, str>>) -> Self {
        Error::CorruptArchive(message.into())
    }

    /// Create an error for an archive feature we do not implement.
    pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Unsupported(message.into())
    }

    /// Create an error describing an invalid argument.
    pub(crate) fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Error::InvalidArgument(message.into())
    }
}

/// Enable using the `?` operator on `std::io::Result`.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound { Error::NotFound }
        else { Error::Io(error) }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(formatter, "out of memory"),
            Error::Io(error) => write!(formatter, "i/o error: {}", error),
            Error::CorruptArchive(message) => write!(formatter, "corrupt archive: {}", message),
            Error::Unsupported(message) => write!(formatter, "unsupported: {}", message),
            Error::InvalidArgument(message) => write!(formatter, "invalid argument: {}", message),
            Error::NotFound => write!(formatter, "file not found"),
            Error::AccessDenied => write!(formatter, "access denied"),
            Error::Interrupted => write!(formatter, "interrupted"),
            Error::Internal(message) => write!(formatter, "internal error: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}
