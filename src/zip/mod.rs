
//! The ZIP/ZIP64 archive filesystem.
//!
//! [`device::ZipDevice`] mounts one archive, seekable or streamed, as a
//! relative filesystem whose files extract on demand into scratch files.
//! [`writer::WriteonlyZipDevice`] creates archives entry by entry, and a
//! populated device can re-emit itself as a fresh archive.

pub mod records;
pub mod archive;
pub mod reader;
pub mod device;
pub mod writer;

pub(crate) mod file;
pub(crate) mod stream;

pub use device::{purge_stale_scratch, DeviceParam, ParamValue, ZipDevice};
pub use writer::WriteonlyZipDevice;
