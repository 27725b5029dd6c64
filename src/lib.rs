
//! Support layer for raster image processors: a tiled image store with
//! tiered block storage, and a ZIP/ZIP64 archive filesystem device.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_debug_implementations,
)]

#![deny(
    unused_variables,
    unused_assignments,
    unused_must_use,
    trivial_numeric_casts,
)]

#![forbid(unsafe_code)]

pub mod io;
pub mod error;
pub mod hash;
pub mod flate;
pub mod calendar;
pub mod fs;
pub mod filters;
pub mod store;
pub mod zip;

/// Re-exports of the types commonly required to mount archives and
/// manage image stores.
pub mod prelude {
    pub use crate::error::{Error, Result, UnitResult};
    pub use crate::fs::{DiskFileSystem, FileSystem, MemoryFileSystem, OpenFlags, SeekMode};
    pub use crate::store::{Bbox, ImShared, ImageStore, StoreAction, StoreDescriptor, StoreFlags};
    pub use crate::zip::device::{DeviceParam, ParamValue, ZipDevice};
    pub use crate::zip::writer::WriteonlyZipDevice;
    pub use crate::calendar::{Calendar, NoCalendar, SystemCalendar};
}
