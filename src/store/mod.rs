
//! The tiled image store.
//!
//! Each store partitions one raster into a grid of fixed-size blocks per
//! color plane. Block data moves between storage tiers under memory
//! pressure: resident memory, compressed memory, spill files, a single
//! uniform color, and finally nothing at all once trimmed. A slab pool
//! recirculates block memory inside a store and, through a global list,
//! between stores.
//!
//! All block and pool state of every store created from one [`ImShared`]
//! lives under a single mutex, with two conditions: one broadcast when a
//! block finishes loading, one when block memory returns to the pool.
//! The mutex is released around file reads and decompression.

pub mod block;
pub mod blist;
pub mod spill;
pub mod compress;
mod lzw;
mod b32;

pub use block::BlockStorage;
pub use compress::BlockCompression;

use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result, UnitResult};
use crate::fs::FileSystem;
use block::{Block, BlockFlags, Geometry};
use blist::Blist;
use compress::{compression_cap, compress_block, decompress_block, MIN_COMPRESSION_SIZE};
use spill::SpillSet;


/// Size of a standard pooled slab in bytes.
pub const BLOCK_DEFAULT_SIZE: usize = 16384;

/// Stores smaller than this never spill to disk; purging them would cost
/// more in file traffic than it frees.
const DISK_THRESHOLD_BYTES: usize = 4 * BLOCK_DEFAULT_SIZE;

/// How many pooled slabs each plane tries to keep in circulation.
const DESIRED_BLISTS_PER_PLANE: usize = 8;


bitflags::bitflags! {

    /// Behavior switches of one store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StoreFlags: u16 {

        /// Rows arrive transposed and are swapped on block completion.
        const XYSWAP = 0x01;

        /// Purge columns right to left to preserve disk locality.
        const XFLIP = 0x02;

        /// On allocation failure, steal slabs from other stores.
        const DESPERATE = 0x04;

        /// The data was downsampled; disables the near row-repeat test.
        const DOWNSAMPLED = 0x08;

        /// Row repeats tolerate small per-byte differences.
        const ROWREPEATS_NEAR = 0x10;

        /// The store is refilled in place; row repeats are already final.
        const RECYCLED = 0x20;
    }
}

/// What the purger does with eligible blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {

    /// Keep everything in plain memory.
    None,

    /// Compress in memory, spilling only as a fallback.
    Compression,

    /// Spill straight to disk.
    Disk,
}

/// An integer bounding box, inclusive on all sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bbox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Bbox {
    pub fn width(&self) -> usize { (self.x2 - self.x1 + 1) as usize }
    pub fn height(&self) -> usize { (self.y2 - self.y1 + 1) as usize }
}

/// Everything needed to create a store.
#[derive(Debug, Clone)]
pub struct StoreDescriptor {

    /// Extent of the raster in pixels.
    pub bbox: Bbox,

    /// Bits per sample: 1, 2, 4, 8, 16 or 32.
    pub bpp: usize,

    /// Bytes per block row. Must be a power of two.
    pub block_width: usize,

    /// Rows per block. Must be a power of two.
    pub block_height: usize,

    /// Number of color planes.
    pub nplanes: usize,

    pub flags: StoreFlags,

    /// Whether to track which rows repeat their predecessor.
    pub track_row_repeats: bool,
}

impl StoreDescriptor {

    /// A descriptor with the standard block shape.
    pub fn new(bbox: Bbox, bpp: usize, nplanes: usize) -> Self {
        StoreDescriptor {
            bbox, bpp, nplanes,
            block_width: 512,
            block_height: 32,
            flags: StoreFlags::empty(),
            track_row_repeats: false,
        }
    }

    fn validate(&self) -> UnitResult {
        if !matches!(self.bpp, 1 | 2 | 4 | 8 | 16 | 32) {
            return Err(Error::invalid("bits per sample"));
        }

        if !self.block_width.is_power_of_two() || !self.block_height.is_power_of_two() {
            return Err(Error::invalid("block dimensions must be powers of two"));
        }

        if self.bbox.x2 < self.bbox.x1 || self.bbox.y2 < self.bbox.y1 {
            return Err(Error::invalid("bounding box"));
        }

        if self.nplanes == 0 {
            return Err(Error::invalid("plane count"));
        }

        Ok(())
    }
}


/// Host-visible interrupt state. Reload waits poll this on every wakeup.
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub fn request(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn clear(&self) { self.0.store(false, Ordering::SeqCst); }
    pub fn is_requested(&self) -> bool { self.0.load(Ordering::SeqCst) }
}


pub(crate) type StoreId = usize;
pub(crate) type BlistId = u64;

/// How urgently an allocation is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocCost {

    /// Only allocate while memory is plentiful.
    None,

    /// Allocate up to the configured limit.
    Normal,

    /// Same as normal; compressed data is always worth keeping.
    Easy,
}

#[derive(Debug)]
pub(crate) struct PlaneState {
    pub blocks: Vec<Option<Block>>,
    pub blists: Vec<Blist>,
    pub n_desired_blists: usize,
    pub y_compressed: usize,
    pub y_purged: usize,
}

#[derive(Debug)]
pub(crate) struct StoreState {
    pub geometry: Geometry,
    pub flags: StoreFlags,
    pub action: StoreAction,
    pub planes: Vec<Option<PlaneState>>,

    /// Default slab size for this store.
    pub abytes: usize,

    pub nblocks: usize,
    pub stdblocks: usize,
    pub extblocks: usize,

    /// Scratch space for the transpose, `abytes` long. Only for
    /// transposed stores.
    pub swapmem: Option<Vec<u8>>,

    /// Bit per row; set while the row still matches its predecessor.
    pub row_repeats: Option<Vec<u64>>,

    /// Set after the first low-memory event: every completed block row
    /// is purged from then on.
    pub blist_purge_row: bool,

    pub open_for_writing: bool,
}

/// Everything the mutex protects.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub stores: Vec<Option<StoreState>>,
    pub global_blists: Vec<Blist>,
    pub mem_used: usize,
    pub mem_limit: Option<usize>,
    pub next_blist_id: BlistId,
}

impl Shared {

    pub(crate) fn block_at(&self, owner: (StoreId, usize, usize)) -> Option<&Block> {
        let (sid, plane, bb) = owner;
        self.stores.get(sid)?.as_ref()?.planes.get(plane)?.as_ref()?.blocks.get(bb)?.as_ref()
    }

    pub(crate) fn block_at_mut(&mut self, owner: (StoreId, usize, usize)) -> Option<&mut Block> {
        let (sid, plane, bb) = owner;
        self.stores.get_mut(sid)?.as_mut()?.planes.get_mut(plane)?.as_mut()?.blocks.get_mut(bb)?.as_mut()
    }

    /// Account for an allocation. Returns whether the budget allows it.
    pub(crate) fn track_alloc(&mut self, bytes: usize, cost: AllocCost) -> bool {
        if let Some(limit) = self.mem_limit {
            let headroom = match cost {
                AllocCost::None => limit - limit / 4,
                AllocCost::Normal | AllocCost::Easy => limit,
            };

            if self.mem_used + bytes > headroom { return false; }
        }

        self.mem_used += bytes;
        true
    }

    pub(crate) fn track_free(&mut self, bytes: usize) {
        debug_assert!(self.mem_used >= bytes, "freeing more than allocated");
        self.mem_used = self.mem_used.saturating_sub(bytes);
    }

    /// A zeroed buffer within the budget, or `None` under pressure.
    fn try_alloc(&mut self, bytes: usize, cost: AllocCost) -> Option<Vec<u8>> {
        if self.track_alloc(bytes, cost) { Some(vec![0_u8; bytes]) } else { None }
    }
}


/// The process-wide home of all stores: the block mutex, the two
/// conditions, the slab pool, and the spill files.
pub struct ImShared {
    state: Mutex<Shared>,
    load_done: Condvar,
    slab_freed: Condvar,
    spill: SpillSet,
    interrupt: Arc<InterruptFlag>,
}

impl std::fmt::Debug for ImShared {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ImShared").finish()
    }
}

impl ImShared {

    /// Set up shared store state over the given scratch filesystem.
    /// `memory_limit` bounds the bytes of block and compressed data held
    /// in memory; `None` means unbounded.
    pub fn new(fs: Arc<dyn FileSystem>, memory_limit: Option<usize>) -> Arc<Self> {
        Arc::new(ImShared {
            state: Mutex::new(Shared { mem_limit: memory_limit, ..Default::default() }),
            load_done: Condvar::new(),
            slab_freed: Condvar::new(),
            spill: SpillSet::new(fs),
            interrupt: Arc::new(InterruptFlag::default()),
        })
    }

    /// The interrupt flag reload waits poll.
    pub fn interrupt(&self) -> Arc<InterruptFlag> {
        self.interrupt.clone()
    }

    /// Bytes of block data currently held in memory across all stores.
    pub fn memory_in_use(&self) -> usize {
        self.state.lock().unwrap().mem_used
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap()
    }
}


/// Handle to one raster's tiled storage.
pub struct ImageStore {
    shared: Arc<ImShared>,
    sid: StoreId,
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ImageStore").field("sid", &self.sid).finish()
    }
}

/// A locked view of one row fragment. The referenced block cannot be
/// purged or trimmed while this exists; drop it promptly.
pub struct RowRef {
    shared: Arc<ImShared>,
    owner: (StoreId, usize, usize),
    data: Arc<Vec<u8>>,
    start: usize,
    len: usize,
    pixels: usize,
}

impl RowRef {

    /// Pixels from the requested position to the end of the block row.
    pub fn remaining_pixels(&self) -> usize { self.pixels }
}

impl std::fmt::Debug for RowRef {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("RowRef")
            .field("owner", &self.owner)
            .field("pixels", &self.pixels)
            .finish()
    }
}

impl Deref for RowRef {
    type Target = [u8];
    fn deref(&self) -> &[u8] { &self.data[self.start .. self.start + self.len] }
}

impl Drop for RowRef {
    fn drop(&mut self) {
        let mut state = self.shared.lock();

        if let Some(block) = state.block_at_mut(self.owner) {
            debug_assert!(block.refcount > 0, "read released twice");
            block.refcount = block.refcount.saturating_sub(1);
        }

        // multiple threads might be waiting for different sizes, so broadcast
        drop(state);
        self.shared.slab_freed.notify_all();
    }
}


impl ImageStore {

    /// Create a store for one raster.
    pub fn create(shared: &Arc<ImShared>, descriptor: &StoreDescriptor) -> Result<ImageStore> {
        descriptor.validate()?;

        let bpps = (descriptor.bpp as u32).trailing_zeros();
        let width = descriptor.bbox.width();
        let height = descriptor.bbox.height();

        let row_bytes = ((width << bpps) + 7) >> 3;
        let xblock = (row_bytes + descriptor.block_width - 1) / descriptor.block_width;
        let yblock = (height + descriptor.block_height - 1) / descriptor.block_height;

        let geometry = Geometry {
            width, height,
            bpp: descriptor.bpp,
            bpps,
            block_width: descriptor.block_width,
            block_height: descriptor.block_height,
            xblock, yblock,
            xyswap: descriptor.flags.contains(StoreFlags::XYSWAP),
        };

        let abytes = geometry.default_block_bytes();
        let nblocks = xblock * yblock;

        let row_repeats = if descriptor.track_row_repeats {
            let words = (height + 63) / 64;
            let mut bits = vec![!0_u64; words];

            // rows that have no in-block predecessor are never verified,
            // so they must not claim to repeat
            clear_bit(&mut bits, 0);
            for by in 1 .. yblock { clear_bit(&mut bits, by * descriptor.block_height); }

            // mask off bits beyond the image
            for y in height .. words * 64 { clear_bit(&mut bits, y); }

            Some(bits)
        } else { None };

        let store = StoreState {
            geometry,
            flags: descriptor.flags,
            action: StoreAction::None,
            planes: (0 .. descriptor.nplanes).map(|_| None).collect(),
            abytes,
            nblocks,
            stdblocks: 0,
            extblocks: 0,
            swapmem: if geometry.xyswap { Some(vec![0_u8; abytes]) } else { None },
            row_repeats,
            blist_purge_row: false,
            open_for_writing: true,
        };

        let mut state = shared.lock();
        let sid = match state.stores.iter().position(Option::is_none) {
            Some(free) => { state.stores[free] = Some(store); free },
            None => { state.stores.push(Some(store)); state.stores.len() - 1 },
        };

        Ok(ImageStore { shared: shared.clone(), sid })
    }

    fn store<'s>(state: &'s mut Shared, sid: StoreId) -> &'s mut StoreState {
        state.stores[sid].as_mut().expect("store already closed")
    }

    /// The purge direction. `Disk` silently degrades to `Compression`
    /// while the store is too small to be worth file traffic.
    pub fn set_action(&self, action: StoreAction) {
        let mut state = self.shared.lock();
        let store = Self::store(&mut state, self.sid);

        store.action = match action {
            StoreAction::Disk if !can_write_to_disk(store) => StoreAction::Compression,
            action => action,
        };
    }

    fn plane_new(state: &mut Shared, sid: StoreId, plane: usize) -> UnitResult {
        let store = Self::store(state, sid);

        if plane >= store.planes.len() {
            return Err(Error::invalid("plane index"));
        }

        if store.planes[plane].is_some() { return Ok(()); }

        let geometry = store.geometry;
        let blocks = (0 .. store.nblocks).map(|bb| {
            let bx = bb % geometry.xblock;
            let by = bb / geometry.xblock;
            Some(Block::setup(&geometry, bx, by))
        }).collect();

        store.planes[plane] = Some(PlaneState {
            blocks,
            blists: Vec::new(),
            n_desired_blists: geometry.xblock.min(DESIRED_BLISTS_PER_PLANE),
            y_compressed: 0,
            y_purged: 0,
        });

        Ok(())
    }

    /// Allocate data for a block, recycling pooled slabs under pressure.
    /// The first low-memory event purges a row of this store and arms
    /// row-completion purging.
    fn block_alloc(
        &self, state: &mut Shared, plane: usize, bb: usize, pre_alloc: bool,
    ) -> UnitResult {
        let sid = self.sid;
        let store = Self::store(state, sid);
        let geometry = store.geometry;
        let abytes = store.abytes;
        let desperate = store.flags.contains(StoreFlags::DESPERATE);
        let purge_armed = store.blist_purge_row;

        // transposed stores index slab affinity by the other axis
        let bx = if geometry.xyswap { bb / geometry.xblock } else { bb % geometry.xblock };

        // cheap path while memory is plentiful
        let mut slab = if !purge_armed { state.try_alloc(abytes, AllocCost::None) } else { None };
        let mut found = None;

        if slab.is_none() {
            if !purge_armed && !pre_alloc {
                // low memory for the first time with this image: purge a row
                // now, and re-purge at the end of every row from here on
                let _ = self.purge_one_locked(state);
                Self::store(state, sid).blist_purge_row = true;
            }

            found = state.blist_find(sid, abytes, plane, bx as isize, false);

            if found.is_none() {
                slab = state.try_alloc(abytes, AllocCost::Normal);

                if slab.is_none() && desperate {
                    found = state.blist_find(sid, abytes, plane, bx as isize, true);
                }
            }

            if found.is_none() && slab.is_none() {
                return Err(Error::OutOfMemory);
            }
        }

        let allocated;
        if let Some(found) = found {
            allocated = found.blist.capacity;
            attach_slab(state, (sid, plane, bb), found.blist, true);
        }
        else {
            let slab = slab.expect("either a slab or a blist must exist here");
            allocated = slab.len();

            let block = state.block_at_mut((sid, plane, bb))
                .ok_or(Error::Internal("allocating into missing block"))?;
            block.data = Some(Arc::new(slab));
            block.abytes = allocated;

            // keep a minimum number of slabs pooled per plane
            let id = state.new_blist_id();
            let plane_state = Self::store(state, sid).planes[plane].as_mut().unwrap();
            if plane_state.blists.len() < plane_state.n_desired_blists {
                plane_state.blists.push(Blist {
                    id,
                    slab: None,
                    capacity: allocated,
                    bx: bx as isize,
                    block: Some((sid, plane, bb)),
                    was_global: false,
                });

                state.block_at_mut((sid, plane, bb)).unwrap().blist = Some(id);
            }
        }

        let store = Self::store(state, sid);
        if allocated == BLOCK_DEFAULT_SIZE { store.stdblocks += 1; }
        else { store.extblocks += allocated; }

        let block = state.block_at_mut((sid, plane, bb)).unwrap();
        block.storage = BlockStorage::Memory;
        debug_assert!(block.rbytes <= block.tbytes && block.tbytes <= block.abytes);

        Ok(())
    }

    /// Pre-allocate the block containing nothing yet, returning the byte
    /// count each line write must deliver for it.
    pub fn prealloc(&self, plane: usize, bx: usize, by: usize) -> Result<usize> {
        let mut state = self.shared.lock();
        Self::plane_new(&mut state, self.sid, plane)?;

        let geometry = Self::store(&mut state, self.sid).geometry;
        let bb = bx + by * geometry.xblock;

        if bb >= Self::store(&mut state, self.sid).nblocks {
            return Err(Error::invalid("block index"));
        }

        {
            let block = state.block_at((self.sid, plane, bb))
                .ok_or(Error::invalid("block was trimmed"))?;

            if block.data.is_some() { return Err(Error::Internal("block already allocated")); }
        }

        self.block_alloc(&mut state, plane, bb, true)?;

        let block = state.block_at((self.sid, plane, bb)).unwrap();
        Ok(if geometry.xyswap { block.ybytes } else { block.xbytes })
    }

    /// Write one complete line of the raster: a row for plain stores, a
    /// column for transposed ones. Lines must cover the full extent.
    pub fn write_line(&self, plane: usize, line: usize, bytes: &[u8]) -> UnitResult {
        let mut state = self.shared.lock();
        Self::plane_new(&mut state, self.sid, plane)?;

        let geometry = Self::store(&mut state, self.sid).geometry;
        let xyswap = geometry.xyswap;

        let expected = if xyswap {
            ((geometry.height << geometry.bpps) + 7) >> 3
        } else {
            geometry.row_bytes()
        };

        if bytes.len() != expected {
            return Err(Error::invalid("line byte count"));
        }

        let mut completed_rows: Vec<usize> = Vec::new();
        let mut offset = 0;

        if xyswap {
            // the incoming line is one column; every block row gets a slice
            let x = line;
            if x >= geometry.width { return Err(Error::invalid("column index")); }
            let bx = x >> (geometry.block_width * 8 >> geometry.bpps).trailing_zeros();

            for by in 0 .. geometry.yblock {
                let bb = bx + by * geometry.xblock;
                self.write_block_part(&mut state, plane, bb, &bytes[offset ..], &mut completed_rows)?;
                offset = {
                    let block = state.block_at((self.sid, plane, bb)).unwrap();
                    offset + block.ybytes
                };
            }
        }
        else {
            let y = line;
            if y >= geometry.height { return Err(Error::invalid("row index")); }
            let by = y >> geometry.block_height.trailing_zeros();

            for bx in 0 .. geometry.xblock {
                let bb = bx + by * geometry.xblock;
                self.write_block_part(&mut state, plane, bb, &bytes[offset ..], &mut completed_rows)?;
                offset = {
                    let block = state.block_at((self.sid, plane, bb)).unwrap();
                    offset + block.xbytes
                };
            }
        }

        // purge rows that completed, if a low-memory event armed that
        for by in completed_rows {
            if Self::store(&mut state, self.sid).blist_purge_row {
                self.purge_row_locked(&mut state, plane, by)?;
            }
        }

        Ok(())
    }

    /// Append one line fragment to one block; finish the block when that
    /// was the last fragment.
    fn write_block_part(
        &self, state: &mut Shared, plane: usize, bb: usize,
        bytes: &[u8], completed_rows: &mut Vec<usize>,
    ) -> UnitResult {
        let sid = self.sid;
        let geometry = Self::store(state, sid).geometry;

        let needs_alloc = {
            let block = state.block_at((sid, plane, bb))
                .ok_or(Error::invalid("block was trimmed"))?;

            if block.spill.is_some() || block.compression.is_encoded() {
                return Err(Error::Internal("write into a purged block"));
            }

            block.data.is_none()
        };

        if needs_alloc {
            self.block_alloc(state, plane, bb, false)?;
        }

        let count = {
            let block = state.block_at((sid, plane, bb)).unwrap();
            if geometry.xyswap { block.ybytes } else { block.xbytes }
        };

        let block = state.block_at_mut((sid, plane, bb)).unwrap();
        block.append_row(&bytes[.. count], geometry.bpp)?;

        if block.sbytes == block.rbytes {
            // block write completed
            block.flags.insert(BlockFlags::WRITE_COMPLETE);
            let by = bb / geometry.xblock;

            // more data exists now, so compression work is available
            let store = Self::store(state, sid);
            if store.action == StoreAction::None {
                store.action = StoreAction::Compression;
            }

            if geometry.xyswap {
                let mut swap = Self::store(state, sid).swapmem.take()
                    .ok_or(Error::Internal("transposed store lost its swap buffer"))?;

                let block = state.block_at_mut((sid, plane, bb)).unwrap();
                let result = block::transpose(block, &mut swap, geometry.bpp);
                Self::store(state, sid).swapmem = Some(swap);
                result?;
            }

            self.set_row_repeats_locked(state, plane, bb, by * geometry.block_height);

            if Self::all_complete_in_row(state, sid, plane, by) {
                completed_rows.push(by);
            }
        }

        Ok(())
    }

    fn all_complete_in_row(state: &Shared, sid: StoreId, plane: usize, by: usize) -> bool {
        let store = state.stores[sid].as_ref().unwrap();
        let plane_state = match &store.planes[plane] { Some(plane) => plane, None => return false };

        (0 .. store.geometry.xblock).all(|bx| {
            plane_state.blocks[bx + by * store.geometry.xblock].as_ref()
                .map_or(true, |block| block.is_complete())
        })
    }

    /// Look up pixels at (x, y), reloading the block if it was purged.
    /// The returned reference pins the block in memory until dropped.
    pub fn read(&self, plane: usize, x: usize, y: usize) -> Result<RowRef> {
        let sid = self.sid;
        let mut state = self.shared.lock();

        let geometry = Self::store(&mut state, sid).geometry;
        if x >= geometry.width || y >= geometry.height {
            return Err(Error::invalid("pixel coordinates"));
        }

        let pixels_per_block = geometry.pixels_per_block();
        let bx = x / pixels_per_block;
        let by = y / geometry.block_height;
        let bb = bx + by * geometry.xblock;
        let owner = (sid, plane, bb);

        {
            let block = state.block_at(owner).ok_or(Error::NotFound)?;
            if block.flags.contains(BlockFlags::NO_LONGER_NEEDED) {
                return Err(Error::NotFound);
            }
        }

        let moveable = state.block_at(owner).unwrap().is_moveable();
        if moveable {
            state = self.load_block(state, owner, bx)?;
        }
        else {
            let block = state.block_at_mut(owner).unwrap();
            if block.data.is_none() { return Err(Error::NotFound); }
            debug_assert!(block.refcount < u8::MAX, "block refcount suspiciously large");
            block.refcount += 1;
        }

        let block = state.block_at(owner).unwrap();
        let data = block.data.as_ref().expect("loaded block must have data").clone();

        let xi = x & (pixels_per_block - 1);
        let xi_bytes = (xi << geometry.bpps) >> 3;
        let pixels = block.xsize.saturating_sub(xi);
        let len = block.xbytes - xi_bytes;

        let start = if block.storage == BlockStorage::UniformVariant
            || block.storage == BlockStorage::UniformBlock
        {
            0 // a single expanded row serves every y
        } else {
            let yi = y & (geometry.block_height - 1);
            block.xbytes * yi + xi_bytes
        };

        Ok(RowRef {
            shared: self.shared.clone(),
            owner,
            data,
            start,
            len,
            pixels,
        })
    }

    /// Bring a purged block back into memory. Implements the single-loader
    /// protocol: one thread loads, everyone else waits on the load
    /// condition. The mutex is dropped around file reads and decompression.
    fn load_block<'s>(
        &'s self, mut state: MutexGuard<'s, Shared>, owner: (StoreId, usize, usize), bx: usize,
    ) -> Result<MutexGuard<'s, Shared>> {
        let sid = self.sid;
        let plane = owner.1;

        state.block_at_mut(owner).unwrap().refcount += 1;

        // someone else is already loading this block
        while state.block_at(owner).unwrap().flags.contains(BlockFlags::IS_LOADING) {
            state = self.shared.load_done.wait(state).map_err(|_| Error::Internal("mutex poisoned"))?;

            if self.shared.interrupt.is_requested() {
                state.block_at_mut(owner).unwrap().refcount -= 1;
                return Err(Error::Interrupted);
            }
        }

        if state.block_at(owner).unwrap().data.is_some() {
            // loaded while we waited, or never evicted; reclaim the blist
            // from the global list if it drifted there
            Self::repatriate_blist(&mut state, owner, plane);
            return Ok(state);
        }

        state.block_at_mut(owner).unwrap().flags.insert(BlockFlags::IS_LOADING);

        // find memory for the data, recycling or waiting as needed
        let abort = |state: &mut Shared, error: Error| -> Error {
            let block = state.block_at_mut(owner).unwrap();
            block.flags.remove(BlockFlags::IS_LOADING);
            block.refcount -= 1;
            error
        };

        loop {
            let abytes = Self::store(&mut state, sid).abytes;
            let needed = state.block_at(owner).unwrap().abytes.max(abytes);

            if let Some(found) = state.blist_find(sid, needed, plane, bx as isize, true) {
                attach_slab(&mut state, owner, found.blist, true);
                break;
            }

            if let Some(slab) = state.try_alloc(needed, AllocCost::None) {
                let block = state.block_at_mut(owner).unwrap();
                block.data = Some(Arc::new(slab));
                block.abytes = needed;
                break;
            }

            // free memory ourselves if this store still has purgeable rows
            if self.purge_one_locked(&mut state).unwrap_or(0) > 0 { continue; }

            // sleep until someone returns a block to the pool
            state = match self.shared.slab_freed.wait(state) {
                Ok(state) => state,
                Err(_) => return Err(Error::Internal("mutex poisoned")),
            };

            if self.shared.interrupt.is_requested() {
                self.shared.load_done.notify_all();
                return Err(abort(&mut state, Error::Interrupted));
            }
        }

        // snapshot what the fill needs, then run it unlocked
        let (storage, compression, spill_address, cdata, tbytes, bpp) = {
            let bpp = Self::store(&mut state, sid).geometry.bpp;
            let block = state.block_at_mut(owner).unwrap();
            (block.storage, block.compression, block.spill, block.cdata.take(), block.tbytes, bpp)
        };

        let arc = state.block_at_mut(owner).unwrap().data.take().unwrap();
        let mut slab = match Arc::try_unwrap(arc) {
            Ok(slab) => slab,
            Err(_) => return Err(abort(&mut state, Error::Internal("fresh slab already shared"))),
        };

        drop(state);

        let fill = (|| -> UnitResult {
            match storage {
                BlockStorage::Memory => {
                    let cdata = cdata.as_ref().ok_or(Error::Internal("compressed block lost its data"))?;
                    let restored = decompress_block(compression, cdata, tbytes)?;
                    slab[.. tbytes].copy_from_slice(&restored);
                },

                BlockStorage::UniformVariant | BlockStorage::UniformBlock => {
                    // expansion happens below, back under the lock
                },

                BlockStorage::Disk => {
                    let address = spill_address.ok_or(Error::Internal("spilled block lost its address"))?;

                    if compression.is_encoded() {
                        let mut compressed = vec![0_u8; address.bytes];
                        self.shared.spill.read_block(address, &mut compressed)?;
                        let restored = decompress_block(compression, &compressed, tbytes)?;
                        slab[.. tbytes].copy_from_slice(&restored);
                    }
                    else {
                        self.shared.spill.read_block(address, &mut slab[.. tbytes])?;
                    }
                },

                BlockStorage::None => return Err(Error::Internal("loading a block with no storage")),
            }

            Ok(())
        })();

        let mut state = self.shared.lock();

        {
            let block = state.block_at_mut(owner).unwrap();

            if block.storage == BlockStorage::UniformVariant || block.storage == BlockStorage::UniformBlock {
                block.expand_uniform(&mut slab, bpp);
            }

            block.cdata = cdata;
            block.data = Some(Arc::new(slab));
            block.flags.remove(BlockFlags::IS_LOADING);
        }

        if let Err(error) = fill {
            // undo the allocation and leave the block as it was
            let blist_id = state.block_at(owner).unwrap().blist;

            match blist_id {
                None => {
                    let abytes = {
                        let block = state.block_at_mut(owner).unwrap();
                        block.data = None;
                        block.abytes
                    };
                    state.track_free(abytes);
                },

                Some(id) => {
                    // park the slab back on its blist
                    let slab = {
                        let block = state.block_at_mut(owner).unwrap();
                        block.blist = None;
                        block.data.take().and_then(|arc| Arc::try_unwrap(arc).ok())
                    };

                    let (sid, plane, _) = owner;
                    if let Some(plane_state) = state.stores[sid].as_mut()
                        .and_then(|store| store.planes[plane].as_mut())
                    {
                        if let Some(blist) = plane_state.blists.iter_mut().find(|blist| blist.id == id) {
                            blist.block = None;
                            blist.slab = slab;
                        }
                    }
                },
            }

            self.shared.load_done.notify_all();
            return Err(abort(&mut state, error));
        }

        if state.block_at(owner).unwrap().refcount > 1 {
            // someone else cares that we got this
            self.shared.load_done.notify_all();
        }

        Self::repatriate_blist(&mut state, owner, plane);
        Ok(state)
    }

    /// If the block's blist drifted to the global list, take it back into
    /// the plane's local list.
    fn repatriate_blist(state: &mut Shared, owner: (StoreId, usize, usize), plane: usize) {
        let (sid, ..) = owner;

        let blist_id = match state.block_at(owner).and_then(|block| block.blist) {
            Some(id) => id,
            None => return,
        };

        if let Some(index) = state.global_blists.iter().position(|blist| blist.id == blist_id) {
            let blist = state.global_blists.remove(index);

            if let Some(plane_state) = state.stores[sid].as_mut()
                .and_then(|store| store.planes[plane].as_mut())
            {
                plane_state.blists.push(blist);
            }
        }
    }

    /// Purge one block: uniform detection first, then compression or a
    /// disk spill depending on the store action. Returns how many blocks
    /// were reclaimed (0 or 1).
    fn purge_block_locked(
        &self, state: &mut Shared, owner: (StoreId, usize, usize), from_blist: bool,
    ) -> Result<usize> {
        let sid = owner.0;
        let (bpp, action, can_disk) = {
            let store = state.stores[sid].as_ref().unwrap();
            (store.geometry.bpp, store.action, can_write_to_disk(store))
        };

        {
            let block = match state.block_at(owner) { Some(block) => block, None => return Ok(0) };

            if block.storage != BlockStorage::Memory
                || block.compression != BlockCompression::None
            { return Ok(0); }
        }

        // uniform data beats every other storage form
        let has_blist = state.block_at(owner).unwrap().blist.is_some();
        if state.block_at_mut(owner).unwrap().uniform_check(bpp, false) {
            if !has_blist {
                let abytes = {
                    let block = state.block_at_mut(owner).unwrap();
                    let arc = block.data.take();
                    match arc.map(Arc::try_unwrap) {
                        Some(Ok(_)) => block.abytes,
                        Some(Err(arc)) => { block.data = Some(arc); 0 },
                        None => 0,
                    }
                };
                state.track_free(abytes);
            }

            return Ok(1);
        }

        if action == StoreAction::Compression {
            let purged = self.compress_block_locked(state, owner, bpp)?;

            let encoded = state.block_at(owner).unwrap().compression.is_encoded();
            if from_blist && !encoded && can_disk {
                // the blist deserves one more chance to become reusable
                return Ok(purged + self.spill_block_locked(state, owner, false)?);
            }

            Ok(purged)
        }
        else {
            self.spill_block_locked(state, owner, !has_blist)
        }
    }

    /// Convert a block to its compressed form in memory.
    fn compress_block_locked(
        &self, state: &mut Shared, owner: (StoreId, usize, usize), bpp: usize,
    ) -> Result<usize> {
        let sid = owner.0;

        let compressed = {
            let block = state.block_at(owner).unwrap();
            debug_assert!(block.cdata.is_none());

            if block.tbytes < MIN_COMPRESSION_SIZE { None }
            else {
                let data = block.data.as_ref().ok_or(Error::Internal("compressing block without data"))?;
                compress_block(bpp, &data[.. block.tbytes], compression_cap(block.tbytes))
            }
        };

        let copy_fallback = {
            let block = state.block_at(owner).unwrap();
            compressed.is_none()
                && (block.blist.is_some() || block.tbytes <= compression_cap(block.abytes))
        };

        let outcome = match compressed {
            Some(outcome) => Some(outcome),
            None if copy_fallback => {
                let block = state.block_at(owner).unwrap();
                let data = block.data.as_ref().ok_or(Error::Internal("copying block without data"))?;
                Some((BlockCompression::Copy, data[.. block.tbytes].to_vec()))
            },
            None => {
                state.block_at_mut(owner).unwrap().compression = BlockCompression::TooBig;
                return Ok(0);
            },
        };

        let (method, bytes) = outcome.unwrap();

        if !state.track_alloc(bytes.len(), AllocCost::Easy) {
            state.block_at_mut(owner).unwrap().compression = BlockCompression::Failed;
            return Err(Error::OutOfMemory);
        }

        {
            let block = state.block_at_mut(owner).unwrap();
            block.compression = method;
            block.cdata = Some(bytes);
        }

        self.uncount_block(state, sid, owner);

        // without a blist the plain data can be freed immediately
        if state.block_at(owner).unwrap().blist.is_none() {
            let freed = {
                let block = state.block_at_mut(owner).unwrap();
                let arc = block.data.take();
                match arc.map(Arc::try_unwrap) {
                    Some(Ok(_)) => block.abytes,
                    Some(Err(arc)) => { block.data = Some(arc); 0 },
                    None => 0,
                }
            };
            state.track_free(freed);
        }

        Ok(1)
    }

    /// Write a block to a spill file.
    fn spill_block_locked(
        &self, state: &mut Shared, owner: (StoreId, usize, usize), free_data: bool,
    ) -> Result<usize> {
        let sid = owner.0;

        let encoded = state.block_at(owner).unwrap().compression.is_encoded();

        let address = {
            let block = state.block_at(owner).unwrap();
            debug_assert!(block.spill.is_none(), "block spilled twice");

            if encoded {
                let cdata = block.cdata.as_ref().ok_or(Error::Internal("spilling block without data"))?;
                self.shared.spill.write_block(cdata)?
            } else {
                let data = block.data.as_ref().ok_or(Error::Internal("spilling block without data"))?;
                self.shared.spill.write_block(&data[.. block.tbytes])?
            }
        };

        {
            let block = state.block_at_mut(owner).unwrap();
            block.spill = Some(address);
            block.storage = BlockStorage::Disk;
        }

        if !encoded {
            self.uncount_block(state, sid, owner);
        }

        if free_data {
            debug_assert!(state.block_at(owner).unwrap().blist.is_none());

            let freed = {
                let block = state.block_at_mut(owner).unwrap();

                if encoded {
                    // the spill address remembers the compressed length,
                    // so the bytes themselves can go
                    block.cdata.take().map_or(0, |cdata| cdata.len())
                }
                else {
                    match block.data.take().map(Arc::try_unwrap) {
                        Some(Ok(_)) => block.abytes,
                        Some(Err(arc)) => { block.data = Some(arc); 0 },
                        None => 0,
                    }
                }
            };

            state.track_free(freed);
        }

        Ok(1)
    }

    fn uncount_block(&self, state: &mut Shared, sid: StoreId, owner: (StoreId, usize, usize)) {
        let abytes = state.block_at(owner).map_or(0, |block| block.abytes);
        let store = state.stores[sid].as_mut().unwrap();

        if abytes == BLOCK_DEFAULT_SIZE { store.stdblocks = store.stdblocks.saturating_sub(1); }
        else { store.extblocks = store.extblocks.saturating_sub(abytes); }
    }

    /// Purge every eligible block in one row of blocks of one plane.
    /// Honors the horizontal flip by purging columns in reverse so disk
    /// layout matches later read order.
    fn purge_row_locked(&self, state: &mut Shared, plane: usize, by: usize) -> Result<usize> {
        let sid = self.sid;
        let (xblock, flipped, action, open) = {
            let store = state.stores[sid].as_ref().unwrap();
            (
                store.geometry.xblock,
                store.flags.contains(StoreFlags::XFLIP),
                store.action,
                store.open_for_writing,
            )
        };

        let columns: Vec<usize> = if flipped { (0 .. xblock).rev().collect() }
            else { (0 .. xblock).collect() };

        let mut purged = 0;
        let mut row_complete = true;

        for bx in columns {
            let bb = bx + by * xblock;
            let owner = (sid, plane, bb);

            let eligible = match state.block_at(owner) {
                None => continue,
                Some(block) => {
                    if !block.is_complete() || block.storage == BlockStorage::None {
                        if open { row_complete = false; }
                        false
                    }
                    else {
                        block.storage == BlockStorage::Memory && block.refcount == 0
                    }
                }
            };

            if eligible {
                purged += self.purge_block_locked(state, owner, false)?;
            }
        }

        if row_complete {
            if let Some(plane_state) = state.stores[sid].as_mut().unwrap().planes[plane].as_mut() {
                if action == StoreAction::Compression { plane_state.y_compressed += 1; }
                else { plane_state.y_purged += 1; }
            }
        }

        if purged > 0 {
            // freed memory may unblock a loader waiting for a slab
            self.shared.slab_freed.notify_all();
        }

        Ok(purged)
    }

    /// Purge the first row that still has something to reclaim.
    fn purge_one_locked(&self, state: &mut Shared) -> Result<usize> {
        let sid = self.sid;
        let (nplanes, yblock) = {
            let store = state.stores[sid].as_ref().unwrap();
            (store.planes.len(), store.geometry.yblock)
        };

        for plane in 0 .. nplanes {
            if state.stores[sid].as_ref().unwrap().planes[plane].is_none() { continue; }

            for by in 0 .. yblock {
                let purged = self.purge_row_locked(state, plane, by)?;
                if purged > 0 { return Ok(purged); }
            }
        }

        Ok(0)
    }

    /// Purge one row of one plane now.
    pub fn purge_row(&self, plane: usize, by: usize) -> Result<usize> {
        let mut state = self.shared.lock();
        self.purge_row_locked(&mut state, plane, by)
    }

    /// Purge everything purgeable.
    pub fn purge(&self) -> Result<usize> {
        let mut state = self.shared.lock();
        let sid = self.sid;

        let (nplanes, yblock) = {
            let store = state.stores[sid].as_ref().unwrap();
            (store.planes.len(), store.geometry.yblock)
        };

        let mut purged = 0;
        for plane in 0 .. nplanes {
            if state.stores[sid].as_ref().unwrap().planes[plane].is_none() { continue; }

            for by in 0 .. yblock {
                purged += self.purge_row_locked(&mut state, plane, by)?;
            }

            if log::log_enabled!(log::Level::Debug) {
                log::debug!(
                    "store {} plane {} after purge:\n{}",
                    sid, plane, Self::plane_report_locked(&state, sid, plane),
                );
            }
        }

        Ok(purged)
    }

    /// Dispose of one block for good: free or donate its memory and mark
    /// it gone. With `trim_column`, the slab migrates to the global pool;
    /// otherwise it stays local for subsequent rows.
    fn trim_block_locked(&self, state: &mut Shared, plane: usize, bb: usize, trim_column: bool) -> bool {
        let sid = self.sid;
        let owner = (sid, plane, bb);

        {
            let block = match state.block_at(owner) { Some(block) => block, None => return false };
            if block.flags.contains(BlockFlags::NO_LONGER_NEEDED) { return false; }

            // a reader or loader still owns the data; trimming now would
            // rip the slab out from under it
            if block.refcount > 0 || block.flags.contains(BlockFlags::IS_LOADING) {
                return false;
            }
        }

        let blist_id = state.block_at(owner).unwrap().blist;

        match blist_id {
            None => {
                let freed = {
                    let block = state.block_at_mut(owner).unwrap();
                    match block.data.take().map(Arc::try_unwrap) {
                        Some(Ok(_)) => block.abytes,
                        Some(Err(arc)) => { block.data = Some(arc); 0 },
                        None => 0,
                    }
                };
                state.track_free(freed);
            },

            Some(id) => {
                // the slab follows the blist
                let in_global = state.global_blists.iter().any(|blist| blist.id == id);

                let slab = {
                    let block = state.block_at_mut(owner).unwrap();
                    block.data.take().and_then(|arc| Arc::try_unwrap(arc).ok())
                };

                let plane_list = state.stores[sid].as_mut().unwrap().planes[plane].as_mut();
                let local_index = plane_list.and_then(|plane_state|
                    plane_state.blists.iter().position(|blist| blist.id == id));

                if in_global {
                    if let Some(blist) = state.global_blists.iter_mut().find(|blist| blist.id == id) {
                        blist.block = None;
                        blist.slab = slab;
                    }
                }
                else if let Some(index) = local_index {
                    let plane_state = state.stores[sid].as_mut().unwrap().planes[plane].as_mut().unwrap();

                    if trim_column {
                        let mut blist = plane_state.blists.remove(index);
                        blist.block = None;
                        blist.slab = slab;
                        blist.was_global = true;
                        state.global_blists.push(blist);
                    }
                    else {
                        let blist = &mut plane_state.blists[index];
                        blist.block = None;
                        blist.slab = slab;
                    }
                }
            },
        }

        let freed_cdata = {
            let block = state.block_at_mut(owner).unwrap();
            let freed = block.cdata.take().map_or(0, |cdata| cdata.len());

            block.flags.insert(BlockFlags::NO_LONGER_NEEDED);
            block.blist = None;
            block.storage = BlockStorage::None;
            block.compression = BlockCompression::None;
            block.spill = None;
            freed
        };

        state.track_free(freed_cdata);
        true
    }

    /// Dispose of a whole column of blocks in every plane.
    pub fn trim_column(&self, bx: usize) {
        let mut state = self.shared.lock();
        let (nplanes, xblock, yblock) = {
            let store = state.stores[self.sid].as_ref().unwrap();
            (store.planes.len(), store.geometry.xblock, store.geometry.yblock)
        };

        for plane in 0 .. nplanes {
            if state.stores[self.sid].as_ref().unwrap().planes[plane].is_none() { continue; }

            for by in 0 .. yblock {
                self.trim_block_locked(&mut state, plane, bx + by * xblock, true);
            }
        }
    }

    /// Dispose of a whole row of blocks in every plane.
    pub fn trim_row(&self, by: usize) {
        let mut state = self.shared.lock();
        let (nplanes, xblock) = {
            let store = state.stores[self.sid].as_ref().unwrap();
            (store.planes.len(), store.geometry.xblock)
        };

        for plane in 0 .. nplanes {
            if state.stores[self.sid].as_ref().unwrap().planes[plane].is_none() { continue; }

            for bx in 0 .. xblock {
                self.trim_block_locked(&mut state, plane, bx + by * xblock, false);
            }
        }
    }

    /// Finish a plane whose writes may not have covered every block.
    /// Incomplete blocks are zero-filled and completed; returns whether
    /// any block was incomplete.
    pub fn close_plane(&self, plane: usize) -> Result<bool> {
        let sid = self.sid;
        let mut state = self.shared.lock();

        let geometry = Self::store(&mut state, sid).geometry;
        let nblocks = Self::store(&mut state, sid).nblocks;

        if state.stores[sid].as_ref().unwrap().planes.get(plane).map_or(true, Option::is_none) {
            return Ok(false);
        }

        let mut incomplete = false;

        for bb in 0 .. nblocks {
            let owner = (sid, plane, bb);

            let needs_finishing = match state.block_at(owner) {
                None => continue,
                Some(block) => !block.is_complete(),
            };

            if !needs_finishing { continue; }
            incomplete = true;

            let has_data = state.block_at(owner).unwrap().data.is_some();

            if has_data {
                {
                    // image adjustment may look at the whole block and cannot
                    // know what is uninitialised, so zero the remainder
                    let block = state.block_at_mut(owner).unwrap();
                    let (sbytes, tbytes) = (block.sbytes, block.tbytes);
                    let data = block.data.as_mut().unwrap();

                    if let Some(data) = Arc::get_mut(data) {
                        for byte in &mut data[sbytes .. tbytes] { *byte = 0; }
                    }
                }

                if geometry.xyswap {
                    let mut swap = Self::store(&mut state, sid).swapmem.take()
                        .ok_or(Error::Internal("transposed store lost its swap buffer"))?;

                    let block = state.block_at_mut(owner).unwrap();
                    block.sbytes = block.rbytes; // pretend the write finished
                    let result = block::transpose(block, &mut swap, geometry.bpp);
                    Self::store(&mut state, sid).swapmem = Some(swap);
                    result?;
                }

                {
                    let block = state.block_at_mut(owner).unwrap();
                    block.flags.insert(BlockFlags::WRITE_COMPLETE);
                    block.sbytes = block.tbytes;
                }

                let by = bb / geometry.xblock;
                self.set_row_repeats_locked(&mut state, plane, bb, by * geometry.block_height);

                let store = Self::store(&mut state, sid);
                if store.action == StoreAction::None { store.action = StoreAction::Compression; }
            }
            else {
                // striping might leave blocks without data
                state.block_at_mut(owner).unwrap().flags.insert(BlockFlags::WRITE_COMPLETE);
            }
        }

        // make the blist-held blocks of this plane reusable
        let blist_blocks: Vec<usize> = state.stores[sid].as_ref().unwrap()
            .planes[plane].as_ref().unwrap()
            .blists.iter().filter_map(|blist| blist.block.map(|owner| owner.2))
            .collect();

        for bb in blist_blocks {
            let owner = (sid, plane, bb);
            let eligible = state.block_at(owner).map_or(false, |block|
                block.is_complete()
                    && block.refcount == 0
                    && block.storage == BlockStorage::Memory
                    && block.compression == BlockCompression::None);

            if eligible {
                self.purge_block_locked(&mut state, owner, true)?;
            }
        }

        Self::store(&mut state, sid).open_for_writing = false;
        Ok(incomplete)
    }

    /// Reset one block of a recycled store for rewriting.
    pub fn reopen_block(&self, plane: usize, bx: usize, by: usize) -> UnitResult {
        let mut state = self.shared.lock();
        let xblock = Self::store(&mut state, self.sid).geometry.xblock;

        let block = state.block_at_mut((self.sid, plane, bx + by * xblock))
            .ok_or(Error::NotFound)?;

        block.reopen();
        Self::store(&mut state, self.sid).open_for_writing = true;
        Ok(())
    }

    /// Whether the given raster row repeats the one above it.
    /// Always false when tracking is off.
    pub fn row_is_repeat(&self, y: usize) -> bool {
        let state = self.shared.lock();
        let store = state.stores[self.sid].as_ref().unwrap();

        match &store.row_repeats {
            Some(bits) if y < store.geometry.height => get_bit(bits, y),
            _ => false,
        }
    }

    /// Bytes of plain block memory this store currently accounts for.
    pub fn bytes_in_memory(&self) -> usize {
        let state = self.shared.lock();
        let store = state.stores[self.sid].as_ref().unwrap();
        store.stdblocks * BLOCK_DEFAULT_SIZE + store.extblocks
    }

    /// One line per block row, one storage character per block.
    pub fn plane_report(&self, plane: usize) -> String {
        let state = self.shared.lock();
        Self::plane_report_locked(&state, self.sid, plane)
    }

    fn plane_report_locked(state: &Shared, sid: StoreId, plane: usize) -> String {
        let store = state.stores[sid].as_ref().unwrap();

        let plane_state = match store.planes.get(plane).and_then(Option::as_ref) {
            Some(plane) => plane,
            None => return String::new(),
        };

        let mut report = String::new();
        for by in 0 .. store.geometry.yblock {
            for bx in 0 .. store.geometry.xblock {
                let character = plane_state.blocks[bx + by * store.geometry.xblock].as_ref()
                    .map_or('.', Block::storage_char);
                report.push(character);
            }
            report.push('\n');
        }

        report
    }
}

impl Drop for ImageStore {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let sid = self.sid;

        let nplanes = match state.stores.get(sid).and_then(Option::as_ref) {
            Some(store) => store.planes.len(),
            None => return,
        };

        for plane in 0 .. nplanes {
            if state.stores[sid].as_ref().unwrap().planes[plane].is_none() { continue; }

            // the plane's pooled slabs outlive the store on the global list
            state.release_plane_blists(sid, plane);

            // everything else is freed
            let nblocks = state.stores[sid].as_ref().unwrap().nblocks;
            for bb in 0 .. nblocks {
                let owner = (sid, plane, bb);

                let freed = match state.block_at_mut(owner) {
                    None => 0,
                    Some(block) => {
                        let mut freed = block.cdata.take().map_or(0, |cdata| cdata.len());

                        if block.blist.is_none() {
                            freed += match block.data.take().map(Arc::try_unwrap) {
                                Some(Ok(slab)) => slab.len(),
                                Some(Err(arc)) => { block.data = Some(arc); 0 },
                                None => 0,
                            };
                        }

                        freed
                    }
                };

                state.track_free(freed);
            }
        }

        state.stores[sid] = None;
        drop(state);
        self.shared.slab_freed.notify_all();
    }
}


fn can_write_to_disk(store: &StoreState) -> bool {
    store.stdblocks * BLOCK_DEFAULT_SIZE + store.extblocks >= DISK_THRESHOLD_BYTES
}

/// Put a found slab into a block, restoring the block/blist linkage.
fn attach_slab(state: &mut Shared, owner: (StoreId, usize, usize), mut blist: Blist, preserve_storage: bool) {
    let (sid, plane, _) = owner;
    let slab = blist.slab.take().expect("found blist must carry its slab");

    {
        let block = state.block_at_mut(owner).expect("attaching slab to missing block");
        debug_assert!(blist.capacity >= block.tbytes, "slab too small for block");

        block.data = Some(Arc::new(slab));
        block.abytes = blist.capacity;
        block.blist = Some(blist.id);

        if !preserve_storage {
            block.storage = BlockStorage::Memory;
        }
    }

    blist.block = Some(owner);

    state.stores[sid].as_mut().expect("store must exist")
        .planes[plane].as_mut().expect("plane must exist")
        .blists.push(blist);
}

fn get_bit(bits: &[u64], index: usize) -> bool {
    bits[index / 64] & (1 << (index % 64)) != 0
}

fn clear_bit(bits: &mut [u64], index: usize) {
    if index / 64 < bits.len() {
        bits[index / 64] &= !(1 << (index % 64));
    }
}

/// Whether two rows differ by at most 64 at every byte position.
fn nearly_same(previous: &[u8], current: &[u8]) -> bool {
    previous.iter().zip(current)
        .all(|(&a, &b)| (i32::from(a) - i32::from(b)).abs() <= 64)
}

impl ImageStore {

    /// Compare neighbouring rows within a freshly completed block and
    /// clear the repeat bit of every row that no longer matches its
    /// predecessor. Uniform blocks repeat by definition and recycled
    /// stores carry their bits over unchanged.
    fn set_row_repeats_locked(&self, state: &mut Shared, plane: usize, bb: usize, y0: usize) {
        let sid = self.sid;
        let owner = (sid, plane, bb);

        let (near, recycled, tracking) = {
            let store = state.stores[sid].as_ref().unwrap();
            (
                store.flags.contains(StoreFlags::ROWREPEATS_NEAR)
                    && !store.flags.contains(StoreFlags::DOWNSAMPLED),
                store.flags.contains(StoreFlags::RECYCLED),
                store.row_repeats.is_some(),
            )
        };

        if !tracking || recycled { return; }

        let (data, ysize, xbytes) = {
            let block = match state.block_at(owner) { Some(block) => block, None => return };
            if block.storage == BlockStorage::UniformVariant { return; }

            let data = match &block.data { Some(data) => data.clone(), None => return };
            (data, block.ysize, block.xbytes)
        };

        let bits = state.stores[sid].as_mut().unwrap().row_repeats.as_mut().unwrap();

        for row in 1 .. ysize {
            let y = y0 + row;
            if !get_bit(bits, y) { continue; }

            let previous = &data[(row - 1) * xbytes ..][.. xbytes];
            let current = &data[row * xbytes ..][.. xbytes];

            let same = if near { nearly_same(previous, current) } else { previous == current };
            if !same { clear_bit(bits, y); }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::MemoryFileSystem;

    fn memory_shared() -> Arc<ImShared> {
        ImShared::new(Arc::new(MemoryFileSystem::new()), None)
    }

    fn ramp_row(y: usize, bytes: usize) -> Vec<u8> {
        (0 .. bytes).map(|x| (x + y) as u8).collect()
    }

    #[test]
    fn write_then_read_back(){
        let shared = memory_shared();
        let descriptor = StoreDescriptor {
            block_width: 64, block_height: 32,
            ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 127, y2: 63 }, 8, 1)
        };

        let store = ImageStore::create(&shared, &descriptor).unwrap();

        for y in 0..64 {
            store.write_line(0, y, &ramp_row(y, 128)).unwrap();
        }

        for &(x, y) in &[(0, 0), (63, 0), (64, 0), (127, 63), (5, 40)] {
            let row = store.read(0, x, y).unwrap();
            assert_eq!(row[0], ((x + y) & 0xff) as u8, "pixel at ({}, {})", x, y);
        }
    }

    #[test]
    fn purge_then_read_back(){
        let shared = memory_shared();
        let descriptor = StoreDescriptor {
            block_width: 64, block_height: 32,
            ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 127, y2: 63 }, 8, 1)
        };

        let store = ImageStore::create(&shared, &descriptor).unwrap();

        for y in 0..64 {
            store.write_line(0, y, &ramp_row(y, 128)).unwrap();
        }

        store.set_action(StoreAction::Compression);
        let purged = store.purge().unwrap();
        assert!(purged > 0, "ramp data must purge");

        for y in 0..64 {
            for x in [0, 63, 64, 127] {
                let row = store.read(0, x, y).unwrap();
                assert_eq!(row[0], ((x + y) & 0xff) as u8, "pixel at ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn uniform_blocks_collapse(){
        let shared = memory_shared();
        let descriptor = StoreDescriptor {
            block_width: 64, block_height: 32,
            ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 63, y2: 31 }, 8, 1)
        };

        let store = ImageStore::create(&shared, &descriptor).unwrap();

        for y in 0..32 {
            store.write_line(0, y, &vec![0x77_u8; 64]).unwrap();
        }

        store.set_action(StoreAction::Compression);
        store.purge().unwrap();

        assert_eq!(store.plane_report(0).trim(), "v");

        let row = store.read(0, 10, 20).unwrap();
        assert_eq!(row[0], 0x77);
        assert_eq!(row.remaining_pixels(), 54);
    }

    #[test]
    fn read_pins_block_against_purge(){
        let shared = memory_shared();
        let descriptor = StoreDescriptor {
            block_width: 64, block_height: 32,
            ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 63, y2: 31 }, 8, 1)
        };

        let store = ImageStore::create(&shared, &descriptor).unwrap();
        for y in 0..32 {
            store.write_line(0, y, &ramp_row(y, 64)).unwrap();
        }

        store.set_action(StoreAction::Compression);

        let pinned = store.read(0, 0, 0).unwrap();
        assert_eq!(store.purge().unwrap(), 0, "pinned block must not purge");
        drop(pinned);

        assert!(store.purge().unwrap() > 0);
    }
}
