
//! The slab pool that circulates block memory between planes and stores.
//!
//! Every pooled slab is tracked by a `Blist`. While a block uses the slab,
//! the block owns the bytes and the blist records the association; when the
//! slab is parked, the blist owns the bytes. A blist lives in exactly one
//! place at a time: a plane's local list, or the process-wide global list
//! that donates memory across stores.

use std::sync::Arc;

use super::{AllocCost, BlistId, Shared, StoreId};
use super::block::BlockStorage;
use super::compress::{compression_cap, compress_block};


/// Bookkeeping for one pooled slab.
#[derive(Debug)]
pub(crate) struct Blist {
    pub id: BlistId,

    /// The bytes, present while no block uses the slab.
    pub slab: Option<Vec<u8>>,

    /// Allocated size of the slab, whoever currently holds the bytes.
    pub capacity: usize,

    /// Column affinity for write-ahead reuse, -1 when indifferent.
    pub bx: isize,

    /// The block currently backed by this slab.
    pub block: Option<(StoreId, usize, usize)>,

    /// Whether this blist has ever been on the global list.
    pub was_global: bool,
}

/// A slab handed out by the pool, ready to attach to a block.
#[derive(Debug)]
pub(crate) struct FoundSlab {
    pub blist: Blist,
}

impl Shared {

    pub(crate) fn new_blist_id(&mut self) -> BlistId {
        self.next_blist_id += 1;
        self.next_blist_id
    }

    /// Take the slab away from a block. Callers decide whether the block
    /// is eligible; this only refuses when a reader still holds the data.
    fn reclaim_slab(&mut self, owner: (StoreId, usize, usize)) -> Option<Vec<u8>> {
        let (sid, plane, bb) = owner;

        let block = self.stores.get_mut(sid)?.as_mut()?
            .planes.get_mut(plane)?.as_mut()?
            .blocks.get_mut(bb)?.as_mut()?;

        if block.refcount > 0 { return None; }

        let arc = block.data.take()?;
        let slab = match Arc::try_unwrap(arc) {
            Ok(slab) => slab,
            Err(arc) => {
                // a reader raced us; put the data back and look elsewhere
                block.data = Some(arc);
                return None;
            }
        };

        block.blist = None;
        if block.storage == BlockStorage::Memory && !block.compression.is_encoded() {
            block.storage = BlockStorage::None;
        }

        Some(slab)
    }

    /// Find a slab of at least `size` bytes for a block of `(sid, plane)`
    /// in column `bx`. Preference order: an unassigned slab of this plane
    /// with matching column, any slab of this store, the global pool, and
    /// in desperate mode the blocks of every other store, compressing a
    /// victim to free its slab.
    pub(crate) fn blist_find(
        &mut self, sid: StoreId, size: usize, plane: usize, bx: isize, desperate: bool,
    ) -> Option<FoundSlab> {

        // this store: unassigned slab in this plane, preferring the column
        if let Some(found) = self.find_in_plane(sid, plane, size, Some(bx))
            .or_else(|| self.find_in_plane(sid, plane, size, None))
        { return Some(found); }

        // this store: any plane, unassigned or attached to a usable block
        let nplanes = self.stores.get(sid)?.as_ref()?.planes.len();
        for other_plane in 0 .. nplanes {
            if let Some(found) = self.find_in_plane(sid, other_plane, size, None) {
                return Some(found);
            }
            if let Some(found) = self.steal_in_plane(sid, other_plane, size) {
                return Some(found);
            }
        }

        // the global pool
        if let Some(found) = self.find_in_global(size) {
            return Some(found);
        }

        if desperate {
            return self.steal_desperately(sid, size);
        }

        None
    }

    /// An unassigned slab from one plane's list.
    fn find_in_plane(
        &mut self, sid: StoreId, plane: usize, size: usize, bx: Option<isize>,
    ) -> Option<FoundSlab> {
        let plane_state = self.stores.get_mut(sid)?.as_mut()?.planes.get_mut(plane)?.as_mut()?;

        let index = plane_state.blists.iter().position(|blist| {
            blist.block.is_none()
                && blist.capacity >= size
                && bx.map_or(true, |bx| blist.bx == bx)
        })?;

        let blist = plane_state.blists.remove(index);
        debug_assert!(blist.slab.is_some(), "unassigned blist lost its slab");
        Some(FoundSlab { blist })
    }

    /// A slab attached to a usable block of one plane's list.
    fn steal_in_plane(&mut self, sid: StoreId, plane: usize, size: usize) -> Option<FoundSlab> {
        let plane_state = self.stores.get(sid)?.as_ref()?.planes.get(plane)?.as_ref()?;

        let candidates: Vec<(usize, (StoreId, usize, usize))> = plane_state.blists.iter().enumerate()
            .filter(|(_, blist)| blist.capacity >= size)
            .filter_map(|(index, blist)| blist.block.map(|owner| (index, owner)))
            .collect();

        for (index, owner) in candidates {
            let usable = self.block_at(owner).map_or(false, |block| block.is_usable());
            if !usable { continue; }

            if let Some(slab) = self.reclaim_slab(owner) {
                let plane_state = self.stores[sid].as_mut()?.planes[plane].as_mut()?;
                let mut blist = plane_state.blists.remove(index);
                blist.slab = Some(slab);
                blist.block = None;
                return Some(FoundSlab { blist });
            }
        }

        None
    }

    /// A slab from the global list, detaching it from a usable block
    /// of whatever store if necessary.
    fn find_in_global(&mut self, size: usize) -> Option<FoundSlab> {
        // parked slabs first
        if let Some(index) = self.global_blists.iter()
            .position(|blist| blist.block.is_none() && blist.capacity >= size)
        {
            let blist = self.global_blists.remove(index);
            return Some(FoundSlab { blist });
        }

        // then slabs still attached to a usable block
        let candidates: Vec<(usize, (StoreId, usize, usize))> = self.global_blists.iter().enumerate()
            .filter(|(_, blist)| blist.capacity >= size)
            .filter_map(|(index, blist)| blist.block.map(|owner| (index, owner)))
            .collect();

        for (index, owner) in candidates {
            let usable = self.block_at(owner).map_or(false, |block| block.is_usable());
            if !usable { continue; }

            if let Some(slab) = self.reclaim_slab(owner) {
                let mut blist = self.global_blists.remove(index);
                blist.slab = Some(slab);
                blist.block = None;
                return Some(FoundSlab { blist });
            }
        }

        None
    }

    /// Last resort: force a complete, unreferenced, still-plain block of any
    /// store to compress, then take its slab.
    fn steal_desperately(&mut self, requesting: StoreId, size: usize) -> Option<FoundSlab> {
        let store_ids: Vec<StoreId> = (0 .. self.stores.len())
            .filter(|&sid| sid != requesting && self.stores[sid].is_some())
            .collect();

        for sid in store_ids {
            let bpp = self.stores[sid].as_ref()?.geometry.bpp;
            let nplanes = self.stores[sid].as_ref()?.planes.len();

            for plane in 0 .. nplanes {
                let candidates: Vec<(usize, BlistId)> = match self.stores[sid].as_ref()?.planes[plane].as_ref() {
                    None => continue,
                    Some(plane_state) => plane_state.blists.iter()
                        .filter(|blist| blist.capacity >= size)
                        .filter_map(|blist| blist.block.map(|owner| (owner.2, blist.id)))
                        .collect(),
                };

                for (bb, blist_id) in candidates {
                    let owner = (sid, plane, bb);

                    // make the victim moveable if it is not already
                    let needs_compression = self.block_at(owner).map_or(false, |block| {
                        block.refcount == 0 && block.is_complete() && !block.is_moveable()
                            && block.storage == BlockStorage::Memory
                            && block.data.is_some()
                    });

                    if needs_compression && !self.compress_victim(owner, bpp) { continue; }

                    let usable = self.block_at(owner).map_or(false, |block| block.is_usable());
                    if !usable { continue; }

                    if let Some(slab) = self.reclaim_slab(owner) {
                        let plane_state = self.stores[sid].as_mut()?.planes[plane].as_mut()?;
                        let index = plane_state.blists.iter().position(|blist| blist.id == blist_id)?;
                        let mut blist = plane_state.blists.remove(index);
                        blist.slab = Some(slab);
                        blist.block = None;

                        log::debug!("desperately stole a {} byte slab from store {}", blist.capacity, sid);
                        return Some(FoundSlab { blist });
                    }
                }
            }
        }

        None
    }

    /// Compress a victim block in place so its slab becomes reclaimable.
    fn compress_victim(&mut self, owner: (StoreId, usize, usize), bpp: usize) -> bool {
        let compressed = {
            let block = match self.block_at(owner) { Some(block) => block, None => return false };
            let data = match &block.data { Some(data) => data, None => return false };
            compress_block(bpp, &data[.. block.tbytes], compression_cap(block.tbytes))
        };

        let (method, bytes) = match compressed { Some(result) => result, None => return false };

        if !self.track_alloc(bytes.len(), AllocCost::Easy) { return false; }

        if let Some(block) = self.block_at_mut(owner) {
            block.compression = method;
            block.cdata = Some(bytes);
            true
        }
        else { false }
    }

    /// Park all of one plane's blists on the global list,
    /// reclaiming slabs from their blocks.
    pub(crate) fn release_plane_blists(&mut self, sid: StoreId, plane: usize) {
        let blists = match self.stores.get_mut(sid).and_then(|store| store.as_mut())
            .and_then(|store| store.planes.get_mut(plane)).and_then(|plane| plane.as_mut())
        {
            Some(plane_state) => std::mem::take(&mut plane_state.blists),
            None => return,
        };

        for mut blist in blists {
            if let Some(owner) = blist.block.take() {
                match self.reclaim_slab(owner) {
                    Some(slab) => blist.slab = Some(slab),
                    None => {
                        // a reader still holds the slab through the block;
                        // forget the blist and let the block free the bytes
                        if let Some(block) = self.block_at_mut(owner) { block.blist = None; }
                        continue;
                    }
                }
            }

            blist.was_global = true;
            self.global_blists.push(blist);
        }
    }
}
