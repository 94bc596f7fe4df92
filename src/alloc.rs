//! The slab allocator (§4.B): translates refs into memory addresses, hands
//! out/reclaims transient nodes, and folds live slab content into a compact
//! file-tail image at commit.

use std::collections::HashMap;

use crate::error::AllocError;
use crate::node::{decode_node_values, encode_node_bytes};
use crate::Ref;

/// Smallest slab size requested when the free list can't satisfy an
/// allocation. Chosen to keep small databases from fragmenting into many
/// tiny slabs; rounded to a multiple of the host page size so a slab is
/// always a whole number of pages (slabs are process-local scratch, never
/// part of the on-disk layout, so this is free to pick per-host).
fn min_slab_size() -> usize {
    let page = page_size::get().max(1);
    let min = 64 * 1024;
    (min + page - 1) / page * page
}

struct Slab {
    logical_start: u64,
    data: Box<[u8]>,
}

#[derive(Clone, Copy)]
struct FreeBlock {
    start: u64,
    len: usize,
}

/// A read-only node freed during a write transaction. It can't be reused
/// until no live reader's snapshot predates `freed_at_version`.
#[derive(Clone, Copy)]
struct ReadOnlyFree {
    start: u64,
    len: usize,
    freed_at_version: u64,
}

/// Owns the baseline pointer, the slab list, and both free lists. Lifetime
/// spans one open database (or one write transaction's scratch state,
/// reset after each commit/rollback).
pub struct Allocator {
    /// Upper bound (exclusive) of the read-only, file-backed ref range. The
    /// sum of every attached map's length.
    baseline: u64,
    /// Read-only maps backing `[0, baseline)`, as `(pointer, len)` pairs in
    /// address order. A database that has grown past its first mmap spans
    /// more than one entry; a ref is resolved by walking these with a
    /// cumulative offset rather than assuming one contiguous region (see
    /// `Mapping::write_at`, which resolves file offsets the same way).
    read_only_maps: Vec<(*const u8, usize)>,
    slabs: Vec<Slab>,
    writable_free_list: Vec<FreeBlock>,
    read_only_free_list: Vec<ReadOnlyFree>,
    current_version: u64,
    /// Reuse floor for `read_only_free_list`: a block is only handed back
    /// out by `alloc()` once every live reader's snapshot is at or past the
    /// version that freed it. `None` (no active readers) permits reusing
    /// anything.
    reader_floor: Option<u64>,
}

// Slabs and the read-only mapping are only ever accessed behind translate(),
// which upholds the same aliasing discipline as the node array code that
// calls it; the allocator itself is not `Sync`, matching its single-writer
// contract.
unsafe impl Send for Allocator {}

impl Allocator {
    /// Construct an allocator with no file behind it (anonymous database).
    pub fn new_anon() -> Self {
        Self {
            baseline: 0,
            read_only_maps: Vec::new(),
            slabs: Vec::new(),
            writable_free_list: Vec::new(),
            read_only_free_list: Vec::new(),
            current_version: 0,
            reader_floor: None,
        }
    }

    /// Attach to the read-only maps backing committed storage, in address
    /// order. The baseline is derived as the sum of every map's length, so
    /// a ref just below it may land in any of them, not just the first.
    ///
    /// # Safety
    ///
    /// Every map in `maps` must remain valid (i.e. the mapping must stay
    /// alive) for as long as this allocator is used to translate refs below
    /// `baseline`.
    pub unsafe fn attach_mapping(&mut self, maps: &[&[u8]]) {
        self.read_only_maps = maps.iter().map(|m| (m.as_ptr(), m.len())).collect();
        self.baseline = maps.iter().map(|m| m.len() as u64).sum();
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    pub fn set_version(&mut self, version: u64) {
        self.current_version = version;
    }

    /// Set the oldest live reader's snapshot version (`None` if no reader is
    /// currently attached), gating which `read_only_free_list` entries
    /// `alloc()` is allowed to hand back out.
    pub fn set_reader_floor(&mut self, oldest_active: Option<u64>) {
        self.reader_floor = oldest_active;
    }

    /// Replace the read-only free list wholesale, e.g. with the set loaded
    /// from the `Group`'s free-list node arrays at the start of a
    /// transaction.
    pub fn load_free_list(&mut self, entries: Vec<(u64, usize, u64)>) {
        self.read_only_free_list = entries
            .into_iter()
            .map(|(start, len, freed_at_version)| ReadOnlyFree { start, len, freed_at_version })
            .collect();
    }

    /// The current read-only free list, as `(start, len, freed_at_version)`
    /// triples, for serializing back into the `Group`'s free-list arrays at
    /// commit. Also folds in any still-unclaimed leftover from a reused
    /// block (`alloc()` only hands out the requested prefix of a reclaimed
    /// range; the remainder sits in `writable_free_list` and would
    /// otherwise be dropped by `reset_slabs` after the commit).
    pub fn free_list_snapshot(&self) -> Vec<(u64, usize, u64)> {
        let mut out: Vec<_> = self
            .read_only_free_list
            .iter()
            .map(|b| (b.start, b.len, b.freed_at_version))
            .collect();
        for block in &self.writable_free_list {
            if let Some(idx) = self.find_slab(Ref(block.start)) {
                if self.slabs[idx].logical_start < self.baseline {
                    out.push((block.start, block.len, self.current_version));
                }
            }
        }
        out
    }

    /// Discard all slab-resident scratch state. Used by `rollback` and after
    /// a successful commit. Safe to drop unconditionally: the persisted free
    /// list a future transaction loads comes from the `Group`'s on-disk
    /// arrays (via `load_free_list`), not from this in-memory bookkeeping, so
    /// nothing here needs to be handed back on an abandoned transaction.
    pub fn reset_slabs(&mut self) {
        self.slabs.clear();
        self.writable_free_list.clear();
    }

    pub fn is_read_only(&self, r: Ref) -> bool {
        self.find_slab(r).is_none() && r.0 < self.baseline
    }

    fn find_slab(&self, r: Ref) -> Option<usize> {
        self.slabs.iter().position(|s| {
            r.0 >= s.logical_start && r.0 < s.logical_start + s.data.len() as u64
        })
    }

    pub fn translate(&self, r: Ref) -> Result<*const u8, AllocError> {
        if let Some(idx) = self.find_slab(r) {
            let slab = &self.slabs[idx];
            return Ok(unsafe { slab.data.as_ptr().add((r.0 - slab.logical_start) as usize) });
        }
        if r.0 < self.baseline {
            let mut start = 0u64;
            for &(ptr, len) in &self.read_only_maps {
                let end = start + len as u64;
                if r.0 < end {
                    return Ok(unsafe { ptr.add((r.0 - start) as usize) });
                }
                start = end;
            }
            return Err(AllocError::InvalidRef(r));
        }
        Err(AllocError::InvalidRef(r))
    }

    pub fn translate_mut(&mut self, r: Ref) -> Result<*mut u8, AllocError> {
        if let Some(idx) = self.find_slab(r) {
            let slab = &mut self.slabs[idx];
            return Ok(unsafe { slab.data.as_mut_ptr().add((r.0 - slab.logical_start) as usize) });
        }
        if r.0 < self.baseline {
            return Err(AllocError::Other("attempted to write through a read-only ref"));
        }
        Err(AllocError::InvalidRef(r))
    }

    /// Where the next slab grown for genuinely new content should start.
    /// Takes the max over every slab rather than just the last one pushed,
    /// since a reused read-only free block (see `alloc()`) can be pushed at
    /// an address well below the growth frontier.
    fn next_logical_offset(&self) -> u64 {
        self.slabs
            .iter()
            .map(|s| s.logical_start + s.data.len() as u64)
            .max()
            .unwrap_or(self.baseline)
            .max(self.baseline)
    }

    /// Allocate `size` bytes (rounded up to 8), returning the ref to the
    /// start of the region.
    pub fn alloc(&mut self, size: usize) -> Result<Ref, AllocError> {
        let size = (size + 7) & !7;

        if let Some(idx) = self
            .writable_free_list
            .iter()
            .position(|b| b.len >= size)
        {
            let block = self.writable_free_list[idx];
            if block.len == size {
                self.writable_free_list.swap_remove(idx);
            } else {
                self.writable_free_list[idx] = FreeBlock {
                    start: block.start + size as u64,
                    len: block.len - size,
                };
            }
            return Ok(Ref(block.start));
        }

        if let Some(idx) = self.read_only_free_list.iter().position(|b| {
            b.len >= size && self.reader_floor.map_or(true, |floor| b.freed_at_version <= floor)
        }) {
            let block = self.read_only_free_list.swap_remove(idx);
            // Overlay a writable slab on this reclaimed, now-unreachable
            // range of the file's read-only region; `translate`/`translate_mut`
            // check `find_slab` before falling back to baseline, so refs in
            // this range resolve to the overlay for the rest of this
            // transaction instead of the stale committed bytes.
            self.slabs.push(Slab {
                logical_start: block.start,
                data: vec![0u8; block.len].into_boxed_slice(),
            });
            if block.len > size {
                self.writable_free_list.push(FreeBlock {
                    start: block.start + size as u64,
                    len: block.len - size,
                });
            }
            return Ok(Ref(block.start));
        }

        let last_slab_size = self.slabs.last().map(|s| s.data.len()).unwrap_or(0);
        let slab_size = size.max(last_slab_size * 2).max(min_slab_size());
        let logical_start = self.next_logical_offset();
        self.slabs.push(Slab {
            logical_start,
            data: vec![0u8; slab_size].into_boxed_slice(),
        });
        if slab_size > size {
            self.writable_free_list.push(FreeBlock {
                start: logical_start + size as u64,
                len: slab_size - size,
            });
        }
        Ok(Ref(logical_start))
    }

    /// Grow (or shrink) an allocation. Extends in place when the trailing
    /// free list happens to cover the delta; otherwise allocates fresh,
    /// copies, and frees the old region.
    pub fn realloc(&mut self, r: Ref, old_size: usize, new_size: usize) -> Result<Ref, AllocError> {
        let old_size = (old_size + 7) & !7;
        let new_size = (new_size + 7) & !7;
        if new_size <= old_size {
            return Ok(r);
        }
        let delta = new_size - old_size;
        let tail = r.0 + old_size as u64;
        if let Some(idx) = self
            .writable_free_list
            .iter()
            .position(|b| b.start == tail && b.len >= delta)
        {
            let block = self.writable_free_list[idx];
            if block.len == delta {
                self.writable_free_list.swap_remove(idx);
            } else {
                self.writable_free_list[idx] = FreeBlock {
                    start: block.start + delta as u64,
                    len: block.len - delta,
                };
            }
            return Ok(r);
        }

        let new_ref = self.alloc(new_size)?;
        let src = self.translate(r)?;
        let dst = self.translate_mut(new_ref)?;
        unsafe { std::ptr::copy_nonoverlapping(src, dst, old_size) };
        self.free(r, old_size)?;
        Ok(new_ref)
    }

    /// Free a region. Read-only refs are only recorded (tagged with the
    /// current write version); slab-resident regions are merged with
    /// adjacent free blocks, but never across a slab boundary or the
    /// baseline.
    pub fn free(&mut self, r: Ref, size: usize) -> Result<(), AllocError> {
        let size = (size + 7) & !7;
        if r.0 < self.baseline && self.find_slab(r).is_none() {
            self.read_only_free_list.push(ReadOnlyFree {
                start: r.0,
                len: size,
                freed_at_version: self.current_version,
            });
            return Ok(());
        }

        let slab_idx = self.find_slab(r).ok_or(AllocError::UnownedFree(r))?;
        let slab_start = self.slabs[slab_idx].logical_start;
        let slab_end = slab_start + self.slabs[slab_idx].data.len() as u64;

        let mut start = r.0;
        let mut len = size;

        // Merge with a block immediately before us, within the same slab.
        if let Some(idx) = self.writable_free_list.iter().position(|b| {
            b.start + b.len as u64 == start && b.start >= slab_start && b.start < slab_end
        }) {
            let block = self.writable_free_list.swap_remove(idx);
            start = block.start;
            len += block.len;
        }
        // Merge with a block immediately after us, within the same slab.
        if let Some(idx) = self.writable_free_list.iter().position(|b| {
            start + len as u64 == b.start && b.start >= slab_start && b.start < slab_end
        }) {
            let block = self.writable_free_list.swap_remove(idx);
            len += block.len;
        }

        self.writable_free_list.push(FreeBlock { start, len });
        Ok(())
    }

    /// Walk every node reachable from `top`, writing any slab-resident node
    /// into `out` (appended at the file tail) or `patches` (written in place
    /// at its own already-reserved file offset, for a node whose ref was
    /// handed out by `alloc()` reusing a reclaimed free block — see
    /// `alloc()`), with child ref fields patched to whichever new offset
    /// they were assigned. Nodes already durable in the read-only region,
    /// untouched this transaction, are left alone. Returns the new top ref.
    pub fn write_and_commit(
        &mut self,
        top: Ref,
        out: &mut Vec<u8>,
        patches: &mut Vec<(u64, Vec<u8>)>,
    ) -> Result<Ref, AllocError> {
        let mut remap: HashMap<u64, u64> = HashMap::new();
        self.write_node_rec(top, out, patches, &mut remap)
    }

    fn write_node_rec(
        &mut self,
        r: Ref,
        out: &mut Vec<u8>,
        patches: &mut Vec<(u64, Vec<u8>)>,
        remap: &mut HashMap<u64, u64>,
    ) -> Result<Ref, AllocError> {
        if r.0 < self.baseline && self.find_slab(r).is_none() {
            return Ok(r);
        }
        if let Some(&new_ref) = remap.get(&r.0) {
            return Ok(Ref(new_ref));
        }

        let (is_inner, has_refs, context_flag, mut values) = decode_node_values(self, r)
            .map_err(|e| match e {
                crate::error::NodeError::Alloc(a) => a,
                _ => AllocError::Other("node corrupted during commit walk"),
            })?;

        if has_refs {
            for v in values.iter_mut() {
                if *v != 0 {
                    let child = Ref(*v as u64);
                    let new_child = self.write_node_rec(child, out, patches, remap)?;
                    *v = new_child.0 as i64;
                }
            }
        }

        let bytes = encode_node_bytes(is_inner, has_refs, context_flag, &values);
        let new_offset = if r.0 < self.baseline {
            // Reused free-list space: its file offset was already reserved
            // when `alloc()` handed it out, so patch it in place instead of
            // growing the file.
            patches.push((r.0, bytes));
            r.0
        } else {
            let offset = self.baseline + out.len() as u64;
            out.extend_from_slice(&bytes);
            offset
        };
        remap.insert(r.0, new_offset);
        Ok(Ref(new_offset))
    }

    /// Rewrite every node reachable from `top` into `out`, starting at
    /// offset `out.len()`, regardless of whether it currently lives in the
    /// read-only region or a slab. Unlike `write_and_commit`, which assumes
    /// baseline content is already correctly positioned in the existing
    /// file, this produces a brand-new, fully self-contained image — used by
    /// `SharedGroup::compact`.
    pub fn compact_into(&self, top: Ref, out: &mut Vec<u8>) -> Result<Ref, AllocError> {
        let mut remap: HashMap<u64, u64> = HashMap::new();
        self.compact_node_rec(top, out, &mut remap)
    }

    fn compact_node_rec(
        &self,
        r: Ref,
        out: &mut Vec<u8>,
        remap: &mut HashMap<u64, u64>,
    ) -> Result<Ref, AllocError> {
        if let Some(&new_ref) = remap.get(&r.0) {
            return Ok(Ref(new_ref));
        }

        let (is_inner, has_refs, context_flag, mut values) = decode_node_values(self, r)
            .map_err(|e| match e {
                crate::error::NodeError::Alloc(a) => a,
                _ => AllocError::Other("node corrupted during compaction walk"),
            })?;

        if has_refs {
            for v in values.iter_mut() {
                if *v != 0 {
                    let child = Ref(*v as u64);
                    let new_child = self.compact_node_rec(child, out, remap)?;
                    *v = new_child.0 as i64;
                }
            }
        }

        let bytes = encode_node_bytes(is_inner, has_refs, context_flag, &values);
        let new_offset = out.len() as u64;
        out.extend_from_slice(&bytes);
        remap.insert(r.0, new_offset);
        Ok(Ref(new_offset))
    }

    /// Finish a commit: the file has grown by `appended_len` bytes starting
    /// at the old baseline. Slab scratch state is cleared since everything
    /// live now lives in the (newly extended) read-only region.
    pub fn advance_baseline(&mut self, appended_len: u64) {
        self.baseline += appended_len;
        self.reset_slabs();
    }

    /// Debug-only introspection into the allocator's current bookkeeping,
    /// grounded on the teacher's `#[cfg(debug)] Verify()`/`Print()` methods
    /// on its own slab allocator. A safe, structured report rather than a
    /// print routine, per §9 "assertions vs user errors".
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            slab_count: self.slabs.len(),
            writable_free_bytes: self.writable_free_list.iter().map(|b| b.len).sum(),
            read_only_free_bytes: self.read_only_free_list.iter().map(|b| b.len).sum(),
            largest_writable_free_run: self.writable_free_list.iter().map(|b| b.len).max().unwrap_or(0),
        }
    }
}

/// A snapshot of allocator bookkeeping at a point in time, returned by
/// [`Allocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub slab_count: usize,
    pub writable_free_bytes: usize,
    pub read_only_free_bytes: usize,
    pub largest_writable_free_run: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_eight() {
        let mut alloc = Allocator::new_anon();
        let r1 = alloc.alloc(1).unwrap();
        let r2 = alloc.alloc(1).unwrap();
        assert_eq!(r2.0 - r1.0, 8);
    }

    #[test]
    fn free_then_alloc_reuses_block() {
        let mut alloc = Allocator::new_anon();
        let r1 = alloc.alloc(64).unwrap();
        alloc.free(r1, 64).unwrap();
        let r2 = alloc.alloc(64).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn adjacent_frees_merge() {
        let mut alloc = Allocator::new_anon();
        let r1 = alloc.alloc(64).unwrap();
        let r2 = alloc.alloc(64).unwrap();
        alloc.free(r1, 64).unwrap();
        alloc.free(r2, 64).unwrap();
        let r3 = alloc.alloc(128).unwrap();
        assert_eq!(r3, r1);
    }

    #[test]
    fn stats_report_free_bytes_and_slab_count() {
        let mut alloc = Allocator::new_anon();
        let before = alloc.stats();
        assert_eq!(before.slab_count, 0);
        let r1 = alloc.alloc(64).unwrap();
        let after_alloc = alloc.stats();
        assert_eq!(after_alloc.slab_count, 1);
        alloc.free(r1, 64).unwrap();
        let after_free = alloc.stats();
        assert!(after_free.writable_free_bytes >= 64);
        assert!(after_free.largest_writable_free_run >= 64);
    }

    #[test]
    fn translate_roundtrips_bytes() {
        let mut alloc = Allocator::new_anon();
        let r = alloc.alloc(8).unwrap();
        unsafe {
            let ptr = alloc.translate_mut(r).unwrap();
            *ptr = 0x42;
        }
        let ptr = alloc.translate(r).unwrap();
        assert_eq!(unsafe { *ptr }, 0x42);
    }
}
