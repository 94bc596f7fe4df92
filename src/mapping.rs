//! File/Mapping component (§4.A): maps a database file read-only, exposes
//! per-page byte access, and appends writes at a known offset.
//!
//! The mapping itself never decrypts or validates anything beyond "is this
//! range in bounds" — that's left to an opaque [`PageSource`]/[`PageSink`]
//! layer so an encrypted mapping can slot in without this module knowing
//! about it.

use std::fs::File;
use std::ops::Deref;

use memmap2::{MmapMut, MmapOptions, MmapRaw, RemapOptions};

use crate::error::AllocError;

/// Read-only access to database pages, independent of how they're actually
/// stored (plain mmap today; an encrypted mapping could implement this same
/// trait without anything downstream noticing).
pub trait PageSource: Send + Sync {
    /// Total number of bytes currently visible through this source.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow a byte range. Fails if the range is out of bounds or (for an
    /// encrypted mapping) fails decryption/authentication on first touch.
    fn page(&self, offset: usize, len: usize) -> Result<&[u8], AllocError>;
}

/// Read-write access to database pages.
pub trait PageSink: PageSource {
    fn page_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], AllocError>;
}

/// A boxed, type-erased [`PageSource`]. Mirrors the "opaque wrapper around a
/// trait object" shape used for read-only page views.
pub struct Block(Box<dyn PageSource>);

impl Block {
    pub fn new(inner: Box<dyn PageSource>) -> Self {
        Self(inner)
    }
}

impl Deref for Block {
    type Target = dyn PageSource;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// A boxed, type-erased [`PageSink`].
pub struct OwnedBlock(Box<dyn PageSink>);

impl OwnedBlock {
    pub fn new(inner: Box<dyn PageSink>) -> Self {
        Self(inner)
    }
}

impl Deref for OwnedBlock {
    type Target = dyn PageSink;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

pub(crate) enum ExpandMapping {
    ReplacedLastMap(&'static mut [u8]),
    NewMap(&'static mut [u8]),
}

/// Tracks every memory map backing a database, plus the optional file behind
/// them. A database's logical address space may span more than one mapping
/// once it has grown past its initial allocation.
pub(crate) struct Mapping {
    maps: Vec<MmapRaw>,
    file: Option<File>,
}

impl Mapping {
    /// Initialize with a single memory map and an optional backing file.
    pub fn init(map: MmapRaw, file: Option<File>) -> Self {
        Self {
            maps: vec![map],
            file,
        }
    }

    pub fn is_anon(&self) -> bool {
        self.file.is_none()
    }

    /// Extract raw slices pointing at the memory maps, with unbounded
    /// lifetimes.
    ///
    /// # Safety
    ///
    /// The caller must ensure these references are dropped before the
    /// mapping itself is, and never hand them out as truly `'static` to code
    /// that doesn't uphold the same condition.
    pub unsafe fn get_maps(&self) -> Vec<&'static [u8]> {
        self.maps
            .iter()
            .map(|m| {
                let len = m.len();
                let ptr = m.as_ptr();
                std::slice::from_raw_parts(ptr, len)
            })
            .collect()
    }

    /// Grow the backing storage, either by growing the file and remapping it
    /// (file-backed) or by allocating a new anonymous map.
    pub unsafe fn expand(&mut self, new_alloc: usize) -> Result<ExpandMapping, AllocError> {
        if let Some(file) = self.file.as_ref() {
            let current_size = file.metadata().map_err(AllocError::Open)?.len();
            file.set_len(current_size + new_alloc as u64)
                .map_err(|e| AllocError::ResizeFailed {
                    size: current_size as usize,
                    requested: current_size as usize + new_alloc,
                    source: e,
                })?;
            file.sync_all().map_err(AllocError::Sync)?;

            #[cfg(target_os = "linux")]
            {
                let map = self.maps.last_mut().unwrap_unchecked();
                let new_size = map.len() + new_alloc;
                if map
                    .remap(new_size, RemapOptions::new().may_move(false))
                    .is_ok()
                {
                    let slice = std::slice::from_raw_parts_mut(map.as_mut_ptr(), map.len());
                    return Ok(ExpandMapping::ReplacedLastMap(slice));
                }
            }

            let map = MmapOptions::new()
                .offset(current_size)
                .len(new_alloc)
                .map_raw(file)
                .map_err(|e| AllocError::AllocFailed {
                    requested: new_alloc,
                    source: e,
                })?;
            let ret = std::slice::from_raw_parts_mut(map.as_mut_ptr(), new_alloc);
            self.maps.push(map);
            Ok(ExpandMapping::NewMap(ret))
        } else {
            #[cfg(target_os = "linux")]
            {
                let map = self.maps.last_mut().unwrap_unchecked();
                let new_size = map.len() + new_alloc;
                if map
                    .remap(new_size, RemapOptions::new().may_move(false))
                    .is_ok()
                {
                    let slice = std::slice::from_raw_parts_mut(map.as_mut_ptr(), map.len());
                    return Ok(ExpandMapping::ReplacedLastMap(slice));
                }
            }

            let map = MmapRaw::from(MmapMut::map_anon(new_alloc).map_err(|e| {
                AllocError::AllocFailed {
                    requested: new_alloc,
                    source: e,
                }
            })?);
            let ret = std::slice::from_raw_parts_mut(map.as_mut_ptr(), new_alloc);
            self.maps.push(map);
            Ok(ExpandMapping::NewMap(ret))
        }
    }

    /// Flush every map to the backing file. A no-op for anonymous maps.
    pub fn flush(&self) -> Result<(), AllocError> {
        if self.file.is_none() {
            return Ok(());
        }
        for map in self.maps.iter() {
            map.flush().map_err(AllocError::Sync)?;
        }
        Ok(())
    }

    /// Overwrite `[offset, offset+bytes.len())` in place. Used to patch
    /// reclaimed free-list space directly rather than appending at the tail.
    /// Errors if the range crosses a map boundary.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<(), AllocError> {
        let mut start = 0;
        for map in self.maps.iter() {
            let end = start + map.len();
            if offset < end {
                if offset + bytes.len() > end {
                    return Err(AllocError::Other("patch write crosses a memory map boundary"));
                }
                unsafe {
                    let dst = map.as_mut_ptr().add(offset - start);
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                }
                return Ok(());
            }
            start = end;
        }
        Err(AllocError::Other("patch write outside of mapped storage"))
    }

    /// Flush just the byte range `[offset, offset+len)`. Errors if the range
    /// crosses a map boundary.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<(), AllocError> {
        if self.file.is_none() {
            return Ok(());
        }
        let mut start = 0;
        for map in self.maps.iter() {
            let end = start + map.len();
            if offset < end {
                if offset + len > end {
                    return Err(AllocError::Other(
                        "flush range crosses a memory map boundary",
                    ));
                }
                map.flush_range(offset - start, len)
                    .map_err(AllocError::Sync)?;
                return Ok(());
            }
            start = end;
        }
        Err(AllocError::Other("flush range outside of mapped storage"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_mapping_reports_length() {
        let map = MmapRaw::from(MmapMut::map_anon(4096).unwrap());
        let mapping = Mapping::init(map, None);
        assert!(mapping.is_anon());
        let maps = unsafe { mapping.get_maps() };
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].len(), 4096);
    }
}
