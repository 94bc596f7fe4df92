//! Opaque raw-byte node (§3 `width_scheme = OpaqueBlob`).
//!
//! Backs the packed small-value blob of a string/binary leaf and individual
//! "big blob" values (> 63 bytes), grounded on
//! `examples/original_source/src/tightdb/array_blobs_big.cpp` and
//! `array_string_long.hpp`: short values share one blob node addressed by
//! byte offset, oversized values get their own blob node addressed by ref.
//!
//! Unlike [`crate::node::NodeArray`], a blob node's payload is raw bytes, not
//! a bit-packed integer sequence, so it doesn't go through `Width`/`encode_all`.

use crate::alloc::Allocator;
use crate::error::NodeError;
use crate::node::{NodeHeader, Width, WidthScheme, HEADER_SIZE};
use crate::Ref;

fn node_total_size(payload_bytes: usize) -> usize {
    (HEADER_SIZE + payload_bytes + 7) & !7
}

/// An accessor over a single opaque-byte node.
pub struct BlobNode {
    ref_: Ref,
    header: NodeHeader,
}

impl BlobNode {
    /// Allocate a fresh blob node holding exactly `bytes`.
    pub fn create(alloc: &mut Allocator, bytes: &[u8]) -> Result<Self, NodeError> {
        let total = node_total_size(bytes.len());
        let ref_ = alloc.alloc(total)?;
        let mut header = NodeHeader::new(false, false, false, WidthScheme::OpaqueBlob, Width::W0);
        header.set_size(bytes.len());
        header.set_capacity(total - HEADER_SIZE);
        let mut node = Self { ref_, header };
        node.write_header(alloc)?;
        let ptr = node.payload_ptr(alloc)?;
        unsafe {
            std::ptr::write_bytes(ptr, 0, node.header.capacity());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        Ok(node)
    }

    /// Attach to an existing ref, validating that it is in fact a blob node.
    pub fn from_ref(alloc: &Allocator, ref_: Ref) -> Result<Self, NodeError> {
        let ptr = alloc.translate(ref_)?;
        let header: NodeHeader = unsafe { *(ptr as *const NodeHeader) };
        if header.width_scheme() != WidthScheme::OpaqueBlob {
            return Err(NodeError::DataCorruption("ref does not point at a blob node"));
        }
        if HEADER_SIZE + header.size() > HEADER_SIZE + header.capacity() {
            return Err(NodeError::DataCorruption("blob size exceeds stated capacity"));
        }
        Ok(Self { ref_, header })
    }

    pub fn as_ref(&self) -> Ref {
        self.ref_
    }

    pub fn len(&self) -> usize {
        self.header.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn payload_ptr(&self, alloc: &Allocator) -> Result<*mut u8, NodeError> {
        let ptr = alloc.translate(self.ref_)?;
        Ok(unsafe { ptr.add(HEADER_SIZE) })
    }

    fn write_header(&mut self, alloc: &mut Allocator) -> Result<(), NodeError> {
        let ptr = alloc.translate_mut(self.ref_)?;
        unsafe { *(ptr as *mut NodeHeader) = self.header };
        Ok(())
    }

    pub fn bytes(&self, alloc: &Allocator) -> Result<Vec<u8>, NodeError> {
        let ptr = self.payload_ptr(alloc)?;
        let len = self.header.size();
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
    }

    /// Overwrite the node's contents with `bytes`, reallocating (and thus
    /// possibly changing this node's ref) if `bytes` no longer fits the
    /// current capacity. Always copy-on-writes first.
    pub fn set_bytes(&mut self, alloc: &mut Allocator, bytes: &[u8]) -> Result<bool, NodeError> {
        let cow_changed = self.copy_on_write(alloc)?;
        let needed_total = node_total_size(bytes.len());
        let old_total = HEADER_SIZE + self.header.capacity();
        let mut ref_changed = cow_changed;
        if needed_total > old_total {
            let new_capacity = ((needed_total.max((old_total * 3) / 2) + 7) & !7) - HEADER_SIZE;
            let new_total = HEADER_SIZE + new_capacity;
            let new_ref = alloc.realloc(self.ref_, old_total, new_total)?;
            if new_ref != self.ref_ {
                ref_changed = true;
            }
            self.ref_ = new_ref;
            self.header.set_capacity(new_capacity);
        }
        self.header.set_size(bytes.len());
        let ptr = self.payload_ptr(alloc)?;
        unsafe {
            std::ptr::write_bytes(ptr, 0, self.header.capacity());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        self.write_header(alloc)?;
        Ok(ref_changed)
    }

    /// Copy into the slab if currently read-only. Mirrors
    /// `NodeArray::copy_on_write`.
    pub fn copy_on_write(&mut self, alloc: &mut Allocator) -> Result<bool, NodeError> {
        if !alloc.is_read_only(self.ref_) {
            return Ok(false);
        }
        let old_total = HEADER_SIZE + self.header.capacity();
        let new_ref = alloc.alloc(old_total)?;
        let src = alloc.translate(self.ref_)?;
        let dst = alloc.translate_mut(new_ref)?;
        unsafe { std::ptr::copy_nonoverlapping(src, dst, old_total) };
        alloc.free(self.ref_, old_total)?;
        self.ref_ = new_ref;
        Ok(true)
    }

    /// Release this node's storage entirely (used when a big-blob value is
    /// replaced or removed).
    pub fn free(self, alloc: &mut Allocator) -> Result<(), NodeError> {
        let total = HEADER_SIZE + self.header.capacity();
        alloc.free(self.ref_, total)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;

    #[test]
    fn roundtrips_bytes() {
        let mut alloc = Allocator::new_anon();
        let node = BlobNode::create(&mut alloc, b"hello world").unwrap();
        assert_eq!(node.bytes(&alloc).unwrap(), b"hello world");
    }

    #[test]
    fn set_bytes_can_grow() {
        let mut alloc = Allocator::new_anon();
        let mut node = BlobNode::create(&mut alloc, b"short").unwrap();
        let long = vec![b'x'; 4096];
        node.set_bytes(&mut alloc, &long).unwrap();
        assert_eq!(node.bytes(&alloc).unwrap(), long);
    }

    #[test]
    fn empty_blob_has_zero_length() {
        let mut alloc = Allocator::new_anon();
        let node = BlobNode::create(&mut alloc, b"").unwrap();
        assert_eq!(node.len(), 0);
        assert!(node.is_empty());
    }
}
