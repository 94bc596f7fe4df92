//! Shared Group (§4.F): read/write transactions, the top-ref swap, and
//! inter-process locking for one writer / many readers.
//!
//! The lockfile side of robust-mutex recovery is narrowed from a full
//! shared-memory reader table to a plain `fs4` advisory lock (see DESIGN.md's
//! Open Question resolution): a dead writer's lock is released by the OS when
//! its file descriptor closes, so the next `begin_write` simply acquires it
//! and proceeds — recovery needs nothing beyond that, since the file on disk
//! is only ever mutated up to the last successful commit.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions as StdOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::alloc::Allocator;
use crate::error::{GroupError, SharedGroupError};
use crate::group::Group;
use crate::mapping::Mapping;
use crate::transact_log::TransactLogEncoder;
use crate::Ref;

pub const FILE_MAGIC: [u8; 4] = *b"T-DB";
pub const FILE_FORMAT_VERSION: u8 = 1;
/// Header occupies bytes `[0, HEADER_LEN)`; node data starts immediately after.
pub const HEADER_LEN: usize = 24;
/// Sentinel top ref for a database that has never been committed: no `Group`
/// node exists yet anywhere, so `begin_read`/`begin_write` materialize an
/// empty one on the fly rather than resolving this ref.
const NO_TOP: Ref = Ref(0);

/// How aggressively a commit is made durable (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// fsync before the selector flip.
    Full,
    /// No fsync; suitable for tmpfs-backed databases.
    MemOnly,
    /// Hand the fsync off to a separate durability helper process. Not
    /// implemented: there is no helper-process protocol to hand off to, so
    /// `commit()` rejects it rather than silently downgrading to `Full` or
    /// `MemOnly` (§9 Open Question).
    Async,
}

struct FileHeader {
    selector: u8,
    top_ref_slots: [u64; 2],
}

impl FileHeader {
    fn fresh() -> Self {
        Self { selector: 0, top_ref_slots: [HEADER_LEN as u64, 0] }
    }

    /// Read the header, retrying the (selector, slot) pair once if the
    /// selector changed mid-read (§6: the reader's retry rule).
    fn read(bytes: &[u8]) -> Result<Self, SharedGroupError> {
        if bytes.len() < HEADER_LEN {
            return Err(SharedGroupError::InvalidDatabase("file shorter than header"));
        }
        if bytes[0..4] != FILE_MAGIC {
            return Err(SharedGroupError::InvalidDatabase("bad magic"));
        }
        let version = bytes[4];
        if version != FILE_FORMAT_VERSION {
            return Err(SharedGroupError::LockfileVersion {
                expected: FILE_FORMAT_VERSION as u32,
                found: version as u32,
            });
        }
        loop {
            let selector = bytes[5];
            let slot_off = 8 + (selector as usize) * 8;
            let top = u64::from_ne_bytes(bytes[slot_off..slot_off + 8].try_into().unwrap());
            if bytes[5] == selector {
                return Ok(Self { selector, top_ref_slots: { let mut s = [0u64; 2]; s[selector as usize] = top; s } });
            }
        }
    }

    fn write_bytes(&self, top: u64, committing_slot: u8, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4] = FILE_FORMAT_VERSION;
        buf[6..8].copy_from_slice(&0u16.to_ne_bytes());
        let slot_off = 8 + (committing_slot as usize) * 8;
        buf[slot_off..slot_off + 8].copy_from_slice(&top.to_ne_bytes());
        let _ = self;
    }
}

/// In-process bookkeeping of which commit versions have live readers.
/// Oldest-active-version tracking gates which read-only free-list entries
/// can be reused.
#[derive(Default)]
struct ReaderTable {
    counts: BTreeMap<u64, usize>,
}

impl ReaderTable {
    fn checkout(&mut self, version: u64) {
        *self.counts.entry(version).or_insert(0) += 1;
    }

    fn checkin(&mut self, version: u64) {
        if let Some(count) = self.counts.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&version);
            }
        }
    }

    fn oldest_active(&self) -> Option<u64> {
        self.counts.keys().next().copied()
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

struct Shared {
    mapping: Mapping,
    top: Ref,
    current_version: u64,
    readers: ReaderTable,
}

/// Coordinates one writer and many readers over a database file plus its
/// sidecar lockfile.
pub struct SharedGroup {
    state: Arc<Mutex<Shared>>,
    file_path: Option<PathBuf>,
    lock_file: Option<File>,
    durability: Durability,
}

impl SharedGroup {
    /// Open (creating if absent) the database at `path` with its `.lock`
    /// sidecar.
    pub fn open(path: &Path, durability: Durability) -> Result<Self, SharedGroupError> {
        let existed = path.exists();
        let file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Open(e))))?;

        if !existed || file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            file.set_len(HEADER_LEN as u64)
                .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Sync(e))))?;
            let mut buf = vec![0u8; HEADER_LEN];
            let header = FileHeader::fresh();
            header.write_bytes(NO_TOP.0, 0, &mut buf);
            let mut f = &file;
            f.seek(SeekFrom::Start(0)).ok();
            f.write_all(&buf)
                .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Sync(e))))?;
            f.sync_all().ok();
        }

        let map = MmapRaw::from(unsafe {
            MmapMut::map_mut(&file).map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Open(e))))?
        });
        let mapping = Mapping::init(map, Some(file));

        let lock_path = lockfile_path(path);
        let lock_file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Open(e))))?;

        let bytes = unsafe { mapping.get_maps()[0] };
        let header = FileHeader::read(bytes)?;
        let top = Ref(header.top_ref_slots[header.selector as usize]);

        Ok(Self {
            state: Arc::new(Mutex::new(Shared {
                mapping,
                top,
                current_version: 0,
                readers: ReaderTable::default(),
            })),
            file_path: Some(path.to_path_buf()),
            lock_file: Some(lock_file),
            durability,
        })
    }

    /// An anonymous, file-less database: useful for tests and `write_to_mem`
    /// round-trips.
    pub fn open_anon() -> Self {
        let map = MmapRaw::from(MmapMut::map_anon(HEADER_LEN).unwrap());
        let mapping = Mapping::init(map, None);
        // SAFETY: freshly allocated anonymous map, no concurrent access yet.
        {
            let maps = unsafe { mapping.get_maps() };
            let ptr = maps[0].as_ptr() as *mut u8;
            let mut buf = vec![0u8; HEADER_LEN];
            FileHeader::fresh().write_bytes(NO_TOP.0, 0, &mut buf);
            unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, HEADER_LEN) };
        }
        Self {
            state: Arc::new(Mutex::new(Shared {
                mapping,
                top: NO_TOP,
                current_version: 0,
                readers: ReaderTable::default(),
            })),
            file_path: None,
            lock_file: None,
            durability: Durability::MemOnly,
        }
    }

    /// Begin a read transaction: a consistent snapshot as of the most
    /// recently committed version.
    pub fn begin_read(&self) -> Result<ReadTransaction<'_>, SharedGroupError> {
        let mut state = self.state.lock().unwrap();
        let version = state.current_version;
        state.readers.checkout(version);
        let maps = unsafe { state.mapping.get_maps() };
        let top = state.top;
        drop(state);

        let mut alloc = Allocator::new_anon();
        unsafe { alloc.attach_mapping(&maps) };
        let group = if top == NO_TOP {
            // Nothing has ever been committed: materialize an empty group in
            // this transaction's own (never-persisted) scratch space.
            Group::create_empty(&mut alloc)?
        } else {
            Group::from_ref(top)
        };
        Ok(ReadTransaction {
            shared: self,
            version,
            group,
            alloc,
        })
    }

    /// Begin a write transaction. Acquires the sidecar lockfile exclusively;
    /// a poisoned (previous-owner-died) lock is silently recovered since the
    /// file on disk is only ever mutated up to the last successful commit.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>, SharedGroupError> {
        if let Some(lock_file) = &self.lock_file {
            match lock_file.try_lock_exclusive() {
                Ok(()) => {}
                Err(_) => {
                    // Another live writer holds it; block until released.
                    FileExt::lock_exclusive(lock_file).map_err(|_| SharedGroupError::NotRecoverable)?;
                }
            }
        }

        let state = self.state.lock().unwrap();
        let maps = unsafe { state.mapping.get_maps() };
        let top = state.top;
        let current_version = state.current_version;
        let oldest_active = state.readers.oldest_active();
        drop(state);

        let mut alloc = Allocator::new_anon();
        unsafe { alloc.attach_mapping(&maps) };
        // Tag frees with the version this transaction will create on commit,
        // and only let `alloc()` reuse read-only free space no live reader's
        // snapshot predates.
        alloc.set_version(current_version + 1);
        alloc.set_reader_floor(oldest_active);
        let group = if top == NO_TOP {
            Group::create_empty(&mut alloc)?
        } else {
            Group::from_ref(top)
        };
        let free_list = group.free_list(&alloc)?;
        alloc.load_free_list(free_list);
        Ok(WriteTransaction {
            shared: self,
            group,
            alloc,
            log: TransactLogEncoder::new(),
            committed: false,
        })
    }

    fn end_read(&self, version: u64) {
        self.state.lock().unwrap().readers.checkin(version);
    }

    fn commit(
        &self,
        top: Ref,
        mut out: Vec<u8>,
        patches: Vec<(u64, Vec<u8>)>,
        alloc: &mut Allocator,
    ) -> Result<u64, SharedGroupError> {
        if self.durability == Durability::Async {
            return Err(GroupError::Unsupported("Durability::Async has no helper-process protocol yet").into());
        }
        let mut state = self.state.lock().unwrap();
        let old_len = unsafe { state.mapping.get_maps() }.iter().map(|m| m.len()).sum::<usize>();
        // Patch reclaimed free-list space in place before appending anything
        // new at the tail (§4.B step 3: fold read-only-free reuse into the
        // commit rather than only ever growing the file).
        for (offset, bytes) in &patches {
            state.mapping.write_at(*offset as usize, bytes)?;
        }
        // pad to 8-byte alignment before appending, matching the allocator's
        // own 8-byte node alignment discipline.
        while out.len() % 8 != 0 {
            out.push(0);
        }
        if !out.is_empty() {
            unsafe {
                use crate::mapping::ExpandMapping;
                match state.mapping.expand(out.len())? {
                    ExpandMapping::ReplacedLastMap(slice) | ExpandMapping::NewMap(slice) => {
                        let dst = slice.as_mut_ptr().add(slice.len() - out.len());
                        std::ptr::copy_nonoverlapping(out.as_ptr(), dst, out.len());
                    }
                }
            }
        }
        if self.durability == Durability::Full {
            state.mapping.flush()?;
        }

        let new_version = state.current_version + 1;
        let new_len = old_len + out.len();
        let bytes = unsafe { state.mapping.get_maps()[0] };
        let header = FileHeader::read(bytes)?;
        let new_selector = 1 - header.selector;

        {
            let maps = unsafe { state.mapping.get_maps() };
            let ptr = maps[0].as_ptr() as *mut u8;
            let slot_off = 8 + (new_selector as usize) * 8;
            unsafe {
                std::ptr::copy_nonoverlapping((top.0).to_ne_bytes().as_ptr(), ptr.add(slot_off), 8);
            }
        }
        if self.durability == Durability::Full {
            state.mapping.flush_range(0, HEADER_LEN)?;
        }
        {
            let maps = unsafe { state.mapping.get_maps() };
            let ptr = maps[0].as_ptr() as *mut u8;
            unsafe { *ptr.add(5) = new_selector };
        }
        if self.durability == Durability::Full {
            state.mapping.flush_range(0, HEADER_LEN)?;
        }

        state.top = top;
        state.current_version = new_version;
        let _ = new_len;
        alloc.advance_baseline(out.len() as u64);
        Ok(new_version)
    }

    /// Compact the database into a fresh file, permitted only when no reader
    /// is currently attached.
    pub fn compact(&self) -> Result<(), SharedGroupError> {
        let state = self.state.lock().unwrap();
        if !state.readers.is_empty() {
            return Err(SharedGroupError::ReadersAttached);
        }
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let tmp_path = path.with_extension("compact.tmp");
        let maps = unsafe { state.mapping.get_maps() };
        let top = state.top;
        drop(state);

        let mut alloc = Allocator::new_anon();
        unsafe { alloc.attach_mapping(&maps) };
        let mut out = Vec::new();
        out.resize(HEADER_LEN, 0);
        let new_top = if top == NO_TOP {
            NO_TOP
        } else {
            // The old free list named dead ranges in the file being replaced;
            // compaction keeps only reachable nodes, so nothing is free in
            // the new file. Clear it before the walk so the cleared (now
            // slab-resident) arrays get carried into `out` like everything
            // else reachable from `top`.
            let mut group = Group::from_ref(top);
            group.set_free_list(&mut alloc, &[])?;
            alloc.compact_into(group.as_ref(), &mut out)?
        };

        let mut header_buf = vec![0u8; HEADER_LEN];
        FileHeader::fresh().write_bytes(new_top.0, 0, &mut header_buf);
        out[..HEADER_LEN].copy_from_slice(&header_buf);

        let mut file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Open(e))))?;
        file.write_all(&out)
            .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Sync(e))))?;
        file.sync_all().ok();
        drop(file);
        std::fs::rename(&tmp_path, path)
            .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Open(e))))?;

        let file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Open(e))))?;
        let map = MmapRaw::from(unsafe {
            MmapMut::map_mut(&file).map_err(|e| SharedGroupError::Group(GroupError::Alloc(crate::error::AllocError::Open(e))))?
        });
        let mut state = self.state.lock().unwrap();
        state.mapping = Mapping::init(map, Some(file));
        state.top = new_top;
        Ok(())
    }
}

impl Drop for SharedGroup {
    fn drop(&mut self) {
        if let Some(lock_file) = &self.lock_file {
            let _ = FileExt::unlock(lock_file);
        }
    }
}

fn lockfile_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    db_path.with_file_name(name)
}

/// A read-only snapshot of the database at a fixed version. Dropped (or
/// explicitly ended) to release the reader's slot.
pub struct ReadTransaction<'a> {
    shared: &'a SharedGroup,
    version: u64,
    pub group: Group,
    pub alloc: Allocator,
}

impl<'a> ReadTransaction<'a> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn end_read(self) {
        // Consumed by value so a transaction can't be used after ending;
        // `Drop` does the actual bookkeeping either way.
    }
}

impl<'a> Drop for ReadTransaction<'a> {
    fn drop(&mut self) {
        self.shared.end_read(self.version);
    }
}

/// An in-progress write transaction. Mutations run entirely against slab
/// memory; nothing is visible to readers until `commit`.
pub struct WriteTransaction<'a> {
    shared: &'a SharedGroup,
    pub group: Group,
    pub alloc: Allocator,
    pub log: TransactLogEncoder,
    committed: bool,
}

impl<'a> WriteTransaction<'a> {
    /// Fold slab content into the file tail and atomically flip the top ref.
    /// Returns the commit's new version number together with the completed
    /// transact log (§4.G), for callers that replicate or observe commits.
    pub fn commit(mut self) -> Result<(u64, Vec<u8>), SharedGroupError> {
        let snapshot = self.alloc.free_list_snapshot();
        self.group.set_free_list(&mut self.alloc, &snapshot)?;
        let top = self.group.as_ref();
        let mut out = Vec::new();
        let mut patches = Vec::new();
        let new_top = self.alloc.write_and_commit(top, &mut out, &mut patches)?;
        let version = self.shared.commit(new_top, out, patches, &mut self.alloc)?;
        self.log.commit_record(version);
        self.committed = true;
        if let Some(lock_file) = self.shared.lock_file.as_ref() {
            let _ = FileExt::unlock(lock_file);
        }
        Ok((version, std::mem::take(&mut self.log).into_bytes()))
    }

    /// Discard all slab state without touching the file.
    pub fn rollback(mut self) {
        self.alloc.reset_slabs();
        self.committed = true; // suppress the unlock-on-drop double release
        if let Some(lock_file) = self.shared.lock_file.as_ref() {
            let _ = FileExt::unlock(lock_file);
        }
    }
}

impl<'a> Drop for WriteTransaction<'a> {
    fn drop(&mut self) {
        if !self.committed {
            // Treat an un-committed, un-rolled-back drop as an implicit
            // rollback: slab state is simply abandoned.
            if let Some(lock_file) = self.shared.lock_file.as_ref() {
                let _ = FileExt::unlock(lock_file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnType, Value};
    use tempfile::tempdir;

    #[test]
    fn build_persist_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db1");
        let shared = SharedGroup::open(&path, Durability::Full).unwrap();

        {
            let mut wt = shared.begin_write().unwrap();
            let mut table = wt.group.add_table(&mut wt.alloc, "employees").unwrap();
            table.add_column(&mut wt.alloc, "name", ColumnType::String, &mut wt.log).unwrap();
            table.add_column(&mut wt.alloc, "age", ColumnType::Int, &mut wt.log).unwrap();
            table.add_column(&mut wt.alloc, "hired", ColumnType::Bool, &mut wt.log).unwrap();
            table
                .add_row(&mut wt.alloc, &[Value::String("joe".into()), Value::Int(42), Value::Bool(false)], &mut wt.log)
                .unwrap();
            table
                .add_row(&mut wt.alloc, &[Value::String("jessica".into()), Value::Int(22), Value::Bool(true)], &mut wt.log)
                .unwrap();
            wt.group.commit_table(&mut wt.alloc, "employees", &table).unwrap();
            wt.commit().unwrap();
        }

        let shared2 = SharedGroup::open(&path, Durability::Full).unwrap();
        let rt = shared2.begin_read().unwrap();
        let table = rt.group.get_table(&rt.alloc, "employees").unwrap().unwrap();
        assert_eq!(table.row_count(&rt.alloc).unwrap(), 2);
        let name_col = table.find_column(&rt.alloc, "name").unwrap().unwrap();
        assert_eq!(table.get(&rt.alloc, name_col, 0).unwrap(), Value::String("joe".into()));
    }

    #[test]
    fn rollback_discards_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db1");
        let shared = SharedGroup::open(&path, Durability::Full).unwrap();
        {
            let mut wt = shared.begin_write().unwrap();
            let mut table = wt.group.add_table(&mut wt.alloc, "t").unwrap();
            table.add_column(&mut wt.alloc, "v", ColumnType::Int, &mut wt.log).unwrap();
            table.add_row(&mut wt.alloc, &[Value::Int(1)], &mut wt.log).unwrap();
            wt.group.commit_table(&mut wt.alloc, "t", &table).unwrap();
            wt.commit().unwrap();
        }
        {
            let wt = shared.begin_write().unwrap();
            wt.rollback();
        }
        let rt = shared.begin_read().unwrap();
        assert!(rt.group.has_table(&rt.alloc, "t").unwrap());
    }

    #[test]
    fn commit_returns_a_log_ending_in_a_commit_record() {
        let shared = SharedGroup::open_anon();
        let mut wt = shared.begin_write().unwrap();
        let mut table = wt.group.add_table(&mut wt.alloc, "t").unwrap();
        table.add_column(&mut wt.alloc, "v", ColumnType::Int, &mut wt.log).unwrap();
        table.add_row(&mut wt.alloc, &[Value::Int(1)], &mut wt.log).unwrap();
        wt.group.commit_table(&mut wt.alloc, "t", &table).unwrap();
        let (version, log) = wt.commit().unwrap();
        let instructions = crate::transact_log::parse(&log).unwrap();
        assert_eq!(instructions.last(), Some(&crate::transact_log::Instruction::CommitRecord { new_version: version }));
        assert!(instructions.iter().any(|i| matches!(i, crate::transact_log::Instruction::InsertColumn { .. })));
    }
}
