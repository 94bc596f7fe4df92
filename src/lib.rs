#![allow(dead_code)]
#![allow(unused_variables)]

//! An embedded, file-backed, transactional, columnar database engine.
//!
//! A database holds a tree of tables ([`group::Group`] → [`table::Table`]);
//! tables hold typed columns ([`column::Column`]) stored as B+-tree-shaped
//! collections of small, bit-packed node arrays ([`node::NodeArray`]).
//! Transactions are copy-on-write; durability is a single atomic pointer
//! swap at commit (see [`shared_group`]).

use std::path::Path;

use bytemuck::{Pod, Zeroable};

pub mod alloc;
pub mod blob;
pub mod column;
mod error;
pub mod group;
pub mod mapping;
pub mod node;
pub mod shared_group;
pub mod spec;
pub mod table;
pub mod transact_log;
pub mod varint;

pub use column::{ColumnType, Value};
pub use error::{AllocError, ColumnError, GroupError, NodeError, SharedGroupError, TransactLogError};
pub use group::Group;
pub use shared_group::{Durability, ReadTransaction, SharedGroup, WriteTransaction};
pub use table::{ColumnHandle, Table};
pub use transact_log::{GroupSink, TransactLogParser};

/// An 8-aligned offset naming a node, either inside the mapped file or
/// inside a writer's slab (§3 GLOSSARY).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct Ref(pub u64);

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ref(0x{:x})", self.0)
    }
}

impl std::fmt::LowerHex for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Builder for opening or creating a database file, with knobs for
/// durability mode and on-disk layout.
pub struct OpenOptions {
    durability: Durability,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { durability: Durability::Full }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Database, SharedGroupError> {
        let shared = SharedGroup::open(path.as_ref(), self.durability)?;
        Ok(Database { shared })
    }

    pub fn open_anon(self) -> Database {
        Database {
            shared: SharedGroup::open_anon(),
        }
    }
}

/// A single open database: the top-level handle an application holds.
/// Hands out read/write transaction snapshots; see [`SharedGroup`] for the
/// concurrency protocol underneath.
pub struct Database {
    shared: SharedGroup,
}

impl Database {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SharedGroupError> {
        OpenOptions::new().open(path)
    }

    pub fn create_anon() -> Self {
        OpenOptions::new().open_anon()
    }

    pub fn begin_read(&self) -> Result<ReadTransaction<'_>, SharedGroupError> {
        self.shared.begin_read()
    }

    pub fn begin_write(&self) -> Result<WriteTransaction<'_>, SharedGroupError> {
        self.shared.begin_write()
    }

    pub fn compact(&self) -> Result<(), SharedGroupError> {
        self.shared.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnType, Value};

    #[test]
    fn anon_database_round_trips_a_table() {
        let db = Database::create_anon();
        {
            let mut wt = db.begin_write().unwrap();
            let mut table = wt.group.add_table(&mut wt.alloc, "t").unwrap();
            table.add_column(&mut wt.alloc, "v", ColumnType::Int, &mut wt.log).unwrap();
            table.add_row(&mut wt.alloc, &[Value::Int(7)], &mut wt.log).unwrap();
            wt.group.commit_table(&mut wt.alloc, "t", &table).unwrap();
            wt.commit().unwrap();
        }
        let rt = db.begin_read().unwrap();
        let table = rt.group.get_table(&rt.alloc, "t").unwrap().unwrap();
        assert_eq!(table.row_count(&rt.alloc).unwrap(), 1);
    }
}
