//! Group (§4.E / §4.B "Free-list representation on file"): the database's
//! root. The top ref points at a fixed 7-element node array:
//! `[table_names_ref, tables_ref, free_positions_ref, free_sizes_ref,
//! free_versions_ref, file_size, file_version]`.

use crate::alloc::Allocator;
use crate::column::{Column, ColumnType, Value};
use crate::error::GroupError;
use crate::node::NodeArray;
use crate::table::Table;
use crate::Ref;

pub struct Group {
    ref_: Ref,
}

impl Group {
    pub fn create_empty(alloc: &mut Allocator) -> Result<Self, GroupError> {
        let table_names = Column::create_empty(alloc, ColumnType::String)?;
        let tables = NodeArray::create_empty(alloc, false, true, false)?;
        let free_positions = NodeArray::create_empty(alloc, false, false, false)?;
        let free_sizes = NodeArray::create_empty(alloc, false, false, false)?;
        let free_versions = NodeArray::create_empty(alloc, false, false, false)?;
        let mut top = NodeArray::create_empty(alloc, false, true, false)?;
        top.add(alloc, table_names.as_ref().0 as i64)?;
        top.add(alloc, tables.as_ref().0 as i64)?;
        top.add(alloc, free_positions.as_ref().0 as i64)?;
        top.add(alloc, free_sizes.as_ref().0 as i64)?;
        top.add(alloc, free_versions.as_ref().0 as i64)?;
        top.add(alloc, 0)?; // file_size, filled in at commit
        top.add(alloc, 0)?; // file_version, filled in at commit
        Ok(Self { ref_: top.as_ref() })
    }

    pub fn from_ref(ref_: Ref) -> Self {
        Self { ref_ }
    }

    pub fn as_ref(&self) -> Ref {
        self.ref_
    }

    fn table_names(&self, alloc: &Allocator) -> Result<Column, GroupError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        Ok(Column::from_ref(Ref(top.get(alloc, 0)? as u64), ColumnType::String))
    }

    fn tables_ref(&self, alloc: &Allocator) -> Result<Ref, GroupError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        Ok(Ref(top.get(alloc, 1)? as u64))
    }

    pub fn table_count(&self, alloc: &Allocator) -> Result<usize, GroupError> {
        Ok(self.table_names(alloc)?.size(alloc)?)
    }

    pub fn table_name(&self, alloc: &Allocator, i: usize) -> Result<String, GroupError> {
        match self.table_names(alloc)?.get(alloc, i)? {
            Value::String(s) => Ok(s),
            _ => unreachable!("table_names is a String column"),
        }
    }

    fn find_table_index(&self, alloc: &Allocator, name: &str) -> Result<Option<usize>, GroupError> {
        let names = self.table_names(alloc)?;
        Ok(names.find_first(alloc, &Value::String(name.to_string()), 0, names.size(alloc)?)?)
    }

    pub fn get_table(&self, alloc: &Allocator, name: &str) -> Result<Option<Table>, GroupError> {
        let Some(idx) = self.find_table_index(alloc, name)? else {
            return Ok(None);
        };
        let tables_ref = self.tables_ref(alloc)?;
        let tables = NodeArray::from_ref(alloc, tables_ref)?;
        let root = Ref(tables.get(alloc, idx)? as u64);
        Ok(Some(Table::from_ref(root, Some(idx as u64))))
    }

    pub fn has_table(&self, alloc: &Allocator, name: &str) -> Result<bool, GroupError> {
        Ok(self.find_table_index(alloc, name)?.is_some())
    }

    pub fn add_table(&mut self, alloc: &mut Allocator, name: &str) -> Result<Table, GroupError> {
        if self.has_table(alloc, name)? {
            return Err(GroupError::TableExists(name.to_string()));
        }
        let new_ndx = self.table_count(alloc)? as u64;
        let table = Table::create_empty(alloc)?;

        let mut top = NodeArray::from_ref(alloc, self.ref_)?;
        top.copy_on_write(alloc)?;

        let names_ref = Ref(top.get(alloc, 0)? as u64);
        let mut names = Column::from_ref(names_ref, ColumnType::String);
        names.add(alloc, Value::String(name.to_string()))?;
        if names.as_ref() != names_ref {
            top.set(alloc, 0, names.as_ref().0 as i64)?;
        }

        let tables_ref = Ref(top.get(alloc, 1)? as u64);
        let mut tables = NodeArray::from_ref(alloc, tables_ref)?;
        tables.add(alloc, table.as_ref().0 as i64)?;
        if tables.as_ref() != tables_ref {
            top.set(alloc, 1, tables.as_ref().0 as i64)?;
        }

        self.ref_ = top.as_ref();
        Ok(Table::from_ref(table.as_ref(), Some(new_ndx)))
    }

    /// Write `table`'s current root ref back into this group's table list.
    /// `Table` mutations (adding a row, adding a column) may relocate its
    /// root; the group must be told about the new ref, since it otherwise
    /// only holds the ref snapshotted by `add_table`/`get_table`.
    pub fn commit_table(&mut self, alloc: &mut Allocator, name: &str, table: &Table) -> Result<(), GroupError> {
        let Some(idx) = self.find_table_index(alloc, name)? else {
            return Err(GroupError::NoSuchTable(name.to_string()));
        };
        let mut top = NodeArray::from_ref(alloc, self.ref_)?;
        top.copy_on_write(alloc)?;
        let tables_ref = Ref(top.get(alloc, 1)? as u64);
        let mut tables = NodeArray::from_ref(alloc, tables_ref)?;
        tables.set(alloc, idx, table.as_ref().0 as i64)?;
        if tables.as_ref() != tables_ref {
            top.set(alloc, 1, tables.as_ref().0 as i64)?;
        }
        self.ref_ = top.as_ref();
        Ok(())
    }

    /// Read the free-list arrays (`free_positions`/`free_sizes`/
    /// `free_versions`) into `(start, len, freed_at_version)` triples, for
    /// loading into an `Allocator`'s read-only free list at the start of a
    /// transaction.
    pub fn free_list(&self, alloc: &Allocator) -> Result<Vec<(u64, usize, u64)>, GroupError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        let positions = NodeArray::from_ref(alloc, Ref(top.get(alloc, 2)? as u64))?;
        let sizes = NodeArray::from_ref(alloc, Ref(top.get(alloc, 3)? as u64))?;
        let versions = NodeArray::from_ref(alloc, Ref(top.get(alloc, 4)? as u64))?;
        let n = positions.size();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push((
                positions.get(alloc, i)? as u64,
                sizes.get(alloc, i)? as usize,
                versions.get(alloc, i)? as u64,
            ));
        }
        Ok(out)
    }

    /// Overwrite the free-list arrays with `entries`, taken from an
    /// `Allocator`'s `free_list_snapshot()` just before a commit.
    pub fn set_free_list(&mut self, alloc: &mut Allocator, entries: &[(u64, usize, u64)]) -> Result<(), GroupError> {
        let mut top = NodeArray::from_ref(alloc, self.ref_)?;
        top.copy_on_write(alloc)?;

        let positions_ref = Ref(top.get(alloc, 2)? as u64);
        let mut positions = NodeArray::from_ref(alloc, positions_ref)?;
        positions.truncate(alloc, 0)?;
        for &(pos, _, _) in entries {
            positions.add(alloc, pos as i64)?;
        }
        if positions.as_ref() != positions_ref {
            top.set(alloc, 2, positions.as_ref().0 as i64)?;
        }

        let sizes_ref = Ref(top.get(alloc, 3)? as u64);
        let mut sizes = NodeArray::from_ref(alloc, sizes_ref)?;
        sizes.truncate(alloc, 0)?;
        for &(_, len, _) in entries {
            sizes.add(alloc, len as i64)?;
        }
        if sizes.as_ref() != sizes_ref {
            top.set(alloc, 3, sizes.as_ref().0 as i64)?;
        }

        let versions_ref = Ref(top.get(alloc, 4)? as u64);
        let mut versions = NodeArray::from_ref(alloc, versions_ref)?;
        versions.truncate(alloc, 0)?;
        for &(_, _, ver) in entries {
            versions.add(alloc, ver as i64)?;
        }
        if versions.as_ref() != versions_ref {
            top.set(alloc, 4, versions.as_ref().0 as i64)?;
        }

        self.ref_ = top.as_ref();
        Ok(())
    }

    pub fn remove_table(&mut self, alloc: &mut Allocator, name: &str) -> Result<(), GroupError> {
        let Some(idx) = self.find_table_index(alloc, name)? else {
            return Err(GroupError::NoSuchTable(name.to_string()));
        };

        let mut top = NodeArray::from_ref(alloc, self.ref_)?;
        top.copy_on_write(alloc)?;

        let names_ref = Ref(top.get(alloc, 0)? as u64);
        let mut names = Column::from_ref(names_ref, ColumnType::String);
        names.erase(alloc, idx)?;
        top.set(alloc, 0, names.as_ref().0 as i64)?;

        let tables_ref = Ref(top.get(alloc, 1)? as u64);
        let mut tables = NodeArray::from_ref(alloc, tables_ref)?;
        tables.erase(alloc, idx)?;
        top.set(alloc, 1, tables.as_ref().0 as i64)?;

        self.ref_ = top.as_ref();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::column::ColumnType;

    #[test]
    fn add_and_find_tables() {
        let mut alloc = Allocator::new_anon();
        let mut group = Group::create_empty(&mut alloc).unwrap();
        group.add_table(&mut alloc, "employees").unwrap();
        assert!(group.has_table(&alloc, "employees").unwrap());
        assert!(group.get_table(&alloc, "employees").unwrap().is_some());
        assert!(group.get_table(&alloc, "nope").unwrap().is_none());
        assert_eq!(group.table_count(&alloc).unwrap(), 1);
    }

    #[test]
    fn duplicate_table_name_rejected() {
        let mut alloc = Allocator::new_anon();
        let mut group = Group::create_empty(&mut alloc).unwrap();
        group.add_table(&mut alloc, "t").unwrap();
        assert!(matches!(group.add_table(&mut alloc, "t"), Err(GroupError::TableExists(_))));
    }

    #[test]
    fn end_to_end_employees_table() {
        use crate::transact_log::TransactLogEncoder;
        let mut alloc = Allocator::new_anon();
        let mut log = TransactLogEncoder::new();
        let mut group = Group::create_empty(&mut alloc).unwrap();
        let mut table = group.add_table(&mut alloc, "employees").unwrap();
        table.add_column(&mut alloc, "name", ColumnType::String, &mut log).unwrap();
        table.add_column(&mut alloc, "age", ColumnType::Int, &mut log).unwrap();
        table.add_column(&mut alloc, "hired", ColumnType::Bool, &mut log).unwrap();
        table
            .add_row(&mut alloc, &[Value::String("joe".into()), Value::Int(42), Value::Bool(false)], &mut log)
            .unwrap();
        group.commit_table(&mut alloc, "employees", &table).unwrap();
        assert_eq!(table.row_count(&alloc).unwrap(), 1);
        let reloaded = group.get_table(&alloc, "employees").unwrap().unwrap();
        assert_eq!(reloaded.row_count(&alloc).unwrap(), 1);
    }
}
