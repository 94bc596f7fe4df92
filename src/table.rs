//! Table (§4.E): a row container over a set of columns sharing one [`Spec`].
//!
//! Row insert/remove dispatches to every column in lock-step. Per §9's design
//! note, accessors obtained from a table (here, [`ColumnHandle`]) capture the
//! table's `instance_version` at creation time and are rejected with
//! `StaleAccessor` once a schema change (add/erase column) bumps it, instead
//! of carrying a live back-pointer into the table.

use crate::alloc::Allocator;
use crate::column::{Column, ColumnType, Value};
use crate::error::GroupError;
use crate::node::NodeArray;
use crate::spec::Spec;
use crate::transact_log::{type_byte, TransactLogEncoder};
use crate::Ref;

/// A handle to one of a table's columns, valid only while the table's schema
/// hasn't changed since the handle was issued.
#[derive(Clone, Copy)]
pub struct ColumnHandle {
    index: usize,
    instance_version: u64,
}

pub struct Table {
    ref_: Ref,
    instance_version: u64,
    /// This table's position in its group's table list, if it has one.
    /// `None` for a table that hasn't been added to a group yet — such a
    /// table has nothing a `SelectTable` instruction could name, so its
    /// mutations go unlogged.
    table_ndx: Option<u64>,
}

impl Table {
    pub fn create_empty(alloc: &mut Allocator) -> Result<Self, GroupError> {
        let spec = Spec::create_empty(alloc)?;
        let columns = NodeArray::create_empty(alloc, false, true, false)?;
        let mut top = NodeArray::create_empty(alloc, false, true, false)?;
        top.add(alloc, spec.as_ref().0 as i64)?;
        top.add(alloc, columns.as_ref().0 as i64)?;
        Ok(Self {
            ref_: top.as_ref(),
            instance_version: 0,
            table_ndx: None,
        })
    }

    pub fn from_ref(ref_: Ref, table_ndx: Option<u64>) -> Self {
        Self {
            ref_,
            instance_version: 0,
            table_ndx,
        }
    }

    fn select(&self, log: &mut TransactLogEncoder) {
        if let Some(ndx) = self.table_ndx {
            log.select_table(ndx, &[]);
        }
    }

    pub fn as_ref(&self) -> Ref {
        self.ref_
    }

    fn spec(&self, alloc: &Allocator) -> Result<Spec, GroupError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        Ok(Spec::from_ref(Ref(top.get(alloc, 0)? as u64)))
    }

    fn columns_ref(&self, alloc: &Allocator) -> Result<Ref, GroupError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        Ok(Ref(top.get(alloc, 1)? as u64))
    }

    fn column_at(&self, alloc: &Allocator, i: usize) -> Result<Column, GroupError> {
        let spec = self.spec(alloc)?;
        let kind = spec.column_type(alloc, i)?;
        let columns_ref = self.columns_ref(alloc)?;
        let columns = NodeArray::from_ref(alloc, columns_ref)?;
        let root = Ref(columns.get(alloc, i)? as u64);
        Ok(Column::from_ref(root, kind))
    }

    fn set_column_root(&mut self, alloc: &mut Allocator, i: usize, new_root: Ref) -> Result<(), GroupError> {
        let top_ref = self.ref_;
        let mut top = NodeArray::from_ref(alloc, top_ref)?;
        top.copy_on_write(alloc)?;
        let columns_ref = Ref(top.get(alloc, 1)? as u64);
        let mut columns = NodeArray::from_ref(alloc, columns_ref)?;
        columns.set(alloc, i, new_root.0 as i64)?;
        if columns.as_ref() != columns_ref {
            top.set(alloc, 1, columns.as_ref().0 as i64)?;
        }
        self.ref_ = top.as_ref();
        Ok(())
    }

    pub fn column_count(&self, alloc: &Allocator) -> Result<usize, GroupError> {
        Ok(self.spec(alloc)?.column_count(alloc)?)
    }

    pub fn find_column(&self, alloc: &Allocator, name: &str) -> Result<Option<ColumnHandle>, GroupError> {
        let idx = self.spec(alloc)?.find_column(alloc, name)?;
        Ok(idx.map(|index| ColumnHandle {
            index,
            instance_version: self.instance_version,
        }))
    }

    fn check(&self, handle: ColumnHandle) -> Result<usize, GroupError> {
        if handle.instance_version != self.instance_version {
            return Err(GroupError::StaleAccessor);
        }
        Ok(handle.index)
    }

    pub fn add_column(
        &mut self,
        alloc: &mut Allocator,
        name: &str,
        kind: ColumnType,
        log: &mut TransactLogEncoder,
    ) -> Result<(), GroupError> {
        let row_count = self.row_count(alloc)?;
        let mut spec = self.spec(alloc)?;
        let col_ndx = spec.column_count(alloc)? as u64;
        spec.add_column(alloc, name, kind)?;

        let mut column = Column::create_empty(alloc, kind)?;
        for _ in 0..row_count {
            column.add(alloc, default_value(kind))?;
        }

        let top_ref = self.ref_;
        let mut top = NodeArray::from_ref(alloc, top_ref)?;
        top.copy_on_write(alloc)?;
        top.set(alloc, 0, spec.as_ref().0 as i64)?;
        let columns_ref = Ref(top.get(alloc, 1)? as u64);
        let mut columns = NodeArray::from_ref(alloc, columns_ref)?;
        columns.add(alloc, column.as_ref().0 as i64)?;
        if columns.as_ref() != columns_ref {
            top.set(alloc, 1, columns.as_ref().0 as i64)?;
        }
        self.ref_ = top.as_ref();
        self.instance_version += 1;
        self.select(log);
        log.insert_column(col_ndx, type_byte(kind), name);
        Ok(())
    }

    pub fn erase_column(&mut self, alloc: &mut Allocator, handle: ColumnHandle, log: &mut TransactLogEncoder) -> Result<(), GroupError> {
        let i = self.check(handle)?;
        let mut spec = self.spec(alloc)?;
        spec.erase_column(alloc, i)?;

        let top_ref = self.ref_;
        let mut top = NodeArray::from_ref(alloc, top_ref)?;
        top.copy_on_write(alloc)?;
        top.set(alloc, 0, spec.as_ref().0 as i64)?;
        let columns_ref = Ref(top.get(alloc, 1)? as u64);
        let mut columns = NodeArray::from_ref(alloc, columns_ref)?;
        columns.erase(alloc, i)?;
        top.set(alloc, 1, columns.as_ref().0 as i64)?;
        self.ref_ = top.as_ref();
        self.instance_version += 1;
        self.select(log);
        log.erase_column(i as u64);
        Ok(())
    }

    pub fn row_count(&self, alloc: &Allocator) -> Result<usize, GroupError> {
        if self.column_count(alloc)? == 0 {
            return Ok(0);
        }
        Ok(self.column_at(alloc, 0)?.size(alloc)?)
    }

    pub fn get(&self, alloc: &Allocator, handle: ColumnHandle, row: usize) -> Result<Value, GroupError> {
        let i = self.check(handle)?;
        Ok(self.column_at(alloc, i)?.get(alloc, row)?)
    }

    pub fn set(
        &mut self,
        alloc: &mut Allocator,
        handle: ColumnHandle,
        row: usize,
        value: Value,
        log: &mut TransactLogEncoder,
    ) -> Result<(), GroupError> {
        let i = self.check(handle)?;
        let mut column = self.column_at(alloc, i)?;
        column.set(alloc, row, value.clone())?;
        self.set_column_root(alloc, i, column.as_ref())?;
        self.select(log);
        log_set(log, i as u64, row as u64, &value);
        Ok(())
    }

    /// Append one row, in column order, matching the table's spec exactly.
    pub fn add_row(&mut self, alloc: &mut Allocator, values: &[Value], log: &mut TransactLogEncoder) -> Result<(), GroupError> {
        let n = self.column_count(alloc)?;
        if values.len() != n {
            return Err(GroupError::Column(crate::error::ColumnError::TypeMismatch));
        }
        let row = self.row_count(alloc)?;
        for (i, v) in values.iter().enumerate() {
            let mut column = self.column_at(alloc, i)?;
            column.add(alloc, v.clone())?;
            self.set_column_root(alloc, i, column.as_ref())?;
        }
        self.select(log);
        log.insert_empty_row(row as u64, 1);
        for (i, v) in values.iter().enumerate() {
            log_set(log, i as u64, row as u64, v);
        }
        Ok(())
    }

    pub fn insert_empty_row(&mut self, alloc: &mut Allocator, row: usize, num: usize, log: &mut TransactLogEncoder) -> Result<(), GroupError> {
        let n = self.column_count(alloc)?;
        for i in 0..n {
            let kind = self.spec(alloc)?.column_type(alloc, i)?;
            let mut column = self.column_at(alloc, i)?;
            for k in 0..num {
                column.insert(alloc, row + k, default_value(kind))?;
            }
            self.set_column_root(alloc, i, column.as_ref())?;
        }
        self.select(log);
        log.insert_empty_row(row as u64, num as u64);
        Ok(())
    }

    /// Remove row `row`, shifting subsequent rows down in every column.
    ///
    /// Unlogged: the transact-log instruction set (§4.G) has no row-removal
    /// opcode, only insertion and per-cell sets.
    pub fn remove_row(&mut self, alloc: &mut Allocator, row: usize) -> Result<(), GroupError> {
        let n = self.column_count(alloc)?;
        for i in 0..n {
            let mut column = self.column_at(alloc, i)?;
            column.erase(alloc, row)?;
            self.set_column_root(alloc, i, column.as_ref())?;
        }
        Ok(())
    }

    /// Swap-and-pop removal across every column (unordered tables). Unlogged,
    /// same reason as [`Table::remove_row`].
    pub fn move_last_over(&mut self, alloc: &mut Allocator, row: usize) -> Result<(), GroupError> {
        let n = self.column_count(alloc)?;
        for i in 0..n {
            let mut column = self.column_at(alloc, i)?;
            column.move_last_over(alloc, row)?;
            self.set_column_root(alloc, i, column.as_ref())?;
        }
        Ok(())
    }

    /// Unlogged, same reason as [`Table::remove_row`].
    pub fn clear(&mut self, alloc: &mut Allocator) -> Result<(), GroupError> {
        let n = self.column_count(alloc)?;
        for i in 0..n {
            let mut column = self.column_at(alloc, i)?;
            column.clear(alloc)?;
            self.set_column_root(alloc, i, column.as_ref())?;
        }
        Ok(())
    }
}

/// Dispatch one column's value onto the matching `Set*` transact-log
/// instruction. `Timestamp` and `Link` both carry a plain `i64` payload
/// (a tick count and a ref, respectively), so both ride on `SetInt` — the
/// instruction set (§4.G) only names `SetInt/Bool/String/Binary`.
fn log_set(log: &mut TransactLogEncoder, col: u64, row: u64, value: &Value) {
    match value {
        Value::Int(v) => log.set_int(col, row, *v),
        Value::Bool(v) => log.set_bool(col, row, *v),
        Value::Float(v) => log.set_float(col, row, *v),
        Value::Timestamp(v) => log.set_int(col, row, *v),
        Value::String(v) => log.set_string(col, row, v),
        Value::Binary(v) => log.set_binary(col, row, v),
        Value::Link(r) => log.set_int(col, row, r.0 as i64),
    }
}

fn default_value(kind: ColumnType) -> Value {
    match kind {
        ColumnType::Int => Value::Int(0),
        ColumnType::Bool => Value::Bool(false),
        ColumnType::Float => Value::Float(0.0),
        ColumnType::Timestamp => Value::Timestamp(0),
        ColumnType::String => Value::String(String::new()),
        ColumnType::Binary => Value::Binary(Vec::new()),
        ColumnType::Link => Value::Link(Ref(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;

    #[test]
    fn build_rows_and_read_back() {
        let mut alloc = Allocator::new_anon();
        let mut log = TransactLogEncoder::new();
        let mut table = Table::create_empty(&mut alloc).unwrap();
        table.add_column(&mut alloc, "name", ColumnType::String, &mut log).unwrap();
        table.add_column(&mut alloc, "age", ColumnType::Int, &mut log).unwrap();
        table.add_column(&mut alloc, "hired", ColumnType::Bool, &mut log).unwrap();

        table
            .add_row(&mut alloc, &[Value::String("joe".into()), Value::Int(42), Value::Bool(false)], &mut log)
            .unwrap();
        table
            .add_row(&mut alloc, &[Value::String("jessica".into()), Value::Int(22), Value::Bool(true)], &mut log)
            .unwrap();

        assert_eq!(table.row_count(&alloc).unwrap(), 2);
        let name_col = table.find_column(&alloc, "name").unwrap().unwrap();
        assert_eq!(table.get(&alloc, name_col, 0).unwrap(), Value::String("joe".into()));
    }

    #[test]
    fn stale_handle_after_schema_change() {
        let mut alloc = Allocator::new_anon();
        let mut log = TransactLogEncoder::new();
        let mut table = Table::create_empty(&mut alloc).unwrap();
        table.add_column(&mut alloc, "a", ColumnType::Int, &mut log).unwrap();
        let handle = table.find_column(&alloc, "a").unwrap().unwrap();
        table.add_column(&mut alloc, "b", ColumnType::Int, &mut log).unwrap();
        assert!(matches!(table.get(&alloc, handle, 0), Err(GroupError::StaleAccessor)));
    }

    #[test]
    fn remove_row_shifts_down() {
        let mut alloc = Allocator::new_anon();
        let mut log = TransactLogEncoder::new();
        let mut table = Table::create_empty(&mut alloc).unwrap();
        table.add_column(&mut alloc, "v", ColumnType::Int, &mut log).unwrap();
        for v in 0..3i64 {
            table.add_row(&mut alloc, &[Value::Int(v)], &mut log).unwrap();
        }
        table.remove_row(&mut alloc, 0).unwrap();
        let col = table.find_column(&alloc, "v").unwrap().unwrap();
        assert_eq!(table.row_count(&alloc).unwrap(), 2);
        assert_eq!(table.get(&alloc, col, 0).unwrap(), Value::Int(1));
    }

    #[test]
    fn mutations_are_logged_when_table_has_an_index() {
        let mut alloc = Allocator::new_anon();
        let mut log = TransactLogEncoder::new();
        let mut table = Table::create_empty(&mut alloc).unwrap();
        table.table_ndx = Some(3);
        table.add_column(&mut alloc, "v", ColumnType::Int, &mut log).unwrap();
        table.add_row(&mut alloc, &[Value::Int(9)], &mut log).unwrap();
        let bytes = log.into_bytes();
        let parsed = crate::transact_log::parse(&bytes).unwrap();
        assert!(parsed.iter().any(|i| matches!(i, crate::transact_log::Instruction::SelectTable { table_ndx: 3, .. })));
        assert!(parsed.iter().any(|i| matches!(i, crate::transact_log::Instruction::InsertColumn { .. })));
        assert!(parsed.iter().any(|i| matches!(i, crate::transact_log::Instruction::InsertEmptyRow { .. })));
        assert!(parsed.iter().any(|i| matches!(i, crate::transact_log::Instruction::SetInt { value: 9, .. })));
    }
}
