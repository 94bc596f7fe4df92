//! Spec (§4.E): the schema node describing a table's columns.
//!
//! A spec is a fixed-shape node array `[types_ref, names_ref, subspecs_ref]`:
//! `types_ref` is a plain int node holding each column's [`ColumnType`]
//! discriminant, `names_ref` is a string [`Column`] holding column names in
//! the same order, and `subspecs_ref` is a ref node holding a sub-spec ref
//! per column (`Ref(0)` for columns with no sub-table).

use crate::column::{Column, ColumnType};
use crate::error::ColumnError;
use crate::alloc::Allocator;
use crate::node::NodeArray;
use crate::Ref;

fn type_to_i64(kind: ColumnType) -> i64 {
    match kind {
        ColumnType::Int => 0,
        ColumnType::Bool => 1,
        ColumnType::Float => 2,
        ColumnType::Timestamp => 3,
        ColumnType::String => 4,
        ColumnType::Binary => 5,
        ColumnType::Link => 6,
    }
}

fn type_from_i64(v: i64) -> Result<ColumnType, ColumnError> {
    Ok(match v {
        0 => ColumnType::Int,
        1 => ColumnType::Bool,
        2 => ColumnType::Float,
        3 => ColumnType::Timestamp,
        4 => ColumnType::String,
        5 => ColumnType::Binary,
        6 => ColumnType::Link,
        _ => return Err(ColumnError::TypeMismatch),
    })
}

pub struct Spec {
    ref_: Ref,
}

impl Spec {
    pub fn create_empty(alloc: &mut Allocator) -> Result<Self, ColumnError> {
        let types = NodeArray::create_empty(alloc, false, false, false)?;
        let names = Column::create_empty(alloc, ColumnType::String)?;
        let subspecs = NodeArray::create_empty(alloc, false, true, false)?;
        let mut top = NodeArray::create_empty(alloc, false, true, false)?;
        top.add(alloc, types.as_ref().0 as i64)?;
        top.add(alloc, names.as_ref().0 as i64)?;
        top.add(alloc, subspecs.as_ref().0 as i64)?;
        Ok(Self { ref_: top.as_ref() })
    }

    pub fn from_ref(ref_: Ref) -> Self {
        Self { ref_ }
    }

    pub fn as_ref(&self) -> Ref {
        self.ref_
    }

    pub fn column_count(&self, alloc: &Allocator) -> Result<usize, ColumnError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        let types_ref = Ref(top.get(alloc, 0)? as u64);
        Ok(NodeArray::from_ref(alloc, types_ref)?.size())
    }

    pub fn column_type(&self, alloc: &Allocator, i: usize) -> Result<ColumnType, ColumnError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        let types_ref = Ref(top.get(alloc, 0)? as u64);
        let types = NodeArray::from_ref(alloc, types_ref)?;
        type_from_i64(types.get(alloc, i)?)
    }

    pub fn column_name(&self, alloc: &Allocator, i: usize) -> Result<String, ColumnError> {
        let top = NodeArray::from_ref(alloc, self.ref_)?;
        let names_ref = Ref(top.get(alloc, 1)? as u64);
        let names = Column::from_ref(names_ref, ColumnType::String);
        match names.get(alloc, i)? {
            crate::column::Value::String(s) => Ok(s),
            _ => Err(ColumnError::TypeMismatch),
        }
    }

    pub fn find_column(&self, alloc: &Allocator, name: &str) -> Result<Option<usize>, ColumnError> {
        let n = self.column_count(alloc)?;
        for i in 0..n {
            if self.column_name(alloc, i)? == name {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Append a column of `kind` named `name` with no sub-spec.
    pub fn add_column(&mut self, alloc: &mut Allocator, name: &str, kind: ColumnType) -> Result<(), ColumnError> {
        let mut top = NodeArray::from_ref(alloc, self.ref_)?;
        top.copy_on_write(alloc)?;

        let types_ref = Ref(top.get(alloc, 0)? as u64);
        let mut types = NodeArray::from_ref(alloc, types_ref)?;
        types.add(alloc, type_to_i64(kind))?;
        if types.as_ref() != types_ref {
            top.set(alloc, 0, types.as_ref().0 as i64)?;
        }

        let names_ref = Ref(top.get(alloc, 1)? as u64);
        let mut names = Column::from_ref(names_ref, ColumnType::String);
        names.add(alloc, crate::column::Value::String(name.to_string()))?;
        if names.as_ref() != names_ref {
            top.set(alloc, 1, names.as_ref().0 as i64)?;
        }

        let subspecs_ref = Ref(top.get(alloc, 2)? as u64);
        let mut subspecs = NodeArray::from_ref(alloc, subspecs_ref)?;
        subspecs.add(alloc, 0)?;
        if subspecs.as_ref() != subspecs_ref {
            top.set(alloc, 2, subspecs.as_ref().0 as i64)?;
        }

        self.ref_ = top.as_ref();
        Ok(())
    }

    /// Drop column `i` from the schema. The caller is responsible for
    /// freeing the corresponding column's root in the table's columns array.
    pub fn erase_column(&mut self, alloc: &mut Allocator, i: usize) -> Result<(), ColumnError> {
        let mut top = NodeArray::from_ref(alloc, self.ref_)?;
        top.copy_on_write(alloc)?;

        let types_ref = Ref(top.get(alloc, 0)? as u64);
        let mut types = NodeArray::from_ref(alloc, types_ref)?;
        types.erase(alloc, i)?;
        top.set(alloc, 0, types.as_ref().0 as i64)?;

        let names_ref = Ref(top.get(alloc, 1)? as u64);
        let mut names = Column::from_ref(names_ref, ColumnType::String);
        names.erase(alloc, i)?;
        top.set(alloc, 1, names.as_ref().0 as i64)?;

        let subspecs_ref = Ref(top.get(alloc, 2)? as u64);
        let mut subspecs = NodeArray::from_ref(alloc, subspecs_ref)?;
        subspecs.erase(alloc, i)?;
        top.set(alloc, 2, subspecs.as_ref().0 as i64)?;

        self.ref_ = top.as_ref();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_lookup_columns() {
        let mut alloc = Allocator::new_anon();
        let mut spec = Spec::create_empty(&mut alloc).unwrap();
        spec.add_column(&mut alloc, "name", ColumnType::String).unwrap();
        spec.add_column(&mut alloc, "age", ColumnType::Int).unwrap();
        assert_eq!(spec.column_count(&alloc).unwrap(), 2);
        assert_eq!(spec.column_name(&alloc, 0).unwrap(), "name");
        assert_eq!(spec.column_type(&alloc, 1).unwrap(), ColumnType::Int);
        assert_eq!(spec.find_column(&alloc, "age").unwrap(), Some(1));
        assert_eq!(spec.find_column(&alloc, "missing").unwrap(), None);
    }

    #[test]
    fn erase_column_shifts_remaining() {
        let mut alloc = Allocator::new_anon();
        let mut spec = Spec::create_empty(&mut alloc).unwrap();
        spec.add_column(&mut alloc, "a", ColumnType::Int).unwrap();
        spec.add_column(&mut alloc, "b", ColumnType::Int).unwrap();
        spec.erase_column(&mut alloc, 0).unwrap();
        assert_eq!(spec.column_count(&alloc).unwrap(), 1);
        assert_eq!(spec.column_name(&alloc, 0).unwrap(), "b");
    }
}
