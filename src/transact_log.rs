//! Transact Log (§4.G): an append-only, logical record of the mutations
//! performed during a write transaction, used by replication/observers.
//!
//! Each instruction is a type byte followed by a varint-encoded argument
//! stream (see `varint.rs`). The encoder coalesces repeated `Select*`
//! instructions: selecting the same table/descriptor/link-list twice in a
//! row emits nothing the second time.

use crate::column::{ColumnType, Value};
use crate::error::{GroupError, TransactLogError};
use crate::group::Group;
use crate::varint::{decode_i64, decode_u64, encode_i64, encode_u64};
use crate::alloc::Allocator;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    SelectTable = 1,
    SelectDescriptor = 2,
    SelectLinkList = 3,
    InsertEmptyRow = 4,
    SetInt = 5,
    SetBool = 6,
    SetFloat = 7,
    SetString = 8,
    SetBinary = 9,
    InsertColumn = 10,
    EraseColumn = 11,
    LinkListInsert = 12,
    LinkListSet = 13,
    LinkListErase = 14,
    LinkListClear = 15,
    CommitRecord = 16,
}

impl Op {
    fn from_byte(b: u8) -> Result<Op, TransactLogError> {
        Ok(match b {
            1 => Op::SelectTable,
            2 => Op::SelectDescriptor,
            3 => Op::SelectLinkList,
            4 => Op::InsertEmptyRow,
            5 => Op::SetInt,
            6 => Op::SetBool,
            7 => Op::SetFloat,
            8 => Op::SetString,
            9 => Op::SetBinary,
            10 => Op::InsertColumn,
            11 => Op::EraseColumn,
            12 => Op::LinkListInsert,
            13 => Op::LinkListSet,
            14 => Op::LinkListErase,
            15 => Op::LinkListClear,
            16 => Op::CommitRecord,
            other => return Err(TransactLogError::UnknownOpcode(other)),
        })
    }
}

/// One decoded logical instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    SelectTable { table_ndx: u64, subtable_path: Vec<u64> },
    SelectDescriptor { path: Vec<u64> },
    SelectLinkList { col: u64, row: u64, target_table_ndx: u64 },
    InsertEmptyRow { row: u64, num: u64 },
    SetInt { col: u64, row: u64, value: i64 },
    SetBool { col: u64, row: u64, value: bool },
    SetFloat { col: u64, row: u64, value: f64 },
    SetString { col: u64, row: u64, value: String },
    SetBinary { col: u64, row: u64, value: Vec<u8> },
    InsertColumn { col: u64, type_: u8, name: String },
    EraseColumn { col: u64 },
    LinkListInsert { row: u64, target: u64 },
    LinkListSet { row: u64, target: u64 },
    LinkListErase { row: u64 },
    LinkListClear,
    CommitRecord { new_version: u64 },
}

/// Selection state tracked purely to decide when a `Select*` call needs to
/// emit a new instruction rather than ride on the previous one.
#[derive(Default, PartialEq, Clone)]
struct Selection {
    table: Option<(u64, Vec<u64>)>,
    descriptor: Option<Vec<u64>>,
    link_list: Option<(u64, u64, u64)>,
}

/// Appends encoded instructions to an in-memory buffer across one write
/// transaction.
#[derive(Default)]
pub struct TransactLogEncoder {
    buf: Vec<u8>,
    current: Selection,
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    encode_u64(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

fn encode_bytes(b: &[u8], out: &mut Vec<u8>) {
    encode_u64(b.len() as u64, out);
    out.extend_from_slice(b);
}

impl TransactLogEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn select_table(&mut self, table_ndx: u64, subtable_path: &[u64]) {
        let want = (table_ndx, subtable_path.to_vec());
        if self.current.table.as_ref() == Some(&want) {
            return;
        }
        self.buf.push(Op::SelectTable as u8);
        encode_u64(table_ndx, &mut self.buf);
        encode_u64(subtable_path.len() as u64, &mut self.buf);
        for p in subtable_path {
            encode_u64(*p, &mut self.buf);
        }
        self.current.table = Some(want);
        self.current.descriptor = None;
        self.current.link_list = None;
    }

    pub fn select_descriptor(&mut self, path: &[u64]) {
        if self.current.descriptor.as_deref() == Some(path) {
            return;
        }
        self.buf.push(Op::SelectDescriptor as u8);
        encode_u64(path.len() as u64, &mut self.buf);
        for p in path {
            encode_u64(*p, &mut self.buf);
        }
        self.current.descriptor = Some(path.to_vec());
    }

    pub fn select_link_list(&mut self, col: u64, row: u64, target_table_ndx: u64) {
        let want = (col, row, target_table_ndx);
        if self.current.link_list == Some(want) {
            return;
        }
        self.buf.push(Op::SelectLinkList as u8);
        encode_u64(col, &mut self.buf);
        encode_u64(row, &mut self.buf);
        encode_u64(target_table_ndx, &mut self.buf);
        self.current.link_list = Some(want);
    }

    pub fn insert_empty_row(&mut self, row: u64, num: u64) {
        self.buf.push(Op::InsertEmptyRow as u8);
        encode_u64(row, &mut self.buf);
        encode_u64(num, &mut self.buf);
    }

    pub fn set_int(&mut self, col: u64, row: u64, value: i64) {
        self.buf.push(Op::SetInt as u8);
        encode_u64(col, &mut self.buf);
        encode_u64(row, &mut self.buf);
        encode_i64(value, &mut self.buf);
    }

    pub fn set_bool(&mut self, col: u64, row: u64, value: bool) {
        self.buf.push(Op::SetBool as u8);
        encode_u64(col, &mut self.buf);
        encode_u64(row, &mut self.buf);
        self.buf.push(value as u8);
    }

    pub fn set_float(&mut self, col: u64, row: u64, value: f64) {
        self.buf.push(Op::SetFloat as u8);
        encode_u64(col, &mut self.buf);
        encode_u64(row, &mut self.buf);
        encode_i64(value.to_bits() as i64, &mut self.buf);
    }

    pub fn set_string(&mut self, col: u64, row: u64, value: &str) {
        self.buf.push(Op::SetString as u8);
        encode_u64(col, &mut self.buf);
        encode_u64(row, &mut self.buf);
        encode_str(value, &mut self.buf);
    }

    pub fn set_binary(&mut self, col: u64, row: u64, value: &[u8]) {
        self.buf.push(Op::SetBinary as u8);
        encode_u64(col, &mut self.buf);
        encode_u64(row, &mut self.buf);
        encode_bytes(value, &mut self.buf);
    }

    pub fn insert_column(&mut self, col: u64, type_: u8, name: &str) {
        self.buf.push(Op::InsertColumn as u8);
        encode_u64(col, &mut self.buf);
        self.buf.push(type_);
        encode_str(name, &mut self.buf);
    }

    pub fn erase_column(&mut self, col: u64) {
        self.buf.push(Op::EraseColumn as u8);
        encode_u64(col, &mut self.buf);
    }

    pub fn link_list_insert(&mut self, row: u64, target: u64) {
        self.buf.push(Op::LinkListInsert as u8);
        encode_u64(row, &mut self.buf);
        encode_u64(target, &mut self.buf);
    }

    pub fn link_list_set(&mut self, row: u64, target: u64) {
        self.buf.push(Op::LinkListSet as u8);
        encode_u64(row, &mut self.buf);
        encode_u64(target, &mut self.buf);
    }

    pub fn link_list_erase(&mut self, row: u64) {
        self.buf.push(Op::LinkListErase as u8);
        encode_u64(row, &mut self.buf);
    }

    pub fn link_list_clear(&mut self) {
        self.buf.push(Op::LinkListClear as u8);
    }

    pub fn commit_record(&mut self, new_version: u64) {
        self.buf.push(Op::CommitRecord as u8);
        encode_u64(new_version, &mut self.buf);
    }
}

/// Decode a whole instruction stream into a `Vec<Instruction>`.
pub fn parse(mut buf: &[u8]) -> Result<Vec<Instruction>, TransactLogError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let op = Op::from_byte(buf[0])?;
        buf = &buf[1..];
        let (instr, rest) = parse_one(op, buf)?;
        out.push(instr);
        buf = rest;
    }
    Ok(out)
}

fn take_str<'a>(buf: &'a [u8]) -> Result<(String, &'a [u8]), TransactLogError> {
    let (len, used) = decode_u64(buf)?;
    let buf = &buf[used..];
    let len = len as usize;
    if buf.len() < len {
        return Err(TransactLogError::Malformed("truncated string"));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| TransactLogError::Malformed("string is not valid utf-8"))?;
    Ok((s, &buf[len..]))
}

fn take_bytes<'a>(buf: &'a [u8]) -> Result<(Vec<u8>, &'a [u8]), TransactLogError> {
    let (len, used) = decode_u64(buf)?;
    let buf = &buf[used..];
    let len = len as usize;
    if buf.len() < len {
        return Err(TransactLogError::Malformed("truncated binary value"));
    }
    Ok((buf[..len].to_vec(), &buf[len..]))
}

fn parse_one(op: Op, buf: &[u8]) -> Result<(Instruction, &[u8]), TransactLogError> {
    match op {
        Op::SelectTable => {
            let (table_ndx, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (path_len, used) = decode_u64(buf)?;
            let mut buf = &buf[used..];
            let mut subtable_path = Vec::with_capacity(path_len as usize);
            for _ in 0..path_len {
                let (v, used) = decode_u64(buf)?;
                subtable_path.push(v);
                buf = &buf[used..];
            }
            Ok((Instruction::SelectTable { table_ndx, subtable_path }, buf))
        }
        Op::SelectDescriptor => {
            let (path_len, used) = decode_u64(buf)?;
            let mut buf = &buf[used..];
            let mut path = Vec::with_capacity(path_len as usize);
            for _ in 0..path_len {
                let (v, used) = decode_u64(buf)?;
                path.push(v);
                buf = &buf[used..];
            }
            Ok((Instruction::SelectDescriptor { path }, buf))
        }
        Op::SelectLinkList => {
            let (col, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (target_table_ndx, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            Ok((Instruction::SelectLinkList { col, row, target_table_ndx }, buf))
        }
        Op::InsertEmptyRow => {
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (num, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            Ok((Instruction::InsertEmptyRow { row, num }, buf))
        }
        Op::SetInt => {
            let (col, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (value, used) = decode_i64(buf)?;
            let buf = &buf[used..];
            Ok((Instruction::SetInt { col, row, value }, buf))
        }
        Op::SetBool => {
            let (col, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            if buf.is_empty() {
                return Err(TransactLogError::Malformed("truncated bool"));
            }
            let value = buf[0] != 0;
            Ok((Instruction::SetBool { col, row, value }, &buf[1..]))
        }
        Op::SetFloat => {
            let (col, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (bits, used) = decode_i64(buf)?;
            let buf = &buf[used..];
            Ok((Instruction::SetFloat { col, row, value: f64::from_bits(bits as u64) }, buf))
        }
        Op::SetString => {
            let (col, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (value, buf) = take_str(buf)?;
            Ok((Instruction::SetString { col, row, value }, buf))
        }
        Op::SetBinary => {
            let (col, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (value, buf) = take_bytes(buf)?;
            Ok((Instruction::SetBinary { col, row, value }, buf))
        }
        Op::InsertColumn => {
            let (col, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            if buf.is_empty() {
                return Err(TransactLogError::Malformed("truncated column type"));
            }
            let type_ = buf[0];
            let (name, buf) = take_str(&buf[1..])?;
            Ok((Instruction::InsertColumn { col, type_, name }, buf))
        }
        Op::EraseColumn => {
            let (col, used) = decode_u64(buf)?;
            Ok((Instruction::EraseColumn { col }, &buf[used..]))
        }
        Op::LinkListInsert => {
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (target, used) = decode_u64(buf)?;
            Ok((Instruction::LinkListInsert { row, target }, &buf[used..]))
        }
        Op::LinkListSet => {
            let (row, used) = decode_u64(buf)?;
            let buf = &buf[used..];
            let (target, used) = decode_u64(buf)?;
            Ok((Instruction::LinkListSet { row, target }, &buf[used..]))
        }
        Op::LinkListErase => {
            let (row, used) = decode_u64(buf)?;
            Ok((Instruction::LinkListErase { row }, &buf[used..]))
        }
        Op::LinkListClear => Ok((Instruction::LinkListClear, buf)),
        Op::CommitRecord => {
            let (new_version, used) = decode_u64(buf)?;
            Ok((Instruction::CommitRecord { new_version }, &buf[used..]))
        }
    }
}

pub(crate) fn type_byte(kind: ColumnType) -> u8 {
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

fn type_from_byte(b: u8) -> Result<ColumnType, TransactLogError> {
    Ok(match b {
        0 => ColumnType::Int,
        1 => ColumnType::Bool,
        2 => ColumnType::Float,
        3 => ColumnType::Timestamp,
        4 => ColumnType::String,
        5 => ColumnType::Binary,
        6 => ColumnType::Link,
        _ => return Err(TransactLogError::Malformed("unrecognized column type byte")),
    })
}

/// A destination for replayed instructions (§4.G, §8 invariant 6:
/// "replaying the log against the pre-commit snapshot yields the state
/// committed at v"). `GroupSink` replays directly into a `Group`+
/// `Allocator` pair; other sinks (e.g. a pure validator that only checks
/// well-formedness) can implement this trait without touching storage.
pub trait TransactLogParser {
    fn apply_instruction(&mut self, instr: &Instruction) -> Result<(), GroupError>;

    fn apply_all(&mut self, instructions: &[Instruction]) -> Result<(), GroupError> {
        for instr in instructions {
            self.apply_instruction(instr)?;
        }
        Ok(())
    }
}

/// Replays a decoded instruction stream against a borrowed `Group`+
/// `Allocator`, tracking the currently selected table across instructions
/// the way the encoder's own coalescing does on the write side. This is
/// the sink this crate's own tests (and `WriteTransaction::commit`'s
/// cross-check) replay into.
pub struct GroupSink<'a> {
    pub group: &'a mut Group,
    pub alloc: &'a mut Allocator,
    selected_table: Option<String>,
}

impl<'a> GroupSink<'a> {
    pub fn new(group: &'a mut Group, alloc: &'a mut Allocator) -> Self {
        Self { group, alloc, selected_table: None }
    }

    fn apply_set(&mut self, col: u64, row: u64, value: Value) -> Result<(), GroupError> {
        let name = require_selected(&self.selected_table)?.clone();
        let mut table =
            self.group.get_table(self.alloc, &name)?.ok_or_else(|| GroupError::NoSuchTable(name.clone()))?;
        let handle = nth_column_handle(&table, self.alloc, col as usize)?;
        table.set(self.alloc, handle, row as usize, value, &mut TransactLogEncoder::new())?;
        self.group.commit_table(self.alloc, &name, &table)?;
        Ok(())
    }
}

impl<'a> TransactLogParser for GroupSink<'a> {
    fn apply_instruction(&mut self, instr: &Instruction) -> Result<(), GroupError> {
        match instr {
            Instruction::SelectTable { table_ndx, .. } => {
                let name = self.group.table_name(self.alloc, *table_ndx as usize)?;
                self.selected_table = Some(name);
            }
            Instruction::SelectDescriptor { .. } | Instruction::SelectLinkList { .. } => {
                // Sub-table descriptors and link lists are external-collaborator
                // features per spec.md §1; the selection is tracked but not
                // resolved against nested structure here.
            }
            Instruction::InsertEmptyRow { row, num } => {
                let name = require_selected(&self.selected_table)?.clone();
                let mut table =
                    self.group.get_table(self.alloc, &name)?.ok_or_else(|| GroupError::NoSuchTable(name.clone()))?;
                table.insert_empty_row(self.alloc, *row as usize, *num as usize, &mut TransactLogEncoder::new())?;
                self.group.commit_table(self.alloc, &name, &table)?;
            }
            Instruction::SetInt { col, row, value } => {
                self.apply_set(*col, *row, Value::Int(*value))?;
            }
            Instruction::SetBool { col, row, value } => {
                self.apply_set(*col, *row, Value::Bool(*value))?;
            }
            Instruction::SetFloat { col, row, value } => {
                self.apply_set(*col, *row, Value::Float(*value))?;
            }
            Instruction::SetString { col, row, value } => {
                self.apply_set(*col, *row, Value::String(value.clone()))?;
            }
            Instruction::SetBinary { col, row, value } => {
                self.apply_set(*col, *row, Value::Binary(value.clone()))?;
            }
            Instruction::InsertColumn { type_, name: col_name, .. } => {
                let name = require_selected(&self.selected_table)?.clone();
                let mut table =
                    self.group.get_table(self.alloc, &name)?.ok_or_else(|| GroupError::NoSuchTable(name.clone()))?;
                table.add_column(
                    self.alloc,
                    col_name,
                    type_from_byte(*type_).map_err(|_| GroupError::Column(crate::error::ColumnError::TypeMismatch))?,
                    &mut TransactLogEncoder::new(),
                )?;
                self.group.commit_table(self.alloc, &name, &table)?;
            }
            Instruction::EraseColumn { col } => {
                let name = require_selected(&self.selected_table)?.clone();
                let mut table =
                    self.group.get_table(self.alloc, &name)?.ok_or_else(|| GroupError::NoSuchTable(name.clone()))?;
                let handle = nth_column_handle(&table, self.alloc, *col as usize)?;
                table.erase_column(self.alloc, handle, &mut TransactLogEncoder::new())?;
                self.group.commit_table(self.alloc, &name, &table)?;
            }
            Instruction::LinkListInsert { .. }
            | Instruction::LinkListSet { .. }
            | Instruction::LinkListErase { .. }
            | Instruction::LinkListClear => {
                // Link lists are out of scope for this engine's core (spec.md §1).
            }
            Instruction::CommitRecord { .. } => {}
        }
        Ok(())
    }
}

/// Replay a decoded instruction stream against `group`. A parser applied to
/// a snapshot at version `v-1` must, on replay, produce the state committed
/// at version `v` (§4.G). Thin driver over [`GroupSink`]; implement
/// [`TransactLogParser`] directly for other sinks.
pub fn apply(group: &mut Group, alloc: &mut Allocator, instructions: &[Instruction]) -> Result<(), GroupError> {
    GroupSink::new(group, alloc).apply_all(instructions)
}

fn require_selected(selected: &Option<String>) -> Result<&String, GroupError> {
    selected.as_ref().ok_or(GroupError::StaleAccessor)
}

fn nth_column_handle(table: &crate::table::Table, alloc: &Allocator, i: usize) -> Result<crate::table::ColumnHandle, GroupError> {
    let name = table_column_name(table, alloc, i)?;
    table
        .find_column(alloc, &name)?
        .ok_or_else(|| GroupError::Column(crate::error::ColumnError::IndexOutOfBounds { index: i, size: 0 }))
}

fn table_column_name(table: &crate::table::Table, alloc: &Allocator, i: usize) -> Result<String, GroupError> {
    // `Table` doesn't expose its spec directly; re-derive via find_column's
    // sibling lookups is unnecessary here since column order is stable and
    // `Spec::column_name` is reachable through the table's own ref.
    let spec_top = crate::node::NodeArray::from_ref(alloc, table.as_ref())?;
    let spec = crate::spec::Spec::from_ref(crate::Ref(spec_top.get(alloc, 0)? as u64));
    spec.column_name(alloc, i).map_err(GroupError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_table_coalesces() {
        let mut enc = TransactLogEncoder::new();
        enc.select_table(0, &[]);
        enc.set_int(0, 0, 42);
        enc.select_table(0, &[]);
        enc.set_int(1, 0, 7);
        let bytes = enc.into_bytes();
        let parsed = parse(&bytes).unwrap();
        let select_count = parsed.iter().filter(|i| matches!(i, Instruction::SelectTable { .. })).count();
        assert_eq!(select_count, 1);
    }

    #[test]
    fn roundtrips_string_and_binary_values() {
        let mut enc = TransactLogEncoder::new();
        enc.select_table(2, &[]);
        enc.set_string(0, 1, "hello");
        enc.set_binary(1, 1, &[1, 2, 3]);
        enc.commit_record(5);
        let bytes = enc.into_bytes();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(
            parsed,
            vec![
                Instruction::SelectTable { table_ndx: 2, subtable_path: vec![] },
                Instruction::SetString { col: 0, row: 1, value: "hello".into() },
                Instruction::SetBinary { col: 1, row: 1, value: vec![1, 2, 3] },
                Instruction::CommitRecord { new_version: 5 },
            ]
        );
    }

    #[test]
    fn rejects_unknown_opcode() {
        let buf = [200u8];
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn group_sink_replay_matches_direct_writes() {
        use crate::table::Table;

        let mut alloc = Allocator::new_anon();
        let mut group = Group::create_empty(&mut alloc).unwrap();
        let mut log = TransactLogEncoder::new();
        let mut table = group.add_table(&mut alloc, "t").unwrap();
        table.add_column(&mut alloc, "name", ColumnType::String, &mut log).unwrap();
        table.add_row(&mut alloc, &[Value::String("joe".into())], &mut log).unwrap();
        table.add_row(&mut alloc, &[Value::String("jane".into())], &mut log).unwrap();
        group.commit_table(&mut alloc, "t", &table).unwrap();
        let instructions = parse(&log.into_bytes()).unwrap();

        let mut replay_alloc = Allocator::new_anon();
        let mut replay_group = Group::create_empty(&mut replay_alloc).unwrap();
        replay_group.add_table(&mut replay_alloc, "t").unwrap();
        let mut sink = GroupSink::new(&mut replay_group, &mut replay_alloc);
        sink.apply_all(&instructions).unwrap();

        let replayed: Table = replay_group.get_table(&replay_alloc, "t").unwrap().unwrap();
        assert_eq!(replayed.row_count(&replay_alloc).unwrap(), 2);
        let name = replayed.find_column(&replay_alloc, "name").unwrap().unwrap();
        assert_eq!(replayed.get(&replay_alloc, name, 0).unwrap(), Value::String("joe".into()));
        assert_eq!(replayed.get(&replay_alloc, name, 1).unwrap(), Value::String("jane".into()));
    }
}
