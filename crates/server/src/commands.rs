//! The stack command surface.
//!
//! Each handler manipulates the connection's operand stack and produces a
//! response payload beginning with a status word. Large values stream in
//! chunks: responses carry the offset they start at, and the client
//! resumes by passing that hint back.

use whais_core::endian::{Reader, Writer};
use whais_core::types::{TypeDescriptor, TypeId, TypeWord};
use whais_core::value::{ArrayValue, Scalar, Value};

use whais_vm::operand::{NullOperand, Operand, TableOperand};
use whais_vm::{OperandSemantics, Session, SessionStack};

use crate::errors::{ConnectionError, Result};
use crate::frame::Status;

/// Column marker for "the top value itself is the target".
pub const NO_FIELD: u16 = u16::MAX;
/// Row marker matching [`NO_FIELD`].
pub const NO_ROW: u32 = u32::MAX;

pub struct CommandContext<'a> {
    pub session: &'a Session,
    pub stack: &'a mut SessionStack,
    pub max_frame: u32,
}

fn ok_payload() -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(Status::Ok as u32);
    w.into_bytes()
}

fn status_payload(status: Status, message: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(status as u32);
    w.cstr(message);
    w.into_bytes()
}

impl CommandContext<'_> {
    /// `PUSH_STACK`: push a typed null of the described type. A table
    /// descriptor allocates a fresh temporary table to receive results.
    pub fn push_stack(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let (descriptor, _) = TypeDescriptor::parse(payload)
            .map_err(|_| ConnectionError::MalformedPayload("PUSH_STACK"))?;
        let operand = match &descriptor {
            TypeDescriptor::Table(fields) => {
                let table = match self.session.dbs().create_temp_table(fields.clone()) {
                    Ok(table) => table,
                    Err(e) => {
                        return Ok(status_payload(Status::GeneralError, &e.to_string()));
                    }
                };
                Operand::Table(TableOperand { table })
            }
            TypeDescriptor::Simple(word) => {
                if word.is_field() {
                    return Ok(status_payload(
                        Status::InvalidArgs,
                        "cannot push a bare field",
                    ));
                }
                let kind = word
                    .base()
                    .map_err(|_| ConnectionError::MalformedPayload("PUSH_STACK"))?;
                if word.is_array() {
                    Operand::array(kind, None)
                } else if kind == TypeId::Text {
                    Operand::text(None)
                } else if kind == TypeId::Undetermined {
                    Operand::Null(NullOperand)
                } else {
                    match Scalar::null_of(kind) {
                        Some(null) => Operand::scalar(null),
                        None => {
                            return Ok(status_payload(
                                Status::InvalidArgs,
                                "type is not pushable",
                            ));
                        }
                    }
                }
            }
        };
        match self.stack.push(operand) {
            Ok(()) => Ok(ok_payload()),
            Err(e) => Ok(status_payload(Status::StackError, e.message())),
        }
    }

    pub fn pop_stack(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(payload);
        let count = r
            .u32()
            .map_err(|_| ConnectionError::MalformedPayload("POP_STACK"))? as usize;
        let count = count.min(self.stack.size());
        match self.stack.pop(count) {
            Ok(()) => Ok(ok_payload()),
            Err(e) => Ok(status_payload(Status::StackError, e.message())),
        }
    }

    /// `UPDATE_STACK_TOP`: write into the value on top of the stack.
    /// Layout: `u16 field | u32 row | u64 offset | bytes`. Scalars use the
    /// `NO_FIELD`/`NO_ROW` markers; array elements index with `row`; text
    /// writes resume at byte `offset`.
    pub fn update_stack_top(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(payload);
        let malformed = || ConnectionError::MalformedPayload("UPDATE_STACK_TOP");
        let field = r.u16().map_err(|_| malformed())?;
        let row = r.u32().map_err(|_| malformed())?;
        let offset = r.u64().map_err(|_| malformed())?;
        let bytes = r.bytes(r.remaining()).map_err(|_| malformed())?;

        let Ok(top) = self.stack.top_pos() else {
            return Ok(status_payload(Status::StackError, "the stack is empty"));
        };
        let word = match self.stack.operand(top).and_then(|op| op.type_word(self.stack)) {
            Ok(word) => word,
            Err(e) => return Ok(status_payload(Status::GeneralError, e.message())),
        };

        let outcome = if word & whais_core::types::TABLE_MASK != 0 {
            self.update_table_cell(top, field, row, offset, bytes)
        } else if word & whais_core::types::ARRAY_MASK != 0 {
            self.update_array_elem(top, row, bytes, word)
        } else if word == TypeId::Text.code() {
            self.update_text(top, offset, bytes)
        } else {
            self.update_scalar(top, word, bytes)
        };
        Ok(match outcome {
            Ok(()) => ok_payload(),
            Err(status) => status_payload(status.0, &status.1),
        })
    }

    fn update_scalar(
        &mut self,
        pos: usize,
        word: u16,
        bytes: &[u8],
    ) -> std::result::Result<(), (Status, String)> {
        let kind = TypeId::from_code(word & 0x00FF)
            .map_err(|e| (Status::TypeMismatch, e.to_string()))?;
        let value = if bytes.is_empty() {
            Scalar::null_of(kind).ok_or((Status::TypeMismatch, "not a scalar".into()))?
        } else {
            let mut r = Reader::new(bytes);
            Scalar::read_stored(kind, &mut r)
                .map_err(|e| (Status::InvalidArgs, e.to_string()))?
        };
        self.stack
            .store_scalar(pos, value)
            .map_err(|e| (Status::TypeMismatch, e.message().to_string()))
    }

    fn update_text(
        &mut self,
        pos: usize,
        offset: u64,
        bytes: &[u8],
    ) -> std::result::Result<(), (Status, String)> {
        let current = self
            .stack
            .get_text(pos)
            .map_err(|e| (Status::TypeMismatch, e.message().to_string()))?;
        let mut raw = match (offset, current) {
            (0, _) => Vec::new(),
            (_, Some(text)) if text.len() as u64 == offset => text.into_bytes(),
            _ => {
                return Err((
                    Status::InvalidArgs,
                    "text updates must resume at the current end".into(),
                ));
            }
        };
        raw.extend_from_slice(bytes);
        let text = String::from_utf8(raw)
            .map_err(|_| (Status::InvalidArgs, "text chunk breaks UTF-8".into()))?;
        self.stack
            .store_text(pos, Some(text))
            .map_err(|e| (Status::TypeMismatch, e.message().to_string()))
    }

    fn update_array_elem(
        &mut self,
        pos: usize,
        index: u32,
        bytes: &[u8],
        word: u16,
    ) -> std::result::Result<(), (Status, String)> {
        let kind = TypeId::from_code(word & 0x00FF)
            .map_err(|e| (Status::TypeMismatch, e.to_string()))?;
        let mut r = Reader::new(bytes);
        let value = Scalar::read_stored(kind, &mut r)
            .map_err(|e| (Status::InvalidArgs, e.to_string()))?;
        let mut array = match self
            .stack
            .get_array(pos)
            .map_err(|e| (Status::TypeMismatch, e.message().to_string()))?
        {
            Some(array) => array,
            None => ArrayValue::new(kind).map_err(|e| (Status::TypeMismatch, e.to_string()))?,
        };
        let index = index as usize;
        if index < array.len() {
            array
                .set(index, value)
                .map_err(|e| (Status::TypeMismatch, e.to_string()))?;
        } else if index == array.len() {
            array
                .push(value)
                .map_err(|e| (Status::TypeMismatch, e.to_string()))?;
        } else {
            return Err((Status::InvalidArgs, "array update past the end".into()));
        }
        self.stack
            .store_array(pos, Some(array))
            .map_err(|e| (Status::TypeMismatch, e.message().to_string()))
    }

    fn update_table_cell(
        &mut self,
        pos: usize,
        field: u16,
        row: u32,
        offset: u64,
        bytes: &[u8],
    ) -> std::result::Result<(), (Status, String)> {
        if field == NO_FIELD || row == NO_ROW {
            return Err((
                Status::InvalidArgs,
                "table updates address a (field, row) cell".into(),
            ));
        }
        let Ok(Operand::Table(table_op)) = self
            .stack
            .operand(pos)
            .map(|op| op.clone().materialize(self.stack))
            .map_err(|e| (Status::GeneralError, e.message().to_string()))?
            .map_err(|e| (Status::GeneralError, e.message().to_string()))
        else {
            return Err((Status::TypeMismatch, "top of stack is not a table".into()));
        };
        let table = table_op.table;
        let spec = table
            .schema()
            .field(field)
            .map_err(|e| (Status::InvalidArgs, e.to_string()))?
            .clone();

        let value = if spec.is_array {
            let bytes_len = bytes.len();
            let width = spec.kind.stored_width();
            if bytes_len % width != 0 {
                return Err((Status::InvalidArgs, "ragged array payload".into()));
            }
            let array = ArrayValue::deserialize(spec.kind, bytes)
                .map_err(|e| (Status::InvalidArgs, e.to_string()))?;
            Value::Array(spec.kind, Some(array))
        } else if spec.kind == TypeId::Text {
            let current = match table.get(row as u64, field) {
                Ok(Value::Text(text)) => text,
                Ok(_) => return Err((Status::TypeMismatch, "cell is not a TEXT".into())),
                Err(e) => return Err((Status::InvalidArgs, e.to_string())),
            };
            let mut raw = match (offset, current) {
                (0, _) => Vec::new(),
                (_, Some(text)) if text.len() as u64 == offset => text.into_bytes(),
                _ => {
                    return Err((
                        Status::InvalidArgs,
                        "text updates must resume at the current end".into(),
                    ));
                }
            };
            raw.extend_from_slice(bytes);
            let text = String::from_utf8(raw)
                .map_err(|_| (Status::InvalidArgs, "text chunk breaks UTF-8".into()))?;
            Value::Text(Some(text))
        } else if bytes.is_empty() {
            Value::Scalar(
                Scalar::null_of(spec.kind)
                    .ok_or((Status::TypeMismatch, "not a scalar field".into()))?,
            )
        } else {
            let mut r = Reader::new(bytes);
            Value::Scalar(
                Scalar::read_stored(spec.kind, &mut r)
                    .map_err(|e| (Status::InvalidArgs, e.to_string()))?,
            )
        };

        table
            .set(row as u64, field, &value)
            .map_err(|e| (Status::InvalidArgs, e.to_string()))
    }

    /// `UPDATE_STACK_TABLE_ADD_ROWS`: append null rows to the table on
    /// top of the stack.
    pub fn add_rows(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(payload);
        let count = r
            .u32()
            .map_err(|_| ConnectionError::MalformedPayload("ADD_ROWS"))?;
        let Ok(top) = self.stack.top_pos() else {
            return Ok(status_payload(Status::StackError, "the stack is empty"));
        };
        let operand = self
            .stack
            .operand(top)
            .and_then(|op| op.materialize(self.stack));
        let Ok(Operand::Table(table_op)) = operand else {
            return Ok(status_payload(
                Status::TypeMismatch,
                "top of stack is not a table",
            ));
        };
        for _ in 0..count {
            if let Err(e) = table_op.table.add_row() {
                return Ok(status_payload(Status::GeneralError, &e.to_string()));
            }
        }
        Ok(ok_payload())
    }

    /// `READ_STACK_TOP`: serialize the top value. The payload carries the
    /// resume hints `u16 field | u32 row | u64 array_off | u64 text_off`.
    pub fn read_stack_top(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(payload);
        let malformed = || ConnectionError::MalformedPayload("READ_STACK_TOP");
        let hint_field = r.u16().map_err(|_| malformed())?;
        let hint_row = r.u32().map_err(|_| malformed())?;
        let hint_array = r.u64().map_err(|_| malformed())?;
        let hint_text = r.u64().map_err(|_| malformed())?;

        let Ok(top) = self.stack.top_pos() else {
            return Ok(status_payload(Status::StackError, "the stack is empty"));
        };
        let operand = match self.stack.operand(top).and_then(|op| op.materialize(self.stack)) {
            Ok(op) => op,
            Err(e) => return Ok(status_payload(Status::GeneralError, e.message())),
        };

        let mut w = Writer::new();
        w.u32(Status::Ok as u32);
        let budget = self.max_frame as usize - 64;
        match &operand {
            Operand::Table(table_op) => {
                let table = &table_op.table;
                w.bytes(&TypeDescriptor::Table(table.schema().fields().to_vec()).serialize());
                w.u64(table.allocated_rows());
                let field = if hint_field == NO_FIELD { 0 } else { hint_field };
                let row = if hint_row == NO_ROW { 0 } else { hint_row };
                w.u16(field);
                w.u32(row);
                if table.allocated_rows() > u64::from(row) {
                    match table.get(u64::from(row), field) {
                        Ok(value) => {
                            write_cell(&mut w, &value, hint_array, hint_text, budget)
                        }
                        Err(e) => {
                            return Ok(status_payload(Status::InvalidArgs, &e.to_string()));
                        }
                    }
                }
            }
            Operand::Field(field_op) => {
                let spec = match field_op.table.schema().field(field_op.field) {
                    Ok(spec) => spec.clone(),
                    Err(e) => return Ok(status_payload(Status::GeneralError, &e.to_string())),
                };
                let descriptor =
                    TypeDescriptor::Simple(TypeWord::field(spec.kind, spec.is_array));
                w.bytes(&descriptor.serialize());
                w.u64(field_op.table.allocated_rows());
                let row = if hint_row == NO_ROW { 0 } else { hint_row };
                w.u16(field_op.field);
                w.u32(row);
                if field_op.table.allocated_rows() > u64::from(row) {
                    match field_op.table.get(u64::from(row), field_op.field) {
                        Ok(value) => {
                            write_cell(&mut w, &value, hint_array, hint_text, budget)
                        }
                        Err(e) => {
                            return Ok(status_payload(Status::InvalidArgs, &e.to_string()));
                        }
                    }
                }
            }
            other => {
                let word = match other.type_word(self.stack) {
                    Ok(word) => word,
                    Err(e) => return Ok(status_payload(Status::GeneralError, e.message())),
                };
                let descriptor = TypeDescriptor::Simple(
                    TypeWord::from_raw(word)
                        .unwrap_or(TypeWord::scalar(TypeId::Undetermined)),
                );
                w.bytes(&descriptor.serialize());
                if word & whais_core::types::ARRAY_MASK != 0 {
                    let array = other
                        .get_array(self.stack)
                        .map_err(|_| ConnectionError::MalformedPayload("READ_STACK_TOP"))?;
                    write_array(&mut w, array.as_ref(), hint_array, budget);
                } else if word == TypeId::Text.code() {
                    let text = other
                        .get_text(self.stack)
                        .map_err(|_| ConnectionError::MalformedPayload("READ_STACK_TOP"))?;
                    write_text(&mut w, text.as_deref(), hint_text, budget);
                } else if word == TypeId::Undetermined.code() {
                    w.u8(1);
                } else {
                    let kind = TypeId::from_code(word & 0x00FF)
                        .map_err(|_| ConnectionError::MalformedPayload("READ_STACK_TOP"))?;
                    let scalar = match other.get_scalar(self.stack, kind) {
                        Ok(scalar) => scalar,
                        Err(e) => {
                            return Ok(status_payload(Status::GeneralError, e.message()));
                        }
                    };
                    write_scalar(&mut w, &scalar);
                }
            }
        }
        Ok(w.into_bytes())
    }

    /// `EXECUTE`: run a procedure against this connection's stack.
    pub fn execute(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(payload);
        let name = r
            .cstr()
            .map_err(|_| ConnectionError::MalformedPayload("EXECUTE"))?;
        match self.session.execute_procedure(name, self.stack) {
            Ok(()) => Ok(ok_payload()),
            Err(e) => {
                log::warn!("procedure '{name}' faulted: {e}");
                let status = if e.kind == whais_vm::InterErrorKind::ProcedureNotFound {
                    Status::NotFound
                } else {
                    Status::ProcedureFault
                };
                Ok(status_payload(status, &e.to_string()))
            }
        }
    }

    pub fn list_globals(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(Status::Ok as u32);
        let count = self.session.global_values_count();
        w.u32(count);
        for index in 0..count {
            if let Some(id) = self.session.global_id_at(index) {
                if let Ok(def) = self.session.global_def(id) {
                    w.cstr(&def.name);
                }
            }
        }
        w.into_bytes()
    }

    pub fn list_procedures(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(Status::Ok as u32);
        let count = self.session.procedures_count();
        w.u32(count);
        for index in 0..count {
            if let Some(id) = self.session.procedure_id_at(index) {
                if let Ok(procedure) = self.session.procedure(id) {
                    w.cstr(&procedure.name);
                }
            }
        }
        w.into_bytes()
    }

    pub fn describe_procedure(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(payload);
        let name = r
            .cstr()
            .map_err(|_| ConnectionError::MalformedPayload("DESCRIBE_PROCEDURE"))?;
        let Some(id) = self.session.find_procedure(name) else {
            return Ok(status_payload(Status::NotFound, name));
        };
        let procedure = match self.session.procedure(id) {
            Ok(procedure) => procedure,
            Err(e) => return Ok(status_payload(Status::GeneralError, e.message())),
        };
        let mut w = Writer::new();
        w.u32(Status::Ok as u32);
        w.u16(procedure.args_count);
        w.u16(procedure.local_descriptors.len() as u16);
        for descriptor in &procedure.local_descriptors {
            w.bytes(&descriptor.serialize());
        }
        Ok(w.into_bytes())
    }
}

fn write_scalar(w: &mut Writer, value: &Scalar) {
    if value.is_null() {
        w.u8(1);
    } else {
        w.u8(0);
        value.write_stored(w);
    }
}

/// Text wire shape: `u64 total_bytes | u64 chunk_offset | chunk`.
fn write_text(w: &mut Writer, text: Option<&str>, hint: u64, budget: usize) {
    match text {
        None => {
            w.u8(1);
        }
        Some(text) => {
            w.u8(0);
            let bytes = text.as_bytes();
            let start = (hint as usize).min(bytes.len());
            // Never split a UTF-8 sequence across frames.
            let mut end = (start + budget).min(bytes.len());
            while end < bytes.len() && bytes[end] & 0xC0 == 0x80 {
                end -= 1;
            }
            w.u64(bytes.len() as u64);
            w.u64(start as u64);
            w.bytes(&bytes[start..end]);
        }
    }
}

/// Array wire shape: `u64 total_elems | u64 start_elem | packed elems`.
fn write_array(w: &mut Writer, array: Option<&ArrayValue>, hint: u64, budget: usize) {
    match array {
        None => {
            w.u8(1);
        }
        Some(array) => {
            w.u8(0);
            let width = array.elem_kind().stored_width().max(1);
            let start = (hint as usize).min(array.len());
            let fit = (budget / width).max(1);
            let end = (start + fit).min(array.len());
            w.u64(array.len() as u64);
            w.u64(start as u64);
            for item in &array.items()[start..end] {
                item.write_stored(w);
            }
        }
    }
}

/// One table cell with its own resume hints.
fn write_cell(w: &mut Writer, value: &Value, hint_array: u64, hint_text: u64, budget: usize) {
    match value {
        Value::Scalar(scalar) => write_scalar(w, scalar),
        Value::Text(text) => write_text(w, text.as_deref(), hint_text, budget),
        Value::Array(_, array) => write_array(w, array.as_ref(), hint_array, budget),
    }
}

/// Client-side helper for text hints: next byte offset after a chunk.
pub fn next_text_hint(total: u64, offset: u64, chunk_len: usize) -> Option<u64> {
    let next = offset + chunk_len as u64;
    (next < total).then_some(next)
}
