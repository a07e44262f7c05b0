//! Runtime operands.
//!
//! Every stack slot holds an [`Operand`]. Reads go through the
//! [`OperandSemantics`] capability trait with the stack as context so that
//! local-slot indirections and table-backed operands resolve on demand;
//! writes are routed through the stack by position (see `stack.rs`).

use std::sync::{Arc, RwLock};

use enum_dispatch::enum_dispatch;
use whais_core::types::{ARRAY_MASK, FIELD_MASK, TABLE_MASK, TypeId};
use whais_core::value::{ArrayValue, Scalar, Value};
use whais_core::{FieldIndex, RowId};
use whais_dbs::Table;

use crate::errors::{InterError, InterErrorKind, Result};
use crate::stack::SessionStack;

pub(crate) fn type_mismatch(what: &str) -> InterError {
    InterError::new(InterErrorKind::FieldTypeMismatch, what.to_string())
}

pub(crate) fn invalid_op(what: &str) -> InterError {
    InterError::new(InterErrorKind::InvalidOp, what.to_string())
}

/// Shared mutable cell behind a non-table global value.
pub type GlobalCell = Arc<RwLock<Value>>;

#[enum_dispatch]
pub trait OperandSemantics {
    /// Wire-format type word of this operand.
    fn type_word(&self, stack: &SessionStack) -> Result<u16>;

    fn is_null(&self, stack: &SessionStack) -> Result<bool>;

    /// Typed scalar read with widening; a null operand reads as the null
    /// of the requested kind.
    fn get_scalar(&self, stack: &SessionStack, want: TypeId) -> Result<Scalar>;

    fn get_text(&self, stack: &SessionStack) -> Result<Option<String>>;

    fn get_array(&self, stack: &SessionStack) -> Result<Option<ArrayValue>>;
}

/// Untyped null pushed by `LDNULL`; a store retypes the slot.
#[derive(Clone, Copy, Default, Debug)]
pub struct NullOperand;

impl OperandSemantics for NullOperand {
    fn type_word(&self, _: &SessionStack) -> Result<u16> {
        Ok(TypeId::Undetermined.code())
    }

    fn is_null(&self, _: &SessionStack) -> Result<bool> {
        Ok(true)
    }

    fn get_scalar(&self, _: &SessionStack, want: TypeId) -> Result<Scalar> {
        Scalar::null_of(want).ok_or_else(|| type_mismatch("null operand read as TEXT"))
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        Ok(None)
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        Ok(None)
    }
}

/// By-value scalar, text or array.
#[derive(Clone, Debug)]
pub struct ValueOperand(pub Value);

fn value_type_word(value: &Value) -> u16 {
    match value {
        Value::Scalar(s) => s.kind().code(),
        Value::Text(_) => TypeId::Text.code(),
        Value::Array(elem, _) => elem.code() | ARRAY_MASK,
    }
}

impl OperandSemantics for ValueOperand {
    fn type_word(&self, _: &SessionStack) -> Result<u16> {
        Ok(value_type_word(&self.0))
    }

    fn is_null(&self, _: &SessionStack) -> Result<bool> {
        Ok(self.0.is_null())
    }

    fn get_scalar(&self, _: &SessionStack, want: TypeId) -> Result<Scalar> {
        match &self.0 {
            Value::Scalar(s) => Ok(s.cast(want)?),
            _ => Err(type_mismatch("value is not a scalar")),
        }
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        match &self.0 {
            Value::Text(t) => Ok(t.clone()),
            _ => Err(type_mismatch("value is not a TEXT")),
        }
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        match &self.0 {
            Value::Array(_, a) => Ok(a.clone()),
            _ => Err(type_mismatch("value is not an ARRAY")),
        }
    }
}

/// Shared reference to a table; null iff the table has no rows.
#[derive(Clone)]
pub struct TableOperand {
    pub table: Arc<Table>,
}

impl OperandSemantics for TableOperand {
    fn type_word(&self, _: &SessionStack) -> Result<u16> {
        Ok(TABLE_MASK)
    }

    fn is_null(&self, _: &SessionStack) -> Result<bool> {
        Ok(self.table.allocated_rows() == 0)
    }

    fn get_scalar(&self, _: &SessionStack, _: TypeId) -> Result<Scalar> {
        Err(invalid_op("table read as a scalar"))
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        Err(invalid_op("table read as a TEXT"))
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        Err(invalid_op("table read as an ARRAY"))
    }
}

/// A table column used as a value.
#[derive(Clone)]
pub struct FieldOperand {
    pub table: Arc<Table>,
    pub field: FieldIndex,
}

impl OperandSemantics for FieldOperand {
    fn type_word(&self, _: &SessionStack) -> Result<u16> {
        let spec = self.table.schema().field(self.field).map_err(InterError::from)?;
        let mut word = spec.kind.code() | FIELD_MASK;
        if spec.is_array {
            word |= ARRAY_MASK;
        }
        Ok(word)
    }

    fn is_null(&self, _: &SessionStack) -> Result<bool> {
        Ok(self.table.allocated_rows() == 0)
    }

    fn get_scalar(&self, _: &SessionStack, _: TypeId) -> Result<Scalar> {
        Err(invalid_op("field read without a row"))
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        Err(invalid_op("field read without a row"))
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        Err(invalid_op("field read without a row"))
    }
}

/// One table cell: `(table, row, field)`.
#[derive(Clone)]
pub struct RowValueOperand {
    pub table: Arc<Table>,
    pub row: RowId,
    pub field: FieldIndex,
}

impl RowValueOperand {
    fn read(&self) -> Result<Value> {
        Ok(self.table.get(self.row, self.field)?)
    }
}

impl OperandSemantics for RowValueOperand {
    fn type_word(&self, _: &SessionStack) -> Result<u16> {
        let spec = self.table.schema().field(self.field).map_err(InterError::from)?;
        let mut word = spec.kind.code();
        if spec.is_array {
            word |= ARRAY_MASK;
        }
        Ok(word)
    }

    fn is_null(&self, _: &SessionStack) -> Result<bool> {
        Ok(self.read()?.is_null())
    }

    fn get_scalar(&self, _: &SessionStack, want: TypeId) -> Result<Scalar> {
        match self.read()? {
            Value::Scalar(s) => Ok(s.cast(want)?),
            _ => Err(type_mismatch("row value is not a scalar")),
        }
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        match self.read()? {
            Value::Text(t) => Ok(t),
            _ => Err(type_mismatch("row value is not a TEXT")),
        }
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        match self.read()? {
            Value::Array(_, a) => Ok(a),
            _ => Err(type_mismatch("row value is not an ARRAY")),
        }
    }
}

/// Element inside an array-valued operand. Reads beyond the end yield
/// null.
#[derive(Clone)]
pub struct ArrayElemOperand {
    pub base: Box<Operand>,
    pub index: u64,
}

impl ArrayElemOperand {
    fn elem_kind(&self, stack: &SessionStack) -> Result<TypeId> {
        let word = self.base.type_word(stack)?;
        TypeId::from_code(word & 0x00FF).map_err(InterError::from)
    }
}

impl OperandSemantics for ArrayElemOperand {
    fn type_word(&self, stack: &SessionStack) -> Result<u16> {
        Ok(self.elem_kind(stack)?.code())
    }

    fn is_null(&self, stack: &SessionStack) -> Result<bool> {
        match self.base.get_array(stack)? {
            Some(array) => Ok(self.index as usize >= array.len()),
            None => Ok(true),
        }
    }

    fn get_scalar(&self, stack: &SessionStack, want: TypeId) -> Result<Scalar> {
        let null = || Scalar::null_of(want).ok_or_else(|| type_mismatch("array element as TEXT"));
        match self.base.get_array(stack)? {
            Some(array) => match array.get(self.index as usize) {
                Some(item) => Ok(item.cast(want)?),
                None => null(),
            },
            None => null(),
        }
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        Err(type_mismatch("array element read as TEXT"))
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        Err(type_mismatch("array element read as ARRAY"))
    }
}

/// One code point of a text-valued operand.
#[derive(Clone)]
pub struct CharAtOperand {
    pub base: Box<Operand>,
    pub index: u64,
}

impl CharAtOperand {
    fn read(&self, stack: &SessionStack) -> Result<Option<char>> {
        Ok(self
            .base
            .get_text(stack)?
            .and_then(|text| text.chars().nth(self.index as usize)))
    }
}

impl OperandSemantics for CharAtOperand {
    fn type_word(&self, _: &SessionStack) -> Result<u16> {
        Ok(TypeId::Char.code())
    }

    fn is_null(&self, stack: &SessionStack) -> Result<bool> {
        Ok(self.read(stack)?.is_none())
    }

    fn get_scalar(&self, stack: &SessionStack, want: TypeId) -> Result<Scalar> {
        Ok(Scalar::Char(self.read(stack)?).cast(want)?)
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        Err(type_mismatch("character read as TEXT"))
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        Err(type_mismatch("character read as ARRAY"))
    }
}

/// Indirection to another slot of the current frame.
#[derive(Clone, Copy, Debug)]
pub struct LocalOperand {
    pub slot: usize,
}

impl OperandSemantics for LocalOperand {
    fn type_word(&self, stack: &SessionStack) -> Result<u16> {
        stack.operand(self.slot)?.type_word(stack)
    }

    fn is_null(&self, stack: &SessionStack) -> Result<bool> {
        stack.operand(self.slot)?.is_null(stack)
    }

    fn get_scalar(&self, stack: &SessionStack, want: TypeId) -> Result<Scalar> {
        stack.operand(self.slot)?.get_scalar(stack, want)
    }

    fn get_text(&self, stack: &SessionStack) -> Result<Option<String>> {
        stack.operand(self.slot)?.get_text(stack)
    }

    fn get_array(&self, stack: &SessionStack) -> Result<Option<ArrayValue>> {
        stack.operand(self.slot)?.get_array(stack)
    }
}

/// Reference to a shared non-table global value.
#[derive(Clone)]
pub struct GlobalOperand {
    pub cell: GlobalCell,
}

impl GlobalOperand {
    fn with_value<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        let value = self.cell.read().unwrap_or_else(|e| e.into_inner());
        f(&value)
    }
}

impl OperandSemantics for GlobalOperand {
    fn type_word(&self, _: &SessionStack) -> Result<u16> {
        Ok(self.with_value(value_type_word))
    }

    fn is_null(&self, _: &SessionStack) -> Result<bool> {
        Ok(self.with_value(Value::is_null))
    }

    fn get_scalar(&self, _: &SessionStack, want: TypeId) -> Result<Scalar> {
        self.with_value(|value| match value {
            Value::Scalar(s) => Ok(s.cast(want)?),
            _ => Err(type_mismatch("global is not a scalar")),
        })
    }

    fn get_text(&self, _: &SessionStack) -> Result<Option<String>> {
        self.with_value(|value| match value {
            Value::Text(t) => Ok(t.clone()),
            _ => Err(type_mismatch("global is not a TEXT")),
        })
    }

    fn get_array(&self, _: &SessionStack) -> Result<Option<ArrayValue>> {
        self.with_value(|value| match value {
            Value::Array(_, a) => Ok(a.clone()),
            _ => Err(type_mismatch("global is not an ARRAY")),
        })
    }
}

/// Iteration state over an array, text or field container. Reads behave
/// like the element at the current offset.
#[derive(Clone)]
pub struct IteratorOperand {
    pub base: Box<Operand>,
    pub offset: u64,
}

impl IteratorOperand {
    pub fn container_len(&self, stack: &SessionStack) -> Result<u64> {
        match &*self.base {
            Operand::Field(field) => Ok(field.table.allocated_rows()),
            other => {
                let word = other.type_word(stack)?;
                if word & ARRAY_MASK != 0 {
                    Ok(other.get_array(stack)?.map(|a| a.len() as u64).unwrap_or(0))
                } else if word == TypeId::Text.code() {
                    Ok(other
                        .get_text(stack)?
                        .map(|t| whais_core::utf8::cp_count(&t))
                        .unwrap_or(0))
                } else {
                    Err(invalid_op("operand is not iterable"))
                }
            }
        }
    }

    fn element(&self, stack: &SessionStack) -> Result<Operand> {
        Ok(match &*self.base {
            Operand::Field(field) => Operand::from(RowValueOperand {
                table: Arc::clone(&field.table),
                row: self.offset,
                field: field.field,
            }),
            other => {
                let word = other.type_word(stack)?;
                if word & ARRAY_MASK != 0 {
                    Operand::from(ArrayElemOperand {
                        base: self.base.clone(),
                        index: self.offset,
                    })
                } else if word == TypeId::Text.code() {
                    Operand::from(CharAtOperand {
                        base: self.base.clone(),
                        index: self.offset,
                    })
                } else {
                    return Err(invalid_op("operand is not iterable"));
                }
            }
        })
    }
}

impl OperandSemantics for IteratorOperand {
    fn type_word(&self, stack: &SessionStack) -> Result<u16> {
        self.element(stack)?.type_word(stack)
    }

    fn is_null(&self, stack: &SessionStack) -> Result<bool> {
        self.element(stack)?.is_null(stack)
    }

    fn get_scalar(&self, stack: &SessionStack, want: TypeId) -> Result<Scalar> {
        self.element(stack)?.get_scalar(stack, want)
    }

    fn get_text(&self, stack: &SessionStack) -> Result<Option<String>> {
        self.element(stack)?.get_text(stack)
    }

    fn get_array(&self, stack: &SessionStack) -> Result<Option<ArrayValue>> {
        self.element(stack)?.get_array(stack)
    }
}

#[enum_dispatch(OperandSemantics)]
#[derive(Clone)]
pub enum Operand {
    Null(NullOperand),
    Value(ValueOperand),
    Table(TableOperand),
    Field(FieldOperand),
    Row(RowValueOperand),
    ArrayElem(ArrayElemOperand),
    CharAt(CharAtOperand),
    Local(LocalOperand),
    Global(GlobalOperand),
    Iter(IteratorOperand),
}

impl Operand {
    pub fn scalar(value: Scalar) -> Self {
        Self::Value(ValueOperand(Value::Scalar(value)))
    }

    pub fn text(value: Option<String>) -> Self {
        Self::Value(ValueOperand(Value::Text(value)))
    }

    pub fn array(elem: TypeId, value: Option<ArrayValue>) -> Self {
        Self::Value(ValueOperand(Value::Array(elem, value)))
    }

    pub fn bool_value(value: bool) -> Self {
        Self::scalar(Scalar::Bool(Some(value)))
    }

    /// A self-contained copy: local indirections collapse to their target,
    /// sub-operand bases are materialized in turn.
    pub fn materialize(&self, stack: &SessionStack) -> Result<Operand> {
        Ok(match self {
            Self::Local(local) => stack.operand(local.slot)?.materialize(stack)?,
            Self::ArrayElem(el) => Self::ArrayElem(ArrayElemOperand {
                base: Box::new(el.base.materialize(stack)?),
                index: el.index,
            }),
            Self::CharAt(c) => Self::CharAt(CharAtOperand {
                base: Box::new(c.base.materialize(stack)?),
                index: c.index,
            }),
            Self::Iter(it) => Self::Iter(IteratorOperand {
                base: Box::new(it.base.materialize(stack)?),
                offset: it.offset,
            }),
            other => other.clone(),
        })
    }

    /// The default operand for a declared slot type.
    pub fn default_for(word: u16, kind: TypeId, is_array: bool) -> Operand {
        if word & TABLE_MASK != 0 || word & FIELD_MASK != 0 {
            // Table and field slots start undefined; a store binds them.
            return Operand::Null(NullOperand);
        }
        if is_array {
            Operand::array(kind, None)
        } else if kind == TypeId::Text {
            Operand::text(None)
        } else if let Some(null) = Scalar::null_of(kind) {
            Operand::scalar(null)
        } else {
            Operand::Null(NullOperand)
        }
    }
}
