//! The per-session operand stack.
//!
//! Reads go through the operand capability trait; writes resolve the
//! destination slot here so that local indirections, global cells and
//! table-backed operands all receive the store they imply.

use whais_core::types::TypeId;
use whais_core::value::{ArrayValue, Scalar, Value};

use crate::errors::{InterError, InterErrorKind, Result};
use crate::operand::{
    invalid_op, type_mismatch, Operand, OperandSemantics, ValueOperand,
};

pub const DEFAULT_MAX_STACK: usize = 4096;

pub struct SessionStack {
    values: Vec<Operand>,
    max_size: usize,
}

impl Default for SessionStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STACK)
    }
}

impl SessionStack {
    pub fn new(max_size: usize) -> Self {
        Self {
            values: Vec::new(),
            max_size,
        }
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn push(&mut self, operand: Operand) -> Result<()> {
        if self.values.len() >= self.max_size {
            return Err(InterError::new(
                InterErrorKind::StackTooBig,
                format!("operand stack exceeds {} entries", self.max_size),
            ));
        }
        self.values.push(operand);
        Ok(())
    }

    pub fn push_scalar(&mut self, value: Scalar) -> Result<()> {
        self.push(Operand::scalar(value))
    }

    pub fn pop(&mut self, count: usize) -> Result<()> {
        if count > self.values.len() {
            return Err(InterError::new(
                InterErrorKind::StackCorrupted,
                "pop below the stack base",
            ));
        }
        self.values.truncate(self.values.len() - count);
        Ok(())
    }

    pub fn truncate(&mut self, size: usize) {
        self.values.truncate(size);
    }

    pub fn operand(&self, pos: usize) -> Result<&Operand> {
        self.values.get(pos).ok_or_else(|| {
            InterError::new(InterErrorKind::StackCorrupted, "slot out of range")
        })
    }

    pub fn operand_mut(&mut self, pos: usize) -> Result<&mut Operand> {
        self.values.get_mut(pos).ok_or_else(|| {
            InterError::new(InterErrorKind::StackCorrupted, "slot out of range")
        })
    }

    pub fn top_pos(&self) -> Result<usize> {
        self.values
            .len()
            .checked_sub(1)
            .ok_or_else(|| InterError::new(InterErrorKind::StackCorrupted, "empty stack"))
    }

    /// Follow local-slot indirections down to the slot they name.
    pub fn resolve(&self, mut pos: usize) -> Result<usize> {
        loop {
            match self.operand(pos)? {
                Operand::Local(local) => pos = local.slot,
                _ => return Ok(pos),
            }
        }
    }

    pub fn get_scalar(&self, pos: usize, want: TypeId) -> Result<Scalar> {
        self.operand(pos)?.get_scalar(self, want)
    }

    pub fn get_text(&self, pos: usize) -> Result<Option<String>> {
        self.operand(pos)?.get_text(self)
    }

    pub fn get_array(&self, pos: usize) -> Result<Option<ArrayValue>> {
        self.operand(pos)?.get_array(self)
    }

    pub fn is_null(&self, pos: usize) -> Result<bool> {
        self.operand(pos)?.is_null(self)
    }

    /// Store a typed scalar into the slot at `pos` (resolving locals). An
    /// untyped null slot takes the value's type; everything else keeps its
    /// declared type, widening the value into it.
    pub fn store_scalar(&mut self, pos: usize, value: Scalar) -> Result<()> {
        let pos = self.resolve(pos)?;
        let target = self.operand(pos)?.clone();
        match target {
            Operand::Null(_) => {
                *self.operand_mut(pos)? = Operand::scalar(value);
                Ok(())
            }
            Operand::Value(ValueOperand(Value::Scalar(current))) => {
                let stored = value.cast(current.kind())?;
                *self.operand_mut(pos)? = Operand::scalar(stored);
                Ok(())
            }
            Operand::Global(global) => {
                let mut cell = global.cell.write().unwrap_or_else(|e| e.into_inner());
                match &mut *cell {
                    Value::Scalar(current) => {
                        *current = value.cast(current.kind())?;
                        Ok(())
                    }
                    _ => Err(type_mismatch("global is not a scalar")),
                }
            }
            Operand::Row(cell) => {
                cell.table
                    .set(cell.row, cell.field, &Value::Scalar(value))?;
                Ok(())
            }
            Operand::ArrayElem(el) => {
                if value.is_null() {
                    return Err(invalid_op("array elements cannot be null"));
                }
                let mut array = match el.base.get_array(self)? {
                    Some(array) => array,
                    None => ArrayValue::new(value.kind()).map_err(InterError::from)?,
                };
                let index = el.index as usize;
                if index < array.len() {
                    array.set(index, value)?;
                } else if index == array.len() {
                    array.push(value)?;
                } else {
                    return Err(invalid_op("array element write past the end"));
                }
                let elem = array.elem_kind();
                self.store_via_operand(&el.base, Value::Array(elem, Some(array)))
            }
            Operand::CharAt(c) => {
                let Scalar::Char(ch) = value.cast(TypeId::Char)? else {
                    unreachable!("cast to CHAR yields a char")
                };
                let Some(ch) = ch else {
                    return Err(invalid_op("cannot store a null character"));
                };
                let mut text = c.base.get_text(self)?.unwrap_or_default();
                let index = c.index as usize;
                let count = text.chars().count();
                if index < count {
                    let start = whais_core::utf8::byte_offset_of(&text, c.index)
                        .expect("index checked");
                    let end = whais_core::utf8::byte_offset_of(&text, c.index + 1)
                        .expect("index checked");
                    text.replace_range(start..end, &ch.to_string());
                } else if index == count {
                    text.push(ch);
                } else {
                    return Err(invalid_op("character write past the end of the text"));
                }
                self.store_via_operand(&c.base, Value::Text(Some(text)))
            }
            Operand::Iter(_) | Operand::Table(_) | Operand::Field(_) => {
                Err(invalid_op("operand does not take scalar stores"))
            }
            Operand::Local(_) => unreachable!("locals resolved above"),
            Operand::Value(ValueOperand(Value::Text(_))) | Operand::Value(ValueOperand(Value::Array(_, _))) => {
                Err(type_mismatch("operand is not a scalar destination"))
            }
        }
    }

    pub fn store_text(&mut self, pos: usize, value: Option<String>) -> Result<()> {
        let pos = self.resolve(pos)?;
        let target = self.operand(pos)?.clone();
        match target {
            Operand::Null(_) | Operand::Value(ValueOperand(Value::Text(_))) => {
                *self.operand_mut(pos)? = Operand::text(value);
                Ok(())
            }
            Operand::Global(global) => {
                let mut cell = global.cell.write().unwrap_or_else(|e| e.into_inner());
                match &mut *cell {
                    Value::Text(current) => {
                        *current = value;
                        Ok(())
                    }
                    _ => Err(type_mismatch("global is not a TEXT")),
                }
            }
            Operand::Row(cell) => {
                cell.table.set(cell.row, cell.field, &Value::Text(value))?;
                Ok(())
            }
            _ => Err(type_mismatch("operand is not a TEXT destination")),
        }
    }

    pub fn store_array(&mut self, pos: usize, value: Option<ArrayValue>) -> Result<()> {
        let pos = self.resolve(pos)?;
        let target = self.operand(pos)?.clone();
        match target {
            Operand::Value(ValueOperand(Value::Array(elem, _))) => {
                *self.operand_mut(pos)? = Operand::array(elem, value);
                Ok(())
            }
            Operand::Null(_) => {
                let elem = value
                    .as_ref()
                    .map(ArrayValue::elem_kind)
                    .ok_or_else(|| invalid_op("cannot type a slot from a null array"))?;
                *self.operand_mut(pos)? = Operand::array(elem, value);
                Ok(())
            }
            Operand::Global(global) => {
                let mut cell = global.cell.write().unwrap_or_else(|e| e.into_inner());
                match &mut *cell {
                    Value::Array(_, current) => {
                        *current = value;
                        Ok(())
                    }
                    _ => Err(type_mismatch("global is not an ARRAY")),
                }
            }
            Operand::Row(cell) => {
                let elem = cell
                    .table
                    .schema()
                    .field(cell.field)
                    .map_err(InterError::from)?
                    .kind;
                cell.table
                    .set(cell.row, cell.field, &Value::Array(elem, value))?;
                Ok(())
            }
            _ => Err(type_mismatch("operand is not an ARRAY destination")),
        }
    }

    /// Replace the slot with a copy of another operand (the `STUD`
    /// semantics).
    pub fn redefine(&mut self, pos: usize, source: Operand) -> Result<()> {
        let pos = self.resolve(pos)?;
        *self.operand_mut(pos)? = source;
        Ok(())
    }

    /// Write a full value through a base operand reference (used by
    /// sub-operand stores). Writes into plain temporaries are dropped, as
    /// the temporary itself is about to die.
    fn store_via_operand(&mut self, base: &Operand, value: Value) -> Result<()> {
        match base {
            Operand::Local(local) => {
                let pos = self.resolve(local.slot)?;
                match value {
                    Value::Scalar(s) => self.store_scalar(pos, s),
                    Value::Text(t) => self.store_text(pos, t),
                    Value::Array(_, a) => self.store_array(pos, a),
                }
            }
            Operand::Global(global) => {
                let mut cell = global.cell.write().unwrap_or_else(|e| e.into_inner());
                *cell = value;
                Ok(())
            }
            Operand::Row(cell) => {
                cell.table.set(cell.row, cell.field, &value)?;
                Ok(())
            }
            Operand::Value(_) | Operand::Null(_) => Ok(()),
            _ => Err(invalid_op("operand cannot back a sub-value store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{LocalOperand, NullOperand};
    use pretty_assertions::assert_eq;

    #[test]
    fn untyped_null_takes_the_stored_type() {
        let mut stack = SessionStack::default();
        stack.push(Operand::Null(NullOperand)).unwrap();
        stack.store_scalar(0, Scalar::Int32(Some(5))).unwrap();
        assert_eq!(
            stack.get_scalar(0, TypeId::Int32).unwrap(),
            Scalar::Int32(Some(5))
        );
    }

    #[test]
    fn typed_slots_keep_their_type() {
        let mut stack = SessionStack::default();
        stack.push_scalar(Scalar::UInt16(None)).unwrap();
        stack.store_scalar(0, Scalar::UInt8(Some(200))).unwrap();
        assert_eq!(
            stack.get_scalar(0, TypeId::UInt16).unwrap(),
            Scalar::UInt16(Some(200))
        );
    }

    #[test]
    fn locals_write_through() {
        let mut stack = SessionStack::default();
        stack.push_scalar(Scalar::Int64(Some(1))).unwrap();
        stack.push(Operand::Local(LocalOperand { slot: 0 })).unwrap();
        stack.store_scalar(1, Scalar::Int64(Some(42))).unwrap();
        assert_eq!(
            stack.get_scalar(0, TypeId::Int64).unwrap(),
            Scalar::Int64(Some(42))
        );
    }

    #[test]
    fn overflowing_the_stack_faults() {
        let mut stack = SessionStack::new(2);
        stack.push_scalar(Scalar::Bool(Some(true))).unwrap();
        stack.push_scalar(Scalar::Bool(Some(true))).unwrap();
        let err = stack.push_scalar(Scalar::Bool(Some(true))).unwrap_err();
        assert_eq!(err.kind, InterErrorKind::StackTooBig);
    }

    #[test]
    fn pop_below_base_faults() {
        let mut stack = SessionStack::default();
        stack.push_scalar(Scalar::Bool(None)).unwrap();
        assert_eq!(
            stack.pop(2).unwrap_err().kind,
            InterErrorKind::StackCorrupted
        );
    }
}
