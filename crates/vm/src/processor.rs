//! Procedure call frames and the opcode dispatch loop.
//!
//! One handler per opcode group, selected by a single match over the
//! decoded opcode. Handlers receive the running offset past the opcode
//! byte and advance it over their immediates; a jump replaces the offset
//! with its displacement and a return pins it to the code size.

use std::sync::Arc;

use whais_core::types::TypeId;
use whais_core::value::{ArrayValue, DateTime, Date, HiresTime, Real, Scalar};
use whais_core::endian::{load_le_u16, load_le_u32, load_le_u64};

use crate::errors::{InterError, InterErrorKind, Result};
use crate::opcodes::Opcode;
use crate::operand::{
    ArrayElemOperand, CharAtOperand, FieldOperand, IteratorOperand, LocalOperand, NullOperand,
    Operand, OperandSemantics, RowValueOperand, TableOperand, invalid_op,
};
use crate::session::{Procedure, Session};
use crate::stack::SessionStack;

fn fault(kind: InterErrorKind) -> InterError {
    InterError::fault(kind)
}

pub struct ProcedureCall<'a> {
    session: &'a Session,
    stack: &'a mut SessionStack,
    procedure: &'a Arc<Procedure>,
    stack_begin: usize,
    code_pos: u64,
    acquired_sync: Option<u8>,
}

impl<'a> ProcedureCall<'a> {
    /// Execute `procedure` with its arguments already on the stack. On
    /// return exactly one value, the result, replaces them.
    pub fn invoke(
        session: &Session,
        stack: &mut SessionStack,
        procedure: &Arc<Procedure>,
    ) -> Result<()> {
        let args = procedure.args_count as usize;
        if stack.size() < args {
            return Err(fault(InterErrorKind::StackCorrupted));
        }
        let stack_begin = stack.size() - args;

        if let Some(native) = &procedure.native {
            native(stack, session).map_err(|message| {
                InterError::new(
                    InterErrorKind::NativeCallFailed,
                    format!("native procedure '{}': {message}", procedure.name),
                )
            })?;
            if stack.size() != stack_begin + 1 {
                return Err(InterError::new(
                    InterErrorKind::StackCorrupted,
                    format!(
                        "stack corruption detected after native procedure '{}'",
                        procedure.name
                    ),
                ));
            }
            return Ok(());
        }

        if stack.size() + procedure.locals_count as usize > session.max_stack() {
            return Err(InterError::new(
                InterErrorKind::StackTooBig,
                format!(
                    "calling '{}' would exceed the {} entry stack limit",
                    procedure.name,
                    session.max_stack()
                ),
            ));
        }

        // Parameters are in place; the remaining locals get their typed
        // defaults. Slot 0 (the return value) has no cell of its own.
        for slot in (args + 1)..procedure.locals_count as usize {
            stack.push(procedure.local_defaults[slot].clone())?;
        }

        let mut frame = ProcedureCall {
            session,
            stack: &mut *stack,
            procedure,
            stack_begin,
            code_pos: 0,
            acquired_sync: None,
        };
        let outcome = frame.run();
        if let Some(sync) = frame.acquired_sync.take() {
            frame.procedure.syncs[sync as usize].release();
        }
        let pc = frame.code_pos;
        outcome.map_err(|e| e.annotate(&procedure.name, pc))?;

        if stack.size() != stack_begin + 1 {
            return Err(InterError::new(
                InterErrorKind::StackCorrupted,
                format!(
                    "stack corruption detected after procedure '{}'",
                    procedure.name
                ),
            ));
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let code_size = self.procedure.code.len() as u64;
        while self.code_pos < code_size {
            if self.session.is_server_stopping() {
                return Err(fault(InterErrorKind::ServerStopped));
            }
            let (op, decoded) =
                Opcode::decode(&self.procedure.code[self.code_pos as usize..])?;
            let mut offset = decoded as i64;
            self.step(op, &mut offset)?;
            self.code_pos = (self.code_pos as i64 + offset) as u64;
        }
        Ok(())
    }

    fn imm(&self, offset: i64, len: usize) -> Result<&[u8]> {
        let start = (self.code_pos as i64 + offset) as usize;
        self.procedure
            .code
            .get(start..start + len)
            .ok_or_else(|| fault(InterErrorKind::UnitCorrupted))
    }

    fn top(&self) -> Result<usize> {
        self.stack.top_pos()
    }

    fn unit(&self) -> Result<&Arc<crate::session::UnitContext>> {
        self.procedure
            .unit
            .as_ref()
            .ok_or_else(|| invalid_op("procedure without a unit context"))
    }

    fn step(&mut self, op: Opcode, offset: &mut i64) -> Result<()> {
        use Opcode::*;
        match op {
            LdNull => {
                let count = self.imm(*offset, 1)?[0];
                for _ in 0..count {
                    self.stack.push(Operand::Null(NullOperand))?;
                }
                *offset += 1;
            }
            Ldc => {
                let raw = load_le_u32(self.imm(*offset, 4)?);
                let value = char::from_u32(raw)
                    .ok_or_else(|| fault(InterErrorKind::UnitCorrupted))?;
                self.stack.push_scalar(Scalar::Char(Some(value)))?;
                *offset += 4;
            }
            LdI8 => {
                let v = self.imm(*offset, 1)?[0];
                self.stack.push_scalar(Scalar::UInt8(Some(v)))?;
                *offset += 1;
            }
            LdI16 => {
                let v = load_le_u16(self.imm(*offset, 2)?);
                self.stack.push_scalar(Scalar::UInt16(Some(v)))?;
                *offset += 2;
            }
            LdI32 => {
                let v = load_le_u32(self.imm(*offset, 4)?);
                self.stack.push_scalar(Scalar::UInt32(Some(v)))?;
                *offset += 4;
            }
            LdI64 => {
                let v = load_le_u64(self.imm(*offset, 8)?);
                self.stack.push_scalar(Scalar::UInt64(Some(v)))?;
                *offset += 8;
            }
            Ldd => {
                let data = self.imm(*offset, 4)?;
                let (day, month) = (data[0], data[1]);
                let year = load_le_u16(&data[2..]) as i16;
                self.stack
                    .push_scalar(Scalar::Date(Some(Date::new(year, month, day)?)))?;
                *offset += 4;
            }
            Lddt => {
                let data = self.imm(*offset, 7)?;
                let (sec, min, hour, day, month) = (data[0], data[1], data[2], data[3], data[4]);
                let year = load_le_u16(&data[5..]) as i16;
                self.stack.push_scalar(Scalar::DateTime(Some(DateTime::new(
                    year, month, day, hour, min, sec,
                )?)))?;
                *offset += 7;
            }
            Ldht => {
                let data = self.imm(*offset, 11)?;
                let usec = load_le_u32(data);
                let (sec, min, hour, day, month) = (data[4], data[5], data[6], data[7], data[8]);
                let year = load_le_u16(&data[9..]) as i16;
                self.stack.push_scalar(Scalar::HiresTime(Some(HiresTime::new(
                    year, month, day, hour, min, sec, usec,
                )?)))?;
                *offset += 11;
            }
            Ldrr => {
                let data = self.imm(*offset, 16)?;
                let units = load_le_u64(data) as i64;
                let frac = load_le_u64(&data[8..]) as i64;
                self.stack
                    .push_scalar(Scalar::RichReal(Some(Real::from_parts(units, frac)?)))?;
                *offset += 16;
            }
            Ldt => {
                let text_off = load_le_u32(self.imm(*offset, 4)?);
                let text = self.unit()?.unit.const_text(text_off)?.to_string();
                self.stack.push(Operand::text(Some(text)))?;
                *offset += 4;
            }
            Ldbt => self.stack.push(Operand::bool_value(true))?,
            Ldbf => self.stack.push(Operand::bool_value(false))?,
            LdLo8 => {
                let index = self.imm(*offset, 1)?[0] as usize;
                self.push_local(index)?;
                *offset += 1;
            }
            LdLo16 => {
                let index = load_le_u16(self.imm(*offset, 2)?) as usize;
                self.push_local(index)?;
                *offset += 2;
            }
            LdLo32 => {
                let index = load_le_u32(self.imm(*offset, 4)?) as usize;
                self.push_local(index)?;
                *offset += 4;
            }
            LdGb8 => {
                let index = self.imm(*offset, 1)?[0] as u32;
                self.push_global(index)?;
                *offset += 1;
            }
            LdGb16 => {
                let index = load_le_u16(self.imm(*offset, 2)?) as u32;
                self.push_global(index)?;
                *offset += 2;
            }
            LdGb32 => {
                let index = load_le_u32(self.imm(*offset, 4)?);
                self.push_global(index)?;
                *offset += 4;
            }
            Cts => {
                let count = self.imm(*offset, 1)?[0] as usize;
                self.stack.pop(count)?;
                *offset += 1;
            }

            Stb => self.store_scalar_op(TypeId::Bool)?,
            Stc => self.store_scalar_op(TypeId::Char)?,
            Std => self.store_scalar_op(TypeId::Date)?,
            Stdt => self.store_scalar_op(TypeId::DateTime)?,
            Stht => self.store_scalar_op(TypeId::HiresTime)?,
            StI8 => self.store_scalar_op(TypeId::Int8)?,
            StI16 => self.store_scalar_op(TypeId::Int16)?,
            StI32 => self.store_scalar_op(TypeId::Int32)?,
            StI64 => self.store_scalar_op(TypeId::Int64)?,
            Str => self.store_scalar_op(TypeId::Real)?,
            Strr => self.store_scalar_op(TypeId::RichReal)?,
            StUi8 => self.store_scalar_op(TypeId::UInt8)?,
            StUi16 => self.store_scalar_op(TypeId::UInt16)?,
            StUi32 => self.store_scalar_op(TypeId::UInt32)?,
            StUi64 => self.store_scalar_op(TypeId::UInt64)?,
            Stt => {
                let top = self.top()?;
                let value = self.stack.get_text(top)?;
                self.stack.store_text(top - 1, value)?;
                self.stack.pop(1)?;
            }
            Sta => {
                let top = self.top()?;
                let value = self.stack.get_array(top)?;
                self.stack.store_array(top - 1, value)?;
                self.stack.pop(1)?;
            }
            Stta => self.store_table_op()?,
            Stf => self.store_field_op()?,
            Stud => {
                let top = self.top()?;
                let source = self.stack.operand(top)?.materialize(self.stack)?;
                self.stack.redefine(top - 1, source)?;
                self.stack.pop(1)?;
            }

            INull | NNull => {
                let top = self.top()?;
                let is_null = self.stack.is_null(top)?;
                self.stack.pop(1)?;
                let result = if op == INull { is_null } else { !is_null };
                self.stack.push(Operand::bool_value(result))?;
            }

            Call => {
                let index = load_le_u32(self.imm(*offset, 4)?);
                *offset += 4;
                let id = self.unit()?.procedure_id(index)?;
                let callee = self.session.procedure(id)?;
                ProcedureCall::invoke(self.session, self.stack, &callee)?;
            }
            Ret => {
                let top = self.top()?;
                let result = self.stack.operand(top)?.materialize(self.stack)?;
                self.stack.truncate(self.stack_begin);
                match result {
                    Operand::Null(_) => {
                        self.stack.push(self.procedure.local_defaults[0].clone())?
                    }
                    other => self.stack.push(other)?,
                }
                *offset = self.procedure.code.len() as i64;
            }

            Add => self.int_binary(|a, b| Ok(a.wrapping_add(b)))?,
            Sub => self.int_binary(|a, b| Ok(a.wrapping_sub(b)))?,
            Mul => self.int_binary(|a, b| Ok(a.wrapping_mul(b)))?,
            Div => self.int_binary(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            Mod => self.int_binary(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a.wrapping_rem(b))
                }
            })?,
            And => self.int_binary(|a, b| Ok(a & b))?,
            Or => self.int_binary(|a, b| Ok(a | b))?,
            Xor => self.int_binary(|a, b| Ok(a ^ b))?,

            MulU => self.uint_binary(|a, b| Ok(a.wrapping_mul(b)))?,
            DivU => self.uint_binary(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a / b)
                }
            })?,
            ModU => self.uint_binary(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a % b)
                }
            })?,

            AddRr => self.real_binary(|a, b| Ok(a.checked_add(b)?))?,
            SubRr => self.real_binary(|a, b| Ok(a.checked_sub(b)?))?,
            MulRr => self.real_binary(|a, b| Ok(a.checked_mul(b)?))?,
            DivRr => self.real_binary(|a, b| {
                if b.is_zero() {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a.checked_div(b)?)
                }
            })?,

            AddT => {
                let top = self.top()?;
                let first = self.stack.get_text(top - 1)?;
                let second = self.stack.get_text(top)?;
                let result = match (first, second) {
                    (None, second) => second,
                    (first, None) => first,
                    (Some(mut first), Some(second)) => {
                        first.push_str(&second);
                        Some(first)
                    }
                };
                self.stack.pop(2)?;
                self.stack.push(Operand::text(result))?;
            }

            AndB => self.bool_binary(|a, b| a && b)?,
            OrB => self.bool_binary(|a, b| a || b)?,
            XorB => self.bool_binary(|a, b| a ^ b)?,

            Not => {
                let top = self.top()?;
                let v = self.stack.get_scalar(top, TypeId::Int64)?.to_i64()?;
                self.stack.pop(1)?;
                self.stack.push_scalar(Scalar::Int64(v.map(|v| !v)))?;
            }
            NotB => {
                let top = self.top()?;
                let v = self.stack.get_scalar(top, TypeId::Bool)?.to_bool()?;
                self.stack.pop(1)?;
                self.stack.push_scalar(Scalar::Bool(v.map(|v| !v)))?;
            }

            Eq | EqB | EqC | EqD | EqDt | EqHt | EqRr | EqT => self.equality(op, false)?,
            Ne | NeB | NeC | NeD | NeDt | NeHt | NeRr | NeT => self.equality(op, true)?,

            Lt | LtU | LtC | LtD | LtDt | LtHt | LtRr => {
                self.ordering(op, |o| o == std::cmp::Ordering::Less)?
            }
            Le | LeU | LeC | LeD | LeDt | LeHt | LeRr => {
                self.ordering(op, |o| o != std::cmp::Ordering::Greater)?
            }
            Gt | GtU | GtC | GtD | GtDt | GtHt | GtRr => {
                self.ordering(op, |o| o == std::cmp::Ordering::Greater)?
            }
            Ge | GeU | GeC | GeD | GeDt | GeHt | GeRr => {
                self.ordering(op, |o| o != std::cmp::Ordering::Less)?
            }

            Jf | Jfc | Jt | Jtc => {
                let top = self.top()?;
                let value = self.stack.get_scalar(top, TypeId::Bool)?.to_bool()?;
                if matches!(op, Jfc | Jtc) {
                    self.stack.pop(1)?;
                }
                let wanted = matches!(op, Jt | Jtc);
                if value == Some(wanted) {
                    *offset = load_le_u32(self.imm(*offset, 4)?) as i32 as i64;
                } else {
                    *offset += 4;
                }
            }
            Jmp => {
                *offset = load_le_u32(self.imm(*offset, 4)?) as i32 as i64;
            }

            IndT => self.index_op(op)?,
            IndA => self.index_op(op)?,
            IndF => self.index_op(op)?,
            IndTa => {
                let index = {
                    let top = self.top()?;
                    self.stack.get_scalar(top, TypeId::UInt64)?.to_u64()?
                };
                let Some(row) = index else {
                    return Err(fault(InterErrorKind::RowIndexNull));
                };
                let name_off = load_le_u32(self.imm(*offset, 4)?);
                *offset += 4;
                let field_name = self.unit()?.unit.const_text(name_off)?.to_string();
                let top = self.top()?;
                let table = self.table_of(top - 1)?;
                let field = table.field_by_name(&field_name)?;
                self.stack.pop(2)?;
                self.stack.push(Operand::Row(RowValueOperand {
                    table,
                    row,
                    field,
                }))?;
            }
            SelfInd => {
                let name_off = load_le_u32(self.imm(*offset, 4)?);
                *offset += 4;
                let field_name = self.unit()?.unit.const_text(name_off)?.to_string();
                let top = self.top()?;
                let table = self.table_of(top)?;
                let field = table.field_by_name(&field_name)?;
                self.stack.pop(1)?;
                self.stack.push(Operand::Field(FieldOperand { table, field }))?;
            }

            BSync => {
                let sync = self.imm(*offset, 1)?[0];
                *offset += 1;
                if self.acquired_sync.is_some() {
                    return Err(fault(InterErrorKind::NestedSyncRequest));
                }
                let region = self
                    .procedure
                    .syncs
                    .get(sync as usize)
                    .ok_or_else(|| fault(InterErrorKind::SyncNotAcquired))?;
                region.acquire();
                self.acquired_sync = Some(sync);
            }
            ESync => {
                let sync = self.imm(*offset, 1)?[0];
                *offset += 1;
                if self.acquired_sync != Some(sync) {
                    return Err(fault(InterErrorKind::SyncNotAcquired));
                }
                self.procedure.syncs[sync as usize].release();
                self.acquired_sync = None;
            }

            SAdd => self.self_int(|a, b| Ok(a.wrapping_add(b)))?,
            SSub => self.self_int(|a, b| Ok(a.wrapping_sub(b)))?,
            SMul => self.self_int(|a, b| Ok(a.wrapping_mul(b)))?,
            SDiv => self.self_int(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            SMod => self.self_int(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a.wrapping_rem(b))
                }
            })?,
            SAnd => self.self_int(|a, b| Ok(a & b))?,
            SOr => self.self_int(|a, b| Ok(a | b))?,
            SXor => self.self_int(|a, b| Ok(a ^ b))?,
            SMulU => self.self_uint(|a, b| Ok(a.wrapping_mul(b)))?,
            SDivU => self.self_uint(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a / b)
                }
            })?,
            SModU => self.self_uint(|a, b| {
                if b == 0 {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a % b)
                }
            })?,
            SAddRr => self.self_real(|a, b| Ok(a.checked_add(b)?))?,
            SSubRr => self.self_real(|a, b| Ok(a.checked_sub(b)?))?,
            SMulRr => self.self_real(|a, b| Ok(a.checked_mul(b)?))?,
            SDivRr => self.self_real(|a, b| {
                if b.is_zero() {
                    Err(fault(InterErrorKind::DivideByZero))
                } else {
                    Ok(a.checked_div(b)?)
                }
            })?,
            SAndB => self.self_bool(|a, b| a && b)?,
            SOrB => self.self_bool(|a, b| a || b)?,
            SXorB => self.self_bool(|a, b| a ^ b)?,
            SAddC => {
                let top = self.top()?;
                let delta = self.stack.get_scalar(top, TypeId::Char)?.to_char()?;
                let dest = top - 1;
                let current = self.stack.get_text(dest)?;
                let result = match delta {
                    None => None,
                    Some(c) => {
                        let mut text = current.unwrap_or_default();
                        text.push(c);
                        Some(text)
                    }
                };
                self.stack.store_text(dest, result)?;
                self.stack.pop(1)?;
            }
            SAddT => {
                let top = self.top()?;
                let delta = self.stack.get_text(top)?;
                let dest = top - 1;
                let current = self.stack.get_text(dest)?;
                let result = match (current, delta) {
                    (current, None) => current,
                    (None, delta) => delta,
                    (Some(mut current), Some(delta)) => {
                        current.push_str(&delta);
                        Some(current)
                    }
                };
                self.stack.store_text(dest, result)?;
                self.stack.pop(1)?;
            }

            Itf | Itl => self.start_iterate(op == Itl)?,
            Itn | Itp => self.iterate(op == Itp)?,
            ItOff => {
                let top = self.top()?;
                let result = match self.stack.operand(top)? {
                    Operand::Iter(it) => Some(it.offset),
                    _ => return Err(invalid_op("ITOFF without an iterator")),
                };
                self.stack.pop(1)?;
                self.stack.push_scalar(Scalar::UInt64(result))?;
            }
            Fid => {
                let top = self.top()?;
                let field = match self.stack.operand(top)? {
                    Operand::Field(field) => Some(u64::from(field.field)),
                    Operand::Iter(it) => match &*it.base {
                        Operand::Field(field) => Some(u64::from(field.field)),
                        _ => None,
                    },
                    _ => None,
                };
                if field.is_none() {
                    log::warn!("cannot take a field index of a null field value");
                }
                self.stack.pop(1)?;
                self.stack.push_scalar(Scalar::UInt64(field))?;
            }

            Carr => {
                let data = self.imm(*offset, 3)?;
                let elem = TypeId::from_code((data[0] & !crate::opcodes::CARR_FROM_FIELD) as u16)?;
                let count = load_le_u16(&data[1..]) as usize;
                *offset += 3;
                let mut array = ArrayValue::new(elem)?;
                let base = self
                    .stack
                    .size()
                    .checked_sub(count)
                    .ok_or_else(|| fault(InterErrorKind::StackCorrupted))?;
                for pos in base..self.stack.size() {
                    let item = self.stack.get_scalar(pos, elem)?;
                    if !item.is_null() {
                        array.push(item)?;
                    }
                }
                self.stack.pop(count)?;
                self.stack.push(Operand::array(elem, Some(array)))?;
            }

            AJoin | AFOut | AFIn => {
                return Err(InterError::new(
                    InterErrorKind::InternalError,
                    format!("reserved opcode {}", op.mnemonic()),
                ));
            }
        }
        Ok(())
    }

    fn push_local(&mut self, index: usize) -> Result<()> {
        self.stack.push(Operand::Local(LocalOperand {
            slot: self.stack_begin + index,
        }))
    }

    fn push_global(&mut self, unit_index: u32) -> Result<()> {
        let id = self.unit()?.global_id(unit_index)?;
        let operand = self.session.global_operand(id)?;
        self.stack.push(operand)
    }

    fn store_scalar_op(&mut self, kind: TypeId) -> Result<()> {
        let top = self.top()?;
        let value = self.stack.get_scalar(top, kind)?;
        self.stack.store_scalar(top - 1, value)?;
        self.stack.pop(1)
    }

    fn store_table_op(&mut self) -> Result<()> {
        let top = self.top()?;
        let source = self.stack.operand(top)?.materialize(self.stack)?;
        let dest = self.stack.resolve(top - 1)?;
        let replacement = match source {
            Operand::Table(table) => Operand::Table(table),
            Operand::Null(_) => {
                // A null source spawns a fresh empty table shaped like the
                // destination's current one.
                let Operand::Table(current) = self.stack.operand(dest)? else {
                    return Err(invalid_op("table store into a non-table slot"));
                };
                let fields = current.table.schema().fields().to_vec();
                let table = self
                    .session
                    .dbs()
                    .create_temp_table(fields)
                    .map_err(InterError::from)?;
                Operand::Table(TableOperand { table })
            }
            _ => return Err(invalid_op("source operand is not a table")),
        };
        self.stack.redefine(dest, replacement)?;
        self.stack.pop(1)
    }

    fn store_field_op(&mut self) -> Result<()> {
        let top = self.top()?;
        let source = self.stack.operand(top)?.materialize(self.stack)?;
        let replacement = match source {
            Operand::Field(field) => Operand::Field(field),
            Operand::Null(_) => Operand::Null(NullOperand),
            _ => return Err(invalid_op("source operand is not a field")),
        };
        self.stack.redefine(top - 1, replacement)?;
        self.stack.pop(1)
    }

    fn int_binary(&mut self, f: impl Fn(i64, i64) -> Result<i64>) -> Result<()> {
        let top = self.top()?;
        let first = self.stack.get_scalar(top - 1, TypeId::Int64)?.to_i64()?;
        let second = self.stack.get_scalar(top, TypeId::Int64)?.to_i64()?;
        let result = match (first, second) {
            (Some(a), Some(b)) => Some(f(a, b)?),
            _ => None,
        };
        self.stack.pop(2)?;
        self.stack.push_scalar(Scalar::Int64(result))
    }

    fn uint_binary(&mut self, f: impl Fn(u64, u64) -> Result<u64>) -> Result<()> {
        let top = self.top()?;
        let first = self.stack.get_scalar(top - 1, TypeId::UInt64)?.to_u64()?;
        let second = self.stack.get_scalar(top, TypeId::UInt64)?.to_u64()?;
        let result = match (first, second) {
            (Some(a), Some(b)) => Some(f(a, b)?),
            _ => None,
        };
        self.stack.pop(2)?;
        self.stack.push_scalar(Scalar::UInt64(result))
    }

    fn real_binary(&mut self, f: impl Fn(Real, Real) -> Result<Real>) -> Result<()> {
        let top = self.top()?;
        let first = self.stack.get_scalar(top - 1, TypeId::RichReal)?.to_real()?;
        let second = self.stack.get_scalar(top, TypeId::RichReal)?.to_real()?;
        let result = match (first, second) {
            (Some(a), Some(b)) => Some(f(a, b)?),
            _ => None,
        };
        self.stack.pop(2)?;
        self.stack.push_scalar(Scalar::RichReal(result))
    }

    fn bool_binary(&mut self, f: impl Fn(bool, bool) -> bool) -> Result<()> {
        let top = self.top()?;
        let first = self.stack.get_scalar(top - 1, TypeId::Bool)?.to_bool()?;
        let second = self.stack.get_scalar(top, TypeId::Bool)?.to_bool()?;
        let result = match (first, second) {
            (Some(a), Some(b)) => Some(f(a, b)),
            _ => None,
        };
        self.stack.pop(2)?;
        self.stack.push_scalar(Scalar::Bool(result))
    }

    fn comparison_kind(op: Opcode) -> TypeId {
        use Opcode::*;
        match op {
            Eq | Ne | Lt | Le | Gt | Ge => TypeId::Int64,
            LtU | LeU | GtU | GeU => TypeId::UInt64,
            EqB | NeB => TypeId::Bool,
            EqC | NeC | LtC | LeC | GtC | GeC => TypeId::Char,
            EqD | NeD | LtD | LeD | GtD | GeD => TypeId::Date,
            EqDt | NeDt | LtDt | LeDt | GtDt | GeDt => TypeId::DateTime,
            EqHt | NeHt | LtHt | LeHt | GtHt | GeHt => TypeId::HiresTime,
            EqRr | NeRr | LtRr | LeRr | GtRr | GeRr => TypeId::RichReal,
            EqT | NeT => TypeId::Text,
            _ => unreachable!("not a comparison opcode"),
        }
    }

    /// Equality treats null as a distinguishable value and always yields a
    /// non-null bool.
    fn equality(&mut self, op: Opcode, negate: bool) -> Result<()> {
        let kind = Self::comparison_kind(op);
        let top = self.top()?;
        let equal = if kind == TypeId::Text {
            let first = self.stack.get_text(top - 1)?;
            let second = self.stack.get_text(top)?;
            first == second
        } else {
            let first = self.stack.get_scalar(top - 1, kind)?;
            let second = self.stack.get_scalar(top, kind)?;
            if first.is_null() || second.is_null() {
                first.is_null() && second.is_null()
            } else {
                first.compare(&second)? == Some(std::cmp::Ordering::Equal)
            }
        };
        self.stack.pop(2)?;
        self.stack.push(Operand::bool_value(equal != negate))
    }

    /// Ordering comparisons are null-propagating.
    fn ordering(
        &mut self,
        op: Opcode,
        accept: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<()> {
        let kind = Self::comparison_kind(op);
        let top = self.top()?;
        let first = self.stack.get_scalar(top - 1, kind)?;
        let second = self.stack.get_scalar(top, kind)?;
        let result = first.compare(&second)?.map(&accept);
        self.stack.pop(2)?;
        self.stack.push_scalar(Scalar::Bool(result))
    }

    fn index_op(&mut self, op: Opcode) -> Result<()> {
        let null_fault = match op {
            Opcode::IndT => InterErrorKind::TextIndexNull,
            Opcode::IndA => InterErrorKind::ArrayIndexNull,
            _ => InterErrorKind::RowIndexNull,
        };
        let top = self.top()?;
        let index = self.stack.get_scalar(top, TypeId::UInt64)?.to_u64()?;
        let Some(index) = index else {
            return Err(fault(null_fault));
        };
        let base = self.stack.operand(top - 1)?.clone();
        let result = match op {
            Opcode::IndT => Operand::CharAt(CharAtOperand {
                base: Box::new(base),
                index,
            }),
            Opcode::IndA => Operand::ArrayElem(ArrayElemOperand {
                base: Box::new(base),
                index,
            }),
            _ => {
                let Operand::Field(field) = base.materialize(self.stack)? else {
                    return Err(invalid_op("INDF without a field operand"));
                };
                Operand::Row(RowValueOperand {
                    table: field.table,
                    row: index,
                    field: field.field,
                })
            }
        };
        self.stack.pop(2)?;
        self.stack.push(result)
    }

    fn table_of(&self, pos: usize) -> Result<Arc<whais_dbs::Table>> {
        match self.stack.operand(pos)?.materialize(self.stack)? {
            Operand::Table(table) => Ok(table.table),
            Operand::Field(field) => Ok(field.table),
            _ => Err(invalid_op("operand does not reference a table")),
        }
    }

    fn self_dest_kind(&self, dest: usize) -> Result<TypeId> {
        let word = self.stack.operand(dest)?.type_word(self.stack)?;
        TypeId::from_code(word & 0x00FF).map_err(InterError::from)
    }

    fn self_int(&mut self, f: impl Fn(i64, i64) -> Result<i64>) -> Result<()> {
        let top = self.top()?;
        let dest = top - 1;
        let kind = self.self_dest_kind(dest)?;
        let delta = self.stack.get_scalar(top, TypeId::Int64)?.to_i64()?;
        let current = self.stack.get_scalar(dest, TypeId::Int64)?.to_i64()?;
        let result = match (current, delta) {
            (Some(a), Some(b)) => Scalar::Int64(Some(f(a, b)?)).cast(kind)?,
            _ => Scalar::null_of(kind)
                .ok_or_else(|| invalid_op("self-op on a non-scalar"))?,
        };
        self.stack.store_scalar(dest, result)?;
        self.stack.pop(1)
    }

    fn self_uint(&mut self, f: impl Fn(u64, u64) -> Result<u64>) -> Result<()> {
        let top = self.top()?;
        let dest = top - 1;
        let kind = self.self_dest_kind(dest)?;
        let delta = self.stack.get_scalar(top, TypeId::UInt64)?.to_u64()?;
        let current = self.stack.get_scalar(dest, TypeId::UInt64)?.to_u64()?;
        let result = match (current, delta) {
            (Some(a), Some(b)) => Scalar::UInt64(Some(f(a, b)?)).cast(kind)?,
            _ => Scalar::null_of(kind)
                .ok_or_else(|| invalid_op("self-op on a non-scalar"))?,
        };
        self.stack.store_scalar(dest, result)?;
        self.stack.pop(1)
    }

    fn self_real(&mut self, f: impl Fn(Real, Real) -> Result<Real>) -> Result<()> {
        let top = self.top()?;
        let dest = top - 1;
        let kind = self.self_dest_kind(dest)?;
        let delta = self.stack.get_scalar(top, TypeId::RichReal)?.to_real()?;
        let current = self.stack.get_scalar(dest, TypeId::RichReal)?.to_real()?;
        let result = match (current, delta) {
            (Some(a), Some(b)) => Scalar::RichReal(Some(f(a, b)?)).cast(kind)?,
            _ => Scalar::null_of(kind)
                .ok_or_else(|| invalid_op("self-op on a non-scalar"))?,
        };
        self.stack.store_scalar(dest, result)?;
        self.stack.pop(1)
    }

    fn self_bool(&mut self, f: impl Fn(bool, bool) -> bool) -> Result<()> {
        let top = self.top()?;
        let dest = top - 1;
        let delta = self.stack.get_scalar(top, TypeId::Bool)?.to_bool()?;
        let current = self.stack.get_scalar(dest, TypeId::Bool)?.to_bool()?;
        let result = match (current, delta) {
            (Some(a), Some(b)) => Scalar::Bool(Some(f(a, b))),
            _ => Scalar::Bool(None),
        };
        self.stack.store_scalar(dest, result)?;
        self.stack.pop(1)
    }

    fn start_iterate(&mut self, reverse: bool) -> Result<()> {
        let top = self.top()?;
        if self.stack.is_null(top)? {
            return self.stack.push(Operand::bool_value(false));
        }
        let base = self.stack.operand(top)?.clone();
        let iterator = IteratorOperand {
            base: Box::new(base),
            offset: 0,
        };
        let len = iterator.container_len(self.stack)?;
        let started = len > 0;
        let iterator = IteratorOperand {
            offset: if reverse && started { len - 1 } else { 0 },
            ..iterator
        };
        self.stack.pop(1)?;
        self.stack.push(Operand::Iter(iterator))?;
        self.stack.push(Operand::bool_value(started))
    }

    fn iterate(&mut self, reverse: bool) -> Result<()> {
        let top = self.top()?;
        let Operand::Iter(mut iterator) = self.stack.operand(top)?.clone() else {
            return Err(invalid_op("iterate without an iterator"));
        };
        let len = iterator.container_len(self.stack)?;
        let moved = if reverse {
            if iterator.offset > 0 {
                iterator.offset -= 1;
                true
            } else {
                false
            }
        } else if iterator.offset + 1 < len {
            iterator.offset += 1;
            true
        } else {
            false
        };
        *self.stack.operand_mut(top)? = Operand::Iter(iterator);
        self.stack.push(Operand::bool_value(moved))
    }
}
