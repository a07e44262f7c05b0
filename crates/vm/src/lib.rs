//! The WHAIS bytecode interpreter.
//!
//! Compiled units (produced by the external compiler) load into sessions,
//! which expose globals and procedures by name; procedures run on a
//! per-session operand stack driven by the dispatch loop in `processor`.

pub mod errors;
pub mod opcodes;
pub mod operand;
pub mod processor;
pub mod session;
pub mod stack;
pub mod unit;

pub use errors::{InterError, InterErrorKind};
pub use opcodes::Opcode;
pub use operand::{Operand, OperandSemantics};
pub use session::{NameSpace, NativeLibrary, NativeProcedure, Session};
pub use stack::SessionStack;
pub use unit::{CompiledUnit, UnitBuilder};
