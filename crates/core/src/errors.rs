use crate::types::TypeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("date {year:04}-{month:02}-{day:02} is out of range")]
    InvalidDate { year: i16, month: u8, day: u8 },
    #[error("time {hour:02}:{min:02}:{sec:02}.{usec:06} is out of range")]
    InvalidTime { hour: u8, min: u8, sec: u8, usec: u32 },
    #[error("value of type {from} does not convert to {to}")]
    TypeMismatch { from: TypeId, to: TypeId },
    #[error("value does not fit in type {to}")]
    NumericOverflow { to: TypeId },
    #[error("code point U+{0:06X} is not a valid character")]
    InvalidCodePoint(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("input truncated: needed {needed} bytes, {left} left")]
    Truncated { needed: usize, left: usize },
    #[error("malformed UTF-8 sequence at byte {0}")]
    BadUtf8(usize),
    #[error("unterminated string in binary input")]
    UnterminatedString,
    #[error("unknown type code 0x{0:04x}")]
    UnknownType(u16),
    #[error("malformed type descriptor")]
    BadTypeDescriptor,
}
