//! Type identifiers and the binary type-descriptor format shared by the
//! compiled unit container, the on-disk catalogs and the wire protocol.

use crate::endian::{Reader, Writer};
use crate::errors::CodecError;

/// Flag set in a type word for `ARRAY OF <base>`.
pub const ARRAY_MASK: u16 = 0x0100;
/// Flag set in a type word for `FIELD OF <base>`.
pub const FIELD_MASK: u16 = 0x0200;
/// Flag set in a type word for a table type.
pub const TABLE_MASK: u16 = 0x0400;

const BASE_MASK: u16 = 0x00FF;

/// Closed enumeration of the primitive kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum_macros::IntoStaticStr,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum TypeId {
    Bool = 1,
    Char = 2,
    Date = 3,
    DateTime = 4,
    HiresTime = 5,
    Int8 = 6,
    Int16 = 7,
    Int32 = 8,
    Int64 = 9,
    Real = 10,
    RichReal = 11,
    Text = 12,
    UInt8 = 13,
    UInt16 = 14,
    UInt32 = 15,
    UInt64 = 16,
    /// Null typing during expression evaluation; never stored.
    Undetermined = 17,
}

impl TypeId {
    pub fn from_code(code: u16) -> Result<Self, CodecError> {
        Ok(match code {
            1 => Self::Bool,
            2 => Self::Char,
            3 => Self::Date,
            4 => Self::DateTime,
            5 => Self::HiresTime,
            6 => Self::Int8,
            7 => Self::Int16,
            8 => Self::Int32,
            9 => Self::Int64,
            10 => Self::Real,
            11 => Self::RichReal,
            12 => Self::Text,
            13 => Self::UInt8,
            14 => Self::UInt16,
            15 => Self::UInt32,
            16 => Self::UInt64,
            17 => Self::Undetermined,
            other => return Err(CodecError::UnknownType(other)),
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::DateTime | Self::HiresTime)
    }

    pub fn is_real(self) -> bool {
        matches!(self, Self::Real | Self::RichReal)
    }

    /// Width of a non-null value of this kind in table row storage.
    pub fn stored_width(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Char | Self::Int32 | Self::UInt32 => 4,
            Self::Date => 4,
            Self::DateTime => 7,
            Self::HiresTime => 11,
            Self::Int64 | Self::UInt64 => 8,
            Self::Real | Self::RichReal => 16,
            // Variable-width kinds store a (extent, length) handle instead.
            Self::Text | Self::Undetermined => 16,
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A full type word: base kind plus composition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeWord(u16);

impl TypeWord {
    pub fn scalar(kind: TypeId) -> Self {
        Self(kind.code())
    }

    pub fn array(kind: TypeId) -> Self {
        Self(kind.code() | ARRAY_MASK)
    }

    pub fn field(kind: TypeId, is_array: bool) -> Self {
        let mut word = kind.code() | FIELD_MASK;
        if is_array {
            word |= ARRAY_MASK;
        }
        Self(word)
    }

    pub fn table() -> Self {
        Self(TABLE_MASK)
    }

    pub fn from_raw(word: u16) -> Result<Self, CodecError> {
        if word & TABLE_MASK != 0 {
            if word & BASE_MASK != 0 {
                return Err(CodecError::BadTypeDescriptor);
            }
            return Ok(Self(word));
        }
        TypeId::from_code(word & BASE_MASK)?;
        Ok(Self(word))
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_table(self) -> bool {
        self.0 & TABLE_MASK != 0
    }

    pub fn is_field(self) -> bool {
        self.0 & FIELD_MASK != 0
    }

    pub fn is_array(self) -> bool {
        self.0 & ARRAY_MASK != 0
    }

    /// The base primitive; meaningless for table words.
    pub fn base(self) -> Result<TypeId, CodecError> {
        TypeId::from_code(self.0 & BASE_MASK)
    }
}

/// One named column of a table type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: TypeId,
    pub is_array: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: TypeId, is_array: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            is_array,
        }
    }

    pub fn type_word(&self) -> TypeWord {
        if self.is_array {
            TypeWord::array(self.kind)
        } else {
            TypeWord::scalar(self.kind)
        }
    }
}

/// A serialized type descriptor: the type word, a payload size and either
/// the two-byte end marker or, for tables, the field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    Simple(TypeWord),
    Table(Vec<FieldSpec>),
}

const END_MARKER: [u8; 2] = [0x01, 0x00];
const FIELDS_TERMINATOR: [u8; 2] = [b';', 0x00];

impl TypeDescriptor {
    pub fn type_word(&self) -> TypeWord {
        match self {
            Self::Simple(word) => *word,
            Self::Table(_) => TypeWord::table(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(self.type_word().raw());
        match self {
            Self::Simple(_) => {
                w.u16(END_MARKER.len() as u16);
                w.bytes(&END_MARKER);
            }
            Self::Table(fields) => {
                let mut payload = Writer::new();
                for field in fields {
                    payload.cstr(&field.name);
                    payload.u16(field.type_word().raw());
                }
                payload.bytes(&FIELDS_TERMINATOR);
                w.u16(payload.len() as u16);
                w.bytes(payload.as_bytes());
            }
        }
        w.into_bytes()
    }

    pub fn parse(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut r = Reader::new(buf);
        let word = TypeWord::from_raw(r.u16()?)?;
        let payload_size = r.u16()? as usize;
        let payload = r.bytes(payload_size)?;

        if !word.is_table() {
            if payload != END_MARKER {
                return Err(CodecError::BadTypeDescriptor);
            }
            return Ok((Self::Simple(word), r.offset()));
        }

        let mut fields = Vec::new();
        let mut fr = Reader::new(payload);
        loop {
            let name = fr.cstr()?;
            if name == ";" {
                break;
            }
            let field_word = TypeWord::from_raw(fr.u16()?)?;
            if field_word.is_table() || field_word.is_field() {
                return Err(CodecError::BadTypeDescriptor);
            }
            fields.push(FieldSpec::new(
                name,
                field_word.base()?,
                field_word.is_array(),
            ));
        }
        if fr.remaining() != 0 {
            return Err(CodecError::BadTypeDescriptor);
        }
        Ok((Self::Table(fields), r.offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scalar_descriptor_round_trip() {
        for kind in [TypeId::Bool, TypeId::HiresTime, TypeId::Text, TypeId::UInt64] {
            let desc = TypeDescriptor::Simple(TypeWord::scalar(kind));
            let bytes = desc.serialize();
            assert_eq!(bytes.len(), 6);
            let (parsed, used) = TypeDescriptor::parse(&bytes).unwrap();
            assert_eq!(parsed, desc);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn table_descriptor_round_trip() {
        let desc = TypeDescriptor::Table(vec![
            FieldSpec::new("id", TypeId::UInt64, false),
            FieldSpec::new("stamps", TypeId::DateTime, true),
            FieldSpec::new("note", TypeId::Text, false),
        ]);
        let bytes = desc.serialize();
        let (parsed, used) = TypeDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn flags_compose() {
        let word = TypeWord::field(TypeId::Int32, true);
        assert!(word.is_field());
        assert!(word.is_array());
        assert!(!word.is_table());
        assert_eq!(word.base().unwrap(), TypeId::Int32);
    }

    #[test]
    fn bad_end_marker_rejected() {
        let mut bytes = TypeDescriptor::Simple(TypeWord::scalar(TypeId::Bool)).serialize();
        bytes[4] = 0x02;
        assert_eq!(
            TypeDescriptor::parse(&bytes),
            Err(CodecError::BadTypeDescriptor)
        );
    }
}
