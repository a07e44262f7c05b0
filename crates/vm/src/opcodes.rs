//! The WHAIS opcode set.
//!
//! One byte per opcode, immediates following little-endian. The byte
//! values are contiguous starting at 1; 0 is reserved as invalid.

use crate::errors::{InterError, InterErrorKind, Result};

/// Fixed-point precision used by the richreal load immediate.
pub const LDRR_PRECISION: i64 = whais_core::value::RICHREAL_PRECISION;

/// Flag in the CARR immediate marking construction from field values.
pub const CARR_FROM_FIELD: u8 = 0x80;

macro_rules! opcodes {
    ($first:ident, $($rest:ident),+ $(,)?) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::IntoStaticStr,
        )]
        #[strum(serialize_all = "UPPERCASE")]
        #[repr(u8)]
        pub enum Opcode {
            $first = 1,
            $($rest),+
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[Opcode::$first, $(Opcode::$rest),+];
        }
    };
}

opcodes! {
    LdNull, Ldc, LdI8, LdI16, LdI32, LdI64, Ldd, Lddt, Ldht, Ldrr, Ldt, Ldbt, Ldbf,
    LdLo8, LdLo16, LdLo32, LdGb8, LdGb16, LdGb32,
    Cts,
    Stb, Stc, Std, Stdt, Stht, StI8, StI16, StI32, StI64, Str, Strr, Stt,
    StUi8, StUi16, StUi32, StUi64, Stta, Stf, Sta, Stud,
    INull, NNull,
    Call, Ret,
    Add, AddRr, AddT,
    And, AndB,
    Div, DivU, DivRr,
    Eq, EqB, EqC, EqD, EqDt, EqHt, EqRr, EqT,
    Ge, GeU, GeC, GeD, GeDt, GeHt, GeRr,
    Gt, GtU, GtC, GtD, GtDt, GtHt, GtRr,
    Le, LeU, LeC, LeD, LeDt, LeHt, LeRr,
    Lt, LtU, LtC, LtD, LtDt, LtHt, LtRr,
    Mod, ModU,
    Mul, MulU, MulRr,
    Ne, NeB, NeC, NeD, NeDt, NeHt, NeRr, NeT,
    Not, NotB,
    Or, OrB,
    Sub, SubRr,
    Xor, XorB,
    Jf, Jfc, Jt, Jtc, Jmp,
    IndT, IndA, IndF, IndTa, SelfInd,
    BSync, ESync,
    SAdd, SAddRr, SAddC, SAddT,
    SSub, SSubRr,
    SMul, SMulU, SMulRr,
    SDiv, SDivU, SDivRr,
    SMod, SModU,
    SAnd, SAndB,
    SXor, SXorB,
    SOr, SOrB,
    Itf, Itl, Itn, Itp, ItOff, Fid,
    Carr,
    AJoin, AFOut, AFIn,
}

impl Opcode {
    /// Decode the opcode starting a code position; opcodes are always one
    /// byte, so the decoded length is 1.
    pub fn decode(code: &[u8]) -> Result<(Opcode, usize)> {
        let byte = *code
            .first()
            .ok_or_else(|| InterError::fault(InterErrorKind::StackCorrupted))?;
        Self::from_byte(byte)
            .map(|op| (op, 1))
            .ok_or_else(|| {
                InterError::new(
                    InterErrorKind::UnitCorrupted,
                    format!("invalid opcode byte 0x{byte:02x}"),
                )
            })
    }

    pub fn from_byte(byte: u8) -> Option<Opcode> {
        if byte == 0 {
            return None;
        }
        Self::ALL.get(byte as usize - 1).copied()
    }

    pub fn mnemonic(self) -> &'static str {
        // A few variants need spellings strum cannot derive.
        match self {
            Self::SelfInd => "SELF",
            other => other.into(),
        }
    }

    /// Byte length of the immediates following the opcode.
    pub fn immediates_len(self) -> usize {
        use Opcode::*;
        match self {
            LdNull | LdI8 | LdLo8 | LdGb8 | Cts | BSync | ESync => 1,
            LdI16 | LdLo16 | LdGb16 => 2,
            Ldc | LdI32 | LdLo32 | LdGb32 | Ldt => 4,
            Ldd => 4,
            Lddt => 7,
            Ldht => 11,
            LdI64 => 8,
            Ldrr => 16,
            Call | Jf | Jfc | Jt | Jtc | Jmp => 4,
            IndTa | SelfInd => 4,
            Carr => 3,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn byte_values_are_contiguous() {
        for (i, &op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op as u8 as usize, i + 1);
            assert_eq!(Opcode::from_byte(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_byte(0), None);
        assert_eq!(Opcode::from_byte(Opcode::ALL.len() as u8 + 1), None);
    }

    #[test]
    fn decode_is_one_byte() {
        let (op, len) = Opcode::decode(&[Opcode::Ret as u8, 0xFF]).unwrap();
        assert_eq!(op, Opcode::Ret);
        assert_eq!(len, 1);
        assert!(Opcode::decode(&[0]).is_err());
    }

    #[test]
    fn mnemonics_match_the_reference_spelling() {
        assert_eq!(Opcode::LdNull.mnemonic(), "LDNULL");
        assert_eq!(Opcode::AddRr.mnemonic(), "ADDRR");
        assert_eq!(Opcode::SelfInd.mnemonic(), "SELF");
        assert_eq!(Opcode::SAndB.mnemonic(), "SANDB");
        assert_eq!(Opcode::ItOff.mnemonic(), "ITOFF");
    }

    #[test]
    fn known_immediate_widths() {
        assert_eq!(Opcode::LdNull.immediates_len(), 1);
        assert_eq!(Opcode::Ldrr.immediates_len(), 16);
        assert_eq!(Opcode::Ldht.immediates_len(), 11);
        assert_eq!(Opcode::Jmp.immediates_len(), 4);
        assert_eq!(Opcode::Ret.immediates_len(), 0);
        assert_eq!(Opcode::Carr.immediates_len(), 3);
    }
}
