//! Runtime scalar values.
//!
//! Every primitive kind has a distinguished null separate from its zero
//! value; nulls are carried as `None` payloads. Temporal values validate on
//! construction and know how to pack themselves into fixed-width integers
//! for index storage.

use crate::endian::{Reader, Writer};
use crate::errors::{CodecError, ValueError};
use crate::types::TypeId;

/// Denominator of the fixed-point fractional part, also the precision used
/// by the richreal load-immediate instruction.
pub const RICHREAL_PRECISION: i64 = 1_000_000_000_000_000_000;

/// Inclusive year range accepted for dates.
pub const MIN_YEAR: i16 = -9999;
pub const MAX_YEAR: i16 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    year: i16,
    month: u8,
    day: u8,
}

impl Date {
    pub fn new(year: i16, month: u8, day: u8) -> Result<Self, ValueError> {
        let invalid = ValueError::InvalidDate { year, month, day };
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) || month == 0 || month > 12 {
            return Err(invalid);
        }
        if day == 0 || day > days_in_month(year, month) {
            return Err(invalid);
        }
        Ok(Self { year, month, day })
    }

    pub fn year(&self) -> i16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    /// Days since 0000-03-01 (civil-day algorithm); total order over dates.
    pub fn to_days(&self) -> i64 {
        let y = i64::from(self.year) - i64::from(self.month <= 2);
        let era = y.div_euclid(400);
        let yoe = y - era * 400;
        let mp = (i64::from(self.month) + 9) % 12;
        let doy = (153 * mp + 2) / 5 + i64::from(self.day) - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        era * 146097 + doe
    }
}

impl std::fmt::Display for Date {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    date: Date,
    hour: u8,
    min: u8,
    sec: u8,
}

impl DateTime {
    pub fn new(
        year: i16,
        month: u8,
        day: u8,
        hour: u8,
        min: u8,
        sec: u8,
    ) -> Result<Self, ValueError> {
        let date = Date::new(year, month, day)?;
        if hour > 23 || min > 59 || sec > 59 {
            return Err(ValueError::InvalidTime {
                hour,
                min,
                sec,
                usec: 0,
            });
        }
        Ok(Self {
            date,
            hour,
            min,
            sec,
        })
    }

    pub fn from_date(date: Date) -> Self {
        Self {
            date,
            hour: 0,
            min: 0,
            sec: 0,
        }
    }

    pub fn date(&self) -> Date {
        self.date
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn min(&self) -> u8 {
        self.min
    }

    pub fn sec(&self) -> u8 {
        self.sec
    }

    pub fn to_seconds(&self) -> i64 {
        self.date.to_days() * 86_400
            + i64::from(self.hour) * 3_600
            + i64::from(self.min) * 60
            + i64::from(self.sec)
    }
}

impl std::fmt::Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}",
            self.date, self.hour, self.min, self.sec
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HiresTime {
    time: DateTime,
    usec: u32,
}

impl HiresTime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        year: i16,
        month: u8,
        day: u8,
        hour: u8,
        min: u8,
        sec: u8,
        usec: u32,
    ) -> Result<Self, ValueError> {
        let time = DateTime::new(year, month, day, hour, min, sec)?;
        if usec > 999_999 {
            return Err(ValueError::InvalidTime {
                hour,
                min,
                sec,
                usec,
            });
        }
        Ok(Self { time, usec })
    }

    pub fn from_datetime(time: DateTime) -> Self {
        Self { time, usec: 0 }
    }

    pub fn time(&self) -> DateTime {
        self.time
    }

    pub fn usec(&self) -> u32 {
        self.usec
    }

    pub fn to_micros(&self) -> i64 {
        self.time.to_seconds() * 1_000_000 + i64::from(self.usec)
    }
}

impl std::fmt::Display for HiresTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.time, self.usec)
    }
}

/// Fixed-point rational with an 18-digit fractional part. REAL and RICHREAL
/// share this layout; they differ only in their declared kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Real {
    units: i64,
    frac: i64,
}

impl Real {
    pub const ZERO: Real = Real { units: 0, frac: 0 };

    pub fn from_int(units: i64) -> Self {
        Self { units, frac: 0 }
    }

    /// Build from raw parts as they appear in bytecode immediates; the
    /// fraction is normalized into the units on overflow.
    pub fn from_parts(units: i64, frac: i64) -> Result<Self, ValueError> {
        let total = i128::from(units)
            .checked_mul(i128::from(RICHREAL_PRECISION))
            .and_then(|t| t.checked_add(i128::from(frac)))
            .ok_or(ValueError::NumericOverflow {
                to: TypeId::RichReal,
            })?;
        Self::from_total(total)
    }

    fn from_total(total: i128) -> Result<Self, ValueError> {
        let units = total / i128::from(RICHREAL_PRECISION);
        let frac = total % i128::from(RICHREAL_PRECISION);
        if units > i128::from(i64::MAX) || units < i128::from(i64::MIN) {
            return Err(ValueError::NumericOverflow {
                to: TypeId::RichReal,
            });
        }
        Ok(Self {
            units: units as i64,
            frac: frac as i64,
        })
    }

    /// The value scaled by 10^18; a monotonic fixed-width image used for
    /// arithmetic and index keys.
    pub fn scaled_total(&self) -> i128 {
        i128::from(self.units) * i128::from(RICHREAL_PRECISION) + i128::from(self.frac)
    }

    fn total(&self) -> i128 {
        self.scaled_total()
    }

    pub fn units(&self) -> i64 {
        self.units
    }

    pub fn frac(&self) -> i64 {
        self.frac
    }

    pub fn is_zero(&self) -> bool {
        self.units == 0 && self.frac == 0
    }

    pub fn checked_add(self, other: Real) -> Result<Real, ValueError> {
        Self::from_total(self.total() + other.total())
    }

    pub fn checked_sub(self, other: Real) -> Result<Real, ValueError> {
        Self::from_total(self.total() - other.total())
    }

    pub fn checked_mul(self, other: Real) -> Result<Real, ValueError> {
        let p = i128::from(RICHREAL_PRECISION);
        let (ua, fa) = (i128::from(self.units), i128::from(self.frac));
        let (ub, fb) = (i128::from(other.units), i128::from(other.frac));

        let int_cross = ua
            .checked_mul(ub)
            .and_then(|v| v.checked_mul(p))
            .ok_or(ValueError::NumericOverflow {
                to: TypeId::RichReal,
            })?;
        let total = int_cross + ua * fb + ub * fa + (fa * fb) / p;
        Self::from_total(total)
    }

    /// Exact long division with 18 fractional digits; `other` must not be
    /// zero (checked by callers as a divide-by-zero fault).
    pub fn checked_div(self, other: Real) -> Result<Real, ValueError> {
        let ta = self.total();
        let tb = other.total();
        debug_assert!(tb != 0);

        let q = ta / tb;
        let mut r = ta % tb;
        let mut frac: i128 = 0;
        for _ in 0..18 {
            r *= 10;
            frac = frac * 10 + r / tb;
            r %= tb;
        }
        Self::from_total(q * i128::from(RICHREAL_PRECISION) + frac)
    }
}

impl PartialOrd for Real {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Real {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.total().cmp(&other.total())
    }
}

impl std::fmt::Display for Real {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.frac == 0 {
            return write!(f, "{}", self.units);
        }
        let frac = format!("{:018}", self.frac.unsigned_abs());
        let frac = frac.trim_end_matches('0');
        if self.units == 0 && self.frac < 0 {
            write!(f, "-0.{frac}")
        } else {
            write!(f, "{}.{frac}", self.units)
        }
    }
}

/// A typed, possibly-null scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(Option<bool>),
    Char(Option<char>),
    Date(Option<Date>),
    DateTime(Option<DateTime>),
    HiresTime(Option<HiresTime>),
    Int8(Option<i8>),
    Int16(Option<i16>),
    Int32(Option<i32>),
    Int64(Option<i64>),
    UInt8(Option<u8>),
    UInt16(Option<u16>),
    UInt32(Option<u32>),
    UInt64(Option<u64>),
    Real(Option<Real>),
    RichReal(Option<Real>),
}

impl Scalar {
    pub fn kind(&self) -> TypeId {
        match self {
            Self::Bool(_) => TypeId::Bool,
            Self::Char(_) => TypeId::Char,
            Self::Date(_) => TypeId::Date,
            Self::DateTime(_) => TypeId::DateTime,
            Self::HiresTime(_) => TypeId::HiresTime,
            Self::Int8(_) => TypeId::Int8,
            Self::Int16(_) => TypeId::Int16,
            Self::Int32(_) => TypeId::Int32,
            Self::Int64(_) => TypeId::Int64,
            Self::UInt8(_) => TypeId::UInt8,
            Self::UInt16(_) => TypeId::UInt16,
            Self::UInt32(_) => TypeId::UInt32,
            Self::UInt64(_) => TypeId::UInt64,
            Self::Real(_) => TypeId::Real,
            Self::RichReal(_) => TypeId::RichReal,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Bool(v) => v.is_none(),
            Self::Char(v) => v.is_none(),
            Self::Date(v) => v.is_none(),
            Self::DateTime(v) => v.is_none(),
            Self::HiresTime(v) => v.is_none(),
            Self::Int8(v) => v.is_none(),
            Self::Int16(v) => v.is_none(),
            Self::Int32(v) => v.is_none(),
            Self::Int64(v) => v.is_none(),
            Self::UInt8(v) => v.is_none(),
            Self::UInt16(v) => v.is_none(),
            Self::UInt32(v) => v.is_none(),
            Self::UInt64(v) => v.is_none(),
            Self::Real(v) => v.is_none(),
            Self::RichReal(v) => v.is_none(),
        }
    }

    /// The null of a scalar kind; `None` for TEXT and UNDETERMINED which
    /// are not scalar-representable.
    pub fn null_of(kind: TypeId) -> Option<Scalar> {
        Some(match kind {
            TypeId::Bool => Self::Bool(None),
            TypeId::Char => Self::Char(None),
            TypeId::Date => Self::Date(None),
            TypeId::DateTime => Self::DateTime(None),
            TypeId::HiresTime => Self::HiresTime(None),
            TypeId::Int8 => Self::Int8(None),
            TypeId::Int16 => Self::Int16(None),
            TypeId::Int32 => Self::Int32(None),
            TypeId::Int64 => Self::Int64(None),
            TypeId::UInt8 => Self::UInt8(None),
            TypeId::UInt16 => Self::UInt16(None),
            TypeId::UInt32 => Self::UInt32(None),
            TypeId::UInt64 => Self::UInt64(None),
            TypeId::Real => Self::Real(None),
            TypeId::RichReal => Self::RichReal(None),
            TypeId::Text | TypeId::Undetermined => return None,
        })
    }

    pub fn to_i64(&self) -> Result<Option<i64>, ValueError> {
        Ok(Some(match *self {
            Self::Int8(v) => match v {
                Some(v) => i64::from(v),
                None => return Ok(None),
            },
            Self::Int16(v) => match v {
                Some(v) => i64::from(v),
                None => return Ok(None),
            },
            Self::Int32(v) => match v {
                Some(v) => i64::from(v),
                None => return Ok(None),
            },
            Self::Int64(v) => match v {
                Some(v) => v,
                None => return Ok(None),
            },
            Self::UInt8(v) => match v {
                Some(v) => i64::from(v),
                None => return Ok(None),
            },
            Self::UInt16(v) => match v {
                Some(v) => i64::from(v),
                None => return Ok(None),
            },
            Self::UInt32(v) => match v {
                Some(v) => i64::from(v),
                None => return Ok(None),
            },
            Self::UInt64(v) => match v {
                Some(v) => i64::try_from(v).map_err(|_| ValueError::NumericOverflow {
                    to: TypeId::Int64,
                })?,
                None => return Ok(None),
            },
            _ => {
                return Err(ValueError::TypeMismatch {
                    from: self.kind(),
                    to: TypeId::Int64,
                });
            }
        }))
    }

    pub fn to_u64(&self) -> Result<Option<u64>, ValueError> {
        let signed = self.to_i64()?;
        match signed {
            None => Ok(None),
            Some(v) => u64::try_from(v)
                .map(Some)
                .map_err(|_| ValueError::NumericOverflow { to: TypeId::UInt64 }),
        }
    }

    pub fn to_real(&self) -> Result<Option<Real>, ValueError> {
        match *self {
            Self::Real(v) | Self::RichReal(v) => Ok(v),
            _ => Ok(self.to_i64()?.map(Real::from_int)),
        }
    }

    pub fn to_bool(&self) -> Result<Option<bool>, ValueError> {
        match *self {
            Self::Bool(v) => Ok(v),
            _ => Err(ValueError::TypeMismatch {
                from: self.kind(),
                to: TypeId::Bool,
            }),
        }
    }

    pub fn to_char(&self) -> Result<Option<char>, ValueError> {
        match *self {
            Self::Char(v) => Ok(v),
            _ => Err(ValueError::TypeMismatch {
                from: self.kind(),
                to: TypeId::Char,
            }),
        }
    }

    /// Widening conversion to `to`; nulls convert to the null of `to`.
    pub fn cast(&self, to: TypeId) -> Result<Scalar, ValueError> {
        let from = self.kind();
        if from == to {
            return Ok(*self);
        }
        if self.is_null() {
            return Scalar::null_of(to).ok_or(ValueError::TypeMismatch { from, to });
        }
        let mismatch = ValueError::TypeMismatch { from, to };
        let overflow = ValueError::NumericOverflow { to };

        match to {
            TypeId::Int8 | TypeId::Int16 | TypeId::Int32 | TypeId::Int64 => {
                let v = self.to_i64()?.unwrap_or_default();
                Ok(match to {
                    TypeId::Int8 => Self::Int8(Some(i8::try_from(v).map_err(|_| overflow)?)),
                    TypeId::Int16 => Self::Int16(Some(i16::try_from(v).map_err(|_| overflow)?)),
                    TypeId::Int32 => Self::Int32(Some(i32::try_from(v).map_err(|_| overflow)?)),
                    _ => Self::Int64(Some(v)),
                })
            }
            TypeId::UInt8 | TypeId::UInt16 | TypeId::UInt32 | TypeId::UInt64 => {
                let v = self.to_u64()?.unwrap_or_default();
                Ok(match to {
                    TypeId::UInt8 => Self::UInt8(Some(u8::try_from(v).map_err(|_| overflow)?)),
                    TypeId::UInt16 => Self::UInt16(Some(u16::try_from(v).map_err(|_| overflow)?)),
                    TypeId::UInt32 => Self::UInt32(Some(u32::try_from(v).map_err(|_| overflow)?)),
                    _ => Self::UInt64(Some(v)),
                })
            }
            TypeId::Real => Ok(Self::Real(self.to_real()?)),
            TypeId::RichReal => Ok(Self::RichReal(self.to_real()?)),
            TypeId::DateTime => match *self {
                Self::Date(Some(d)) => Ok(Self::DateTime(Some(DateTime::from_date(d)))),
                _ => Err(mismatch),
            },
            TypeId::HiresTime => match *self {
                Self::Date(Some(d)) => Ok(Self::HiresTime(Some(HiresTime::from_datetime(
                    DateTime::from_date(d),
                )))),
                Self::DateTime(Some(t)) => Ok(Self::HiresTime(Some(HiresTime::from_datetime(t)))),
                _ => Err(mismatch),
            },
            _ => Err(mismatch),
        }
    }

    /// Compare two scalars after promoting to a common kind. `None` when
    /// either side is null or the kinds cannot be compared.
    pub fn compare(&self, other: &Scalar) -> Result<Option<std::cmp::Ordering>, ValueError> {
        if self.is_null() || other.is_null() {
            return Ok(None);
        }
        let result = match (self, other) {
            (Self::Bool(Some(a)), Self::Bool(Some(b))) => a.cmp(b),
            (Self::Char(Some(a)), Self::Char(Some(b))) => a.cmp(b),
            (Self::Date(_), _) | (Self::DateTime(_), _) | (Self::HiresTime(_), _) => {
                let a = self.cast(TypeId::HiresTime)?;
                let b = other.cast(TypeId::HiresTime)?;
                match (a, b) {
                    (Self::HiresTime(Some(a)), Self::HiresTime(Some(b))) => a.cmp(&b),
                    _ => unreachable!("temporal cast preserves non-null"),
                }
            }
            _ if self.kind().is_real() || other.kind().is_real() => {
                let a = self.to_real()?.unwrap_or(Real::ZERO);
                let b = other.to_real()?.unwrap_or(Real::ZERO);
                a.cmp(&b)
            }
            _ if self.kind().is_integer() && other.kind().is_integer() => {
                match (self.to_i64(), other.to_i64()) {
                    (Ok(Some(a)), Ok(Some(b))) => a.cmp(&b),
                    // One side exceeds i64: both must be unsigned-comparable.
                    _ => {
                        let a = self.to_u64()?.unwrap_or_default();
                        let b = other.to_u64()?.unwrap_or_default();
                        a.cmp(&b)
                    }
                }
            }
            _ => {
                return Err(ValueError::TypeMismatch {
                    from: other.kind(),
                    to: self.kind(),
                });
            }
        };
        Ok(Some(result))
    }

    /// Serialize a non-null value at its fixed stored width.
    pub fn write_stored(&self, out: &mut Writer) {
        debug_assert!(!self.is_null());
        match *self {
            Self::Bool(v) => {
                out.u8(v.unwrap_or_default() as u8);
            }
            Self::Char(v) => {
                out.u32(v.unwrap_or_default() as u32);
            }
            Self::Date(v) => {
                let d = v.unwrap_or(Date {
                    year: 0,
                    month: 1,
                    day: 1,
                });
                out.i16(d.year).u8(d.month).u8(d.day);
            }
            Self::DateTime(v) => {
                Self::Date(v.map(|t| t.date)).write_stored(out);
                let t = v.unwrap_or(DateTime::from_date(Date {
                    year: 0,
                    month: 1,
                    day: 1,
                }));
                out.u8(t.hour).u8(t.min).u8(t.sec);
            }
            Self::HiresTime(v) => {
                Self::DateTime(v.map(|t| t.time)).write_stored(out);
                out.u32(v.map(|t| t.usec).unwrap_or_default());
            }
            Self::Int8(v) => {
                out.u8(v.unwrap_or_default() as u8);
            }
            Self::Int16(v) => {
                out.i16(v.unwrap_or_default());
            }
            Self::Int32(v) => {
                out.i32(v.unwrap_or_default());
            }
            Self::Int64(v) => {
                out.i64(v.unwrap_or_default());
            }
            Self::UInt8(v) => {
                out.u8(v.unwrap_or_default());
            }
            Self::UInt16(v) => {
                out.u16(v.unwrap_or_default());
            }
            Self::UInt32(v) => {
                out.u32(v.unwrap_or_default());
            }
            Self::UInt64(v) => {
                out.u64(v.unwrap_or_default());
            }
            Self::Real(v) | Self::RichReal(v) => {
                let r = v.unwrap_or(Real::ZERO);
                out.i64(r.units).i64(r.frac);
            }
        }
    }

    /// Deserialize a non-null value of `kind` from its stored encoding.
    pub fn read_stored(kind: TypeId, r: &mut Reader) -> Result<Scalar, CodecError> {
        let bad = || CodecError::BadTypeDescriptor;
        Ok(match kind {
            TypeId::Bool => Self::Bool(Some(r.u8()? != 0)),
            TypeId::Char => Self::Char(Some(char::from_u32(r.u32()?).ok_or_else(bad)?)),
            TypeId::Date => {
                let (year, month, day) = (r.i16()?, r.u8()?, r.u8()?);
                Self::Date(Some(Date::new(year, month, day).map_err(|_| bad())?))
            }
            TypeId::DateTime => {
                let (year, month, day) = (r.i16()?, r.u8()?, r.u8()?);
                let (hour, min, sec) = (r.u8()?, r.u8()?, r.u8()?);
                Self::DateTime(Some(
                    DateTime::new(year, month, day, hour, min, sec).map_err(|_| bad())?,
                ))
            }
            TypeId::HiresTime => {
                let (year, month, day) = (r.i16()?, r.u8()?, r.u8()?);
                let (hour, min, sec) = (r.u8()?, r.u8()?, r.u8()?);
                let usec = r.u32()?;
                Self::HiresTime(Some(
                    HiresTime::new(year, month, day, hour, min, sec, usec).map_err(|_| bad())?,
                ))
            }
            TypeId::Int8 => Self::Int8(Some(r.u8()? as i8)),
            TypeId::Int16 => Self::Int16(Some(r.i16()?)),
            TypeId::Int32 => Self::Int32(Some(r.i32()?)),
            TypeId::Int64 => Self::Int64(Some(r.i64()?)),
            TypeId::UInt8 => Self::UInt8(Some(r.u8()?)),
            TypeId::UInt16 => Self::UInt16(Some(r.u16()?)),
            TypeId::UInt32 => Self::UInt32(Some(r.u32()?)),
            TypeId::UInt64 => Self::UInt64(Some(r.u64()?)),
            TypeId::Real => Self::Real(Some(Real {
                units: r.i64()?,
                frac: r.i64()?,
            })),
            TypeId::RichReal => Self::RichReal(Some(Real {
                units: r.i64()?,
                frac: r.i64()?,
            })),
            TypeId::Text | TypeId::Undetermined => return Err(bad()),
        })
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        macro_rules! show {
            ($v:expr) => {
                match $v {
                    Some(v) => write!(f, "{v}"),
                    None => f.write_str("NULL"),
                }
            };
        }
        match self {
            Self::Bool(v) => show!(v),
            Self::Char(v) => show!(v),
            Self::Date(v) => show!(v),
            Self::DateTime(v) => show!(v),
            Self::HiresTime(v) => show!(v),
            Self::Int8(v) => show!(v),
            Self::Int16(v) => show!(v),
            Self::Int32(v) => show!(v),
            Self::Int64(v) => show!(v),
            Self::UInt8(v) => show!(v),
            Self::UInt16(v) => show!(v),
            Self::UInt32(v) => show!(v),
            Self::UInt64(v) => show!(v),
            Self::Real(v) => show!(v),
            Self::RichReal(v) => show!(v),
        }
    }
}

/// Homogeneous array of non-null scalars. TEXT arrays are disallowed.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    elem: TypeId,
    items: Vec<Scalar>,
}

impl ArrayValue {
    pub fn new(elem: TypeId) -> Result<Self, ValueError> {
        if elem == TypeId::Text || elem == TypeId::Undetermined {
            return Err(ValueError::TypeMismatch {
                from: elem,
                to: elem,
            });
        }
        Ok(Self {
            elem,
            items: Vec::new(),
        })
    }

    pub fn elem_kind(&self) -> TypeId {
        self.elem
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[Scalar] {
        &self.items
    }

    pub fn push(&mut self, value: Scalar) -> Result<(), ValueError> {
        let value = value.cast(self.elem)?;
        if value.is_null() {
            return Err(ValueError::TypeMismatch {
                from: TypeId::Undetermined,
                to: self.elem,
            });
        }
        self.items.push(value);
        Ok(())
    }

    pub fn set(&mut self, index: usize, value: Scalar) -> Result<(), ValueError> {
        let value = value.cast(self.elem)?;
        if value.is_null() {
            return Err(ValueError::TypeMismatch {
                from: TypeId::Undetermined,
                to: self.elem,
            });
        }
        self.items[index] = value;
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        for item in &self.items {
            item.write_stored(&mut w);
        }
        w.into_bytes()
    }

    pub fn deserialize(elem: TypeId, bytes: &[u8]) -> Result<Self, CodecError> {
        let width = elem.stored_width();
        if width == 0 || bytes.len() % width != 0 {
            return Err(CodecError::BadTypeDescriptor);
        }
        let mut r = Reader::new(bytes);
        let mut items = Vec::with_capacity(bytes.len() / width);
        while r.remaining() > 0 {
            items.push(Scalar::read_stored(elem, &mut r)?);
        }
        Ok(Self { elem, items })
    }
}

/// Any storable value: scalar, text or array. Null text and null arrays
/// are distinct from empty ones.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Text(Option<String>),
    Array(TypeId, Option<ArrayValue>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Self::Scalar(s) => s.is_null(),
            Self::Text(t) => t.is_none(),
            Self::Array(_, a) => a.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn date_validation() {
        assert!(Date::new(2024, 2, 29).is_ok());
        assert!(Date::new(2023, 2, 29).is_err());
        assert!(Date::new(2023, 13, 1).is_err());
        assert!(Date::new(-10000, 1, 1).is_err());
        assert!(Date::new(9999, 12, 31).is_ok());
    }

    #[test]
    fn civil_days_are_monotonic() {
        let a = Date::new(1969, 12, 31).unwrap();
        let b = Date::new(1970, 1, 1).unwrap();
        assert_eq!(b.to_days() - a.to_days(), 1);
        assert!(Date::new(-9999, 1, 1).unwrap().to_days() < a.to_days());
    }

    #[test]
    fn real_arithmetic_keeps_precision() {
        let half = Real::from_parts(0, RICHREAL_PRECISION / 2).unwrap();
        let three = Real::from_int(3);
        assert_eq!(half.checked_add(half).unwrap(), Real::from_int(1));
        assert_eq!(
            three.checked_mul(half).unwrap(),
            Real::from_parts(1, RICHREAL_PRECISION / 2).unwrap()
        );

        let third = Real::from_int(1).checked_div(three).unwrap();
        assert_eq!(third.units(), 0);
        assert_eq!(third.frac(), 333_333_333_333_333_333);
    }

    #[test]
    fn real_ordering_handles_negatives() {
        let neg = Real::from_parts(-1, -RICHREAL_PRECISION / 2).unwrap();
        assert!(neg < Real::from_int(-1));
        assert!(Real::from_int(-2) < neg);
        assert_eq!(format!("{neg}"), "-1.5");
    }

    #[test]
    fn widening_commutes_with_null() {
        let null8 = Scalar::Int8(None);
        assert_eq!(null8.cast(TypeId::Int64).unwrap(), Scalar::Int64(None));
        assert_eq!(
            Scalar::Int8(Some(-3)).cast(TypeId::Int64).unwrap(),
            Scalar::Int64(Some(-3))
        );
    }

    #[test]
    fn narrowing_overflow_detected() {
        let wide = Scalar::UInt64(Some(u64::MAX));
        assert_eq!(
            wide.cast(TypeId::Int64),
            Err(ValueError::NumericOverflow { to: TypeId::Int64 })
        );
        assert_eq!(
            Scalar::Int64(Some(-1)).to_u64(),
            Err(ValueError::NumericOverflow { to: TypeId::UInt64 })
        );
    }

    #[test]
    fn stored_round_trip() {
        let values = [
            Scalar::Bool(Some(true)),
            Scalar::Char(Some('Ș')),
            Scalar::Date(Some(Date::new(-33, 7, 4).unwrap())),
            Scalar::HiresTime(Some(HiresTime::new(2001, 2, 3, 4, 5, 6, 789).unwrap())),
            Scalar::Int32(Some(-123_456)),
            Scalar::UInt64(Some(u64::MAX)),
            Scalar::RichReal(Some(Real::from_parts(-7, -25).unwrap())),
        ];
        for value in values {
            let mut w = Writer::new();
            value.write_stored(&mut w);
            let bytes = w.into_bytes();
            assert_eq!(bytes.len(), value.kind().stored_width());
            let mut r = Reader::new(&bytes);
            assert_eq!(Scalar::read_stored(value.kind(), &mut r).unwrap(), value);
        }
    }

    #[test]
    fn mixed_comparison_promotes() {
        let a = Scalar::Int16(Some(100));
        let b = Scalar::UInt32(Some(250));
        assert_eq!(
            a.compare(&b).unwrap(),
            Some(std::cmp::Ordering::Less)
        );
        assert_eq!(a.compare(&Scalar::Int16(None)).unwrap(), None);

        let d = Scalar::Date(Some(Date::new(2020, 1, 2).unwrap()));
        let t = Scalar::DateTime(Some(DateTime::new(2020, 1, 2, 0, 0, 1).unwrap()));
        assert_eq!(d.compare(&t).unwrap(), Some(std::cmp::Ordering::Less));
    }

    #[test]
    fn arrays_reject_text_and_nulls() {
        assert!(ArrayValue::new(TypeId::Text).is_err());
        let mut arr = ArrayValue::new(TypeId::UInt16).unwrap();
        arr.push(Scalar::UInt8(Some(9))).unwrap();
        assert_eq!(arr.items()[0], Scalar::UInt16(Some(9)));
        assert!(arr.push(Scalar::UInt16(None)).is_err());
    }

    #[test]
    fn array_serialize_round_trip() {
        let mut arr = ArrayValue::new(TypeId::Int32).unwrap();
        for v in [-5, 0, 77] {
            arr.push(Scalar::Int32(Some(v))).unwrap();
        }
        let bytes = arr.serialize();
        assert_eq!(bytes.len(), 12);
        assert_eq!(ArrayValue::deserialize(TypeId::Int32, &bytes).unwrap(), arr);
    }
}

fn days_in_month(year: i16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap(year) => 29,
        2 => 28,
        _ => 0,
    }
}

fn is_leap(year: i16) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}
