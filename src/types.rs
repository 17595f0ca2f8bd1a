//! Parameter and result values.
//!
//! Only the handful of built-in types needed to carry query arguments and
//! simple results are understood; anything else is surfaced as raw bytes.

use bytes::{BufMut, BytesMut};

use crate::error::{PgError, PgResult};

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub u32);

impl Oid {
    /// Lets the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }
}

/// A single column or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    /// A value of a type this crate does not decode.
    Raw { oid: Oid, data: Vec<u8> },
}

/// One result row.
pub type Row = Vec<PgValue>;

impl PgValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Append the length-prefixed binary encoding used in `Bind`.
    pub(crate) fn write_binary(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_i32(0);
        match self {
            PgValue::Null => {
                buf[start..start + 4].copy_from_slice(&(-1i32).to_be_bytes());
                return;
            }
            PgValue::Bool(v) => buf.put_u8(u8::from(*v)),
            PgValue::Int2(v) => buf.put_i16(*v),
            PgValue::Int4(v) => buf.put_i32(*v),
            PgValue::Int8(v) => buf.put_i64(*v),
            PgValue::Float4(v) => buf.put_f32(*v),
            PgValue::Float8(v) => buf.put_f64(*v),
            PgValue::Text(v) => buf.put_slice(v.as_bytes()),
            PgValue::Bytea(v) | PgValue::Raw { data: v, .. } => buf.put_slice(v),
        }
        let len = (buf.len() - start - 4) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Adapt a numeric argument to the width the server inferred for a
    /// parameter. Values that do not fit are passed through and left for the
    /// server to reject.
    pub fn cast_for(&self, oid: Oid) -> PgValue {
        let widened = match (self, oid) {
            (PgValue::Int2(_) | PgValue::Int4(_) | PgValue::Int8(_), _) => {
                let Some(v) = self.as_i64() else {
                    return self.clone();
                };
                match oid {
                    Oid::INT2 => i16::try_from(v).ok().map(PgValue::Int2),
                    Oid::INT4 => i32::try_from(v).ok().map(PgValue::Int4),
                    Oid::INT8 => Some(PgValue::Int8(v)),
                    Oid::FLOAT8 => Some(PgValue::Float8(v as f64)),
                    _ => None,
                }
            }
            (PgValue::Float4(v), Oid::FLOAT8) => Some(PgValue::Float8(f64::from(*v))),
            (PgValue::Float8(v), Oid::FLOAT4) => Some(PgValue::Float4(*v as f32)),
            _ => None,
        };
        widened.unwrap_or_else(|| self.clone())
    }

    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let value = match oid {
            Oid::BOOL => PgValue::Bool(fixed::<1>(oid, data)?[0] != 0),
            Oid::INT2 => PgValue::Int2(i16::from_be_bytes(fixed(oid, data)?)),
            Oid::INT4 => PgValue::Int4(i32::from_be_bytes(fixed(oid, data)?)),
            Oid::OID => PgValue::Int8(i64::from(u32::from_be_bytes(fixed(oid, data)?))),
            Oid::INT8 => PgValue::Int8(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::FLOAT4 => PgValue::Float4(f32::from_be_bytes(fixed(oid, data)?)),
            Oid::FLOAT8 => PgValue::Float8(f64::from_be_bytes(fixed(oid, data)?)),
            Oid::BYTEA => PgValue::Bytea(data.to_vec()),
            _ if oid.is_text_like() => PgValue::Text(utf8(data)?),
            _ => PgValue::Raw {
                oid,
                data: data.to_vec(),
            },
        };
        Ok(value)
    }

    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = utf8(data)?;
        let parse_err = |e: &dyn std::fmt::Display| PgError::Type(format!("invalid {:?} text value {:?}: {}", oid, text, e));
        let value = match oid {
            Oid::BOOL => PgValue::Bool(matches!(text.as_str(), "t" | "true" | "1")),
            Oid::INT2 => PgValue::Int2(text.parse().map_err(|e| parse_err(&e))?),
            Oid::INT4 => PgValue::Int4(text.parse().map_err(|e| parse_err(&e))?),
            Oid::INT8 | Oid::OID => PgValue::Int8(text.parse().map_err(|e| parse_err(&e))?),
            Oid::FLOAT4 => PgValue::Float4(text.parse().map_err(|e| parse_err(&e))?),
            Oid::FLOAT8 => PgValue::Float8(text.parse().map_err(|e| parse_err(&e))?),
            _ => PgValue::Text(text),
        };
        Ok(value)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> PgResult<[u8; N]> {
    data.try_into().map_err(|_| {
        PgError::Type(format!(
            "expected {} bytes for {:?}, got {}",
            N,
            oid,
            data.len()
        ))
    })
}

fn utf8(data: &[u8]) -> PgResult<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|e| PgError::Type(format!("invalid UTF-8: {}", e)))
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float8(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}
