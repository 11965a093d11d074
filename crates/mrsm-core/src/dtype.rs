//! Logical dtype system (spec §4.1).
//!
//! A [`Dtype`] is mrsm's tagged sum type over the logical column types a
//! pipe can declare. [`Value`] is the corresponding tagged sum type over a
//! single cell. Coercion between the two lives in [`crate::dataframe`],
//! which operates over whole batches (widening a column's dtype is a
//! batch-level decision, not a per-value one).

use crate::error::MrsmError;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical dtype of a pipe column.
///
/// Recognized dtypes per spec §3: `int`, `float`, `numeric[p,s]`, `bool`,
/// `str`, `bytes`, `uuid`, `json`, `datetime64[ns]` (naive) and
/// `datetime64[ns,UTC]` (aware).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    Int,
    Float,
    Numeric {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Bool,
    Str,
    Bytes,
    Uuid,
    Json,
    /// `datetime64[ns]` — naive, stored without tz conversion.
    DateTimeNaive,
    /// `datetime64[ns,UTC]` — aware, always normalized/stored as UTC.
    DateTimeUtc,
}

impl Dtype {
    /// Parse a dtype string as it appears in `Pipe.dtypes`, e.g.
    /// `"numeric[10,2]"`, `"datetime64[ns,UTC]"`, `"int"`.
    pub fn parse(s: &str) -> Result<Self, MrsmError> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("numeric") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Ok(Dtype::Numeric {
                    precision: None,
                    scale: None,
                });
            }
            let inner = rest
                .strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .ok_or_else(|| {
                    MrsmError::Configuration(format!("malformed numeric dtype: {s}"))
                })?;
            let mut parts = inner.splitn(2, ',');
            let precision = parts
                .next()
                .filter(|p| !p.is_empty())
                .map(|p| p.trim().parse::<u32>())
                .transpose()
                .map_err(|e| MrsmError::Configuration(format!("bad numeric precision: {e}")))?;
            let scale = parts
                .next()
                .filter(|p| !p.is_empty())
                .map(|p| p.trim().parse::<u32>())
                .transpose()
                .map_err(|e| MrsmError::Configuration(format!("bad numeric scale: {e}")))?;
            return Ok(Dtype::Numeric { precision, scale });
        }
        match s {
            "int" => Ok(Dtype::Int),
            "float" => Ok(Dtype::Float),
            "bool" => Ok(Dtype::Bool),
            "str" => Ok(Dtype::Str),
            "bytes" => Ok(Dtype::Bytes),
            "uuid" => Ok(Dtype::Uuid),
            "json" => Ok(Dtype::Json),
            "datetime64[ns]" => Ok(Dtype::DateTimeNaive),
            "datetime64[ns,UTC]" => Ok(Dtype::DateTimeUtc),
            other => Err(MrsmError::Configuration(format!(
                "unrecognized dtype: {other}"
            ))),
        }
    }

    /// Whether this dtype is totally ordered and can serve as a `datetime`
    /// axis (spec §3 invariant 3: a timestamp, or an int when pinned).
    pub fn is_monotonic_capable(&self) -> bool {
        matches!(
            self,
            Dtype::DateTimeNaive | Dtype::DateTimeUtc | Dtype::Int | Dtype::Float
        )
    }

    /// Widen `self` to accommodate a value observed to be `other`.
    /// Per spec §4.1: mixing int and float into an `int` column widens to
    /// `numeric`. Returns `None` if no lossless widening exists.
    pub fn widen(&self, other: &Dtype) -> Option<Dtype> {
        if self == other {
            return Some(self.clone());
        }
        use Dtype::*;
        match (self, other) {
            (Int, Float) | (Float, Int) => Some(Numeric {
                precision: None,
                scale: None,
            }),
            (Int, Numeric { .. }) | (Numeric { .. }, Int) => Some(Numeric {
                precision: None,
                scale: None,
            }),
            (Float, Numeric { .. }) | (Numeric { .. }, Float) => Some(Numeric {
                precision: None,
                scale: None,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::Int => write!(f, "int"),
            Dtype::Float => write!(f, "float"),
            Dtype::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => write!(f, "numeric[{p},{s}]"),
            Dtype::Numeric { .. } => write!(f, "numeric"),
            Dtype::Bool => write!(f, "bool"),
            Dtype::Str => write!(f, "str"),
            Dtype::Bytes => write!(f, "bytes"),
            Dtype::Uuid => write!(f, "uuid"),
            Dtype::Json => write!(f, "json"),
            Dtype::DateTimeNaive => write!(f, "datetime64[ns]"),
            Dtype::DateTimeUtc => write!(f, "datetime64[ns,UTC]"),
        }
    }
}

/// A single cell value, tagged by the variant it was coerced to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Numeric(Decimal),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    DateTimeNaive(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The dtype this value is currently tagged with, if any (`Null` has
    /// none — it's compatible with every dtype).
    pub fn dtype(&self) -> Option<Dtype> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(Dtype::Int),
            Value::Float(_) => Some(Dtype::Float),
            Value::Numeric(_) => Some(Dtype::Numeric {
                precision: None,
                scale: None,
            }),
            Value::Bool(_) => Some(Dtype::Bool),
            Value::Str(_) => Some(Dtype::Str),
            Value::Bytes(_) => Some(Dtype::Bytes),
            Value::Uuid(_) => Some(Dtype::Uuid),
            Value::Json(_) => Some(Dtype::Json),
            Value::DateTimeNaive(_) => Some(Dtype::DateTimeNaive),
            Value::DateTimeUtc(_) => Some(Dtype::DateTimeUtc),
        }
    }

    /// Base64-encode a `Bytes` value for KV backends that have no native
    /// binary column (spec §4.1: "explicit call from the caller").
    pub fn to_base64(&self) -> Option<String> {
        use base64::Engine;
        match self {
            Value::Bytes(b) => Some(base64::engine::general_purpose::STANDARD.encode(b)),
            _ => None,
        }
    }

    /// Encode as canonical JSON text — used for the `json` dtype's
    /// `TEXT`-backend fallback. Round-trips `parse -> emit` stably because
    /// `serde_json` preserves key order as inserted and mrsm always
    /// constructs `Value::Json` from already-canonical `serde_json::Value`s.
    pub fn to_json_text(&self) -> Option<String> {
        match self {
            Value::Json(v) => serde_json::to_string(v).ok(),
            _ => None,
        }
    }

    /// Map a raw, schema-less JSON value to the `Value` variant its shape
    /// naturally implies. This is a guess, not an enforcement — a pipe's
    /// declared dtypes (via [`crate::dataframe::enforce_dtypes`]) are what
    /// actually coerce a column, including converting a `Str` guess here
    /// into a `DateTimeUtc` or `Uuid` when the column calls for one.
    pub fn from_json_raw(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Str(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Value::Json(v.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_dtypes() {
        assert_eq!(Dtype::parse("int").unwrap(), Dtype::Int);
        assert_eq!(Dtype::parse("bool").unwrap(), Dtype::Bool);
        assert_eq!(Dtype::parse("uuid").unwrap(), Dtype::Uuid);
        assert_eq!(Dtype::parse("datetime64[ns]").unwrap(), Dtype::DateTimeNaive);
        assert_eq!(Dtype::parse("datetime64[ns,UTC]").unwrap(), Dtype::DateTimeUtc);
    }

    #[test]
    fn parses_numeric_with_precision_scale() {
        let d = Dtype::parse("numeric[10,2]").unwrap();
        assert_eq!(
            d,
            Dtype::Numeric {
                precision: Some(10),
                scale: Some(2)
            }
        );
    }

    #[test]
    fn parses_bare_numeric() {
        let d = Dtype::parse("numeric").unwrap();
        assert_eq!(
            d,
            Dtype::Numeric {
                precision: None,
                scale: None
            }
        );
    }

    #[test]
    fn rejects_unknown_dtype() {
        assert!(Dtype::parse("enum").is_err());
    }

    #[test]
    fn widen_int_float_to_numeric() {
        let widened = Dtype::Int.widen(&Dtype::Float).unwrap();
        assert!(matches!(widened, Dtype::Numeric { .. }));
    }

    #[test]
    fn widen_same_dtype_is_identity() {
        assert_eq!(Dtype::Int.widen(&Dtype::Int).unwrap(), Dtype::Int);
    }

    #[test]
    fn datetime_and_int_are_monotonic_capable() {
        assert!(Dtype::DateTimeUtc.is_monotonic_capable());
        assert!(Dtype::Int.is_monotonic_capable());
        assert!(!Dtype::Str.is_monotonic_capable());
    }

    #[test]
    fn display_roundtrips_numeric_precision() {
        let d = Dtype::Numeric {
            precision: Some(5),
            scale: Some(1),
        };
        assert_eq!(d.to_string(), "numeric[5,1]");
    }
}
