#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value type requested by a binding.
///
/// `Any` is the untyped request: values are handed back exactly as the row
/// stores them and never converted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    #[default]
    Any,
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    NaN,
    NaT,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    /// The value a row hands out when it has nothing better to offer for
    /// `dtype`: zero for numeric types, `false` for booleans and a plain null
    /// for everything reference-like.
    #[must_use]
    pub fn default_for(dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::Bool(false),
            DType::Int64 => Self::Int64(0),
            DType::Float64 => Self::Float64(0.0),
            DType::Any | DType::Null | DType::Utf8 => Self::Null(NullKind::Null),
        }
    }

    #[must_use]
    pub fn missing_for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Float64 => Self::Null(NullKind::NaN),
            DType::Any | DType::Null | DType::Bool | DType::Int64 | DType::Utf8 => {
                Self::Null(NullKind::Null)
            }
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }

    /// Hashable identity of the value. Equal keys mean the values are
    /// interchangeable for de-duplication.
    #[must_use]
    pub fn key(&self) -> ScalarKey {
        match self {
            Self::Null(NullKind::NaN) => ScalarKey::FloatBits(f64::NAN.to_bits()),
            Self::Null(kind) => ScalarKey::Null(*kind),
            Self::Bool(v) => ScalarKey::Bool(*v),
            Self::Int64(v) => ScalarKey::Int64(*v),
            Self::Float64(v) => ScalarKey::FloatBits(canonical_float_bits(*v)),
            Self::Utf8(v) => ScalarKey::Utf8(v.clone()),
        }
    }
}

fn canonical_float_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0.0_f64.to_bits()
    } else {
        value.to_bits()
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null(NullKind::Null) => f.write_str("null"),
            Self::Null(NullKind::NaN) => f.write_str("NaN"),
            Self::Null(NullKind::NaT) => f.write_str("NaT"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int64(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null(NullKind::Null), Into::into)
    }
}

/// See [`Scalar::key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKey {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("cannot cast scalar of dtype {from} to {to}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("expected 0/1 for bool cast from int64 but found {value}")]
    InvalidBoolInt { value: i64 },
    #[error("expected 0.0/1.0 for bool cast from float64 but found {value}")]
    InvalidBoolFloat { value: f64 },
}

/// Converts `value` to `target` without losing information.
///
/// Missing values become the missing marker of the target type; `DType::Any`
/// accepts every value as is.
pub fn cast_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    let from = value.dtype();
    if matches!(target, DType::Any) || from == target {
        return Ok(value.clone());
    }
    if let Scalar::Null(_) = value {
        return Ok(Scalar::missing_for_dtype(target));
    }

    match target {
        DType::Any => Ok(value.clone()),
        DType::Null => Ok(Scalar::Null(NullKind::Null)),
        DType::Bool => match value {
            Scalar::Int64(v) => match *v {
                0 => Ok(Scalar::Bool(false)),
                1 => Ok(Scalar::Bool(true)),
                _ => Err(TypeError::InvalidBoolInt { value: *v }),
            },
            Scalar::Float64(v) => {
                if *v == 0.0 {
                    Ok(Scalar::Bool(false))
                } else if *v == 1.0 {
                    Ok(Scalar::Bool(true))
                } else {
                    Err(TypeError::InvalidBoolFloat { value: *v })
                }
            }
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Int64 => match value {
            Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(*v))),
            Scalar::Float64(v) => {
                if !v.is_finite() || *v != v.trunc() {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                if *v < i64::MIN as f64 || *v > i64::MAX as f64 {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                Ok(Scalar::Int64(*v as i64))
            }
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Float64 => match value {
            Scalar::Bool(v) => Ok(Scalar::Float64(if *v { 1.0 } else { 0.0 })),
            Scalar::Int64(v) => Ok(Scalar::Float64(*v as f64)),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Utf8 => match value {
            Scalar::Bool(v) => Ok(Scalar::Utf8(v.to_string())),
            Scalar::Int64(v) => Ok(Scalar::Utf8(v.to_string())),
            Scalar::Float64(v) => Ok(Scalar::Utf8(v.to_string())),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
    }
}
