//! JSON encoding for `f32` payloads that may hold non-finite values.
//!
//! JSON numbers cannot express `NaN` or the infinities, and `serde_json`
//! writes them as `null`, which then fails to decode as `f32`. Fields tagged
//! `#[serde(with = "json_float")]` write finite values as plain numbers and
//! non-finite ones as the strings `"NaN"`, `"inf"` and `"-inf"`.
//!
//! The helpers are generic over nested `Vec` / `Option` shapes, so the same
//! attribute works for a scalar reward, an observation or a log-prob matrix.

use std::fmt;

use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const NAN: &str = "NaN";
const INFINITY: &str = "inf";
const NEG_INFINITY: &str = "-inf";

/// One `f32` in its lossless JSON form.
#[derive(Debug, Clone, Copy)]
pub struct JsonF32(pub f32);

impl Serialize for JsonF32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let x = self.0;
        if x.is_finite() {
            serializer.serialize_f32(x)
        } else if x.is_nan() {
            serializer.serialize_str(NAN)
        } else if x > 0.0 {
            serializer.serialize_str(INFINITY)
        } else {
            serializer.serialize_str(NEG_INFINITY)
        }
    }
}

struct JsonF32Visitor;

impl<'de> Visitor<'de> for JsonF32Visitor {
    type Value = JsonF32;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a number or one of \"NaN\", \"inf\", \"-inf\"")
    }

    fn visit_f64<E>(self, value: f64) -> Result<JsonF32, E>
    where
        E: de::Error,
    {
        Ok(JsonF32(value as f32))
    }

    fn visit_i64<E>(self, value: i64) -> Result<JsonF32, E>
    where
        E: de::Error,
    {
        Ok(JsonF32(value as f32))
    }

    fn visit_u64<E>(self, value: u64) -> Result<JsonF32, E>
    where
        E: de::Error,
    {
        Ok(JsonF32(value as f32))
    }

    fn visit_str<E>(self, value: &str) -> Result<JsonF32, E>
    where
        E: de::Error,
    {
        match value {
            NAN => Ok(JsonF32(f32::NAN)),
            INFINITY => Ok(JsonF32(f32::INFINITY)),
            NEG_INFINITY => Ok(JsonF32(f32::NEG_INFINITY)),
            other => Err(de::Error::invalid_value(de::Unexpected::Str(other), &self)),
        }
    }
}

impl<'de> Deserialize<'de> for JsonF32 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(JsonF32Visitor)
    }
}

/// A value built from `f32`s that has a lossless JSON mirror.
pub trait FloatRepr: Sized {
    type Repr: Serialize + DeserializeOwned;

    fn to_repr(&self) -> Self::Repr;
    fn from_repr(repr: Self::Repr) -> Self;
}

impl FloatRepr for f32 {
    type Repr = JsonF32;

    fn to_repr(&self) -> JsonF32 {
        JsonF32(*self)
    }

    fn from_repr(repr: JsonF32) -> Self {
        repr.0
    }
}

impl<T: FloatRepr> FloatRepr for Vec<T> {
    type Repr = Vec<T::Repr>;

    fn to_repr(&self) -> Self::Repr {
        self.iter().map(FloatRepr::to_repr).collect()
    }

    fn from_repr(repr: Self::Repr) -> Self {
        repr.into_iter().map(T::from_repr).collect()
    }
}

impl<T: FloatRepr> FloatRepr for Option<T> {
    type Repr = Option<T::Repr>;

    fn to_repr(&self) -> Self::Repr {
        self.as_ref().map(FloatRepr::to_repr)
    }

    fn from_repr(repr: Self::Repr) -> Self {
        repr.map(T::from_repr)
    }
}

pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: FloatRepr,
    S: Serializer,
{
    value.to_repr().serialize(serializer)
}

pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FloatRepr,
    D: Deserializer<'de>,
{
    T::Repr::deserialize(deserializer).map(T::from_repr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "crate::trajectory::json_float")]
        scalar: f32,
        #[serde(with = "crate::trajectory::json_float")]
        rows: Vec<Vec<f32>>,
        #[serde(default, with = "crate::trajectory::json_float")]
        maybe: Option<f32>,
    }

    #[test]
    fn test_non_finite_values_survive() {
        let sample = Sample {
            scalar: f32::NAN,
            rows: vec![vec![f32::NEG_INFINITY, -0.25], vec![f32::INFINITY, 3.0]],
            maybe: Some(f32::NEG_INFINITY),
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(!json.contains("null"));

        let back: Sample = serde_json::from_str(&json).unwrap();
        assert!(back.scalar.is_nan());
        assert_eq!(back.rows, vec![vec![f32::NEG_INFINITY, -0.25], vec![f32::INFINITY, 3.0]]);
        assert_eq!(back.maybe, Some(f32::NEG_INFINITY));
    }

    #[test]
    fn test_finite_values_stay_numbers() {
        let json = r#"{"scalar": 1, "rows": [[0.1, -2]], "maybe": null}"#;
        let back: Sample = serde_json::from_str(json).unwrap();
        assert_eq!(back.scalar, 1.0);
        assert_eq!(back.rows, vec![vec![0.1, -2.0]]);
        assert_eq!(back.maybe, None);

        let out = serde_json::to_string(&Sample { maybe: None, ..back }).unwrap();
        assert_eq!(out, r#"{"scalar":1.0,"rows":[[0.1,-2.0]],"maybe":null}"#);
    }

    #[test]
    fn test_rejects_unknown_string() {
        let err = serde_json::from_str::<Sample>(r#"{"scalar": "lots", "rows": []}"#).unwrap_err();
        assert!(err.to_string().contains("lots"));
    }
}
