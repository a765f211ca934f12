//! Tagged attribute values.
//!
//! OTLP attribute values are a dynamically-typed union. They are converted
//! once, at the edge, into [`AttributeValue`], a closed sum type that the
//! rest of the crate matches on exhaustively.
//!
//! PostgreSQL rejects NUL in `TEXT` and `JSONB`, and JSON has no number for
//! NaN or the infinities. Text is passed through [`storable_text`] and
//! doubles through [`json_f64`] so that neither can fail a batch.

use std::borrow::Cow;

use base64::Engine;
use opentelemetry_proto::tonic::common::v1::{any_value::Value as AnyValueKind, AnyValue, KeyValue};
use serde::{Deserialize, Serialize};

/// A single attribute value in its original tagged form.
///
/// Serialises externally tagged (`{"string": "checkout"}`), which is the
/// shape stored in catch-all documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(#[serde(with = "json_f64")] f64),
    Bool(bool),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Arrays, key/value lists, and anything unrecognised.
    ///
    /// Complex values are never promoted.
    Complex(serde_json::Value),
}

impl AttributeValue {
    /// The promotable value type, or `None` for complex values.
    pub const fn value_type(&self) -> Option<ValueType> {
        match self {
            Self::String(_) => Some(ValueType::String),
            Self::Int(_) => Some(ValueType::Int),
            Self::Double(_) => Some(ValueType::Double),
            Self::Bool(_) => Some(ValueType::Bool),
            Self::Bytes(_) => Some(ValueType::Bytes),
            Self::Complex(_) => None,
        }
    }

    /// Borrow the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&AnyValue> for AttributeValue {
    fn from(value: &AnyValue) -> Self {
        match &value.value {
            Some(AnyValueKind::StringValue(s)) => Self::String(storable_text(s).into_owned()),
            Some(AnyValueKind::IntValue(i)) => Self::Int(*i),
            Some(AnyValueKind::DoubleValue(d)) => Self::Double(*d),
            Some(AnyValueKind::BoolValue(b)) => Self::Bool(*b),
            Some(AnyValueKind::BytesValue(b)) => Self::Bytes(b.clone()),
            Some(AnyValueKind::ArrayValue(_) | AnyValueKind::KvlistValue(_)) | None => {
                Self::Complex(any_value_to_json(value))
            }
        }
    }
}

/// Promotable attribute value types.
///
/// Each type has its own typed attribute table per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Int,
    Double,
    Bool,
    Bytes,
}

impl ValueType {
    /// All promotable value types.
    pub const ALL: [Self; 5] = [
        Self::String,
        Self::Int,
        Self::Double,
        Self::Bool,
        Self::Bytes,
    ];

    /// Name used in table names and the key catalogue.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
        }
    }

    /// SQL column type of the typed table's `value` column.
    pub const fn sql_type(&self) -> &'static str {
        match self {
            Self::String => "TEXT",
            Self::Int => "BIGINT",
            Self::Double => "DOUBLE PRECISION",
            Self::Bool => "BOOLEAN",
            Self::Bytes => "BYTEA",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown value type '{s}'"))
    }
}

/// A key/value attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
}

impl Attribute {
    /// Create an attribute.
    pub fn new(key: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Convert OTLP key/values, skipping entries with an empty key.
///
/// A key/value with no value at all is kept as `Complex(null)`.
pub fn attributes_from_otlp(attrs: &[KeyValue]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|kv| !kv.key.is_empty())
        .map(|kv| {
            let value = kv
                .value
                .as_ref()
                .map_or(AttributeValue::Complex(serde_json::Value::Null), AttributeValue::from);
            Attribute::new(storable_text(&kv.key), value)
        })
        .collect()
}

/// Convert an AnyValue to plain JSON for complex values.
fn any_value_to_json(value: &AnyValue) -> serde_json::Value {
    match &value.value {
        Some(AnyValueKind::StringValue(s)) => serde_json::Value::String(storable_text(s).into_owned()),
        Some(AnyValueKind::IntValue(i)) => serde_json::json!(*i),
        Some(AnyValueKind::DoubleValue(d)) => json_f64::to_json(*d),
        Some(AnyValueKind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(AnyValueKind::ArrayValue(arr)) => {
            serde_json::Value::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(AnyValueKind::KvlistValue(kvlist)) => {
            let map: serde_json::Map<String, serde_json::Value> = kvlist
                .values
                .iter()
                .filter_map(|kv| {
                    kv.value
                        .as_ref()
                        .map(|v| (storable_text(&kv.key).into_owned(), any_value_to_json(v)))
                })
                .collect();
            serde_json::Value::Object(map)
        }
        Some(AnyValueKind::BytesValue(b)) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        None => serde_json::Value::Null,
    }
}

/// Replace NUL characters with U+FFFD.
///
/// Borrows when there is nothing to replace.
pub fn storable_text(value: &str) -> Cow<'_, str> {
    if value.contains('\0') {
        Cow::Owned(value.replace('\0', "\u{FFFD}"))
    } else {
        Cow::Borrowed(value)
    }
}

/// Doubles as JSON.
///
/// Finite values are numbers. NaN and the infinities are the strings
/// `"NaN"`, `"Infinity"` and `"-Infinity"`; both forms deserialise.
pub mod json_f64 {
    use std::fmt;

    use serde::de::{self, Deserializer, Visitor};
    use serde::{Serialize, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    fn non_finite_label(value: f64) -> Option<&'static str> {
        if value.is_nan() {
            Some(NAN)
        } else if value == f64::INFINITY {
            Some(INFINITY)
        } else if value == f64::NEG_INFINITY {
            Some(NEG_INFINITY)
        } else {
            None
        }
    }

    /// A double that serialises through this module.
    #[derive(Debug, Clone, Copy)]
    pub struct JsonF64(pub f64);

    impl Serialize for JsonF64 {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serialize(&self.0, serializer)
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        match non_finite_label(*value) {
            Some(label) => serializer.serialize_str(label),
            None => serializer.serialize_f64(*value),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(F64Visitor)
    }

    /// `serialize_with` for optional doubles.
    pub fn serialize_option<S: Serializer>(
        value: &Option<f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.map(JsonF64).serialize(serializer)
    }

    /// `serialize_with` for sequences of doubles.
    pub fn serialize_slice<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().copied().map(JsonF64))
    }

    /// `serialize_with` for sequences of double pairs.
    pub fn serialize_pairs<S: Serializer>(
        values: &[(f64, f64)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|(a, b)| (JsonF64(*a), JsonF64(*b))))
    }

    /// A double as a JSON value.
    pub fn to_json(value: f64) -> serde_json::Value {
        match non_finite_label(value) {
            Some(label) => serde_json::Value::String(label.to_owned()),
            None => serde_json::json!(value),
        }
    }

    struct F64Visitor;

    impl Visitor<'_> for F64Visitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"Infinity\" or \"-Infinity\"")
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<f64, E> {
            Ok(value)
        }

        #[allow(clippy::cast_precision_loss)]
        fn visit_i64<E: de::Error>(self, value: i64) -> Result<f64, E> {
            Ok(value as f64)
        }

        #[allow(clippy::cast_precision_loss)]
        fn visit_u64<E: de::Error>(self, value: u64) -> Result<f64, E> {
            Ok(value as f64)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<f64, E> {
            match value {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{any_value, ArrayValue, KeyValueList};

    fn any(value: any_value::Value) -> AnyValue {
        AnyValue { value: Some(value) }
    }

    #[test]
    fn primitives_keep_their_type() {
        let cases = [
            (any(any_value::Value::StringValue("a".into())), Some(ValueType::String)),
            (any(any_value::Value::IntValue(7)), Some(ValueType::Int)),
            (any(any_value::Value::DoubleValue(1.5)), Some(ValueType::Double)),
            (any(any_value::Value::BoolValue(true)), Some(ValueType::Bool)),
            (any(any_value::Value::BytesValue(vec![1, 2])), Some(ValueType::Bytes)),
        ];
        for (input, expected) in cases {
            assert_eq!(AttributeValue::from(&input).value_type(), expected);
        }
    }

    #[test]
    fn arrays_and_kvlists_are_complex() {
        let array = any(any_value::Value::ArrayValue(ArrayValue {
            values: vec![any(any_value::Value::IntValue(1)), any(any_value::Value::IntValue(2))],
        }));
        assert_eq!(
            AttributeValue::from(&array),
            AttributeValue::Complex(serde_json::json!([1, 2]))
        );

        let kvlist = any(any_value::Value::KvlistValue(KeyValueList {
            values: vec![KeyValue {
                key: "inner".into(),
                value: Some(any(any_value::Value::BoolValue(false))),
            }],
        }));
        assert_eq!(
            AttributeValue::from(&kvlist),
            AttributeValue::Complex(serde_json::json!({"inner": false}))
        );
    }

    #[test]
    fn missing_variant_is_complex_null() {
        let empty = AnyValue { value: None };
        let value = AttributeValue::from(&empty);
        assert_eq!(value, AttributeValue::Complex(serde_json::Value::Null));
        assert_eq!(value.value_type(), None);
    }

    #[test]
    fn empty_keys_are_skipped() {
        let attrs = vec![
            KeyValue {
                key: String::new(),
                value: Some(any(any_value::Value::IntValue(1))),
            },
            KeyValue {
                key: "present".into(),
                value: None,
            },
        ];
        let converted = attributes_from_otlp(&attrs);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].key, "present");
        assert_eq!(converted[0].value, AttributeValue::Complex(serde_json::Value::Null));
    }

    #[test]
    fn tagged_json_shape() {
        let json = serde_json::to_value(AttributeValue::Bytes(vec![0xde, 0xad])).unwrap();
        assert_eq!(json, serde_json::json!({"bytes": "3q0="}));

        let json = serde_json::to_value(AttributeValue::String("x".into())).unwrap();
        assert_eq!(json, serde_json::json!({"string": "x"}));
    }

    #[test]
    fn nul_is_replaced_in_keys_and_values() {
        let attrs = vec![KeyValue {
            key: "user\0agent".into(),
            value: Some(any(any_value::Value::StringValue("a\0b".into()))),
        }];
        let converted = attributes_from_otlp(&attrs);
        assert_eq!(converted[0].key, "user\u{FFFD}agent");
        assert_eq!(converted[0].value, AttributeValue::String("a\u{FFFD}b".into()));
    }

    #[test]
    fn nul_is_replaced_inside_complex_values() {
        let kvlist = any(any_value::Value::KvlistValue(KeyValueList {
            values: vec![KeyValue {
                key: "k\0".into(),
                value: Some(any(any_value::Value::ArrayValue(ArrayValue {
                    values: vec![any(any_value::Value::StringValue("\0".into()))],
                }))),
            }],
        }));
        let value = AttributeValue::from(&kvlist);
        assert_eq!(
            value,
            AttributeValue::Complex(serde_json::json!({"k\u{FFFD}": ["\u{FFFD}"]}))
        );
        assert!(!serde_json::to_string(&value).unwrap().contains("\\u0000"));
    }

    #[test]
    fn storable_text_borrows_clean_input() {
        assert!(matches!(storable_text("checkout"), Cow::Borrowed("checkout")));
    }

    #[test]
    fn non_finite_doubles_round_trip() {
        for (value, encoded) in [
            (f64::NAN, "NaN"),
            (f64::INFINITY, "Infinity"),
            (f64::NEG_INFINITY, "-Infinity"),
        ] {
            let json = serde_json::to_value(AttributeValue::Double(value)).unwrap();
            assert_eq!(json, serde_json::json!({ "double": encoded }));

            let back: AttributeValue = serde_json::from_value(json).unwrap();
            let AttributeValue::Double(decoded) = back else {
                panic!("expected a double, got {back:?}");
            };
            assert_eq!(decoded.is_nan(), value.is_nan());
            if !value.is_nan() {
                assert_eq!(decoded, value);
            }
        }

        let json = serde_json::to_value(AttributeValue::Double(2.5)).unwrap();
        assert_eq!(json, serde_json::json!({"double": 2.5}));
        let integral: AttributeValue = serde_json::from_value(serde_json::json!({"double": 3})).unwrap();
        assert_eq!(integral, AttributeValue::Double(3.0));
    }

    #[test]
    fn non_finite_doubles_inside_complex_values() {
        let array = any(any_value::Value::ArrayValue(ArrayValue {
            values: vec![
                any(any_value::Value::DoubleValue(f64::NAN)),
                any(any_value::Value::DoubleValue(0.5)),
            ],
        }));
        assert_eq!(
            AttributeValue::from(&array),
            AttributeValue::Complex(serde_json::json!(["NaN", 0.5]))
        );
    }

    #[test]
    fn unknown_double_label_is_rejected() {
        let err = serde_json::from_value::<AttributeValue>(serde_json::json!({"double": "nan"}));
        assert!(err.is_err());
    }

    #[test]
    fn value_type_parses() {
        assert_eq!("double".parse::<ValueType>(), Ok(ValueType::Double));
        assert!("complex".parse::<ValueType>().is_err());
    }
}
