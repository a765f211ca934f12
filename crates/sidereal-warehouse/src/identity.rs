//! Stable identity hashing for dimension rows.
//!
//! Each hash is SHA-256 over a canonical byte encoding. Attribute sets are
//! sorted by key and every value is normalised, so two logically identical
//! sets hash identically regardless of key order. Fields are separated by
//! a NUL delimiter so adjacent fields cannot run into each other.
//!
//! Collisions are assumed negligible at this width and are not guarded.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::value::{Attribute, AttributeValue};

const DELIMITER: &[u8] = b"\x00";

/// Bits of a canonical quiet NaN, used for every NaN input.
const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

/// A 256-bit identity digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHash([u8; 32]);

impl IdentityHash {
    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a lowercase or uppercase hex digest.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, as stored in the database.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash({})", &self.to_hex()[..16])
    }
}

/// Incremental builder for identity hashes.
#[derive(Clone, Default)]
pub struct IdentityHasher {
    inner: Sha256,
}

impl IdentityHasher {
    /// Start a new hash.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string field.
    pub fn str(&mut self, value: &str) -> &mut Self {
        self.inner.update(value.as_bytes());
        self.inner.update(DELIMITER);
        self
    }

    /// Add an optional string field; `None` and `Some("")` differ.
    pub fn opt_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => {
                self.inner.update([1u8]);
                self.str(v)
            }
            None => {
                self.inner.update([0u8]);
                self.inner.update(DELIMITER);
                self
            }
        }
    }

    /// Add a boolean field.
    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.inner.update([u8::from(value)]);
        self.inner.update(DELIMITER);
        self
    }

    /// Add an integer field.
    pub fn int(&mut self, value: i64) -> &mut Self {
        self.inner.update(value.to_be_bytes());
        self.inner.update(DELIMITER);
        self
    }

    /// Add a whole attribute set in canonical order.
    ///
    /// Duplicate keys keep their last occurrence.
    pub fn attributes(&mut self, attrs: &[Attribute]) -> &mut Self {
        let sorted: BTreeMap<&str, &AttributeValue> = attrs
            .iter()
            .map(|a| (a.key.as_str(), &a.value))
            .collect();

        self.int(i64::try_from(sorted.len()).unwrap_or(i64::MAX));
        for (key, value) in sorted {
            self.str(key);
            self.value(value);
        }
        self
    }

    fn value(&mut self, value: &AttributeValue) {
        match value {
            AttributeValue::String(s) => {
                self.inner.update(b"s");
                self.str(s);
            }
            AttributeValue::Int(i) => {
                self.inner.update(b"i");
                self.int(*i);
            }
            AttributeValue::Double(d) => {
                self.inner.update(b"d");
                self.inner.update(canonical_f64_bits(*d).to_be_bytes());
                self.inner.update(DELIMITER);
            }
            AttributeValue::Bool(b) => {
                self.inner.update(b"b");
                self.bool(*b);
            }
            AttributeValue::Bytes(bytes) => {
                self.inner.update(b"x");
                self.int(i64::try_from(bytes.len()).unwrap_or(i64::MAX));
                self.inner.update(bytes);
                self.inner.update(DELIMITER);
            }
            AttributeValue::Complex(json) => {
                // serde_json maps are ordered by key, so this is canonical.
                self.inner.update(b"c");
                self.str(&json.to_string());
            }
        }
    }

    /// Finish and return the digest.
    #[must_use]
    pub fn finish(&self) -> IdentityHash {
        IdentityHash(self.inner.clone().finalize().into())
    }
}

fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        CANONICAL_NAN
    } else if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

/// Hash a resource: its full attribute set plus schema URL.
pub fn resource_hash(attrs: &[Attribute], schema_url: Option<&str>) -> IdentityHash {
    IdentityHasher::new()
        .str("resource")
        .attributes(attrs)
        .opt_str(schema_url)
        .finish()
}

/// Hash an instrumentation scope.
pub fn scope_hash(
    name: &str,
    version: Option<&str>,
    attrs: &[Attribute],
    schema_url: Option<&str>,
) -> IdentityHash {
    IdentityHasher::new()
        .str("scope")
        .str(name)
        .opt_str(version)
        .attributes(attrs)
        .opt_str(schema_url)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(key: &str, value: AttributeValue) -> Attribute {
        Attribute::new(key, value)
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = vec![
            attr("service.name", AttributeValue::String("checkout".into())),
            attr("region", AttributeValue::String("us-east".into())),
        ];
        let b = vec![a[1].clone(), a[0].clone()];
        assert_eq!(resource_hash(&a, None), resource_hash(&b, None));
    }

    #[test]
    fn value_type_changes_hash() {
        let s = vec![attr("port", AttributeValue::String("80".into()))];
        let i = vec![attr("port", AttributeValue::Int(80))];
        assert_ne!(resource_hash(&s, None), resource_hash(&i, None));
    }

    #[test]
    fn schema_url_changes_hash() {
        let attrs = vec![attr("a", AttributeValue::Bool(true))];
        assert_ne!(
            resource_hash(&attrs, None),
            resource_hash(&attrs, Some("https://opentelemetry.io/schemas/1.24.0"))
        );
        assert_ne!(resource_hash(&attrs, None), resource_hash(&attrs, Some("")));
    }

    #[test]
    fn negative_zero_and_nan_are_normalised() {
        let pos = vec![attr("v", AttributeValue::Double(0.0))];
        let neg = vec![attr("v", AttributeValue::Double(-0.0))];
        assert_eq!(resource_hash(&pos, None), resource_hash(&neg, None));

        let nan_a = vec![attr("v", AttributeValue::Double(f64::NAN))];
        let nan_b = vec![attr("v", AttributeValue::Double(-f64::NAN))];
        assert_eq!(resource_hash(&nan_a, None), resource_hash(&nan_b, None));
    }

    #[test]
    fn duplicate_keys_keep_last() {
        let dup = vec![
            attr("k", AttributeValue::Int(1)),
            attr("k", AttributeValue::Int(2)),
        ];
        let single = vec![attr("k", AttributeValue::Int(2))];
        assert_eq!(resource_hash(&dup, None), resource_hash(&single, None));
    }

    #[test]
    fn delimiters_prevent_field_bleed() {
        let a = scope_hash("ab", Some("c"), &[], None);
        let b = scope_hash("a", Some("bc"), &[], None);
        assert_ne!(a, b);
    }

    #[test]
    fn hex_roundtrip() {
        let hash = resource_hash(&[], None);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(IdentityHash::from_hex(&hex), Some(hash));
        assert_eq!(IdentityHash::from_hex("abc"), None);
    }
}
