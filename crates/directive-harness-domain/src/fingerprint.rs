use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::DomainError;

/// Number of hex characters kept from the SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let well_formed = value.len() == FINGERPRINT_LEN
            && value
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
        if !well_formed {
            return Err(DomainError::InvalidFingerprint(format!(
                "expected {FINGERPRINT_LEN} lowercase hex characters, got {value:?}"
            )));
        }
        Ok(Self(value.to_string()))
    }
}

/// Rebuild a JSON value with every object's keys in sorted order.
#[must_use]
pub fn canonicalize_json(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_json).collect()),
        Value::Object(entries) => {
            let mut sorted = BTreeMap::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_json(value));
            }
            Value::Object(sorted.into_iter().collect())
        }
        scalar => scalar,
    }
}

/// Compact UTF-8 encoding of the canonical form of `value`.
#[must_use]
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    // Display on a Value is the compact encoding and cannot fail.
    canonicalize_json(value.clone()).to_string().into_bytes()
}

/// Short, stable, key-order independent identifier of a JSON payload.
#[must_use]
pub fn fingerprint(value: &Value) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(value));
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    Fingerprint(digest)
}

/// Fingerprint of a typed payload, taken over its serialized form.
///
/// # Errors
/// Returns [`DomainError::Serialization`] if the payload cannot be represented as JSON.
pub fn fingerprint_of<T: Serialize>(payload: &T) -> Result<Fingerprint, DomainError> {
    let value =
        serde_json::to_value(payload).map_err(|err| DomainError::Serialization(err.to_string()))?;
    Ok(fingerprint(&value))
}
