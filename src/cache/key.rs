//! Request fingerprinting.

use crate::request::RequestDescriptor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic cache key of a request: lowercase hex SHA-256, 64 chars.
///
/// Covers method, endpoint, query parameters and body. Headers are not part
/// of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const LEN: usize = 64;

    /// Fingerprint a descriptor.
    pub fn of(request: &RequestDescriptor) -> Self {
        let mut hasher = FieldHasher::new();
        hasher.field(b"method", request.method().as_str().to_uppercase().as_bytes());
        hasher.field(b"endpoint", request.endpoint().as_bytes());

        // BTreeMap iteration is already key-sorted.
        hasher.count(b"params", request.params().len());
        for (k, v) in request.params() {
            hasher.field(b"param.key", k.as_bytes());
            hasher.field(b"param.value", v.as_bytes());
        }

        match request.body() {
            Some(body) => hasher.field(b"body", &body.to_bytes()),
            None => hasher.count(b"no-body", 0),
        }

        Self(hasher.finish())
    }

    /// Wrap an already computed key (e.g. a row read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Length-delimited field encoder over SHA-256.
///
/// Every field is written as `tag_len | tag | value_len | value` so that no
/// two distinct field sequences share a digest input.
struct FieldHasher {
    inner: Sha256,
}

impl FieldHasher {
    fn new() -> Self {
        let mut inner = Sha256::new();
        inner.update(b"tool-relay/fingerprint/v1");
        Self { inner }
    }

    fn field(&mut self, tag: &[u8], value: &[u8]) {
        self.inner.update((tag.len() as u64).to_le_bytes());
        self.inner.update(tag);
        self.inner.update((value.len() as u64).to_le_bytes());
        self.inner.update(value);
    }

    fn count(&mut self, tag: &[u8], n: usize) {
        self.field(tag, &(n as u64).to_le_bytes());
    }

    fn finish(self) -> String {
        self.inner
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
