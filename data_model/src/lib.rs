mod error;

use std::{
    fmt::{self, Display},
    str::FromStr,
};

pub use error::{BlobError, BlobResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use strum::AsRefStr;

pub const BLOB_ID_LEN: usize = 32;

/// Content hash identifying a blob. Equality is by hash value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId([u8; BLOB_ID_LEN]);

impl BlobId {
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; BLOB_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BLOB_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.to_hex())
    }
}

impl FromStr for BlobId {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; BLOB_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| BlobError::invalid_input(format!("invalid blob id {:?}: {}", s, e)))?;
        Ok(Self(bytes))
    }
}

impl Serialize for BlobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn validate_identifier(kind: &str, value: &str) -> BlobResult<()> {
    if value.is_empty() {
        return Err(BlobError::invalid_input(format!("{} must not be empty", kind)));
    }
    if value.chars().all(|c| c == '.') {
        return Err(BlobError::invalid_input(format!(
            "{} {:?} must not consist only of dots",
            kind, value
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(BlobError::invalid_input(format!(
            "{} {:?} contains invalid character {:?}",
            kind, value, c
        )));
    }
    Ok(())
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> BlobResult<Self> {
                let value = value.into();
                validate_identifier($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = BlobError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = BlobError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

identifier!(
    /// Tenant partition of the blob keyspace.
    NamespaceId,
    "namespace"
);
identifier!(
    /// Bucket of named references in the reference store.
    BucketId,
    "bucket"
);
identifier!(
    /// Key of a named reference inside a bucket.
    RefId,
    "ref"
);

/// A tracked pointer to a blob, used to decide GC eligibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobReference {
    /// Named pointer from the reference store.
    Ref { bucket: BucketId, key: RefId },
    /// Blob-to-blob pointer, e.g. a chunk of a compressed object.
    Blob { blob: BlobId },
}

impl BlobReference {
    /// Stable string form, unique per reference. Used as a storage key
    /// suffix by the persistent index.
    pub fn key(&self) -> String {
        match self {
            BlobReference::Ref { bucket, key } => format!("ref:{}:{}", bucket, key),
            BlobReference::Blob { blob } => format!("blob:{}", blob),
        }
    }
}

/// Storage policy of a namespace. Loaded externally and read-only at request
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    #[serde(default)]
    pub storage_pool: String,
    #[serde(default = "default_true")]
    pub use_content_addressed_storage: bool,
    #[serde(default)]
    pub allow_redirect_uris: bool,
    #[serde(default)]
    pub use_blob_index_for_exists: bool,
    #[serde(default)]
    pub on_demand_replication: bool,
    #[serde(default)]
    pub fallback_namespace: Option<NamespaceId>,
    #[serde(default)]
    pub populate_fallback_namespace_on_upload: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NamespacePolicy {
    fn default() -> Self {
        Self {
            storage_pool: String::new(),
            use_content_addressed_storage: true,
            allow_redirect_uris: false,
            use_blob_index_for_exists: false,
            on_demand_replication: false,
            fallback_namespace: None,
            populate_fallback_namespace_on_upload: false,
        }
    }
}

/// Whether a read updates the backend's last-access bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, strum::Display)]
pub enum LastAccessTracking {
    Track,
    Skip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_id_hex_roundtrip() {
        let id = BlobId::from_content(b"hello world");
        assert_eq!(
            id.to_string(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let parsed: BlobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_blob_id_rejects_bad_hex() {
        assert!("abc".parse::<BlobId>().is_err());
        assert!("zz".repeat(32).parse::<BlobId>().is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(NamespaceId::new("game.ddc-test_1").is_ok());
        assert!(NamespaceId::new("").is_err());
        assert!(NamespaceId::new("a/b").is_err());
        assert!(BucketId::new("bucket with space").is_err());
    }

    #[test]
    fn test_identifier_rejects_dot_segments() {
        assert!(NamespaceId::new(".").is_err());
        assert!(NamespaceId::new("..").is_err());
        assert!(RefId::new("...").is_err());
        assert!(NamespaceId::new(".hidden").is_ok());
        assert!(NamespaceId::new("v1.0").is_ok());
    }

    #[test]
    fn test_policy_defaults_from_json() {
        let policy: NamespacePolicy = serde_json::from_str(r#"{"fallback_namespace": "base"}"#).unwrap();
        assert!(policy.use_content_addressed_storage);
        assert!(!policy.on_demand_replication);
        assert_eq!(policy.fallback_namespace, Some(NamespaceId::new("base").unwrap()));
    }

    #[test]
    fn test_reference_serialization() {
        let reference = BlobReference::Ref {
            bucket: BucketId::new("bucket").unwrap(),
            key: RefId::new("key").unwrap(),
        };
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, r#"{"type":"ref","bucket":"bucket","key":"key"}"#);
        assert_eq!(reference.key(), "ref:bucket:key");
    }
}
