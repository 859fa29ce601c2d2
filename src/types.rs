// Mussel Key-Value Core — Shared Types
// Copyright (c) 2024-2026 Mussel Contributors
// Distributed under the MIT software license.

//! Core value types shared across the client: document identity, CAS,
//! mutation tokens, durability levels and service markers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Default scope and collection name for buckets without a namespace layout
pub const DEFAULT_NAMESPACE: &str = "_default";

/// Compare-and-swap token. 64-bit, opaque to the caller, assigned by the
/// server on every mutation. Zero means "no CAS" on requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cas(pub u64);

impl Cas {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Identity of a mutation: which partition applied it and at which sequence
/// number. Captured from the response extras before the result is delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationToken {
    pub partition_uuid: u64,
    pub sequence_number: u64,
    pub partition_id: u16,
    pub bucket_name: String,
}

/// Logical identity of a document: `(bucket, scope, collection, key)`.
///
/// Scope and collection default to `_default`. The numeric collection UID is
/// resolved against the bucket manifest at dispatch time and prefixed to the
/// key on the wire; it is never part of the logical identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub key: String,
}

impl DocumentId {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Identity in the default scope/collection
    pub fn in_default_collection(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(bucket, DEFAULT_NAMESPACE, DEFAULT_NAMESPACE, key)
    }

    pub fn is_default_collection(&self) -> bool {
        self.scope == DEFAULT_NAMESPACE && self.collection == DEFAULT_NAMESPACE
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}

/// Replication guarantee required before a mutation is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    /// On-wire level byte for the durability framing extra
    pub fn to_wire(self) -> u8 {
        match self {
            DurabilityLevel::None => 0x00,
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistToActive => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }
}

/// Services a cluster node may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    KeyValue,
    Query,
    Search,
    Analytics,
    View,
    Management,
    Eventing,
}

impl ServiceType {
    /// Short identifier used in diagnostics and ping reports
    pub fn short_name(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "n1ql",
            ServiceType::Search => "fts",
            ServiceType::Analytics => "cbas",
            ServiceType::View => "views",
            ServiceType::Management => "mgmt",
            ServiceType::Eventing => "eventing",
        }
    }
}

/// Document expiration.
///
/// Relative durations under 30 days travel as-is; anything longer is
/// rewritten to an absolute unix timestamp before encoding, because the
/// server interprets large values as absolute. Zero always means "never".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
    #[default]
    Never,
    /// Expire this many seconds from now
    Relative(u32),
    /// Expire at this unix timestamp
    Absolute(u32),
}

/// Largest relative expiry the server accepts verbatim: 30 days in seconds
pub const RELATIVE_EXPIRY_CUTOFF: u32 = 30 * 24 * 60 * 60;

impl Expiry {
    /// Wire encoding, rewriting long relative durations to absolute time
    pub fn to_wire(self, unix_now: u64) -> u32 {
        match self {
            Expiry::Never => 0,
            Expiry::Relative(secs) if secs <= RELATIVE_EXPIRY_CUTOFF => secs,
            Expiry::Relative(secs) => (unix_now as u32).saturating_add(secs),
            Expiry::Absolute(ts) => ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_zero_is_preserved() {
        assert_eq!(Expiry::Never.to_wire(1_700_000_000), 0);
        assert_eq!(Expiry::Relative(0).to_wire(1_700_000_000), 0);
    }

    #[test]
    fn short_relative_expiry_travels_verbatim() {
        assert_eq!(Expiry::Relative(120).to_wire(1_700_000_000), 120);
        assert_eq!(
            Expiry::Relative(RELATIVE_EXPIRY_CUTOFF).to_wire(1_700_000_000),
            RELATIVE_EXPIRY_CUTOFF
        );
    }

    #[test]
    fn long_relative_expiry_becomes_absolute() {
        let now = 1_700_000_000u64;
        let secs = RELATIVE_EXPIRY_CUTOFF + 1;
        assert_eq!(Expiry::Relative(secs).to_wire(now), now as u32 + secs);
    }

    #[test]
    fn cas_renders_as_hex() {
        assert_eq!(Cas(0x1122_3344_5566_7788).to_string(), "0x1122334455667788");
    }
}
