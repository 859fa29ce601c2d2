//! Server-published error map.
//!
//! The map lets the client handle status codes it does not hardcode: the
//! attribute set attached to each code says whether the failure is
//! retryable, auth-related, or fatal.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Attributes a server may attach to an error code. Unrecognized attribute
/// strings are preserved verbatim so newer servers degrade gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorAttribute {
    Success,
    ItemOnly,
    InvalidInput,
    FetchConfig,
    ConnStateInvalidated,
    Auth,
    SpecialHandling,
    Support,
    Temp,
    Internal,
    RetryNow,
    RetryLater,
    Subdoc,
    Dcp,
    AutoRetry,
    ItemLocked,
    ItemDeleted,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorMapEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "desc")]
    pub description: String,
    #[serde(default, rename = "attrs")]
    pub attributes: Vec<ErrorAttribute>,
}

impl ErrorMapEntry {
    /// The server asks for a retry, immediately or after a delay
    pub fn has_retry_attribute(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, ErrorAttribute::RetryNow | ErrorAttribute::RetryLater))
    }

    pub fn is_internal(&self) -> bool {
        self.attributes.contains(&ErrorAttribute::Internal)
    }

    pub fn is_auth(&self) -> bool {
        self.attributes.contains(&ErrorAttribute::Auth)
    }

    /// The connection can no longer be trusted after this code
    pub fn invalidates_connection(&self) -> bool {
        self.attributes.contains(&ErrorAttribute::ConnStateInvalidated)
    }
}

/// The full `code → {name, description, attributes}` table.
#[derive(Debug, Clone, Default)]
pub struct ErrorMap {
    pub version: u16,
    pub revision: u16,
    pub errors: HashMap<u16, ErrorMapEntry>,
}

impl ErrorMap {
    /// Parse the GET_ERROR_MAP payload. Codes arrive as hex strings.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            version: u16,
            #[serde(default)]
            revision: u16,
            #[serde(default)]
            errors: BTreeMap<String, ErrorMapEntry>,
        }
        let raw: Raw = serde_json::from_slice(payload)?;
        let errors = raw
            .errors
            .into_iter()
            .filter_map(|(code, entry)| {
                u16::from_str_radix(&code, 16).ok().map(|code| (code, entry))
            })
            .collect();
        Ok(Self { version: raw.version, revision: raw.revision, errors })
    }

    pub fn lookup(&self, code: u16) -> Option<&ErrorMapEntry> {
        self.errors.get(&code)
    }
}
