//! Error taxonomy: per-domain error kinds plus the structured context that
//! accompanies every surfaced failure.
//!
//! Domains are value-typed enums with `Display`; there is no process-wide
//! category registration. The numeric codes follow the cross-SDK error code
//! table so contexts serialize identically across clients.

use crate::retry::RetryReason;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Cross-service error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommonError {
    #[error("request_canceled")]
    RequestCanceled,
    #[error("invalid_argument")]
    InvalidArgument,
    #[error("service_not_available")]
    ServiceNotAvailable,
    #[error("internal_server_failure")]
    InternalServerFailure,
    #[error("authentication_failure")]
    AuthenticationFailure,
    #[error("temporary_failure")]
    TemporaryFailure,
    #[error("parsing_failure")]
    ParsingFailure,
    #[error("cas_mismatch")]
    CasMismatch,
    #[error("bucket_not_found")]
    BucketNotFound,
    #[error("collection_not_found")]
    CollectionNotFound,
    #[error("unsupported_operation")]
    UnsupportedOperation,
    #[error("ambiguous_timeout")]
    AmbiguousTimeout,
    #[error("unambiguous_timeout")]
    UnambiguousTimeout,
    #[error("feature_not_available")]
    FeatureNotAvailable,
    #[error("scope_not_found")]
    ScopeNotFound,
    #[error("index_not_found")]
    IndexNotFound,
    #[error("index_exists")]
    IndexExists,
    #[error("rate_limited")]
    RateLimited,
    #[error("quota_limited")]
    QuotaLimited,
}

impl CommonError {
    pub fn code(self) -> u32 {
        match self {
            CommonError::RequestCanceled => 2,
            CommonError::InvalidArgument => 3,
            CommonError::ServiceNotAvailable => 4,
            CommonError::InternalServerFailure => 5,
            CommonError::AuthenticationFailure => 6,
            CommonError::TemporaryFailure => 7,
            CommonError::ParsingFailure => 8,
            CommonError::CasMismatch => 9,
            CommonError::BucketNotFound => 10,
            CommonError::CollectionNotFound => 11,
            CommonError::UnsupportedOperation => 12,
            CommonError::AmbiguousTimeout => 13,
            CommonError::UnambiguousTimeout => 14,
            CommonError::FeatureNotAvailable => 15,
            CommonError::ScopeNotFound => 16,
            CommonError::IndexNotFound => 17,
            CommonError::IndexExists => 18,
            CommonError::RateLimited => 19,
            CommonError::QuotaLimited => 20,
        }
    }
}

/// Data-service error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyValueError {
    #[error("document_not_found")]
    DocumentNotFound,
    #[error("document_irretrievable")]
    DocumentIrretrievable,
    #[error("document_locked")]
    DocumentLocked,
    #[error("value_too_large")]
    ValueTooLarge,
    #[error("document_exists")]
    DocumentExists,
    #[error("durability_level_not_available")]
    DurabilityLevelNotAvailable,
    #[error("durability_impossible")]
    DurabilityImpossible,
    #[error("durability_ambiguous")]
    DurabilityAmbiguous,
    #[error("durable_write_in_progress")]
    DurableWriteInProgress,
    #[error("durable_write_re_commit_in_progress")]
    DurableWriteReCommitInProgress,
    #[error("path_not_found")]
    PathNotFound,
    #[error("path_mismatch")]
    PathMismatch,
    #[error("path_invalid")]
    PathInvalid,
    #[error("path_too_big")]
    PathTooBig,
    #[error("path_too_deep")]
    PathTooDeep,
    #[error("value_too_deep")]
    ValueTooDeep,
    #[error("value_invalid")]
    ValueInvalid,
    #[error("document_not_json")]
    DocumentNotJson,
    #[error("number_too_big")]
    NumberTooBig,
    #[error("delta_invalid")]
    DeltaInvalid,
    #[error("path_exists")]
    PathExists,
    #[error("xattr_unknown_macro")]
    XattrUnknownMacro,
    #[error("xattr_invalid_key_combo")]
    XattrInvalidKeyCombo,
    #[error("xattr_unknown_virtual_attribute")]
    XattrUnknownVirtualAttribute,
    #[error("xattr_cannot_modify_virtual_attribute")]
    XattrCannotModifyVirtualAttribute,
    #[error("cannot_revive_living_document")]
    CannotReviveLivingDocument,
}

impl KeyValueError {
    pub fn code(self) -> u32 {
        match self {
            KeyValueError::DocumentNotFound => 101,
            KeyValueError::DocumentIrretrievable => 102,
            KeyValueError::DocumentLocked => 103,
            KeyValueError::ValueTooLarge => 104,
            KeyValueError::DocumentExists => 105,
            KeyValueError::DurabilityLevelNotAvailable => 107,
            KeyValueError::DurabilityImpossible => 108,
            KeyValueError::DurabilityAmbiguous => 109,
            KeyValueError::DurableWriteInProgress => 110,
            KeyValueError::DurableWriteReCommitInProgress => 111,
            KeyValueError::PathNotFound => 113,
            KeyValueError::PathMismatch => 114,
            KeyValueError::PathInvalid => 115,
            KeyValueError::PathTooBig => 116,
            KeyValueError::PathTooDeep => 117,
            KeyValueError::ValueTooDeep => 118,
            KeyValueError::ValueInvalid => 119,
            KeyValueError::DocumentNotJson => 120,
            KeyValueError::NumberTooBig => 121,
            KeyValueError::DeltaInvalid => 122,
            KeyValueError::PathExists => 123,
            KeyValueError::XattrUnknownMacro => 124,
            KeyValueError::XattrInvalidKeyCombo => 125,
            KeyValueError::XattrUnknownVirtualAttribute => 126,
            KeyValueError::XattrCannotModifyVirtualAttribute => 127,
            KeyValueError::CannotReviveLivingDocument => 131,
        }
    }
}

/// Transport-level failures. A protocol violation is fatal to the session;
/// the session is torn down and reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("resolve_failure")]
    ResolveFailure,
    #[error("no_endpoints_left")]
    NoEndpointsLeft,
    #[error("handshake_failure")]
    HandshakeFailure,
    #[error("protocol_error")]
    ProtocolError,
    #[error("configuration_not_available")]
    ConfigurationNotAvailable,
    #[error("cluster_closed")]
    ClusterClosed,
}

impl NetworkError {
    pub fn code(self) -> u32 {
        match self {
            NetworkError::ResolveFailure => 1001,
            NetworkError::NoEndpointsLeft => 1002,
            NetworkError::HandshakeFailure => 1003,
            NetworkError::ProtocolError => 1005,
            NetworkError::ConfigurationNotAvailable => 1006,
            NetworkError::ClusterClosed => 1007,
        }
    }
}

/// Failure modes of the streaming JSON row lexer. These are a first-class
/// domain so a malformed tail does not corrupt rows already delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamingJsonError {
    #[error("garbage_trailing")]
    GarbageTrailing,
    #[error("bracket_mismatch")]
    BracketMismatch,
    #[error("root_is_not_an_object")]
    RootIsNotAnObject,
    #[error("escape_invalid")]
    EscapeInvalid,
    #[error("invalid_number")]
    InvalidNumber,
    #[error("value_expected")]
    ValueExpected,
    #[error("object_key_expected")]
    ObjectKeyExpected,
    #[error("trailing_comma")]
    TrailingComma,
    #[error("levels_exceeded")]
    LevelsExceeded,
    #[error("found_null_byte")]
    FoundNullByte,
}

impl StreamingJsonError {
    pub fn code(self) -> u32 {
        match self {
            StreamingJsonError::GarbageTrailing => 1101,
            StreamingJsonError::BracketMismatch => 1102,
            StreamingJsonError::RootIsNotAnObject => 1103,
            StreamingJsonError::EscapeInvalid => 1104,
            StreamingJsonError::InvalidNumber => 1105,
            StreamingJsonError::ValueExpected => 1106,
            StreamingJsonError::ObjectKeyExpected => 1107,
            StreamingJsonError::TrailingComma => 1108,
            StreamingJsonError::LevelsExceeded => 1109,
            StreamingJsonError::FoundNullByte => 1110,
        }
    }
}

/// Query service error kinds (dispatch contract only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("planning_failure")]
    PlanningFailure,
    #[error("index_failure")]
    IndexFailure,
    #[error("prepared_statement_failure")]
    PreparedStatementFailure,
}

/// Search service error kinds (dispatch contract only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("index_not_ready")]
    IndexNotReady,
    #[error("consistency_mismatch")]
    ConsistencyMismatch,
}

/// Analytics service error kinds (dispatch contract only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AnalyticsError {
    #[error("compilation_failure")]
    CompilationFailure,
    #[error("job_queue_full")]
    JobQueueFull,
    #[error("dataset_not_found")]
    DatasetNotFound,
    #[error("dataverse_not_found")]
    DataverseNotFound,
}

/// View service error kinds (dispatch contract only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error("view_not_found")]
    ViewNotFound,
    #[error("design_document_not_found")]
    DesignDocumentNotFound,
}

/// Transaction state-machine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransactionFailure {
    #[error("FAIL_OTHER")]
    Other,
    #[error("FAIL_TRANSIENT")]
    Transient,
    #[error("FAIL_DOC_NOT_FOUND")]
    DocNotFound,
    #[error("FAIL_DOC_ALREADY_EXISTS")]
    DocAlreadyExists,
    #[error("FAIL_PATH_NOT_FOUND")]
    PathNotFound,
    #[error("FAIL_PATH_ALREADY_EXISTS")]
    PathAlreadyExists,
    #[error("FAIL_WRITE_WRITE_CONFLICT")]
    WriteWriteConflict,
    #[error("FAIL_CAS_MISMATCH")]
    CasMismatch,
    #[error("FAIL_HARD")]
    Hard,
    #[error("FAIL_AMBIGUOUS")]
    Ambiguous,
    #[error("FAIL_EXPIRED")]
    Expired,
    #[error("FAIL_ATR_FULL")]
    AtrFull,
}

/// One error kind across every domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("{0}")]
    Common(#[from] CommonError),
    #[error("{0}")]
    KeyValue(#[from] KeyValueError),
    #[error("{0}")]
    Network(#[from] NetworkError),
    #[error("{0}")]
    StreamingJson(#[from] StreamingJsonError),
    #[error("{0}")]
    Query(#[from] QueryError),
    #[error("{0}")]
    Search(#[from] SearchError),
    #[error("{0}")]
    Analytics(#[from] AnalyticsError),
    #[error("{0}")]
    View(#[from] ViewError),
    #[error("{0}")]
    Transaction(#[from] TransactionFailure),
}

impl ErrorKind {
    /// Numeric code for the canonical JSON context. Domains without a
    /// cross-SDK table use a private range.
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::Common(e) => e.code(),
            ErrorKind::KeyValue(e) => e.code(),
            ErrorKind::Network(e) => e.code(),
            ErrorKind::StreamingJson(e) => e.code(),
            ErrorKind::Query(e) => 1200 + *e as u32,
            ErrorKind::Search(e) => 1300 + *e as u32,
            ErrorKind::Analytics(e) => 1400 + *e as u32,
            ErrorKind::View(e) => 1500 + *e as u32,
            ErrorKind::Transaction(e) => 1600 + *e as u32,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorKind::Common(CommonError::AmbiguousTimeout)
                | ErrorKind::Common(CommonError::UnambiguousTimeout)
        )
    }
}

/// Server-provided `{context, ref}` pair attached to enriched error
/// responses (JSON datatype bit set on a non-success status).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedErrorInfo {
    #[serde(default)]
    pub context: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
}

/// Parse the `{"error":{"context":…,"ref":…}}` body of an enriched response
pub fn parse_enhanced_error(body: &[u8]) -> Option<EnhancedErrorInfo> {
    #[derive(Deserialize)]
    struct Wrapper {
        error: EnhancedErrorInfo,
    }
    serde_json::from_slice::<Wrapper>(body).ok().map(|w| w.error)
}

/// Error-map entry that matched an unknown status code, carried for
/// diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorMapInfo {
    pub code: u16,
    pub name: String,
    pub description: String,
}

/// Structured context accompanying every surfaced failure.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation_id: String,
    pub retry_attempts: u32,
    pub retry_reasons: Vec<RetryReason>,
    pub last_dispatched_to: Option<String>,
    pub last_dispatched_from: Option<String>,
    pub status_code: Option<u16>,
    pub enhanced_error_info: Option<EnhancedErrorInfo>,
    pub error_map_info: Option<ErrorMapInfo>,
}

impl ErrorContext {
    /// Canonical JSON shape used when contexts are logged
    pub fn to_json(&self, kind: &ErrorKind) -> Value {
        let mut out = json!({
            "ec": {
                "value": kind.code(),
                "message": kind.to_string(),
            },
            "operation_id": self.operation_id,
            "retry_attempts": self.retry_attempts,
            "retry_reasons": self.retry_reasons.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        });
        let obj = out.as_object_mut().expect("object literal");
        if let Some(remote) = &self.last_dispatched_to {
            obj.insert("last_dispatched_to".into(), json!(remote));
        }
        if let Some(local) = &self.last_dispatched_from {
            obj.insert("last_dispatched_from".into(), json!(local));
        }
        if let Some(status) = self.status_code {
            obj.insert("status_code".into(), json!(status));
        }
        if let Some(info) = &self.enhanced_error_info {
            obj.insert(
                "extended_error_info".into(),
                json!({"context": info.context, "ref": info.reference}),
            );
        }
        if let Some(info) = &self.error_map_info {
            obj.insert("error_map_info".into(), serde_json::to_value(info).unwrap_or(Value::Null));
        }
        out
    }
}

/// A failed operation: the kind plus its structured context.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub ctx: Box<ErrorContext>,
}

impl OperationError {
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        Self { kind: kind.into(), ctx: Box::default() }
    }

    pub fn with_ctx(kind: impl Into<ErrorKind>, ctx: ErrorContext) -> Self {
        Self { kind: kind.into(), ctx: Box::new(ctx) }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn to_json(&self) -> Value {
        self.ctx.to_json(&self.kind)
    }
}

impl From<CommonError> for OperationError {
    fn from(e: CommonError) -> Self {
        Self::new(e)
    }
}

impl From<KeyValueError> for OperationError {
    fn from(e: KeyValueError) -> Self {
        Self::new(e)
    }
}

impl From<NetworkError> for OperationError {
    fn from(e: NetworkError) -> Self {
        Self::new(e)
    }
}

impl From<StreamingJsonError> for OperationError {
    fn from(e: StreamingJsonError) -> Self {
        Self::new(e)
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_serializes_with_reasons_in_order() {
        let ctx = ErrorContext {
            operation_id: "0x17".into(),
            retry_attempts: 2,
            retry_reasons: vec![RetryReason::KvNotMyVbucket, RetryReason::KvTemporaryFailure],
            last_dispatched_to: Some("10.0.0.5:11210".into()),
            last_dispatched_from: Some("10.0.0.1:53012".into()),
            status_code: Some(0x07),
            ..Default::default()
        };
        let v = ctx.to_json(&ErrorKind::Common(CommonError::UnambiguousTimeout));
        assert_eq!(v["ec"]["value"], 14);
        assert_eq!(v["ec"]["message"], "unambiguous_timeout");
        assert_eq!(v["retry_attempts"], 2);
        assert_eq!(v["retry_reasons"][0], "kv_not_my_vbucket");
        assert_eq!(v["retry_reasons"][1], "kv_temporary_failure");
        assert_eq!(v["status_code"], 7);
    }

    #[test]
    fn enhanced_error_parses_context_and_ref() {
        let body = br#"{"error":{"context":"Request to read document timed out","ref":"1e2a"}}"#;
        let info = parse_enhanced_error(body).unwrap();
        assert_eq!(info.context, "Request to read document timed out");
        assert_eq!(info.reference, "1e2a");
    }

    #[test]
    fn enhanced_error_rejects_garbage() {
        assert!(parse_enhanced_error(b"not json").is_none());
        assert!(parse_enhanced_error(b"{}").is_none());
    }
}
