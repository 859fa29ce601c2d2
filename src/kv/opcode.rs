//! Binary protocol identifiers: magic bytes, opcodes, status codes,
//! datatype bits, HELLO features and framing-info frame ids.

use crate::error::{CommonError, ErrorKind, KeyValueError};

/// First header byte, identifying frame direction and layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    ClientRequest = 0x80,
    ClientResponse = 0x81,
    AltClientRequest = 0x08,
    AltClientResponse = 0x18,
}

impl Magic {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Magic::ClientRequest),
            0x81 => Some(Magic::ClientResponse),
            0x08 => Some(Magic::AltClientRequest),
            0x18 => Some(Magic::AltClientResponse),
            _ => None,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Magic::ClientResponse | Magic::AltClientResponse)
    }
}

/// Client opcodes used by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Upsert = 0x01,
    Insert = 0x02,
    Replace = 0x03,
    Remove = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    Observe = 0x92,
    GetAndLock = 0x94,
    Unlock = 0x95,
    GetErrorMap = 0xfe,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
    GetClusterConfig = 0xb5,
    GetCollectionsManifest = 0xba,
    GetCollectionId = 0xbb,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Upsert),
            0x02 => Some(Opcode::Insert),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Remove),
            0x05 => Some(Opcode::Increment),
            0x06 => Some(Opcode::Decrement),
            0x0a => Some(Opcode::Noop),
            0x0e => Some(Opcode::Append),
            0x0f => Some(Opcode::Prepend),
            0x1c => Some(Opcode::Touch),
            0x1d => Some(Opcode::GetAndTouch),
            0x1f => Some(Opcode::Hello),
            0x20 => Some(Opcode::SaslListMechs),
            0x21 => Some(Opcode::SaslAuth),
            0x22 => Some(Opcode::SaslStep),
            0x83 => Some(Opcode::GetReplica),
            0x89 => Some(Opcode::SelectBucket),
            0x92 => Some(Opcode::Observe),
            0x94 => Some(Opcode::GetAndLock),
            0x95 => Some(Opcode::Unlock),
            0xfe => Some(Opcode::GetErrorMap),
            0xd0 => Some(Opcode::SubdocMultiLookup),
            0xd1 => Some(Opcode::SubdocMultiMutation),
            0xb5 => Some(Opcode::GetClusterConfig),
            0xba => Some(Opcode::GetCollectionsManifest),
            0xbb => Some(Opcode::GetCollectionId),
            _ => None,
        }
    }

    /// Mutating opcodes whose values are eligible for compression
    pub fn compresses_value(self) -> bool {
        matches!(self, Opcode::Insert | Opcode::Upsert | Opcode::Replace)
    }
}

/// Datatype bit field
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;

    pub fn is_json(bits: u8) -> bool {
        bits & JSON != 0
    }

    pub fn is_snappy(bits: u8) -> bool {
        bits & SNAPPY != 0
    }
}

/// Response status codes the client hardcodes. Anything else is looked up
/// in the server's error map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0x00,
    NotFound = 0x01,
    Exists = 0x02,
    TooBig = 0x03,
    Invalid = 0x04,
    NotStored = 0x05,
    DeltaBadValue = 0x06,
    NotMyVbucket = 0x07,
    NoBucket = 0x08,
    Locked = 0x09,
    AuthStale = 0x1f,
    AuthError = 0x20,
    AuthContinue = 0x21,
    RangeError = 0x22,
    NoAccess = 0x24,
    NotInitialized = 0x25,
    RateLimitedNetworkIngress = 0x30,
    RateLimitedNetworkEgress = 0x31,
    RateLimitedMaxConnections = 0x32,
    RateLimitedMaxCommands = 0x33,
    ScopeSizeLimitExceeded = 0x34,
    UnknownFrameInfo = 0x80,
    UnknownCommand = 0x81,
    NoMemory = 0x82,
    NotSupported = 0x83,
    Internal = 0x84,
    Busy = 0x85,
    TemporaryFailure = 0x86,
    XattrInvalid = 0x87,
    UnknownCollection = 0x88,
    NoCollectionsManifest = 0x89,
    CannotApplyCollectionsManifest = 0x8a,
    CollectionsManifestIsAhead = 0x8b,
    UnknownScope = 0x8c,
    DurabilityInvalidLevel = 0xa0,
    DurabilityImpossible = 0xa1,
    SyncWriteInProgress = 0xa2,
    SyncWriteAmbiguous = 0xa3,
    SyncWriteReCommitInProgress = 0xa4,
    SubdocPathNotFound = 0xc0,
    SubdocPathMismatch = 0xc1,
    SubdocPathInvalid = 0xc2,
    SubdocPathTooBig = 0xc3,
    SubdocDocTooDeep = 0xc4,
    SubdocValueCannotInsert = 0xc5,
    SubdocDocNotJson = 0xc6,
    SubdocNumRangeError = 0xc7,
    SubdocDeltaInvalid = 0xc8,
    SubdocPathExists = 0xc9,
    SubdocValueTooDeep = 0xca,
    SubdocInvalidCombo = 0xcb,
    SubdocMultiPathFailure = 0xcc,
    SubdocSuccessDeleted = 0xcd,
    SubdocXattrInvalidFlagCombo = 0xce,
    SubdocXattrInvalidKeyCombo = 0xcf,
    SubdocXattrUnknownMacro = 0xd0,
    SubdocXattrUnknownVattr = 0xd1,
    SubdocXattrCannotModifyVattr = 0xd2,
    SubdocMultiPathFailureDeleted = 0xd3,
    SubdocInvalidXattrOrder = 0xd4,
    SubdocXattrUnknownVattrMacro = 0xd5,
    SubdocCanOnlyReviveDeletedDocuments = 0xd6,
    SubdocDeletedDocumentCannotHaveValue = 0xd7,
}

impl Status {
    pub fn from_u16(value: u16) -> Option<Self> {
        use Status::*;
        Some(match value {
            0x00 => Success,
            0x01 => NotFound,
            0x02 => Exists,
            0x03 => TooBig,
            0x04 => Invalid,
            0x05 => NotStored,
            0x06 => DeltaBadValue,
            0x07 => NotMyVbucket,
            0x08 => NoBucket,
            0x09 => Locked,
            0x1f => AuthStale,
            0x20 => AuthError,
            0x21 => AuthContinue,
            0x22 => RangeError,
            0x24 => NoAccess,
            0x25 => NotInitialized,
            0x30 => RateLimitedNetworkIngress,
            0x31 => RateLimitedNetworkEgress,
            0x32 => RateLimitedMaxConnections,
            0x33 => RateLimitedMaxCommands,
            0x34 => ScopeSizeLimitExceeded,
            0x80 => UnknownFrameInfo,
            0x81 => UnknownCommand,
            0x82 => NoMemory,
            0x83 => NotSupported,
            0x84 => Internal,
            0x85 => Busy,
            0x86 => TemporaryFailure,
            0x87 => XattrInvalid,
            0x88 => UnknownCollection,
            0x89 => NoCollectionsManifest,
            0x8a => CannotApplyCollectionsManifest,
            0x8b => CollectionsManifestIsAhead,
            0x8c => UnknownScope,
            0xa0 => DurabilityInvalidLevel,
            0xa1 => DurabilityImpossible,
            0xa2 => SyncWriteInProgress,
            0xa3 => SyncWriteAmbiguous,
            0xa4 => SyncWriteReCommitInProgress,
            0xc0 => SubdocPathNotFound,
            0xc1 => SubdocPathMismatch,
            0xc2 => SubdocPathInvalid,
            0xc3 => SubdocPathTooBig,
            0xc4 => SubdocDocTooDeep,
            0xc5 => SubdocValueCannotInsert,
            0xc6 => SubdocDocNotJson,
            0xc7 => SubdocNumRangeError,
            0xc8 => SubdocDeltaInvalid,
            0xc9 => SubdocPathExists,
            0xca => SubdocValueTooDeep,
            0xcb => SubdocInvalidCombo,
            0xcc => SubdocMultiPathFailure,
            0xcd => SubdocSuccessDeleted,
            0xce => SubdocXattrInvalidFlagCombo,
            0xcf => SubdocXattrInvalidKeyCombo,
            0xd0 => SubdocXattrUnknownMacro,
            0xd1 => SubdocXattrUnknownVattr,
            0xd2 => SubdocXattrCannotModifyVattr,
            0xd3 => SubdocMultiPathFailureDeleted,
            0xd4 => SubdocInvalidXattrOrder,
            0xd5 => SubdocXattrUnknownVattrMacro,
            0xd6 => SubdocCanOnlyReviveDeletedDocuments,
            0xd7 => SubdocDeletedDocumentCannotHaveValue,
            _ => return None,
        })
    }

    /// Statuses that still carry a parseable body for subdoc operations
    pub fn is_subdoc_success(self) -> bool {
        matches!(
            self,
            Status::Success
                | Status::SubdocMultiPathFailure
                | Status::SubdocSuccessDeleted
                | Status::SubdocMultiPathFailureDeleted
        )
    }
}

/// Features advertised in HELLO. The server's reply is the negotiated subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HelloFeature {
    Tls = 0x02,
    TcpNodelay = 0x03,
    MutationSeqno = 0x04,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Snappy = 0x0a,
    Json = 0x0b,
    Duplex = 0x0c,
    ClustermapChangeNotification = 0x0d,
    UnorderedExecution = 0x0e,
    Tracing = 0x0f,
    AltRequest = 0x10,
    SyncReplication = 0x11,
    Collections = 0x12,
    PreserveTtl = 0x14,
    VattrEnabled = 0x15,
    SubdocCreateAsDeleted = 0x17,
}

impl HelloFeature {
    pub fn from_u16(value: u16) -> Option<Self> {
        use HelloFeature::*;
        Some(match value {
            0x02 => Tls,
            0x03 => TcpNodelay,
            0x04 => MutationSeqno,
            0x06 => Xattr,
            0x07 => Xerror,
            0x08 => SelectBucket,
            0x0a => Snappy,
            0x0b => Json,
            0x0c => Duplex,
            0x0d => ClustermapChangeNotification,
            0x0e => UnorderedExecution,
            0x0f => Tracing,
            0x10 => AltRequest,
            0x11 => SyncReplication,
            0x12 => Collections,
            0x14 => PreserveTtl,
            0x15 => VattrEnabled,
            0x17 => SubdocCreateAsDeleted,
            _ => return None,
        })
    }
}

/// Request framing-info frame ids
pub mod request_frame {
    pub const DURABILITY_REQUIREMENT: u8 = 0x01;
    pub const PRESERVE_TTL: u8 = 0x05;
}

/// Response framing-info frame ids
pub mod response_frame {
    pub const SERVER_DURATION: u8 = 0x00;
}

/// Fixed mapping from a hardcoded status to the surfaced error kind.
///
/// `None` means the status is not an error for the caller (success variants)
/// or must be handled upstream before classification (NMVB, collection
/// statuses, auth-continue). Statuses absent from [`Status`] entirely are
/// evaluated against the server error map instead.
pub fn map_status(opcode: Opcode, status: Status) -> Option<ErrorKind> {
    use Status::*;
    let kind: ErrorKind = match status {
        Success | SubdocMultiPathFailure | SubdocSuccessDeleted | SubdocMultiPathFailureDeleted => {
            return None;
        }

        NotFound | NotStored => KeyValueError::DocumentNotFound.into(),
        Exists => {
            if opcode == Opcode::Insert {
                KeyValueError::DocumentExists.into()
            } else {
                CommonError::CasMismatch.into()
            }
        }
        TooBig => KeyValueError::ValueTooLarge.into(),
        Invalid | XattrInvalid | SubdocInvalidCombo | SubdocDeletedDocumentCannotHaveValue => {
            CommonError::InvalidArgument.into()
        }
        DeltaBadValue => KeyValueError::DeltaInvalid.into(),
        NoBucket => CommonError::BucketNotFound.into(),
        Locked => KeyValueError::DocumentLocked.into(),
        AuthStale | AuthError | NoAccess => CommonError::AuthenticationFailure.into(),
        NotSupported | UnknownCommand => CommonError::UnsupportedOperation.into(),
        Internal => CommonError::InternalServerFailure.into(),
        Busy | TemporaryFailure | NoMemory | NotInitialized => CommonError::TemporaryFailure.into(),
        UnknownCollection => CommonError::CollectionNotFound.into(),
        UnknownScope => CommonError::ScopeNotFound.into(),
        DurabilityInvalidLevel => KeyValueError::DurabilityLevelNotAvailable.into(),
        DurabilityImpossible => KeyValueError::DurabilityImpossible.into(),
        SyncWriteInProgress => KeyValueError::DurableWriteInProgress.into(),
        SyncWriteAmbiguous => KeyValueError::DurabilityAmbiguous.into(),
        SyncWriteReCommitInProgress => KeyValueError::DurableWriteReCommitInProgress.into(),
        SubdocPathNotFound => KeyValueError::PathNotFound.into(),
        SubdocPathMismatch => KeyValueError::PathMismatch.into(),
        SubdocPathInvalid => KeyValueError::PathInvalid.into(),
        SubdocPathTooBig => KeyValueError::PathTooBig.into(),
        SubdocDocTooDeep => KeyValueError::ValueTooDeep.into(),
        SubdocValueCannotInsert => KeyValueError::ValueInvalid.into(),
        SubdocDocNotJson => KeyValueError::DocumentNotJson.into(),
        SubdocNumRangeError => KeyValueError::NumberTooBig.into(),
        SubdocDeltaInvalid => KeyValueError::DeltaInvalid.into(),
        SubdocPathExists => KeyValueError::PathExists.into(),
        SubdocValueTooDeep => KeyValueError::ValueTooDeep.into(),
        SubdocXattrInvalidFlagCombo | SubdocXattrInvalidKeyCombo => {
            KeyValueError::XattrInvalidKeyCombo.into()
        }
        SubdocXattrUnknownMacro | SubdocXattrUnknownVattrMacro => {
            KeyValueError::XattrUnknownMacro.into()
        }
        SubdocXattrUnknownVattr => KeyValueError::XattrUnknownVirtualAttribute.into(),
        SubdocXattrCannotModifyVattr => KeyValueError::XattrCannotModifyVirtualAttribute.into(),
        SubdocCanOnlyReviveDeletedDocuments => KeyValueError::CannotReviveLivingDocument.into(),
        RateLimitedNetworkIngress | RateLimitedNetworkEgress | RateLimitedMaxConnections
        | RateLimitedMaxCommands => CommonError::RateLimited.into(),
        ScopeSizeLimitExceeded => CommonError::QuotaLimited.into(),

        SubdocInvalidXattrOrder | NotMyVbucket | AuthContinue | RangeError | UnknownFrameInfo
        | NoCollectionsManifest | CannotApplyCollectionsManifest | CollectionsManifestIsAhead => {
            crate::error::NetworkError::ProtocolError.into()
        }
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_maps_by_opcode() {
        assert_eq!(
            map_status(Opcode::Insert, Status::Exists),
            Some(ErrorKind::KeyValue(KeyValueError::DocumentExists))
        );
        assert_eq!(
            map_status(Opcode::Replace, Status::Exists),
            Some(ErrorKind::Common(CommonError::CasMismatch))
        );
    }

    #[test]
    fn not_stored_surfaces_as_document_not_found() {
        assert_eq!(
            map_status(Opcode::Append, Status::NotStored),
            Some(ErrorKind::KeyValue(KeyValueError::DocumentNotFound))
        );
    }

    #[test]
    fn success_family_is_not_an_error() {
        for status in [
            Status::Success,
            Status::SubdocMultiPathFailure,
            Status::SubdocSuccessDeleted,
            Status::SubdocMultiPathFailureDeleted,
        ] {
            assert_eq!(map_status(Opcode::SubdocMultiLookup, status), None);
        }
    }

    #[test]
    fn status_round_trips_through_u16() {
        for raw in [0x00u16, 0x07, 0x86, 0xa3, 0xc9, 0xd7] {
            let status = Status::from_u16(raw).unwrap();
            assert_eq!(status as u16, raw);
        }
        assert!(Status::from_u16(0x4242).is_none());
    }
}
