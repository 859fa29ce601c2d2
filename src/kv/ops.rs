//! Request builders and response decoders for every data-service operation
//! the core issues, from HELLO to subdocument mutations.
//!
//! Builders produce a [`RequestFrame`] with everything except the opaque,
//! which the session assigns at send time. Decoders consume a
//! [`ResponseFrame`] whose status has already been classified.

use super::opcode::{HelloFeature, Opcode, Status};
use super::subdoc::{
    self, LookupInSpec, MutateInSpec, StoreSemantics, doc_flag,
};
use super::wire::{RequestFrame, ResponseFrame, durability_frame, preserve_ttl_frame};
use crate::error::{ErrorKind, OperationError};
use crate::types::{Cas, DurabilityLevel, MutationToken};

/// Durability requirement attached to a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Durability {
    pub level: DurabilityLevel,
    pub timeout_ms: Option<u16>,
}

impl Durability {
    pub fn is_none(&self) -> bool {
        self.level == DurabilityLevel::None
    }

    fn apply(&self, frame: &mut RequestFrame) {
        if self.level != DurabilityLevel::None {
            durability_frame(&mut frame.framing_extras, self.level.to_wire(), self.timeout_ms);
        }
    }
}

/// Mutation token from the 16-byte extras of a successful mutation
fn token_from_extras(extras: &[u8], partition: u16, bucket: &str) -> Option<MutationToken> {
    if extras.len() < 16 {
        return None;
    }
    Some(MutationToken {
        partition_uuid: u64::from_be_bytes(extras[0..8].try_into().ok()?),
        sequence_number: u64::from_be_bytes(extras[8..16].try_into().ok()?),
        partition_id: partition,
        bucket_name: bucket.to_string(),
    })
}

// =============================================================================
// RETRIEVAL
// =============================================================================

pub fn get(key: Vec<u8>) -> RequestFrame {
    RequestFrame { key, ..RequestFrame::new(Opcode::Get) }
}

pub fn get_replica(key: Vec<u8>) -> RequestFrame {
    RequestFrame { key, ..RequestFrame::new(Opcode::GetReplica) }
}

pub fn get_and_touch(key: Vec<u8>, expiry: u32) -> RequestFrame {
    RequestFrame {
        key,
        extras: expiry.to_be_bytes().to_vec(),
        ..RequestFrame::new(Opcode::GetAndTouch)
    }
}

pub fn get_and_lock(key: Vec<u8>, lock_time_secs: u32) -> RequestFrame {
    RequestFrame {
        key,
        extras: lock_time_secs.to_be_bytes().to_vec(),
        ..RequestFrame::new(Opcode::GetAndLock)
    }
}

pub fn touch(key: Vec<u8>, expiry: u32) -> RequestFrame {
    RequestFrame { key, extras: expiry.to_be_bytes().to_vec(), ..RequestFrame::new(Opcode::Touch) }
}

pub fn unlock(key: Vec<u8>, cas: Cas) -> RequestFrame {
    RequestFrame { key, cas: cas.value(), ..RequestFrame::new(Opcode::Unlock) }
}

/// Existence probe. OBSERVE carries the partition and key in the value
/// segment, not the key field.
pub fn exists(partition: u16, key: &[u8]) -> RequestFrame {
    let mut value = Vec::with_capacity(4 + key.len());
    value.extend_from_slice(&partition.to_be_bytes());
    value.extend_from_slice(&(key.len() as u16).to_be_bytes());
    value.extend_from_slice(key);
    RequestFrame { partition, value, ..RequestFrame::new(Opcode::Observe) }
}

/// A fetched document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResult {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: Cas,
    pub datatype: u8,
}

pub fn parse_get(frame: &ResponseFrame) -> GetResult {
    let flags = if frame.extras.len() >= 4 {
        u32::from_be_bytes([frame.extras[0], frame.extras[1], frame.extras[2], frame.extras[3]])
    } else {
        0
    };
    GetResult {
        value: frame.value.clone(),
        flags,
        cas: Cas(frame.cas),
        datatype: frame.datatype,
    }
}

/// Observe state of a document on its active node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExistsResult {
    pub exists: bool,
    pub deleted: bool,
    pub cas: Cas,
}

pub fn parse_exists(frame: &ResponseFrame) -> Option<ExistsResult> {
    // value: partition(2) key_len(2) key status(1) cas(8)
    let value = &frame.value;
    if value.len() < 4 {
        return None;
    }
    let key_len = u16::from_be_bytes([value[2], value[3]]) as usize;
    let status_at = 4 + key_len;
    if value.len() < status_at + 9 {
        return None;
    }
    let observe_status = value[status_at];
    let cas = u64::from_be_bytes(value[status_at + 1..status_at + 9].try_into().ok()?);
    // 0x80 = not found, 0x81 = logically deleted
    Some(ExistsResult {
        exists: observe_status < 0x80,
        deleted: observe_status == 0x81,
        cas: Cas(cas),
    })
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// Full-document store options shared by insert/upsert/replace.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub flags: u32,
    pub expiry: u32,
    pub cas: Cas,
    pub datatype: u8,
    pub durability: Durability,
    pub preserve_expiry: bool,
}

pub fn store(opcode: Opcode, key: Vec<u8>, value: Vec<u8>, opts: &StoreOptions) -> RequestFrame {
    debug_assert!(matches!(opcode, Opcode::Insert | Opcode::Upsert | Opcode::Replace));
    let mut extras = Vec::with_capacity(8);
    extras.extend_from_slice(&opts.flags.to_be_bytes());
    extras.extend_from_slice(&opts.expiry.to_be_bytes());
    let mut frame = RequestFrame {
        key,
        value,
        extras,
        cas: opts.cas.value(),
        datatype: opts.datatype,
        ..RequestFrame::new(opcode)
    };
    opts.durability.apply(&mut frame);
    if opts.preserve_expiry {
        preserve_ttl_frame(&mut frame.framing_extras);
    }
    frame
}

pub fn remove(key: Vec<u8>, cas: Cas, durability: Durability) -> RequestFrame {
    let mut frame = RequestFrame { key, cas: cas.value(), ..RequestFrame::new(Opcode::Remove) };
    durability.apply(&mut frame);
    frame
}

/// Append/prepend never create the document; a missing key surfaces as
/// `document_not_found` via the NOT_STORED status.
pub fn adjoin(
    opcode: Opcode,
    key: Vec<u8>,
    value: Vec<u8>,
    cas: Cas,
    durability: Durability,
) -> RequestFrame {
    debug_assert!(matches!(opcode, Opcode::Append | Opcode::Prepend));
    let mut frame = RequestFrame { key, value, cas: cas.value(), ..RequestFrame::new(opcode) };
    durability.apply(&mut frame);
    frame
}

/// Sentinel expiry telling the server not to create a missing counter
const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

/// Increment/decrement. Without `initial`, a missing document yields
/// NOT_FOUND instead of being created.
pub fn counter(
    opcode: Opcode,
    key: Vec<u8>,
    delta: u64,
    initial: Option<u64>,
    expiry: u32,
    durability: Durability,
) -> RequestFrame {
    debug_assert!(matches!(opcode, Opcode::Increment | Opcode::Decrement));
    let mut extras = Vec::with_capacity(20);
    extras.extend_from_slice(&delta.to_be_bytes());
    extras.extend_from_slice(&initial.unwrap_or(0).to_be_bytes());
    extras.extend_from_slice(&if initial.is_some() {
        expiry.to_be_bytes()
    } else {
        COUNTER_NO_CREATE.to_be_bytes()
    });
    let mut frame = RequestFrame { key, extras, ..RequestFrame::new(opcode) };
    durability.apply(&mut frame);
    frame
}

/// Result of any full-document mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: Cas,
    pub token: Option<MutationToken>,
}

pub fn parse_mutation(frame: &ResponseFrame, partition: u16, bucket: &str) -> MutationResult {
    MutationResult {
        cas: Cas(frame.cas),
        token: token_from_extras(&frame.extras, partition, bucket),
    }
}

/// Result of a counter operation: the post-operation value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterResult {
    pub content: u64,
    pub cas: Cas,
    pub token: Option<MutationToken>,
}

pub fn parse_counter(frame: &ResponseFrame, partition: u16, bucket: &str) -> Option<CounterResult> {
    if frame.value.len() < 8 {
        return None;
    }
    Some(CounterResult {
        content: u64::from_be_bytes(frame.value[0..8].try_into().ok()?),
        cas: Cas(frame.cas),
        token: token_from_extras(&frame.extras, partition, bucket),
    })
}

// =============================================================================
// SUBDOCUMENT
// =============================================================================

/// Multi-lookup request. Specs must already be prepared (numbered and
/// XATTR-reordered).
pub fn lookup_in(key: Vec<u8>, specs: &[LookupInSpec], access_deleted: bool) -> RequestFrame {
    let flags = if access_deleted { doc_flag::ACCESS_DELETED } else { doc_flag::NONE };
    let extras = if flags != 0 { vec![flags] } else { Vec::new() };
    RequestFrame {
        key,
        extras,
        value: subdoc::encode_lookup_specs(specs),
        ..RequestFrame::new(Opcode::SubdocMultiLookup)
    }
}

/// Multi-mutation options.
#[derive(Debug, Clone, Default)]
pub struct MutateInOptions {
    pub store_semantics: StoreSemantics,
    pub cas: Cas,
    pub expiry: u32,
    pub access_deleted: bool,
    pub create_as_deleted: bool,
    pub durability: Durability,
    pub preserve_expiry: bool,
}

pub fn mutate_in(key: Vec<u8>, specs: &[MutateInSpec], opts: &MutateInOptions) -> RequestFrame {
    let mut flags = opts.store_semantics.doc_flags();
    if opts.access_deleted {
        flags |= doc_flag::ACCESS_DELETED;
    }
    if opts.create_as_deleted {
        flags |= doc_flag::CREATE_AS_DELETED;
    }
    let mut extras = Vec::with_capacity(5);
    if opts.expiry != 0 {
        extras.extend_from_slice(&opts.expiry.to_be_bytes());
    }
    if flags != 0 {
        extras.push(flags);
    }
    let mut frame = RequestFrame {
        key,
        extras,
        cas: opts.cas.value(),
        value: subdoc::encode_mutate_specs(specs),
        ..RequestFrame::new(Opcode::SubdocMultiMutation)
    };
    opts.durability.apply(&mut frame);
    if opts.preserve_expiry {
        preserve_ttl_frame(&mut frame.framing_extras);
    }
    frame
}

/// One per-path result, restored to the caller's spec order.
#[derive(Debug, Clone, Default)]
pub struct SubdocField {
    pub original_index: usize,
    pub path: String,
    pub status_raw: u16,
    pub error: Option<ErrorKind>,
    pub exists: bool,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct LookupInResult {
    pub fields: Vec<SubdocField>,
    pub cas: Cas,
    pub deleted: bool,
}

/// Rebuild the result vector in caller order. The response entries are
/// positional against the reordered specs.
pub fn parse_lookup_in(
    frame: &ResponseFrame,
    specs: &[LookupInSpec],
) -> Result<LookupInResult, OperationError> {
    let deleted = matches!(
        frame.status(),
        Some(Status::SubdocSuccessDeleted) | Some(Status::SubdocMultiPathFailureDeleted)
    );
    let entries = subdoc::decode_lookup_fields(&frame.value)
        .ok_or_else(|| OperationError::new(crate::error::NetworkError::ProtocolError))?;

    let mut fields: Vec<SubdocField> = specs
        .iter()
        .map(|spec| SubdocField {
            original_index: spec.original_index,
            path: spec.path.clone(),
            status_raw: Status::Success as u16,
            error: None,
            exists: false,
            value: Vec::new(),
        })
        .collect();
    for (i, entry) in entries.into_iter().enumerate() {
        let Some(field) = fields.get_mut(i) else { break };
        field.status_raw = entry.status_raw;
        field.exists = matches!(
            Status::from_u16(entry.status_raw),
            Some(Status::Success) | Some(Status::SubdocSuccessDeleted)
        );
        field.error = Status::from_u16(entry.status_raw)
            .and_then(|s| super::opcode::map_status(Opcode::SubdocMultiLookup, s));
        field.value = entry.value;
    }
    fields.sort_by_key(|f| f.original_index);
    Ok(LookupInResult { fields, cas: Cas(frame.cas), deleted })
}

#[derive(Debug, Clone, Default)]
pub struct MutateInResult {
    pub fields: Vec<SubdocField>,
    pub cas: Cas,
    pub token: Option<MutationToken>,
    pub deleted: bool,
    /// Position of the failing spec on a multi-path failure, caller order
    pub first_error_index: Option<usize>,
}

pub fn parse_mutate_in(
    frame: &ResponseFrame,
    specs: &[MutateInSpec],
    partition: u16,
    bucket: &str,
) -> Result<MutateInResult, OperationError> {
    let deleted = matches!(
        frame.status(),
        Some(Status::SubdocSuccessDeleted) | Some(Status::SubdocMultiPathFailureDeleted)
    );
    let entries = subdoc::decode_mutate_fields(&frame.value)
        .ok_or_else(|| OperationError::new(crate::error::NetworkError::ProtocolError))?;

    let mut fields: Vec<SubdocField> = specs
        .iter()
        .map(|spec| SubdocField {
            original_index: spec.original_index,
            path: spec.path.clone(),
            status_raw: Status::Success as u16,
            error: None,
            exists: true,
            value: Vec::new(),
        })
        .collect();
    let mut first_error_index = None;
    for entry in entries {
        let Some(field) = fields.get_mut(entry.index as usize) else { continue };
        field.status_raw = entry.status_raw;
        if Status::from_u16(entry.status_raw) == Some(Status::Success) {
            field.value = entry.value;
        } else {
            field.error = Status::from_u16(entry.status_raw)
                .and_then(|s| super::opcode::map_status(Opcode::SubdocMultiMutation, s));
            if first_error_index.is_none() {
                first_error_index = Some(field.original_index);
            }
        }
    }
    fields.sort_by_key(|f| f.original_index);
    Ok(MutateInResult {
        fields,
        cas: Cas(frame.cas),
        token: token_from_extras(&frame.extras, partition, bucket),
        deleted,
        first_error_index,
    })
}

// =============================================================================
// BOOTSTRAP & CONTROL
// =============================================================================

/// Features every session asks for; the server answers with the subset it
/// supports.
pub const DEFAULT_FEATURES: &[HelloFeature] = &[
    HelloFeature::TcpNodelay,
    HelloFeature::MutationSeqno,
    HelloFeature::Xattr,
    HelloFeature::Xerror,
    HelloFeature::SelectBucket,
    HelloFeature::Snappy,
    HelloFeature::Json,
    HelloFeature::UnorderedExecution,
    HelloFeature::AltRequest,
    HelloFeature::SyncReplication,
    HelloFeature::Collections,
    HelloFeature::PreserveTtl,
    HelloFeature::VattrEnabled,
    HelloFeature::SubdocCreateAsDeleted,
];

pub fn hello(client_id: &str, features: &[HelloFeature]) -> RequestFrame {
    let mut value = Vec::with_capacity(features.len() * 2);
    for feature in features {
        value.extend_from_slice(&(*feature as u16).to_be_bytes());
    }
    RequestFrame {
        key: client_id.as_bytes().to_vec(),
        value,
        ..RequestFrame::new(Opcode::Hello)
    }
}

pub fn parse_hello(frame: &ResponseFrame) -> Vec<HelloFeature> {
    frame
        .value
        .chunks_exact(2)
        .filter_map(|pair| HelloFeature::from_u16(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}

pub fn sasl_list_mechs() -> RequestFrame {
    RequestFrame::new(Opcode::SaslListMechs)
}

pub fn sasl_auth(mechanism: &str, payload: Vec<u8>) -> RequestFrame {
    RequestFrame {
        key: mechanism.as_bytes().to_vec(),
        value: payload,
        ..RequestFrame::new(Opcode::SaslAuth)
    }
}

pub fn sasl_step(mechanism: &str, payload: Vec<u8>) -> RequestFrame {
    RequestFrame {
        key: mechanism.as_bytes().to_vec(),
        value: payload,
        ..RequestFrame::new(Opcode::SaslStep)
    }
}

pub fn select_bucket(bucket: &str) -> RequestFrame {
    RequestFrame { key: bucket.as_bytes().to_vec(), ..RequestFrame::new(Opcode::SelectBucket) }
}

/// Error map format version the client understands
const ERROR_MAP_VERSION: u16 = 2;

pub fn get_error_map() -> RequestFrame {
    RequestFrame {
        value: ERROR_MAP_VERSION.to_be_bytes().to_vec(),
        ..RequestFrame::new(Opcode::GetErrorMap)
    }
}

pub fn get_cluster_config() -> RequestFrame {
    RequestFrame::new(Opcode::GetClusterConfig)
}

pub fn get_collections_manifest() -> RequestFrame {
    RequestFrame::new(Opcode::GetCollectionsManifest)
}

pub fn get_collection_id(scope: &str, collection: &str) -> RequestFrame {
    RequestFrame {
        value: format!("{scope}.{collection}").into_bytes(),
        ..RequestFrame::new(Opcode::GetCollectionId)
    }
}

/// Manifest uid and collection uid from a GET_COLLECTION_ID response
pub fn parse_collection_id(frame: &ResponseFrame) -> Option<(u64, u32)> {
    if frame.extras.len() < 12 {
        return None;
    }
    let manifest_uid = u64::from_be_bytes(frame.extras[0..8].try_into().ok()?);
    let collection_id = u32::from_be_bytes(frame.extras[8..12].try_into().ok()?);
    Some((manifest_uid, collection_id))
}

pub fn noop() -> RequestFrame {
    RequestFrame::new(Opcode::Noop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DurabilityLevel;

    #[test]
    fn store_extras_carry_flags_then_expiry() {
        let frame = store(
            Opcode::Upsert,
            b"k".to_vec(),
            b"v".to_vec(),
            &StoreOptions { flags: 0x0100_0006, expiry: 60, ..Default::default() },
        );
        assert_eq!(frame.extras.len(), 8);
        assert_eq!(&frame.extras[0..4], &0x0100_0006u32.to_be_bytes());
        assert_eq!(&frame.extras[4..8], &60u32.to_be_bytes());
        assert!(frame.framing_extras.is_empty());
    }

    #[test]
    fn durable_store_gains_framing_extras() {
        let frame = store(
            Opcode::Insert,
            b"k".to_vec(),
            b"v".to_vec(),
            &StoreOptions {
                durability: Durability {
                    level: DurabilityLevel::Majority,
                    timeout_ms: Some(1_500),
                },
                ..Default::default()
            },
        );
        assert_eq!(frame.framing_extras, [0x13, 0x01, 0x05, 0xdc]);
    }

    #[test]
    fn counter_without_initial_blocks_creation() {
        let frame = counter(Opcode::Increment, b"c".to_vec(), 2, None, 0, Durability::default());
        assert_eq!(frame.extras.len(), 20);
        assert_eq!(&frame.extras[0..8], &2u64.to_be_bytes());
        assert_eq!(&frame.extras[8..16], &0u64.to_be_bytes());
        assert_eq!(&frame.extras[16..20], &0xffff_ffffu32.to_be_bytes());
    }

    #[test]
    fn counter_with_initial_carries_expiry() {
        let frame =
            counter(Opcode::Increment, b"c".to_vec(), 2, Some(10), 300, Durability::default());
        assert_eq!(&frame.extras[8..16], &10u64.to_be_bytes());
        assert_eq!(&frame.extras[16..20], &300u32.to_be_bytes());
    }

    #[test]
    fn exists_carries_key_in_value_segment() {
        let frame = exists(0x0123, b"doc");
        assert!(frame.key.is_empty());
        assert_eq!(frame.partition, 0x0123);
        assert_eq!(frame.value, [0x01, 0x23, 0x00, 0x03, b'd', b'o', b'c']);
    }

    #[test]
    fn exists_response_decodes_observe_state() {
        let mut value = vec![0x01, 0x23, 0x00, 0x03];
        value.extend_from_slice(b"doc");
        value.push(0x81);
        value.extend_from_slice(&7u64.to_be_bytes());
        let frame = ResponseFrame { value, ..Default::default() };
        let result = parse_exists(&frame).unwrap();
        assert!(!result.exists);
        assert!(result.deleted);
        assert_eq!(result.cas, Cas(7));
    }

    #[test]
    fn hello_lists_features_as_u16_pairs() {
        let frame = hello("agent/1.0", &[HelloFeature::Xerror, HelloFeature::Collections]);
        assert_eq!(frame.key, b"agent/1.0");
        assert_eq!(frame.value, [0x00, 0x07, 0x00, 0x12]);

        let reply = ResponseFrame { value: frame.value.clone(), ..Default::default() };
        assert_eq!(parse_hello(&reply), vec![HelloFeature::Xerror, HelloFeature::Collections]);
    }

    #[test]
    fn mutation_token_needs_full_extras() {
        let mut extras = Vec::new();
        extras.extend_from_slice(&0xaabbu64.to_be_bytes());
        extras.extend_from_slice(&42u64.to_be_bytes());
        let frame = ResponseFrame { extras, cas: 9, ..Default::default() };
        let result = parse_mutation(&frame, 77, "travel");
        assert_eq!(result.cas, Cas(9));
        let token = result.token.unwrap();
        assert_eq!(token.partition_uuid, 0xaabb);
        assert_eq!(token.sequence_number, 42);
        assert_eq!(token.partition_id, 77);
        assert_eq!(token.bucket_name, "travel");

        let bare = ResponseFrame { cas: 9, ..Default::default() };
        assert!(parse_mutation(&bare, 77, "travel").token.is_none());
    }

    #[test]
    fn collection_id_parses_manifest_and_uid() {
        let mut extras = Vec::new();
        extras.extend_from_slice(&3u64.to_be_bytes());
        extras.extend_from_slice(&0x9au32.to_be_bytes());
        let frame = ResponseFrame { extras, ..Default::default() };
        assert_eq!(parse_collection_id(&frame), Some((3, 0x9a)));
    }
}
