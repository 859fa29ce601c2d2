//! Subdocument operations: spec encoding, XATTR ordering and macros.
//!
//! The server requires XATTR paths to precede document-body paths inside a
//! multi-spec request. Specs are stably reordered before encoding and each
//! remembers its caller-side index so results can be re-sorted on the way
//! out.

use super::opcode::Status;
use crate::error::{CommonError, OperationError};

/// Subdocument opcodes carried inside multi-lookup / multi-mutation values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubdocOpcode {
    Get = 0xc5,
    Exists = 0xc6,
    DictAdd = 0xc7,
    DictUpsert = 0xc8,
    Delete = 0xc9,
    Replace = 0xca,
    ArrayPushLast = 0xcb,
    ArrayPushFirst = 0xcc,
    ArrayInsert = 0xcd,
    ArrayAddUnique = 0xce,
    Counter = 0xcf,
    GetCount = 0xd2,
    GetDoc = 0x00,
    SetDoc = 0x01,
    RemoveDoc = 0x04,
    ReplaceBodyWithXattr = 0xd3,
}

/// Per-path flags
pub mod path_flag {
    pub const NONE: u8 = 0x00;
    pub const CREATE_PARENTS: u8 = 0x01;
    pub const XATTR: u8 = 0x04;
    pub const EXPAND_MACROS: u8 = 0x10;
}

/// Whole-document flags carried in the request extras
pub mod doc_flag {
    pub const NONE: u8 = 0x00;
    pub const MKDOC: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const ACCESS_DELETED: u8 = 0x04;
    pub const CREATE_AS_DELETED: u8 = 0x08;
    pub const REVIVE_DOCUMENT: u8 = 0x10;
}

/// Whether the document is created when missing, and how.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreSemantics {
    /// Update an existing document only
    #[default]
    Replace,
    /// Create or update
    Upsert,
    /// Create only; fails with `document_exists` otherwise
    Insert,
}

impl StoreSemantics {
    pub fn doc_flags(self) -> u8 {
        match self {
            StoreSemantics::Replace => doc_flag::NONE,
            StoreSemantics::Upsert => doc_flag::MKDOC,
            StoreSemantics::Insert => doc_flag::ADD,
        }
    }
}

/// One lookup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInSpec {
    pub opcode: SubdocOpcode,
    pub flags: u8,
    pub path: String,
    /// Caller-side position, restored in the result vector
    pub original_index: usize,
}

impl LookupInSpec {
    pub fn get(path: impl Into<String>) -> Self {
        Self { opcode: SubdocOpcode::Get, flags: path_flag::NONE, path: path.into(), original_index: 0 }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self { opcode: SubdocOpcode::Exists, flags: path_flag::NONE, path: path.into(), original_index: 0 }
    }

    pub fn count(path: impl Into<String>) -> Self {
        Self { opcode: SubdocOpcode::GetCount, flags: path_flag::NONE, path: path.into(), original_index: 0 }
    }

    /// Full-document get, combinable with XATTR lookups
    pub fn get_document() -> Self {
        Self { opcode: SubdocOpcode::GetDoc, flags: path_flag::NONE, path: String::new(), original_index: 0 }
    }

    pub fn xattr(mut self) -> Self {
        self.flags |= path_flag::XATTR;
        self
    }
}

/// One mutation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInSpec {
    pub opcode: SubdocOpcode,
    pub flags: u8,
    pub path: String,
    pub value: Vec<u8>,
    pub original_index: usize,
}

impl MutateInSpec {
    pub fn new(opcode: SubdocOpcode, path: impl Into<String>, value: Vec<u8>) -> Self {
        Self { opcode, flags: path_flag::NONE, path: path.into(), value, original_index: 0 }
    }

    pub fn upsert(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(SubdocOpcode::DictUpsert, path, value)
    }

    pub fn insert(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(SubdocOpcode::DictAdd, path, value)
    }

    pub fn replace(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(SubdocOpcode::Replace, path, value)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(SubdocOpcode::Delete, path, Vec::new())
    }

    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        Self::new(SubdocOpcode::Counter, path, delta.to_string().into_bytes())
    }

    pub fn xattr(mut self) -> Self {
        self.flags |= path_flag::XATTR;
        self
    }

    pub fn create_parents(mut self) -> Self {
        self.flags |= path_flag::CREATE_PARENTS;
        self
    }

    pub fn expand_macros(mut self) -> Self {
        self.flags |= path_flag::EXPAND_MACROS;
        self
    }
}

/// Number each spec with its caller-side index, then stable-sort XATTR paths
/// ahead of body paths. Stability keeps relative order within each class.
fn number_and_reorder<T>(specs: &mut [T], flags: impl Fn(&T) -> u8, set_index: impl Fn(&mut T, usize)) {
    for (i, spec) in specs.iter_mut().enumerate() {
        set_index(spec, i);
    }
    // sort_by_key is stable; false (xattr) sorts first
    specs.sort_by_key(|s| flags(s) & path_flag::XATTR == 0);
}

pub fn prepare_lookup_specs(specs: &mut [LookupInSpec]) {
    number_and_reorder(specs, |s| s.flags, |s, i| s.original_index = i);
}

pub fn prepare_mutate_specs(specs: &mut [MutateInSpec]) {
    number_and_reorder(specs, |s| s.flags, |s, i| s.original_index = i);
}

/// Serialize lookup specs: `{opcode, flags, path_len: u16, path}` each
pub fn encode_lookup_specs(specs: &[LookupInSpec]) -> Vec<u8> {
    let mut out = Vec::new();
    for spec in specs {
        out.push(spec.opcode as u8);
        out.push(spec.flags);
        out.extend_from_slice(&(spec.path.len() as u16).to_be_bytes());
        out.extend_from_slice(spec.path.as_bytes());
    }
    out
}

/// Serialize mutation specs: `{opcode, flags, path_len: u16, value_len: u32,
/// path, value}` each
pub fn encode_mutate_specs(specs: &[MutateInSpec]) -> Vec<u8> {
    let mut out = Vec::new();
    for spec in specs {
        out.push(spec.opcode as u8);
        out.push(spec.flags);
        out.extend_from_slice(&(spec.path.len() as u16).to_be_bytes());
        out.extend_from_slice(&(spec.value.len() as u32).to_be_bytes());
        out.extend_from_slice(spec.path.as_bytes());
        out.extend_from_slice(&spec.value);
    }
    out
}

/// One entry of a multi-lookup response: `{status: u16, len: u32, value}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupField {
    pub status_raw: u16,
    pub value: Vec<u8>,
}

pub fn decode_lookup_fields(body: &[u8]) -> Option<Vec<LookupField>> {
    let mut fields = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if body.len() - offset < 6 {
            return None;
        }
        let status_raw = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let len = u32::from_be_bytes([
            body[offset + 2],
            body[offset + 3],
            body[offset + 4],
            body[offset + 5],
        ]) as usize;
        offset += 6;
        if body.len() - offset < len {
            return None;
        }
        fields.push(LookupField { status_raw, value: body[offset..offset + len].to_vec() });
        offset += len;
    }
    Some(fields)
}

/// One entry of a multi-mutation response: `{index: u8, status: u16}` plus
/// `{len: u32, value}` when the path produced output (counter results)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutateField {
    pub index: u8,
    pub status_raw: u16,
    pub value: Vec<u8>,
}

pub fn decode_mutate_fields(body: &[u8]) -> Option<Vec<MutateField>> {
    let mut fields = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if body.len() - offset < 3 {
            return None;
        }
        let index = body[offset];
        let status_raw = u16::from_be_bytes([body[offset + 1], body[offset + 2]]);
        offset += 3;
        let mut value = Vec::new();
        if Status::from_u16(status_raw) == Some(Status::Success) {
            if body.len() - offset < 4 {
                return None;
            }
            let len = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]) as usize;
            offset += 4;
            if body.len() - offset < len {
                return None;
            }
            value = body[offset..offset + len].to_vec();
            offset += len;
        }
        fields.push(MutateField { index, status_raw, value });
    }
    Some(fields)
}

// =============================================================================
// MACROS
// =============================================================================

/// Virtual attributes a lookup path may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupInMacro {
    Document,
    Expiry,
    Cas,
    SeqNo,
    ValueSizeBytes,
    RevId,
    Flags,
}

impl LookupInMacro {
    pub fn path(self) -> &'static str {
        match self {
            LookupInMacro::Document => "$document",
            LookupInMacro::Expiry => "$document.exptime",
            LookupInMacro::Cas => "$document.CAS",
            LookupInMacro::SeqNo => "$document.seqno",
            LookupInMacro::ValueSizeBytes => "$document.value_bytes",
            LookupInMacro::RevId => "$document.revid",
            LookupInMacro::Flags => "$document.flags",
        }
    }

    /// Fallible boundary: unknown macro strings are a caller error, not a
    /// panic
    pub fn parse(input: &str) -> Result<Self, OperationError> {
        match input {
            "$document" => Ok(LookupInMacro::Document),
            "$document.exptime" => Ok(LookupInMacro::Expiry),
            "$document.CAS" => Ok(LookupInMacro::Cas),
            "$document.seqno" => Ok(LookupInMacro::SeqNo),
            "$document.value_bytes" => Ok(LookupInMacro::ValueSizeBytes),
            "$document.revid" => Ok(LookupInMacro::RevId),
            "$document.flags" => Ok(LookupInMacro::Flags),
            _ => Err(CommonError::InvalidArgument.into()),
        }
    }
}

/// Values the server substitutes into an expand-macros mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateInMacro {
    Cas,
    SeqNo,
    ValueCrc32c,
}

impl MutateInMacro {
    pub fn value(self) -> &'static str {
        match self {
            MutateInMacro::Cas => r#""${Mutation.CAS}""#,
            MutateInMacro::SeqNo => r#""${Mutation.seqno}""#,
            MutateInMacro::ValueCrc32c => r#""${Mutation.value_crc32c}""#,
        }
    }

    pub fn parse(input: &str) -> Result<Self, OperationError> {
        match input {
            r#""${Mutation.CAS}""# => Ok(MutateInMacro::Cas),
            r#""${Mutation.seqno}""# => Ok(MutateInMacro::SeqNo),
            r#""${Mutation.value_crc32c}""# => Ok(MutateInMacro::ValueCrc32c),
            _ => Err(CommonError::InvalidArgument.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xattr_specs_move_ahead_preserving_relative_order() {
        let mut specs = vec![
            LookupInSpec::get("name"),
            LookupInSpec::get("$document.exptime").xattr(),
            LookupInSpec::get("address.city"),
            LookupInSpec::get("$document.CAS").xattr(),
        ];
        prepare_lookup_specs(&mut specs);
        assert_eq!(specs[0].path, "$document.exptime");
        assert_eq!(specs[0].original_index, 1);
        assert_eq!(specs[1].path, "$document.CAS");
        assert_eq!(specs[1].original_index, 3);
        assert_eq!(specs[2].path, "name");
        assert_eq!(specs[2].original_index, 0);
        assert_eq!(specs[3].path, "address.city");
        assert_eq!(specs[3].original_index, 2);
    }

    #[test]
    fn lookup_specs_encode_with_path_length() {
        let specs = vec![LookupInSpec::get("ab")];
        let encoded = encode_lookup_specs(&specs);
        assert_eq!(encoded, [0xc5, 0x00, 0x00, 0x02, b'a', b'b']);
    }

    #[test]
    fn mutate_specs_encode_with_value_length() {
        let specs = vec![MutateInSpec::upsert("p", b"1".to_vec())];
        let encoded = encode_mutate_specs(&specs);
        assert_eq!(encoded, [0xc8, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'p', b'1']);
    }

    #[test]
    fn lookup_fields_round_trip() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(b"abc");
        body.extend_from_slice(&0xc0u16.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        let fields = decode_lookup_fields(&body).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].value, b"abc");
        assert_eq!(fields[1].status_raw, 0xc0);
    }

    #[test]
    fn mutate_fields_decode_value_only_on_success() {
        let mut body = Vec::new();
        body.push(2u8); // spec index
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(b"10");
        body.push(0u8);
        body.extend_from_slice(&0xc9u16.to_be_bytes());
        let fields = decode_mutate_fields(&body).unwrap();
        assert_eq!(fields[0].index, 2);
        assert_eq!(fields[0].value, b"10");
        assert_eq!(fields[1].status_raw, 0xc9);
        assert!(fields[1].value.is_empty());
    }

    #[test]
    fn truncated_bodies_are_rejected() {
        assert!(decode_lookup_fields(&[0x00]).is_none());
        assert!(decode_mutate_fields(&[0x00, 0x00]).is_none());
    }

    #[test]
    fn unknown_macros_are_invalid_argument() {
        assert!(LookupInMacro::parse("$document.exptime").is_ok());
        assert!(LookupInMacro::parse("$nonsense").is_err());
        assert!(MutateInMacro::parse(r#""${Mutation.CAS}""#).is_ok());
        assert!(MutateInMacro::parse("plain value").is_err());
    }
}
