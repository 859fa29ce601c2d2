//! Key-value client core: wire codec, sessions, routing and dispatch

pub mod dispatch;
pub mod error_map;
pub mod manager;
pub mod opcode;
pub mod ops;
pub mod partition;
pub mod sasl;
pub mod session;
pub mod subdoc;
pub mod topology;
pub mod wire;

// Re-exports
pub use dispatch::{Collection, CounterParams, MutateInParams, RemoveParams, StoreParams};
pub use error_map::{ErrorAttribute, ErrorMap, ErrorMapEntry};
pub use manager::{Bucket, Endpoint, Route};
pub use opcode::{HelloFeature, Magic, Opcode, Status, map_status};
pub use ops::{
    CounterResult, Durability, ExistsResult, GetResult, LookupInResult, MutateInResult,
    MutationResult, SubdocField,
};
pub use partition::{PartitionLocation, PartitionMap, partition_for_key};
pub use sasl::{Authenticator, Mechanism, SaslError};
pub use session::{
    ConfigHint, HandshakeError, Negotiated, Session, SessionConfig, SessionEvent, SessionState,
    build_tls_connector,
};
pub use subdoc::{LookupInMacro, LookupInSpec, MutateInMacro, MutateInSpec, StoreSemantics};
pub use topology::{
    AlternateAddress, ClusterConfig, CollectionLookup, CollectionsManifest, Node, Topology,
};
pub use wire::{FrameDecoder, RequestFrame, ResponseFrame, WireError, wire_key};
