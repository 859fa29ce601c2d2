pub mod cluster;
pub mod config;
pub mod error;
pub mod http;
pub mod kv;
pub mod retry;
pub mod types;

pub use cluster::{Cluster, DiagnosticsReport, EndpointPingReport, PingReport};
pub use config::{
    ClusterOptions, ConfigError, ConnectionString, Credentials, IpProtocol, Seed,
    TimeoutProfile, TlsOptions, parse_connection_string,
};
pub use error::{
    CommonError, EnhancedErrorInfo, ErrorContext, ErrorKind, KeyValueError, NetworkError,
    OperationError, Result, StreamingJsonError,
};
pub use kv::{
    Bucket, Collection, CounterParams, CounterResult, Durability, GetResult, LookupInResult,
    LookupInSpec, MutateInParams, MutateInResult, MutateInSpec, MutationResult, RemoveParams,
    StoreParams, StoreSemantics,
};
pub use retry::{BestEffortRetryStrategy, RetryReason, controlled_backoff, exponential_backoff};
pub use types::{Cas, DocumentId, DurabilityLevel, Expiry, MutationToken, ServiceType};
