//! Operation dispatch: resolve the collection, route the key, send on a
//! session, classify the outcome and consult the retry orchestrator.
//!
//! The loop re-resolves route and session on every attempt because the map
//! may have changed while the request was backing off.

use super::error_map::ErrorMap;
use super::manager::{Bucket, Endpoint, Route};
use super::opcode::{HelloFeature, Opcode, Status, datatype, map_status};
use super::ops::{
    self, CounterResult, Durability, ExistsResult, GetResult, LookupInResult, MutateInOptions,
    MutateInResult, MutationResult, StoreOptions,
};
use super::session::SessionSendError;
use super::subdoc::{self, LookupInSpec, MutateInSpec, StoreSemantics};
use super::topology::CollectionLookup;
use super::wire::{RequestFrame, ResponseFrame, wire_key};
use crate::error::{
    CommonError, ErrorContext, ErrorKind, ErrorMapInfo, KeyValueError, OperationError,
    parse_enhanced_error,
};
use crate::retry::{BestEffortRetryStrategy, RetryDecision, RetryReason, RetryState, orchestrate};
use crate::types::{Cas, DocumentId, Expiry, now};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::debug;

/// Process-wide operation id counter for error contexts
static OPERATION_SEQ: AtomicU32 = AtomicU32::new(1);

fn next_operation_id() -> String {
    format!("0x{:x}", OPERATION_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Parameters shared by the full-document store operations.
#[derive(Debug, Clone, Default)]
pub struct StoreParams {
    pub flags: u32,
    pub expiry: Expiry,
    pub cas: Cas,
    pub durability: Durability,
    pub preserve_expiry: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveParams {
    pub cas: Cas,
    pub durability: Durability,
}

#[derive(Debug, Clone, Default)]
pub struct CounterParams {
    pub delta: u64,
    pub initial: Option<u64>,
    pub expiry: Expiry,
    pub durability: Durability,
}

#[derive(Debug, Clone, Default)]
pub struct MutateInParams {
    pub store_semantics: StoreSemantics,
    pub cas: Cas,
    pub expiry: Expiry,
    pub access_deleted: bool,
    pub create_as_deleted: bool,
    pub durability: Durability,
    pub preserve_expiry: bool,
}

/// A scope/collection handle over one bucket; the entry point for every
/// data operation.
#[derive(Clone)]
pub struct Collection {
    bucket: Bucket,
    scope: String,
    collection: String,
    strategy: Arc<BestEffortRetryStrategy>,
    kv_timeout: std::time::Duration,
    kv_durable_timeout: std::time::Duration,
}

impl Collection {
    pub(crate) fn new(
        bucket: Bucket,
        scope: String,
        collection: String,
        strategy: Arc<BestEffortRetryStrategy>,
        kv_timeout: std::time::Duration,
        kv_durable_timeout: std::time::Duration,
    ) -> Self {
        Self { bucket, scope, collection, strategy, kv_timeout, kv_durable_timeout }
    }

    pub fn document_id(&self, key: &str) -> DocumentId {
        DocumentId::new(self.bucket.name(), &self.scope, &self.collection, key)
    }

    // -------------------------------------------------------------------------
    // RETRIEVAL
    // -------------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> Result<GetResult, OperationError> {
        let (reply, _) = self
            .execute(key, true, false, |wk, _| ops::get(wk))
            .await?;
        Ok(ops::parse_get(&reply))
    }

    pub async fn get_and_touch(&self, key: &str, expiry: Expiry) -> Result<GetResult, OperationError> {
        let wire_expiry = expiry.to_wire(now());
        let (reply, _) = self
            .execute(key, false, false, move |wk, _| ops::get_and_touch(wk, wire_expiry))
            .await?;
        Ok(ops::parse_get(&reply))
    }

    pub async fn get_and_lock(&self, key: &str, lock_time_secs: u32) -> Result<GetResult, OperationError> {
        let (reply, _) = self
            .execute(key, false, false, move |wk, _| ops::get_and_lock(wk, lock_time_secs))
            .await?;
        Ok(ops::parse_get(&reply))
    }

    pub async fn unlock(&self, key: &str, cas: Cas) -> Result<(), OperationError> {
        self.execute(key, false, false, move |wk, _| ops::unlock(wk, cas)).await?;
        Ok(())
    }

    pub async fn touch(&self, key: &str, expiry: Expiry) -> Result<Cas, OperationError> {
        let wire_expiry = expiry.to_wire(now());
        let (reply, _) = self
            .execute(key, false, false, move |wk, _| ops::touch(wk, wire_expiry))
            .await?;
        Ok(Cas(reply.cas))
    }

    pub async fn exists(&self, key: &str) -> Result<ExistsResult, OperationError> {
        let (reply, _) = self
            .execute(key, true, false, |wk, route| ops::exists(route.partition_id, &wk))
            .await?;
        ops::parse_exists(&reply)
            .ok_or_else(|| OperationError::new(crate::error::NetworkError::ProtocolError))
    }

    /// Document plus its expiration time, read through the subdocument path
    /// with the `$document.exptime` virtual attribute.
    pub async fn get_with_expiry(
        &self,
        key: &str,
    ) -> Result<(GetResult, Option<u32>), OperationError> {
        let specs = vec![
            LookupInSpec::get(super::subdoc::LookupInMacro::Expiry.path()).xattr(),
            LookupInSpec::get_document(),
        ];
        let result = self.lookup_in(key, specs, false).await?;
        if let Some(error) = result.fields.iter().find_map(|f| f.error) {
            return Err(OperationError::new(error));
        }
        let expiry = std::str::from_utf8(&result.fields[0].value)
            .ok()
            .and_then(|s| s.parse().ok());
        Ok((
            GetResult {
                value: result.fields[1].value.clone(),
                flags: 0,
                cas: result.cas,
                datatype: 0,
            },
            expiry,
        ))
    }

    /// Fan out an active get plus one replica get per replica; the first
    /// success wins and the rest are discarded.
    pub async fn get_any_replica(&self, key: &str) -> Result<GetResult, OperationError> {
        let replies = self.replica_fan_out(key, true).await?;
        replies
            .into_iter()
            .next()
            .ok_or_else(|| OperationError::new(KeyValueError::DocumentIrretrievable))
    }

    /// Same fan-out, collecting every successful response.
    pub async fn get_all_replicas(&self, key: &str) -> Result<Vec<GetResult>, OperationError> {
        let replies = self.replica_fan_out(key, false).await?;
        if replies.is_empty() {
            return Err(OperationError::new(KeyValueError::DocumentIrretrievable));
        }
        Ok(replies)
    }

    // -------------------------------------------------------------------------
    // MUTATIONS
    // -------------------------------------------------------------------------

    pub async fn upsert(
        &self,
        key: &str,
        value: Vec<u8>,
        params: StoreParams,
    ) -> Result<MutationResult, OperationError> {
        self.store(Opcode::Upsert, key, value, params).await
    }

    pub async fn insert(
        &self,
        key: &str,
        value: Vec<u8>,
        params: StoreParams,
    ) -> Result<MutationResult, OperationError> {
        self.store(Opcode::Insert, key, value, params).await
    }

    pub async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        params: StoreParams,
    ) -> Result<MutationResult, OperationError> {
        self.store(Opcode::Replace, key, value, params).await
    }

    async fn store(
        &self,
        opcode: Opcode,
        key: &str,
        value: Vec<u8>,
        params: StoreParams,
    ) -> Result<MutationResult, OperationError> {
        if opcode == Opcode::Insert && !params.cas.is_zero() {
            return Err(OperationError::new(CommonError::InvalidArgument));
        }
        let opts = StoreOptions {
            flags: params.flags,
            expiry: params.expiry.to_wire(now()),
            cas: params.cas,
            datatype: datatype::RAW,
            durability: params.durability,
            preserve_expiry: params.preserve_expiry,
        };
        let durable = !params.durability.is_none();
        let (reply, route) = self
            .execute(key, false, durable, move |wk, _| {
                ops::store(opcode, wk, value.clone(), &opts)
            })
            .await?;
        Ok(ops::parse_mutation(&reply, route.partition_id, self.bucket.name()))
    }

    pub async fn remove(
        &self,
        key: &str,
        params: RemoveParams,
    ) -> Result<MutationResult, OperationError> {
        let durable = !params.durability.is_none();
        let (reply, route) = self
            .execute(key, false, durable, move |wk, _| {
                ops::remove(wk, params.cas, params.durability)
            })
            .await?;
        Ok(ops::parse_mutation(&reply, route.partition_id, self.bucket.name()))
    }

    pub async fn append(
        &self,
        key: &str,
        value: Vec<u8>,
        params: RemoveParams,
    ) -> Result<MutationResult, OperationError> {
        self.adjoin(Opcode::Append, key, value, params).await
    }

    pub async fn prepend(
        &self,
        key: &str,
        value: Vec<u8>,
        params: RemoveParams,
    ) -> Result<MutationResult, OperationError> {
        self.adjoin(Opcode::Prepend, key, value, params).await
    }

    async fn adjoin(
        &self,
        opcode: Opcode,
        key: &str,
        value: Vec<u8>,
        params: RemoveParams,
    ) -> Result<MutationResult, OperationError> {
        let durable = !params.durability.is_none();
        let (reply, route) = self
            .execute(key, false, durable, move |wk, _| {
                ops::adjoin(opcode, wk, value.clone(), params.cas, params.durability)
            })
            .await?;
        Ok(ops::parse_mutation(&reply, route.partition_id, self.bucket.name()))
    }

    pub async fn increment(
        &self,
        key: &str,
        params: CounterParams,
    ) -> Result<CounterResult, OperationError> {
        self.counter(Opcode::Increment, key, params).await
    }

    pub async fn decrement(
        &self,
        key: &str,
        params: CounterParams,
    ) -> Result<CounterResult, OperationError> {
        self.counter(Opcode::Decrement, key, params).await
    }

    async fn counter(
        &self,
        opcode: Opcode,
        key: &str,
        params: CounterParams,
    ) -> Result<CounterResult, OperationError> {
        let wire_expiry = params.expiry.to_wire(now());
        let durable = !params.durability.is_none();
        let (reply, route) = self
            .execute(key, false, durable, move |wk, _| {
                ops::counter(opcode, wk, params.delta, params.initial, wire_expiry, params.durability)
            })
            .await?;
        ops::parse_counter(&reply, route.partition_id, self.bucket.name())
            .ok_or_else(|| OperationError::new(crate::error::NetworkError::ProtocolError))
    }

    // -------------------------------------------------------------------------
    // SUBDOCUMENT
    // -------------------------------------------------------------------------

    pub async fn lookup_in(
        &self,
        key: &str,
        mut specs: Vec<LookupInSpec>,
        access_deleted: bool,
    ) -> Result<LookupInResult, OperationError> {
        if specs.is_empty() || specs.len() > 16 {
            return Err(OperationError::new(CommonError::InvalidArgument));
        }
        subdoc::prepare_lookup_specs(&mut specs);
        let specs = Arc::new(specs);
        let build_specs = Arc::clone(&specs);
        let (reply, _) = self
            .execute(key, true, false, move |wk, _| {
                ops::lookup_in(wk, &build_specs, access_deleted)
            })
            .await?;
        ops::parse_lookup_in(&reply, &specs)
    }

    pub async fn mutate_in(
        &self,
        key: &str,
        mut specs: Vec<MutateInSpec>,
        params: MutateInParams,
    ) -> Result<MutateInResult, OperationError> {
        if specs.is_empty() || specs.len() > 16 {
            return Err(OperationError::new(CommonError::InvalidArgument));
        }
        // the server cannot match a CAS on a document that must not exist
        if params.store_semantics == StoreSemantics::Insert && !params.cas.is_zero() {
            return Err(OperationError::new(CommonError::InvalidArgument));
        }
        subdoc::prepare_mutate_specs(&mut specs);
        let specs = Arc::new(specs);
        let build_specs = Arc::clone(&specs);
        let opts = MutateInOptions {
            store_semantics: params.store_semantics,
            cas: params.cas,
            expiry: params.expiry.to_wire(now()),
            access_deleted: params.access_deleted,
            create_as_deleted: params.create_as_deleted,
            durability: params.durability,
            preserve_expiry: params.preserve_expiry,
        };
        let durable = !params.durability.is_none();
        let result = self
            .execute(key, false, durable, move |wk, _| {
                ops::mutate_in(wk, &build_specs, &opts)
            })
            .await;
        match result {
            Ok((reply, route)) => {
                ops::parse_mutate_in(&reply, &specs, route.partition_id, self.bucket.name())
            }
            Err(mut e) => {
                // an insert that lost to an existing document is not a CAS race
                if params.store_semantics == StoreSemantics::Insert
                    && e.kind() == ErrorKind::Common(CommonError::CasMismatch)
                {
                    e.kind = KeyValueError::DocumentExists.into();
                }
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // DISPATCH CORE
    // -------------------------------------------------------------------------

    /// The per-operation loop from §"route, send, classify, retry".
    /// `build` runs once per attempt: the wire key (collection prefix) and
    /// route may differ between attempts.
    async fn execute(
        &self,
        key: &str,
        idempotent: bool,
        durable: bool,
        build: impl Fn(Vec<u8>, &Route) -> RequestFrame,
    ) -> Result<(ResponseFrame, Route), OperationError> {
        let timeout = if durable { self.kv_durable_timeout } else { self.kv_timeout };
        let deadline = Instant::now() + timeout;
        let mut tracker = AttemptTracker::new(idempotent, deadline, &self.strategy);
        // one immediate retry per accepted map version when a partition has
        // no active node; afterwards wait for the next map
        let mut nmvb_seen_at: Option<(i64, i64)> = None;

        loop {
            // (i) collection resolution, blocking on manifest propagation
            let uid = match self.bucket.resolve_collection(&self.scope, &self.collection) {
                CollectionLookup::Found(uid) => uid,
                CollectionLookup::ScopeNotFound => {
                    return Err(tracker.surface(CommonError::ScopeNotFound.into()));
                }
                CollectionLookup::CollectionNotFound => {
                    let bucket = self.bucket.clone();
                    tokio::spawn(async move { bucket.refresh_manifest().await });
                    tracker.retry(RetryReason::KvCollectionOutdated).await?;
                    continue;
                }
            };

            // (ii) partition → node
            let Some(route) = self.bucket.route(key.as_bytes()) else {
                tracker.retry(RetryReason::KvNotMyVbucket).await?;
                continue;
            };
            let Some(active) = route.active.clone() else {
                self.wait_for_map(&mut tracker, &mut nmvb_seen_at, route.version).await?;
                continue;
            };

            // (iii) session, opened on demand
            let session = match self.bucket.session_for(&active).await {
                Ok(session) => session,
                Err(_) => {
                    tracker.note_endpoint(&active.address(), None);
                    tracker.retry(RetryReason::SocketNotAvailable).await?;
                    continue;
                }
            };
            tracker.note_endpoint(session.endpoint(), Some(session.local_endpoint()));

            // (iv) encode and submit
            let collections = session.negotiated().supports(HelloFeature::Collections);
            let wk = wire_key(collections.then_some(uid), key.as_bytes());
            let mut frame = build(wk, &route);
            frame.partition = route.partition_id;
            let opcode = frame.opcode();

            let reply = match timeout_at(deadline, session.send(frame)).await {
                Err(_) => return Err(tracker.surface_timeout(true)),
                Ok(Err(SessionSendError::NotAvailable)) => {
                    tracker.retry(RetryReason::SocketNotAvailable).await?;
                    continue;
                }
                Ok(Err(SessionSendError::ClosedInFlight)) => {
                    tracker.mark_sent();
                    tracker.retry(RetryReason::SocketClosedWhileInFlight).await?;
                    continue;
                }
                Ok(Err(SessionSendError::Canceled)) => {
                    return Err(tracker.surface(CommonError::RequestCanceled.into()));
                }
                Ok(Ok(reply)) => reply,
            };
            tracker.mark_sent();
            tracker.note_status(reply.status_raw);

            // (v) classify
            match reply.status() {
                None => {
                    // not hardcoded: evaluate the server error map
                    match classify_unknown_status(
                        session.negotiated().error_map.as_ref(),
                        reply.status_raw,
                    ) {
                        UnknownStatus::Retry(info) => {
                            tracker.note_error_map(info);
                            tracker.retry(RetryReason::KvErrorMapRetryIndicated).await?;
                            continue;
                        }
                        UnknownStatus::Surface(kind, info) => {
                            tracker.note_error_map(info);
                            return Err(tracker.surface(kind));
                        }
                    }
                }
                Some(Status::NotMyVbucket) => {
                    // the response body already went to the topology manager
                    self.wait_for_map(&mut tracker, &mut nmvb_seen_at, route.version).await?;
                    continue;
                }
                Some(Status::UnknownCollection) | Some(Status::NoCollectionsManifest) => {
                    let bucket = self.bucket.clone();
                    tokio::spawn(async move { bucket.refresh_manifest().await });
                    tracker.retry(RetryReason::KvCollectionOutdated).await?;
                    continue;
                }
                Some(Status::Locked) => {
                    tracker.pending_kind = Some(KeyValueError::DocumentLocked.into());
                    tracker.retry(RetryReason::KvLocked).await?;
                    continue;
                }
                Some(
                    Status::TemporaryFailure
                    | Status::Busy
                    | Status::NoMemory
                    | Status::NotInitialized,
                ) => {
                    tracker.pending_kind = Some(CommonError::TemporaryFailure.into());
                    tracker.retry(RetryReason::KvTemporaryFailure).await?;
                    continue;
                }
                Some(Status::SyncWriteInProgress) => {
                    tracker.pending_kind = Some(KeyValueError::DurableWriteInProgress.into());
                    tracker.retry(RetryReason::KvSyncWriteInProgress).await?;
                    continue;
                }
                Some(Status::SyncWriteReCommitInProgress) => {
                    tracker.pending_kind =
                        Some(KeyValueError::DurableWriteReCommitInProgress.into());
                    tracker.retry(RetryReason::KvSyncWriteReCommitInProgress).await?;
                    continue;
                }
                Some(status) => {
                    let opcode = opcode.unwrap_or(Opcode::Get);
                    match map_status(opcode, status) {
                        None => return Ok((reply, route)),
                        Some(kind) => {
                            if datatype::is_json(reply.datatype) {
                                tracker.enhanced = parse_enhanced_error(&reply.value);
                            }
                            return Err(tracker.surface(kind));
                        }
                    }
                }
            }
        }
    }

    /// NMVB handling with the one-retry-per-map rule: the first sighting at
    /// a given map version retries after a short backoff; further sightings
    /// wait for the next accepted map or the deadline.
    async fn wait_for_map(
        &self,
        tracker: &mut AttemptTracker<'_>,
        seen_at: &mut Option<(i64, i64)>,
        version: (i64, i64),
    ) -> Result<(), OperationError> {
        if *seen_at != Some(version) {
            *seen_at = Some(version);
            tracker.retry(RetryReason::KvNotMyVbucket).await?;
            return Ok(());
        }
        // already retried once against this map: suspend until the next one
        let mut rx = self.bucket.map_version_rx();
        loop {
            if *rx.borrow_and_update() > version {
                return Ok(());
            }
            match timeout_at(tracker.deadline, rx.changed()).await {
                Err(_) => return Err(tracker.surface_timeout(false)),
                Ok(Err(_)) => return Err(tracker.surface(crate::error::NetworkError::ClusterClosed.into())),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Single-shot get against the active node and every replica.
    async fn replica_fan_out(
        &self,
        key: &str,
        first_wins: bool,
    ) -> Result<Vec<GetResult>, OperationError> {
        let deadline = Instant::now() + self.kv_timeout;
        let uid = match self.bucket.resolve_collection(&self.scope, &self.collection) {
            CollectionLookup::Found(uid) => uid,
            CollectionLookup::ScopeNotFound => {
                return Err(OperationError::new(CommonError::ScopeNotFound));
            }
            CollectionLookup::CollectionNotFound => {
                return Err(OperationError::new(CommonError::CollectionNotFound));
            }
        };
        let route = self
            .bucket
            .route(key.as_bytes())
            .ok_or_else(|| OperationError::new(crate::error::NetworkError::ConfigurationNotAvailable))?;

        let mut targets: Vec<(Endpoint, bool)> = Vec::new();
        if let Some(active) = route.active.clone() {
            targets.push((active, false));
        }
        for replica in &route.replicas {
            targets.push((replica.clone(), true));
        }
        if targets.is_empty() {
            return Err(OperationError::new(KeyValueError::DocumentIrretrievable));
        }

        let attempts = targets.into_iter().map(|(endpoint, is_replica)| {
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let partition = route.partition_id;
            async move {
                let session = bucket.session_for(&endpoint).await.ok()?;
                let collections = session.negotiated().supports(HelloFeature::Collections);
                let wk = wire_key(collections.then_some(uid), key.as_bytes());
                let mut frame =
                    if is_replica { ops::get_replica(wk) } else { ops::get(wk) };
                frame.partition = partition;
                let reply = timeout_at(deadline, session.send(frame)).await.ok()?.ok()?;
                if reply.status() == Some(Status::Success) {
                    Some(ops::parse_get(&reply))
                } else {
                    None
                }
            }
        });

        if first_wins {
            // first success wins; remaining futures are dropped with the set
            let mut futures: futures::stream::FuturesUnordered<_> = attempts.collect();
            use futures::StreamExt;
            while let Some(outcome) = futures.next().await {
                if let Some(result) = outcome {
                    return Ok(vec![result]);
                }
            }
            Ok(Vec::new())
        } else {
            Ok(join_all(attempts).await.into_iter().flatten().collect())
        }
    }
}

/// Per-request retry bookkeeping plus the error-context assembly.
struct AttemptTracker<'a> {
    idempotent: bool,
    deadline: Instant,
    strategy: &'a BestEffortRetryStrategy,
    state: RetryState,
    operation_id: String,
    last_dispatched_to: Option<String>,
    last_dispatched_from: Option<String>,
    status_code: Option<u16>,
    enhanced: Option<crate::error::EnhancedErrorInfo>,
    error_map_info: Option<ErrorMapInfo>,
    /// The kind to surface if the retry orchestrator gives up
    pending_kind: Option<ErrorKind>,
    sent: bool,
}

impl<'a> AttemptTracker<'a> {
    fn new(idempotent: bool, deadline: Instant, strategy: &'a BestEffortRetryStrategy) -> Self {
        Self {
            idempotent,
            deadline,
            strategy,
            state: RetryState::new(),
            operation_id: next_operation_id(),
            last_dispatched_to: None,
            last_dispatched_from: None,
            status_code: None,
            enhanced: None,
            error_map_info: None,
            pending_kind: None,
            sent: false,
        }
    }

    fn note_endpoint(&mut self, to: &str, from: Option<&str>) {
        self.last_dispatched_to = Some(to.to_string());
        self.last_dispatched_from = from.map(str::to_string);
    }

    fn note_status(&mut self, status: u16) {
        self.status_code = Some(status);
    }

    fn note_error_map(&mut self, info: Option<ErrorMapInfo>) {
        if info.is_some() {
            self.error_map_info = info;
        }
    }

    fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// Ask the orchestrator; sleeps through the backoff on a retry verdict,
    /// errors out on give-up or deadline.
    async fn retry(&mut self, reason: RetryReason) -> Result<(), OperationError> {
        let decision = orchestrate(self.strategy, &self.state, self.idempotent, reason, self.deadline);
        self.state.record(reason);
        match decision {
            RetryDecision::RetryAfter(delay) => {
                debug!(reason = %reason, ?delay, attempts = self.state.attempts(), "retrying");
                sleep(delay).await;
                Ok(())
            }
            RetryDecision::DeadlineExceeded => Err(self.surface_timeout(self.sent)),
            RetryDecision::GiveUp => {
                let kind = self.pending_kind.take().unwrap_or(match reason {
                    RetryReason::SocketClosedWhileInFlight => {
                        CommonError::RequestCanceled.into()
                    }
                    _ => CommonError::TemporaryFailure.into(),
                });
                Err(self.surface(kind))
            }
        }
    }

    fn context(&mut self) -> ErrorContext {
        ErrorContext {
            operation_id: std::mem::take(&mut self.operation_id),
            retry_attempts: self.state.attempts(),
            retry_reasons: self.state.reasons().to_vec(),
            last_dispatched_to: self.last_dispatched_to.take(),
            last_dispatched_from: self.last_dispatched_from.take(),
            status_code: self.status_code,
            enhanced_error_info: self.enhanced.take(),
            error_map_info: self.error_map_info.take(),
        }
    }

    fn surface(&mut self, kind: ErrorKind) -> OperationError {
        OperationError { kind, ctx: Box::new(self.context()) }
    }

    /// Deadline conversion: a write that may have reached the server is
    /// ambiguous; reads and pre-send failures are not.
    fn surface_timeout(&mut self, sent: bool) -> OperationError {
        let kind = if !self.idempotent && sent {
            CommonError::AmbiguousTimeout
        } else {
            CommonError::UnambiguousTimeout
        };
        self.surface(kind.into())
    }
}

enum UnknownStatus {
    Retry(Option<ErrorMapInfo>),
    Surface(ErrorKind, Option<ErrorMapInfo>),
}

/// Evaluate a status code the client does not hardcode against the server's
/// error map: retry attributes win, `internal` maps to the internal failure
/// kind, anything else is a protocol violation.
fn classify_unknown_status(error_map: Option<&ErrorMap>, status: u16) -> UnknownStatus {
    let Some(entry) = error_map.and_then(|m| m.lookup(status)) else {
        return UnknownStatus::Surface(crate::error::NetworkError::ProtocolError.into(), None);
    };
    let info = Some(ErrorMapInfo {
        code: status,
        name: entry.name.clone(),
        description: entry.description.clone(),
    });
    if entry.has_retry_attribute() {
        UnknownStatus::Retry(info)
    } else if entry.is_internal() {
        UnknownStatus::Surface(CommonError::InternalServerFailure.into(), info)
    } else if entry.is_auth() {
        UnknownStatus::Surface(CommonError::AuthenticationFailure.into(), info)
    } else {
        UnknownStatus::Surface(crate::error::NetworkError::ProtocolError.into(), info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_follows_error_map_attributes() {
        let map = ErrorMap::parse(
            br#"{"version":1,"revision":1,"errors":{
                "f0": {"name":"RETRYABLE","desc":"x","attrs":["retry-later"]},
                "f1": {"name":"BROKEN","desc":"y","attrs":["internal"]},
                "f2": {"name":"ODD","desc":"z","attrs":["special-handling"]}
            }}"#,
        )
        .unwrap();
        assert!(matches!(
            classify_unknown_status(Some(&map), 0xf0),
            UnknownStatus::Retry(Some(_))
        ));
        assert!(matches!(
            classify_unknown_status(Some(&map), 0xf1),
            UnknownStatus::Surface(ErrorKind::Common(CommonError::InternalServerFailure), _)
        ));
        assert!(matches!(
            classify_unknown_status(Some(&map), 0xf2),
            UnknownStatus::Surface(ErrorKind::Network(_), _)
        ));
        assert!(matches!(
            classify_unknown_status(None, 0xf0),
            UnknownStatus::Surface(ErrorKind::Network(_), None)
        ));
    }
}
