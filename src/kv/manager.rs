//! Bucket lifecycle: bootstrap from the seed list, steady-state config
//! polling, session-pool reconciliation and collection-manifest tracking.
//!
//! The topology and partition map have a single writer (this module) and
//! many readers (dispatchers), so they live behind a std `RwLock` where the
//! read path is the hot path. Sessions are opened lazily on first use.

use super::opcode::{HelloFeature, Status};
use super::ops;
use super::partition::{PartitionLocation, PartitionMap};
use super::session::{ConfigHint, Session, SessionConfig, SessionState};
use super::topology::{CollectionLookup, CollectionsManifest, ClusterConfig, Topology};
use crate::config::{ClusterOptions, Credentials, Seed};
use crate::error::{NetworkError, OperationError};
use crate::types::ServiceType;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};

/// Well-known data ports used when a seed does not name one
const DEFAULT_KV_PORT: u16 = 11210;
const DEFAULT_KV_TLS_PORT: u16 = 11207;

/// Where a key lives, resolved against the current map.
#[derive(Debug, Clone)]
pub struct Route {
    pub partition_id: u16,
    pub active: Option<Endpoint>,
    pub replicas: Vec<Endpoint>,
    /// Map version the route was computed from
    pub version: (i64, i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct BucketState {
    topology: Topology,
    partitions: PartitionMap,
    manifest: CollectionsManifest,
    network: String,
}

struct BucketInner {
    name: String,
    options: ClusterOptions,
    credentials: Credentials,
    tls: Option<tokio_rustls::TlsConnector>,
    client_id: String,
    seeds: Vec<Seed>,
    state: RwLock<BucketState>,
    sessions: Mutex<HashMap<String, Session>>,
    config_tx: mpsc::UnboundedSender<ConfigHint>,
    version_tx: watch::Sender<(i64, i64)>,
    manifest_tx: watch::Sender<u64>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One open bucket: routing state plus its session pool.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

impl Bucket {
    /// Walk the seed list in order until one node yields a config.
    pub async fn bootstrap(
        name: &str,
        seeds: &[Seed],
        credentials: Credentials,
        options: ClusterOptions,
        tls: Option<tokio_rustls::TlsConnector>,
    ) -> Result<Bucket, OperationError> {
        let deadline = Instant::now() + options.timeouts.bootstrap;
        let mut id_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let client_id =
            format!("mussel/{}/{}", env!("CARGO_PKG_VERSION"), hex::encode(id_bytes));
        let (config_tx, hint_rx) = mpsc::unbounded_channel();

        let mut last_failure = None;
        for seed in seeds {
            let port = seed.port.unwrap_or(if tls.is_some() {
                DEFAULT_KV_TLS_PORT
            } else {
                DEFAULT_KV_PORT
            });
            let session_config = SessionConfig {
                client_id: client_id.clone(),
                bucket: Some(name.to_string()),
                credentials: credentials.clone(),
                enable_compression: options.enable_compression,
                connect_timeout: options.timeouts.connect,
                resolve_timeout: options.timeouts.resolve,
                ip_protocol: options.ip_protocol,
                enable_tcp_keep_alive: options.enable_tcp_keep_alive,
                tcp_keep_alive_interval: options.tcp_keep_alive_interval,
                tls: tls.clone(),
                config_tx: Some(config_tx.clone()),
            };

            let attempt = async {
                let session = Session::connect(&seed.host, port, session_config)
                    .await
                    .map_err(|e| e.into_operation_error())?;
                let reply = session
                    .send(ops::get_cluster_config())
                    .await
                    .map_err(|_| OperationError::new(NetworkError::ConfigurationNotAvailable))?;
                if reply.status() != Some(Status::Success) {
                    return Err(OperationError::new(NetworkError::ConfigurationNotAvailable));
                }
                Ok::<_, OperationError>((session, reply.value))
            };
            match timeout_at(deadline, attempt).await {
                Err(_) => {
                    last_failure =
                        Some(OperationError::new(crate::error::CommonError::UnambiguousTimeout));
                    break;
                }
                Ok(Err(e)) => {
                    warn!(seed = %seed, error = %e, "bootstrap attempt failed");
                    last_failure = Some(e);
                }
                Ok(Ok((session, payload))) => {
                    let config = ClusterConfig::parse(&payload, &seed.host)
                        .map_err(|_| OperationError::new(NetworkError::ProtocolError))?;
                    let topology = config.topology(&seed.host);
                    let network = options
                        .preferred_network
                        .clone()
                        .unwrap_or_else(|| topology.select_network(&seed.host));
                    info!(bucket = name, seed = %seed, network, "bootstrap complete");

                    let manifest = if session.negotiated().supports(HelloFeature::Collections) {
                        fetch_manifest(&session).await.unwrap_or_else(CollectionsManifest::default_manifest)
                    } else {
                        CollectionsManifest::default_manifest()
                    };

                    let partitions = config.partition_map().unwrap_or_default();
                    let (version_tx, _) = watch::channel(partitions.version());
                    let (manifest_tx, _) = watch::channel(manifest.uid);

                    let inner = Arc::new(BucketInner {
                        name: name.to_string(),
                        options,
                        credentials,
                        tls,
                        client_id,
                        seeds: seeds.to_vec(),
                        state: RwLock::new(BucketState {
                            topology,
                            partitions,
                            manifest,
                            network,
                        }),
                        sessions: Mutex::new(HashMap::from([(
                            session.endpoint().to_string(),
                            session,
                        )])),
                        config_tx,
                        version_tx,
                        manifest_tx,
                        closed: AtomicBool::new(false),
                        tasks: Mutex::new(Vec::new()),
                    });
                    let bucket = Bucket { inner };
                    bucket.spawn_background(hint_rx).await;
                    return Ok(bucket);
                }
            }
        }
        Err(last_failure.unwrap_or_else(|| OperationError::new(NetworkError::NoEndpointsLeft)))
    }

    async fn spawn_background(&self, mut hint_rx: mpsc::UnboundedReceiver<ConfigHint>) {
        let poller = {
            let bucket = self.clone();
            tokio::spawn(async move {
                let interval = bucket.inner.options.effective_poll_interval();
                let mut next = Instant::now() + interval;
                loop {
                    sleep_until(next).await;
                    next = Instant::now() + interval;
                    if bucket.inner.closed.load(Ordering::Acquire) {
                        return;
                    }
                    bucket.poll_config().await;
                }
            })
        };
        let hints = {
            let bucket = self.clone();
            tokio::spawn(async move {
                while let Some(hint) = hint_rx.recv().await {
                    bucket.apply_config(&hint.payload, &hint.origin_host).await;
                }
            })
        };
        self.inner.tasks.lock().await.extend([poller, hints]);
    }

    /// Fetch a config from any live session and apply it
    async fn poll_config(&self) {
        let session = {
            let sessions = self.inner.sessions.lock().await;
            sessions.values().find(|s| s.is_active()).cloned()
        };
        let Some(session) = session else {
            debug!(bucket = %self.inner.name, "no live session for config poll, retrying seeds");
            self.recover_from_seeds().await;
            return;
        };
        match session.send(ops::get_cluster_config()).await {
            Ok(reply) if reply.status() == Some(Status::Success) => {
                let origin = session
                    .endpoint()
                    .rsplit_once(':')
                    .map(|(host, _)| host.to_string())
                    .unwrap_or_default();
                self.apply_config(&reply.value, &origin).await;
            }
            Ok(reply) => {
                debug!(status = reply.status_raw, "config poll rejected");
            }
            Err(_) => {
                debug!(endpoint = session.endpoint(), "config poll failed, session unusable");
            }
        }
    }

    /// With every session gone the topology may be arbitrarily stale; walk
    /// the original seed list until one node accepts a connection again.
    async fn recover_from_seeds(&self) {
        let default_port =
            if self.inner.tls.is_some() { DEFAULT_KV_TLS_PORT } else { DEFAULT_KV_PORT };
        for seed in self.inner.seeds.clone() {
            let endpoint =
                Endpoint { host: seed.host.clone(), port: seed.port.unwrap_or(default_port) };
            if self.session_for(&endpoint).await.is_ok() {
                info!(seed = %seed, "recovered a session from the seed list");
                return;
            }
        }
    }

    /// Apply a config payload iff it is strictly newer, then reconcile the
    /// session pool against the surviving node list.
    pub async fn apply_config(&self, payload: &[u8], origin_host: &str) {
        let Ok(config) = ClusterConfig::parse(payload, origin_host) else {
            warn!(bucket = %self.inner.name, "discarding unparseable config payload");
            return;
        };
        if !config.name.is_empty() && config.name != self.inner.name {
            return;
        }

        let mut manifest_refresh = false;
        let accepted = {
            let mut state = self.inner.state.write().expect("bucket state lock");
            let Some(candidate) = config.partition_map() else { return };
            if !state.partitions.apply(candidate) {
                return;
            }
            state.topology = config.topology(origin_host);
            if let Some(uid) = config.manifest_uid() {
                if uid > state.manifest.uid {
                    manifest_refresh = true;
                }
            }
            debug!(
                bucket = %self.inner.name,
                version = ?state.partitions.version(),
                nodes = state.topology.nodes.len(),
                "accepted cluster map"
            );
            state.partitions.version()
        };
        let _ = self.inner.version_tx.send(accepted);

        self.reconcile_sessions().await;
        if manifest_refresh {
            let bucket = self.clone();
            tokio::spawn(async move {
                bucket.refresh_manifest().await;
            });
        }
    }

    /// Drain sessions to endpoints that left the topology.
    async fn reconcile_sessions(&self) {
        let keep: Vec<String> = {
            let state = self.inner.state.read().expect("bucket state lock");
            state
                .topology
                .nodes
                .iter()
                .filter_map(|node| {
                    node.endpoint_for(
                        &state.network,
                        ServiceType::KeyValue,
                        self.inner.tls.is_some(),
                    )
                })
                .collect()
        };
        let mut sessions = self.inner.sessions.lock().await;
        let departed: Vec<String> =
            sessions.keys().filter(|ep| !keep.contains(ep)).cloned().collect();
        for endpoint in departed {
            if let Some(session) = sessions.remove(&endpoint) {
                info!(endpoint, "draining session to departed node");
                tokio::spawn(async move { session.drain().await });
            }
        }
    }

    /// Resolve a key against the current map.
    pub fn route(&self, key: &[u8]) -> Option<Route> {
        let state = self.inner.state.read().expect("bucket state lock");
        let location = state.partitions.locate(key)?;
        Some(self.route_location(&state, location))
    }

    /// Resolve an already-known partition (replica reads after the map moved)
    pub fn route_partition(&self, partition_id: u16) -> Option<Route> {
        let state = self.inner.state.read().expect("bucket state lock");
        let location = state.partitions.location_of(partition_id)?;
        Some(self.route_location(&state, location))
    }

    fn route_location(&self, state: &BucketState, location: PartitionLocation) -> Route {
        let tls = self.inner.tls.is_some();
        let endpoint_of = |node_index: usize| -> Option<Endpoint> {
            let node = state.topology.nodes.get(node_index)?;
            let port = node.port_for(&state.network, ServiceType::KeyValue, tls)?;
            Some(Endpoint { host: node.hostname_for(&state.network).to_string(), port })
        };
        Route {
            partition_id: location.partition_id,
            active: location.active.and_then(endpoint_of),
            replicas: location.replicas.iter().filter_map(|&i| endpoint_of(i)).collect(),
            version: state.partitions.version(),
        }
    }

    /// Session to an endpoint, opened on demand.
    pub async fn session_for(&self, endpoint: &Endpoint) -> Result<Session, OperationError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(OperationError::new(NetworkError::ClusterClosed));
        }
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get(&endpoint.address()) {
            if session.is_active() {
                return Ok(session.clone());
            }
            sessions.remove(&endpoint.address());
        }
        let config = SessionConfig {
            client_id: self.inner.client_id.clone(),
            bucket: Some(self.inner.name.clone()),
            credentials: self.inner.credentials.clone(),
            enable_compression: self.inner.options.enable_compression,
            connect_timeout: self.inner.options.timeouts.connect,
            resolve_timeout: self.inner.options.timeouts.resolve,
            ip_protocol: self.inner.options.ip_protocol,
            enable_tcp_keep_alive: self.inner.options.enable_tcp_keep_alive,
            tcp_keep_alive_interval: self.inner.options.tcp_keep_alive_interval,
            tls: self.inner.tls.clone(),
            config_tx: Some(self.inner.config_tx.clone()),
        };
        let session = Session::connect(&endpoint.host, endpoint.port, config)
            .await
            .map_err(|e| e.into_operation_error())?;
        sessions.insert(endpoint.address(), session.clone());
        Ok(session)
    }

    /// Current collection uid for a scope/collection pair
    pub fn resolve_collection(&self, scope: &str, collection: &str) -> CollectionLookup {
        let state = self.inner.state.read().expect("bucket state lock");
        state.manifest.resolve(scope, collection)
    }

    /// Re-fetch the manifest from any live session and publish its uid.
    pub async fn refresh_manifest(&self) {
        let session = {
            let sessions = self.inner.sessions.lock().await;
            sessions.values().find(|s| s.is_active()).cloned()
        };
        let Some(session) = session else { return };
        if !session.negotiated().supports(HelloFeature::Collections) {
            return;
        }
        if let Some(manifest) = fetch_manifest(&session).await {
            let uid = manifest.uid;
            let mut state = self.inner.state.write().expect("bucket state lock");
            if manifest.uid >= state.manifest.uid {
                state.manifest = manifest;
                drop(state);
                let _ = self.inner.manifest_tx.send(uid);
            }
        }
    }

    /// Block until the manifest uid reaches `uid` or the deadline passes.
    /// Returns whether the manifest caught up.
    pub async fn await_manifest_at_least(&self, uid: u64, deadline: Instant) -> bool {
        let mut rx = self.inner.manifest_tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= uid {
                return true;
            }
            match timeout_at(deadline, rx.changed()).await {
                Err(_) => return false,
                Ok(Err(_)) => return false,
                Ok(Ok(())) => {}
            }
        }
    }

    /// Subscribe to accepted map versions; the dispatcher waits on this when
    /// a partition has no active node.
    pub fn map_version_rx(&self) -> watch::Receiver<(i64, i64)> {
        self.inner.version_tx.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Live sessions keyed by endpoint, for ping fan-out and diagnostics
    pub async fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.lock().await.values().cloned().collect()
    }

    /// Endpoint state snapshot; performs no I/O
    pub async fn diagnostics(&self) -> Vec<(String, String, SessionState)> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .values()
            .map(|s| (s.endpoint().to_string(), s.local_endpoint().to_string(), s.state()))
            .collect()
    }

    /// HTTP endpoints for a service on the selected network
    pub fn http_endpoints(&self, service: ServiceType) -> Vec<String> {
        let state = self.inner.state.read().expect("bucket state lock");
        let tls = self.inner.tls.is_some();
        let scheme = if tls { "https" } else { "http" };
        state
            .topology
            .nodes
            .iter()
            .filter_map(|node| {
                node.endpoint_for(&state.network, service, tls)
                    .map(|ep| format!("{scheme}://{ep}"))
            })
            .collect()
    }

    /// Drain every session and stop background work.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        let sessions: Vec<Session> = {
            let mut map = self.inner.sessions.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.drain().await;
        }
        info!(bucket = %self.inner.name, "bucket closed");
    }
}

async fn fetch_manifest(session: &Session) -> Option<CollectionsManifest> {
    match session.send(ops::get_collections_manifest()).await {
        Ok(reply) if reply.status() == Some(Status::Success) => {
            CollectionsManifest::parse(&reply.value).ok()
        }
        _ => None,
    }
}

impl super::session::HandshakeError {
    /// Collapse handshake failures into the operation error taxonomy
    pub fn into_operation_error(self) -> OperationError {
        use super::session::HandshakeError as H;
        match self {
            H::AuthRejected(_) | H::Sasl(_) => {
                OperationError::new(crate::error::CommonError::AuthenticationFailure)
            }
            H::Timeout(_) => OperationError::new(crate::error::CommonError::UnambiguousTimeout),
            H::Wire(_) => OperationError::new(NetworkError::ProtocolError),
            _ => OperationError::new(NetworkError::HandshakeFailure),
        }
    }
}
