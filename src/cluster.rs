//! Cluster façade: lifecycle, bucket handles, ping and diagnostics.

use crate::config::{
    ClusterOptions, ConnectionString, Credentials, parse_connection_string,
};
use crate::error::{CommonError, NetworkError, OperationError};
use crate::http::{HttpDispatcher, HttpRequest};
use crate::kv::{Bucket, Collection, build_tls_connector, ops};
use crate::kv::opcode::Status;
use crate::retry::BestEffortRetryStrategy;
use crate::types::{DEFAULT_NAMESPACE, ServiceType};
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use tracing::info;

/// Report format version shared with the other SDKs
const REPORT_VERSION: u8 = 2;

/// One endpoint's entry in a ping report.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointPingReport {
    pub remote: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    /// `ok`, `timeout` or `error`
    pub state: String,
    pub latency_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub id: String,
    pub sdk: String,
    pub version: u8,
    pub services: HashMap<&'static str, Vec<EndpointPingReport>>,
}

/// One endpoint's entry in a diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointDiagnostics {
    pub remote: String,
    pub local: String,
    /// `connected`, `connecting`, `disconnecting` or `disconnected`
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub id: String,
    pub sdk: String,
    pub version: u8,
    pub services: HashMap<&'static str, Vec<EndpointDiagnostics>>,
}

fn report_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn sdk_id() -> String {
    format!("mussel/{}", env!("CARGO_PKG_VERSION"))
}

/// Entry point: `connect → open_bucket* → operate* → close`.
pub struct Cluster {
    options: ClusterOptions,
    credentials: Credentials,
    connection: ConnectionString,
    tls: Option<tokio_rustls::TlsConnector>,
    buckets: Mutex<HashMap<String, Bucket>>,
    http: HttpDispatcher,
    strategy: Arc<BestEffortRetryStrategy>,
    closed: AtomicBool,
}

impl Cluster {
    /// Parse the connection string and prepare TLS. No I/O happens until a
    /// bucket is opened.
    pub fn connect(
        connection_string: &str,
        credentials: Credentials,
        mut options: ClusterOptions,
    ) -> Result<Cluster, OperationError> {
        let connection = parse_connection_string(connection_string, &mut options)
            .map_err(|_| OperationError::new(CommonError::InvalidArgument))?;
        let tls = if connection.tls {
            Some(
                build_tls_connector(&options.tls, &credentials)
                    .map_err(|e| e.into_operation_error())?,
            )
        } else {
            if !credentials.uses_sasl() {
                // client certificates only authenticate over TLS
                return Err(OperationError::new(CommonError::InvalidArgument));
            }
            None
        };
        let http = HttpDispatcher::new(&options);
        Ok(Cluster {
            options,
            credentials,
            connection,
            tls,
            buckets: Mutex::new(HashMap::new()),
            http,
            strategy: Arc::new(BestEffortRetryStrategy::controlled()),
            closed: AtomicBool::new(false),
        })
    }

    /// Open (or return the already-open) bucket.
    pub async fn bucket(&self, name: &str) -> Result<Bucket, OperationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OperationError::new(NetworkError::ClusterClosed));
        }
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get(name) {
            return Ok(bucket.clone());
        }
        let bucket = Bucket::bootstrap(
            name,
            &self.connection.seeds,
            self.credentials.clone(),
            self.options.clone(),
            self.tls.clone(),
        )
        .await?;
        buckets.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    /// Handle for a scope/collection pair within an open bucket
    pub fn collection(&self, bucket: &Bucket, scope: &str, collection: &str) -> Collection {
        Collection::new(
            bucket.clone(),
            scope.to_string(),
            collection.to_string(),
            Arc::clone(&self.strategy),
            self.options.timeouts.key_value,
            self.options.timeouts.key_value_durable,
        )
    }

    pub fn default_collection(&self, bucket: &Bucket) -> Collection {
        self.collection(bucket, DEFAULT_NAMESPACE, DEFAULT_NAMESPACE)
    }

    /// Row-streaming request against a service endpoint: rows are delivered
    /// through `on_row` as they complete, the return value is the trailing
    /// metadata. Per-service request builders sit above this contract.
    pub async fn execute_rows(
        &self,
        request: HttpRequest,
        pointer: &str,
        on_row: impl FnMut(Vec<u8>),
    ) -> Result<Vec<u8>, OperationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OperationError::new(NetworkError::ClusterClosed));
        }
        self.http.execute_rows(request, pointer, on_row).await
    }

    /// Fan a ping to every live session and every addressable HTTP service
    /// endpoint. Individual timeouts become `timeout` entries; the report
    /// itself always completes.
    pub async fn ping(&self, timeout: Option<Duration>) -> PingReport {
        let timeout = timeout.unwrap_or(self.options.timeouts.key_value);
        let deadline = Instant::now() + timeout;
        let mut services: HashMap<&'static str, Vec<EndpointPingReport>> = HashMap::new();

        let buckets: Vec<Bucket> =
            self.buckets.lock().await.values().cloned().collect();

        // data service over the live session pool
        let mut kv_probes = Vec::new();
        for bucket in &buckets {
            for session in bucket.sessions().await {
                let namespace = bucket.name().to_string();
                kv_probes.push(async move {
                    let started = Instant::now();
                    let outcome = timeout_at(deadline, session.send(ops::noop())).await;
                    let state = match outcome {
                        Err(_) => "timeout",
                        Ok(Err(_)) => "error",
                        Ok(Ok(reply)) if reply.status() == Some(Status::Success) => "ok",
                        Ok(Ok(_)) => "error",
                    };
                    EndpointPingReport {
                        remote: session.endpoint().to_string(),
                        local: Some(session.local_endpoint().to_string()),
                        state: state.to_string(),
                        latency_us: started.elapsed().as_micros() as u64,
                        namespace: Some(namespace),
                    }
                });
            }
        }
        services.insert(
            ServiceType::KeyValue.short_name(),
            futures::future::join_all(kv_probes).await,
        );

        // HTTP services
        let (username, password) = match &self.credentials {
            Credentials::UsernamePassword { username, password } => {
                (Some(username.clone()), Some(password.clone()))
            }
            _ => (None, None),
        };
        for service in [
            ServiceType::Query,
            ServiceType::Search,
            ServiceType::Analytics,
            ServiceType::View,
            ServiceType::Management,
        ] {
            let mut endpoints = Vec::new();
            for bucket in &buckets {
                endpoints.extend(bucket.http_endpoints(service));
            }
            endpoints.sort();
            endpoints.dedup();
            if endpoints.is_empty() {
                continue;
            }
            let probes = endpoints.into_iter().map(|base| {
                let username = username.clone();
                let password = password.clone();
                let http = &self.http;
                async move {
                    let outcome = http
                        .ping(service, &base, timeout, username.as_deref(), password.as_deref())
                        .await;
                    match outcome {
                        Ok(latency) => EndpointPingReport {
                            remote: base,
                            local: None,
                            state: "ok".to_string(),
                            latency_us: latency.as_micros() as u64,
                            namespace: None,
                        },
                        Err(e) => EndpointPingReport {
                            remote: base,
                            local: None,
                            state: if e.kind().is_timeout() { "timeout" } else { "error" }
                                .to_string(),
                            latency_us: timeout.as_micros() as u64,
                            namespace: None,
                        },
                    }
                }
            });
            services.insert(service.short_name(), futures::future::join_all(probes).await);
        }

        PingReport { id: report_id(), sdk: sdk_id(), version: REPORT_VERSION, services }
    }

    /// Snapshot of endpoint states. Performs no I/O.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let mut services: HashMap<&'static str, Vec<EndpointDiagnostics>> = HashMap::new();
        let buckets: Vec<Bucket> = self.buckets.lock().await.values().cloned().collect();
        let mut kv = Vec::new();
        for bucket in &buckets {
            for (remote, local, state) in bucket.diagnostics().await {
                kv.push(EndpointDiagnostics {
                    remote,
                    local,
                    state: state.endpoint_state().to_string(),
                    namespace: Some(bucket.name().to_string()),
                });
            }
        }
        services.insert(ServiceType::KeyValue.short_name(), kv);
        DiagnosticsReport { id: report_id(), sdk: sdk_id(), version: REPORT_VERSION, services }
    }

    /// Close every bucket and reject further work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let buckets: Vec<Bucket> = {
            let mut map = self.buckets.lock().await;
            map.drain().map(|(_, b)| b).collect()
        };
        for bucket in buckets {
            bucket.close().await;
        }
        info!(at = %Utc::now(), "cluster closed");
    }
}
