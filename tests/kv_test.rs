//! End-to-end tests against an in-process data node speaking the binary
//! protocol over a real socket.

use mussel::kv::opcode::{HelloFeature, Opcode, Status};
use mussel::kv::wire::{RequestFrame, ResponseFrame, encode_response};
use mussel::{
    Cluster, ClusterOptions, CommonError, CounterParams, Credentials, ErrorKind, KeyValueError,
    RemoveParams, RetryReason, StoreParams,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const USERNAME: &str = "Administrator";
const PASSWORD: &str = "password";
const BUCKET: &str = "default";
const PARTITIONS: usize = 64;

#[derive(Debug, Clone)]
struct Doc {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

type Docs = Arc<Mutex<HashMap<Vec<u8>, Doc>>>;

struct FakeNode {
    port: u16,
}

async fn spawn_fake_node() -> FakeNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake node");
    let port = listener.local_addr().expect("local addr").port();
    let docs: Docs = Arc::new(Mutex::new(HashMap::new()));
    let cas_counter = Arc::new(Mutex::new(1u64));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(serve_connection(
                stream,
                Arc::clone(&docs),
                Arc::clone(&cas_counter),
                port,
            ));
        }
    });
    FakeNode { port }
}

async fn serve_connection(mut stream: TcpStream, docs: Docs, cas_counter: Arc<Mutex<u64>>, port: u16) {
    let mut pending = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        loop {
            match RequestFrame::decode(&pending) {
                Ok(Some((request, used))) => {
                    pending.drain(..used);
                    let response = handle_request(&request, &docs, &cas_counter, port);
                    if stream.write_all(&encode_response(&response)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
        }
    }
}

fn next_cas(counter: &Arc<Mutex<u64>>) -> u64 {
    let mut guard = counter.lock().expect("cas counter");
    *guard += 1;
    *guard
}

fn reply(request: &RequestFrame, status: Status) -> ResponseFrame {
    ResponseFrame {
        opcode_raw: request.opcode_raw,
        status_raw: status as u16,
        opaque: request.opaque,
        ..Default::default()
    }
}

fn cluster_config(port: u16) -> String {
    let map: Vec<Vec<i16>> = vec![vec![0]; PARTITIONS];
    format!(
        r#"{{"rev":1,"revEpoch":1,"name":"{BUCKET}","nodesExt":[{{"services":{{"kv":{port}}},"thisNode":true}}],"vBucketServerMap":{{"hashAlgorithm":"CRC","numReplicas":0,"serverList":["$HOST:{port}"],"vBucketMap":{}}}}}"#,
        serde_json::to_string(&map).expect("vbucket map json"),
    )
}

fn handle_request(
    request: &RequestFrame,
    docs: &Docs,
    cas_counter: &Arc<Mutex<u64>>,
    port: u16,
) -> ResponseFrame {
    let Some(opcode) = request.opcode() else {
        return ResponseFrame {
            opcode_raw: request.opcode_raw,
            status_raw: Status::UnknownCommand as u16,
            opaque: request.opaque,
            ..Default::default()
        };
    };
    match opcode {
        Opcode::Hello => {
            let granted = [
                HelloFeature::TcpNodelay,
                HelloFeature::Xerror,
                HelloFeature::SelectBucket,
                HelloFeature::Snappy,
                HelloFeature::Json,
                HelloFeature::AltRequest,
                HelloFeature::SyncReplication,
                HelloFeature::UnorderedExecution,
            ];
            let requested: Vec<u16> = request
                .value
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            let mut value = Vec::new();
            for feature in granted {
                if requested.contains(&(feature as u16)) {
                    value.extend_from_slice(&(feature as u16).to_be_bytes());
                }
            }
            ResponseFrame { value, ..reply(request, Status::Success) }
        }
        Opcode::GetErrorMap => ResponseFrame {
            value: br#"{"version":1,"revision":1,"errors":{}}"#.to_vec(),
            ..reply(request, Status::Success)
        },
        Opcode::SaslListMechs => {
            ResponseFrame { value: b"PLAIN".to_vec(), ..reply(request, Status::Success) }
        }
        Opcode::SaslAuth => {
            let expected = format!("\0{USERNAME}\0{PASSWORD}");
            if request.key == b"PLAIN" && request.value == expected.as_bytes() {
                ResponseFrame {
                    value: b"Authenticated".to_vec(),
                    ..reply(request, Status::Success)
                }
            } else {
                reply(request, Status::AuthError)
            }
        }
        Opcode::SelectBucket => {
            if request.key == BUCKET.as_bytes() {
                reply(request, Status::Success)
            } else {
                reply(request, Status::NoAccess)
            }
        }
        Opcode::GetClusterConfig => ResponseFrame {
            value: cluster_config(port).into_bytes(),
            ..reply(request, Status::Success)
        },
        Opcode::Noop => reply(request, Status::Success),
        Opcode::Get => {
            let docs = docs.lock().expect("docs");
            match docs.get(&request.key) {
                None => reply(request, Status::NotFound),
                Some(doc) => ResponseFrame {
                    extras: doc.flags.to_be_bytes().to_vec(),
                    value: doc.value.clone(),
                    cas: doc.cas,
                    ..reply(request, Status::Success)
                },
            }
        }
        Opcode::Upsert | Opcode::Insert | Opcode::Replace => {
            let flags = if request.extras.len() >= 4 {
                u32::from_be_bytes(request.extras[0..4].try_into().expect("flags"))
            } else {
                0
            };
            let mut docs = docs.lock().expect("docs");
            let existing = docs.get(&request.key);
            match opcode {
                Opcode::Insert if existing.is_some() => return reply(request, Status::Exists),
                Opcode::Replace if existing.is_none() => return reply(request, Status::NotFound),
                Opcode::Replace
                    if request.cas != 0 && existing.map(|d| d.cas) != Some(request.cas) =>
                {
                    return reply(request, Status::Exists);
                }
                _ => {}
            }
            let cas = next_cas(cas_counter);
            docs.insert(
                request.key.clone(),
                Doc { value: request.value.clone(), flags, cas },
            );
            ResponseFrame { cas, ..reply(request, Status::Success) }
        }
        Opcode::Remove => {
            let mut docs = docs.lock().expect("docs");
            match docs.get(&request.key) {
                None => reply(request, Status::NotFound),
                Some(doc) if request.cas != 0 && doc.cas != request.cas => {
                    reply(request, Status::Exists)
                }
                Some(_) => {
                    docs.remove(&request.key);
                    ResponseFrame { cas: next_cas(cas_counter), ..reply(request, Status::Success) }
                }
            }
        }
        Opcode::Append | Opcode::Prepend => {
            let mut docs = docs.lock().expect("docs");
            match docs.get_mut(&request.key) {
                None => reply(request, Status::NotStored),
                Some(doc) => {
                    if opcode == Opcode::Append {
                        doc.value.extend_from_slice(&request.value);
                    } else {
                        let mut joined = request.value.clone();
                        joined.extend_from_slice(&doc.value);
                        doc.value = joined;
                    }
                    doc.cas = next_cas(cas_counter);
                    ResponseFrame { cas: doc.cas, ..reply(request, Status::Success) }
                }
            }
        }
        Opcode::Increment | Opcode::Decrement => {
            if request.extras.len() < 20 {
                return reply(request, Status::Invalid);
            }
            let delta = u64::from_be_bytes(request.extras[0..8].try_into().expect("delta"));
            let initial = u64::from_be_bytes(request.extras[8..16].try_into().expect("initial"));
            let expiry = u32::from_be_bytes(request.extras[16..20].try_into().expect("expiry"));
            let mut docs = docs.lock().expect("docs");
            let current = match docs.get(&request.key) {
                Some(doc) => match std::str::from_utf8(&doc.value).ok().and_then(|s| s.parse::<u64>().ok())
                {
                    Some(n) => Some(n),
                    None => return reply(request, Status::DeltaBadValue),
                },
                None => None,
            };
            let updated: u64 = match current {
                Some(n) => {
                    if opcode == Opcode::Increment {
                        n.wrapping_add(delta)
                    } else {
                        n.saturating_sub(delta)
                    }
                }
                None => {
                    if expiry == u32::MAX {
                        return reply(request, Status::NotFound);
                    }
                    initial
                }
            };
            let cas = next_cas(cas_counter);
            docs.insert(
                request.key.clone(),
                Doc { value: updated.to_string().into_bytes(), flags: 0, cas },
            );
            ResponseFrame {
                value: updated.to_be_bytes().to_vec(),
                cas,
                ..reply(request, Status::Success)
            }
        }
        _ => reply(request, Status::UnknownCommand),
    }
}

async fn connect(port: u16, extra_options: &str) -> Cluster {
    let conn = format!("couchbase://127.0.0.1:{port}{extra_options}");
    Cluster::connect(
        &conn,
        Credentials::password(USERNAME, PASSWORD),
        ClusterOptions::default(),
    )
    .expect("cluster connect")
}

#[tokio::test]
async fn upsert_append_get_round_trip() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    collection
        .upsert("foo", b"world".to_vec(), StoreParams::default())
        .await
        .expect("upsert");
    collection
        .append("foo", b"!".to_vec(), RemoveParams::default())
        .await
        .expect("append");
    let result = collection.get("foo").await.expect("get");
    assert_eq!(result.value, b"world!");
    assert!(!result.cas.is_zero());

    cluster.close().await;
}

#[tokio::test]
async fn prepend_builds_greeting() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    collection
        .upsert("foo", b"world".to_vec(), StoreParams::default())
        .await
        .expect("upsert");
    collection
        .prepend("foo", b"Hello, ".to_vec(), RemoveParams::default())
        .await
        .expect("prepend");
    let result = collection.get("foo").await.expect("get");
    assert_eq!(result.value, b"Hello, world");

    cluster.close().await;
}

#[tokio::test]
async fn adjoining_a_missing_document_is_not_found() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    let err = collection
        .append("missing_key", Vec::new(), RemoveParams::default())
        .await
        .expect_err("append on missing document");
    assert_eq!(err.kind(), ErrorKind::KeyValue(KeyValueError::DocumentNotFound));

    let err = collection
        .prepend("missing_key", Vec::new(), RemoveParams::default())
        .await
        .expect_err("prepend on missing document");
    assert_eq!(err.kind(), ErrorKind::KeyValue(KeyValueError::DocumentNotFound));

    cluster.close().await;
}

#[tokio::test]
async fn counters_create_then_step() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    let created = collection
        .increment("ticker", CounterParams { delta: 2, initial: Some(10), ..Default::default() })
        .await
        .expect("create counter");
    assert_eq!(created.content, 10);

    let mut expected = 10;
    for _ in 0..10 {
        expected += 2;
        let result = collection
            .increment("ticker", CounterParams { delta: 2, ..Default::default() })
            .await
            .expect("increment");
        assert_eq!(result.content, expected);
    }
    assert_eq!(expected, 30);

    cluster.close().await;
}

#[tokio::test]
async fn decrement_stops_at_zero() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    collection
        .upsert("countdown", b"20".to_vec(), StoreParams::default())
        .await
        .expect("seed counter");
    let mut expected = 20i64;
    for _ in 0..10 {
        expected = (expected - 2).max(0);
        let result = collection
            .decrement("countdown", CounterParams { delta: 2, ..Default::default() })
            .await
            .expect("decrement");
        assert_eq!(result.content, expected as u64);
    }
    assert_eq!(expected, 0);

    // the counter saturates rather than wrapping below zero
    let result = collection
        .decrement("countdown", CounterParams { delta: 2, ..Default::default() })
        .await
        .expect("decrement at zero");
    assert_eq!(result.content, 0);

    cluster.close().await;
}

#[tokio::test]
async fn counter_without_initial_on_missing_document() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    let err = collection
        .increment("absent", CounterParams { delta: 2, ..Default::default() })
        .await
        .expect_err("increment without initial on missing document");
    assert_eq!(err.kind(), ErrorKind::KeyValue(KeyValueError::DocumentNotFound));

    cluster.close().await;
}

#[tokio::test]
async fn missing_scope_and_collection_resolution() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "?kv_timeout=300").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");

    let missing_scope = cluster.collection(&bucket, "missing_scope", "_default");
    let err = missing_scope.get("key").await.expect_err("missing scope");
    assert_eq!(err.kind(), ErrorKind::Common(CommonError::ScopeNotFound));

    let missing_collection = cluster.collection(&bucket, "_default", "missing_collection");
    let err = missing_collection.get("key").await.expect_err("missing collection");
    assert_eq!(err.kind(), ErrorKind::Common(CommonError::UnambiguousTimeout));
    assert!(
        err.ctx.retry_reasons.contains(&RetryReason::KvCollectionOutdated),
        "context must record the outdated-collection retries: {:?}",
        err.ctx.retry_reasons
    );

    cluster.close().await;
}

#[tokio::test]
async fn large_values_survive_the_compressed_path() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    // compressible and well past the compression threshold
    let value = vec![b'x'; 4096];
    collection
        .upsert("big", value.clone(), StoreParams::default())
        .await
        .expect("upsert large value");
    let result = collection.get("big").await.expect("get large value");
    assert_eq!(result.value, value);

    cluster.close().await;
}

#[tokio::test]
async fn insert_with_cas_is_rejected_client_side() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    let err = collection
        .insert(
            "doc",
            b"{}".to_vec(),
            StoreParams { cas: mussel::Cas(7), ..Default::default() },
        )
        .await
        .expect_err("insert with cas");
    assert_eq!(err.kind(), ErrorKind::Common(CommonError::InvalidArgument));

    cluster.close().await;
}

#[tokio::test]
async fn insert_conflict_is_document_exists() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    collection
        .insert("doc", b"one".to_vec(), StoreParams::default())
        .await
        .expect("first insert");
    let err = collection
        .insert("doc", b"two".to_vec(), StoreParams::default())
        .await
        .expect_err("second insert");
    assert_eq!(err.kind(), ErrorKind::KeyValue(KeyValueError::DocumentExists));

    cluster.close().await;
}

#[tokio::test]
async fn replace_with_stale_cas_is_cas_mismatch() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    let first = collection
        .upsert("doc", b"one".to_vec(), StoreParams::default())
        .await
        .expect("upsert");
    collection
        .upsert("doc", b"two".to_vec(), StoreParams::default())
        .await
        .expect("second upsert");
    let err = collection
        .replace("doc", b"three".to_vec(), StoreParams { cas: first.cas, ..Default::default() })
        .await
        .expect_err("replace with stale cas");
    assert_eq!(err.kind(), ErrorKind::Common(CommonError::CasMismatch));

    cluster.close().await;
}

#[tokio::test]
async fn get_any_replica_serves_from_the_active() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    let bucket = cluster.bucket(BUCKET).await.expect("open bucket");
    let collection = cluster.default_collection(&bucket);

    collection
        .upsert("doc", b"payload".to_vec(), StoreParams::default())
        .await
        .expect("upsert");
    let result = collection.get_any_replica("doc").await.expect("get any replica");
    assert_eq!(result.value, b"payload");

    let err = collection.get_any_replica("missing").await.expect_err("irretrievable");
    assert_eq!(err.kind(), ErrorKind::KeyValue(KeyValueError::DocumentIrretrievable));

    cluster.close().await;
}

#[tokio::test]
async fn ping_and_diagnostics_report_the_data_service() {
    let node = spawn_fake_node().await;
    let cluster = connect(node.port, "").await;
    cluster.bucket(BUCKET).await.expect("open bucket");

    let report = cluster.ping(Some(std::time::Duration::from_millis(500))).await;
    let kv = report.services.get("kv").expect("kv entries");
    assert!(!kv.is_empty());
    assert!(kv.iter().all(|entry| entry.state == "ok"), "{kv:?}");

    let diagnostics = cluster.diagnostics().await;
    let kv = diagnostics.services.get("kv").expect("kv entries");
    assert!(kv.iter().all(|entry| entry.state == "connected"), "{kv:?}");

    cluster.close().await;
}
