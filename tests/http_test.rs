//! Row-streaming dispatch against an in-process HTTP endpoint.

use mussel::http::{HttpMethod, HttpRequest};
use mussel::{
    Cluster, ClusterOptions, Credentials, ErrorKind, RetryReason, ServiceType,
    StreamingJsonError,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn spawn_http_endpoint(status_line: &'static str, body: String) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind http endpoint");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

fn rows_request(port: u16) -> HttpRequest {
    HttpRequest {
        service: ServiceType::Query,
        method: HttpMethod::Get,
        base: format!("http://127.0.0.1:{port}"),
        path: "/query/service".to_string(),
        body: None,
        content_type: None,
        username: None,
        password: None,
        timeout: Duration::from_millis(2_000),
        idempotent: true,
    }
}

fn cluster() -> Cluster {
    Cluster::connect(
        "couchbase://127.0.0.1",
        Credentials::password("Administrator", "password"),
        ClusterOptions::default(),
    )
    .expect("cluster connect")
}

#[tokio::test]
async fn rows_stream_through_the_cluster() {
    let body = r#"{"requestID":"9f","results":[{"id":1},{"id":2},{"id":3}],"status":"success"}"#;
    let port = spawn_http_endpoint("200 OK", body.to_string()).await;
    let cluster = cluster();

    let mut rows = Vec::new();
    let meta = cluster
        .execute_rows(rows_request(port), "results", |row| rows.push(row))
        .await
        .expect("row stream");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], br#"{"id":1}"#);
    let meta: serde_json::Value = serde_json::from_slice(&meta).expect("trailing metadata");
    assert_eq!(meta["status"], "success");
    assert_eq!(meta["results"], serde_json::json!([]));
}

#[tokio::test]
async fn truncated_stream_surfaces_the_lexer_domain_without_losing_rows() {
    // the content length matches, but the JSON itself is cut short
    let body = r#"{"results":[{"id":1},{"id"#;
    let port = spawn_http_endpoint("200 OK", body.to_string()).await;
    let cluster = cluster();

    let mut rows = Vec::new();
    let err = cluster
        .execute_rows(rows_request(port), "results", |row| rows.push(row))
        .await
        .expect_err("truncated body");
    assert_eq!(err.kind(), ErrorKind::StreamingJson(StreamingJsonError::BracketMismatch));
    assert_eq!(rows.len(), 1, "the complete first row was already delivered");
}

#[tokio::test]
async fn retryable_status_is_not_replayed_for_row_streams() {
    let port = spawn_http_endpoint("503 Service Unavailable", String::new()).await;
    let cluster = cluster();

    let err = cluster
        .execute_rows(rows_request(port), "results", |_| {})
        .await
        .expect_err("service unavailable");
    assert_eq!(err.ctx.retry_reasons, vec![RetryReason::ServiceNotAvailable]);
}
