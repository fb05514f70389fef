//! HttpPluginClient against a stub plugin served by axum

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use synse_core::{
    GatewayError, PluginClient, TransactionStatus, TransactionUpdate, WritePayload,
};
use synse_plugin_http::HttpPluginClient;
use tokio::net::TcpListener;

/// Stub plugin that shuts down when dropped
struct StubPlugin {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl StubPlugin {
    async fn start() -> Self {
        let router = Router::new()
            .route(
                "/v1/metadata",
                get(|| async {
                    Json(json!({
                        "id": "stub",
                        "name": "stub plugin",
                        "version": "1.0.0",
                        "capabilities": ["read", "write"]
                    }))
                }),
            )
            .route(
                "/v1/devices",
                get(|| async {
                    Json(json!([
                        {"id": "led-1", "type": "led", "tags": ["default/rack-1"]},
                        {"id": "temp-1", "type": "temperature", "writable": false}
                    ]))
                }),
            )
            .route("/v1/devices/{id}/reading", get(reading))
            .route("/v1/devices/{id}/write", post(write))
            .route("/v1/transactions/{id}", get(transaction))
            .route(
                "/v1/health",
                get(|| async { Json(json!({"ok": true})) }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn client(&self) -> HttpPluginClient {
        HttpPluginClient::with_config(
            &format!("http://{}", self.addr),
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .unwrap()
    }
}

impl Drop for StubPlugin {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn reading(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "temp-1" => Json(json!([{
            "type": "temperature",
            "value": 21.5,
            "unit": "C",
            "timestamp": "2024-05-01T12:00:00Z"
        }]))
        .into_response(),
        "led-1" => Json(json!([])).into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "message": format!("no device {}", id)})),
        )
            .into_response(),
    }
}

async fn write(Path(id): Path<String>, Json(payload): Json<WritePayload>) -> Response {
    if payload.action != "state" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": format!("unsupported action {}", payload.action)})),
        )
            .into_response();
    }
    Json(json!({"transaction": format!("{}-txn", id)})).into_response()
}

async fn transaction(Path(id): Path<String>) -> Response {
    if id != "led-1-txn" {
        return StatusCode::NOT_FOUND.into_response();
    }
    // Split a line across chunks and leave the last one unterminated
    let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
        Ok("{\"status\":\"wri"),
        Ok("ting\"}\n"),
        Ok("{\"status\":\"success\"}"),
    ];
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}

#[tokio::test]
async fn metadata_and_devices() {
    let stub = StubPlugin::start().await;
    let client = stub.client();

    let metadata = client.metadata().await.unwrap();
    assert_eq!(metadata.id, "stub");
    assert_eq!(metadata.version.as_deref(), Some("1.0.0"));

    let devices = client.devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].tags, vec!["default/rack-1"]);
    assert!(!devices[1].writable);

    assert!(client.health().await.unwrap().ok);
}

#[tokio::test]
async fn read_maps_not_found() {
    let stub = StubPlugin::start().await;
    let client = stub.client();

    let readings = client.read("temp-1").await.unwrap();
    assert_eq!(readings[0].unit.as_deref(), Some("C"));
    assert_eq!(readings[0].value, json!(21.5));

    match client.read("ghost").await {
        Err(GatewayError::NotFound(message)) => assert_eq!(message, "no device ghost"),
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn write_and_follow_status() {
    let stub = StubPlugin::start().await;
    let client = stub.client();

    let ack = client
        .write("led-1", &WritePayload::new("state").with("value", json!("on")))
        .await
        .unwrap();
    assert_eq!(ack.transaction, "led-1-txn");

    let updates: Vec<TransactionUpdate> = client
        .transaction_status(&ack.transaction)
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(
        updates,
        vec![
            TransactionUpdate::new(TransactionStatus::Writing),
            TransactionUpdate::new(TransactionStatus::Success),
        ]
    );

    assert!(matches!(
        client.write("led-1", &WritePayload::new("color")).await,
        Err(GatewayError::InvalidRequest(_))
    ));
    assert!(matches!(
        client.transaction_status("nope").await,
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test]
async fn unreachable_plugin_is_unavailable() {
    let stub = StubPlugin::start().await;
    let client = stub.client();
    drop(stub);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.devices().await.unwrap_err();
    assert!(err.is_upstream_failure());
}
