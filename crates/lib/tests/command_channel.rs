//! Integration tests for the command channel: a mock gateway task answers
//! framed JSON requests over loopback TCP. Each test spawns its own gateway.

use lib::client::GatewayClient;
use lib::config::Config;
use lib::error::ClientError;
use lib::protocol::ResponseStatus;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = format!("tcp://{}", listener.local_addr().expect("local_addr"));
    (listener, endpoint)
}

async fn accept(listener: &TcpListener) -> BufReader<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    BufReader::new(stream)
}

async fn read_request(stream: &mut BufReader<TcpStream>) -> Value {
    let mut line = String::new();
    stream.read_line(&mut line).await.expect("read request");
    serde_json::from_str(line.trim()).expect("request JSON")
}

async fn write_frame(stream: &mut BufReader<TcpStream>, frame: &Value) {
    let mut bytes = serde_json::to_vec(frame).expect("encode frame");
    bytes.push(b'\n');
    stream.get_mut().write_all(&bytes).await.expect("write frame");
}

fn success_for(request: &Value, data: Value) -> Value {
    json!({
        "kind": "success",
        "transaction": request["transaction"],
        "data": data
    })
}

fn config_for(endpoint: &str, timeout_ms: u64) -> Config {
    let mut config = Config::default();
    config.command_endpoint = endpoint.to_string();
    config.command_timeout_ms = timeout_ms;
    config
}

#[tokio::test]
async fn create_round_trip_resolves_with_matching_transaction() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let request = read_request(&mut stream).await;
        assert_eq!(request["kind"], "create");
        assert!(request["transaction"].is_string());
        write_frame(&mut stream, &success_for(&request, json!({ "id": 7421 }))).await;
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 2000))
        .await
        .expect("connect");
    let id = client.create_session().await.expect("create");
    assert_eq!(id, 7421);
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn silent_gateway_times_out() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let _request = read_request(&mut stream).await;
        // Keep the connection open without answering.
        tokio::time::sleep(Duration::from_millis(800)).await;
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 150))
        .await
        .expect("connect");
    let outcome = client.send("create", Map::new()).await;
    match outcome {
        Err(ClientError::Timeout(timeout)) => assert_eq!(timeout, Duration::from_millis(150)),
        other => panic!("expected timeout, got {other:?}"),
    }
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn late_reply_after_timeout_is_ignored() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let first = read_request(&mut stream).await;
        // Answer the first request well past its deadline.
        tokio::time::sleep(Duration::from_millis(400)).await;
        write_frame(&mut stream, &success_for(&first, json!({ "id": 1 }))).await;
        let second = read_request(&mut stream).await;
        write_frame(&mut stream, &success_for(&second, json!({ "id": 2 }))).await;
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 2000))
        .await
        .expect("connect");
    let first = client
        .send_with_timeout("create", Map::new(), Duration::from_millis(150))
        .await;
    assert!(matches!(first, Err(ClientError::Timeout(_))));

    // The stale reply is skipped on the next exchange's read side; the
    // second request still resolves with its own reply.
    let id = client.create_session().await.expect("second create");
    assert_eq!(id, 2);
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn concurrent_sends_do_not_overlap_on_the_wire() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let first = read_request(&mut stream).await;

        // While the first exchange is unanswered, nothing else may arrive.
        let mut early = String::new();
        let peek = tokio::time::timeout(
            Duration::from_millis(100),
            stream.read_line(&mut early),
        )
        .await;
        assert!(
            peek.is_err(),
            "second request written before the first resolved: {early}"
        );

        write_frame(&mut stream, &success_for(&first, json!({}))).await;
        let second = read_request(&mut stream).await;
        assert_ne!(first["transaction"], second["transaction"]);
        write_frame(&mut stream, &success_for(&second, json!({}))).await;
    });

    let client = Arc::new(
        GatewayClient::connect(&config_for(&endpoint, 2000))
            .await
            .expect("connect"),
    );
    let a = {
        let client = client.clone();
        tokio::spawn(async move { client.send("create", Map::new()).await })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move { client.send("create", Map::new()).await })
    };

    assert!(a.await.expect("join a").is_ok());
    assert!(b.await.expect("join b").is_ok());
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn stale_reply_ahead_of_the_real_one_is_skipped() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let request = read_request(&mut stream).await;
        write_frame(
            &mut stream,
            &json!({ "kind": "success", "transaction": "bogus", "data": {} }),
        )
        .await;
        write_frame(&mut stream, &success_for(&request, json!({ "id": 5 }))).await;
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 2000))
        .await
        .expect("connect");
    let id = client.create_session().await.expect("create");
    assert_eq!(id, 5);
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn gateway_error_surfaces_as_status_and_rejection() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        for _ in 0..2 {
            let request = read_request(&mut stream).await;
            write_frame(
                &mut stream,
                &json!({
                    "kind": "error",
                    "transaction": request["transaction"],
                    "error": { "code": 458, "reason": "No such session" }
                }),
            )
            .await;
        }
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 2000))
        .await
        .expect("connect");

    // Raw send hands the error back as data.
    let response = client.send("destroy", Map::new()).await.expect("send");
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.as_ref().expect("descriptor").code, 458);

    // Typed helpers convert it into a rejection.
    let outcome = client.destroy_session(1).await;
    match outcome {
        Err(ClientError::Rejected(descriptor)) => {
            assert_eq!(descriptor.reason, "No such session");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn server_info_and_keepalive_round_trips() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let info = read_request(&mut stream).await;
        assert_eq!(info["kind"], "info");
        write_frame(
            &mut stream,
            &json!({
                "kind": "server_info",
                "transaction": info["transaction"],
                "name": "gateway",
                "version": 12
            }),
        )
        .await;
        let keepalive = read_request(&mut stream).await;
        assert_eq!(keepalive["kind"], "keepalive");
        assert_eq!(keepalive["session_id"], 42);
        write_frame(
            &mut stream,
            &json!({ "kind": "ack", "transaction": keepalive["transaction"] }),
        )
        .await;
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 2000))
        .await
        .expect("connect");
    let info = client.server_info().await.expect("info");
    assert_eq!(info["name"], "gateway");
    assert_eq!(info["version"], 12);
    client.keepalive(42).await.expect("keepalive");
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn undecodable_reply_is_fatal_for_the_call() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let _request = read_request(&mut stream).await;
        stream
            .get_mut()
            .write_all(b"{not json\n")
            .await
            .expect("write garbage");
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 2000))
        .await
        .expect("connect");
    let outcome = client.send("create", Map::new()).await;
    assert!(matches!(outcome, Err(ClientError::Decode(_))));
    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() {
    // Bind and drop to get a port nothing listens on.
    let (listener, endpoint) = bind().await;
    drop(listener);

    let outcome = GatewayClient::connect(&config_for(&endpoint, 2000)).await;
    assert!(matches!(outcome, Err(ClientError::Connection(_))));
}

#[tokio::test]
async fn hangup_mid_exchange_is_a_connection_error() {
    let (listener, endpoint) = bind().await;
    let gateway = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        let _request = read_request(&mut stream).await;
        // Drop without answering.
    });

    let client = GatewayClient::connect(&config_for(&endpoint, 2000))
        .await
        .expect("connect");
    let outcome = client.send("create", Map::new()).await;
    assert!(matches!(outcome, Err(ClientError::Connection(_))));
    gateway.await.expect("gateway task");
}
