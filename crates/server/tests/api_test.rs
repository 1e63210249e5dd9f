//! Control API driven over HTTP against a real client connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use launchpad_rpc::{
    Connection, ConnectionConfig, DriverExit, ReconnectDriver, RetryPolicy, Session,
};
use launchpad_server::{LaunchpadServer, ServerConfig};
use launchpad_transport_ws::WebSocketConnector;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

async fn start_server() -> (LaunchpadServer, SocketAddr) {
    let server = LaunchpadServer::new(ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ServerConfig::default()
    });
    let addr = server.start().await.expect("Failed to start server");
    (server, addr)
}

fn start_client(addr: SocketAddr, client_id: &str) -> (CancellationToken, JoinHandle<DriverExit>) {
    let address = Url::parse(&format!("ws://{addr}/transport/ws/{client_id}")).unwrap();
    let driver = ReconnectDriver::new(
        address,
        Arc::new(WebSocketConnector::new()),
        Session::new(launchpad_client::methods()),
    )
    .with_policy(RetryPolicy::constant(Duration::from_millis(100)));

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    (shutdown, tokio::spawn(async move { driver.run(token).await }))
}

async fn clients(http: &reqwest::Client, addr: SocketAddr) -> Vec<String> {
    http.get(format!("http://{addr}/clients"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_clients(http: &reqwest::Client, addr: SocketAddr, expected: &[&str]) {
    for _ in 0..100 {
        if clients(http, addr).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("clients never became {expected:?}");
}

async fn call(
    http: &reqwest::Client,
    addr: SocketAddr,
    client_id: &str,
    body: Value,
) -> (StatusCode, Value) {
    let response = http
        .post(format!("http://{addr}/clients/{client_id}/call"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_call_connected_client() {
    let _ = tracing_subscriber::fmt::try_init();
    let (server, addr) = start_server().await;
    let (shutdown, driver) = start_client(addr, "alpha");
    let http = reqwest::Client::new();

    wait_for_clients(&http, addr, &["alpha"]).await;

    let (status, body) = call(&http, addr, "alpha", json!({ "method": "client.ping" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "result": "pong" }));

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one"), b"1").unwrap();
    std::fs::write(dir.path().join("two"), b"22").unwrap();
    std::fs::write(dir.path().join("three"), b"333").unwrap();

    let (status, body) = call(
        &http,
        addr,
        "alpha",
        json!({
            "method": "fs.enumerate_directory",
            "params": { "dir_path": dir.path() },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let listing = body["result"].as_object().unwrap();
    assert_eq!(listing.len(), 3);
    assert_eq!(listing["three"]["st_size"], json!(3));
    assert_eq!(listing["one"]["st_isdir"], json!(false));

    shutdown.cancel();
    assert_eq!(driver.await.unwrap(), DriverExit::Shutdown);
    wait_for_clients(&http, addr, &[]).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_error_statuses() {
    let _ = tracing_subscriber::fmt::try_init();
    let (server, addr) = start_server().await;
    let (shutdown, _driver) = start_client(addr, "beta");
    let http = reqwest::Client::new();

    wait_for_clients(&http, addr, &["beta"]).await;

    let (status, _) = call(&http, addr, "nobody", json!({ "method": "client.ping" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &http,
        addr,
        "beta",
        json!({ "method": "fs.enumerate_directory", "params": ["/definitely/not/here"] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["type"], json!("IoError"));
    assert_eq!(
        body["error"]["attributes"]["filename"],
        json!("/definitely/not/here")
    );

    let (status, body) = call(&http, addr, "beta", json!({ "method": "client.nothing" })).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["type"], json!("MethodNotFound"));

    let (status, _) = call(
        &http,
        addr,
        "beta",
        json!({ "method": "client.ping", "params": "not-a-list" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    shutdown.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_closes_superseded_connection() {
    let _ = tracing_subscriber::fmt::try_init();
    let (server, addr) = start_server().await;
    let http = reqwest::Client::new();
    let address = Url::parse(&format!("ws://{addr}/transport/ws/delta")).unwrap();
    let connector = WebSocketConnector::new();

    let mut first = Connection::new(
        Session::new(launchpad_client::methods()),
        ConnectionConfig::default(),
    );
    first.connect(&connector, &address).await.unwrap();
    let first_task = tokio::spawn(async move { first.run().await });
    wait_for_clients(&http, addr, &["delta"]).await;

    let mut second = Connection::new(
        Session::new(launchpad_client::methods()),
        ConnectionConfig::default(),
    );
    second.connect(&connector, &address).await.unwrap();
    let second_task = tokio::spawn(async move { second.run().await });

    tokio::time::timeout(Duration::from_secs(5), first_task)
        .await
        .expect("superseded connection stayed open")
        .unwrap()
        .unwrap();

    let (status, body) = call(&http, addr, "delta", json!({ "method": "client.ping" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "result": "pong" }));
    assert_eq!(clients(&http, addr).await, vec!["delta".to_string()]);

    second_task.abort();
    server.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_slow_call_times_out() {
    let _ = tracing_subscriber::fmt::try_init();
    let (server, addr) = start_server().await;
    let (shutdown, _driver) = start_client(addr, "gamma");
    let http = reqwest::Client::new();

    wait_for_clients(&http, addr, &["gamma"]).await;

    let (status, _) = call(
        &http,
        addr,
        "gamma",
        json!({
            "method": "shell.run_shell_command",
            "params": ["sleep 2", "/"],
            "timeout_ms": 100,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    shutdown.cancel();
    server.shutdown().await;
}
