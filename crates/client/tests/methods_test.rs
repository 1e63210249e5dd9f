//! The client's methods as seen from a connected server.

use std::collections::BTreeMap;
use std::sync::Arc;

use launchpad_rpc::transport::memory;
use launchpad_rpc::{
    Connection, ConnectionConfig, Error, ExceptionKind, MethodTable, Params, Session, Value,
    WireFormat,
};

/// Connect a bare server session to a client session serving the client methods.
fn connect(format: WireFormat) -> Arc<Session> {
    let config = ConnectionConfig {
        outbound_format: format,
        ..ConnectionConfig::default()
    };
    let (client_side, server_side) = memory::pair();

    let server = Session::new(MethodTable::new());
    let mut server_conn = Connection::new(Arc::clone(&server), config.clone());
    server_conn.accept(server_side).unwrap();

    let client = Session::new(launchpad_client::methods());
    let mut client_conn = Connection::new(client, config);
    client_conn.accept(client_side).unwrap();

    tokio::spawn(async move {
        let _ = server_conn.run().await;
        server_conn.close().await;
    });
    tokio::spawn(async move {
        let _ = client_conn.run().await;
        client_conn.close().await;
    });

    server
}

fn entries(value: &Value) -> BTreeMap<String, Value> {
    value
        .as_map()
        .expect("expected a map")
        .iter()
        .map(|(k, v)| (k.as_text().expect("text key").to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_enumerate_directory() {
    for format in [WireFormat::Binary, WireFormat::Text] {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"ccc").unwrap();

        let server = connect(format);
        let listing = server
            .remote("fs")
            .call(
                "enumerate_directory",
                [Value::Text(dir.path().to_str().unwrap().to_string())],
            )
            .await
            .unwrap();

        let listing = entries(&listing);
        assert_eq!(
            listing.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["a.txt", "b.txt", "c.txt"]
        );

        for (name, size) in [("a.txt", 1), ("b.txt", 2), ("c.txt", 3)] {
            let stat = entries(&listing[name]);
            assert_eq!(stat["st_size"], Value::Integer(size.into()));
            assert_eq!(stat["st_isdir"], Value::Bool(false));
            assert!(stat["st_mode"].is_integer());
            assert!(stat["st_mtime"].is_float());
        }
    }
}

#[tokio::test]
async fn test_enumerate_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing").to_str().unwrap().to_string();

    let server = connect(WireFormat::Binary);
    let err = server
        .call("fs.enumerate_directory", [Value::Text(missing.clone())])
        .await
        .unwrap_err();

    let Error::Remote(exception) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(exception.kind(), ExceptionKind::IoError);
    assert_eq!(exception.attribute("filename"), Some(&Value::Text(missing)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_shell_command_with_named_params() {
    let server = connect(WireFormat::Text);
    let params = Params::Named(BTreeMap::from([
        (
            "shell_command".to_string(),
            Value::Text("echo launched".to_string()),
        ),
        ("current_dir".to_string(), Value::Text("/".to_string())),
    ]));

    let output = server
        .remote("shell")
        .call("run_shell_command", params)
        .await
        .unwrap();
    assert_eq!(output, Value::Text("launched\n".to_string()));
}

#[tokio::test]
async fn test_missing_argument() {
    let server = connect(WireFormat::Binary);
    let err = server
        .call("shell.run_shell_command", Params::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(e) if e.kind() == ExceptionKind::InvalidParams));
}

#[tokio::test]
async fn test_ping() {
    let server = connect(WireFormat::Binary);
    let pong = server.remote("client").call("ping", Params::none()).await.unwrap();
    assert_eq!(pong, Value::Text("pong".to_string()));
}
