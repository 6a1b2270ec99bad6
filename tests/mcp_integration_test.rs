//! MCP Wire Integration Tests
//!
//! These tests spawn the `mcp-wire` binary and talk JSON-RPC to it over stdio,
//! both with a hand-rolled line client and through the library's own
//! `StdioTransport` + `ClientSession`.

#![allow(deprecated)] // Allow deprecated cargo_bin for now

use assert_cmd::cargo::CommandCargoExt;
use assert_cmd::Command as AssertCommand;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mcp_wire_rs::mcp::client::{ClientOptions, ClientSession};
use mcp_wire_rs::mcp::protocol::{Implementation, MCP_VERSION};
use mcp_wire_rs::mcp::session::SessionState;
use mcp_wire_rs::mcp::transport::{CommandSpec, StdioTransport};

/// Line client driving the server binary over its stdin/stdout.
struct LineClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    request_id: i64,
}

impl LineClient {
    fn spawn() -> Result<Self, Box<dyn std::error::Error>> {
        let mut child = Command::cargo_bin("mcp-wire")?
            .arg("--transport")
            .arg("stdio")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().ok_or("Failed to get stdin")?;
        let stdout = BufReader::new(child.stdout.take().ok_or("Failed to get stdout")?);

        Ok(Self {
            child,
            stdin,
            stdout,
            request_id: 0,
        })
    }

    fn send(&mut self, message: &Value) -> Result<(), Box<dyn std::error::Error>> {
        writeln!(self.stdin, "{}", serde_json::to_string(message)?)?;
        self.stdin.flush()?;
        Ok(())
    }

    fn read(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        let mut line = String::new();
        self.stdout.read_line(&mut line)?;
        Ok(serde_json::from_str(&line)?)
    }

    fn request(&mut self, method: &str, params: Value) -> Result<Value, Box<dyn std::error::Error>> {
        self.request_id += 1;
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": self.request_id,
            "method": method,
            "params": params
        }))?;
        self.read()
    }

    fn initialize(&mut self, version: &str) -> Result<Value, Box<dyn std::error::Error>> {
        let response = self.request(
            "initialize",
            json!({
                "protocolVersion": version,
                "capabilities": { "roots": { "listChanged": true } },
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }),
        )?;
        self.send(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))?;
        Ok(response)
    }
}

impl Drop for LineClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[test]
fn test_binary_help() {
    AssertCommand::cargo_bin("mcp-wire")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MCP server"))
        .stdout(predicate::str::contains("--transport"));
}

#[test]
fn test_binary_version() {
    AssertCommand::cargo_bin("mcp-wire")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mcp-wire"));
}

#[test]
fn test_binary_rejects_unknown_transport() {
    AssertCommand::cargo_bin("mcp-wire")
        .unwrap()
        .args(["--transport", "carrier-pigeon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("carrier-pigeon"));
}

#[test]
fn test_stdio_handshake_and_echo() {
    let mut client = LineClient::spawn().expect("Failed to spawn server");

    let response = client.initialize("2024-11-05").expect("Failed to initialize");
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "mcp-wire");
    assert!(result["capabilities"].get("logging").is_some());
    assert!(result.get("instructions").is_some());

    let echoed = client
        .request("echo", json!({ "text": "hello" }))
        .expect("echo failed");
    assert_eq!(echoed["result"], json!({ "text": "hello" }));

    let missing = client.request("nope", json!({})).expect("request failed");
    assert_eq!(missing["error"]["code"], -32601);
}

#[test]
fn test_stdio_unsupported_version_gets_latest() {
    let mut client = LineClient::spawn().expect("Failed to spawn server");
    let response = client.initialize("1999-01-01").expect("Failed to initialize");
    assert_eq!(response["result"]["protocolVersion"], MCP_VERSION);
}

#[test]
fn test_stdio_requests_before_initialize_are_rejected() {
    let mut client = LineClient::spawn().expect("Failed to spawn server");

    let ping = client.request("ping", json!({})).expect("ping failed");
    assert_eq!(ping["result"], json!({}));

    let echo = client.request("echo", json!({})).expect("echo failed");
    assert_eq!(echo["error"]["code"], -32600);
}

#[test]
fn test_stdio_malformed_line_is_skipped() {
    let mut client = LineClient::spawn().expect("Failed to spawn server");
    writeln!(client.stdin, "this is not json").unwrap();
    client.stdin.flush().unwrap();

    let response = client.initialize(MCP_VERSION).expect("Failed to initialize");
    assert_eq!(response["id"], 1);
    assert!(response.get("result").is_some());
}

#[tokio::test]
async fn test_client_session_over_spawned_binary() {
    let program = assert_cmd::cargo::cargo_bin("mcp-wire");
    let spec = CommandSpec::new(program.to_string_lossy())
        .arg("--transport")
        .arg("stdio")
        .env("RUST_LOG", "error");
    let transport = Arc::new(StdioTransport::spawn(spec));
    let client = ClientSession::new(
        transport,
        ClientOptions::new(Implementation::new("integration", "1.0.0")),
    );
    let cancel = CancellationToken::new();

    let init = client.connect(&cancel).await.expect("connect failed");
    assert_eq!(init.protocol_version, MCP_VERSION);
    assert_eq!(init.server_info.name, "mcp-wire");
    assert_eq!(client.state(), SessionState::Ready);

    client.ping(&cancel).await.expect("ping failed");
    let echoed = client
        .request("echo", Some(json!([1, 2, 3])), &cancel)
        .await
        .expect("echo failed");
    assert_eq!(echoed, json!([1, 2, 3]));

    client.disconnect(&cancel).await.expect("disconnect failed");
    assert_eq!(client.state(), SessionState::Disconnected);
}
