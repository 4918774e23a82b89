use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

const SERVER_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Plays the editor side of the connection against the real binary.
#[test]
fn handshake_smoke() {
    let home = tempfile::tempdir().expect("tempdir");
    let mut server = spawn_server(home.path());
    let mut reader = BufReader::new(server.stdout.take().expect("Child stdout should be available"));

    // The runtime asks for the env snapshot first
    let env_request = read_until_request(&mut reader, "get_env");
    send_message(
        &mut server,
        &json!({
            "jsonrpc": "2.0",
            "id": env_request["id"],
            "result": {
                "apiVersion": 8,
                "workspaceFolders": [],
                "config": {"fileSystemWatch": {"enable": false}},
                "extensionRoot": home.path().join("extensions")
            }
        }),
    );

    // Bulk buffer discovery is the last handshake step
    let list_request = read_until_request(&mut reader, "list_buffers");
    send_message(
        &mut server,
        &json!({"jsonrpc": "2.0", "id": list_request["id"], "result": []}),
    );

    // Requests addressed to the runtime are answered on the same stream
    send_message(
        &mut server,
        &json!({
            "jsonrpc": "2.0",
            "id": "host-1",
            "method": "provide_content",
            "params": ["nowhere://document"]
        }),
    );
    let answer = read_until(&mut reader, |message| message["id"] == json!("host-1"));
    let error = answer["error"]["message"].as_str().unwrap_or_default();
    assert!(error.contains("nowhere"), "unexpected error: {}", error);

    shutdown_server(server);
}

fn spawn_server(home: &std::path::Path) -> Child {
    let bin_path = std::env::var("CARGO_BIN_EXE_editor-workspace")
        .unwrap_or_else(|_| "target/debug/editor-workspace".to_string());

    Command::new(bin_path)
        .arg("--config-home")
        .arg(home)
        .arg("--log-level")
        .arg("warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn workspace runtime")
}

fn send_message(child: &mut Child, message: &Value) {
    let body = message.to_string();
    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);

    let stdin = child.stdin.as_mut().expect("Child stdin should be available");
    stdin.write_all(frame.as_bytes()).expect("Failed to write message");
    stdin.flush().expect("Failed to flush stdin");
}

fn read_until_request(reader: &mut BufReader<ChildStdout>, method: &str) -> Value {
    read_until(reader, |message| {
        message["method"] == json!(method) && message.get("id").is_some()
    })
}

/// Read frames until one matches, skipping notifications along the way.
fn read_until(reader: &mut BufReader<ChildStdout>, matches: impl Fn(&Value) -> bool) -> Value {
    let start_time = Instant::now();
    loop {
        if start_time.elapsed() > SERVER_TIMEOUT {
            panic!("Timeout waiting for expected message");
        }
        let message = read_message(reader);
        if matches(&message) {
            return message;
        }
    }
}

fn read_message(reader: &mut BufReader<ChildStdout>) -> Value {
    let mut content_length = None;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => panic!("Unexpected EOF while reading headers"),
            Ok(_) => {
                if line.trim().is_empty() {
                    if content_length.is_some() {
                        break;
                    }
                    continue;
                }
                if let Some(length) = line.strip_prefix("Content-Length:") {
                    content_length = Some(
                        length
                            .trim()
                            .parse::<usize>()
                            .expect("Invalid Content-Length header"),
                    );
                }
            }
            Err(e) => panic!("Error reading headers: {}", e),
        }
    }

    let mut body = vec![0u8; content_length.expect("Missing Content-Length header")];
    reader.read_exact(&mut body).expect("Failed to read message body");
    serde_json::from_slice(&body).expect("Message body should be valid JSON")
}

fn shutdown_server(mut child: Child) {
    // Closing stdin is the host going away
    drop(child.stdin.take());
    std::thread::sleep(SHUTDOWN_GRACE_PERIOD);

    match child.try_wait() {
        Ok(Some(status)) => assert!(status.success(), "Runtime exited with {:?}", status),
        Ok(None) => {
            eprintln!("Runtime didn't exit gracefully, forcing termination");
            let _ = child.kill();
            let _ = child.wait();
        }
        Err(e) => panic!("Error checking runtime status: {}", e),
    }
}
