//! JSON-RPC 2.0 host connection over `Content-Length` framed streams.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use super::connection::{HostConnection, HostError, HostResult};
use crate::util::lock;

/// Largest frame body accepted from the host
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<HostResult<Value>>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Traffic initiated by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    Notification {
        method: String,
        params: Vec<Value>,
    },
    Request {
        id: Value,
        method: String,
        params: Vec<Value>,
    },
}

/// Host connection speaking framed JSON-RPC over a reader/writer pair.
pub struct StdioHost {
    writer: tokio::sync::Mutex<Writer>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl StdioHost {
    /// Start the connection. Host-initiated messages arrive on the returned
    /// receiver, which closes when the input stream ends.
    pub fn new<R, W>(reader: R, writer: W) -> (Arc<Self>, mpsc::UnboundedReceiver<HostMessage>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
        });

        let pending = host.pending.clone();
        let closed = host.closed.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(body)) => route(body, &pending, &tx),
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read host message: {}", e);
                        break;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            let drained: Vec<_> = lock(&pending).drain().collect();
            for (_, waiter) in drained {
                let _ = waiter.send(Err(HostError::Disconnected));
            }
            log::debug!("Host input stream closed");
        });

        (host, rx)
    }

    /// Answer a host-initiated request.
    pub async fn respond(&self, id: Value, result: Result<Value, String>) -> HostResult<()> {
        let message = match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32603, "message": message}
            }),
        };
        self.send(&message).await
    }

    async fn send(&self, message: &Value) -> HostResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::Disconnected);
        }
        let body = message.to_string();
        let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);

        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|_| HostError::Disconnected)?;
        writer.flush().await.map_err(|_| HostError::Disconnected)
    }
}

#[tower_lsp::async_trait]
impl HostConnection for StdioHost {
    async fn call(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            lock(&self.pending).remove(&id);
            return Err(HostError::Disconnected);
        }

        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": args});
        if let Err(e) = self.send(&request).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(HostError::Rejected { message, .. })) => Err(HostError::Rejected {
                method: method.to_string(),
                message,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HostError::Disconnected),
        }
    }

    async fn notify(&self, method: &str, args: Vec<Value>) -> HostResult<()> {
        self.send(&json!({"jsonrpc": "2.0", "method": method, "params": args}))
            .await
    }
}

async fn read_frame<R>(reader: &mut BufReader<R>) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            let length = value.trim().parse::<usize>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid Content-Length {:?}: {}", value.trim(), e),
                )
            })?;
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "frame without Content-Length")
    })?;
    if length > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the {} byte limit", length, MAX_FRAME_LEN),
        ));
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn route(body: Vec<u8>, pending: &Pending, tx: &mpsc::UnboundedSender<HostMessage>) {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping malformed host message: {}", e);
            return;
        }
    };

    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").cloned();

    match (method, id) {
        (Some(method), Some(id)) => {
            let _ = tx.send(HostMessage::Request {
                id,
                method: method.to_string(),
                params: params_of(&message),
            });
        }
        (Some(method), None) => {
            let _ = tx.send(HostMessage::Notification {
                method: method.to_string(),
                params: params_of(&message),
            });
        }
        (None, Some(id)) => {
            let Some(id) = id.as_u64() else {
                log::warn!("Dropping response with non-numeric id {}", id);
                return;
            };
            let Some(waiter) = lock(pending).remove(&id) else {
                log::debug!("Discarding late response for request {}", id);
                return;
            };
            let result = match message.get("error") {
                Some(error) => Err(HostError::Rejected {
                    method: String::new(),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                }),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = waiter.send(result);
        }
        (None, None) => log::warn!("Dropping host message without method or id"),
    }
}

fn params_of(message: &Value) -> Vec<Value> {
    match message.get("params") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn read_message(stream: &mut BufReader<DuplexStream>) -> Value {
        let body = read_frame(stream).await.unwrap().unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn write_message(stream: &mut DuplexStream, message: Value) {
        let body = message.to_string();
        let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        stream.write_all(frame.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_round_trip_and_rejection() {
        let (host_out, ours_in) = duplex(4096);
        let (ours_out, host_in) = duplex(4096);
        let (host, _messages) = StdioHost::new(ours_in, ours_out);
        let mut host_in = BufReader::new(host_in);
        let mut host_out = host_out;

        let caller = {
            let host = host.clone();
            tokio::spawn(async move { host.call("eval", vec![json!("1+1")]).await })
        };
        let request = read_message(&mut host_in).await;
        assert_eq!(request["method"], "eval");
        write_message(
            &mut host_out,
            json!({"jsonrpc": "2.0", "id": request["id"], "result": 2}),
        )
        .await;
        assert_eq!(caller.await.unwrap(), Ok(json!(2)));

        let caller = {
            let host = host.clone();
            tokio::spawn(async move { host.call("boom", vec![]).await })
        };
        let request = read_message(&mut host_in).await;
        write_message(
            &mut host_out,
            json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": 1, "message": "nope"}}),
        )
        .await;
        assert_eq!(
            caller.await.unwrap(),
            Err(HostError::Rejected {
                method: "boom".to_string(),
                message: "nope".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_notifications_are_delivered_and_eof_disconnects() {
        let (host_out, ours_in) = duplex(4096);
        let (ours_out, _host_in) = duplex(4096);
        let (host, mut messages) = StdioHost::new(ours_in, ours_out);
        let mut host_out = host_out;

        write_message(
            &mut host_out,
            json!({"jsonrpc": "2.0", "method": "buffer_close", "params": [3]}),
        )
        .await;
        assert_eq!(
            messages.recv().await,
            Some(HostMessage::Notification {
                method: "buffer_close".to_string(),
                params: vec![json!(3)]
            })
        );

        drop(host_out);
        assert_eq!(messages.recv().await, None);
        assert_eq!(host.call("eval", vec![]).await, Err(HostError::Disconnected));
    }

    /// Start a call and wait until its request reaches the host side.
    async fn pending_call(
        host: &Arc<StdioHost>,
        host_in: &mut BufReader<DuplexStream>,
    ) -> tokio::task::JoinHandle<HostResult<Value>> {
        let caller = {
            let host = host.clone();
            tokio::spawn(async move { host.call("eval", vec![]).await })
        };
        read_message(host_in).await;
        caller
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects_pending_calls() {
        let (mut host_out, ours_in) = duplex(4096);
        let (ours_out, host_in) = duplex(4096);
        let (host, mut messages) = StdioHost::new(ours_in, ours_out);
        let mut host_in = BufReader::new(host_in);

        let caller = pending_call(&host, &mut host_in).await;
        host_out
            .write_all(b"Content-Length: 18446744073709551615\r\n\r\n{}")
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap(), Err(HostError::Disconnected));
        assert_eq!(messages.recv().await, None);
        assert_eq!(host.call("eval", vec![]).await, Err(HostError::Disconnected));
    }

    #[tokio::test]
    async fn test_frame_without_length_disconnects() {
        let (mut host_out, ours_in) = duplex(4096);
        let (ours_out, host_in) = duplex(4096);
        let (host, mut messages) = StdioHost::new(ours_in, ours_out);
        let mut host_in = BufReader::new(host_in);

        let caller = pending_call(&host, &mut host_in).await;
        host_out
            .write_all(b"Content-Type: application/json\r\n\r\n{}")
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap(), Err(HostError::Disconnected));
        assert_eq!(messages.recv().await, None);
    }
}
