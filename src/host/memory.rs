//! In-process host used by tests and headless embedders.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use super::connection::{HostConnection, HostError, HostResult};
use crate::util::lock;

/// Scripted answer for one method.
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Value),
    Reject(String),
    Delayed(Duration, Box<Reply>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Request,
    Notification,
}

/// One recorded interaction, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub method: String,
    pub args: Vec<Value>,
}

/// Host that answers from a script and records every call.
///
/// Unscripted requests answer `null`.
#[derive(Debug, Default)]
pub struct MemoryHost {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
    completed: Mutex<HashMap<String, usize>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, method: &str, value: Value) {
        self.script(method, Reply::Value(value));
    }

    pub fn reject(&self, method: &str, message: &str) {
        self.script(method, Reply::Reject(message.to_string()));
    }

    pub fn reply_after(&self, method: &str, delay: Duration, value: Value) {
        self.script(method, Reply::Delayed(delay, Box::new(Reply::Value(value))));
    }

    pub fn script(&self, method: &str, reply: Reply) {
        lock(&self.replies).insert(method.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Method names in call order.
    pub fn methods(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.method.clone()).collect()
    }

    /// Arguments of every call (request or notification) to `method`.
    pub fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.method == method)
            .map(|c| c.args.clone())
            .collect()
    }

    /// Number of requests to `method` that ran to completion.
    pub fn completed(&self, method: &str) -> usize {
        lock(&self.completed).get(method).copied().unwrap_or(0)
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, kind: CallKind, method: &str, args: Vec<Value>) {
        lock(&self.calls).push(RecordedCall {
            kind,
            method: method.to_string(),
            args,
        });
    }

    async fn resolve(&self, method: &str) -> HostResult<Value> {
        let mut reply = lock(&self.replies).get(method).cloned();
        loop {
            match reply {
                None => return Ok(Value::Null),
                Some(Reply::Value(value)) => return Ok(value),
                Some(Reply::Reject(message)) => {
                    return Err(HostError::Rejected {
                        method: method.to_string(),
                        message,
                    });
                }
                Some(Reply::Delayed(delay, next)) => {
                    tokio::time::sleep(delay).await;
                    reply = Some(*next);
                }
            }
        }
    }
}

#[tower_lsp::async_trait]
impl HostConnection for MemoryHost {
    async fn call(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        self.record(CallKind::Request, method, args);
        let result = self.resolve(method).await;
        *lock(&self.completed).entry(method.to_string()).or_default() += 1;
        result
    }

    async fn notify(&self, method: &str, args: Vec<Value>) -> HostResult<()> {
        self.record(CallKind::Notification, method, args);
        self.resolve(method).await.map(|_| ())
    }
}
