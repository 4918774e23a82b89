use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Failures of a host interaction.
///
/// A timeout means the host is reachable but slow; a rejection means the host
/// answered with an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    #[error("host call `{method}` timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("host rejected `{method}`: {message}")]
    Rejected { method: String, message: String },
    #[error("host connection closed")]
    Disconnected,
    #[error("malformed host payload for `{method}`: {message}")]
    Decode { method: String, message: String },
}

pub type HostResult<T> = Result<T, HostError>;

/// Bidirectional RPC channel to the editor process.
#[tower_lsp::async_trait]
pub trait HostConnection: Send + Sync {
    /// Issue a request and wait for the host's answer.
    async fn call(&self, method: &str, args: Vec<Value>) -> HostResult<Value>;

    /// Send a notification; the host never answers.
    async fn notify(&self, method: &str, args: Vec<Value>) -> HostResult<()>;
}

/// Deserialize a host reply into a typed value.
pub fn decode<T: DeserializeOwned>(method: &str, value: Value) -> HostResult<T> {
    serde_json::from_value(value).map_err(|e| HostError::Decode {
        method: method.to_string(),
        message: e.to_string(),
    })
}

/// Call the host with an optional local timeout.
///
/// The request runs on its own task: when the timeout fires, or the caller
/// stops polling, the host-side call still runs to completion and its late
/// answer is discarded.
pub async fn call_with_timeout(
    host: Arc<dyn HostConnection>,
    method: &str,
    args: Vec<Value>,
    timeout: Option<Duration>,
) -> HostResult<Value> {
    let name = method.to_string();
    let task = tokio::spawn({
        let name = name.clone();
        async move { host.call(&name, args).await }
    });

    let joined = match timeout {
        Some(after) => match tokio::time::timeout(after, task).await {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!("Host call '{}' timed out after {:?}", name, after);
                return Err(HostError::Timeout { method: name, after });
            }
        },
        None => task.await,
    };

    joined.map_err(|e| HostError::Rejected {
        method: name,
        message: format!("call task failed: {}", e),
    })?
}

/// Callback flavor of [`HostConnection::call`] for callers without an async
/// context. The callback runs on the runtime once the host answers.
pub fn call_with_callback<F>(
    host: Arc<dyn HostConnection>,
    method: impl Into<String>,
    args: Vec<Value>,
    callback: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnOnce(HostResult<Value>) + Send + 'static,
{
    let method = method.into();
    tokio::spawn(async move {
        let result = host.call(&method, args).await;
        callback(result);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use serde_json::json;

    #[tokio::test]
    async fn test_timeout_is_distinct_from_rejection() {
        let host = Arc::new(MemoryHost::new());
        host.reply_after("slow", Duration::from_millis(200), json!(1));
        host.reject("broken", "no such command");

        let slow = call_with_timeout(
            host.clone(),
            "slow",
            vec![],
            Some(Duration::from_millis(20)),
        )
        .await;
        assert!(matches!(slow, Err(HostError::Timeout { .. })));

        let broken = call_with_timeout(host.clone(), "broken", vec![], None).await;
        assert!(matches!(broken, Err(HostError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_timed_out_call_still_reaches_host() {
        let host = Arc::new(MemoryHost::new());
        host.reply_after("slow", Duration::from_millis(50), json!("done"));

        let result = call_with_timeout(
            host.clone(),
            "slow",
            vec![json!(1)],
            Some(Duration::from_millis(5)),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(host.completed("slow"), 1);
    }

    #[tokio::test]
    async fn test_callback_variant_receives_result() {
        let host = Arc::new(MemoryHost::new());
        host.reply("answer", json!(42));

        let (tx, rx) = tokio::sync::oneshot::channel();
        call_with_callback(host, "answer", vec![], move |result| {
            let _ = tx.send(result);
        });

        assert_eq!(rx.await.unwrap(), Ok(json!(42)));
    }

    #[test]
    fn test_decode_reports_method() {
        let err = decode::<u32>("get_env", json!("nope")).unwrap_err();
        assert!(matches!(err, HostError::Decode { ref method, .. } if method == "get_env"));
    }
}
