//! Terminal-backed collaborators: tasks and terminal sessions.
//!
//! Processes live in the host; these types only speak the host contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::BufferId;
use crate::event::{Emitter, Event};
use crate::host::{decode, HostConnection};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pty: bool,
}

/// Host process bound to an identifier
pub struct Task {
    id: String,
    host: Arc<dyn HostConnection>,
    running: AtomicBool,
    on_stdout: Emitter<Vec<String>>,
    on_stderr: Emitter<Vec<String>>,
    on_exit: Emitter<i32>,
}

impl Task {
    pub const START: &'static str = "task_start";
    pub const STOP: &'static str = "task_stop";
    pub const RUNNING: &'static str = "task_running";

    pub fn new(id: &str, host: Arc<dyn HostConnection>) -> Self {
        Self {
            id: id.to_string(),
            host,
            running: AtomicBool::new(false),
            on_stdout: Emitter::new(),
            on_stderr: Emitter::new(),
            on_exit: Emitter::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn on_stdout(&self) -> Event<Vec<String>> {
        self.on_stdout.event()
    }

    pub fn on_stderr(&self) -> Event<Vec<String>> {
        self.on_stderr.event()
    }

    pub fn on_exit(&self) -> Event<i32> {
        self.on_exit.event()
    }

    /// Start the process; returns whether the host started it.
    pub async fn start(&self, options: &TaskOptions) -> Result<bool> {
        let reply = self
            .host
            .call(Self::START, vec![json!(self.id), json!(options)])
            .await?;
        let started: bool = decode(Self::START, reply)?;
        self.running.store(started, Ordering::SeqCst);
        Ok(started)
    }

    pub async fn stop(&self) -> Result<()> {
        self.host.call(Self::STOP, vec![json!(self.id)]).await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Ask the host whether the process is still alive.
    pub async fn running(&self) -> Result<bool> {
        let reply = self.host.call(Self::RUNNING, vec![json!(self.id)]).await?;
        let running: bool = decode(Self::RUNNING, reply)?;
        self.running.store(running, Ordering::SeqCst);
        Ok(running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply a `task_stdout` / `task_stderr` / `task_exit` notification
    /// addressed to this task. Returns whether it was consumed.
    pub fn handle_notification(&self, method: &str, params: &[Value]) -> bool {
        if params.first().and_then(Value::as_str) != Some(self.id.as_str()) {
            return false;
        }
        let payload = params.get(1).cloned().unwrap_or(Value::Null);
        match method {
            "task_stdout" | "task_stderr" => {
                let lines: Vec<String> = serde_json::from_value(payload).unwrap_or_default();
                if method == "task_stdout" {
                    self.on_stdout.fire(&lines);
                } else {
                    self.on_stderr.fire(&lines);
                }
            }
            "task_exit" => {
                self.running.store(false, Ordering::SeqCst);
                let code = i32::try_from(payload.as_i64().unwrap_or(-1)).unwrap_or(-1);
                self.on_exit.fire(&code);
            }
            _ => return false,
        }
        true
    }

    pub fn dispose(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            super::spawn_notify(self.host.clone(), Self::STOP, vec![json!(self.id)]);
        }
        self.on_stdout.clear();
        self.on_stderr.clear();
        self.on_exit.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOptions {
    pub name: Option<String>,
    pub shell_path: Option<String>,
    pub shell_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TerminalCreated {
    bufnr: BufferId,
    #[serde(default)]
    name: Option<String>,
}

/// Terminal buffer living in the host
pub struct TerminalSession {
    bufnr: BufferId,
    name: String,
    host: Arc<dyn HostConnection>,
    disposed: AtomicBool,
}

impl TerminalSession {
    pub const CREATE: &'static str = "terminal_create";
    pub const SEND: &'static str = "terminal_send";
    pub const SHOW: &'static str = "terminal_show";
    pub const HIDE: &'static str = "terminal_hide";
    pub const DISPOSE: &'static str = "terminal_dispose";

    pub async fn create(host: Arc<dyn HostConnection>, options: &TerminalOptions) -> Result<Self> {
        let reply = host.call(Self::CREATE, vec![json!(options)]).await?;
        let created: TerminalCreated = decode(Self::CREATE, reply)?;
        let name = created
            .name
            .or_else(|| options.name.clone())
            .unwrap_or_else(|| format!("terminal-{}", created.bufnr));
        Ok(Self {
            bufnr: created.bufnr,
            name,
            host,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn bufnr(&self) -> BufferId {
        self.bufnr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send_text(&self, text: &str, add_newline: bool) -> Result<()> {
        self.ensure_alive()?;
        self.host
            .notify(Self::SEND, vec![json!(self.bufnr), json!(text), json!(add_newline)])
            .await?;
        Ok(())
    }

    /// Show the terminal window; returns whether the host displayed it.
    pub async fn show(&self, preserve_focus: bool) -> Result<bool> {
        self.ensure_alive()?;
        let reply = self
            .host
            .call(Self::SHOW, vec![json!(self.bufnr), json!(preserve_focus)])
            .await?;
        Ok(reply.as_bool().unwrap_or(false))
    }

    pub async fn hide(&self) -> Result<()> {
        self.ensure_alive()?;
        self.host.notify(Self::HIDE, vec![json!(self.bufnr)]).await?;
        Ok(())
    }

    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.host.notify(Self::DISPOSE, vec![json!(self.bufnr)]).await?;
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(anyhow!("terminal {} is disposed", self.bufnr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_task_lifecycle_follows_host() {
        let host = Arc::new(MemoryHost::new());
        host.reply(Task::START, json!(true));
        let task = Task::new("build", host.clone());
        let output = Arc::new(Mutex::new(Vec::new()));
        let sink = output.clone();
        let _out = task
            .on_stdout()
            .subscribe(move |lines| sink.lock().unwrap().extend(lines.clone()));

        let options = TaskOptions {
            cmd: "cargo".to_string(),
            args: vec!["build".to_string()],
            ..Default::default()
        };
        assert!(task.start(&options).await.unwrap());
        assert!(task.is_running());

        assert!(task.handle_notification("task_stdout", &[json!("build"), json!(["Compiling"])]));
        assert!(!task.handle_notification("task_stdout", &[json!("other"), json!(["x"])]));
        assert!(task.handle_notification("task_exit", &[json!("build"), json!(0)]));

        assert!(!task.is_running());
        assert_eq!(*output.lock().unwrap(), vec!["Compiling".to_string()]);
        assert_eq!(host.calls_to(Task::START)[0][1]["cmd"], json!("cargo"));
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_use_after_dispose() {
        let host = Arc::new(MemoryHost::new());
        host.reply(TerminalSession::CREATE, json!({"bufnr": 12}));
        let terminal = TerminalSession::create(
            host.clone(),
            &TerminalOptions {
                name: Some("repl".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(terminal.bufnr(), 12);
        assert_eq!(terminal.name(), "repl");
        terminal.send_text("ls", true).await.unwrap();
        terminal.dispose().await.unwrap();
        terminal.dispose().await.unwrap();

        assert!(terminal.send_text("ls", true).await.is_err());
        assert_eq!(host.calls_to(TerminalSession::DISPOSE).len(), 1);
    }
}
