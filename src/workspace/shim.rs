//! Forwarders for deprecated workspace-level window methods.
//!
//! Each listed method moved to the window surface unchanged. The workspace
//! keeps a dispatch table of forwarders so old callers keep working, with a
//! warning on every call.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::host::{HostConnection, HostResult};

/// Methods that used to live on the workspace and now live on `window`
pub const DEPRECATED_METHODS: &[&str] = &[
    "showMessage",
    "runTerminalCommand",
    "openTerminal",
    "showQuickpick",
    "menuPick",
    "openLocalConfig",
    "showPrompt",
    "createStatusBarItem",
    "createOutputChannel",
    "showOutputChannel",
    "requestInput",
    "echoLines",
    "getCursorPosition",
    "moveTo",
    "getOffset",
    "getSelectedRange",
    "selectRange",
    "createTerminal",
];

/// The replacement surface deprecated calls are forwarded to
#[tower_lsp::async_trait]
pub trait WindowSurface: Send + Sync {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> HostResult<Value>;
}

/// Window surface backed by the host connection; `name` is called as
/// `window.<name>`.
pub struct HostWindow {
    host: Arc<dyn HostConnection>,
}

impl HostWindow {
    pub fn new(host: Arc<dyn HostConnection>) -> Self {
        Self { host }
    }
}

#[tower_lsp::async_trait]
impl WindowSurface for HostWindow {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        self.host.call(&format!("window.{}", method), args).await
    }
}

/// Forwarding function for one deprecated method
#[derive(Clone)]
pub struct Forwarder {
    name: &'static str,
    surface: Arc<dyn WindowSurface>,
}

impl Forwarder {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Warn once for this call, then forward `args` untouched.
    ///
    /// The warning is emitted when `call` is invoked, not when the returned
    /// future is polled, so it names the real call site.
    #[track_caller]
    pub fn call(&self, args: Vec<Value>) -> impl Future<Output = HostResult<Value>> + Send + 'static {
        let caller = Location::caller();
        match stack_excerpt() {
            Some(stack) => log::warn!(
                "workspace.{} is deprecated, use window.{} instead (called from {})\n{}",
                self.name,
                self.name,
                caller,
                stack
            ),
            None => log::warn!(
                "workspace.{} is deprecated, use window.{} instead (called from {})",
                self.name,
                self.name,
                caller
            ),
        }

        let surface = self.surface.clone();
        let name = self.name;
        async move { surface.invoke(name, args).await }
    }
}

/// Name to forwarder table, built once per initialize
pub(crate) struct ShimTable {
    forwarders: HashMap<&'static str, Forwarder>,
}

impl ShimTable {
    pub(crate) fn install(surface: Arc<dyn WindowSurface>) -> Self {
        let forwarders = DEPRECATED_METHODS
            .iter()
            .map(|&name| {
                let forwarder = Forwarder {
                    name,
                    surface: surface.clone(),
                };
                (name, forwarder)
            })
            .collect();
        Self { forwarders }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Forwarder> {
        self.forwarders.get(name).cloned()
    }
}

/// Frames two through four of the current stack. Captured regardless of
/// `RUST_BACKTRACE`; `None` only where the platform cannot unwind.
fn stack_excerpt() -> Option<String> {
    let backtrace = Backtrace::force_capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return None;
    }
    let frame_line = Regex::new(r"^\s*(\d+):\s+(.+)$").ok()?;
    let rendered = backtrace.to_string();
    let frames: Vec<&str> = rendered
        .lines()
        .filter_map(|line| {
            let captures = frame_line.captures(line)?;
            let index: usize = captures.get(1)?.as_str().parse().ok()?;
            (2..=4).contains(&index).then(|| line.trim())
        })
        .collect();
    (!frames.is_empty()).then(|| frames.join("\n"))
}
