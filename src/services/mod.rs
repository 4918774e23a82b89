//! Mid-level Services
//!
//! Each service accepts registrations at any time, attaches to the host once
//! an env snapshot is known, and replays its registrations on (re)attach.

pub mod autocmds;
pub mod content;
pub mod files;
pub mod keymaps;
pub mod locations;
pub mod terminal;
pub mod watchers;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::host::HostConnection;
use crate::util::lock;

pub use autocmds::{Autocmd, AutocmdRegistry};
pub use content::{ContentProvider, TextDocumentContentProvider};
pub use files::{
    CreateFileOptions, DeleteFileOptions, FileCreate, FileDelete, FileOperationPipeline,
    FileRename, RenameFileOptions,
};
pub use keymaps::{KeymapOptions, KeymapRegistry, MapMode};
pub use locations::{LocationContext, LocationService};
pub use terminal::{Task, TaskOptions, TerminalOptions, TerminalSession};
pub use watchers::{FileChangeKind, FileSystemWatcher, WatcherOptions, WatcherRegistry};

/// Boxed, sendable future used for stored async callbacks
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Fire-and-forget host notification from synchronous code.
///
/// Registration handles are released from plain `fn` contexts, so the host
/// update is pushed onto the runtime when there is one.
pub(crate) fn spawn_notify(host: Arc<dyn HostConnection>, method: &'static str, args: Vec<Value>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = host.notify(method, args).await {
                    log::warn!("Host notification '{}' failed: {}", method, e);
                }
            });
        }
        Err(_) => log::debug!("No runtime to deliver '{}' notification", method),
    }
}

enum Queued {
    Notify(Arc<dyn HostConnection>, &'static str, Vec<Value>),
    Flush(oneshot::Sender<()>),
}

/// Host notifications from synchronous code, delivered in queue order.
///
/// One worker task per queue sends the updates one after another, so a
/// registry's host-side state follows the order its changes were made in.
#[derive(Default)]
pub(crate) struct NotifyQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
}

impl NotifyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a notification whose arguments are built while the queue is
    /// held, so later pushes always carry later state.
    pub(crate) fn push_with<F>(&self, host: Arc<dyn HostConnection>, method: &'static str, args: F)
    where
        F: FnOnce() -> Vec<Value>,
    {
        let mut sender = lock(&self.sender);
        Self::send(&mut sender, Queued::Notify(host, method, args()));
    }

    pub(crate) fn push(&self, host: Arc<dyn HostConnection>, method: &'static str, args: Vec<Value>) {
        self.push_with(host, method, || args);
    }

    /// Wait until everything queued so far has been handed to the host.
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut sender = lock(&self.sender);
            if sender.is_none() {
                return;
            }
            Self::send(&mut sender, Queued::Flush(tx));
        }
        let _ = rx.await;
    }

    fn send(sender: &mut Option<mpsc::UnboundedSender<Queued>>, item: Queued) {
        let item = match sender.as_ref() {
            Some(tx) => match tx.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };

        // No worker yet, or its runtime is gone
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if let Queued::Notify(_, method, _) = item {
                log::debug!("No runtime to deliver '{}' notification", method);
            }
            *sender = None;
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime.spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Queued::Notify(host, method, args) => {
                        if let Err(e) = host.notify(method, args).await {
                            log::warn!("Host notification '{}' failed: {}", method, e);
                        }
                    }
                    Queued::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        let _ = tx.send(item);
        *sender = Some(tx);
    }
}
