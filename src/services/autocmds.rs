//! Autocmd registry.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use super::{BoxFuture, NotifyQueue};
use crate::event::Disposable;
use crate::host::{Env, HostConnection};
use crate::util::{read, write};

type AutocmdCallback = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Host autocmd bound to a callback
#[derive(Clone)]
pub struct Autocmd {
    pub events: Vec<String>,
    pub pattern: Option<String>,
    /// Whether the host waits for the callback to finish
    pub request: bool,
    /// Host expressions evaluated and passed as callback arguments
    pub arglist: Vec<String>,
    callback: AutocmdCallback,
}

impl Autocmd {
    pub fn new<F, Fut>(events: &[&str], callback: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            events: events.iter().map(|e| e.to_string()).collect(),
            pattern: None,
            request: false,
            arglist: Vec::new(),
            callback: Arc::new(move |args| -> BoxFuture<'static, Result<Value>> {
                Box::pin(callback(args))
            }),
        }
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }

    pub fn request(mut self, request: bool) -> Self {
        self.request = request;
        self
    }

    pub fn arglist(mut self, arglist: &[&str]) -> Self {
        self.arglist = arglist.iter().map(|a| a.to_string()).collect();
        self
    }

    fn definition(&self, id: u32) -> Value {
        json!({
            "id": id,
            "events": self.events,
            "pattern": self.pattern,
            "request": self.request,
            "arglist": self.arglist,
        })
    }
}

#[derive(Default)]
pub struct AutocmdRegistry {
    next_id: AtomicU32,
    autocmds: RwLock<BTreeMap<u32, Autocmd>>,
    host: RwLock<Option<Arc<dyn HostConnection>>>,
    notifications: NotifyQueue,
}

impl AutocmdRegistry {
    pub const DEFINE_AUTOCMDS: &'static str = "define_autocmds";

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, host: Arc<dyn HostConnection>, _env: &Env) -> Result<()> {
        *write(&self.host) = Some(host.clone());
        self.notifications.flush().await;
        host.notify(Self::DEFINE_AUTOCMDS, vec![self.definitions()])
            .await?;
        Ok(())
    }

    /// Register an autocmd; ids increase monotonically and are never reused.
    pub fn register(self: &Arc<Self>, autocmd: Autocmd) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        write(&self.autocmds).insert(id, autocmd);
        self.sync_host();

        let this = Arc::downgrade(self);
        Disposable::from_fn(move || {
            let Some(this) = this.upgrade() else {
                return;
            };
            let removed = write(&this.autocmds).remove(&id).is_some();
            if removed {
                this.sync_host();
            }
        })
    }

    /// Full definition set as sent to the host
    pub fn definitions(&self) -> Value {
        Value::Array(
            read(&self.autocmds)
                .iter()
                .map(|(id, autocmd)| autocmd.definition(*id))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        read(&self.autocmds).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.autocmds).is_empty()
    }

    /// Run the callback of autocmd `id` with the host-evaluated arguments.
    pub async fn dispatch(&self, id: u32, args: Vec<Value>) -> Result<Value> {
        let callback = read(&self.autocmds)
            .get(&id)
            .map(|a| a.callback.clone())
            .ok_or_else(|| anyhow!("No autocmd with id {}", id))?;
        callback(args).await
    }

    /// Drop every autocmd and clear the host-side definitions.
    pub async fn dispose(&self) -> Result<()> {
        write(&self.autocmds).clear();
        let host = write(&self.host).take();
        if let Some(host) = host {
            self.notifications.flush().await;
            host.notify(Self::DEFINE_AUTOCMDS, vec![json!([])]).await?;
        }
        Ok(())
    }

    /// Queue the full definition set; it is taken at queue time so the
    /// last update to reach the host is the current one.
    fn sync_host(&self) {
        if let Some(host) = read(&self.host).clone() {
            self.notifications
                .push_with(host, Self::DEFINE_AUTOCMDS, || vec![self.definitions()]);
        }
    }
}
