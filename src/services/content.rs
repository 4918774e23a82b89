//! Content providers for non-file URI schemes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use serde_json::json;
use tower_lsp::lsp_types::Url;

use super::NotifyQueue;
use crate::event::{Disposable, Emitter, Event};
use crate::host::{Env, HostConnection};
use crate::util::{read, write};

/// Supplies the text of virtual documents for one URI scheme
#[tower_lsp::async_trait]
pub trait TextDocumentContentProvider: Send + Sync {
    async fn provide_text_document_content(&self, uri: &Url) -> Result<String>;

    /// Release resources held by the provider.
    fn dispose(&self) {}
}

pub struct ContentProvider {
    providers: RwLock<HashMap<String, Arc<dyn TextDocumentContentProvider>>>,
    host: RwLock<Option<Arc<dyn HostConnection>>>,
    notifications: NotifyQueue,
    on_did_change: Emitter<Url>,
}

impl Default for ContentProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentProvider {
    pub const REGISTER_SCHEME: &'static str = "register_scheme";
    pub const UNREGISTER_SCHEME: &'static str = "unregister_scheme";

    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            host: RwLock::new(None),
            notifications: NotifyQueue::new(),
            on_did_change: Emitter::new(),
        }
    }

    /// Fired when a provider reports that a virtual document changed
    pub fn on_did_change(&self) -> Event<Url> {
        self.on_did_change.event()
    }

    pub async fn attach(&self, host: Arc<dyn HostConnection>, _env: &Env) -> Result<()> {
        *write(&self.host) = Some(host.clone());
        self.notifications.flush().await;
        for scheme in self.schemes() {
            host.notify(Self::REGISTER_SCHEME, vec![json!(scheme)]).await?;
        }
        Ok(())
    }

    /// Register `provider` for `scheme`, replacing any previous one.
    pub fn register(
        self: &Arc<Self>,
        scheme: &str,
        provider: Arc<dyn TextDocumentContentProvider>,
    ) -> Disposable {
        let previous = write(&self.providers).insert(scheme.to_string(), provider.clone());
        if previous.is_some() {
            log::warn!("Content provider for scheme '{}' replaced", scheme);
        } else if let Some(host) = read(&self.host).clone() {
            self.notifications
                .push(host, Self::REGISTER_SCHEME, vec![json!(scheme)]);
        }

        let this = Arc::downgrade(self);
        let scheme = scheme.to_string();
        Disposable::from_fn(move || {
            let Some(this) = this.upgrade() else {
                return;
            };
            let removed = {
                let mut providers = write(&this.providers);
                match providers.get(&scheme) {
                    Some(current) if Arc::ptr_eq(current, &provider) => providers.remove(&scheme),
                    _ => None,
                }
            };
            if let Some(removed) = removed {
                removed.dispose();
                if let Some(host) = read(&this.host).clone() {
                    this.notifications
                        .push(host, Self::UNREGISTER_SCHEME, vec![json!(scheme)]);
                }
            }
        })
    }

    pub fn has_provider(&self, scheme: &str) -> bool {
        read(&self.providers).contains_key(scheme)
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = read(&self.providers).keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Text of the virtual document at `uri`.
    pub async fn provide(&self, uri: &Url) -> Result<String> {
        let provider = read(&self.providers).get(uri.scheme()).cloned();
        match provider {
            Some(provider) => provider.provide_text_document_content(uri).await,
            None => bail!("No content provider registered for scheme '{}'", uri.scheme()),
        }
    }

    pub fn fire_change(&self, uri: &Url) {
        self.on_did_change.fire(uri);
    }

    pub fn dispose(&self) {
        let providers: Vec<_> = write(&self.providers).drain().map(|(_, p)| p).collect();
        for provider in providers {
            provider.dispose();
        }
        self.on_did_change.clear();
        *write(&self.host) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    struct Static(&'static str);

    #[tower_lsp::async_trait]
    impl TextDocumentContentProvider for Static {
        async fn provide_text_document_content(&self, uri: &Url) -> Result<String> {
            Ok(format!("{} {}", self.0, uri.path()))
        }
    }

    #[tokio::test]
    async fn test_provide_routes_by_scheme() {
        let content = Arc::new(ContentProvider::new());
        let _reg = content.register("output", Arc::new(Static("log")));

        let uri = Url::parse("output:///channel").unwrap();
        assert_eq!(content.provide(&uri).await.unwrap(), "log /channel");

        let other = Url::parse("git:///HEAD").unwrap();
        assert!(content.provide(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_attach_announces_registered_schemes() {
        let host = Arc::new(MemoryHost::new());
        let content = Arc::new(ContentProvider::new());
        let _a = content.register("b-scheme", Arc::new(Static("b")));
        let _b = content.register("a-scheme", Arc::new(Static("a")));

        content.attach(host.clone(), &Env::default()).await.unwrap();

        assert_eq!(
            host.calls_to(ContentProvider::REGISTER_SCHEME),
            vec![vec![json!("a-scheme")], vec![json!("b-scheme")]]
        );
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_remove_replacement() {
        let content = Arc::new(ContentProvider::new());
        let first = content.register("output", Arc::new(Static("first")));
        let _second = content.register("output", Arc::new(Static("second")));

        first.dispose();
        assert!(content.has_provider("output"));
    }
}
