//! Per-document state registries.
//!
//! A [`BufferSync`] keeps one item per open document for every document its
//! factory accepts. Items follow the document lifecycle: created on open,
//! told about changes, torn down on close.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::core::{BufferId, Document, DocumentChange, DocumentModel};
use crate::event::Disposable;
use crate::util::{lock, read, write};

/// State attached to one open document
pub trait SyncItem: Send + Sync + 'static {
    /// Called once when the document closes or the registry is disposed.
    fn dispose(&self) {}

    fn on_change(&self, _change: &DocumentChange) {}
}

pub struct BufferSync<T: SyncItem> {
    items: RwLock<HashMap<BufferId, Arc<T>>>,
    /// Outstanding async creations, by buffer, with their generation
    pending: Mutex<HashMap<BufferId, u64>>,
    generation: AtomicU64,
    subscriptions: Mutex<Vec<Disposable>>,
    disposed: AtomicBool,
}

impl<T: SyncItem> BufferSync<T> {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            items: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Track `documents` with a synchronous factory. Returning `None`
    /// declines the document.
    pub fn new<F>(documents: &DocumentModel, factory: F) -> Arc<Self>
    where
        F: Fn(&Document) -> Option<T> + Send + Sync + 'static,
    {
        let sync = Self::empty();
        let factory = Arc::new(factory);

        let on_open = {
            let this = Arc::downgrade(&sync);
            let factory = factory.clone();
            documents.on_did_open().subscribe(move |doc| {
                if let Some(this) = this.upgrade() {
                    this.create(doc, &*factory);
                }
            })
        };
        sync.observe(documents, on_open);

        for doc in documents.documents() {
            sync.create(&doc, &*factory);
        }
        sync
    }

    /// Track `documents` with an async factory. Each creation runs on its own
    /// task; an item finishing after its document closed is torn down.
    pub fn new_async<F, Fut>(documents: &DocumentModel, factory: F) -> Arc<Self>
    where
        F: Fn(Document) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let sync = Self::empty();
        let factory = Arc::new(factory);

        let on_open = {
            let this = Arc::downgrade(&sync);
            let factory = factory.clone();
            documents.on_did_open().subscribe(move |doc| {
                if let Some(this) = this.upgrade() {
                    this.spawn_create(doc.clone(), &*factory);
                }
            })
        };
        sync.observe(documents, on_open);

        for doc in documents.documents() {
            sync.spawn_create(doc, &*factory);
        }
        sync
    }

    pub fn get_item(&self, bufnr: BufferId) -> Option<Arc<T>> {
        read(&self.items).get(&bufnr).cloned()
    }

    /// Items ordered by buffer number
    pub fn items(&self) -> Vec<(BufferId, Arc<T>)> {
        let mut items: Vec<_> = read(&self.items)
            .iter()
            .map(|(bufnr, item)| (*bufnr, item.clone()))
            .collect();
        items.sort_by_key(|(bufnr, _)| *bufnr);
        items
    }

    pub fn len(&self) -> usize {
        read(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.items).is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop observing documents and tear down every item.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.dispose();
        }
        lock(&self.pending).clear();
        let items: Vec<Arc<T>> = write(&self.items).drain().map(|(_, item)| item).collect();
        for item in items {
            item.dispose();
        }
    }

    fn observe(self: &Arc<Self>, documents: &DocumentModel, on_open: Disposable) {
        let on_change = {
            let this = Arc::downgrade(self);
            documents.on_did_change().subscribe(move |change| {
                if let Some(item) = this.upgrade().and_then(|this| this.get_item(change.bufnr)) {
                    item.on_change(change);
                }
            })
        };
        let on_close = {
            let this = Arc::downgrade(self);
            documents.on_did_close().subscribe(move |doc| {
                if let Some(this) = this.upgrade() {
                    this.remove(doc.bufnr);
                }
            })
        };
        *lock(&self.subscriptions) = vec![on_open, on_change, on_close];
    }

    fn create<F>(&self, doc: &Document, factory: &F)
    where
        F: Fn(&Document) -> Option<T>,
    {
        if self.is_disposed() || read(&self.items).contains_key(&doc.bufnr) {
            return;
        }
        if let Some(item) = factory(doc) {
            self.store(doc.bufnr, Arc::new(item));
        }
    }

    fn spawn_create<F, Fut>(self: &Arc<Self>, doc: Document, factory: &F)
    where
        F: Fn(Document) -> Fut,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        if self.is_disposed() || read(&self.items).contains_key(&doc.bufnr) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to create state for buffer {}", doc.bufnr);
            return;
        };

        let bufnr = doc.bufnr;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.pending).insert(bufnr, generation);

        let created = factory(doc);
        let this: Weak<Self> = Arc::downgrade(self);
        runtime.spawn(async move {
            let Some(item) = created.await else {
                if let Some(this) = this.upgrade() {
                    this.finish_pending(bufnr, generation);
                }
                return;
            };
            let item = Arc::new(item);
            match this.upgrade() {
                Some(this) if this.finish_pending(bufnr, generation) => this.store(bufnr, item),
                _ => {
                    log::debug!("Discarding state for buffer {} closed during creation", bufnr);
                    item.dispose();
                }
            }
        });
    }

    /// Clear the pending marker; true when it was still current.
    fn finish_pending(&self, bufnr: BufferId, generation: u64) -> bool {
        let mut pending = lock(&self.pending);
        if pending.get(&bufnr) == Some(&generation) {
            pending.remove(&bufnr);
            return !self.is_disposed();
        }
        false
    }

    fn store(&self, bufnr: BufferId, item: Arc<T>) {
        let rejected = {
            let mut items = write(&self.items);
            if self.is_disposed() || items.contains_key(&bufnr) {
                Some(item)
            } else {
                items.insert(bufnr, item);
                None
            }
        };
        if let Some(item) = rejected {
            item.dispose();
        }
    }

    fn remove(&self, bufnr: BufferId) {
        lock(&self.pending).remove(&bufnr);
        let item = self.get_item(bufnr);
        if let Some(item) = item {
            item.dispose();
            write(&self.items).remove(&bufnr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        BufferInfo, ConfigurationStore, DocumentContext, WorkspaceFolderRegistry,
    };
    use crate::host::{Env, MemoryHost};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tower_lsp::lsp_types::Url;

    struct Counter {
        changes: AtomicUsize,
        disposed: Arc<AtomicUsize>,
    }

    impl SyncItem for Counter {
        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_change(&self, _change: &DocumentChange) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn attached_model() -> DocumentModel {
        let model = DocumentModel::new(DocumentContext {
            configurations: Arc::new(ConfigurationStore::new()),
            folders: Arc::new(WorkspaceFolderRegistry::new()),
        });
        let host = Arc::new(MemoryHost::new());
        host.reply(DocumentModel::LIST_BUFFERS, serde_json::json!([]));
        model.attach(host, &Env::default()).await.unwrap();
        model
    }

    fn info(bufnr: BufferId) -> BufferInfo {
        BufferInfo {
            bufnr,
            uri: Url::parse(&format!("untitled:buffer-{}", bufnr)).unwrap(),
            language_id: "text".to_string(),
            version: 1,
            text: String::new(),
        }
    }

    #[tokio::test]
    async fn test_change_reaches_item_and_close_tears_down() {
        let model = attached_model().await;
        let disposed = Arc::new(AtomicUsize::new(0));
        let sync = BufferSync::new(&model, {
            let disposed = disposed.clone();
            move |_doc| {
                Some(Counter {
                    changes: AtomicUsize::new(0),
                    disposed: disposed.clone(),
                })
            }
        });

        model.handle_open(info(1));
        model.handle_change(1, 2, "hello".to_string());
        let item = sync.get_item(1).unwrap();
        assert_eq!(item.changes.load(Ordering::SeqCst), 1);

        model.handle_close(1);
        model.handle_close(1);
        assert!(sync.is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_item_for_closed_document_is_discarded() {
        let model = attached_model().await;
        let disposed = Arc::new(AtomicUsize::new(0));
        let sync = BufferSync::new_async(&model, {
            let disposed = disposed.clone();
            move |_doc| {
                let disposed = disposed.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Some(Counter {
                        changes: AtomicUsize::new(0),
                        disposed,
                    })
                }
            }
        });

        model.handle_open(info(1));
        model.handle_open(info(2));
        model.handle_close(1);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(sync.get_item(1).is_none());
        assert!(sync.get_item(2).is_some());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }
}
