//! Document Model
//!
//! Mirrors the host's buffers as [`Document`]s and owns their
//! open/change/save/close events.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_lsp::lsp_types::Url;

use super::configuration::ConfigurationStore;
use super::folders::{WorkspaceFolder, WorkspaceFolderRegistry};
use crate::event::{Emitter, Event};
use crate::host::{decode, Env, HostConnection};
use crate::util::{read, write};

/// Host buffer number; the identity of a document
pub type BufferId = u32;

const DEFAULT_ROOT_PATTERNS: [&str; 3] = [".git", ".hg", ".projections.json"];

/// Buffer description as sent by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferInfo {
    pub bufnr: BufferId,
    pub uri: Url,
    #[serde(default)]
    pub language_id: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub text: String,
}

/// In-memory mirror of one host buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub bufnr: BufferId,
    pub uri: Url,
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

impl From<BufferInfo> for Document {
    fn from(info: BufferInfo) -> Self {
        Self {
            bufnr: info.bufnr,
            uri: info.uri,
            language_id: info.language_id,
            version: info.version,
            text: info.text,
        }
    }
}

impl Document {
    pub fn is_file(&self) -> bool {
        self.uri.scheme() == "file"
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.uri.to_file_path().ok()
    }

    pub fn line(&self, line: usize) -> Option<&str> {
        self.text.lines().nth(line)
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }
}

/// Content update of an open document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub bufnr: BufferId,
    pub uri: Url,
    pub version: i32,
    pub text: String,
}

/// What the document model may reach into, instead of the whole workspace
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub configurations: Arc<ConfigurationStore>,
    pub folders: Arc<WorkspaceFolderRegistry>,
}

pub struct DocumentModel {
    context: DocumentContext,
    documents: RwLock<HashMap<BufferId, Document>>,
    host: RwLock<Option<Arc<dyn HostConnection>>>,
    cwd: RwLock<Option<PathBuf>>,
    attached: AtomicBool,
    disposed: AtomicBool,
    on_did_open: Emitter<Document>,
    on_did_change: Emitter<DocumentChange>,
    on_did_close: Emitter<Document>,
    on_will_save: Emitter<Document>,
    on_did_save: Emitter<Document>,
}

impl DocumentModel {
    pub const LIST_BUFFERS: &'static str = "list_buffers";
    pub const OPEN_BUFFER: &'static str = "open_buffer";

    pub fn new(context: DocumentContext) -> Self {
        Self {
            context,
            documents: RwLock::new(HashMap::new()),
            host: RwLock::new(None),
            cwd: RwLock::new(None),
            attached: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            on_did_open: Emitter::new(),
            on_did_change: Emitter::new(),
            on_did_close: Emitter::new(),
            on_will_save: Emitter::new(),
            on_did_save: Emitter::new(),
        }
    }

    pub fn on_did_open(&self) -> Event<Document> {
        self.on_did_open.event()
    }

    pub fn on_did_change(&self) -> Event<DocumentChange> {
        self.on_did_change.event()
    }

    pub fn on_did_close(&self) -> Event<Document> {
        self.on_did_close.event()
    }

    pub fn on_will_save(&self) -> Event<Document> {
        self.on_will_save.event()
    }

    pub fn on_did_save(&self) -> Event<Document> {
        self.on_did_save.event()
    }

    /// Start observing host buffers and discover every already-open one.
    pub async fn attach(&self, host: Arc<dyn HostConnection>, env: &Env) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            bail!("document model is disposed");
        }
        *write(&self.host) = Some(host.clone());
        *write(&self.cwd) = env.cwd.clone();
        self.attached.store(true, Ordering::SeqCst);

        let listed = host
            .call(Self::LIST_BUFFERS, Vec::new())
            .await
            .context("Failed to list host buffers")?;
        let buffers: Vec<BufferInfo> = decode(Self::LIST_BUFFERS, listed)?;
        let count = buffers.len();
        self.reconcile(buffers);
        log::info!("Document model attached with {} buffer(s)", count);
        Ok(())
    }

    /// Bring the cache in line with the host's buffer list. Buffers the host
    /// no longer lists are closed, survivors pick up the host's text, and
    /// new ones are opened.
    fn reconcile(&self, buffers: Vec<BufferInfo>) {
        let listed: HashSet<BufferId> = buffers.iter().map(|b| b.bufnr).collect();
        let mut gone: Vec<Document> = {
            let mut documents = write(&self.documents);
            let stale: Vec<BufferId> = documents
                .keys()
                .filter(|bufnr| !listed.contains(*bufnr))
                .copied()
                .collect();
            stale.iter().filter_map(|bufnr| documents.remove(bufnr)).collect()
        };
        gone.sort_by_key(|d| d.bufnr);
        for doc in &gone {
            log::debug!("Buffer {} went away while detached", doc.bufnr);
            self.on_did_close.fire(doc);
        }

        for info in buffers {
            let Some(cached) = self.get(info.bufnr) else {
                self.open(info);
                continue;
            };
            if cached.uri != info.uri || cached.language_id != info.language_id {
                // Buffer number reused for another document
                if let Some(doc) = write(&self.documents).remove(&info.bufnr) {
                    self.on_did_close.fire(&doc);
                }
                self.open(info);
            } else if cached.version != info.version || cached.text != info.text {
                let change = {
                    let mut documents = write(&self.documents);
                    let Some(doc) = documents.get_mut(&info.bufnr) else {
                        continue;
                    };
                    doc.version = info.version;
                    doc.text = info.text;
                    DocumentChange {
                        bufnr: doc.bufnr,
                        uri: doc.uri.clone(),
                        version: doc.version,
                        text: doc.text.clone(),
                    }
                };
                self.on_did_change.fire(&change);
            }
        }
    }

    /// Stop applying host buffer notifications. Cached documents remain.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn cwd(&self) -> Option<PathBuf> {
        read(&self.cwd).clone()
    }

    pub fn get(&self, bufnr: BufferId) -> Option<Document> {
        read(&self.documents).get(&bufnr).cloned()
    }

    pub fn get_by_uri(&self, uri: &Url) -> Option<Document> {
        read(&self.documents).values().find(|d| &d.uri == uri).cloned()
    }

    /// Open documents ordered by buffer number
    pub fn documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = read(&self.documents).values().cloned().collect();
        docs.sort_by_key(|d| d.bufnr);
        docs
    }

    pub fn len(&self) -> usize {
        read(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.documents).is_empty()
    }

    /// Route a host buffer notification; returns whether it was recognised.
    pub fn handle_notification(&self, method: &str, params: &[Value]) -> Result<bool> {
        match method {
            "buffer_open" => {
                let info: BufferInfo = decode(method, param(params, 0)?)?;
                self.handle_open(info);
            }
            "buffer_change" => {
                let bufnr: BufferId = decode(method, param(params, 0)?)?;
                let version: i32 = decode(method, param(params, 1)?)?;
                let text: String = decode(method, param(params, 2)?)?;
                self.handle_change(bufnr, version, text);
            }
            "buffer_close" => self.handle_close(decode(method, param(params, 0)?)?),
            "buffer_will_save" => self.handle_will_save(decode(method, param(params, 0)?)?),
            "buffer_save" => self.handle_save(decode(method, param(params, 0)?)?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn handle_open(&self, info: BufferInfo) -> Option<Document> {
        if !self.is_attached() {
            log::debug!("Ignoring open of buffer {} while detached", info.bufnr);
            return None;
        }
        self.open(info)
    }

    pub fn handle_change(&self, bufnr: BufferId, version: i32, text: String) {
        if !self.is_attached() {
            return;
        }
        let change = {
            let mut documents = write(&self.documents);
            let Some(doc) = documents.get_mut(&bufnr) else {
                log::debug!("Change for unknown buffer {}", bufnr);
                return;
            };
            if version <= doc.version {
                log::debug!(
                    "Ignoring stale change for buffer {} ({} <= {})",
                    bufnr,
                    version,
                    doc.version
                );
                return;
            }
            doc.version = version;
            doc.text = text;
            DocumentChange {
                bufnr,
                uri: doc.uri.clone(),
                version,
                text: doc.text.clone(),
            }
        };
        self.on_did_change.fire(&change);
    }

    pub fn handle_close(&self, bufnr: BufferId) {
        if !self.is_attached() {
            return;
        }
        let removed = write(&self.documents).remove(&bufnr);
        if let Some(doc) = removed {
            log::debug!("Closed document {}", doc.uri);
            self.on_did_close.fire(&doc);
        }
    }

    pub fn handle_will_save(&self, bufnr: BufferId) {
        if let Some(doc) = self.get(bufnr).filter(|_| self.is_attached()) {
            self.on_will_save.fire(&doc);
        }
    }

    pub fn handle_save(&self, bufnr: BufferId) {
        if let Some(doc) = self.get(bufnr).filter(|_| self.is_attached()) {
            self.on_did_save.fire(&doc);
        }
    }

    /// Ask the host to open `uri` in a buffer, reusing an open document.
    pub async fn load_document(&self, uri: &Url) -> Result<Document> {
        if let Some(doc) = self.get_by_uri(uri) {
            return Ok(doc);
        }
        let host = read(&self.host)
            .clone()
            .ok_or_else(|| anyhow!("document model is not attached"))?;

        let opened = host
            .call(Self::OPEN_BUFFER, vec![json!(uri)])
            .await
            .with_context(|| format!("Failed to open {}", uri))?;
        let info: BufferInfo = decode(Self::OPEN_BUFFER, opened)?;
        let bufnr = info.bufnr;
        // The host may have already announced the buffer.
        self.open(info);
        self.get(bufnr)
            .ok_or_else(|| anyhow!("buffer {} closed while loading {}", bufnr, uri))
    }

    /// Drop every cached document, firing close for each so per-document
    /// state is released, while staying attached.
    pub fn reset(&self) {
        let mut closed: Vec<Document> = write(&self.documents).drain().map(|(_, d)| d).collect();
        closed.sort_by_key(|d| d.bufnr);
        for doc in &closed {
            self.on_did_close.fire(doc);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach();
        write(&self.documents).clear();
        *write(&self.host) = None;
        self.on_did_open.clear();
        self.on_did_change.clear();
        self.on_did_close.clear();
        self.on_will_save.clear();
        self.on_did_save.clear();
    }

    fn open(&self, info: BufferInfo) -> Option<Document> {
        let doc = Document::from(info);
        {
            let mut documents = write(&self.documents);
            if documents.contains_key(&doc.bufnr) {
                return None;
            }
            documents.insert(doc.bufnr, doc.clone());
        }
        self.track_root(&doc);
        log::debug!("Opened document {} ({})", doc.uri, doc.language_id);
        self.on_did_open.fire(&doc);
        Some(doc)
    }

    fn track_root(&self, doc: &Document) {
        let Some(path) = doc.path().filter(|_| doc.is_file()) else {
            return;
        };
        let folders = &self.context.folders;
        if folders.contains(&path) {
            return;
        }

        let defaults: Vec<String> = DEFAULT_ROOT_PATTERNS.iter().map(|p| p.to_string()).collect();
        let patterns: Vec<String> = self
            .context
            .configurations
            .get_or("workspace.rootPatterns", defaults);

        let root = WorkspaceFolderRegistry::resolve_root(&path, &patterns)
            .or_else(|| self.cwd().filter(|cwd| path.starts_with(cwd)));
        if let Some(folder) = root.as_deref().and_then(WorkspaceFolder::from_path) {
            folders.add_folder(folder);
        }
    }
}

fn param(params: &[Value], idx: usize) -> Result<Value> {
    params
        .get(idx)
        .cloned()
        .ok_or_else(|| anyhow!("missing parameter {}", idx))
}
