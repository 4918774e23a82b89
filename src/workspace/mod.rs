//! Workspace Orchestrator
//!
//! [`Workspace`] owns the core state and every mid-level service, wires them
//! together at construction, and drives the lifecycle against the host:
//! `initialize`, `attach`, `detach`, `reset` and `dispose`.
//!
//! Construction never talks to the host. Everything host-facing happens in
//! [`Workspace::initialize`], which fetches the env snapshot and attaches the
//! services in dependency order, the document model last.

pub mod buffer_sync;
pub mod shim;

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use thiserror::Error;
use tower_lsp::lsp_types::Url;

use crate::config::Config;
use crate::core::{
    ConfigurationChange, ConfigurationStore, Document, DocumentChange, DocumentContext,
    DocumentModel, WorkspaceFolderRegistry, WorkspaceFoldersChange,
};
use crate::event::{Disposable, Event};
use crate::host::{call_with_timeout, decode, Env, HostConnection, HostResult};
use crate::services::{
    AutocmdRegistry, ContentProvider, FileChangeKind, FileCreate, FileDelete,
    FileOperationPipeline, FileRename, KeymapRegistry, LocationContext, LocationService, MapMode,
    Task, TerminalOptions, TerminalSession, WatcherRegistry,
};
use crate::storage::{KeyValueStore, Mru};
use crate::util::{lock, read, write};

pub use buffer_sync::{BufferSync, SyncItem};
pub use shim::{Forwarder, HostWindow, WindowSurface, DEPRECATED_METHODS};

use shim::ShimTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, never initialized (or reset after a failure)
    Created,
    Initializing,
    Ready,
    /// An attach step failed; `reset` is required before initializing again
    Failed,
    Detached,
    Disposed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("workspace is already initialized")]
    AlreadyInitialized,
    #[error("workspace failed to attach; reset it before initializing again")]
    NeedsReset,
    #[error("workspace is not initialized")]
    NotInitialized,
    #[error("workspace is disposed")]
    Disposed,
}

/// Method used to surface diagnostics in the host
pub const ECHO_ERROR: &str = "echo_error";
/// Method used to run host commands
pub const EXECUTE_COMMAND: &str = "execute_command";

pub struct Workspace {
    host: Arc<dyn HostConnection>,
    config: Config,
    state: RwLock<LifecycleState>,
    env: RwLock<Option<Arc<Env>>>,
    shim: RwLock<Option<Arc<ShimTable>>>,

    configurations: Arc<ConfigurationStore>,
    folders: Arc<WorkspaceFolderRegistry>,
    documents: Arc<DocumentModel>,

    files: Arc<FileOperationPipeline>,
    content: Arc<ContentProvider>,
    keymaps: Arc<KeymapRegistry>,
    autocmds: Arc<AutocmdRegistry>,
    locations: Arc<LocationService>,
    watchers: Arc<WatcherRegistry>,

    tasks: Mutex<Vec<Weak<Task>>>,
    /// Release handles for registries created through the workspace
    owned: Mutex<Vec<Disposable>>,
}

impl Workspace {
    pub fn new(host: Arc<dyn HostConnection>, config: Config) -> Self {
        let configurations = Arc::new(ConfigurationStore::new());
        let folders = Arc::new(WorkspaceFolderRegistry::new());
        let documents = Arc::new(DocumentModel::new(DocumentContext {
            configurations: configurations.clone(),
            folders: folders.clone(),
        }));

        let files = Arc::new(FileOperationPipeline::new(documents.clone()));
        let content = Arc::new(ContentProvider::new());
        let keymaps = Arc::new(KeymapRegistry::new());
        let autocmds = Arc::new(AutocmdRegistry::new());
        let locations = Arc::new(LocationService::new(LocationContext {
            documents: documents.clone(),
            configurations: configurations.clone(),
        }));
        let watchers = Arc::new(WatcherRegistry::new(configurations.clone(), folders.clone()));

        Self {
            host,
            config,
            state: RwLock::new(LifecycleState::Created),
            env: RwLock::new(None),
            shim: RwLock::new(None),
            configurations,
            folders,
            documents,
            files,
            content,
            keymaps,
            autocmds,
            locations,
            watchers,
            tasks: Mutex::new(Vec::new()),
            owned: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *read(&self.state)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> Arc<dyn HostConnection> {
        self.host.clone()
    }

    /// Env snapshot of the current attach cycle
    pub fn env(&self) -> Option<Arc<Env>> {
        read(&self.env).clone()
    }

    pub fn configurations(&self) -> &Arc<ConfigurationStore> {
        &self.configurations
    }

    pub fn folders(&self) -> &Arc<WorkspaceFolderRegistry> {
        &self.folders
    }

    pub fn documents(&self) -> &Arc<DocumentModel> {
        &self.documents
    }

    pub fn files(&self) -> &Arc<FileOperationPipeline> {
        &self.files
    }

    pub fn content(&self) -> &Arc<ContentProvider> {
        &self.content
    }

    pub fn keymaps(&self) -> &Arc<KeymapRegistry> {
        &self.keymaps
    }

    pub fn autocmds(&self) -> &Arc<AutocmdRegistry> {
        &self.autocmds
    }

    pub fn locations(&self) -> &Arc<LocationService> {
        &self.locations
    }

    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.watchers
    }

    // Event facade: each accessor hands out the owning component's handle.

    pub fn on_did_open_text_document(&self) -> Event<Document> {
        self.documents.on_did_open()
    }

    pub fn on_did_change_text_document(&self) -> Event<DocumentChange> {
        self.documents.on_did_change()
    }

    pub fn on_did_close_text_document(&self) -> Event<Document> {
        self.documents.on_did_close()
    }

    pub fn on_will_save_text_document(&self) -> Event<Document> {
        self.documents.on_will_save()
    }

    pub fn on_did_save_text_document(&self) -> Event<Document> {
        self.documents.on_did_save()
    }

    pub fn on_did_change_configuration(&self) -> Event<ConfigurationChange> {
        self.configurations.on_did_change()
    }

    pub fn on_did_change_workspace_folders(&self) -> Event<WorkspaceFoldersChange> {
        self.folders.on_did_change()
    }

    pub fn on_did_change_content(&self) -> Event<Url> {
        self.content.on_did_change()
    }

    pub fn on_will_create_files(&self) -> Event<FileCreate> {
        self.files.on_will_create_files()
    }

    pub fn on_did_create_files(&self) -> Event<FileCreate> {
        self.files.on_did_create_files()
    }

    pub fn on_will_rename_files(&self) -> Event<FileRename> {
        self.files.on_will_rename_files()
    }

    pub fn on_did_rename_files(&self) -> Event<FileRename> {
        self.files.on_did_rename_files()
    }

    pub fn on_will_delete_files(&self) -> Event<FileDelete> {
        self.files.on_will_delete_files()
    }

    pub fn on_did_delete_files(&self) -> Event<FileDelete> {
        self.files.on_did_delete_files()
    }

    /// Handshake with the host and attach every component.
    ///
    /// A failing step leaves the workspace in [`LifecycleState::Failed`];
    /// call [`Workspace::reset`] before trying again.
    pub async fn initialize(&self, surface: Arc<dyn WindowSurface>) -> Result<()> {
        {
            let mut state = write(&self.state);
            match *state {
                LifecycleState::Created => *state = LifecycleState::Initializing,
                LifecycleState::Failed => return Err(LifecycleError::NeedsReset.into()),
                LifecycleState::Disposed => return Err(LifecycleError::Disposed.into()),
                _ => return Err(LifecycleError::AlreadyInitialized.into()),
            }
        }

        *write(&self.shim) = Some(Arc::new(ShimTable::install(surface)));

        match self.attach_all().await {
            Ok(()) => {
                *write(&self.state) = LifecycleState::Ready;
                log::info!("Workspace initialized");
                Ok(())
            }
            Err(e) => {
                *write(&self.state) = LifecycleState::Failed;
                log::error!("Workspace initialization failed: {:#}", e);
                Err(e)
            }
        }
    }

    async fn attach_all(&self) -> Result<()> {
        let env = Env::fetch(self.host.as_ref())
            .await
            .context("Failed to fetch env snapshot")?;

        if let Some(message) = env.version_mismatch() {
            log::warn!("{}", message);
            if let Err(e) = self.host.notify(ECHO_ERROR, vec![json!(message)]).await {
                log::debug!("Failed to report version mismatch: {}", e);
            }
        }

        self.folders.set_folders(&env.workspace_folders);
        self.configurations.update_configurations(env.config.clone());
        let env = Arc::new(env);
        *write(&self.env) = Some(env.clone());

        let host = self.host.clone();
        self.files
            .attach(host.clone(), &env)
            .await
            .context("Failed to attach file operations")?;
        self.content
            .attach(host.clone(), &env)
            .await
            .context("Failed to attach content providers")?;
        self.keymaps
            .attach(host.clone(), &env)
            .await
            .context("Failed to attach keymaps")?;
        self.autocmds
            .attach(host.clone(), &env)
            .await
            .context("Failed to attach autocmds")?;
        self.locations
            .attach(host.clone(), &env)
            .await
            .context("Failed to attach location service")?;
        self.watchers
            .attach(host.clone(), &env)
            .await
            .context("Failed to attach file watchers")?;
        self.documents
            .attach(host, &env)
            .await
            .context("Failed to attach document model")?;
        Ok(())
    }

    /// Resume observing host buffers after [`Workspace::detach`].
    pub async fn attach(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Ready | LifecycleState::Detached => {}
            LifecycleState::Failed => return Err(LifecycleError::NeedsReset.into()),
            LifecycleState::Disposed => return Err(LifecycleError::Disposed.into()),
            _ => return Err(LifecycleError::NotInitialized.into()),
        }
        let env = self.env().ok_or(LifecycleError::NotInitialized)?;
        self.documents
            .attach(self.host.clone(), &env)
            .await
            .context("Failed to reattach document model")?;
        *write(&self.state) = LifecycleState::Ready;
        Ok(())
    }

    /// Stop applying host buffer notifications; cached state stays.
    pub fn detach(&self) {
        self.documents.detach();
        let mut state = write(&self.state);
        if *state == LifecycleState::Ready {
            *state = LifecycleState::Detached;
        }
    }

    /// Drop folders and cached documents while staying attached. After a
    /// failed initialize this also re-arms [`Workspace::initialize`].
    pub fn reset(&self) {
        self.folders.reset();
        self.documents.reset();
        let mut state = write(&self.state);
        if *state == LifecycleState::Failed {
            *state = LifecycleState::Created;
        }
    }

    /// Tear everything down. Each step runs in isolation: an error or panic
    /// in one is logged and the remaining steps still run.
    pub async fn dispose(&self) {
        {
            let mut state = write(&self.state);
            if *state == LifecycleState::Disposed {
                return;
            }
            *state = LifecycleState::Disposed;
        }

        let watchers = self.watchers.clone();
        dispose_step("file watchers", async move {
            watchers.dispose();
            Ok(())
        })
        .await;

        let autocmds = self.autocmds.clone();
        dispose_step("autocmds", async move { autocmds.dispose().await }).await;

        let content = self.content.clone();
        dispose_step("content providers", async move {
            content.dispose();
            Ok(())
        })
        .await;

        let documents = self.documents.clone();
        dispose_step("document model", async move {
            documents.dispose();
            Ok(())
        })
        .await;

        let configurations = self.configurations.clone();
        dispose_step("configurations", async move {
            configurations.dispose();
            Ok(())
        })
        .await;

        let owned: Vec<Disposable> = lock(&self.owned).drain(..).collect();
        dispose_step("registrations", async move {
            for disposable in owned {
                disposable.dispose();
            }
            Ok(())
        })
        .await;

        let keymaps = self.keymaps.clone();
        dispose_step("keymaps", async move {
            keymaps.dispose();
            Ok(())
        })
        .await;

        *write(&self.shim) = None;
        log::info!("Workspace disposed");
    }

    /// Forwarder for a deprecated method, available once initialized.
    pub fn deprecated(&self, name: &str) -> Option<Forwarder> {
        read(&self.shim).as_ref()?.get(name)
    }

    /// Track per-document state produced by `factory`.
    pub fn register_sync<T, F>(&self, factory: F) -> Arc<BufferSync<T>>
    where
        T: SyncItem,
        F: Fn(&Document) -> Option<T> + Send + Sync + 'static,
    {
        let sync = BufferSync::new(&self.documents, factory);
        self.own(&sync);
        sync
    }

    /// Like [`Workspace::register_sync`] with an async factory.
    pub fn register_sync_async<T, F, Fut>(&self, factory: F) -> Arc<BufferSync<T>>
    where
        T: SyncItem,
        F: Fn(Document) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let sync = BufferSync::new_async(&self.documents, factory);
        self.own(&sync);
        sync
    }

    fn own<T: SyncItem>(&self, sync: &Arc<BufferSync<T>>) {
        let weak = Arc::downgrade(sync);
        let mut owned = lock(&self.owned);
        owned.retain(|d| !d.is_disposed());
        owned.push(Disposable::from_fn(move || {
            if let Some(sync) = weak.upgrade() {
                sync.dispose();
            }
        }));
    }

    /// Run a host command. `timeout` falls back to the configured default;
    /// on timeout the host-side command keeps running.
    pub async fn execute_command(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> HostResult<Value> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(json!(name));
        params.extend(args);
        call_with_timeout(
            self.host.clone(),
            EXECUTE_COMMAND,
            params,
            timeout.or(self.config.command_timeout),
        )
        .await
    }

    /// Route a host notification. Returns whether anything consumed it.
    pub async fn handle_notification(&self, method: &str, params: Vec<Value>) -> Result<bool> {
        if self.documents.handle_notification(method, &params)? {
            return Ok(true);
        }
        match method {
            "do_autocmd" | "do_keymap" => {
                self.handle_request(method, params).await?;
            }
            "file_change" => {
                let path: PathBuf = decode(method, param(&params, 0)?)?;
                let kind = match param(&params, 1)?.as_str() {
                    Some("created") => FileChangeKind::Created,
                    Some("deleted") => FileChangeKind::Deleted,
                    _ => FileChangeKind::Changed,
                };
                self.watchers.dispatch(&path, kind);
            }
            "config_change" => {
                self.configurations.update_configurations(param(&params, 0)?);
            }
            "content_change" => {
                let uri: Url = decode(method, param(&params, 0)?)?;
                self.content.fire_change(&uri);
            }
            "task_stdout" | "task_stderr" | "task_exit" => {
                let tasks: Vec<Arc<Task>> = {
                    let mut tasks = lock(&self.tasks);
                    tasks.retain(|t| t.strong_count() > 0);
                    tasks.iter().filter_map(Weak::upgrade).collect()
                };
                return Ok(tasks.iter().any(|t| t.handle_notification(method, &params)));
            }
            _ => {
                log::debug!("Unhandled host notification '{}'", method);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Answer a host request addressed to the workspace.
    pub async fn handle_request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        match method {
            "provide_content" => {
                let uri: Url = decode(method, param(&params, 0)?)?;
                Ok(json!(self.content.provide(&uri).await?))
            }
            "do_autocmd" => {
                let id: u32 = decode(method, param(&params, 0)?)?;
                self.autocmds.dispatch(id, params.into_iter().skip(1).collect()).await
            }
            "do_keymap" => {
                let mode: MapMode = decode(method, param(&params, 0)?)?;
                let key: String = decode(method, param(&params, 1)?)?;
                self.keymaps.dispatch(mode, &key).await
            }
            _ => Err(anyhow!("Unknown request '{}'", method)),
        }
    }

    /// Key/value store at `<extension_root>/<name>.json`.
    pub fn create_database(&self, name: &str) -> Result<KeyValueStore> {
        let env = self.env().ok_or(LifecycleError::NotInitialized)?;
        Ok(KeyValueStore::new(&env.extension_root, name))
    }

    /// MRU list under the data directory.
    pub fn create_mru(&self, name: &str) -> Mru {
        Mru::new(&self.config.data_dir(), name)
    }

    /// Host task bound to `id`; its output notifications are routed here.
    pub fn create_task(&self, id: &str) -> Arc<Task> {
        let task = Arc::new(Task::new(id, self.host.clone()));
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| t.strong_count() > 0);
        tasks.push(Arc::downgrade(&task));
        task
    }

    pub async fn create_terminal(&self, options: &TerminalOptions) -> Result<TerminalSession> {
        TerminalSession::create(self.host.clone(), options).await
    }
}

/// Run one teardown step on its own task so a panic stays contained.
async fn dispose_step<F>(name: &str, step: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(step).await {
        Ok(Ok(())) => log::debug!("Disposed {}", name),
        Ok(Err(e)) => log::error!("Failed to dispose {}: {:#}", name, e),
        Err(e) if e.is_panic() => log::error!("Panic while disposing {}", name),
        Err(e) => log::error!("Dispose task for {} failed: {}", name, e),
    }
}

fn param(params: &[Value], idx: usize) -> Result<Value> {
    params
        .get(idx)
        .cloned()
        .ok_or_else(|| anyhow!("missing parameter {}", idx))
}
