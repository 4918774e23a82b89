//! File system watcher registry.
//!
//! Watchers are glob subscriptions. Change notifications come from a
//! `notify` backend over the workspace folders, or are injected with
//! [`WatcherRegistry::dispatch`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tokio::sync::mpsc;

use crate::core::{ConfigurationStore, WorkspaceFolderRegistry};
use crate::event::{self, Disposable, Emitter};
use crate::host::{Env, HostConnection};
use crate::util::{lock, read, write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherOptions {
    pub ignore_create: bool,
    pub ignore_change: bool,
    pub ignore_delete: bool,
}

/// One glob subscription
pub struct FileSystemWatcher {
    id: u64,
    glob: String,
    pattern: Regex,
    options: WatcherOptions,
    disposed: AtomicBool,
    on_did_create: Emitter<PathBuf>,
    on_did_change: Emitter<PathBuf>,
    on_did_delete: Emitter<PathBuf>,
}

impl FileSystemWatcher {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.pattern.is_match(&path.to_string_lossy())
    }

    pub fn on_did_create(&self) -> event::Event<PathBuf> {
        self.on_did_create.event()
    }

    pub fn on_did_change(&self) -> event::Event<PathBuf> {
        self.on_did_change.event()
    }

    pub fn on_did_delete(&self) -> event::Event<PathBuf> {
        self.on_did_delete.event()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.on_did_create.clear();
        self.on_did_change.clear();
        self.on_did_delete.clear();
    }

    fn deliver(&self, path: &Path, kind: FileChangeKind) {
        if self.is_disposed() || !self.matches(path) {
            return;
        }
        let path = path.to_path_buf();
        match kind {
            FileChangeKind::Created if !self.options.ignore_create => self.on_did_create.fire(&path),
            FileChangeKind::Changed if !self.options.ignore_change => self.on_did_change.fire(&path),
            FileChangeKind::Deleted if !self.options.ignore_delete => self.on_did_delete.fire(&path),
            _ => {}
        }
    }
}

pub struct WatcherRegistry {
    configurations: Arc<ConfigurationStore>,
    folders: Arc<WorkspaceFolderRegistry>,
    next_id: AtomicU64,
    watchers: RwLock<Vec<Arc<FileSystemWatcher>>>,
    backend: Mutex<Option<RecommendedWatcher>>,
    roots: Mutex<Vec<PathBuf>>,
    folder_subscription: Mutex<Option<Disposable>>,
}

impl WatcherRegistry {
    pub fn new(
        configurations: Arc<ConfigurationStore>,
        folders: Arc<WorkspaceFolderRegistry>,
    ) -> Self {
        Self {
            configurations,
            folders,
            next_id: AtomicU64::new(0),
            watchers: RwLock::new(Vec::new()),
            backend: Mutex::new(None),
            roots: Mutex::new(Vec::new()),
            folder_subscription: Mutex::new(None),
        }
    }

    /// Start the file-system backend over the workspace folders unless
    /// `fileSystemWatch.enable` is false.
    pub async fn attach(self: &Arc<Self>, _host: Arc<dyn HostConnection>, _env: &Env) -> Result<()> {
        self.stop_backend();
        if !self.configurations.get_or("fileSystemWatch.enable", true) {
            log::info!("File system watching disabled by configuration");
            return Ok(());
        }

        self.start_backend()?;
        for folder in self.folders.folders() {
            if let Some(path) = folder.path() {
                self.watch_root(&path);
            }
        }

        let this = Arc::downgrade(self);
        let subscription = self.folders.on_did_change().subscribe(move |change| {
            let Some(this) = this.upgrade() else {
                return;
            };
            for folder in &change.added {
                if let Some(path) = folder.path() {
                    this.watch_root(&path);
                }
            }
            for folder in &change.removed {
                if let Some(path) = folder.path() {
                    this.unwatch_root(&path);
                }
            }
        });
        *lock(&self.folder_subscription) = Some(subscription);
        Ok(())
    }

    /// Subscribe to changes of files matching `glob`.
    pub fn create_watcher(&self, glob: &str, options: WatcherOptions) -> Result<Arc<FileSystemWatcher>> {
        let pattern = glob_to_regex(glob)
            .with_context(|| format!("Invalid watch pattern '{}'", glob))?;
        let watcher = Arc::new(FileSystemWatcher {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            glob: glob.to_string(),
            pattern,
            options,
            disposed: AtomicBool::new(false),
            on_did_create: Emitter::new(),
            on_did_change: Emitter::new(),
            on_did_delete: Emitter::new(),
        });
        write(&self.watchers).push(watcher.clone());
        Ok(watcher)
    }

    pub fn watcher_count(&self) -> usize {
        read(&self.watchers).iter().filter(|w| !w.is_disposed()).count()
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.backend).is_some()
    }

    /// Folder roots currently handed to the backend
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        lock(&self.roots).clone()
    }

    /// Deliver a change to every live watcher whose glob matches.
    pub fn dispatch(&self, path: &Path, kind: FileChangeKind) {
        let watchers: Vec<Arc<FileSystemWatcher>> = {
            let mut watchers = write(&self.watchers);
            watchers.retain(|w| !w.is_disposed());
            watchers.clone()
        };
        for watcher in watchers {
            watcher.deliver(path, kind);
        }
    }

    pub fn dispose(&self) {
        self.stop_backend();
        let watchers: Vec<_> = write(&self.watchers).drain(..).collect();
        for watcher in watchers {
            watcher.dispose();
        }
    }

    fn start_backend(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => FileChangeKind::Created,
                        EventKind::Modify(_) => FileChangeKind::Changed,
                        EventKind::Remove(_) => FileChangeKind::Deleted,
                        _ => return,
                    };
                    for path in event.paths {
                        let _ = tx.send((path, kind));
                    }
                }
                Err(e) => log::warn!("File watcher error: {}", e),
            },
            notify::Config::default(),
        )
        .context("Failed to start file system watcher")?;
        *lock(&self.backend) = Some(backend);

        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((path, kind)) = rx.recv().await {
                let Some(registry) = this.upgrade() else {
                    break;
                };
                registry.dispatch(&path, kind);
            }
        });
        Ok(())
    }

    fn stop_backend(&self) {
        if let Some(subscription) = lock(&self.folder_subscription).take() {
            subscription.dispose();
        }
        lock(&self.backend).take();
        lock(&self.roots).clear();
    }

    fn watch_root(&self, root: &Path) {
        if !root.is_dir() {
            return;
        }
        if let Some(backend) = lock(&self.backend).as_mut() {
            match backend.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    log::debug!("Watching {}", root.display());
                    let mut roots = lock(&self.roots);
                    if !roots.iter().any(|r| r == root) {
                        roots.push(root.to_path_buf());
                    }
                }
                Err(e) => log::warn!("Failed to watch {}: {}", root.display(), e),
            }
        }
    }

    fn unwatch_root(&self, root: &Path) {
        if let Some(backend) = lock(&self.backend).as_mut() {
            let _ = backend.unwatch(root);
            log::debug!("Stopped watching {}", root.display());
        }
        lock(&self.roots).retain(|r| r != root);
    }
}

/// Translate a glob (`**`, `*`, `?`, `{a,b}`, `[...]`) into an anchored
/// regex. Relative globs match at any directory depth.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    if !glob.starts_with('/') {
        out.push_str("(?:.*/)?");
    }

    let mut chars = glob.chars().peekable();
    let mut in_group = false;
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' => {
                in_group = true;
                out.push_str("(?:");
            }
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' {
                        out.push_str("\\\\");
                    } else {
                        out.push(inner);
                    }
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> WatcherRegistry {
        WatcherRegistry::new(
            Arc::new(ConfigurationStore::new()),
            Arc::new(WorkspaceFolderRegistry::new()),
        )
    }

    #[test]
    fn test_glob_translation() {
        let rs = glob_to_regex("**/*.rs").unwrap();
        assert!(rs.is_match("/home/u/project/src/main.rs"));
        assert!(!rs.is_match("/home/u/project/src/main.rsx"));

        let json = glob_to_regex("**/{package,tsconfig}.json").unwrap();
        assert!(json.is_match("/p/package.json"));
        assert!(json.is_match("/p/sub/tsconfig.json"));
        assert!(!json.is_match("/p/other.json"));

        let class = glob_to_regex("/abs/[!.]?.txt").unwrap();
        assert!(class.is_match("/abs/ab.txt"));
        assert!(!class.is_match("/abs/.b.txt"));
    }

    #[test]
    fn test_dispatch_respects_glob_and_options() {
        let registry = registry();
        let watcher = registry
            .create_watcher(
                "**/*.toml",
                WatcherOptions {
                    ignore_delete: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let created = seen.clone();
        let _c = watcher
            .on_did_create()
            .subscribe(move |p| created.lock().unwrap().push(("create", p.clone())));
        let deleted = seen.clone();
        let _d = watcher
            .on_did_delete()
            .subscribe(move |p| deleted.lock().unwrap().push(("delete", p.clone())));

        registry.dispatch(Path::new("/w/Cargo.toml"), FileChangeKind::Created);
        registry.dispatch(Path::new("/w/Cargo.lock"), FileChangeKind::Created);
        registry.dispatch(Path::new("/w/Cargo.toml"), FileChangeKind::Deleted);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("create", PathBuf::from("/w/Cargo.toml"))]
        );
    }

    #[test]
    fn test_disposed_watchers_are_pruned() {
        let registry = registry();
        let a = registry.create_watcher("*.rs", WatcherOptions::default()).unwrap();
        let _b = registry.create_watcher("*.md", WatcherOptions::default()).unwrap();

        a.dispose();
        registry.dispatch(Path::new("/x.rs"), FileChangeKind::Changed);

        assert_eq!(registry.watcher_count(), 1);
        assert!(registry.create_watcher("{unclosed", WatcherOptions::default()).is_err());
    }

    #[tokio::test]
    async fn test_attach_respects_disable_flag() {
        let configurations = Arc::new(ConfigurationStore::new());
        configurations.update_configurations(json!({"fileSystemWatch": {"enable": false}}));
        let registry = Arc::new(WatcherRegistry::new(
            configurations,
            Arc::new(WorkspaceFolderRegistry::new()),
        ));

        let host = Arc::new(crate::host::MemoryHost::new());
        registry.attach(host, &Env::default()).await.unwrap();
        assert!(!registry.is_watching());
    }

    #[tokio::test]
    async fn test_folder_reset_unwatches_roots() {
        let dir = tempfile::tempdir().unwrap();
        let folders = Arc::new(WorkspaceFolderRegistry::new());
        folders.set_folders([dir.path().display().to_string()]);
        let registry = Arc::new(WatcherRegistry::new(
            Arc::new(ConfigurationStore::new()),
            folders.clone(),
        ));

        let host = Arc::new(crate::host::MemoryHost::new());
        registry.attach(host, &Env::default()).await.unwrap();
        assert_eq!(registry.watched_roots().len(), 1);

        folders.reset();
        assert!(registry.watched_roots().is_empty());
        assert!(registry.is_watching());
    }
}
