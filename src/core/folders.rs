//! Workspace folder registry.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::Url;

use crate::event::{Emitter, Event};
use crate::util::{read, write};

/// One root folder of the workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFolder {
    pub uri: Url,
    pub name: String,
}

impl WorkspaceFolder {
    pub fn from_path(path: &Path) -> Option<Self> {
        let uri = Url::from_directory_path(path).ok()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Some(Self { uri, name })
    }

    /// Accept either a URI (`file:///...`) or a plain path, as hosts send both.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.contains("://") {
            let uri = Url::parse(raw).ok()?;
            let path = uri.to_file_path().ok()?;
            return Self::from_path(&path);
        }
        Self::from_path(Path::new(raw))
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.uri.to_file_path().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkspaceFoldersChange {
    pub added: Vec<WorkspaceFolder>,
    pub removed: Vec<WorkspaceFolder>,
}

#[derive(Debug, Default)]
pub struct WorkspaceFolderRegistry {
    folders: RwLock<Vec<WorkspaceFolder>>,
    on_did_change: Emitter<WorkspaceFoldersChange>,
}

impl WorkspaceFolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_did_change(&self) -> Event<WorkspaceFoldersChange> {
        self.on_did_change.event()
    }

    /// Replace the folder list (used to seed from the env snapshot).
    pub fn set_folders<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next: Vec<WorkspaceFolder> = Vec::new();
        for raw in entries {
            match WorkspaceFolder::parse(raw.as_ref()) {
                Some(folder) if !next.contains(&folder) => next.push(folder),
                Some(_) => {}
                None => log::warn!("Ignoring invalid workspace folder: {}", raw.as_ref()),
            }
        }

        let change = {
            let mut folders = write(&self.folders);
            let change = WorkspaceFoldersChange {
                added: next.iter().filter(|f| !folders.contains(f)).cloned().collect(),
                removed: folders.iter().filter(|f| !next.contains(f)).cloned().collect(),
            };
            *folders = next;
            change
        };

        if !change.added.is_empty() || !change.removed.is_empty() {
            self.on_did_change.fire(&change);
        }
    }

    pub fn add_folder(&self, folder: WorkspaceFolder) -> bool {
        {
            let mut folders = write(&self.folders);
            if folders.contains(&folder) {
                return false;
            }
            folders.push(folder.clone());
        }
        log::info!("Added workspace folder {}", folder.uri);
        self.on_did_change.fire(&WorkspaceFoldersChange {
            added: vec![folder],
            removed: Vec::new(),
        });
        true
    }

    pub fn remove_folder(&self, uri: &Url) -> bool {
        let removed = {
            let mut folders = write(&self.folders);
            let Some(idx) = folders.iter().position(|f| &f.uri == uri) else {
                return false;
            };
            folders.remove(idx)
        };
        self.on_did_change.fire(&WorkspaceFoldersChange {
            added: Vec::new(),
            removed: vec![removed],
        });
        true
    }

    pub fn folders(&self) -> Vec<WorkspaceFolder> {
        read(&self.folders).clone()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.folders).is_empty()
    }

    /// Innermost folder containing `path`.
    pub fn folder_for(&self, path: &Path) -> Option<WorkspaceFolder> {
        read(&self.folders)
            .iter()
            .filter_map(|f| f.path().map(|root| (root, f)))
            .filter(|(root, _)| path.starts_with(root))
            .max_by_key(|(root, _)| root.components().count())
            .map(|(_, f)| f.clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.folder_for(path).is_some()
    }

    /// Clear every folder, reporting them all as removed.
    pub fn reset(&self) {
        let removed: Vec<WorkspaceFolder> = write(&self.folders).drain(..).collect();
        if !removed.is_empty() {
            self.on_did_change.fire(&WorkspaceFoldersChange {
                added: Vec::new(),
                removed,
            });
        }
    }

    /// Walk up from `file` to the first directory holding any of `patterns`.
    pub fn resolve_root(file: &Path, patterns: &[String]) -> Option<PathBuf> {
        let start = if file.is_dir() { Some(file) } else { file.parent() };
        start?
            .ancestors()
            .find(|dir| patterns.iter().any(|p| dir.join(p).exists()))
            .map(Path::to_path_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_set_folders_reports_added_and_removed() {
        let registry = WorkspaceFolderRegistry::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        let _sub = registry
            .on_did_change()
            .subscribe(move |c| sink.lock().unwrap().push(c.clone()));

        registry.set_folders(["/tmp/a", "file:///tmp/b"]);
        registry.set_folders(["/tmp/b"]);

        let changes = changes.lock().unwrap();
        assert_eq!(changes[0].added.len(), 2);
        assert_eq!(changes[1].removed.len(), 1);
        assert_eq!(changes[1].removed[0].name, "a");
        assert_eq!(registry.folders().len(), 1);
    }

    #[test]
    fn test_folder_for_prefers_innermost() {
        let registry = WorkspaceFolderRegistry::new();
        registry.set_folders(["/tmp/outer", "/tmp/outer/inner"]);

        let found = registry
            .folder_for(Path::new("/tmp/outer/inner/src/main.rs"))
            .unwrap();
        assert_eq!(found.name, "inner");
        assert!(!registry.contains(Path::new("/var/other.rs")));
    }

    #[test]
    fn test_resolve_root_finds_marker() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(project.join(".git")).unwrap();
        std::fs::create_dir_all(project.join("src")).unwrap();
        let file = project.join("src").join("lib.rs");
        std::fs::write(&file, "").unwrap();

        let root = WorkspaceFolderRegistry::resolve_root(&file, &[".git".to_string()]);
        assert_eq!(root, Some(project));
    }

    #[test]
    fn test_reset_reports_every_folder_removed() {
        let registry = WorkspaceFolderRegistry::new();
        registry.set_folders(["/tmp/a", "/tmp/b"]);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        let _sub = registry
            .on_did_change()
            .subscribe(move |change| sink.lock().unwrap().push(change.clone()));

        registry.reset();
        registry.reset();

        assert!(registry.is_empty());
        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].added.is_empty());
        let names: Vec<&str> = changes[0].removed.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
