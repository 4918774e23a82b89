//! File operation pipeline: create, rename, and delete with will/did events.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use serde_json::json;
use tower_lsp::lsp_types::Url;

use crate::core::DocumentModel;
use crate::event::{Emitter, Event};
use crate::host::{Env, HostConnection};
use crate::util::{read, write};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateFileOptions {
    pub overwrite: bool,
    pub ignore_if_exists: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenameFileOptions {
    pub overwrite: bool,
    pub ignore_if_exists: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteFileOptions {
    pub recursive: bool,
    pub ignore_if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCreate {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRename {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDelete {
    pub path: PathBuf,
}

pub struct FileOperationPipeline {
    documents: Arc<DocumentModel>,
    host: RwLock<Option<Arc<dyn HostConnection>>>,
    on_will_create_files: Emitter<FileCreate>,
    on_did_create_files: Emitter<FileCreate>,
    on_will_rename_files: Emitter<FileRename>,
    on_did_rename_files: Emitter<FileRename>,
    on_will_delete_files: Emitter<FileDelete>,
    on_did_delete_files: Emitter<FileDelete>,
}

impl FileOperationPipeline {
    pub const RENAME_BUFFER: &'static str = "rename_buffer";

    pub fn new(documents: Arc<DocumentModel>) -> Self {
        Self {
            documents,
            host: RwLock::new(None),
            on_will_create_files: Emitter::new(),
            on_did_create_files: Emitter::new(),
            on_will_rename_files: Emitter::new(),
            on_did_rename_files: Emitter::new(),
            on_will_delete_files: Emitter::new(),
            on_did_delete_files: Emitter::new(),
        }
    }

    pub fn on_will_create_files(&self) -> Event<FileCreate> {
        self.on_will_create_files.event()
    }

    pub fn on_did_create_files(&self) -> Event<FileCreate> {
        self.on_did_create_files.event()
    }

    pub fn on_will_rename_files(&self) -> Event<FileRename> {
        self.on_will_rename_files.event()
    }

    pub fn on_did_rename_files(&self) -> Event<FileRename> {
        self.on_did_rename_files.event()
    }

    pub fn on_will_delete_files(&self) -> Event<FileDelete> {
        self.on_will_delete_files.event()
    }

    pub fn on_did_delete_files(&self) -> Event<FileDelete> {
        self.on_did_delete_files.event()
    }

    pub async fn attach(&self, host: Arc<dyn HostConnection>, _env: &Env) -> Result<()> {
        *write(&self.host) = Some(host);
        Ok(())
    }

    pub async fn create_file(&self, path: &Path, options: CreateFileOptions) -> Result<()> {
        if tokio::fs::try_exists(path).await? && !options.overwrite {
            if options.ignore_if_exists {
                return Ok(());
            }
            bail!("{} already exists", path.display());
        }

        let event = FileCreate {
            path: path.to_path_buf(),
        };
        self.on_will_create_files.fire(&event);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, b"")
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        log::info!("Created file {}", path.display());
        self.on_did_create_files.fire(&event);
        Ok(())
    }

    /// Rename a file on disk; an open document follows the rename.
    pub async fn rename_file(
        &self,
        old_path: &Path,
        new_path: &Path,
        options: RenameFileOptions,
    ) -> Result<()> {
        if !tokio::fs::try_exists(old_path).await? {
            bail!("{} does not exist", old_path.display());
        }
        if tokio::fs::try_exists(new_path).await? && !options.overwrite {
            if options.ignore_if_exists {
                return Ok(());
            }
            bail!("{} already exists", new_path.display());
        }

        let event = FileRename {
            old_path: old_path.to_path_buf(),
            new_path: new_path.to_path_buf(),
        };
        self.on_will_rename_files.fire(&event);
        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(old_path, new_path)
            .await
            .with_context(|| {
                format!("Failed to rename {} to {}", old_path.display(), new_path.display())
            })?;

        let open = Url::from_file_path(old_path)
            .ok()
            .and_then(|uri| self.documents.get_by_uri(&uri));
        let host = read(&self.host).clone();
        if let (Some(doc), Some(host), Ok(new_uri)) = (open, host, Url::from_file_path(new_path)) {
            host.call(Self::RENAME_BUFFER, vec![json!(doc.bufnr), json!(new_uri)])
                .await
                .context("Failed to rename open buffer")?;
        }
        log::info!("Renamed {} to {}", old_path.display(), new_path.display());
        self.on_did_rename_files.fire(&event);
        Ok(())
    }

    pub async fn delete_file(&self, path: &Path, options: DeleteFileOptions) -> Result<()> {
        if !tokio::fs::try_exists(path).await? {
            if options.ignore_if_not_exists {
                return Ok(());
            }
            bail!("{} does not exist", path.display());
        }

        let event = FileDelete {
            path: path.to_path_buf(),
        };
        self.on_will_delete_files.fire(&event);
        let metadata = tokio::fs::metadata(path).await?;
        let removed = if metadata.is_dir() {
            if options.recursive {
                tokio::fs::remove_dir_all(path).await
            } else {
                tokio::fs::remove_dir(path).await
            }
        } else {
            tokio::fs::remove_file(path).await
        };
        removed.with_context(|| format!("Failed to delete {}", path.display()))?;
        log::info!("Deleted {}", path.display());
        self.on_did_delete_files.fire(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BufferInfo, ConfigurationStore, DocumentContext, WorkspaceFolderRegistry};
    use crate::host::MemoryHost;
    use std::sync::Mutex;

    fn pipeline() -> (FileOperationPipeline, Arc<DocumentModel>) {
        let documents = Arc::new(DocumentModel::new(DocumentContext {
            configurations: Arc::new(ConfigurationStore::new()),
            folders: Arc::new(WorkspaceFolderRegistry::new()),
        }));
        (FileOperationPipeline::new(documents.clone()), documents)
    }

    #[tokio::test]
    async fn test_create_respects_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let (files, _) = pipeline();
        let target = dir.path().join("nested").join("new.txt");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let will = seen.clone();
        let _w = files
            .on_will_create_files()
            .subscribe(move |_| will.lock().unwrap().push("will"));
        let did = seen.clone();
        let _d = files
            .on_did_create_files()
            .subscribe(move |_| did.lock().unwrap().push("did"));

        files.create_file(&target, CreateFileOptions::default()).await.unwrap();
        assert!(target.exists());
        assert!(files.create_file(&target, CreateFileOptions::default()).await.is_err());
        files
            .create_file(
                &target,
                CreateFileOptions {
                    ignore_if_exists: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["will", "did"]);
    }

    #[tokio::test]
    async fn test_rename_moves_open_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.rs");
        let new = dir.path().join("new.rs");
        std::fs::write(&old, "fn a() {}").unwrap();

        let host = Arc::new(MemoryHost::new());
        host.reply(DocumentModel::LIST_BUFFERS, json!([]));
        let (files, documents) = pipeline();
        documents.attach(host.clone(), &Env::default()).await.unwrap();
        files.attach(host.clone(), &Env::default()).await.unwrap();
        documents.handle_open(BufferInfo {
            bufnr: 4,
            uri: Url::from_file_path(&old).unwrap(),
            language_id: "rust".to_string(),
            version: 1,
            text: "fn a() {}".to_string(),
        });

        files.rename_file(&old, &new, RenameFileOptions::default()).await.unwrap();

        assert!(!old.exists());
        assert!(new.exists());
        let calls = host.calls_to(FileOperationPipeline::RENAME_BUFFER);
        assert_eq!(calls, vec![vec![json!(4), json!(Url::from_file_path(&new).unwrap())]]);
    }

    #[tokio::test]
    async fn test_delete_directory_needs_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("f"), "x").unwrap();
        let (files, _) = pipeline();

        assert!(files.delete_file(&sub, DeleteFileOptions::default()).await.is_err());
        files
            .delete_file(
                &sub,
                DeleteFileOptions {
                    recursive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!sub.exists());

        files
            .delete_file(
                &sub,
                DeleteFileOptions {
                    ignore_if_not_exists: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
}
