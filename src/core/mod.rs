//! Core State
//!
//! Configuration, workspace folders, and the document model. None of these
//! call the host at construction time.

pub mod configuration;
pub mod document;
pub mod folders;

pub use configuration::{ConfigurationChange, ConfigurationStore};
pub use document::{
    BufferId, BufferInfo, Document, DocumentChange, DocumentContext, DocumentModel,
};
pub use folders::{WorkspaceFolder, WorkspaceFolderRegistry, WorkspaceFoldersChange};
