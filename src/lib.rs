//! Editor Workspace
//!
//! The orchestration core of an editor integration runtime. A remote editor
//! (the host) owns buffers and UI; this crate mirrors its documents, holds
//! configuration and workspace folders, and exposes services on top.
//!
//! This library provides:
//! - Typed events and disposable registrations
//! - A host connection over framed JSON-RPC, plus an in-memory host
//! - Core state: configuration, workspace folders, documents
//! - Mid-level services: file operations, content providers, keymaps,
//!   autocmds, locations, file watchers, tasks and terminals
//! - The [`Workspace`] orchestrator with per-document state registries

pub mod config;
pub mod core;
pub mod event;
pub mod host;
pub mod server;
pub mod services;
pub mod storage;
pub mod workspace;

mod util;

// Re-exports for clean public API
pub use config::Config;
pub use event::{Disposable, Emitter, Event};
pub use host::{Env, HostConnection, HostError, HostResult, MemoryHost};
pub use workspace::{BufferSync, LifecycleError, LifecycleState, SyncItem, Workspace};
