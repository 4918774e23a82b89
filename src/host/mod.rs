//! Host Connection
//!
//! Everything the workspace knows about the editor process goes through the
//! [`HostConnection`] trait: request/response calls and fire-and-forget
//! notifications.

pub mod connection;
pub mod env;
pub mod memory;
pub mod stdio;

pub use connection::{
    call_with_callback, call_with_timeout, decode, HostConnection, HostError, HostResult,
};
pub use env::{Env, API_VERSION};
pub use memory::{CallKind, MemoryHost, RecordedCall, Reply};
pub use stdio::{HostMessage, StdioHost};
