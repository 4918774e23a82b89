//! Storage Collaborators
//!
//! Named key/value stores and most-recently-used lists handed out by the
//! workspace factories.

pub mod db;
pub mod mru;

pub use db::KeyValueStore;
pub use mru::Mru;
