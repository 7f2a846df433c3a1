//! State persistence.
//!
//! The engine persists two JSON documents through a [`StateBackend`]: the
//! response cache table and the batch/queue snapshot. Backends are pluggable
//! the same way cache backends are:
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`FileBackend`] | One JSON file per document in a directory |
//! | [`MemoryBackend`] | In-process documents, for tests and ephemeral engines |
//! | [`NullBackend`] | No persistence |
//!
//! Persistence is at-least-once: callers log write failures and keep their
//! in-memory state authoritative until the next successful write.

mod backend;

pub use backend::{Document, FileBackend, MemoryBackend, NullBackend, StateBackend};
