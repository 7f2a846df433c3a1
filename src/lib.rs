//! # ai-lib-dedup
//!
//! 请求去重与自适应批处理引擎：用本地缓存回答重复请求，并将相似的待处理请求合并为更少的上游调用。
//!
//! Request deduplication and adaptive batching for generative-text backends.
//!
//! ## Overview
//!
//! Repeated calls to a generation service are expensive. This library cuts
//! them down two ways:
//!
//! - **Deduplication**: responses are cached under a fingerprint of
//!   `(prompt, context)`. A miss falls back to token-overlap similarity, so a
//!   near-repeat can still be answered locally.
//! - **Adaptive batching**: requests that miss are queued. A background
//!   scheduler groups similar ones and flushes on batch size or wait time,
//!   handing each group to a host-supplied execution callback.
//!
//! The library never calls a backend itself; the host injects a
//! [`batch::BatchExecutor`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_lib_dedup::batch::{PendingRequest, SimulatedExecutor};
//! use ai_lib_dedup::{Engine, EngineConfig, Submission};
//!
//! #[tokio::main]
//! async fn main() -> ai_lib_dedup::Result<()> {
//!     let engine = Engine::builder()
//!         .with_config(EngineConfig::new().with_state_dir(".dedup"))
//!         .with_executor(SimulatedExecutor::new())
//!         .build()
//!         .await?;
//!     engine.start()?;
//!
//!     match engine.request(PendingRequest::new("explain borrowing"), None).await? {
//!         Submission::Cached(record) => println!("{}", record.response),
//!         Submission::Queued(id) => println!("queued as {}", id),
//!     }
//!
//!     engine.stop().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Fingerprinted response store, similarity fallback, eviction |
//! | [`batch`] | Request queue, grouping, dispatch scheduler, status registry |
//! | [`similarity`] | Token-overlap (Jaccard) scoring |
//! | [`storage`] | Pluggable persistence for the cache and batch state |
//! | [`config`] | Engine configuration and file loading |
//! | [`engine`] | The combined engine handle |

pub mod batch;
pub mod cache;
pub mod config;
pub mod engine;
pub mod similarity;
pub mod storage;

pub use batch::{BatchExecutor, PendingRequest, RequestStatus};
pub use cache::{CacheRecord, ResponseStore, StoreConfig};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineStats, Submission};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
