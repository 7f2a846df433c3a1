//! 响应缓存模块：基于内容指纹的响应存储，支持相似度回退与多策略淘汰。
//!
//! # Response Cache Module
//!
//! Answers repeated or near-repeated prompts locally instead of calling the
//! generation backend again.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseStore`] | Fingerprint-keyed store with similarity fallback and eviction |
//! | [`StoreConfig`] | Capacity, age, similarity threshold and quality floor |
//! | [`CacheRecord`] | One cached response with usage and quality metadata |
//! | [`CacheStats`] | Hit/miss counters and a snapshot of the table |
//! | [`fingerprint`] | Primary key derivation from prompt and context |
//!
//! ## Lookup Order
//!
//! 1. Exact fingerprint of `(prompt, context)`.
//! 2. Best token-overlap match over every stored prompt, at or above
//!    `similarity_threshold`. Ties go to the most recently accessed record.
//!
//! A `min_quality` argument skips records below it (or unscored) for that
//! lookup only; they are not evicted.
//!
//! ## Eviction
//!
//! Records older than `max_age`, or scored below `quality_floor`, are removed
//! first. The store is then cut back to `max_entries` by ascending
//! `(access_count, last_accessed_at)`.
//!
//! ## Example
//!
//! ```rust
//! use ai_lib_dedup::cache::{ResponseStore, StoreConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ai_lib_dedup::Result<()> {
//! let store = ResponseStore::in_memory(StoreConfig::default()).await?;
//! store
//!     .store_response("fib(n)", None, "def fib(n): ...", "sim", 12, 0.001)
//!     .await;
//! assert!(store.get("fib(n)", None, None).await.is_some());
//! # Ok(())
//! # }
//! ```

mod key;
mod record;
mod store;

pub use key::{context_fingerprint, fingerprint, CONTEXT_DELIMITER, FINGERPRINT_LEN};
pub use record::CacheRecord;
pub use store::{CacheStats, ResponseStore, StoreConfig};
