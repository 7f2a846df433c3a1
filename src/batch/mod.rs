//! 批处理模块：相似请求聚合、后台调度与请求状态跟踪。
//!
//! # Adaptive Batching Module
//!
//! Requests that miss the response cache are queued here and merged into
//! fewer, larger upstream calls.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RequestQueue`] | FIFO of pending requests with size/age flush decisions |
//! | [`BatchConfig`] | Batch size, wait time, grouping threshold and dispatch strategy |
//! | [`aggregator::group`] | Greedy similarity grouping of one cycle's requests |
//! | [`BatchExecutor`] | The host-supplied execution callback |
//! | [`DispatchScheduler`] | Background loop: collect, group, dispatch, publish |
//! | [`StatusRegistry`] | Per-request lifecycle for status queries |
//! | [`BatchObserver`] | Ready/complete/failed notifications |
//!
//! ## Lifecycle
//!
//! ```text
//! queued -> batching -> completed
//!                    \-> failed
//! ```
//!
//! A failed request is never retried; resubmitting creates a new request id.
//!
//! ## Example
//!
//! ```rust
//! use ai_lib_dedup::batch::{aggregator, PendingRequest};
//!
//! let groups = aggregator::group(
//!     vec![
//!         PendingRequest::new("what is a monad"),
//!         PendingRequest::new("what is a monad"),
//!         PendingRequest::new("sort a vector in rust"),
//!     ],
//!     5,
//!     0.6,
//! );
//! assert_eq!(groups.len(), 2);
//! assert_eq!(groups[0].len(), 2);
//! ```

pub mod aggregator;
mod collector;
mod executor;
mod observer;
mod registry;
mod scheduler;
mod simulated;
mod types;

pub use collector::{BatchConfig, FlushDecision, QueueAddResult, RequestQueue};
pub use executor::{BatchExecutor, DispatchStrategy, FnExecutor};
pub use observer::{BatchObserver, ObserverRegistry};
pub use registry::{BatchTotals, RequestStatus, StatusRegistry};
pub use scheduler::{BatchSnapshot, BatchStats, DispatchScheduler, BATCHING_SAVINGS_RATIO};
pub use simulated::{SimulatedExecutor, SIMULATED_COST_PER_TOKEN, SIMULATED_MODEL};
pub use types::{
    next_batch_id, next_request_id, BatchGroup, BatchResult, PendingRequest, RequestOutcome,
    PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MEDIUM,
};
