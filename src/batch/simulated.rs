//! Deterministic stand-in backend.
//!
//! Answers each member with a canned response, charging two tokens per prompt
//! word (capped at the member's `max_tokens`). Useful for demos, load tests
//! and exercising the scheduler without a real provider.

use super::executor::BatchExecutor;
use super::types::{BatchGroup, BatchResult, RequestOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const SIMULATED_MODEL: &str = "simulated";
pub const SIMULATED_COST_PER_TOKEN: f64 = 0.00002;
const PREVIEW_CHARS: usize = 50;

pub struct SimulatedExecutor {
    latency: Duration,
    model: String,
    failing: AtomicBool,
    calls: AtomicUsize,
    members_seen: AtomicUsize,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            model: SIMULATED_MODEL.to_string(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            members_seen: AtomicUsize::new(0),
        }
    }
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// While set, every call fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `execute` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn members_seen(&self) -> usize {
        self.members_seen.load(Ordering::SeqCst)
    }

    pub fn response_for(prompt: &str) -> String {
        let preview: String = prompt.chars().take(PREVIEW_CHARS).collect();
        format!("Response to: {}...", preview)
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchExecutor for SimulatedExecutor {
    async fn execute(&self, group: &BatchGroup) -> Result<BatchResult> {
        let start = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.members_seen.fetch_add(group.len(), Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::execution(format!(
                "simulated backend failure for {}",
                group.id
            )));
        }
        let mut result = BatchResult::new(group.id.clone());
        for member in &group.members {
            let words = member.prompt.split_whitespace().count() as u64;
            let tokens = (words * 2).min(u64::from(member.max_tokens));
            result.add_outcome(
                member.id.clone(),
                RequestOutcome::new(
                    Self::response_for(&member.prompt),
                    self.model.clone(),
                    tokens,
                    tokens as f64 * SIMULATED_COST_PER_TOKEN,
                )
                .with_duration(start.elapsed()),
            );
        }
        Ok(result.finish(start.elapsed()))
    }
}
