//! Requests, groups and results exchanged between the queue, the aggregator
//! and the execution callback.

use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const PRIORITY_LOW: u8 = 1;
pub const PRIORITY_MEDIUM: u8 = 2;
pub const PRIORITY_HIGH: u8 = 3;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// `req_<unix millis>_<process-wide sequence>`: unique within a process and
/// ordered by submission.
pub fn next_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req_{}_{:06}", Utc::now().timestamp_millis(), seq)
}

pub fn next_batch_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("batch_{}_{}", Utc::now().timestamp_millis(), &uuid[..8])
}

/// A request waiting to be grouped. Never mutated once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub context: Option<String>,
    pub priority: u8,
    pub max_tokens: u32,
    pub temperature: f64,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PendingRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: next_request_id(),
            prompt: prompt.into(),
            context: None,
            priority: PRIORITY_LOW,
            max_tokens: 1000,
            temperature: 0.7,
            submitted_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
    pub fn with_priority(mut self, p: u8) -> Self {
        self.priority = p;
        self
    }
    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }
    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, details: String| {
            Err(Error::validation_with_context(
                "invalid request",
                ErrorContext::new()
                    .with_field_path(format!("request.{}", field))
                    .with_details(details),
            ))
        };
        if !(PRIORITY_LOW..=PRIORITY_HIGH).contains(&self.priority) {
            return invalid("priority", format!("got {}, expected 1..=3", self.priority));
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens", "must be greater than zero".into());
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return invalid("temperature", format!("got {}", self.temperature));
        }
        Ok(())
    }
}

/// Requests judged similar enough to answer with one upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGroup {
    pub id: String,
    /// Similarity-discovery order; the first member seeded the group.
    pub members: Vec<PendingRequest>,
    pub representative_prompt: String,
    pub combined_context: String,
    pub estimated_tokens: u64,
    /// Highest member priority.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

impl BatchGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
    pub fn contains(&self, request_id: &str) -> bool {
        self.members.iter().any(|m| m.id == request_id)
    }
    pub fn member(&self, request_id: &str) -> Option<&PendingRequest> {
        self.members.iter().find(|m| m.id == request_id)
    }
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.id.as_str())
    }
}

/// What the backend produced for one member of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub response: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub model: String,
    pub processing_duration_ms: u64,
}

impl RequestOutcome {
    pub fn new(
        response: impl Into<String>,
        model: impl Into<String>,
        tokens_used: u64,
        cost: f64,
    ) -> Self {
        Self {
            response: response.into(),
            tokens_used,
            cost,
            model: model.into(),
            processing_duration_ms: 0,
        }
    }
    pub fn with_duration(mut self, d: Duration) -> Self {
        self.processing_duration_ms = d.as_millis() as u64;
        self
    }
}

/// Outcome of one execution-callback invocation. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub per_request_result: HashMap<String, RequestOutcome>,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl BatchResult {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            per_request_result: HashMap::new(),
            total_tokens: 0,
            total_cost: 0.0,
            processing_time_ms: 0,
            completed_at: Utc::now(),
        }
    }

    /// Records a member outcome and keeps the totals in step.
    pub fn add_outcome(&mut self, request_id: impl Into<String>, outcome: RequestOutcome) {
        self.total_tokens += outcome.tokens_used;
        self.total_cost += outcome.cost;
        if let Some(prev) = self.per_request_result.insert(request_id.into(), outcome) {
            self.total_tokens -= prev.tokens_used;
            self.total_cost -= prev.cost;
        }
    }

    pub fn with_outcome(mut self, request_id: impl Into<String>, outcome: RequestOutcome) -> Self {
        self.add_outcome(request_id, outcome);
        self
    }

    pub fn finish(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = elapsed.as_millis() as u64;
        self.completed_at = Utc::now();
        self
    }

    pub fn outcome(&self, request_id: &str) -> Option<&RequestOutcome> {
        self.per_request_result.get(request_id)
    }
}
