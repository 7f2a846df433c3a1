//! Per-request lifecycle tracking.

use super::types::{BatchGroup, BatchResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Lifecycle state of a submitted request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Queued {
        /// Zero-based; the next claim starts at position 0.
        position: usize,
        submitted_at: DateTime<Utc>,
        priority: u8,
    },
    Batching {
        batch_id: String,
        group_size: usize,
        submitted_at: DateTime<Utc>,
    },
    Completed {
        batch_id: String,
        completed_at: DateTime<Utc>,
        tokens_used: u64,
        cost: f64,
        model: String,
        response: String,
    },
    Failed {
        batch_id: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
    NotFound,
}

impl RequestStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RequestStatus::Queued { .. } => "queued",
            RequestStatus::Batching { .. } => "batching",
            RequestStatus::Completed { .. } => "completed",
            RequestStatus::Failed { .. } => "failed",
            RequestStatus::NotFound => "not_found",
        }
    }
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed { .. } | RequestStatus::Failed { .. })
    }
}

#[derive(Debug, Clone)]
struct FailedRequest {
    batch_id: String,
    error: String,
    failed_at: DateTime<Utc>,
}

/// Running totals over every batch ever published, unaffected by retention.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchTotals {
    pub completed_batches: u64,
    pub failed_batches: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Cost of batches that merged two or more requests.
    pub merged_cost: f64,
    pub total_processing_ms: u64,
    pub total_members: u64,
}

#[derive(Default)]
struct RegistryState {
    // claim order
    active: Vec<Arc<BatchGroup>>,
    completed: VecDeque<Arc<BatchResult>>,
    failed: HashMap<String, FailedRequest>,
    failed_order: VecDeque<String>,
    totals: BatchTotals,
}

/// Active groups, completed results and failures.
///
/// A group moves from active to completed (or failed) inside one write lock,
/// so a status query never observes a member in neither place.
pub struct StatusRegistry {
    retention: usize,
    state: RwLock<RegistryState>,
}

impl StatusRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn activate(&self, groups: &[Arc<BatchGroup>]) {
        let mut state = self.write();
        state.active.extend(groups.iter().cloned());
    }

    /// Files `result` for `group`. Members the callback did not answer are
    /// marked failed rather than left in `batching`.
    pub fn complete(&self, group: &BatchGroup, mut result: BatchResult) -> Arc<BatchResult> {
        if result.batch_id != group.id {
            warn!(
                expected = %group.id,
                got = %result.batch_id,
                "batch result id mismatch; using group id"
            );
            result.batch_id = group.id.clone();
        }
        let missing: Vec<&str> = group
            .member_ids()
            .filter(|id| !result.per_request_result.contains_key(*id))
            .collect();
        let result = Arc::new(result);

        let mut state = self.write();
        state.active.retain(|g| g.id != group.id);
        for id in &missing {
            Self::record_failure(
                &mut state,
                self.retention,
                id,
                &group.id,
                "no result returned for request",
            );
        }
        let answered = (group.len() - missing.len()) as u64;
        let totals = &mut state.totals;
        totals.completed_batches += 1;
        totals.requests_completed += answered;
        totals.requests_failed += missing.len() as u64;
        totals.total_tokens += result.total_tokens;
        totals.total_cost += result.total_cost;
        if group.len() > 1 {
            totals.merged_cost += result.total_cost;
        }
        totals.total_processing_ms += result.processing_time_ms;
        totals.total_members += group.len() as u64;

        state.completed.push_back(Arc::clone(&result));
        while state.completed.len() > self.retention {
            state.completed.pop_front();
        }
        result
    }

    /// Marks every member of `group` failed with `error`.
    pub fn fail(&self, group: &BatchGroup, error: &str) {
        let mut state = self.write();
        state.active.retain(|g| g.id != group.id);
        for id in group.member_ids() {
            Self::record_failure(&mut state, self.retention, id, &group.id, error);
        }
        state.totals.failed_batches += 1;
        state.totals.requests_failed += group.len() as u64;
        state.totals.total_members += group.len() as u64;
    }

    fn record_failure(
        state: &mut RegistryState,
        retention: usize,
        request_id: &str,
        batch_id: &str,
        error: &str,
    ) {
        let failure = FailedRequest {
            batch_id: batch_id.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        if state.failed.insert(request_id.to_string(), failure).is_none() {
            state.failed_order.push_back(request_id.to_string());
        }
        while state.failed_order.len() > retention {
            if let Some(old) = state.failed_order.pop_front() {
                state.failed.remove(&old);
            }
        }
    }

    /// Status outside the queue: active groups, then completed results, then
    /// failures. The first match wins.
    pub fn lookup(&self, request_id: &str) -> RequestStatus {
        let state = self.read();
        for group in &state.active {
            if let Some(member) = group.member(request_id) {
                return RequestStatus::Batching {
                    batch_id: group.id.clone(),
                    group_size: group.len(),
                    submitted_at: member.submitted_at,
                };
            }
        }
        // newest first: a resubmitted id can only be in the latest result
        for result in state.completed.iter().rev() {
            if let Some(outcome) = result.outcome(request_id) {
                return RequestStatus::Completed {
                    batch_id: result.batch_id.clone(),
                    completed_at: result.completed_at,
                    tokens_used: outcome.tokens_used,
                    cost: outcome.cost,
                    model: outcome.model.clone(),
                    response: outcome.response.clone(),
                };
            }
        }
        if let Some(f) = state.failed.get(request_id) {
            return RequestStatus::Failed {
                batch_id: f.batch_id.clone(),
                error: f.error.clone(),
                failed_at: f.failed_at,
            };
        }
        RequestStatus::NotFound
    }

    pub fn active_groups(&self) -> Vec<Arc<BatchGroup>> {
        self.read().active.clone()
    }

    pub fn completed_results(&self) -> Vec<Arc<BatchResult>> {
        self.read().completed.iter().cloned().collect()
    }

    /// Drops retained results completed before `cutoff`.
    pub fn prune_results(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.write();
        let before = state.completed.len();
        state.completed.retain(|r| r.completed_at >= cutoff);
        before - state.completed.len()
    }

    pub fn active_count(&self) -> usize {
        self.read().active.len()
    }
    pub fn retained_results(&self) -> usize {
        self.read().completed.len()
    }
    pub fn totals(&self) -> BatchTotals {
        self.read().totals.clone()
    }
}
