//! Execution callback boundary.

use super::types::{BatchGroup, BatchResult};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// The host's bridge to the generation backend.
///
/// Invoked once per [`BatchGroup`] with no scheduler locks held; may take as
/// long as the backend does. An `Err` marks every member of the group failed.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, group: &BatchGroup) -> Result<BatchResult>;
}

#[async_trait]
impl<T: BatchExecutor + ?Sized> BatchExecutor for Arc<T> {
    async fn execute(&self, group: &BatchGroup) -> Result<BatchResult> {
        (**self).execute(group).await
    }
}

/// Adapts an async closure into a [`BatchExecutor`].
pub struct FnExecutor<F> {
    func: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(BatchGroup) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BatchResult>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> BatchExecutor for FnExecutor<F>
where
    F: Fn(BatchGroup) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BatchResult>> + Send,
{
    async fn execute(&self, group: &BatchGroup) -> Result<BatchResult> {
        (self.func)(group.clone()).await
    }
}

/// How the groups formed in one cycle are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// One group at a time, highest priority first.
    #[default]
    Sequential,
    /// Up to N callbacks in flight.
    Concurrent { max_concurrency: usize },
}

impl DispatchStrategy {
    pub fn max_in_flight(&self) -> usize {
        match self {
            DispatchStrategy::Sequential => 1,
            DispatchStrategy::Concurrent { max_concurrency } => (*max_concurrency).max(1),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Runs the callback, converting a timeout or a panic into an execution error.
pub(crate) async fn execute_group(
    executor: &dyn BatchExecutor,
    group: &BatchGroup,
    timeout: Option<Duration>,
) -> Result<BatchResult> {
    let call = async {
        match AssertUnwindSafe(executor.execute(group)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(Error::execution_with_context(
                format!("execution callback panicked: {}", panic_message(payload.as_ref())),
                ErrorContext::new()
                    .with_field_path(group.id.clone())
                    .with_source("scheduler"),
            )),
        }
    };
    let result = match timeout {
        None => call.await,
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::execution_with_context(
                format!("execution timed out after {:?}", limit),
                ErrorContext::new()
                    .with_field_path(group.id.clone())
                    .with_source("scheduler"),
            )),
        },
    };
    // Callbacks may surface any error kind; normalise to an execution failure
    // so status records read uniformly.
    result.map_err(|e| match e {
        e @ Error::Execution { .. } => e,
        other => Error::execution_with_context(
            other.to_string(),
            ErrorContext::new().with_field_path(group.id.clone()),
        ),
    })
}
