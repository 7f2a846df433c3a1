//! Runs the engine against the simulated backend.
//!
//! Submits a handful of overlapping prompts, waits for the scheduler to batch
//! them, then asks again to show cache hits. Configure with `DEDUP_CONFIG`
//! (YAML or JSON) and `DEDUP_STATE_DIR`; log level via `RUST_LOG`.

use ai_lib_dedup::batch::{PendingRequest, SimulatedExecutor, PRIORITY_HIGH};
use ai_lib_dedup::{Engine, EngineConfig, RequestStatus, Submission};
use anyhow::Context;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PROMPTS: &[(&str, u8)] = &[
    ("Explain Rust ownership in one paragraph", 1),
    ("explain rust ownership in one short paragraph", 1),
    ("What is the capital of France?", PRIORITY_HIGH),
    ("Explain Rust ownership in one paragraph", 1),
    ("Write a haiku about compilers", 2),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = EngineConfig::from_env()
        .await
        .context("failed to load engine configuration")?;
    if std::env::var_os(ai_lib_dedup::config::CONFIG_PATH_ENV).is_none() {
        // keep the demo short
        config.batch.max_wait_time = Duration::from_secs(2);
        config.batch.poll_interval = Duration::from_millis(200);
    }
    let wait = config.batch.max_wait_time;

    let engine = Engine::builder()
        .with_config(config)
        .with_executor(SimulatedExecutor::new().with_latency(Duration::from_millis(150)))
        .build()
        .await
        .context("failed to build engine")?;
    engine.start()?;

    let mut queued = Vec::new();
    for (prompt, priority) in PROMPTS {
        let request = PendingRequest::new(*prompt).with_priority(*priority);
        match engine.request(request, None).await? {
            Submission::Cached(record) => {
                info!(prompt, fingerprint = %record.fingerprint, "answered from cache")
            }
            Submission::Queued(id) => {
                info!(prompt, request_id = %id, "queued");
                queued.push(id);
            }
        }
    }

    let deadline = tokio::time::Instant::now() + wait * 3 + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline
        && !queued.iter().all(|id| engine.status(id).is_terminal())
    {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for id in &queued {
        match engine.status(id) {
            RequestStatus::Completed { batch_id, tokens_used, cost, response, .. } => {
                info!(request_id = %id, %batch_id, tokens_used, cost, %response, "completed")
            }
            other => info!(request_id = %id, status = other.label(), "not completed"),
        }
    }

    for (prompt, _) in PROMPTS.iter().take(2) {
        let hit = engine.get_cached(prompt, None, None).await.is_some();
        info!(prompt, hit, "second lookup");
    }

    let stats = engine.stats().await;
    info!(
        entries = stats.entry_count,
        queue_depth = stats.queue_depth,
        completed_batches = stats.completed_batches,
        hit_ratio = stats.cache.hit_ratio(),
        avg_batch_size = stats.batch.avg_batch_size,
        estimated_savings = stats.estimated_savings,
        "engine stats"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    engine.stop().await?;
    Ok(())
}
