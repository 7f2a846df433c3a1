//! Response store.

use super::key::fingerprint;
use super::record::{clamp_quality, CacheRecord};
use crate::config::duration_secs;
use crate::similarity::{self, DEFAULT_CACHE_THRESHOLD};
use crate::storage::{Document, NullBackend, StateBackend};
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Capacity; least-used records go first once exceeded.
    pub max_entries: usize,
    /// Records older than this are evicted.
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
    /// Minimum Jaccard score for a similarity hit. Zero disables the fallback.
    pub similarity_threshold: f64,
    /// Scored records below this are evicted. Unscored records are kept.
    pub quality_floor: Option<f64>,
    /// Run eviction after every `put`.
    pub auto_cleanup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            similarity_threshold: DEFAULT_CACHE_THRESHOLD,
            quality_floor: Some(0.3),
            auto_cleanup: true,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }
    pub fn with_similarity_threshold(mut self, t: f64) -> Self {
        self.similarity_threshold = t;
        self
    }
    pub fn with_quality_floor(mut self, floor: Option<f64>) -> Self {
        self.quality_floor = floor;
        self
    }
    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, details: String| {
            Err(Error::configuration_with_context(
                "invalid store configuration",
                ErrorContext::new()
                    .with_field_path(format!("store.{}", field))
                    .with_details(details)
                    .with_source("response_store"),
            ))
        };
        if self.max_entries == 0 {
            return invalid("max_entries", "must be greater than zero".into());
        }
        if self.max_age.is_zero() {
            return invalid("max_age", "must be greater than zero".into());
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return invalid(
                "similarity_threshold",
                format!("got {}, expected 0.0..=1.0", self.similarity_threshold),
            );
        }
        if let Some(floor) = self.quality_floor {
            if !(0.0..=1.0).contains(&floor) {
                return invalid("quality_floor", format!("got {}, expected 0.0..=1.0", floor));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub exact_hits: u64,
    pub similarity_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub persist_errors: u64,
    pub total_entries: usize,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_accesses: u64,
    pub avg_quality_score: f64,
    pub models_used: Vec<String>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    /// Cost of the upstream calls avoided by hits so far.
    pub estimated_savings: f64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    exact_hits: AtomicU64,
    similarity_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    persist_errors: AtomicU64,
}

/// Fingerprint-keyed response cache with similarity fallback and
/// age/quality/capacity eviction.
///
/// Every read-modify-write runs under one async mutex, including the persist
/// that follows it, so eviction never interleaves with a hit's access update.
pub struct ResponseStore {
    config: StoreConfig,
    records: Mutex<HashMap<String, CacheRecord>>,
    backend: Arc<dyn StateBackend>,
    stats: AtomicStats,
}

impl ResponseStore {
    /// Validates `config` and loads any persisted records. A backend that
    /// cannot be read is logged and the store starts empty.
    pub async fn open(config: StoreConfig, backend: Arc<dyn StateBackend>) -> Result<Self> {
        config.validate()?;
        let store = Self {
            config,
            records: Mutex::new(HashMap::new()),
            backend,
            stats: AtomicStats::default(),
        };
        let loaded = store.load().await;
        let mut records = store.records.lock().await;
        *records = loaded;
        if store.config.auto_cleanup && store.evict_locked(&mut records, None) > 0 {
            store.persist_locked(&records).await;
        }
        drop(records);
        Ok(store)
    }

    /// Store without persistence.
    pub async fn in_memory(config: StoreConfig) -> Result<Self> {
        Self::open(config, Arc::new(NullBackend)).await
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn load(&self) -> HashMap<String, CacheRecord> {
        let data = match self.backend.read(Document::Responses).await {
            Ok(Some(data)) => data,
            Ok(None) => return HashMap::new(),
            Err(e) => {
                self.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, backend = self.backend.name(), "could not load response cache");
                return HashMap::new();
            }
        };
        match serde_json::from_slice::<HashMap<String, CacheRecord>>(&data) {
            Ok(records) => {
                info!(entries = records.len(), "loaded response cache");
                // Re-key on the record's own fingerprint so a hand-edited file
                // cannot introduce two keys for one record.
                records
                    .into_values()
                    .map(|r| (r.fingerprint.clone(), r))
                    .collect()
            }
            Err(e) => {
                self.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "response cache document is corrupt; starting empty");
                HashMap::new()
            }
        }
    }

    async fn write_locked(&self, records: &HashMap<String, CacheRecord>) -> Result<()> {
        let data = serde_json::to_vec_pretty(records)?;
        self.backend.write(Document::Responses, &data).await
    }

    async fn persist_locked(&self, records: &HashMap<String, CacheRecord>) {
        if let Err(e) = self.write_locked(records).await {
            self.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, backend = self.backend.name(), "failed to persist response cache");
        }
    }

    /// Writes the current table and returns any backend error.
    pub async fn flush(&self) -> Result<()> {
        let records = self.records.lock().await;
        self.write_locked(&records).await
    }

    /// Exact fingerprint lookup, then similarity fallback. A record below
    /// `min_quality` (or unscored, when a minimum is given) is skipped for this
    /// call only. Hits update access time and count before returning.
    pub async fn get(
        &self,
        prompt: &str,
        context: Option<&str>,
        min_quality: Option<f64>,
    ) -> Option<CacheRecord> {
        let fp = fingerprint(prompt, context);
        let mut records = self.records.lock().await;

        let exact = records
            .get(&fp)
            .map_or(false, |r| r.meets_quality(min_quality));
        let key = if exact {
            Some(fp)
        } else {
            let candidates: Vec<&CacheRecord> = records
                .values()
                .filter(|r| r.meets_quality(min_quality))
                .collect();
            similarity::best_match(
                prompt,
                candidates
                    .iter()
                    .map(|r| (r.prompt.as_str(), r.last_accessed_at)),
                self.config.similarity_threshold,
            )
            .map(|m| candidates[m.index].fingerprint.clone())
        };

        let Some(key) = key else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fingerprint(prompt, context), "cache miss");
            return None;
        };
        let hit = match records.get_mut(&key) {
            Some(record) => {
                record.touch();
                record.clone()
            }
            None => return None,
        };
        if exact {
            self.stats.exact_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.similarity_hits.fetch_add(1, Ordering::Relaxed);
        }
        debug!(fingerprint = %key, exact, access_count = hit.access_count, "cache hit");
        self.persist_locked(&records).await;
        Some(hit)
    }

    /// Inserts or replaces the record under its fingerprint, runs eviction
    /// (the new record is never the capacity victim) and persists. A quality
    /// score outside `0.0..=1.0` is clamped; NaN is dropped.
    pub async fn put(&self, mut record: CacheRecord) -> String {
        record.quality_score = record.quality_score.and_then(clamp_quality);
        let fp = record.fingerprint.clone();
        let mut records = self.records.lock().await;
        records.insert(fp.clone(), record);
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        if self.config.auto_cleanup {
            self.evict_locked(&mut records, Some(&fp));
        }
        self.persist_locked(&records).await;
        fp
    }

    /// Convenience wrapper building the record from its parts.
    pub async fn store_response(
        &self,
        prompt: &str,
        context: Option<&str>,
        response: &str,
        model: &str,
        tokens_used: u64,
        cost: f64,
    ) -> String {
        self.put(CacheRecord::new(prompt, context, response, model, tokens_used, cost))
            .await
    }

    /// Applies age, quality and capacity policy. Returns how many records were
    /// removed; a second call with no intervening `put` removes nothing.
    pub async fn evict(&self) -> usize {
        let mut records = self.records.lock().await;
        let removed = self.evict_locked(&mut records, None);
        if removed > 0 {
            self.persist_locked(&records).await;
        }
        removed
    }

    fn evict_locked(
        &self,
        records: &mut HashMap<String, CacheRecord>,
        protect: Option<&str>,
    ) -> usize {
        let before = records.len();
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 1000));
        let floor = self.config.quality_floor;

        records.retain(|_, r| {
            let too_old = r.age(now) > max_age;
            let too_poor = matches!((r.quality_score, floor), (Some(q), Some(f)) if q < f);
            !(too_old || too_poor)
        });

        if records.len() > self.config.max_entries {
            let mut victims: Vec<(u64, DateTime<Utc>, String)> = records
                .values()
                .filter(|r| Some(r.fingerprint.as_str()) != protect)
                .map(|r| (r.access_count, r.last_accessed_at, r.fingerprint.clone()))
                .collect();
            victims.sort();
            let excess = records.len() - self.config.max_entries;
            for (_, _, fp) in victims.into_iter().take(excess) {
                records.remove(&fp);
            }
        }

        let removed = before - records.len();
        if removed > 0 {
            self.stats.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, remaining = records.len(), "cache eviction");
        }
        removed
    }

    /// Deletes every record, or only those created at least `older_than` ago.
    pub async fn purge(&self, older_than: Option<Duration>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        match older_than {
            None => records.clear(),
            Some(age) => {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
                records.retain(|_, r| r.created_at > cutoff);
            }
        }
        let removed = before - records.len();
        info!(removed, "cache purge");
        self.persist_locked(&records).await;
        removed
    }

    /// Keeps one record per distinct prompt, ranked by quality (absent counts
    /// as zero), then recency, then access count.
    pub async fn dedupe(&self) -> usize {
        let mut records = self.records.lock().await;
        let removed = Self::dedupe_locked(&mut records);
        if removed > 0 {
            info!(removed, "cache dedupe");
            self.persist_locked(&records).await;
        }
        removed
    }

    fn dedupe_locked(records: &mut HashMap<String, CacheRecord>) -> usize {
        let mut by_prompt: HashMap<&str, Vec<&CacheRecord>> = HashMap::new();
        for r in records.values() {
            by_prompt.entry(r.prompt.as_str()).or_default().push(r);
        }
        let mut losers = Vec::new();
        for mut group in by_prompt.into_values().filter(|g| g.len() > 1) {
            group.sort_by(|a, b| {
                let qa = a.quality_score.unwrap_or(0.0);
                let qb = b.quality_score.unwrap_or(0.0);
                qb.partial_cmp(&qa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.last_accessed_at.cmp(&a.last_accessed_at))
                    .then(b.access_count.cmp(&a.access_count))
            });
            losers.extend(group.into_iter().skip(1).map(|r| r.fingerprint.clone()));
        }
        for fp in &losers {
            records.remove(fp);
        }
        losers.len()
    }

    /// Dedupe followed by a full eviction pass.
    pub async fn optimize(&self) -> usize {
        let mut records = self.records.lock().await;
        let removed = Self::dedupe_locked(&mut records) + self.evict_locked(&mut records, None);
        if removed > 0 {
            self.persist_locked(&records).await;
        }
        removed
    }

    /// Applies an externally computed quality score. Returns `false` when the
    /// fingerprint is unknown.
    pub async fn update_quality(&self, fingerprint: &str, score: f64) -> Result<bool> {
        if !(0.0..=1.0).contains(&score) {
            return Err(Error::validation_with_context(
                "quality score out of range",
                ErrorContext::new()
                    .with_field_path("quality_score")
                    .with_details(format!("got {}, expected 0.0..=1.0", score)),
            ));
        }
        let mut records = self.records.lock().await;
        match records.get_mut(fingerprint) {
            Some(record) => record.quality_score = Some(score),
            None => return Ok(false),
        }
        self.persist_locked(&records).await;
        Ok(true)
    }

    pub async fn remove(&self, fingerprint: &str) -> bool {
        let mut records = self.records.lock().await;
        let removed = records.remove(fingerprint).is_some();
        if removed {
            self.persist_locked(&records).await;
        }
        removed
    }

    /// Record by fingerprint without counting an access.
    pub async fn peek(&self, fingerprint: &str) -> Option<CacheRecord> {
        self.records.lock().await.get(fingerprint).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let records = self.records.lock().await;
        let exact_hits = self.stats.exact_hits.load(Ordering::Relaxed);
        let similarity_hits = self.stats.similarity_hits.load(Ordering::Relaxed);
        let scores: Vec<f64> = records.values().filter_map(|r| r.quality_score).collect();
        let models: BTreeSet<&str> = records.values().map(|r| r.model.as_str()).collect();
        CacheStats {
            hits: exact_hits + similarity_hits,
            exact_hits,
            similarity_hits,
            misses: self.stats.misses.load(Ordering::Relaxed),
            sets: self.stats.sets.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            persist_errors: self.stats.persist_errors.load(Ordering::Relaxed),
            total_entries: records.len(),
            total_cost: records.values().map(|r| r.cost).sum(),
            total_tokens: records.values().map(|r| r.tokens_used).sum(),
            total_accesses: records.values().map(|r| r.access_count).sum(),
            avg_quality_score: if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            },
            models_used: models.into_iter().map(String::from).collect(),
            oldest_entry: records.values().map(|r| r.created_at).min(),
            newest_entry: records.values().map(|r| r.created_at).max(),
            estimated_savings: records.values().map(CacheRecord::savings).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    async fn store(config: StoreConfig) -> ResponseStore {
        ResponseStore::in_memory(config).await.unwrap()
    }

    fn record(prompt: &str) -> CacheRecord {
        CacheRecord::new(prompt, None, format!("answer to {}", prompt), "m", 10, 0.01)
    }

    #[test]
    fn test_store_config_validation() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(StoreConfig::new().with_max_entries(0).validate().is_err());
        assert!(StoreConfig::new().with_similarity_threshold(1.5).validate().is_err());
        assert!(StoreConfig::new().with_quality_floor(Some(-0.1)).validate().is_err());
        assert!(StoreConfig::new().with_max_age(Duration::ZERO).validate().is_err());
        let err = StoreConfig::new().with_max_entries(0).validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let s = store(StoreConfig::default()).await;
        let r = CacheRecord::new("fib(n)", Some("rust"), "fn fib", "m", 10, 0.001);
        let fp = s.put(r.clone()).await;
        assert_eq!(fp, r.fingerprint);

        let hit = s.get("fib(n)", Some("rust"), None).await.unwrap();
        assert_eq!(hit.response, "fn fib");
        assert_eq!(hit.model, "m");
        assert_eq!(hit.tokens_used, 10);
        assert_eq!(hit.cost, 0.001);
        assert_eq!(hit.access_count, 2);
        assert_eq!(s.stats().await.exact_hits, 1);
    }

    #[tokio::test]
    async fn test_similarity_fallback() {
        let s = store(StoreConfig::default()).await;
        s.put(record("how do I reverse a vector in rust today")).await;

        // 8 of 9 distinct tokens overlap: 0.888 >= 0.85
        let hit = s
            .get("how do I reverse a vector in rust", None, None)
            .await
            .unwrap();
        assert_eq!(hit.prompt, "how do I reverse a vector in rust today");
        assert!(s.get("completely different question", None, None).await.is_none());

        let stats = s.stats().await;
        assert_eq!(stats.similarity_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_min_quality_skips_without_evicting() {
        let s = store(StoreConfig::default()).await;
        s.put(record("unscored prompt")).await;
        s.put(record("scored prompt").with_quality(0.6)).await;

        assert!(s.get("unscored prompt", None, Some(0.5)).await.is_none());
        assert!(s.get("scored prompt", None, Some(0.7)).await.is_none());
        assert!(s.get("scored prompt", None, Some(0.5)).await.is_some());
        assert_eq!(s.len().await, 2);
    }

    #[tokio::test]
    async fn test_quality_floor_eviction() {
        let s = store(StoreConfig::default().with_auto_cleanup(false)).await;
        let low = s.put(record("low quality").with_quality(0.2)).await;
        let mid = s.put(record("mid quality").with_quality(0.5)).await;

        assert_eq!(s.evict().await, 1);
        assert!(s.peek(&low).await.is_none());
        assert!(s.peek(&mid).await.is_some());
    }

    #[tokio::test]
    async fn test_age_eviction_and_idempotence() {
        let s = store(StoreConfig::default().with_max_age(Duration::from_secs(3600))).await;
        let old = record("stale")
            .with_created_at(Utc::now() - chrono::Duration::hours(2));
        let old_fp = s.put(old).await;
        // put runs eviction itself
        assert!(s.peek(&old_fp).await.is_none());

        s.put(record("fresh")).await;
        assert_eq!(s.evict().await, 0);
        assert_eq!(s.evict().await, 0);
        assert_eq!(s.len().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_boundary_evicts_exactly_one_lru() {
        let s = store(StoreConfig::default().with_max_entries(3)).await;
        let base = Utc::now() - chrono::Duration::minutes(10);
        let a = s.put(record("alpha").with_created_at(base)).await;
        let b = s
            .put(record("bravo").with_created_at(base + chrono::Duration::minutes(1)))
            .await;
        let c = s
            .put(record("charlie").with_created_at(base + chrono::Duration::minutes(2)))
            .await;
        assert_eq!(s.len().await, 3);

        let d = s.put(record("delta")).await;
        assert_eq!(s.len().await, 3);
        assert!(s.peek(&a).await.is_none());
        for fp in [&b, &c, &d] {
            assert!(s.peek(fp).await.is_some());
        }
        assert_eq!(s.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_capacity_prefers_evicting_less_accessed() {
        let s = store(StoreConfig::default().with_max_entries(2)).await;
        let old = Utc::now() - chrono::Duration::minutes(5);
        let popular = s.put(record("popular entry").with_created_at(old)).await;
        let lonely = s.put(record("lonely entry")).await;
        s.get("popular entry", None, None).await.unwrap();

        s.put(record("newcomer entry")).await;
        assert!(s.peek(&popular).await.is_some());
        assert!(s.peek(&lonely).await.is_none());
    }

    #[tokio::test]
    async fn test_new_record_is_never_the_capacity_victim() {
        let s = store(StoreConfig::default().with_max_entries(2)).await;
        let a = s.put(record("alpha")).await;
        let b = s.put(record("bravo")).await;
        s.get("alpha", None, None).await.unwrap();
        s.get("bravo", None, None).await.unwrap();

        // both residents outrank the newcomer, yet the older of them goes
        let c = s.put(record("charlie")).await;
        assert!(s.peek(&a).await.is_none());
        assert!(s.peek(&b).await.is_some());
        assert!(s.peek(&c).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_and_evictions_lose_nothing() {
        let s = Arc::new(store(StoreConfig::default().with_max_entries(4)).await);
        let hot = s.put(record("hot entry")).await;
        for _ in 0..5 {
            s.get("hot entry", None, None).await.unwrap();
        }

        let mut tasks = Vec::new();
        for t in 0..8 {
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    assert!(s.get("hot entry", None, None).await.is_some());
                    s.put(record(&format!("filler {} {}", t, i))).await;
                    if i % 5 == 0 {
                        s.evict().await;
                    }
                    assert!(s.len().await <= 4);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let hot = s.peek(&hot).await.unwrap();
        assert_eq!(hot.access_count, 1 + 5 + 8 * 25);
        assert_eq!(s.len().await, 4);
        let stats = s.stats().await;
        assert_eq!(stats.exact_hits, 5 + 8 * 25);
        assert_eq!(stats.sets, 1 + 8 * 25);
    }

    #[tokio::test]
    async fn test_put_clamps_quality() {
        let s = store(StoreConfig::default()).await;
        let mut high = record("too good");
        high.quality_score = Some(3.5);
        let mut nan = record("unknowable");
        nan.quality_score = Some(f64::NAN);

        let high = s.put(high).await;
        let nan = s.put(nan).await;
        assert_eq!(s.peek(&high).await.unwrap().quality_score, Some(1.0));
        assert_eq!(s.peek(&nan).await.unwrap().quality_score, None);
    }

    #[tokio::test]
    async fn test_purge() {
        let s = store(StoreConfig::default()).await;
        s.put(record("old one").with_created_at(Utc::now() - chrono::Duration::days(3)))
            .await;
        s.put(record("new one")).await;

        assert_eq!(s.purge(Some(Duration::from_secs(86_400))).await, 1);
        assert_eq!(s.len().await, 1);
        assert_eq!(s.purge(Some(Duration::ZERO)).await, 1);
        assert!(s.is_empty().await);

        s.put(record("again")).await;
        assert_eq!(s.purge(None).await, 1);
    }

    #[tokio::test]
    async fn test_dedupe_keeps_best_per_prompt() {
        let s = store(StoreConfig::default()).await;
        let weak = s
            .put(
                CacheRecord::new("same prompt", Some("ctx a"), "weak", "m", 1, 0.0)
                    .with_quality(0.4),
            )
            .await;
        let strong = s
            .put(
                CacheRecord::new("same prompt", Some("ctx b"), "strong", "m", 1, 0.0)
                    .with_quality(0.9),
            )
            .await;
        let other = s.put(record("other prompt")).await;

        assert_eq!(s.dedupe().await, 1);
        assert!(s.peek(&weak).await.is_none());
        assert!(s.peek(&strong).await.is_some());
        assert!(s.peek(&other).await.is_some());
        assert_eq!(s.dedupe().await, 0);
    }

    #[tokio::test]
    async fn test_update_quality() {
        let s = store(StoreConfig::default().with_auto_cleanup(false)).await;
        let fp = s.put(record("rate me")).await;

        assert!(s.update_quality(&fp, 0.2).await.unwrap());
        assert!(!s.update_quality("0000000000000000", 0.5).await.unwrap());
        assert!(s.update_quality(&fp, 1.2).await.is_err());

        assert_eq!(s.evict().await, 1);
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let backend = Arc::new(MemoryBackend::new());
        let fp = {
            let s = ResponseStore::open(StoreConfig::default(), backend.clone())
                .await
                .unwrap();
            s.put(record("persist me").with_quality(0.8)).await
        };
        let reopened = ResponseStore::open(StoreConfig::default(), backend)
            .await
            .unwrap();
        let r = reopened.peek(&fp).await.unwrap();
        assert_eq!(r.quality_score, Some(0.8));
        assert_eq!(r.response, "answer to persist me");
    }

    #[tokio::test]
    async fn test_corrupt_document_starts_empty() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write(Document::Responses, b"not json").await.unwrap();
        let s = ResponseStore::open(StoreConfig::default(), backend).await.unwrap();
        assert!(s.is_empty().await);
        assert_eq!(s.stats().await.persist_errors, 1);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let s = store(StoreConfig::default()).await;
        s.put(CacheRecord::new("a b", None, "r", "m1", 10, 0.5).with_quality(0.4))
            .await;
        s.put(CacheRecord::new("c d", None, "r", "m2", 20, 0.25).with_quality(0.8))
            .await;
        s.get("a b", None, None).await;

        let stats = s.stats().await;
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_tokens, 30);
        assert_eq!(stats.total_accesses, 3);
        assert!((stats.avg_quality_score - 0.6).abs() < 1e-9);
        assert_eq!(stats.models_used, vec!["m1".to_string(), "m2".to_string()]);
        assert!((stats.estimated_savings - 0.5).abs() < 1e-9);
        assert_eq!(stats.hit_ratio(), 1.0);
    }
}
