//! Cached response record.

use super::key::{context_fingerprint, fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Clamps a quality score into `0.0..=1.0`. NaN carries no score.
pub(crate) fn clamp_quality(score: f64) -> Option<f64> {
    if score.is_nan() {
        None
    } else {
        Some(score.clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub fingerprint: String,
    pub prompt: String,
    #[serde(default)]
    pub context_fingerprint: Option<String>,
    pub response: String,
    pub model: String,
    pub tokens_used: u64,
    pub cost: f64,
    #[serde(default)]
    pub quality_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CacheRecord {
    pub fn new(
        prompt: impl Into<String>,
        context: Option<&str>,
        response: impl Into<String>,
        model: impl Into<String>,
        tokens_used: u64,
        cost: f64,
    ) -> Self {
        let prompt = prompt.into();
        let now = Utc::now();
        Self {
            fingerprint: fingerprint(&prompt, context),
            context_fingerprint: context_fingerprint(context),
            prompt,
            response: response.into(),
            model: model.into(),
            tokens_used,
            cost: cost.max(0.0),
            quality_score: None,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            metadata: HashMap::new(),
        }
    }

    pub fn with_quality(mut self, score: f64) -> Self {
        self.quality_score = clamp_quality(score);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.last_accessed_at = at;
        self
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count = self.access_count.saturating_add(1);
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// True when the record carries a score of at least `min`. Unscored
    /// records never qualify.
    pub fn meets_quality(&self, min: Option<f64>) -> bool {
        match min {
            None => true,
            Some(min) => self.quality_score.map_or(false, |q| q >= min),
        }
    }

    /// Cost avoided by the hits served so far.
    pub fn savings(&self) -> f64 {
        self.cost * self.access_count.saturating_sub(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let r = CacheRecord::new("fib(n)", Some("rust"), "fn fib..", "m", 10, 0.001);
        assert_eq!(r.fingerprint, fingerprint("fib(n)", Some("rust")));
        assert_eq!(r.context_fingerprint, context_fingerprint(Some("rust")));
        assert_eq!(r.access_count, 1);
        assert_eq!(r.created_at, r.last_accessed_at);
        assert!(r.quality_score.is_none());
    }

    #[test]
    fn test_touch_updates_access() {
        let mut r = CacheRecord::new("p", None, "r", "m", 1, 0.0)
            .with_created_at(Utc::now() - chrono::Duration::hours(1));
        let before = r.last_accessed_at;
        r.touch();
        assert_eq!(r.access_count, 2);
        assert!(r.last_accessed_at > before);
    }

    #[test]
    fn test_meets_quality() {
        let unscored = CacheRecord::new("p", None, "r", "m", 1, 0.0);
        assert!(unscored.meets_quality(None));
        assert!(!unscored.meets_quality(Some(0.1)));

        let scored = unscored.clone().with_quality(0.7);
        assert!(scored.meets_quality(Some(0.7)));
        assert!(!scored.meets_quality(Some(0.71)));
    }

    #[test]
    fn test_quality_is_clamped() {
        let r = CacheRecord::new("p", None, "r", "m", 1, 0.0);
        assert_eq!(r.clone().with_quality(1.7).quality_score, Some(1.0));
        assert_eq!(r.clone().with_quality(-0.2).quality_score, Some(0.0));
        assert_eq!(r.clone().with_quality(0.35).quality_score, Some(0.35));
        assert_eq!(r.with_quality(f64::NAN).quality_score, None);
    }

    #[test]
    fn test_savings_counts_hits_only() {
        let mut r = CacheRecord::new("p", None, "r", "m", 100, 0.5);
        assert_eq!(r.savings(), 0.0);
        r.touch();
        r.touch();
        assert!((r.savings() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_serde_preserves_fields() {
        let r = CacheRecord::new("p", Some("c"), "r", "m", 3, 0.25)
            .with_quality(0.9)
            .with_metadata("source", serde_json::json!("batch"));
        let json = serde_json::to_string(&r).unwrap();
        let back: CacheRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
