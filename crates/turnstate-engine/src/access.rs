//! Access-pattern learning using [`moka`].
//!
//! Every turn ends by recording which root frames bot logic touched, keyed by
//! activity type and the namespaces of those frames. The next turn of the
//! same type scores the recorded sets and preloads the winner in parallel.
//!
//! Patterns live in a bounded LRU so the table cannot grow without limit when
//! many distinct activity types or frame sets appear.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use moka::future::Cache;
use moka::notification::RemovalCause;
use tracing::debug;

/// Default upper bound on distinct (activity type, frame set) patterns.
pub const DEFAULT_PATTERN_CAPACITY: u64 = 10_000;

// ── scoring ──────────────────────────────────────────────────────────

/// Ranks recorded frame sets for preloading.
pub trait PreloadScorer: Send + Sync {
    /// Score a set of `set_size` frames seen `observed` times, out of
    /// `total_frames` managed frames. Higher wins.
    fn score(&self, observed: u64, set_size: usize, total_frames: usize) -> f64;
}

/// `observed * (base_weight + size_weight * set_size / total_frames)`.
///
/// With the default 0.7 / 0.3 split, frequency dominates and larger sets win
/// ties between equally common patterns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedScorer {
    pub base_weight: f64,
    pub size_weight: f64,
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self {
            base_weight: 0.7,
            size_weight: 0.3,
        }
    }
}

impl PreloadScorer for WeightedScorer {
    fn score(&self, observed: u64, set_size: usize, total_frames: usize) -> f64 {
        if total_frames == 0 {
            return 0.0;
        }
        let coverage = set_size as f64 / total_frames as f64;
        observed as f64 * (self.base_weight + self.size_weight * coverage)
    }
}

// ── stats ────────────────────────────────────────────────────────────

/// Counters tracking how often preloading had a pattern to act on.
#[derive(Debug, Default)]
pub struct PatternStats {
    predicted: AtomicU64,
    cold: AtomicU64,
    recorded: AtomicU64,
}

impl PatternStats {
    pub(crate) fn record_predicted(&self) {
        self.predicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cold(&self) {
        self.cold.fetch_add(1, Ordering::Relaxed);
    }

    fn record_observation(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Turns that found a pattern to preload.
    pub fn predicted(&self) -> u64 {
        self.predicted.load(Ordering::Relaxed)
    }

    /// Turns whose activity type had no usable pattern yet.
    pub fn cold(&self) -> u64 {
        self.cold.load(Ordering::Relaxed)
    }

    /// Turns whose access set was recorded.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Share of preloads that had a prediction (0.0 when none ran).
    pub fn prediction_rate(&self) -> f64 {
        let total = self.predicted() + self.cold();
        if total == 0 {
            return 0.0;
        }
        self.predicted() as f64 / total as f64
    }

    pub fn reset(&self) {
        self.predicted.store(0, Ordering::Relaxed);
        self.cold.store(0, Ordering::Relaxed);
        self.recorded.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for PatternStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "predicted={} cold={} recorded={} rate={:.2}%",
            self.predicted(),
            self.cold(),
            self.recorded(),
            self.prediction_rate() * 100.0,
        )
    }
}

// ── pattern cache ────────────────────────────────────────────────────

/// Key of a frame set: each namespace followed by `|`.
pub fn pattern_key<S: AsRef<str>>(namespaces: &[S]) -> String {
    namespaces
        .iter()
        .map(|ns| format!("{}|", ns.as_ref()))
        .collect()
}

#[derive(Debug)]
struct PatternEntry {
    namespaces: Vec<String>,
    count: AtomicU64,
}

/// One recorded frame set for an activity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPattern {
    /// See [`pattern_key`].
    pub key: String,
    /// Namespaces of the frames in the set, in recording order.
    pub namespaces: Vec<String>,
    /// How many turns accessed exactly this set.
    pub count: u64,
}

/// Bounded table of observed frame-access sets.
///
/// Patterns are stored by frame namespace, so one table can be shared by
/// managers whose frame lists differ.
#[derive(Clone)]
pub struct AccessPatternCache {
    inner: Cache<(String, String), Arc<PatternEntry>>,
    /// Pattern keys per activity type, in first-recorded order.
    by_activity: Arc<DashMap<String, Vec<String>>>,
    stats: Arc<PatternStats>,
}

impl Default for AccessPatternCache {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AccessPatternCache {
    pub fn builder() -> AccessPatternCacheBuilder {
        AccessPatternCacheBuilder {
            max_capacity: DEFAULT_PATTERN_CAPACITY,
            idle_seconds: None,
        }
    }

    /// Count one more turn of `activity_type` that accessed the frames named
    /// by `namespaces`.
    pub async fn record<S: AsRef<str>>(&self, activity_type: &str, namespaces: &[S]) {
        let key = pattern_key(namespaces);
        let entry = self
            .inner
            .get_with((activity_type.to_string(), key.clone()), async {
                Arc::new(PatternEntry {
                    namespaces: namespaces.iter().map(|ns| ns.as_ref().to_string()).collect(),
                    count: AtomicU64::new(0),
                })
            })
            .await;
        let count = entry.count.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut keys = self
                .by_activity
                .entry(activity_type.to_string())
                .or_default();
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
        }
        self.stats.record_observation();
        debug!(activity_type, key = %key, count, "access pattern recorded");
    }

    /// Recorded sets for `activity_type`, in first-recorded order.
    ///
    /// Only entries of that activity type are visited.
    pub async fn patterns(&self, activity_type: &str) -> Vec<ObservedPattern> {
        let keys: Vec<String> = match self.by_activity.get(activity_type) {
            Some(keys) => keys.value().clone(),
            None => return Vec::new(),
        };
        let mut patterns = Vec::with_capacity(keys.len());
        for key in keys {
            let lookup = (activity_type.to_string(), key);
            match self.inner.get(&lookup).await {
                Some(entry) => patterns.push(ObservedPattern {
                    key: lookup.1,
                    namespaces: entry.namespaces.clone(),
                    count: entry.count.load(Ordering::Relaxed),
                }),
                // Evicted before the listener caught up.
                None => unindex(&self.by_activity, activity_type, &lookup.1),
            }
        }
        patterns
    }

    /// Forget every recorded pattern.
    pub async fn reset(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        self.by_activity.clear();
        debug!("access patterns reset");
    }

    pub fn stats(&self) -> &PatternStats {
        &self.stats
    }

    /// Approximate number of recorded patterns.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

/// Drop an evicted pattern from the per-activity index.
fn unindex(index: &DashMap<String, Vec<String>>, activity_type: &str, key: &str) {
    if let Some(mut keys) = index.get_mut(activity_type) {
        keys.retain(|k| k != key);
    }
    index.remove_if(activity_type, |_, keys| keys.is_empty());
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`AccessPatternCache`].
#[derive(Debug, Clone)]
pub struct AccessPatternCacheBuilder {
    max_capacity: u64,
    idle_seconds: Option<u64>,
}

impl AccessPatternCacheBuilder {
    /// Maximum number of distinct patterns kept.
    pub fn max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = cap;
        self
    }

    /// Forget patterns not seen for this many seconds.
    pub fn idle_seconds(mut self, secs: u64) -> Self {
        self.idle_seconds = Some(secs);
        self
    }

    pub fn build(self) -> AccessPatternCache {
        let by_activity: Arc<DashMap<String, Vec<String>>> = Arc::new(DashMap::new());
        let index = by_activity.clone();
        let mut builder = Cache::builder()
            .max_capacity(self.max_capacity)
            .eviction_listener(
                move |key: Arc<(String, String)>, _: Arc<PatternEntry>, cause: RemovalCause| {
                    if !matches!(cause, RemovalCause::Replaced) {
                        unindex(&index, &key.0, &key.1);
                    }
                },
            );
        if let Some(secs) = self.idle_seconds {
            builder = builder.time_to_idle(Duration::from_secs(secs));
        }
        debug!(
            max_capacity = self.max_capacity,
            idle_seconds = ?self.idle_seconds,
            "access pattern cache created"
        );
        AccessPatternCache {
            inner: builder.build(),
            by_activity,
            stats: Arc::new(PatternStats::default()),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_score_prefers_frequency_then_size() {
        let scorer = WeightedScorer::default();
        let small_common = scorer.score(10, 1, 4);
        let large_rare = scorer.score(2, 4, 4);
        assert!(small_common > large_rare);

        let small = scorer.score(3, 1, 4);
        let large = scorer.score(3, 3, 4);
        assert!(large > small);
        assert_eq!(scorer.score(5, 1, 0), 0.0);
    }

    #[test]
    fn weighted_score_formula() {
        let scorer = WeightedScorer::default();
        let expected = 4.0 * (0.7 + 0.3 * 0.5);
        assert!((scorer.score(4, 2, 4) - expected).abs() < 1e-9);
    }

    #[test]
    fn pattern_key_joins_namespaces() {
        assert_eq!(pattern_key(&["user", "conversation"]), "user|conversation|");
        assert_eq!(pattern_key::<&str>(&[]), "");
    }

    #[tokio::test]
    async fn records_and_counts_patterns_per_activity_type() {
        let cache = AccessPatternCache::default();
        cache.record("message", &["user"]).await;
        cache.record("message", &["user"]).await;
        cache.record("message", &["user", "conversation"]).await;
        cache.record::<&str>("event", &[]).await;

        let patterns = cache.patterns("message").await;
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].key, "user|");
        assert_eq!(patterns[0].count, 2);
        assert_eq!(patterns[1].key, "user|conversation|");
        assert_eq!(patterns[1].namespaces, vec!["user", "conversation"]);

        let events = cache.patterns("event").await;
        assert_eq!(events.len(), 1);
        assert!(events[0].namespaces.is_empty());
        assert!(cache.patterns("typing").await.is_empty());
        assert_eq!(cache.stats().recorded(), 4);
    }

    #[tokio::test]
    async fn reset_forgets_patterns() {
        let cache = AccessPatternCache::builder()
            .max_capacity(100)
            .idle_seconds(3600)
            .build();
        cache.record("message", &["user"]).await;
        cache.reset().await;
        assert!(cache.patterns("message").await.is_empty());
        assert!(cache.by_activity.is_empty());
    }

    #[tokio::test]
    async fn evicted_patterns_leave_the_index() {
        let cache = AccessPatternCache::builder().max_capacity(1).build();
        cache.record("message", &["user"]).await;
        cache.record("message", &["conversation"]).await;
        cache.inner.run_pending_tasks().await;

        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.patterns("message").await.len(), 1);
        let indexed = cache.by_activity.get("message").map_or(0, |keys| keys.len());
        assert_eq!(indexed, 1);
    }

    #[test]
    fn stats_display() {
        let stats = PatternStats::default();
        stats.record_predicted();
        stats.record_cold();
        assert_eq!(stats.prediction_rate(), 0.5);
        assert!(stats.to_string().contains("rate=50.00%"));
    }
}
