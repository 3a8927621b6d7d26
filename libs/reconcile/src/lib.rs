//! Reconciliation primitives shared by the operator.
//!
//! A reconciliation pass compares a declared object against what is observed
//! and takes at most one step toward it. The pass never remembers where it
//! stopped: the next pass recomputes everything from observed state. This
//! crate provides the pieces that make that loop work:
//!
//! - [`SpecHash`]: a stable hash of a pod template, used both for equality
//!   and to name revisions.
//! - [`Severity`] and [`Classify`]: whether an error ends a pass for good or
//!   asks for a requeue.
//! - [`RetryTracker`] and [`Backoff`]: how often and how soon to requeue.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Convergence of one component after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed state matches the declared state.
    Converged,

    /// A step was taken, or is waiting on the cluster.
    Converging,

    /// Nothing observed yet.
    Unknown,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Hash of a JSON document with its keys sorted.
///
/// Two templates that differ only in key order hash the same.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(json).as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Revision name for a replica set, e.g. `basic-storage-5d8f1c0a2b`.
    pub fn revision_name(&self, set_name: &str) -> String {
        format!("{}-{}", set_name, &self.0[..10])
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether two templates are semantically the same document.
pub fn templates_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    canonical_json(a) == canonical_json(b)
}

fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        // Scalars already serialize canonically.
        scalar => scalar.to_string(),
    }
}

/// How a failed pass should be treated by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Needs fresh data or an operator; logged at error level.
    Fatal,
    /// The cluster is still moving; requeue after a backoff.
    Retryable,
}

/// Errors that know their own [`Severity`].
pub trait Classify {
    fn severity(&self) -> Severity;

    fn is_retryable(&self) -> bool {
        self.severity() == Severity::Retryable
    }
}

/// Counts consecutive failures per key inside a sliding window.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    /// key -> (count, first failure in window)
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure and return the failure count in the current window.
    pub fn record_failure(&mut self, key: &str) -> u32 {
        let now = Instant::now();
        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Whether `key` has failed more than `max_retries` times in the window.
    pub fn is_exhausted(&self, key: &str) -> bool {
        match self.failures.get(key) {
            Some((count, first)) => {
                first.elapsed() <= self.window && *count > self.max_retries
            }
            None => false,
        }
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn prune(&mut self) {
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| first.elapsed() <= window);
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(16);
        self.base.saturating_mul(1 << shift).min(self.max)
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default retry budget before a recurring retryable error is escalated.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_spec_hash_ignores_key_order() {
        let a = serde_json::json!({"image": "storage:v2", "env": {"b": 2, "a": 1}});
        let b = serde_json::json!({"env": {"a": 1, "b": 2}, "image": "storage:v2"});

        assert_eq!(SpecHash::from_json(&a), SpecHash::from_json(&b));
        assert!(templates_equal(&a, &b));
    }

    #[test]
    fn test_spec_hash_detects_change() {
        let a = serde_json::json!({"image": "storage:v1"});
        let b = serde_json::json!({"image": "storage:v2"});

        assert_ne!(SpecHash::from_json(&a), SpecHash::from_json(&b));
        assert!(!templates_equal(&a, &b));
    }

    #[test]
    fn test_revision_name() {
        let hash = SpecHash::from_json(&serde_json::json!({"image": "x"}));
        let rev = hash.revision_name("basic-storage");
        assert!(rev.starts_with("basic-storage-"));
        assert_eq!(rev.len(), "basic-storage-".len() + 10);
    }

    #[test]
    fn test_escaped_keys_do_not_collide() {
        let a = serde_json::json!({"a\"b": 1});
        let b = serde_json::json!({"a": 1});
        assert!(!templates_equal(&a, &b));
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert_eq!(tracker.record_failure("basic/storage"), 1);
        assert_eq!(tracker.record_failure("basic/storage"), 2);
        assert_eq!(tracker.record_failure("basic/storage"), 3);
        assert!(!tracker.is_exhausted("basic/storage"));
        assert_eq!(tracker.record_failure("basic/storage"), 4);

        assert!(tracker.is_exhausted("basic/storage"));
        assert!(!tracker.is_exhausted("basic/proxy"));

        tracker.clear("basic/storage");
        assert!(!tracker.is_exhausted("basic/storage"));
        assert_eq!(tracker.failures("basic/storage"), 0);
    }

    #[test]
    fn test_retry_tracker_window_reset() {
        let mut tracker = RetryTracker::new(1, Duration::ZERO);
        tracker.record_failure("k");
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(tracker.record_failure("k"), 1);
        tracker.prune();
    }

    #[test]
    fn test_backoff() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    struct Requeue;

    impl Classify for Requeue {
        fn severity(&self) -> Severity {
            Severity::Retryable
        }
    }

    #[test]
    fn test_classify_default_method() {
        assert!(Requeue.is_retryable());
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic(failures in 0u32..64) {
            let backoff = Backoff::default();
            prop_assert!(backoff.delay(failures) <= backoff.delay(failures + 1));
            prop_assert!(backoff.delay(failures) <= backoff.max);
        }
    }
}
