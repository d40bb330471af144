//! Error classification and recovery around external calls.
//!
//! Each failure is classified into an [`ErrorKind`], counted per
//! `(context, kind)`, and handed to the strategy registered for that kind. If
//! the strategy fails and the pair has failed fewer than the escalation
//! threshold, a fixed fallback chain runs: backoff retry, cached data,
//! graceful degradation. At or past the threshold the engine stops retrying
//! and raises a CRITICAL alert.

pub mod classify;
pub mod counter;
pub mod strategy;

pub use classify::{Classify, ErrorKind, classify_message};
pub use counter::{FrequencyStore, MemoryFrequencyStore, RedisFrequencyStore};
pub use strategy::{NoopHooks, RecoveryHooks};

use crate::config::RecoverySettings;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Oldest alerts are dropped past this many distinct `(context, kind)` pairs.
const MAX_ALERTS: usize = 100;

/// One per escalated `(context, kind)`. Later failures of the same pair
/// update the existing alert instead of raising a new one.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub context: String,
    pub kind: ErrorKind,
    pub occurrences: u64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered { via: &'static str },
    Failed { reason: String },
    Escalated,
}

#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    pub kind: ErrorKind,
    pub occurrences: u64,
    pub outcome: RecoveryOutcome,
}

impl RecoveryDecision {
    pub fn recovered(&self) -> bool {
        matches!(self.outcome, RecoveryOutcome::Recovered { .. })
    }
}

/// Result of a wrapped operation. `value` is `None` once attempts are
/// exhausted; the last error is kept for audit records instead of being raised.
#[derive(Debug)]
pub struct Recovered<T, E> {
    pub value: Option<T>,
    pub attempts: u32,
    pub last_error: Option<E>,
    pub last_kind: Option<ErrorKind>,
}

impl<T, E: std::fmt::Display> Recovered<T, E> {
    pub fn failure_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "operation produced no result".to_string())
    }
}

pub struct RecoveryEngine {
    settings: RecoverySettings,
    counter: Arc<dyn FrequencyStore>,
    hooks: Arc<dyn RecoveryHooks>,
    cache: Mutex<HashMap<String, Value>>,
    degraded: Mutex<HashSet<String>>,
    alerts: Mutex<Vec<Alert>>,
}

impl RecoveryEngine {
    pub fn new(
        settings: RecoverySettings,
        counter: Arc<dyn FrequencyStore>,
        hooks: Arc<dyn RecoveryHooks>,
    ) -> Self {
        Self {
            settings,
            counter,
            hooks,
            cache: Mutex::new(HashMap::new()),
            degraded: Mutex::new(HashSet::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory(settings: RecoverySettings) -> Self {
        Self::new(
            settings,
            Arc::new(MemoryFrequencyStore::new()),
            Arc::new(NoopHooks),
        )
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    /// Retries `operation` up to the configured attempt limit, running the
    /// recovery pipeline between failed attempts. Exhaustion yields `None`.
    pub async fn with_recovery<T, E, F, Fut>(&self, context: &str, operation: F) -> Option<T>
    where
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(context, operation).await.value
    }

    pub async fn run<T, E, F, Fut>(&self, context: &str, mut operation: F) -> Recovered<T, E>
    where
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = None;
        let mut last_kind = None;
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        info!(target = "trendforge.recovery", context, attempts, "operation_recovered");
                    }
                    return Recovered {
                        value: Some(value),
                        attempts,
                        last_error: None,
                        last_kind: None,
                    };
                }
                Err(err) => {
                    let kind = err.error_kind();
                    warn!(
                        target = "trendforge.recovery",
                        context,
                        attempt = attempts,
                        max_attempts,
                        kind = %kind,
                        error = %err,
                        "operation_failed"
                    );
                    last_kind = Some(kind);

                    if !err.is_retryable() {
                        debug!(target = "trendforge.recovery", context, kind = %kind, "not_retryable");
                        last_error = Some(err);
                        break;
                    }
                    if attempts == max_attempts {
                        self.track(context, kind, &err.to_string()).await;
                        last_error = Some(err);
                        break;
                    }
                    let decision = self.handle_error(context, &err).await;
                    last_error = Some(err);
                    if !decision.recovered() {
                        break;
                    }
                }
            }
        }

        let message = last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        warn!(
            target = "trendforge.recovery",
            context,
            attempts,
            error = %message,
            "operation_exhausted"
        );
        Recovered {
            value: None,
            attempts,
            last_error,
            last_kind,
        }
    }

    /// Like [`RecoveryEngine::run`], and remembers the latest success so the
    /// cached-data fallback has something to serve for this context.
    pub async fn run_cached<T, E, F, Fut>(&self, context: &str, operation: F) -> Recovered<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = self.run(context, operation).await;
        if let Some(value) = &outcome.value
            && let Ok(json) = serde_json::to_value(value)
        {
            self.cache.lock().await.insert(context.to_string(), json);
        }
        outcome
    }

    pub async fn cached<T: DeserializeOwned>(&self, context: &str) -> Option<T> {
        let guard = self.cache.lock().await;
        guard
            .get(context)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Classify, count, and try to recover from a single failure.
    pub async fn handle_error<E: Classify + ?Sized>(
        &self,
        context: &str,
        err: &E,
    ) -> RecoveryDecision {
        let kind = err.error_kind();
        let message = err.to_string();
        let occurrences = self.track(context, kind, &message).await;

        if occurrences >= self.settings.escalation_threshold {
            crate::metrics::recovery_attempt(kind.as_str(), "escalated");
            return RecoveryDecision {
                kind,
                occurrences,
                outcome: RecoveryOutcome::Escalated,
            };
        }

        let primary_failure =
            match strategy::primary(kind, &self.settings, self.hooks.as_ref()).await {
                Ok(via) => {
                    debug!(target = "trendforge.recovery", context, kind = %kind, via, "primary_strategy_ok");
                    crate::metrics::recovery_attempt(kind.as_str(), via);
                    return RecoveryDecision {
                        kind,
                        occurrences,
                        outcome: RecoveryOutcome::Recovered { via },
                    };
                }
                Err(reason) => reason,
            };
        warn!(
            target = "trendforge.recovery",
            context,
            kind = %kind,
            reason = %primary_failure,
            "primary_strategy_failed"
        );

        let outcome = match self.fallback_chain(context, kind, occurrences).await {
            Some(via) => RecoveryOutcome::Recovered { via },
            None => RecoveryOutcome::Failed {
                reason: primary_failure,
            },
        };
        let label = match &outcome {
            RecoveryOutcome::Recovered { via } => *via,
            _ => "failed",
        };
        crate::metrics::recovery_attempt(kind.as_str(), label);
        RecoveryDecision {
            kind,
            occurrences,
            outcome,
        }
    }

    async fn fallback_chain(
        &self,
        context: &str,
        kind: ErrorKind,
        occurrences: u64,
    ) -> Option<&'static str> {
        match strategy::backoff_retry(kind, occurrences, &self.settings).await {
            Ok(via) => return Some(via),
            Err(reason) => {
                debug!(target = "trendforge.recovery", context, reason = %reason, "backoff_fallback_skipped")
            }
        }
        if self.cache.lock().await.contains_key(context) {
            return Some("cached_data");
        }
        self.degraded.lock().await.insert(context.to_string());
        warn!(target = "trendforge.recovery", context, kind = %kind, "degraded_mode");
        Some("graceful_degradation")
    }

    /// Bumps the frequency counter and raises an alert once the threshold is hit.
    async fn track(&self, context: &str, kind: ErrorKind, message: &str) -> u64 {
        let occurrences = match self.counter.increment(context, kind).await {
            Ok(total) => total,
            Err(err) => {
                warn!(target = "trendforge.recovery", context, error = %err, "frequency_counter_unavailable");
                1
            }
        };
        if occurrences >= self.settings.escalation_threshold {
            self.escalate(context, kind, occurrences, message).await;
        }
        occurrences
    }

    async fn escalate(&self, context: &str, kind: ErrorKind, occurrences: u64, message: &str) {
        let now = Utc::now();
        let mut alerts = self.alerts.lock().await;
        if let Some(alert) = alerts
            .iter_mut()
            .find(|alert| alert.context == context && alert.kind == kind)
        {
            alert.occurrences = occurrences;
            alert.message = message.to_string();
            alert.last_seen_at = now;
            debug!(target = "trendforge.alert", context, kind = %kind, occurrences, "escalation_repeated");
            return;
        }

        error!(
            target = "trendforge.alert",
            severity = "CRITICAL",
            context,
            kind = %kind,
            occurrences,
            error = message,
            "error_escalated"
        );
        if alerts.len() >= MAX_ALERTS {
            alerts.remove(0);
        }
        alerts.push(Alert {
            context: context.to_string(),
            kind,
            occurrences,
            message: message.to_string(),
            raised_at: now,
            last_seen_at: now,
        });
    }

    pub async fn error_count(&self, context: &str, kind: ErrorKind) -> u64 {
        self.counter.get(context, kind).await.unwrap_or(0)
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }

    pub async fn is_degraded(&self, context: &str) -> bool {
        self.degraded.lock().await.contains(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> RecoveryEngine {
        RecoveryEngine::in_memory(RecoverySettings::immediate())
    }

    #[derive(Debug)]
    struct Fatal;

    impl std::fmt::Display for Fatal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("payload rejected")
        }
    }

    impl Classify for Fatal {
        fn is_retryable(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = engine
            .run("scan:etsy", || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("HTTP 503 service unavailable".to_string())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(out.value, Some(7));
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_none_instead_of_error() {
        let engine = engine();
        let value: Option<u32> = engine
            .with_recovery("list:etsy", || async {
                Err::<u32, _>("request timed out".to_string())
            })
            .await;
        assert!(value.is_none());
        assert_eq!(
            engine.error_count("list:etsy", ErrorKind::TimeoutError).await,
            3
        );
    }

    #[tokio::test]
    async fn third_failure_raises_critical_alert() {
        let engine = engine();
        let out = engine
            .run("generate", || async {
                Err::<(), _>("429 too many requests".to_string())
            })
            .await;
        assert_eq!(out.last_kind, Some(ErrorKind::RateLimitError));
        let alerts = engine.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, ErrorKind::RateLimitError);
        assert_eq!(alerts[0].occurrences, 3);
    }

    #[tokio::test]
    async fn repeated_escalations_update_one_alert() {
        let engine = engine();
        for _ in 0..6 {
            engine
                .handle_error("list:etsy", &"request timed out".to_string())
                .await;
        }
        let alerts = engine.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].occurrences, 6);
        assert!(alerts[0].last_seen_at >= alerts[0].raised_at);
    }

    #[tokio::test]
    async fn alert_list_is_bounded() {
        let engine = engine();
        for idx in 0..MAX_ALERTS + 5 {
            let context = format!("list:shop-{idx}");
            for _ in 0..3 {
                engine
                    .handle_error(&context, &"request timed out".to_string())
                    .await;
            }
        }
        let alerts = engine.alerts().await;
        assert_eq!(alerts.len(), MAX_ALERTS);
        assert_eq!(alerts[0].context, "list:shop-5");
    }

    #[tokio::test]
    async fn escalated_pair_skips_retries() {
        let engine = engine();
        for _ in 0..3 {
            engine
                .handle_error("analyze", &"database connection lost".to_string())
                .await;
        }
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = engine
            .run("analyze", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("database connection lost".to_string())
                }
            })
            .await;
        assert!(out.value.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "escalated errors are not retried");
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = engine
            .run("generate", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Fatal)
                }
            })
            .await;
        assert!(out.value.is_none());
        assert_eq!(out.attempts, 1);
        assert_eq!(out.failure_message(), "payload rejected");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_errors_fall_back_to_backoff() {
        let engine = engine();
        let decision = engine.handle_error("scan:ebay", &"weird glitch".to_string()).await;
        assert_eq!(decision.kind, ErrorKind::UnknownError);
        assert_eq!(
            decision.outcome,
            RecoveryOutcome::Recovered {
                via: "exponential_backoff"
            }
        );
    }

    struct BrokenConfig;

    #[async_trait]
    impl RecoveryHooks for BrokenConfig {
        async fn reload_config(&self) -> Result<(), String> {
            Err("env file unreadable".into())
        }
    }

    #[tokio::test]
    async fn config_failure_prefers_cached_data_over_degradation() {
        let engine = RecoveryEngine::new(
            RecoverySettings::immediate(),
            Arc::new(MemoryFrequencyStore::new()),
            Arc::new(BrokenConfig),
        );
        let err = "EBAY_REFRESH_TOKEN is not set".to_string();

        let decision = engine.handle_error("categories:ebay", &err).await;
        assert_eq!(
            decision.outcome,
            RecoveryOutcome::Recovered {
                via: "graceful_degradation"
            }
        );
        assert!(engine.is_degraded("categories:ebay").await);

        let cached = engine
            .run_cached("categories:etsy", || async {
                Ok::<_, String>(vec!["Home".to_string()])
            })
            .await;
        assert!(cached.value.is_some());
        let decision = engine.handle_error("categories:etsy", &err).await;
        assert_eq!(decision.outcome, RecoveryOutcome::Recovered { via: "cached_data" });
        let served: Option<Vec<String>> = engine.cached("categories:etsy").await;
        assert_eq!(served, Some(vec!["Home".to_string()]));
    }
}
