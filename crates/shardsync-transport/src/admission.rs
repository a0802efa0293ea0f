//! Admission control for inbound transport requests
//!
//! A gate in front of request handlers: each request is admitted or
//! rejected on arrival, never queued. Actions are grouped into categories
//! by name prefix, and each category has its own limits:
//!
//! - **In-flight**: requests currently executing
//! - **Rate**: token bucket with burst support
//! - **Pressure probes**: pluggable resource checks (cache pressure, ...)
//!
//! A rejection reaches the caller as an `AdmissionRejected` error frame,
//! so it is observed as a rejection rather than a timeout.

use crate::server::{InboundRequest, RequestHandler, ResponseChannel};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use shardsync_common::config::{AdmissionConfig, AdmissionMode, CategoryLimits};
use shardsync_common::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Actions under this prefix are replication traffic
pub const REPLICATION_ACTION_PREFIX: &str = "replication/";

/// Category an action's limits are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionCategory {
    /// `replication/*` actions
    Replication,
    /// Everything else
    Internal,
}

impl ActionCategory {
    pub fn of(action: &str) -> Self {
        if action.starts_with(REPLICATION_ACTION_PREFIX) {
            Self::Replication
        } else {
            Self::Internal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replication => "replication",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token bucket rate limiter
///
/// - Tokens are added at a fixed rate (refill_rate per second)
/// - Tokens accumulate up to max_tokens (burst capacity)
/// - Each request consumes one token
#[derive(Debug)]
pub struct TokenBucket {
    /// Current token count (scaled for sub-token precision)
    tokens: AtomicU64,
    /// Maximum tokens (burst capacity), scaled
    max_tokens: u64,
    /// Tokens added per second, scaled
    refill_rate: u64,
    /// Last refill timestamp
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    const SCALE: u64 = 1000;

    /// Create a bucket refilling `rate` tokens per second, holding at most `burst`
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            tokens: AtomicU64::new(burst * Self::SCALE),
            max_tokens: burst * Self::SCALE,
            refill_rate: rate * Self::SCALE,
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Try to take `count` tokens without blocking
    pub fn try_acquire(&self, count: u64) -> bool {
        self.refill();

        let needed = count * Self::SCALE;
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current < needed {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - needed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed) / Self::SCALE
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let now = Instant::now();
        let elapsed_us = now.duration_since(*last).as_micros() as u64;
        let new_tokens = elapsed_us.saturating_mul(self.refill_rate) / 1_000_000;

        if new_tokens > 0 {
            // Acquirers take tokens without the lock; add to whatever they left
            let _ = self
                .tokens
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |current| {
                    Some(current.saturating_add(new_tokens).min(self.max_tokens))
                });
            *last = now;
        }
    }
}

/// Reports a reason to reject while its resource is under pressure
pub type PressureProbe = Arc<dyn Fn() -> Option<String> + Send + Sync>;

struct NamedProbe {
    name: String,
    category: ActionCategory,
    probe: PressureProbe,
}

/// Counters for one category
#[derive(Debug, Default)]
pub struct CategoryStats {
    pub in_flight: AtomicU64,
    pub admitted: AtomicU64,
    pub rejected: AtomicU64,
    /// Would have been rejected, but the gate only monitors
    pub monitored: AtomicU64,
}

struct CategoryGate {
    category: ActionCategory,
    limits: CategoryLimits,
    bucket: Option<TokenBucket>,
    stats: CategoryStats,
}

impl CategoryGate {
    fn new(category: ActionCategory, limits: &CategoryLimits) -> Self {
        let bucket = (limits.max_requests_per_sec > 0).then(|| {
            let burst = if limits.burst > 0 {
                limits.burst
            } else {
                limits.max_requests_per_sec
            };
            TokenBucket::new(limits.max_requests_per_sec, burst)
        });
        Self {
            category,
            limits: limits.clone(),
            bucket,
            stats: CategoryStats::default(),
        }
    }
}

/// Releases its in-flight slot when dropped
#[must_use = "the in-flight slot is released when the permit is dropped"]
pub struct AdmissionPermit {
    gate: Option<Arc<CategoryGate>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("category", &self.gate.as_ref().map(|g| g.category))
            .finish()
    }
}

/// Point-in-time counters of one category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySnapshot {
    pub category: ActionCategory,
    pub in_flight: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub monitored: u64,
}

/// Transport admission control gate
pub struct AdmissionControl {
    mode: AdmissionMode,
    replication: Arc<CategoryGate>,
    internal: Arc<CategoryGate>,
    probes: RwLock<Vec<NamedProbe>>,
}

impl AdmissionControl {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            mode: config.mode,
            replication: Arc::new(CategoryGate::new(
                ActionCategory::Replication,
                &config.replication,
            )),
            internal: Arc::new(CategoryGate::new(
                ActionCategory::Internal,
                &config.internal,
            )),
            probes: RwLock::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    /// Add a resource-pressure check for one category
    pub fn add_pressure_probe(
        &self,
        category: ActionCategory,
        name: impl Into<String>,
        probe: PressureProbe,
    ) {
        self.probes.write().push(NamedProbe {
            name: name.into(),
            category,
            probe,
        });
    }

    fn gate(&self, category: ActionCategory) -> &Arc<CategoryGate> {
        match category {
            ActionCategory::Replication => &self.replication,
            ActionCategory::Internal => &self.internal,
        }
    }

    /// Admit or reject a request for `action`.
    ///
    /// On admission the returned permit holds an in-flight slot until
    /// dropped. Rejection fails fast with `AdmissionRejected`.
    pub fn apply_transport_admission_control(&self, action: &str) -> Result<AdmissionPermit> {
        if self.mode == AdmissionMode::Disabled {
            return Ok(AdmissionPermit { gate: None });
        }

        let category = ActionCategory::of(action);
        let gate = self.gate(category);

        // Reserve first so concurrent arrivals see each other
        let in_flight = gate.stats.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let permit = AdmissionPermit {
            gate: Some(Arc::clone(gate)),
        };

        let rejection = if gate.limits.max_in_flight > 0 && in_flight > gate.limits.max_in_flight {
            Some(format!(
                "{} {} requests in flight (limit {})",
                in_flight - 1,
                category,
                gate.limits.max_in_flight
            ))
        } else if let Some(bucket) = &gate.bucket
            && !bucket.try_acquire(1)
        {
            Some(format!(
                "{} rate limit of {} requests/s exceeded",
                category, gate.limits.max_requests_per_sec
            ))
        } else {
            self.probes
                .read()
                .iter()
                .filter(|p| p.category == category)
                .find_map(|p| (p.probe)().map(|reason| format!("{}: {}", p.name, reason)))
        };

        match rejection {
            None => {
                gate.stats.admitted.fetch_add(1, Ordering::Relaxed);
                Ok(permit)
            }
            Some(reason) if self.mode == AdmissionMode::MonitorOnly => {
                gate.stats.monitored.fetch_add(1, Ordering::Relaxed);
                gate.stats.admitted.fetch_add(1, Ordering::Relaxed);
                debug!("Admission would reject {}: {}", action, reason);
                Ok(permit)
            }
            Some(reason) => {
                gate.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Rejecting {}: {}", action, reason);
                drop(permit);
                Err(Error::AdmissionRejected {
                    action: action.to_string(),
                    reason,
                })
            }
        }
    }

    pub fn snapshot(&self, category: ActionCategory) -> CategorySnapshot {
        let stats = &self.gate(category).stats;
        CategorySnapshot {
            category,
            in_flight: stats.in_flight.load(Ordering::Relaxed),
            admitted: stats.admitted.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            monitored: stats.monitored.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("mode", &self.mode)
            .field("probes", &self.probes.read().len())
            .finish()
    }
}

/// Runs the gate before the wrapped handler sees the request
pub struct AdmissionControlledHandler {
    admission: Arc<AdmissionControl>,
    inner: Arc<dyn RequestHandler>,
}

impl AdmissionControlledHandler {
    pub fn new(admission: Arc<AdmissionControl>, inner: Arc<dyn RequestHandler>) -> Self {
        Self { admission, inner }
    }
}

#[async_trait]
impl RequestHandler for AdmissionControlledHandler {
    async fn handle(
        &self,
        request: InboundRequest,
        channel: &mut ResponseChannel,
    ) -> Result<Bytes> {
        let _permit = self
            .admission
            .apply_transport_admission_control(&request.action)?;
        self.inner.handle(request, channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn config(mode: AdmissionMode, max_in_flight: u64) -> AdmissionConfig {
        AdmissionConfig {
            mode,
            replication: CategoryLimits {
                max_in_flight,
                max_requests_per_sec: 0,
                burst: 0,
            },
            internal: CategoryLimits::default(),
            cache_pressure_threshold: 0.0,
        }
    }

    #[test]
    fn test_action_categories() {
        assert_eq!(
            ActionCategory::of("replication/getSegmentFiles"),
            ActionCategory::Replication
        );
        assert_eq!(ActionCategory::of("cluster/ping"), ActionCategory::Internal);
        assert_eq!(ActionCategory::of("replicationx"), ActionCategory::Internal);
    }

    #[test]
    fn test_in_flight_limit() {
        let admission = AdmissionControl::new(&config(AdmissionMode::Enforced, 2));
        let action = "replication/getSegmentFiles";

        let p1 = admission.apply_transport_admission_control(action).unwrap();
        let _p2 = admission.apply_transport_admission_control(action).unwrap();
        let err = admission.apply_transport_admission_control(action).unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { .. }));

        // Other categories are unaffected
        let _other = admission.apply_transport_admission_control("cluster/ping").unwrap();

        drop(p1);
        let _p3 = admission.apply_transport_admission_control(action).unwrap();

        let snapshot = admission.snapshot(ActionCategory::Replication);
        assert_eq!(snapshot.in_flight, 2);
        assert_eq!(snapshot.admitted, 3);
        assert_eq!(snapshot.rejected, 1);
    }

    #[test]
    fn test_monitor_only_admits() {
        let admission = AdmissionControl::new(&config(AdmissionMode::MonitorOnly, 1));
        let action = "replication/getCheckpointInfo";

        let _p1 = admission.apply_transport_admission_control(action).unwrap();
        let _p2 = admission.apply_transport_admission_control(action).unwrap();

        let snapshot = admission.snapshot(ActionCategory::Replication);
        assert_eq!(snapshot.monitored, 1);
        assert_eq!(snapshot.rejected, 0);
    }

    #[test]
    fn test_disabled_skips_everything() {
        let admission = AdmissionControl::new(&config(AdmissionMode::Disabled, 1));
        admission.add_pressure_probe(
            ActionCategory::Replication,
            "always",
            Arc::new(|| Some("busy".into())),
        );
        let _p1 = admission.apply_transport_admission_control("replication/a").unwrap();
        let _p2 = admission.apply_transport_admission_control("replication/a").unwrap();
        assert_eq!(admission.snapshot(ActionCategory::Replication).in_flight, 0);
    }

    #[test]
    fn test_pressure_probe() {
        let admission = AdmissionControl::new(&config(AdmissionMode::Enforced, 0));
        let pressured = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&pressured);
        admission.add_pressure_probe(
            ActionCategory::Replication,
            "cache",
            Arc::new(move || {
                flag.load(Ordering::Relaxed)
                    .then(|| "active usage above threshold".to_string())
            }),
        );

        assert!(admission.apply_transport_admission_control("replication/x").is_ok());
        pressured.store(true, Ordering::Relaxed);
        match admission.apply_transport_admission_control("replication/x") {
            Err(Error::AdmissionRejected { reason, .. }) => assert!(reason.starts_with("cache:")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(admission.apply_transport_admission_control("cluster/x").is_ok());
        assert_eq!(admission.snapshot(ActionCategory::Replication).in_flight, 0);
    }

    #[test]
    fn test_rate_limit() {
        let mut cfg = config(AdmissionMode::Enforced, 0);
        cfg.replication.max_requests_per_sec = 1;
        cfg.replication.burst = 3;
        let admission = AdmissionControl::new(&cfg);

        for _ in 0..3 {
            assert!(admission.apply_transport_admission_control("replication/x").is_ok());
        }
        assert!(admission.apply_transport_admission_control("replication/x").is_err());
    }

    #[test]
    fn test_token_bucket() {
        let bucket = TokenBucket::new(100, 10);
        assert_eq!(bucket.available(), 10);
        assert!(bucket.try_acquire(10));
        assert!(!bucket.try_acquire(1));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(bucket.try_acquire(1));
    }

    #[test]
    fn test_token_bucket_concurrent_acquire_stays_within_budget() {
        // One token per millisecond, burst of 50
        let bucket = Arc::new(TokenBucket::new(1000, 50));
        let started = Instant::now();
        let admitted = Arc::new(AtomicU64::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        if bucket.try_acquire(1) {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let budget = 50 + elapsed_ms + 2;
        assert!(admitted.load(Ordering::Relaxed) <= budget);
    }
}
