//! Per-service circuit breakers, shared across requests.
//!
//! Transition rules: `BREAKER_FAILURE_THRESHOLD` consecutive failures
//! inside the rolling window open the breaker; after the cool-off one
//! probe call runs (half-open); probe success closes, probe failure
//! reopens. While open, callers fail fast with a retry-after hint.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use adjutant_core::config::{
    BREAKER_COOLOFF_SECS, BREAKER_FAILURE_THRESHOLD, BREAKER_WINDOW_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed {
        consecutive: u32,
        first_failure: Option<Instant>,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        probe_in_flight: bool,
    },
}

/// Public snapshot entry for health rendering.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerEntry {
    pub service: String,
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub total_opens: u64,
}

pub struct CircuitBreaker {
    service: String,
    threshold: u32,
    window: Duration,
    cooloff: Duration,
    state: Mutex<State>,
    total_opens: Mutex<u64>,
}

impl CircuitBreaker {
    fn new(service: &str, threshold: u32, window: Duration, cooloff: Duration) -> Self {
        Self {
            service: service.to_string(),
            threshold,
            window,
            cooloff,
            state: Mutex::new(State::Closed {
                consecutive: 0,
                first_failure: None,
            }),
            total_opens: Mutex::new(0),
        }
    }

    /// Admit or reject a call. `Err(retry_after_ms)` means fail fast.
    pub fn admit(&self) -> Result<(), u64> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                let now = Instant::now();
                if now >= *until {
                    // Cool-off elapsed: this caller becomes the probe.
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!(service = %self.service, "breaker half-open, probing");
                    Ok(())
                } else {
                    Err((*until - now).as_millis() as u64)
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Err(self.cooloff.as_millis() as u64)
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::HalfOpen { .. } | State::Open { .. }) {
            info!(service = %self.service, "breaker closed after successful probe");
        }
        *state = State::Closed {
            consecutive: 0,
            first_failure: None,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        match &mut *state {
            State::Closed {
                consecutive,
                first_failure,
            } => {
                // Consecutive failures only count inside the rolling window.
                match first_failure {
                    Some(start) if now.duration_since(*start) > self.window => {
                        *consecutive = 1;
                        *first_failure = Some(now);
                    }
                    Some(_) => *consecutive += 1,
                    None => {
                        *consecutive = 1;
                        *first_failure = Some(now);
                    }
                }
                if *consecutive >= self.threshold {
                    warn!(
                        service = %self.service,
                        failures = *consecutive,
                        "breaker opened"
                    );
                    *state = State::Open {
                        until: now + self.cooloff,
                    };
                    *self.total_opens.lock().unwrap() += 1;
                }
            }
            State::HalfOpen { .. } => {
                warn!(service = %self.service, "probe failed, breaker reopened");
                *state = State::Open {
                    until: now + self.cooloff,
                };
                *self.total_opens.lock().unwrap() += 1;
            }
            State::Open { .. } => {}
        }
    }

    pub fn status(&self) -> BreakerStatus {
        match *self.state.lock().unwrap() {
            State::Closed { .. } => BreakerStatus::Closed,
            State::Open { .. } => BreakerStatus::Open,
            State::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    fn entry(&self) -> BreakerEntry {
        let state = self.state.lock().unwrap();
        let (status, consecutive) = match &*state {
            State::Closed { consecutive, .. } => (BreakerStatus::Closed, *consecutive),
            State::Open { .. } => (BreakerStatus::Open, self.threshold),
            State::HalfOpen { .. } => (BreakerStatus::HalfOpen, self.threshold),
        };
        BreakerEntry {
            service: self.service.clone(),
            status,
            consecutive_failures: consecutive,
            total_opens: *self.total_opens.lock().unwrap(),
        }
    }
}

/// One breaker per external service, created lazily, shared across requests.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    threshold: u32,
    window: Duration,
    cooloff: Duration,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(
            BREAKER_FAILURE_THRESHOLD,
            Duration::from_secs(BREAKER_WINDOW_SECS),
            Duration::from_secs(BREAKER_COOLOFF_SECS),
        )
    }
}

impl BreakerRegistry {
    pub fn new(threshold: u32, window: Duration, cooloff: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            threshold,
            window,
            cooloff,
        }
    }

    pub fn for_service(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.threshold,
                    self.window,
                    self.cooloff,
                ))
            })
            .clone()
    }

    /// Health snapshot across all known services.
    pub fn snapshot(&self) -> Vec<BreakerEntry> {
        let mut entries: Vec<BreakerEntry> =
            self.breakers.iter().map(|b| b.value().entry()).collect();
        entries.sort_by(|a, b| a.service.cmp(&b.service));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_registry() -> BreakerRegistry {
        BreakerRegistry::new(5, Duration::from_secs(30), Duration::from_millis(20))
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let registry = quick_registry();
        let breaker = registry.for_service("email");
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.status(), BreakerStatus::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let registry = quick_registry();
        let breaker = registry.for_service("email");
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let registry = quick_registry();
        let breaker = registry.for_service("email");
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.admit().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        // First caller after cool-off becomes the probe...
        assert!(breaker.admit().is_ok());
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        // ...and concurrent callers are still rejected.
        assert!(breaker.admit().is_err());

        breaker.record_success();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert!(breaker.admit().is_ok());
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let registry = quick_registry();
        let breaker = registry.for_service("calendar");
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.admit().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.status(), BreakerStatus::Open);
    }

    #[test]
    fn snapshot_lists_services_sorted() {
        let registry = quick_registry();
        registry.for_service("email").record_failure();
        registry.for_service("calendar");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].service, "calendar");
        assert_eq!(snapshot[1].service, "email");
        assert_eq!(snapshot[1].consecutive_failures, 1);
    }
}
