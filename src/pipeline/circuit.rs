use crate::infrastructure::config::CircuitConfig;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are blocked until the reset timeout elapses.
    Open,
    /// A limited probe is allowed through to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    /// Outcomes observed inside the rolling window.
    observations: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

/// Error-ratio circuit breaker over a rolling time window.
///
/// Opens when the failure ratio within the window reaches the configured
/// threshold (given a minimum number of observations), blocks while open,
/// and allows a single probe after the reset timeout. A successful probe
/// closes the circuit; a failed one reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                observations: VecDeque::new(),
                opened_at: None,
                half_open_probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Whether a request may proceed right now. While open, flips to
    /// half-open once the reset timeout has elapsed and admits one probe.
    pub fn should_allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.prune(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_enough = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed_enough {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    false
                } else {
                    inner.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.observations.push_back((Instant::now(), true));
        self.prune(&mut inner);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.half_open_probe_in_flight = false;
                inner.observations.clear();
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.observations.push_back((Instant::now(), false));
        self.prune(&mut inner);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_probe_in_flight = false;
            }
            CircuitState::Closed => {
                if self.should_open(&inner) {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let mut inner = self.lock();
        self.prune(&mut inner);
        Self::ratio(&inner)
    }

    fn should_open(&self, inner: &CircuitInner) -> bool {
        if (inner.observations.len() as u64) < self.config.min_requests {
            return false;
        }
        Self::ratio(inner) >= self.config.error_threshold
    }

    fn ratio(inner: &CircuitInner) -> f64 {
        if inner.observations.is_empty() {
            return 0.0;
        }
        let failures = inner.observations.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / inner.observations.len() as f64
    }

    fn prune(&self, inner: &mut CircuitInner) {
        let horizon = self.config.window;
        while let Some((at, _)) = inner.observations.front() {
            if at.elapsed() > horizon {
                inner.observations.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(min_requests: u64, reset_timeout: Duration) -> CircuitConfig {
        CircuitConfig {
            error_threshold: 0.5,
            window: Duration::from_secs(30),
            reset_timeout,
            min_requests,
        }
    }

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::new(config(10, Duration::from_secs(30)));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.should_allow_request());
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(config(4, Duration::from_secs(30)));
        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_allow_request());
    }

    #[test]
    fn test_min_requests_guard() {
        let breaker = CircuitBreaker::new(config(10, Duration::from_secs(30)));
        for _ in 0..5 {
            breaker.record_failure();
        }
        // Below the observation floor the circuit stays closed.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_recovers() {
        let breaker = CircuitBreaker::new(config(2, Duration::from_millis(0)));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Reset timeout of zero promotes to half-open immediately; exactly
        // one probe is admitted.
        assert!(breaker.should_allow_request());
        assert!(!breaker.should_allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.should_allow_request());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(config(2, Duration::from_millis(0)));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.should_allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_failure_rate_reported() {
        let breaker = CircuitBreaker::new(config(100, Duration::from_secs(30)));
        breaker.record_success();
        breaker.record_failure();
        assert!((breaker.failure_rate() - 0.5).abs() < f64::EPSILON);
    }
}
