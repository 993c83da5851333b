//! Rate limit tracker
//!
//! Keeps the remaining-call budget and reset instant reported by the upstream
//! for each resource path. State lives only in memory and starts optimistic;
//! a 429 is always handled by the retry path regardless of what is tracked
//! here.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use reqwest::header::HeaderMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

const REMAINING_HEADERS: [&str; 2] = ["x-rate-limit-remaining", "ratelimit-remaining"];
const RESET_HEADERS: [&str; 2] = ["x-rate-limit-reset", "ratelimit-reset"];

/// Reset values above this are unix timestamps rather than relative seconds
const EPOCH_THRESHOLD: f64 = 1e9;

/// Last known quota for one resource path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    /// Calls left in the current window
    pub remaining: Option<u64>,

    /// When the window resets
    pub reset_at: Option<Instant>,
}

/// Per-path rate limit state, safe to share between concurrent requests
pub struct RateLimitTracker {
    config: RateLimitConfig,
    states: RwLock<HashMap<String, RateLimitState>>,
}

impl RateLimitTracker {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Update quota for `path` from response headers
    ///
    /// Missing or unparsable headers leave the stored value untouched.
    pub fn record_response_headers(&self, path: &str, headers: &HeaderMap) {
        let remaining = header_value(headers, &REMAINING_HEADERS)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64);
        let reset_in = header_value(headers, &RESET_HEADERS)
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(parse_reset);

        if remaining.is_none() && reset_in.is_none() {
            return;
        }

        let now = Instant::now();
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(path.to_string()).or_insert(RateLimitState {
            remaining: None,
            reset_at: None,
        });
        if remaining.is_some() {
            state.remaining = remaining;
        }
        if let Some(reset_in) = reset_in {
            state.reset_at = Some(now + reset_in);
        }

        debug!(
            path = %path,
            remaining = ?state.remaining,
            reset_in_ms = reset_in.map(|d| d.as_millis() as u64),
            "Updated rate limit state"
        );
    }

    /// Record a `Retry-After` hint: the budget is exhausted until it elapses
    pub fn record_retry_after(&self, path: &str, retry_after: Duration) {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        states.insert(
            path.to_string(),
            RateLimitState {
                remaining: Some(0),
                reset_at: Some(Instant::now() + retry_after),
            },
        );
    }

    /// How long a request to `path` should wait before being sent
    ///
    /// Zero while the budget is above the low-water mark, when nothing is
    /// known, or once the reset instant has passed.
    pub fn compute_delay(&self, path: &str) -> Duration {
        let state = {
            let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
            match states.get(path) {
                Some(state) => *state,
                None => return Duration::ZERO,
            }
        };

        let remaining = match state.remaining {
            Some(remaining) => remaining,
            None => return Duration::ZERO,
        };
        if remaining > self.config.low_water_mark {
            return Duration::ZERO;
        }

        let reset_at = match state.reset_at {
            Some(reset_at) => reset_at,
            None => return Duration::ZERO,
        };
        let now = Instant::now();
        if reset_at <= now {
            return Duration::ZERO;
        }

        let jitter = if self.config.jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.config.jitter_ms))
        } else {
            Duration::ZERO
        };
        ((reset_at - now) + jitter).min(Duration::from_secs(self.config.max_delay_secs))
    }

    /// Current state for `path`, if any header has been seen
    pub fn state(&self, path: &str) -> Option<RateLimitState> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        states.get(path).copied()
    }
}

fn header_value<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// Turn a reset header into a duration from now
fn parse_reset(value: f64) -> Option<Duration> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    if value > EPOCH_THRESHOLD {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        Some(Duration::from_secs_f64((value - now).max(0.0)))
    } else {
        Some(Duration::from_secs_f64(value))
    }
}
