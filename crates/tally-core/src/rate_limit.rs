//! Sliding-window rate limiter for sensitive client actions.
//!
//! Each action key (e.g. `"auth"`) tracks how many attempts were made in the
//! current window. Reaching the limit blocks the action until the window
//! ends. Expiry is evaluated lazily on every call; there is no background
//! timer and no persistence across restarts.

use crate::clock::{elapsed_between, saturating_add, DynClock, SystemClock};
use crate::config::RateLimitDefaults;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Callback invoked with the action key and block duration when a limit is hit.
pub type LimitReachedCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Limit parameters for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Attempts allowed per window.
    pub max_attempts: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }

    /// Login throttling preset: 5 attempts per 15 minutes.
    pub fn auth() -> Self {
        Self::new(
            RateLimitDefaults::AUTH_MAX_ATTEMPTS,
            RateLimitDefaults::AUTH_WINDOW,
        )
    }
}

/// Attempt bookkeeping for one action key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub attempt_count: u32,
    pub window_start: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: 0,
            window_start: now,
            last_attempt: None,
            blocked_until: None,
        }
    }

    fn restart(&mut self, now: DateTime<Utc>) {
        self.attempt_count = 0;
        self.window_start = now;
        self.blocked_until = None;
    }

    /// Apply lazy expiry: an elapsed block or an elapsed window starts over.
    fn settle(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) {
        match self.blocked_until {
            Some(until) if now >= until => self.restart(now),
            Some(_) => {}
            None => {
                if elapsed_between(self.window_start, now) > config.window {
                    self.restart(now);
                }
            }
        }
    }

    fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Per-action sliding-window rate limiter.
pub struct RateLimiter {
    default_config: RateLimitConfig,
    actions: HashMap<String, RateLimitConfig>,
    windows: Mutex<HashMap<String, RateWindow>>,
    clock: DynClock,
    on_limit: Option<LimitReachedCallback>,
}

impl RateLimiter {
    /// Create a limiter applying `default_config` to every action key.
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            actions: HashMap::new(),
            windows: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            on_limit: None,
        }
    }

    /// Use a specific limit for one action key.
    pub fn with_action(mut self, key: impl Into<String>, config: RateLimitConfig) -> Self {
        self.actions.insert(key.into(), config);
        self
    }

    pub fn with_clock(mut self, clock: DynClock) -> Self {
        self.clock = clock;
        self
    }

    /// Register a callback fired when an action reaches its limit.
    pub fn with_limit_callback(
        mut self,
        callback: impl Fn(&str, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_limit = Some(Arc::new(callback));
        self
    }

    /// Limit in effect for an action key.
    pub fn config_for(&self, key: &str) -> RateLimitConfig {
        self.actions
            .get(key)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Whether the action is currently blocked.
    ///
    /// An elapsed block is cleared here and the attempt count reset.
    pub fn is_limited(&self, key: &str) -> bool {
        let config = self.config_for(key);
        let now = self.clock.now();
        let mut windows = self.lock();

        match windows.get_mut(key) {
            Some(window) => {
                window.settle(&config, now);
                window.is_blocked(now)
            }
            None => false,
        }
    }

    /// Record one attempt of the action.
    pub fn record_attempt(&self, key: &str) {
        let config = self.config_for(key);
        let now = self.clock.now();

        let reached = {
            let mut windows = self.lock();
            let window = windows
                .entry(key.to_string())
                .or_insert_with(|| RateWindow::new(now));
            window.settle(&config, now);

            if window.is_blocked(now) {
                // Attempts while blocked never extend the block.
                window.last_attempt = Some(now);
                debug!("Attempt for '{}' recorded while blocked", key);
                None
            } else {
                window.attempt_count += 1;
                window.last_attempt = Some(now);

                if window.attempt_count >= config.max_attempts {
                    let window_end = saturating_add(window.window_start, config.window);
                    window.blocked_until = Some(window_end);
                    Some(elapsed_between(now, window_end))
                } else {
                    None
                }
            }
        };

        if let Some(block) = reached {
            warn!(
                "Rate limit reached for '{}' after {} attempts, blocked for {:?}",
                key, config.max_attempts, block
            );
            if let Some(callback) = &self.on_limit {
                callback(key, block);
            }
        }
    }

    /// Clear attempts and any block (e.g. after a successful login).
    pub fn reset(&self, key: &str) {
        if self.lock().remove(key).is_some() {
            debug!("Rate limit state for '{}' reset", key);
        }
    }

    /// Attempts left before the action is blocked.
    pub fn remaining_attempts(&self, key: &str) -> u32 {
        let config = self.config_for(key);
        let now = self.clock.now();
        let mut windows = self.lock();

        match windows.get_mut(key) {
            Some(window) => {
                window.settle(&config, now);
                config.max_attempts.saturating_sub(window.attempt_count)
            }
            None => config.max_attempts,
        }
    }

    /// Time until the block lifts; zero when not blocked.
    pub fn remaining_block_duration(&self, key: &str) -> Duration {
        let config = self.config_for(key);
        let now = self.clock.now();
        let mut windows = self.lock();

        match windows.get_mut(key) {
            Some(window) => {
                window.settle(&config, now);
                window
                    .blocked_until
                    .map(|until| elapsed_between(now, until))
                    .unwrap_or(Duration::ZERO)
            }
            None => Duration::ZERO,
        }
    }

    /// Snapshot of the bookkeeping for an action key.
    pub fn window(&self, key: &str) -> Option<RateWindow> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateWindow>> {
        // The map holds plain data; a poisoned guard is still consistent.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}
