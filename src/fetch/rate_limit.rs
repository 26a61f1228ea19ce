use crate::config::{
    parse_var, EnvSource, ProcessEnv, DEFAULT_RATE_LIMIT_PER_HOUR, DEFAULT_RATE_LIMIT_PER_MINUTE,
    ENV_RATE_LIMIT_PER_HOUR, ENV_RATE_LIMIT_PER_MINUTE,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

const MINUTE: Duration = Duration::from_millis(60_000);
const HOUR: Duration = Duration::from_millis(3_600_000);

/// Which ceiling a rejected request tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindowKind {
    Minute,
    Hour,
}

impl std::fmt::Display for RateWindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateWindowKind::Minute => f.write_str("minute"),
            RateWindowKind::Hour => f.write_str("hour"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: too many requests to {host} per {window}")]
    RateLimitExceeded { host: String, window: RateWindowKind },
}

impl RateLimitError {
    pub fn window(&self) -> RateWindowKind {
        match self {
            RateLimitError::RateLimitExceeded { window, .. } => *window,
        }
    }
}

/// One fixed window: a counter and the instant it was last zeroed.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            reset_at: now,
        }
    }

    /// Zeroes the counter once more than `length` has elapsed, then counts
    /// this request. Returns the post-increment count.
    fn record(&mut self, now: Instant, length: Duration) -> u32 {
        if now.saturating_duration_since(self.reset_at) > length {
            self.count = 0;
            self.reset_at = now;
        }
        self.count = self.count.saturating_add(1);
        self.count
    }
}

/// Per-host minute and hour counters.
#[derive(Debug)]
struct RateWindow {
    minute: Window,
    hour: Window,
}

impl RateWindow {
    /// Both windows would reset on the next call, so dropping the entry
    /// loses nothing.
    fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.minute.reset_at) > MINUTE
            && now.saturating_duration_since(self.hour.reset_at) > HOUR
    }
}

/// Host table plus the time it was last swept for idle entries.
struct HostWindows {
    entries: HashMap<String, Arc<Mutex<RateWindow>>>,
    last_sweep: Instant,
}

impl HostWindows {
    /// Drops idle hosts nobody is currently holding. Runs at most once per
    /// minute, and only when a new host is about to be added.
    fn sweep(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) <= MINUTE {
            return;
        }
        self.last_sweep = now;

        let before = self.entries.len();
        // Holding the table lock, a strong count of 1 means no caller has the entry
        self.entries.retain(|_, entry| {
            Arc::strong_count(entry) > 1
                || !entry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_idle(now)
        });
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.entries.len(), "Dropped idle rate-limit windows");
        }
    }
}

/// Per-host request ceilings over fixed minute and hour windows.
///
/// Each host gets its own lock, so fetches to unrelated hosts never contend;
/// the outer map lock is held only long enough to look up or create a host's
/// entry. Hosts idle for over an hour are swept out as new hosts arrive, so
/// the table does not grow with every name ever seen.
///
/// Ceilings resolve, per call: environment variable, then the value given at
/// construction, then the built-in default (60/minute, 1000/hour).
pub struct RateLimiter {
    windows: Mutex<HostWindows>,
    per_minute: Option<u32>,
    per_hour: Option<u32>,
    env: Arc<dyn EnvSource>,
}

impl RateLimiter {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            windows: Mutex::new(HostWindows {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            per_minute: None,
            per_hour: None,
            env,
        }
    }

    /// Sets the fallback per-minute ceiling used when the environment is silent.
    pub fn with_per_minute(mut self, ceiling: Option<u32>) -> Self {
        self.per_minute = ceiling;
        self
    }

    /// Sets the fallback per-hour ceiling used when the environment is silent.
    pub fn with_per_hour(mut self, ceiling: Option<u32>) -> Self {
        self.per_hour = ceiling;
        self
    }

    pub fn per_minute_ceiling(&self) -> u32 {
        parse_var(
            self.env.var(ENV_RATE_LIMIT_PER_MINUTE),
            ENV_RATE_LIMIT_PER_MINUTE,
        )
        .or(self.per_minute)
        .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE)
    }

    pub fn per_hour_ceiling(&self) -> u32 {
        parse_var(self.env.var(ENV_RATE_LIMIT_PER_HOUR), ENV_RATE_LIMIT_PER_HOUR)
            .or(self.per_hour)
            .unwrap_or(DEFAULT_RATE_LIMIT_PER_HOUR)
    }

    /// Counts one logical fetch to `host` and rejects it if a ceiling is exceeded.
    ///
    /// A rejected request stays counted. The minute window is checked first;
    /// a minute rejection leaves the hour window untouched.
    pub fn check_and_record(&self, host: &str) -> Result<(), RateLimitError> {
        self.check_and_record_at(host, Instant::now())
    }

    pub(crate) fn check_and_record_at(
        &self,
        host: &str,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        let host = host.to_ascii_lowercase();
        let per_minute = self.per_minute_ceiling();
        let per_hour = self.per_hour_ceiling();

        let entry = {
            let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
            if !windows.entries.contains_key(&host) {
                windows.sweep(now);
            }
            Arc::clone(windows.entries.entry(host.clone()).or_insert_with(|| {
                Arc::new(Mutex::new(RateWindow {
                    minute: Window::new(now),
                    hour: Window::new(now),
                }))
            }))
        };

        let mut window = entry.lock().unwrap_or_else(PoisonError::into_inner);

        let minute_count = window.minute.record(now, MINUTE);
        if minute_count > per_minute {
            tracing::warn!(host = %host, count = minute_count, ceiling = per_minute, "Per-minute rate limit exceeded");
            return Err(RateLimitError::RateLimitExceeded {
                host,
                window: RateWindowKind::Minute,
            });
        }

        let hour_count = window.hour.record(now, HOUR);
        if hour_count > per_hour {
            tracing::warn!(host = %host, count = hour_count, ceiling = per_hour, "Per-hour rate limit exceeded");
            return Err(RateLimitError::RateLimitExceeded {
                host,
                window: RateWindowKind::Hour,
            });
        }

        tracing::debug!(
            host = %host,
            minute_count = minute_count,
            hour_count = hour_count,
            "Rate limit check passed"
        );
        Ok(())
    }

    /// Current (minute, hour) counts for `host`, if it has been seen.
    pub fn counts(&self, host: &str) -> Option<(u32, u32)> {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows.entries.get(&host.to_ascii_lowercase())?;
        let window = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some((window.minute.count, window.hour.count))
    }

    /// Number of hosts currently tracked.
    pub fn tracked_hosts(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(ProcessEnv))
    }
}
