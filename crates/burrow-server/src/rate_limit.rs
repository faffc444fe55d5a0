//! Sliding-window request budgets per client IP

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RateLimits;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Idle clients are swept once per this many checks
const SWEEP_EVERY: usize = 256;

/// Which budget a route draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Login,
    ChangePassword,
    Default,
}

/// One budget: at most `max` hits per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub max: u32,
    pub window: Duration,
}

pub struct RateLimiter {
    limits: RateLimits,
    hits: DashMap<(Scope, IpAddr), VecDeque<Instant>>,
    checks: AtomicUsize,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            hits: DashMap::new(),
            checks: AtomicUsize::new(0),
        }
    }

    fn windows(&self, scope: Scope) -> Vec<Window> {
        match scope {
            Scope::Login => vec![Window {
                max: self.limits.login_per_minute,
                window: MINUTE,
            }],
            Scope::ChangePassword => vec![Window {
                max: self.limits.password_per_hour,
                window: HOUR,
            }],
            Scope::Default => vec![
                Window {
                    max: self.limits.default_per_hour,
                    window: HOUR,
                },
                Window {
                    max: self.limits.default_per_day,
                    window: DAY,
                },
            ],
        }
    }

    /// Record a hit. Returns false when any budget of `scope` is spent;
    /// rejected hits do not count.
    pub fn check(&self, scope: Scope, ip: IpAddr) -> bool {
        self.check_at(scope, ip, Instant::now())
    }

    fn check_at(&self, scope: Scope, ip: IpAddr, now: Instant) -> bool {
        let windows = self.windows(scope);
        let longest = self.longest_window(scope);

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_idle(now);
        }

        let mut hits = self.hits.entry((scope, ip)).or_default();
        prune(&mut hits, now, longest);

        let allowed = windows.iter().all(|w| {
            let in_window = hits
                .iter()
                .filter(|t| now.duration_since(**t) < w.window)
                .count();
            in_window < w.max as usize
        });

        if allowed {
            hits.push_back(now);
        } else {
            tracing::warn!("Rate limit hit for {} ({:?})", ip, scope);
        }
        let empty = hits.is_empty();
        drop(hits);
        if empty {
            self.hits.remove(&(scope, ip));
        }
        allowed
    }

    /// Drop clients whose hits have all aged out of their scope's windows
    fn evict_idle(&self, now: Instant) {
        self.hits.retain(|(scope, _), hits| {
            let longest = self.longest_window(*scope);
            prune(hits, now, longest);
            !hits.is_empty()
        });
    }

    fn longest_window(&self, scope: Scope) -> Duration {
        self.windows(scope)
            .iter()
            .map(|w| w.window)
            .max()
            .unwrap_or(MINUTE)
    }
}

/// Remove hits older than `longest` from the front of the queue
fn prune(hits: &mut VecDeque<Instant>, now: Instant, longest: Duration) {
    while let Some(oldest) = hits.front() {
        if now.duration_since(*oldest) >= longest {
            hits.pop_front();
        } else {
            break;
        }
    }
}
