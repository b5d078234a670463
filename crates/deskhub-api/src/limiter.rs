//! Failed-login limiter keyed by client IP.
//!
//! Each IP gets a fixed counting window. Reaching `max_attempts` failures
//! inside the window locks the IP out for `lockout_secs`. A failure recorded
//! after the window has run out, or after a lockout has been served, starts a
//! fresh window. Logins are admitted through [`LoginLimiter::try_begin`], which
//! counts the attempt before the password is checked. Successful logins
//! remove the entry, and [`LoginLimiter::sweep`] drops entries that can no
//! longer influence a decision.

use std::net::IpAddr;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginLimitConfig {
    pub max_attempts: u32,
    pub window_secs: u64,
    pub lockout_secs: u64,
}

impl Default for LoginLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 900, // 15 minutes
            lockout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttemptWindow {
    count: u32,
    window_start: u64,
    locked_until: Option<u64>,
}

impl AttemptWindow {
    fn new(now: u64) -> Self {
        Self {
            count: 0,
            window_start: now,
            locked_until: None,
        }
    }

    fn is_locked(&self, now: u64) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    fn is_spent(&self, now: u64, config: &LoginLimitConfig) -> bool {
        let window_over = now.saturating_sub(self.window_start) > config.window_secs;
        let lockout_served = self.locked_until.is_some_and(|until| now >= until);
        window_over || lockout_served
    }
}

pub struct LoginLimiter {
    windows: DashMap<IpAddr, AttemptWindow>,
    config: LoginLimitConfig,
}

impl LoginLimiter {
    pub fn new(config: LoginLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &LoginLimitConfig {
        &self.config
    }

    fn count(&self, ip: IpAddr, window: &mut AttemptWindow, now: u64) -> u32 {
        if window.is_spent(now, &self.config) {
            *window = AttemptWindow::new(now);
        }

        window.count = window.count.saturating_add(1);
        if window.count >= self.config.max_attempts {
            window.locked_until = Some(now.saturating_add(self.config.lockout_secs));
            warn!(
                ip = %ip,
                failures = window.count,
                lockout_secs = self.config.lockout_secs,
                "Login locked out"
            );
        }

        window.count
    }

    /// Count a failed login from `ip` and return the failures in the current
    /// window, this one included.
    pub fn record_failure(&self, ip: IpAddr, now: u64) -> u32 {
        let mut window = self.windows.entry(ip).or_insert_with(|| AttemptWindow::new(now));
        self.count(ip, &mut window, now)
    }

    /// Admit a login attempt from `ip`, counting it as a failure up front.
    ///
    /// Returns the attempt number, or `Err(retry_after)` while locked out.
    /// The check and the count happen under one entry lock, so concurrent
    /// attempts can never get past `max_attempts`. A caller whose attempt
    /// turns out not to be a guess undoes it with [`LoginLimiter::reset`] or
    /// [`LoginLimiter::release`].
    pub fn try_begin(&self, ip: IpAddr, now: u64) -> Result<u32, u64> {
        let mut window = self.windows.entry(ip).or_insert_with(|| AttemptWindow::new(now));
        if let Some(until) = window.locked_until.filter(|until| now < *until) {
            return Err(until - now);
        }
        Ok(self.count(ip, &mut window, now))
    }

    /// Take back one attempt admitted by [`LoginLimiter::try_begin`] that
    /// could not be judged (the credential store failed).
    pub fn release(&self, ip: IpAddr) {
        let Some(mut window) = self.windows.get_mut(&ip) else {
            return;
        };
        window.count = window.count.saturating_sub(1);
        if window.count < self.config.max_attempts {
            window.locked_until = None;
        }
    }

    pub fn is_locked(&self, ip: IpAddr, now: u64) -> bool {
        self.windows
            .get(&ip)
            .is_some_and(|window| window.is_locked(now))
    }

    /// Seconds until `ip` may try again, if it is locked out
    pub fn retry_after(&self, ip: IpAddr, now: u64) -> Option<u64> {
        let window = self.windows.get(&ip)?;
        match window.locked_until {
            Some(until) if now < until => Some(until - now),
            _ => None,
        }
    }

    /// Forget `ip`, typically after it authenticated successfully
    pub fn reset(&self, ip: IpAddr) {
        self.windows.remove(&ip);
    }

    /// Drop windows that are both expired and not holding an active lockout.
    /// Returns how many were removed.
    pub fn sweep(&self, now: u64) -> usize {
        let horizon = self.config.window_secs.max(self.config.lockout_secs);
        let before = self.windows.len();
        self.windows.retain(|_ip, window| {
            window.window_start.saturating_add(horizon) >= now || window.is_locked(now)
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of IPs currently tracked
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for LoginLimiter {
    fn default() -> Self {
        Self::new(LoginLimitConfig::default())
    }
}
