//! Adaptive concurrency limit and call pacing for remote calls.
//!
//! A throttle is shared by every worker of one refresh run (or by every
//! fallback lookup). It combines:
//! - a semaphore bounding in-flight calls,
//! - multiplicative decrease on rate limiting, down to `min_concurrency`,
//! - additive recovery, one permit per `recovery_successes` successes,
//! - pacing to at most `requests_per_second` call starts.
//!
//! Shrinking never revokes a permit that is in use: the reduction is held as
//! debt and paid off as permits are released.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub max_concurrency: usize,
    pub min_concurrency: usize,
    pub recovery_successes: u32,
    /// 0 disables pacing.
    pub requests_per_second: f64,
}

impl ThrottleConfig {
    pub fn unpaced(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            min_concurrency: 1,
            recovery_successes: 10,
            requests_per_second: 0.0,
        }
    }
}

#[derive(Debug)]
struct Limits {
    limit: usize,
    debt: usize,
    successes: u32,
}

#[derive(Debug)]
struct Inner {
    name: &'static str,
    config: ThrottleConfig,
    semaphore: Arc<Semaphore>,
    limits: Mutex<Limits>,
    interval: Option<Duration>,
    next_slot: tokio::sync::Mutex<Instant>,
}

/// Shared, cloneable throttle.
#[derive(Debug, Clone)]
pub struct Throttle {
    inner: Arc<Inner>,
}

/// Held for the duration of one remote call.
#[derive(Debug)]
pub struct ThrottlePermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            let mut limits = lock(&self.inner.limits);
            if limits.debt > 0 {
                limits.debt -= 1;
                permit.forget();
            }
        }
    }
}

fn lock(limits: &Mutex<Limits>) -> std::sync::MutexGuard<'_, Limits> {
    limits.lock().unwrap_or_else(|e| e.into_inner())
}

impl Throttle {
    pub fn new(name: &'static str, config: ThrottleConfig) -> Self {
        let max = config.max_concurrency.max(1);
        let config = ThrottleConfig {
            max_concurrency: max,
            min_concurrency: config.min_concurrency.clamp(1, max),
            ..config
        };
        let interval = (config.requests_per_second > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / config.requests_per_second));

        crate::metrics::set_concurrency(name, max);

        Self {
            inner: Arc::new(Inner {
                name,
                semaphore: Arc::new(Semaphore::new(max)),
                limits: Mutex::new(Limits {
                    limit: max,
                    debt: 0,
                    successes: 0,
                }),
                interval,
                next_slot: tokio::sync::Mutex::new(Instant::now()),
                config,
            }),
        }
    }

    /// Wait for a concurrency slot, then for the next pacing slot.
    pub async fn acquire(&self) -> Result<ThrottlePermit, AcquireError> {
        let permit = Arc::clone(&self.inner.semaphore).acquire_owned().await?;

        if let Some(interval) = self.inner.interval {
            let slot = {
                let mut next = self.inner.next_slot.lock().await;
                let slot = (*next).max(Instant::now());
                *next = slot + interval;
                slot
            };
            tokio::time::sleep_until(slot).await;
        }

        Ok(ThrottlePermit {
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Count a successful call toward recovery.
    pub fn on_success(&self) {
        let mut limits = lock(&self.inner.limits);
        if limits.limit >= self.inner.config.max_concurrency {
            limits.successes = 0;
            return;
        }
        limits.successes += 1;
        if limits.successes < self.inner.config.recovery_successes.max(1) {
            return;
        }

        limits.successes = 0;
        limits.limit += 1;
        if limits.debt > 0 {
            limits.debt -= 1;
        } else {
            self.inner.semaphore.add_permits(1);
        }

        debug!(throttle = self.inner.name, limit = limits.limit, "Concurrency recovered");
        crate::metrics::set_concurrency(self.inner.name, limits.limit);
    }

    /// Halve the concurrency limit after a rate-limit response.
    pub fn on_rate_limited(&self) {
        let mut limits = lock(&self.inner.limits);
        limits.successes = 0;

        let target = (limits.limit / 2).max(self.inner.config.min_concurrency);
        if target >= limits.limit {
            return;
        }
        let mut shrink = limits.limit - target;
        limits.limit = target;

        // Take idle permits out of circulation right away
        while shrink > 0 {
            match self.inner.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    shrink -= 1;
                }
                Err(_) => break,
            }
        }
        limits.debt += shrink;

        info!(
            throttle = self.inner.name,
            limit = limits.limit,
            debt = limits.debt,
            "Rate limited, reducing concurrency"
        );
        crate::metrics::set_concurrency(self.inner.name, limits.limit);
    }

    /// Current concurrency limit.
    pub fn limit(&self) -> usize {
        lock(&self.inner.limits).limit
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}
