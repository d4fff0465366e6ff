// Bounded retry with exponential backoff and jitter

use rand::Rng;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio_retry2::strategy::ExponentialBackoff;
use tokio_retry2::{Retry, RetryError};
use tracing::{error, warn};

use crate::error::IibError;
use crate::settings::WorkerSettings;

const MAX_DELAY_MILLIS: u64 = 300_000;

/// How often and how patiently an operation is retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub multiplier: u32,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy built from `iib_total_attempts` and the `iib_retry_*` settings
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            attempts: settings.iib_total_attempts,
            delay: Duration::from_secs(settings.iib_retry_delay),
            multiplier: settings.iib_retry_multiplier,
            jitter: Duration::from_secs(settings.iib_retry_jitter),
        }
    }

    /// Retry right away, `attempts` times in total
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
            multiplier: 1,
            jitter: Duration::ZERO,
        }
    }

    /// Same backoff as the configured default but with a fixed attempt count
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Delays between attempts: `delay * multiplier^n`, capped at 300 s, plus up to `jitter`
    ///
    /// `ExponentialBackoff` yields `base^(n+1) * factor`, so the base is the multiplier
    /// and the factor is the initial delay divided by it.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        let multiplier = u64::from(self.multiplier.max(1));
        let factor = self.delay.as_millis() as u64 / multiplier;
        let jitter_ms = self.jitter.as_millis() as u64;
        ExponentialBackoff::from_millis(multiplier)
            .factor(factor)
            .max_delay_millis(MAX_DELAY_MILLIS)
            .map(move |delay| {
                if jitter_ms == 0 {
                    delay
                } else {
                    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                }
            })
            .take(self.attempts.max(1) as usize - 1)
    }
}

/// Retry `op` while the error matches `wait_on`, up to `policy.attempts` calls
///
/// Errors that do not match are permanent. The error of the last attempt is returned unchanged.
pub async fn with_retry<T, E, F, Fut, P>(policy: &RetryPolicy, name: &str, wait_on: P, mut op: F) -> Result<T, E>
where
    E: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let wait_on = &wait_on;
    let mut attempt = 0;
    let notify_name = name.to_owned();
    let result = Retry::spawn_notify(
        policy.strategy(),
        || {
            let fut = op();
            async move {
                fut.await.map_err(|err| {
                    if wait_on(&err) {
                        RetryError::transient(err)
                    } else {
                        RetryError::permanent(err)
                    }
                })
            }
        },
        move |err: &E, delay: Duration| {
            attempt += 1;
            warn!(
                "Error {:?} raised from {} (attempt {}/{}). Retrying in {:?}",
                err, notify_name, attempt, attempts, delay
            );
        },
    )
    .await;

    if let Err(err) = &result {
        if wait_on(err) {
            error!("The maximum number of attempts ({}) have failed for {}", attempts, name);
        }
    }
    result
}

/// Retry predicate for operational failures
pub fn on_iib_error(err: &IibError) -> bool {
    err.is_operational()
}
