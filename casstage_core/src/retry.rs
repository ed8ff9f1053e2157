//! Bounded retry with exponential backoff for remote calls.
//!
//! Only statuses in the retryable set are retried; anything else surfaces
//! immediately. The calling thread sleeps between attempts.

use crate::error::{Error, Result};
use crate::remote::{CallContext, Code, StatusResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Growth factor of the delay between attempts.
pub const BACKOFF_MULTIPLIER: f64 = 1.6;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);

type Attacher = Arc<dyn Fn(&mut CallContext) + Send + Sync>;
type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Delay before retry number `attempt` (0-indexed): `initial * 1.6^attempt`.
pub fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let micros = initial.as_micros() as f64 * BACKOFF_MULTIPLIER.powi(attempt as i32);
    Duration::from_micros(micros.round() as u64)
}

/// Run `invocation` with up to `retry_limit` retries.
///
/// Each attempt gets a fresh [`CallContext`] that `metadata_attacher` fills
/// in before the call. A status whose code is in `retryable_codes` is
/// retried after `initial_delay_ms * 1.6^attempt` milliseconds until the
/// limit is reached, then reported as [`Error::RetryLimitExceeded`]. Any
/// other status is reported as [`Error::Remote`] without further attempts.
pub fn retry<T, F>(
    invocation: F,
    retry_limit: u32,
    initial_delay_ms: u64,
    metadata_attacher: impl Fn(&mut CallContext) + Send + Sync + 'static,
    retryable_codes: &[Code],
) -> Result<T>
where
    F: FnMut(&mut CallContext) -> StatusResult<T>,
{
    RetryPolicy::new(retry_limit, Duration::from_millis(initial_delay_ms))
        .with_attacher(metadata_attacher)
        .with_retryable_codes(retryable_codes.iter().copied())
        .run("remote call", invocation)
}

/// Retry settings shared by every remote call a component makes.
#[derive(Clone)]
pub struct RetryPolicy {
    limit: u32,
    initial_delay: Duration,
    retryable: Vec<Code>,
    attacher: Attacher,
    sleeper: Sleeper,
}

impl RetryPolicy {
    /// A policy retrying `Unavailable` up to `limit` times.
    pub fn new(limit: u32, initial_delay: Duration) -> Self {
        Self {
            limit,
            initial_delay,
            retryable: vec![Code::Unavailable],
            attacher: Arc::new(|_: &mut CallContext| {}),
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Populate each attempt's context (headers, deadline).
    pub fn with_attacher(
        mut self,
        attacher: impl Fn(&mut CallContext) + Send + Sync + 'static,
    ) -> Self {
        self.attacher = Arc::new(attacher);
        self
    }

    /// Replace the set of retryable codes.
    pub fn with_retryable_codes(mut self, codes: impl IntoIterator<Item = Code>) -> Self {
        self.retryable = codes.into_iter().collect();
        self
    }

    /// Replace the function used to wait between attempts.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable.contains(&code)
    }

    /// Run one logical remote call under this policy.
    ///
    /// `operation` only labels log lines.
    pub fn run<T, F>(&self, operation: &str, mut invocation: F) -> Result<T>
    where
        F: FnMut(&mut CallContext) -> StatusResult<T>,
    {
        let mut attempt: u32 = 0;

        loop {
            let mut ctx = CallContext::new(attempt);
            (self.attacher)(&mut ctx);

            let status = match invocation(&mut ctx) {
                Ok(value) => return Ok(value),
                Err(status) => status,
            };

            if !self.is_retryable(status.code) {
                return Err(Error::remote(status));
            }

            if attempt >= self.limit {
                return Err(Error::retry_limit_exceeded(attempt + 1, status));
            }

            let delay = backoff_delay(self.initial_delay, attempt);
            tracing::warn!(
                operation,
                attempt = attempt + 1,
                limit = self.limit,
                delay_ms = delay.as_millis() as u64,
                code = %status.code,
                "retrying after error: {}",
                status.message
            );
            (self.sleeper)(delay);
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_LIMIT, DEFAULT_INITIAL_DELAY)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("limit", &self.limit)
            .field("initial_delay", &self.initial_delay)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Status;
    use std::sync::Mutex;

    fn recording_policy(limit: u32) -> (RetryPolicy, Arc<Mutex<Vec<Duration>>>) {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&sleeps);
        let policy = RetryPolicy::new(limit, Duration::from_millis(100))
            .with_sleeper(move |d| recorder.lock().unwrap().push(d));
        (policy, sleeps)
    }

    #[test]
    fn test_backoff_delay() {
        let initial = Duration::from_millis(100);
        assert_eq!(backoff_delay(initial, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(initial, 1), Duration::from_millis(160));
        assert_eq!(backoff_delay(initial, 2), Duration::from_millis(256));
        assert_eq!(backoff_delay(initial, 3), Duration::from_micros(409_600));
    }

    #[test]
    fn test_always_retryable_exhausts_limit() {
        let (policy, sleeps) = recording_policy(3);
        let mut calls = 0;

        let result: Result<()> = policy.run("test", |_| {
            calls += 1;
            Err(Status::unavailable("down"))
        });

        assert_eq!(calls, 4);
        match result {
            Err(Error::RetryLimitExceeded { attempts, status }) => {
                assert_eq!(attempts, 4);
                assert_eq!(status, Status::unavailable("down"));
            }
            other => panic!("expected retry limit error, got {other:?}"),
        }
        assert_eq!(
            *sleeps.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(160),
                Duration::from_millis(256)
            ]
        );
    }

    #[test]
    fn test_succeeds_on_kth_attempt() {
        for k in 1..=4u32 {
            let (policy, sleeps) = recording_policy(3);
            let mut calls = 0;

            let result = policy.run("test", |_| {
                calls += 1;
                if calls < k {
                    Err(Status::unavailable("flaky"))
                } else {
                    Ok(calls)
                }
            });

            assert_eq!(result.unwrap(), k);
            assert_eq!(calls, k);
            assert_eq!(sleeps.lock().unwrap().len(), (k - 1) as usize);
        }
    }

    #[test]
    fn test_non_retryable_short_circuits() {
        let (policy, sleeps) = recording_policy(10);
        let mut calls = 0;

        let result: Result<()> = policy.run("test", |_| {
            calls += 1;
            Err(Status::new(Code::PermissionDenied, "nope"))
        });

        assert_eq!(calls, 1);
        assert!(sleeps.lock().unwrap().is_empty());
        match result {
            Err(Error::Remote { status }) => {
                assert_eq!(status.code, Code::PermissionDenied);
                assert_eq!(status.message, "nope");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_limit_means_single_attempt() {
        let (policy, _) = recording_policy(0);
        let mut calls = 0;

        let result: Result<()> = policy.run("test", |_| {
            calls += 1;
            Err(Status::unavailable("down"))
        });

        assert_eq!(calls, 1);
        assert!(matches!(
            result,
            Err(Error::RetryLimitExceeded { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_custom_retryable_codes() {
        let (policy, _) = recording_policy(2);
        let policy = policy.with_retryable_codes([Code::ResourceExhausted]);
        let mut calls = 0;

        let result: Result<()> = policy.run("test", |_| {
            calls += 1;
            if calls == 1 {
                Err(Status::new(Code::ResourceExhausted, "busy"))
            } else {
                Err(Status::unavailable("down"))
            }
        });

        assert_eq!(calls, 2);
        assert!(matches!(result, Err(Error::Remote { .. })));
    }

    #[test]
    fn test_attacher_sees_fresh_context_per_attempt() {
        let (policy, _) = recording_policy(2);
        let policy = policy.with_attacher(|ctx| {
            assert!(ctx.metadata.is_empty());
            ctx.insert_metadata("attempt", ctx.attempt.to_string());
            ctx.set_deadline(Duration::from_secs(1));
        });
        let mut seen = Vec::new();

        let _ = policy.run("test", |ctx| -> StatusResult<()> {
            seen.push(ctx.metadata["attempt"].clone());
            assert_eq!(ctx.deadline, Some(Duration::from_secs(1)));
            Err(Status::unavailable("down"))
        });

        assert_eq!(seen, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_free_function() {
        let mut calls = 0;
        let result = retry(
            |_| {
                calls += 1;
                if calls == 1 {
                    Err(Status::unavailable("once"))
                } else {
                    Ok("done")
                }
            },
            2,
            1,
            |_| {},
            &[Code::Unavailable],
        );

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 2);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Attempts never exceed limit + 1.
        #[test]
        fn prop_attempt_bound(limit in 0u32..8, fail_for in 0u32..12) {
            let policy = RetryPolicy::new(limit, Duration::from_millis(1)).with_sleeper(|_| {});
            let mut calls = 0u32;

            let result = policy.run("prop", |_| {
                calls += 1;
                if calls <= fail_for {
                    Err(Status::unavailable("down"))
                } else {
                    Ok(())
                }
            });

            prop_assert!(calls <= limit + 1);
            prop_assert_eq!(result.is_ok(), fail_for <= limit);
        }
    }
}
