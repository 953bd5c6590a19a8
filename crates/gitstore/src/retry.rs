//! Generic attempt/retry harness.
//!
//! The body owns retryability: it returns [`Attempt::Retry`] to request
//! another attempt and an error to give up. The coordinator owns the sleep
//! between attempts. Bounding the number of attempts is also the body's
//! job (it receives the attempt counter and can consult
//! [`RetryOptions::max_attempts`]).

use std::time::Duration;

/// Outcome of one attempt.
pub enum Attempt<T> {
    Done(T),
    Retry,
}

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::ZERO,
        }
    }
}

/// Run `body` until it returns [`Attempt::Done`] or an error, sleeping
/// `options.delay` between attempts. Attempts are counted from 1.
pub async fn with_retry<T, E, F>(
    name: &str,
    options: &RetryOptions,
    mut body: F,
) -> Result<T, E>
where
    F: AsyncFnMut(u32) -> Result<Attempt<T>, E>,
{
    let mut attempt = 1u32;
    loop {
        tracing::debug!(name, attempt, "attempt");
        match body(attempt).await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry => {
                if !options.delay.is_zero() {
                    tokio::time::sleep(options.delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_on_first_success() {
        let result: Result<u32, &str> =
            with_retry("test", &RetryOptions::default(), async |attempt| {
                Ok(Attempt::Done(attempt))
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn retries_until_the_body_is_satisfied() {
        let mut calls = 0u32;
        let result: Result<u32, &str> =
            with_retry("test", &RetryOptions::default(), async |attempt| {
                calls += 1;
                if attempt < 3 {
                    Ok(Attempt::Retry)
                } else {
                    Ok(Attempt::Done(attempt))
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn errors_propagate_immediately() {
        let mut calls = 0u32;
        let result: Result<(), &str> =
            with_retry("test", &RetryOptions::default(), async |_attempt| {
                calls += 1;
                Err("boom")
            })
            .await;
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn sleeps_between_attempts() {
        let options = RetryOptions {
            max_attempts: 5,
            delay: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        let result: Result<(), &str> = with_retry("test", &options, async |attempt| {
            if attempt < 3 {
                Ok(Attempt::Retry)
            } else {
                Ok(Attempt::Done(()))
            }
        })
        .await;
        result.unwrap();
        // Two sleeps of 20ms each sit between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
