//! Retry logic with a fixed delay between attempts.

use crate::types::RetryPolicy;
use std::fmt::Display;
use std::thread;

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called when an operation is about to be retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - Description of the failure
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &str);
}

/// Callback that reports retries through the `log` facade.
pub struct LogCallback<'a> {
    pub label: &'a str,
}

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &str) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying...",
            self.label,
            attempt,
            max_attempts,
            error
        );
    }
}

/// Execute an operation with retry logic.
///
/// Every error is retried until `policy.attempts()` is exhausted; the last
/// error is returned. The policy delay is slept between attempts, never after
/// the final one.
pub fn with_retry<T, E, F>(
    policy: &RetryPolicy,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt) {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                if let Some(cb) = callback {
                    cb.on_retry(attempt, max_attempts, &e.to_string());
                }
                thread::sleep(policy.delay());
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_with_retry_success_first_try() {
        let result = with_retry(&RetryPolicy::no_retry(), None, |_| Ok::<_, String>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_retry_eventual_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: 0,
        };
        let attempts = Cell::new(0);

        let result = with_retry(&policy, None, |attempt| {
            attempts.set(attempts.get() + 1);
            if attempt < 3 {
                Err("not yet".to_string())
            } else {
                Ok(attempt)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_with_retry_all_attempts_fail() {
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: 0,
        };
        let attempts = Cell::new(0);

        let result: Result<(), String> = with_retry(&policy, None, |attempt| {
            attempts.set(attempts.get() + 1);
            Err(format!("failure {attempt}"))
        });

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn test_callback_invoked_between_attempts() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingCallback(Arc<AtomicU32>);
        impl RetryCallback for CountingCallback {
            fn on_retry(&self, _: u32, _: u32, _: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let policy = RetryPolicy {
            max_attempts: 3,
            delay: 0,
        };
        let count = Arc::new(AtomicU32::new(0));
        let callback = CountingCallback(count.clone());

        let _: Result<(), String> =
            with_retry(&policy, Some(&callback), |_| Err("timeout".to_string()));

        // Not after the final attempt
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
