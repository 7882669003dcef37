//! Wait and polling primitives
//!
//! All waits use the tokio clock so they can be driven by a paused runtime
//! in tests.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Options for [`wait_for`]
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
    /// Message carried by the timeout error
    pub message: String,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(500),
            message: "condition not met".to_string(),
        }
    }
}

impl WaitOptions {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Options for [`wait_for_api_status`]
#[derive(Debug, Clone)]
pub struct StatusWaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
    /// Top-level field of the serialized resource holding its status
    pub status_field: String,
}

impl Default for StatusWaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(500),
            status_field: "status".to_string(),
        }
    }
}

/// Suspend the current task.
pub async fn wait(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Poll `condition` until it yields `true` or the timeout elapses.
///
/// Errors from the predicate count as "not yet satisfied": an element that is
/// not rendered yet or a 404 during propagation must not abort the poll.
pub async fn wait_for<F, Fut>(mut condition: F, options: WaitOptions) -> E2eResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<bool>>,
{
    wait_for_value(
        move || {
            let check = condition();
            async move { Ok(check.await?.then_some(())) }
        },
        options,
    )
    .await
}

/// Poll `check` until it yields `Some(value)`, with the same error and
/// timing rules as [`wait_for`].
pub async fn wait_for_value<T, F, Fut>(mut check: F, options: WaitOptions) -> E2eResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<Option<T>>>,
{
    let start = Instant::now();
    let mut polls = 0u32;

    loop {
        polls += 1;
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => debug!("poll {} errored (ignored): {}", polls, e),
        }

        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            return Err(E2eError::Timeout(format!(
                "{} (after {} ms, {} polls)",
                options.message,
                elapsed.as_millis(),
                polls
            )));
        }

        let remaining = options.timeout - elapsed;
        tokio::time::sleep(options.interval.min(remaining)).await;
    }
}

/// Poll a REST resource until its status field equals `expected`.
///
/// Each iteration performs a fresh fetch and the last fetched value is
/// returned on success.
pub async fn wait_for_api_status<T, F, Fut>(
    mut poll: F,
    expected: &str,
    options: StatusWaitOptions,
) -> E2eResult<T>
where
    T: Serialize,
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<T>>,
{
    let start = Instant::now();
    let mut last_seen: Option<String> = None;

    loop {
        match poll().await {
            Ok(value) => match status_of(&value, &options.status_field) {
                Ok(status) if status == expected => return Ok(value),
                Ok(status) => last_seen = Some(status),
                Err(e) => debug!("status poll returned unusable resource: {}", e),
            },
            Err(e) => debug!("status poll errored (ignored): {}", e),
        }

        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            return Err(E2eError::Timeout(format!(
                "expected {} '{}' within {} ms; last seen {}",
                options.status_field,
                expected,
                options.timeout.as_millis(),
                last_seen.as_deref().unwrap_or("<none>")
            )));
        }

        let remaining = options.timeout - elapsed;
        tokio::time::sleep(options.interval.min(remaining)).await;
    }
}

fn status_of<T: Serialize>(value: &T, field: &str) -> E2eResult<String> {
    let json = serde_json::to_value(value)?;
    match json.get(field) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(E2eError::AssertionFailed(format!(
            "field '{}' missing from resource",
            field
        ))),
    }
}

/// Race `future` against a timer.
///
/// On expiry the future is dropped, which cancels whatever it was awaiting;
/// child processes spawned with `kill_on_drop` die with it.
pub async fn with_timeout<T, Fut>(future: Fut, timeout: Duration, message: &str) -> E2eResult<T>
where
    Fut: Future<Output = E2eResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(E2eError::Timeout(format!(
            "{} (exceeded {} ms)",
            message,
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_resolves_when_condition_turns_true() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        wait_for(
            move || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
            WaitOptions::new(Duration::from_secs(5), Duration::from_millis(100)),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout_window() {
        let timeout = Duration::from_millis(1000);
        let interval = Duration::from_millis(300);
        let start = Instant::now();

        let err = wait_for(
            || async { Ok(false) },
            WaitOptions::new(timeout, interval).with_message("never true"),
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed <= timeout + interval);
        assert!(matches!(err, E2eError::Timeout(ref m) if m.contains("never true")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_swallows_predicate_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        wait_for(
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(E2eError::AssertionFailed("not rendered".into()))
                    } else {
                        Ok(true)
                    }
                }
            },
            WaitOptions::new(Duration::from_secs(1), Duration::from_millis(50)),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_value_returns_first_hit() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let found = wait_for_value(
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move { Ok((n == 2).then_some("Test Plat 1")) }
            },
            WaitOptions::new(Duration::from_secs(2), Duration::from_millis(100)),
        )
        .await
        .unwrap();

        assert_eq!(found, "Test Plat 1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[derive(Debug, Serialize)]
    struct Resource {
        id: u32,
        status: String,
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_api_status_fetches_fresh_each_time() {
        let fetches = Arc::new(AtomicU32::new(0));
        let f = fetches.clone();

        let resource = wait_for_api_status(
            move || {
                let n = f.fetch_add(1, Ordering::SeqCst);
                async move {
                    let status = if n < 3 { "EN_ATTENTE" } else { "EN_PREPARATION" };
                    Ok(Resource {
                        id: 7,
                        status: status.to_string(),
                    })
                }
            },
            "EN_PREPARATION",
            StatusWaitOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(resource.status, "EN_PREPARATION");
        assert_eq!(resource.id, 7);
        assert_eq!(fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_api_status_reports_last_seen() {
        let err = wait_for_api_status(
            || async {
                Ok(Resource {
                    id: 1,
                    status: "EN_ATTENTE".into(),
                })
            },
            "PRETE",
            StatusWaitOptions {
                timeout: Duration::from_millis(500),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("last seen EN_ATTENTE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_drops_slow_future() {
        let err = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            Duration::from_millis(200),
            "browser click",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, E2eError::Timeout(ref m) if m.contains("browser click")));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through_result() {
        let value = with_timeout(async { Ok(5) }, Duration::from_secs(1), "fast")
            .await
            .unwrap();
        assert_eq!(value, 5);
    }
}
