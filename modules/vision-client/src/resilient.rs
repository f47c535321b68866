use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::retry::RetryPolicy;
use crate::traits::VisionClassifier;
use crate::types::{Classification, ImageRef, VisionError};

/// Breaker plus retry around any inner classifier.
///
/// Policy: transient failures are retried up to `retry.max_attempts` with
/// backoff; permanent failures return immediately; an open breaker fails
/// fast without touching the inner client and is never retried locally.
/// Only transient failures feed the breaker — a 4xx means the request is
/// wrong, not that the service is down.
pub struct ResilientClassifier<C> {
    inner: C,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl<C> ResilientClassifier<C> {
    pub fn new(inner: C, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self { inner, breaker, retry }
    }
}

#[async_trait]
impl<C: VisionClassifier> VisionClassifier for ResilientClassifier<C> {
    async fn classify(&self, image: &ImageRef) -> Result<Classification, VisionError> {
        let mut attempt = 0u32;
        loop {
            self.breaker.try_acquire()?;

            match self.inner.classify(image).await {
                Ok(classification) => {
                    self.breaker.record_success();
                    return Ok(classification);
                }
                Err(e) if e.is_transient() => {
                    self.breaker.record_failure();
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        warn!(attempts = attempt, error = %e, "vision retries exhausted");
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e,
                        "transient vision failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use civicwatch_common::IssueCategory;

    use super::*;
    use crate::breaker::BreakerConfig;

    /// Scripted classifier: pops results front-to-back, counts invocations.
    struct ScriptedClassifier {
        results: Mutex<Vec<Result<Classification, VisionError>>>,
        calls: AtomicU32,
    }

    impl ScriptedClassifier {
        fn new(results: Vec<Result<Classification, VisionError>>) -> Self {
            Self { results: Mutex::new(results), calls: AtomicU32::new(0) }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VisionClassifier for &ScriptedClassifier {
        async fn classify(&self, _image: &ImageRef) -> Result<Classification, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                return Err(VisionError::Transient("script exhausted".into()));
            }
            results.remove(0)
        }
    }

    fn pothole() -> Classification {
        Classification {
            is_valid_issue: true,
            category: IssueCategory::Pothole,
            severity: 6,
            description: "pothole in roadway".to_string(),
            confidence: 0.92,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2,
            max_jitter: Duration::ZERO,
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }))
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let scripted = ScriptedClassifier::new(vec![
            Err(VisionError::Transient("timeout".into())),
            Err(VisionError::Transient("timeout".into())),
            Ok(pothole()),
        ]);
        let client = ResilientClassifier::new(&scripted, breaker(10), fast_retry(3));

        let result = client.classify(&ImageRef::Url("http://img/1.jpg".into())).await;
        assert!(result.is_ok());
        assert_eq!(scripted.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let scripted = ScriptedClassifier::new(vec![Err(VisionError::Permanent {
            status: 400,
            message: "bad request".into(),
        })]);
        let client = ResilientClassifier::new(&scripted, breaker(10), fast_retry(3));

        let result = client.classify(&ImageRef::Url("http://img/1.jpg".into())).await;
        assert!(matches!(result, Err(VisionError::Permanent { status: 400, .. })));
        assert_eq!(scripted.calls(), 1);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_calling_inner() {
        let scripted = ScriptedClassifier::new(vec![
            Err(VisionError::Transient("timeout".into())),
            Err(VisionError::Transient("timeout".into())),
            Err(VisionError::Transient("timeout".into())),
        ]);
        let shared = breaker(3);
        let client = ResilientClassifier::new(&scripted, shared.clone(), fast_retry(3));

        // Three transient failures exhaust retries and open the breaker.
        let first = client.classify(&ImageRef::Url("http://img/1.jpg".into())).await;
        assert!(matches!(first, Err(VisionError::Transient(_))));
        assert_eq!(scripted.calls(), 3);

        // Next call fails immediately: no inner invocation at all.
        let second = client.classify(&ImageRef::Url("http://img/2.jpg".into())).await;
        assert!(matches!(second, Err(VisionError::CircuitOpen)));
        assert_eq!(scripted.calls(), 3);
    }

    #[tokio::test]
    async fn breaker_opening_mid_retry_stops_the_loop() {
        let scripted = ScriptedClassifier::new(vec![
            Err(VisionError::Transient("timeout".into())),
            Err(VisionError::Transient("timeout".into())),
        ]);
        // Threshold 2: the breaker opens on the second failure, so the
        // third permitted attempt is rejected at the gate.
        let client = ResilientClassifier::new(&scripted, breaker(2), fast_retry(5));

        let result = client.classify(&ImageRef::Url("http://img/1.jpg".into())).await;
        assert!(matches!(result, Err(VisionError::CircuitOpen)));
        assert_eq!(scripted.calls(), 2);
    }
}
