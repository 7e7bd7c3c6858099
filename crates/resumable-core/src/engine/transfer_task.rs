//! Transfer task - the download state machine
//!
//! Reads the persisted state, runs the action bound to it, persists the
//! state the action returns and loops until the transfer completes. Every
//! step re-reads the store, so a task can be dropped at any point and a new
//! one resumes from what the store confirms.

use crate::engine::backoff::{BackoffPolicy, ExponentialBackoff, FailureStreak, RetryDecision};
use crate::engine::range_request::RangeRequestExecutor;
use crate::engine::transport::HttpTransport;
use crate::error::TransferError;
use crate::storage::ProgressStore;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use resumable_types::{ByteRange, ErrorKind, TransferEvent, TransferSettings, TransferState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A download state machine bound to a transport
pub struct TransferTask<T> {
    transport: T,
    settings: TransferSettings,
    policy: Arc<dyn BackoffPolicy>,
    event_tx: broadcast::Sender<TransferEvent>,
    cancelled: CancellationToken,
}

impl<T: HttpTransport> TransferTask<T> {
    /// Create a task using the exponential policy described by `settings.retry`
    pub fn new(transport: T, settings: TransferSettings) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        let policy = Arc::new(ExponentialBackoff::from_settings(&settings.retry));

        Self {
            transport,
            settings,
            policy,
            event_tx,
            cancelled: CancellationToken::new(),
        }
    }

    /// Replace the retry policy
    pub fn with_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Publish events on an existing channel
    pub fn with_events(mut self, event_tx: broadcast::Sender<TransferEvent>) -> Self {
        self.event_tx = event_tx;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancelled = token;
        self
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Token that stops the task before its next request or during a backoff pause
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.cancel();
        info!("Transfer cancellation requested");
    }

    /// Drive the transfer of `url` to completion and return the payload
    pub async fn run<S: ProgressStore>(
        &self,
        url: &str,
        headers: &HeaderMap,
        store: &S,
    ) -> Result<Bytes, TransferError> {
        url::Url::parse(url).map_err(|_| TransferError::InvalidUrl(url.to_string()))?;

        let started = Instant::now();
        let max_duration = self.settings.max_duration_secs.map(Duration::from_secs);
        let mut streak = FailureStreak::default();
        let mut last_error: Option<TransferError> = None;

        loop {
            if self.cancelled.is_cancelled() {
                info!("Transfer of {} cancelled, progress kept in store", url);
                return Err(TransferError::Cancelled);
            }
            if max_duration.is_some_and(|limit| started.elapsed() >= limit) {
                warn!("Transfer of {} exceeded its time budget", url);
                return Err(TransferError::Timeout);
            }

            let state = store.state().await?;
            debug!("Transfer of {} in state {}", url, state);

            let outcome = match state {
                TransferState::Start => self.action_start(url, headers, store).await,
                TransferState::InProgress => self.action_progress(url, headers, store).await,
                TransferState::Complete => return self.action_complete(store).await,
                TransferState::Failed => {
                    self.action_failed(store, &streak, &mut last_error).await
                }
            };

            let next = match outcome {
                Ok(next) => {
                    if state != TransferState::Failed {
                        streak.reset();
                        last_error = None;
                    }
                    next
                }
                Err(e) if !e.is_retryable() => {
                    if !matches!(
                        e,
                        TransferError::Cancelled | TransferError::RetriesExhausted { .. }
                    ) {
                        error!("Transfer of {} stopped in state {}: {}", url, state, e);
                    }
                    return Err(e);
                }
                Err(e) => {
                    let kind = e.kind();
                    warn!("Transfer of {} failed in state {} ({:?}): {}", url, state, kind, e);
                    streak.record(kind);
                    last_error = Some(e);
                    TransferState::Failed
                }
            };

            if next == TransferState::Start && state != TransferState::Failed {
                info!("Resource {} changed during transfer, starting over", url);
                let _ = self.event_tx.send(TransferEvent::Restarted {
                    reason: "resource changed on the server".to_string(),
                });
            }

            if next != state {
                info!("Transfer of {}: {} -> {}", url, state, next);
                let _ = self.event_tx.send(TransferEvent::StateChanged {
                    from: state,
                    to: next,
                });
            }

            if next == TransferState::Complete {
                return self.action_complete(store).await;
            }

            store.set_state(next).await?;
        }
    }

    /// Begin from byte zero with a small first window
    async fn action_start<S: ProgressStore>(
        &self,
        url: &str,
        headers: &HeaderMap,
        store: &S,
    ) -> Result<TransferState, TransferError> {
        debug!("Starting transfer of {}", url);
        store.clear().await?;

        let first = ByteRange::window(0, self.settings.initial_window);
        RangeRequestExecutor::new(&self.transport, &self.event_tx)
            .execute(url, headers, first, store)
            .await
    }

    /// Request the window following the last confirmed range
    async fn action_progress<S: ProgressStore>(
        &self,
        url: &str,
        headers: &HeaderMap,
        store: &S,
    ) -> Result<TransferState, TransferError> {
        let Some(last) = store.last_range().await? else {
            warn!("Transfer of {} is in progress but has no confirmed range", url);
            return Err(TransferError::MissingRange);
        };

        let next = ByteRange::window(last.next_start(), self.settings.step_window);
        RangeRequestExecutor::new(&self.transport, &self.event_tx)
            .execute(url, headers, next, store)
            .await
    }

    async fn action_complete<S: ProgressStore>(&self, store: &S) -> Result<Bytes, TransferError> {
        let payload = store.assemble().await?;
        info!("Transfer complete ({} bytes)", payload.len());
        let _ = self.event_tx.send(TransferEvent::Completed {
            bytes: payload.len() as u64,
        });
        Ok(payload)
    }

    /// Pause according to the policy, then resume from the last confirmed range
    async fn action_failed<S: ProgressStore>(
        &self,
        store: &S,
        streak: &FailureStreak,
        last_error: &mut Option<TransferError>,
    ) -> Result<TransferState, TransferError> {
        let delay = match self.policy.decide(streak) {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::GiveUp => {
                let source = last_error.take().unwrap_or_else(|| {
                    TransferError::Store("failure without a recorded cause".into())
                });
                error!("Giving up after {} consecutive failures: {}", streak.attempts, source);
                let _ = self.event_tx.send(TransferEvent::GaveUp {
                    attempts: streak.attempts,
                    error: source.to_string(),
                });
                return Err(TransferError::RetriesExhausted {
                    attempts: streak.attempts,
                    source: Box::new(source),
                });
            }
        };

        let kind = streak.last_kind.unwrap_or(ErrorKind::Transient);
        info!(
            "Retrying in {:?} (attempt {}, {:?})",
            delay,
            streak.attempts.max(1),
            kind
        );
        let _ = self.event_tx.send(TransferEvent::RetryScheduled {
            attempt: streak.attempts.max(1),
            delay_ms: delay.as_millis() as u64,
            kind,
            error: last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancelled.cancelled() => return Err(TransferError::Cancelled),
        }

        // Nothing confirmed yet means there is nothing to resume from
        if kind == ErrorKind::RestartRequired || store.last_range().await?.is_none() {
            let _ = self.event_tx.send(TransferEvent::Restarted {
                reason: "no confirmed range to resume from".to_string(),
            });
            return Ok(TransferState::Start);
        }
        Ok(TransferState::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backoff::FixedBackoff;
    use crate::engine::testing::{full, status, window_of, ScriptedTransport};
    use crate::storage::{MemoryStore, StoreKey, StoreValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const URL: &str = "http://resource.test/file";

    fn resource(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn task(transport: ScriptedTransport) -> TransferTask<ScriptedTransport> {
        let settings = TransferSettings {
            initial_window: 1000,
            step_window: 1000,
            ..TransferSettings::default()
        };
        TransferTask::new(transport, settings)
            .with_policy(Arc::new(FixedBackoff::new(Duration::from_millis(1))))
    }

    #[tokio::test]
    async fn test_single_response_completes_in_one_round_trip() {
        let data = resource(5000, 1);
        let task = task(ScriptedTransport::new(vec![Ok(full(&data))]));
        let store = MemoryStore::new();

        let payload = task.run(URL, &HeaderMap::new(), &store).await.unwrap();

        assert_eq!(payload.as_ref(), data.as_slice());
        assert_eq!(task.transport.requested_ranges(), vec!["bytes=0-999"]);
    }

    #[tokio::test]
    async fn test_chunks_are_contiguous_and_ordered() {
        let data = resource(2500, 2);
        let task = task(ScriptedTransport::new(vec![
            Ok(window_of(&data, 0, 1000, "\"v1\"")),
            Ok(window_of(&data, 1000, 1000, "\"v1\"")),
            Ok(window_of(&data, 2000, 1000, "\"v1\"")),
        ]));
        let store = MemoryStore::new();

        let payload = task.run(URL, &HeaderMap::new(), &store).await.unwrap();

        assert_eq!(payload.as_ref(), data.as_slice());
        assert_eq!(
            task.transport.requested_ranges(),
            vec!["bytes=0-999", "bytes=1000-1999", "bytes=2000-2999"]
        );
        assert_eq!(store.chunk_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_resumes_from_last_range() {
        let data = resource(2500, 3);
        let task = task(ScriptedTransport::new(vec![
            Ok(window_of(&data, 0, 1000, "\"v1\"")),
            Ok(status(503)),
            Ok(window_of(&data, 1000, 1000, "\"v1\"")),
            Ok(window_of(&data, 2000, 1000, "\"v1\"")),
        ]));
        let store = MemoryStore::new();

        let payload = task.run(URL, &HeaderMap::new(), &store).await.unwrap();

        assert_eq!(payload.as_ref(), data.as_slice());
        assert_eq!(
            task.transport.requested_ranges(),
            vec!["bytes=0-999", "bytes=1000-1999", "bytes=1000-1999", "bytes=2000-2999"]
        );
    }

    #[tokio::test]
    async fn test_identity_change_discards_old_bytes() {
        let old = resource(2500, 4);
        let new = resource(2500, 99);
        let task = task(ScriptedTransport::new(vec![
            Ok(window_of(&old, 0, 1000, "\"old\"")),
            Ok(window_of(&new, 1000, 1000, "\"new\"")),
            Ok(window_of(&new, 0, 1000, "\"new\"")),
            Ok(window_of(&new, 1000, 1000, "\"new\"")),
            Ok(window_of(&new, 2000, 1000, "\"new\"")),
        ]));
        let store = MemoryStore::new();
        let mut events = task.subscribe();

        let payload = task.run(URL, &HeaderMap::new(), &store).await.unwrap();

        assert_eq!(payload.as_ref(), new.as_slice());
        assert_eq!(store.chunk_count(), 3);

        let mut restarted = false;
        while let Ok(event) = events.try_recv() {
            restarted |= matches!(event, TransferEvent::Restarted { .. });
        }
        assert!(restarted);
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_range() {
        let data = resource(2500, 5);
        let store = MemoryStore::new();
        store.set_state(TransferState::InProgress).await.unwrap();
        store
            .set(StoreKey::Range, StoreValue::Range(ByteRange { start: 0, end: 999 }))
            .await
            .unwrap();
        store
            .set(StoreKey::Identity, StoreValue::Identity("\"v1\"".into()))
            .await
            .unwrap();
        store.set(StoreKey::Size, StoreValue::Size(2500)).await.unwrap();
        store.append(Bytes::copy_from_slice(&data[..1000])).await.unwrap();

        let task = task(ScriptedTransport::new(vec![
            Ok(window_of(&data, 1000, 1000, "\"v1\"")),
            Ok(window_of(&data, 2000, 1000, "\"v1\"")),
        ]));

        let payload = task.run(URL, &HeaderMap::new(), &store).await.unwrap();

        assert_eq!(payload.as_ref(), data.as_slice());
        assert_eq!(
            task.transport.requested_ranges(),
            vec!["bytes=1000-1999", "bytes=2000-2999"]
        );
    }

    #[tokio::test]
    async fn test_repeated_fatal_responses_give_up() {
        let settings = TransferSettings {
            retry: resumable_types::RetrySettings {
                base_delay_ms: 1,
                jitter: 0.0,
                max_fatal_retries: 3,
                ..Default::default()
            },
            ..TransferSettings::default()
        };
        let transport = ScriptedTransport::new((0..4).map(|_| Ok(status(416))).collect());
        let task = TransferTask::new(transport, settings);
        let store = MemoryStore::new();

        let err = task.run(URL, &HeaderMap::new(), &store).await.unwrap_err();

        match err {
            TransferError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, TransferError::RangeNotSatisfiable(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(task.transport.remaining(), 0);
    }

    #[tokio::test]
    async fn test_missing_range_restarts_transfer() {
        let data = resource(800, 6);
        let store = MemoryStore::new();
        store.set_state(TransferState::InProgress).await.unwrap();
        let task = task(ScriptedTransport::new(vec![Ok(full(&data))]));

        let payload = task.run(URL, &HeaderMap::new(), &store).await.unwrap();

        assert_eq!(payload.as_ref(), data.as_slice());
        assert_eq!(task.transport.requested_ranges(), vec!["bytes=0-999"]);
    }

    #[tokio::test]
    async fn test_cancelled_task_keeps_store() {
        let store = MemoryStore::new();
        store.set_state(TransferState::InProgress).await.unwrap();
        let task = task(ScriptedTransport::new(Vec::new()));
        task.cancel();

        let result = task.run(URL, &HeaderMap::new(), &store).await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(store.state().await.unwrap(), TransferState::InProgress);
        assert!(task.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_time_budget_is_enforced() {
        let settings = TransferSettings {
            max_duration_secs: Some(0),
            ..TransferSettings::default()
        };
        let task = TransferTask::new(ScriptedTransport::new(Vec::new()), settings);

        let result = task.run(URL, &HeaderMap::new(), &MemoryStore::new()).await;

        assert!(matches!(result, Err(TransferError::Timeout)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let task = task(ScriptedTransport::new(Vec::new()));
        let result = task.run("not a url", &HeaderMap::new(), &MemoryStore::new()).await;
        assert!(matches!(result, Err(TransferError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_events_report_progress_and_completion() {
        let data = resource(1500, 7);
        let task = task(ScriptedTransport::new(vec![
            Ok(window_of(&data, 0, 1000, "\"v1\"")),
            Ok(window_of(&data, 1000, 1000, "\"v1\"")),
        ]));
        let mut events = task.subscribe();

        task.run(URL, &HeaderMap::new(), &MemoryStore::new()).await.unwrap();

        let mut received = 0;
        let mut completed = None;
        while let Ok(event) = events.try_recv() {
            match event {
                TransferEvent::ChunkReceived { bytes, .. } => received += bytes,
                TransferEvent::Completed { bytes } => completed = Some(bytes),
                _ => {}
            }
        }
        assert_eq!(received, 1500);
        assert_eq!(completed, Some(1500));
    }

    #[tokio::test]
    async fn test_unretryable_error_ends_run_at_once() {
        let task = task(ScriptedTransport::new(vec![Err(TransferError::InvalidHeader(
            "bytes=oops".into(),
        ))]));

        let result = task.run(URL, &HeaderMap::new(), &MemoryStore::new()).await;

        assert!(matches!(result, Err(TransferError::InvalidHeader(_))));
        assert_eq!(task.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_append_refetches_window() {
        let data = resource(2500, 8);
        let task = task(ScriptedTransport::new(vec![
            Ok(window_of(&data, 0, 1000, "\"v1\"")),
            Ok(window_of(&data, 1000, 1000, "\"v1\"")),
            Ok(window_of(&data, 1000, 1000, "\"v1\"")),
            Ok(window_of(&data, 2000, 1000, "\"v1\"")),
        ]));
        let store = FlakyAppendStore::failing_on(2);

        let payload = task.run(URL, &HeaderMap::new(), &store).await.unwrap();

        assert_eq!(payload.as_ref(), data.as_slice());
        assert_eq!(
            task.transport.requested_ranges(),
            vec!["bytes=0-999", "bytes=1000-1999", "bytes=1000-1999", "bytes=2000-2999"]
        );
    }

    /// Memory store whose n-th append fails, using the provided window commit
    struct FlakyAppendStore {
        inner: MemoryStore,
        appends: AtomicUsize,
        fail_on: usize,
    }

    impl FlakyAppendStore {
        fn failing_on(fail_on: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                appends: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    impl ProgressStore for FlakyAppendStore {
        async fn get(&self, key: StoreKey) -> Result<Option<StoreValue>, TransferError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: StoreKey, value: StoreValue) -> Result<(), TransferError> {
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: StoreKey) -> Result<(), TransferError> {
            self.inner.remove(key).await
        }

        async fn clear(&self) -> Result<(), TransferError> {
            self.inner.clear().await
        }

        async fn append(&self, chunk: Bytes) -> Result<(), TransferError> {
            if self.appends.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(TransferError::Store("disk full".into()));
            }
            self.inner.append(chunk).await
        }

        async fn assemble(&self) -> Result<Bytes, TransferError> {
            self.inner.assemble().await
        }
    }
}
