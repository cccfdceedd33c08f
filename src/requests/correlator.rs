/// Request correlator: maps request ids to waiting callers
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{Result, TwsError};
use crate::events::RawBar;
use crate::types::RequestId;

/// First id handed out before the session reports its own floor
pub const INITIAL_REQUEST_ID: RequestId = 1000;

type ResultSink = oneshot::Sender<Result<Vec<RawBar>>>;

/// Outstanding request owned by the correlator until resolved
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub submitted_at: Instant,
    pub timeout: Duration,
    bars: Vec<RawBar>,
    sink: ResultSink,
}

/// Caller side of a pending request
#[derive(Debug)]
pub struct Waiter {
    request_id: RequestId,
    deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Result<Vec<RawBar>>>,
}

impl Waiter {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<RequestId, PendingRequest>,
    // Set by `fail_all`; new registrations are refused until `reopen`
    closed: Option<String>,
}

pub struct RequestCorrelator {
    pending: Mutex<PendingTable>,
    next_id: AtomicI64,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        RequestCorrelator {
            pending: Mutex::new(PendingTable::default()),
            next_id: AtomicI64::new(INITIAL_REQUEST_ID),
        }
    }

    /// Allocate a fresh id; never reused within a session
    pub fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Move the id counter up to the session's next valid id, never down
    pub fn raise_floor(&self, next_valid_id: RequestId) {
        let previous = self.next_id.fetch_max(next_valid_id, Ordering::SeqCst);
        if next_valid_id > previous {
            debug!("Request ids now start at {}", next_valid_id);
        }
    }

    /// Register a request; its timeout starts now
    pub async fn submit(&self, request_id: RequestId, timeout: Duration) -> Result<Waiter> {
        let mut pending = self.pending.lock().await;
        if let Some(reason) = &pending.closed {
            return Err(TwsError::SessionClosed(reason.clone()));
        }
        if pending.requests.contains_key(&request_id) {
            return Err(TwsError::Internal(format!(
                "request {} is already pending",
                request_id
            )));
        }

        let (sink, receiver) = oneshot::channel();
        let submitted_at = Instant::now();
        pending.requests.insert(
            request_id,
            PendingRequest {
                request_id,
                submitted_at,
                timeout,
                bars: Vec::new(),
                sink,
            },
        );

        debug!("Registered request {} (timeout {:?})", request_id, timeout);

        Ok(Waiter {
            request_id,
            deadline: submitted_at + timeout,
            timeout,
            receiver,
        })
    }

    /// Block until the request resolves or its deadline passes
    pub async fn wait(&self, waiter: Waiter) -> Result<Vec<RawBar>> {
        let Waiter {
            request_id,
            deadline,
            timeout,
            mut receiver,
        } = waiter;

        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TwsError::SessionClosed(format!(
                "request {} dropped without a result",
                request_id
            ))),
            Err(_) => {
                let removed = self.pending.lock().await.requests.remove(&request_id);
                if removed.is_some() {
                    warn!("⏱️  Request {} timed out after {:?}", request_id, timeout);
                    return Err(TwsError::RequestTimeout { request_id, timeout });
                }
                // Resolved between the deadline and taking the lock
                match receiver.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(TwsError::RequestTimeout { request_id, timeout }),
                }
            }
        }
    }

    /// Remove a request without resolving it, e.g. when sending failed
    pub async fn abandon(&self, request_id: RequestId) {
        if self.pending.lock().await.requests.remove(&request_id).is_some() {
            debug!("Abandoned request {}", request_id);
        }
    }

    pub async fn on_data(&self, request_id: RequestId, bar: RawBar) {
        let mut pending = self.pending.lock().await;
        match pending.requests.get_mut(&request_id) {
            Some(request) => request.bars.push(bar),
            None => warn!("Dropping bar for unknown request {}", request_id),
        }
    }

    pub async fn on_complete(&self, request_id: RequestId) {
        let request = self.pending.lock().await.requests.remove(&request_id);
        match request {
            Some(request) => {
                let elapsed = request.submitted_at.elapsed();
                debug!(
                    "Request {} complete: {} bars in {:?}",
                    request_id,
                    request.bars.len(),
                    elapsed
                );
                resolve(request.sink, request_id, Ok(request.bars));
            }
            None => warn!("Dropping completion for unknown request {}", request_id),
        }
    }

    pub async fn on_error(&self, request_id: RequestId, code: i32, message: &str) {
        let request = self.pending.lock().await.requests.remove(&request_id);
        match request {
            Some(request) => {
                error!("❌ Request {} failed: {} {}", request_id, code, message);
                resolve(
                    request.sink,
                    request_id,
                    Err(TwsError::Protocol {
                        code,
                        message: message.to_string(),
                    }),
                );
            }
            None => warn!(
                "Dropping error {} for unknown request {}: {}",
                code, request_id, message
            ),
        }
    }

    /// Resolve every pending request with `SessionClosed` and refuse new ones
    /// until [`reopen`](Self::reopen)
    pub async fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            pending.closed = Some(reason.to_string());
            pending.requests.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            resolve(
                request.sink,
                request.request_id,
                Err(TwsError::SessionClosed(reason.to_string())),
            );
        }

        if count > 0 {
            warn!("Failed {} pending requests: {}", count, reason);
        }
        count
    }

    /// Accept registrations again; called when a new session starts
    pub async fn reopen(&self) {
        if self.pending.lock().await.closed.take().is_some() {
            debug!("Correlator reopened");
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.requests.len()
    }
}

fn resolve(sink: ResultSink, request_id: RequestId, result: Result<Vec<RawBar>>) {
    if sink.send(result).is_err() {
        debug!("Caller for request {} is gone", request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn raw_bar(date: &str) -> RawBar {
        RawBar {
            date: date.to_string(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            wap: 1.2,
            count: 3,
        }
    }

    #[tokio::test]
    async fn test_data_then_complete() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_request_id();
        assert_eq!(id, INITIAL_REQUEST_ID);

        let waiter = correlator.submit(id, Duration::from_secs(5)).await.unwrap();
        correlator.on_data(id, raw_bar("1752154200")).await;
        correlator.on_data(id, raw_bar("1752154500")).await;
        correlator.on_complete(id).await;

        let bars = correlator.wait(waiter).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_resolves_only_its_request() {
        let correlator = RequestCorrelator::new();
        let a = correlator.submit(1, Duration::from_secs(5)).await.unwrap();
        let b = correlator.submit(2, Duration::from_secs(5)).await.unwrap();

        correlator.on_error(1, 162, "HMDS query returned no data").await;
        correlator.on_complete(2).await;

        match correlator.wait(a).await {
            Err(TwsError::Protocol { code, .. }) => assert_eq!(code, 162),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(correlator.wait(b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_then_late_callback_is_dropped() {
        let correlator = RequestCorrelator::new();
        let waiter = correlator.submit(7, Duration::from_millis(50)).await.unwrap();

        match correlator.wait(waiter).await {
            Err(TwsError::RequestTimeout { request_id, .. }) => assert_eq!(request_id, 7),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(correlator.pending_count().await, 0);

        // Late callbacks for a removed id are ignored
        correlator.on_data(7, raw_bar("1752154200")).await;
        correlator.on_complete(7).await;
        correlator.on_error(7, 200, "late").await;
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let correlator = RequestCorrelator::new();
        let _waiter = correlator.submit(5, Duration::from_secs(1)).await.unwrap();
        assert!(correlator.submit(5, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_all_resolves_every_waiter() {
        let correlator = Arc::new(RequestCorrelator::new());
        let first = correlator.submit(1, Duration::from_secs(30)).await.unwrap();
        let second = correlator.submit(2, Duration::from_secs(30)).await.unwrap();

        let c = Arc::clone(&correlator);
        let handle = tokio::spawn(async move { c.wait(first).await });

        assert_eq!(correlator.fail_all("disconnect requested").await, 2);
        assert!(matches!(handle.await.unwrap(), Err(TwsError::SessionClosed(_))));
        assert!(matches!(correlator.wait(second).await, Err(TwsError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_submit_after_fail_all_is_refused_until_reopen() {
        let correlator = RequestCorrelator::new();
        correlator.fail_all("disconnect requested").await;

        match correlator.submit(9, Duration::from_secs(30)).await {
            Err(TwsError::SessionClosed(reason)) => assert_eq!(reason, "disconnect requested"),
            other => panic!("expected session closed, got {:?}", other),
        }
        assert_eq!(correlator.pending_count().await, 0);

        correlator.reopen().await;
        let waiter = correlator.submit(9, Duration::from_secs(30)).await.unwrap();
        correlator.on_complete(9).await;
        assert!(correlator.wait(waiter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_raise_floor_never_lowers() {
        let correlator = RequestCorrelator::new();
        correlator.raise_floor(5000);
        assert_eq!(correlator.next_request_id(), 5000);
        correlator.raise_floor(10);
        assert_eq!(correlator.next_request_id(), 5001);
    }
}
