//! Correlation of in-flight RCON requests with their responses.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

type Slot = oneshot::Sender<Result<String>>;

/// Map from request id to the caller waiting for it.
///
/// Every entry leaves the map exactly once: through [`complete`](Self::complete)
/// when the response arrives, through [`reject_all`](Self::reject_all) when the
/// connection goes away, or when the waiting [`PendingResponse`] times out or
/// is dropped. Whichever comes first wins; the others find nothing to do.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<i32, Slot>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `id` and get the handle its response will arrive on.
    ///
    /// A stale entry with the same id (possible only after the id counter
    /// wrapped) is rejected with [`Error::Protocol`].
    pub fn register(&self, id: i32) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self.lock().insert(id, tx) {
            let _ = stale.send(Err(Error::Protocol(format!(
                "Request id {} reused while still pending",
                id
            ))));
        }
        PendingResponse {
            id,
            rx,
            requests: self.clone(),
        }
    }

    /// Resolve `id`. Returns `false` if nothing was waiting for it.
    pub fn complete(&self, id: i32, result: Result<String>) -> bool {
        match self.lock().remove(&id) {
            Some(slot) => {
                // The caller may have given up already.
                let _ = slot.send(result);
                true
            }
            None => false,
        }
    }

    /// Reject every pending request with `error`, returning how many there were.
    pub fn reject_all(&self, error: Error) -> usize {
        let drained: Vec<(i32, Slot)> = self.lock().drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: i32) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn forget(&self, id: i32) -> bool {
        self.lock().remove(&id).is_some()
    }
}

/// Receiving end of one pending request.
///
/// Dropping it unregisters the request.
#[derive(Debug)]
pub struct PendingResponse {
    id: i32,
    rx: oneshot::Receiver<Result<String>>,
    requests: PendingRequests,
}

impl PendingResponse {
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Wait for the response, failing with [`Error::Timeout`] after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<String> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                if self.requests.forget(self.id) {
                    return Err(Error::Timeout(format!(
                        "No response to request {} within {:?}",
                        self.id, timeout
                    )));
                }
                // Completed between the deadline and the removal.
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(Error::Disconnected),
                }
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.requests.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_resolves_matching_request() {
        let pending = PendingRequests::new();
        let first = pending.register(1);
        let second = pending.register(2);

        assert!(pending.complete(2, Ok("two".to_string())));
        assert!(pending.complete(1, Ok("one".to_string())));

        assert_eq!(first.wait(Duration::from_secs(1)).await.unwrap(), "one");
        assert_eq!(second.wait(Duration::from_secs(1)).await.unwrap(), "two");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_second_completion_is_noop() {
        let pending = PendingRequests::new();
        let response = pending.register(5);

        assert!(pending.complete(5, Ok("first".to_string())));
        assert!(!pending.complete(5, Ok("second".to_string())));
        assert_eq!(response.wait(Duration::from_secs(1)).await.unwrap(), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let pending = PendingRequests::new();
        let response = pending.register(3);

        let result = response.wait(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(!pending.contains(3));
        assert!(!pending.complete(3, Ok("late".to_string())));
    }

    #[tokio::test]
    async fn test_reject_all_fails_every_waiter() {
        let pending = PendingRequests::new();
        let a = pending.register(1);
        let b = pending.register(2);

        assert_eq!(pending.reject_all(Error::Disconnected), 2);
        assert_eq!(a.wait(Duration::from_secs(1)).await, Err(Error::Disconnected));
        assert_eq!(b.wait(Duration::from_secs(1)).await, Err(Error::Disconnected));
        assert_eq!(pending.reject_all(Error::Disconnected), 0);
    }

    #[test]
    fn test_dropping_response_unregisters() {
        let pending = PendingRequests::new();
        let response = pending.register(9);
        assert!(pending.contains(9));
        drop(response);
        assert!(!pending.contains(9));
    }
}
