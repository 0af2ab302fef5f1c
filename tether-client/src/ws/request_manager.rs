//! Tracks multiplexed requests through their queued and in-flight phases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use tether_core::{ClientError, RequestMessage, Subscriber};

use crate::link::Envelope;

/// One multiplexed request from registration to removal.
///
/// The message is kept so a reconnect can replay it verbatim (same id); it
/// mutates only to absorb the latest seen event id of a subscription.
pub struct TrackedRequest {
    message: Mutex<RequestMessage>,
    pub subscriber: Subscriber<Envelope, ClientError>,
}

impl std::fmt::Debug for TrackedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("message", &self.message_snapshot())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TrackedRequest {
    pub fn new(message: RequestMessage, subscriber: Subscriber<Envelope, ClientError>) -> Self {
        TrackedRequest {
            message: Mutex::new(message),
            subscriber,
        }
    }

    pub fn id(&self) -> u64 {
        lock(&self.message).id
    }

    pub fn is_subscription(&self) -> bool {
        lock(&self.message).is_subscription()
    }

    pub fn message_snapshot(&self) -> RequestMessage {
        lock(&self.message).clone()
    }

    /// Records the newest subscription event id for resumption.
    pub fn set_last_event_id(&self, event_id: String) {
        let mut message = lock(&self.message);
        if let Some(params) = message.params.as_mut() {
            params.last_event_id = Some(event_id);
        }
    }
}

#[derive(Default)]
struct ManagerInner {
    /// Registered but not yet sent, in registration order.
    outgoing: Vec<u64>,
    /// Sent and awaiting responses.
    active: Vec<u64>,
    requests: HashMap<u64, Arc<TrackedRequest>>,
}

/// Outgoing/active bookkeeping for one client. All accessors snapshot under
/// the lock and iterate outside it, so observer callbacks may re-enter.
pub struct RequestManager {
    inner: Mutex<ManagerInner>,
    changed: Notify,
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("RequestManager")
            .field("outgoing", &inner.outgoing.len())
            .field("active", &inner.active.len())
            .finish()
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    pub fn new() -> Self {
        RequestManager {
            inner: Mutex::new(ManagerInner::default()),
            changed: Notify::new(),
        }
    }

    pub fn register(&self, request: Arc<TrackedRequest>) {
        let id = request.id();
        let mut inner = lock(&self.inner);
        inner.outgoing.push(id);
        inner.requests.insert(id, request);
    }

    /// Moves every queued request to the active set and returns them in
    /// registration order, ready to be sent as one frame.
    pub fn flush(&self) -> Vec<Arc<TrackedRequest>> {
        let mut inner = lock(&self.inner);
        let ids = std::mem::take(&mut inner.outgoing);
        inner.active.extend(ids.iter().copied());
        ids.iter()
            .filter_map(|id| inner.requests.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<Arc<TrackedRequest>> {
        lock(&self.inner).requests.get(&id).cloned()
    }

    /// Removes a request from all sets. The boolean reports whether it had
    /// already been sent.
    pub fn remove(&self, id: u64) -> Option<(Arc<TrackedRequest>, bool)> {
        let removed = {
            let mut inner = lock(&self.inner);
            let request = inner.requests.remove(&id)?;
            let was_active = inner.active.contains(&id);
            inner.outgoing.retain(|rid| *rid != id);
            inner.active.retain(|rid| *rid != id);
            Some((request, was_active))
        };
        self.changed.notify_waiters();
        removed
    }

    /// Drops every queued-but-unsent request.
    pub fn take_outgoing(&self) -> Vec<Arc<TrackedRequest>> {
        let taken = {
            let mut inner = lock(&self.inner);
            let ids = std::mem::take(&mut inner.outgoing);
            ids.iter()
                .filter_map(|id| inner.requests.remove(id))
                .collect()
        };
        self.changed.notify_waiters();
        taken
    }

    /// Snapshot of in-flight requests.
    pub fn active_requests(&self) -> Vec<Arc<TrackedRequest>> {
        let inner = lock(&self.inner);
        inner
            .active
            .iter()
            .filter_map(|id| inner.requests.get(id).cloned())
            .collect()
    }

    /// Snapshot of everything still tracked.
    pub fn all_requests(&self) -> Vec<Arc<TrackedRequest>> {
        let inner = lock(&self.inner);
        let mut out: Vec<_> = inner
            .outgoing
            .iter()
            .chain(inner.active.iter())
            .filter_map(|id| inner.requests.get(id).cloned())
            .collect();
        out.sort_by_key(|r| r.id());
        out
    }

    /// True with nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let inner = lock(&self.inner);
        inner.outgoing.is_empty() && inner.requests.is_empty()
    }

    fn has_pending_completions(&self) -> bool {
        lock(&self.inner)
            .requests
            .values()
            .any(|r| !r.is_subscription())
    }

    /// Blocks until every tracked query/mutation finished (graceful drain).
    pub async fn wait_for_completions(&self) {
        loop {
            let notified = self.changed.notified();
            if !self.has_pending_completions() {
                return;
            }
            notified.await;
        }
    }
}
