//! Pairing of arriving calls with application requests.
//!
//! Each completion queue owns a FIFO of requested calls. Arrivals that find
//! every queue empty wait in one shared pending queue, guarded by the
//! matcher's call lock. Whichever side arrives second completes the pair.
//! Lock order is the pending lock first, then a per-queue request lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tonic::Status;

use crate::server::admission::AdmissionControl;
use crate::server::call_data::CallData;
use crate::server::requested_call::RequestedCall;

/// A requested call paired with an arrival, plus the index of the queue it
/// came from. Dropping it unconsumed fails the request with a cancellation.
#[derive(Debug)]
pub(crate) struct MatchResult {
    rc: RequestedCall,
    cq_idx: usize,
}

impl MatchResult {
    pub(crate) fn cq_idx(&self) -> usize {
        self.cq_idx
    }

    pub(crate) fn into_requested_call(self) -> RequestedCall {
        self.rc
    }
}

enum WaiterSlot {
    Waiting,
    Done(Result<MatchResult, Status>),
    Taken,
}

/// A promise-mode arrival parked in the pending queue.
pub(crate) struct ActivityWaiter {
    slot: Mutex<WaiterSlot>,
    notify: Notify,
}

impl ActivityWaiter {
    fn new() -> Self {
        Self {
            slot: Mutex::new(WaiterSlot::Waiting),
            notify: Notify::new(),
        }
    }

    /// Hand `result` to the waiter. Gives it back if the waiter was abandoned.
    fn resolve(&self, result: MatchResult) -> Result<(), MatchResult> {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, WaiterSlot::Waiting) {
                return Err(result);
            }
            *slot = WaiterSlot::Done(Ok(result));
        }
        self.notify.notify_one();
        Ok(())
    }

    fn reject(&self, status: Status) {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, WaiterSlot::Waiting) {
                return;
            }
            *slot = WaiterSlot::Done(Err(status));
        }
        self.notify.notify_one();
    }

    async fn wait(&self) -> Result<MatchResult, Status> {
        loop {
            let notified = self.notify.notified();
            {
                let mut slot = self.slot.lock();
                match std::mem::replace(&mut *slot, WaiterSlot::Taken) {
                    WaiterSlot::Done(value) => return value,
                    other => *slot = other,
                }
            }
            notified.await;
        }
    }

    /// Give up waiting. A match that raced in is dropped, failing its request.
    fn abandon(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), WaiterSlot::Taken);
        drop(previous);
    }
}

/// Abandons the waiter if the arrival stops waiting before it is resolved.
struct WaiterGuard(Arc<ActivityWaiter>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

enum PendingEntry {
    CallData {
        call: Arc<CallData>,
        created_at: Instant,
    },
    Waiter {
        waiter: Arc<ActivityWaiter>,
        created_at: Instant,
    },
}

impl PendingEntry {
    fn created_at(&self) -> Instant {
        match self {
            PendingEntry::CallData { created_at, .. } | PendingEntry::Waiter { created_at, .. } => {
                *created_at
            }
        }
    }

    /// Pair the entry with `rc`. Hands `rc` back if the entry can no longer take it.
    fn bind(self, rc: RequestedCall, cq_idx: usize) -> Result<(), RequestedCall> {
        match self {
            PendingEntry::CallData { call, .. } => {
                if call.maybe_activate() {
                    call.publish(rc);
                    Ok(())
                } else {
                    Err(rc)
                }
            }
            PendingEntry::Waiter { waiter, .. } => waiter
                .resolve(MatchResult { rc, cq_idx })
                .map_err(|result| result.rc),
        }
    }

    fn fail(self, status: Status) {
        match self {
            PendingEntry::CallData { call, .. } => call.kill_zombie(status),
            PendingEntry::Waiter { waiter, .. } => waiter.reject(status),
        }
    }
}

#[derive(Default)]
struct PendingQueue {
    entries: VecDeque<PendingEntry>,
    zombified: bool,
}

/// Request queues plus the pending-arrival queue for one method, or for the
/// unregistered-method fallback.
pub(crate) struct RequestMatcher {
    requests: Vec<Mutex<VecDeque<RequestedCall>>>,
    pending: Mutex<PendingQueue>,
    admission: AdmissionControl,
    max_pending_duration: Duration,
}

impl RequestMatcher {
    pub(crate) fn new(
        cq_count: usize,
        admission: AdmissionControl,
        max_pending_duration: Duration,
    ) -> Self {
        Self {
            requests: (0..cq_count).map(|_| Mutex::new(VecDeque::new())).collect(),
            pending: Mutex::new(PendingQueue::default()),
            admission,
            max_pending_duration,
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_requests(&self, cq_idx: usize) -> usize {
        self.requests[cq_idx].lock().len()
    }

    /// Returns true if the queue was empty before the push.
    fn push_request(&self, cq_idx: usize, rc: RequestedCall) -> bool {
        let mut queue = self.requests[cq_idx].lock();
        let was_empty = queue.is_empty();
        queue.push_back(rc);
        was_empty
    }

    fn pop_request(&self, cq_idx: usize) -> Option<RequestedCall> {
        self.requests[cq_idx].lock().pop_front()
    }

    /// Scan every queue once, starting at `start`.
    fn pop_any(&self, start: usize) -> Option<(RequestedCall, usize)> {
        let n = self.requests.len();
        (0..n)
            .map(|i| (start % n + i) % n)
            .find_map(|idx| self.pop_request(idx).map(|rc| (rc, idx)))
    }

    /// Remove entries older than the maximum pending duration.
    fn take_expired(&self, pending: &mut PendingQueue) -> Vec<PendingEntry> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(front) = pending.entries.front() {
            if now.duration_since(front.created_at()) <= self.max_pending_duration {
                break;
            }
            if let Some(entry) = pending.entries.pop_front() {
                expired.push(entry);
            }
        }
        expired
    }

    fn fail_expired(expired: Vec<PendingEntry>) {
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "Failing pending calls that waited too long");
        }
        for entry in expired {
            entry.fail(Status::internal("Failed to match request within timeout"));
        }
    }

    /// Legacy mode: publish `call` to a queued request, or park it.
    pub(crate) fn match_or_queue(&self, start: usize, call: Arc<CallData>) {
        if let Some((rc, cq_idx)) = self.pop_any(start) {
            self.activate_and_publish(&call, rc, cq_idx);
            return;
        }

        let matched = {
            let mut pending = self.pending.lock();
            if pending.zombified {
                None
            } else if let Some(found) = self.pop_any(start) {
                Some(found)
            } else {
                call.set_pending();
                pending.entries.push_back(PendingEntry::CallData {
                    call: Arc::clone(&call),
                    created_at: Instant::now(),
                });
                return;
            }
        };
        match matched {
            Some((rc, cq_idx)) => self.activate_and_publish(&call, rc, cq_idx),
            None => call.kill_zombie(Status::unavailable("server is shutting down")),
        }
    }

    fn activate_and_publish(&self, call: &CallData, rc: RequestedCall, cq_idx: usize) {
        if call.maybe_activate() {
            call.publish(rc);
        } else {
            self.push_request(cq_idx, rc);
        }
    }

    /// Queue `rc` on `cq_idx`. If the queue was empty, drain pending arrivals
    /// against it until either side runs out.
    pub(crate) fn request_call_with_possible_publish(&self, cq_idx: usize, rc: RequestedCall) {
        if !self.push_request(cq_idx, rc) {
            return;
        }
        loop {
            let (rc, entry, expired) = {
                let mut pending = self.pending.lock();
                let expired = self.take_expired(&mut pending);
                let Some(entry) = pending.entries.pop_front() else {
                    drop(pending);
                    Self::fail_expired(expired);
                    return;
                };
                let Some(rc) = self.pop_request(cq_idx) else {
                    pending.entries.push_front(entry);
                    drop(pending);
                    Self::fail_expired(expired);
                    return;
                };
                (rc, entry, expired)
            };
            Self::fail_expired(expired);
            if let Err(rc) = entry.bind(rc, cq_idx) {
                tracing::debug!(tag = %rc.tag(), "Pending entry no longer waiting, requeueing request");
                self.push_request(cq_idx, rc);
            }
        }
    }

    /// Promise mode: resolve with a queued request, or wait for one.
    ///
    /// Admission control is applied before the arrival joins the pending
    /// queue. Dropping the returned future stops the wait.
    pub(crate) async fn match_request<R: Rng>(
        &self,
        start: usize,
        rng: &mut R,
    ) -> Result<MatchResult, Status> {
        if let Some((rc, cq_idx)) = self.pop_any(start) {
            return Ok(MatchResult { rc, cq_idx });
        }

        let waiter = {
            let mut pending = self.pending.lock();
            if pending.zombified {
                return Err(Status::unavailable("server is shutting down"));
            }
            if let Some((rc, cq_idx)) = self.pop_any(start) {
                return Ok(MatchResult { rc, cq_idx });
            }
            let depth = pending.entries.len();
            if self.admission.should_reject(depth, rng) {
                tracing::warn!(depth, "Rejecting call, too many pending requests");
                return Err(Status::resource_exhausted(
                    "Too many pending requests for this server",
                ));
            }
            let waiter = Arc::new(ActivityWaiter::new());
            pending.entries.push_back(PendingEntry::Waiter {
                waiter: Arc::clone(&waiter),
                created_at: Instant::now(),
            });
            waiter
        };

        let guard = WaiterGuard(waiter);
        guard.0.wait().await
    }

    /// Fail every queued request with `status`.
    pub(crate) fn kill_requests(&self, status: &Status) {
        for queue in &self.requests {
            let drained: Vec<_> = queue.lock().drain(..).collect();
            for rc in drained {
                rc.fail(status.clone());
            }
        }
    }

    /// Refuse new arrivals and fail every one still waiting.
    pub(crate) fn zombify_pending(&self) {
        let entries = {
            let mut pending = self.pending.lock();
            pending.zombified = true;
            std::mem::take(&mut pending.entries)
        };
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "Zombifying pending calls");
        }
        for entry in entries {
            entry.fail(Status::unavailable("server is shutting down"));
        }
    }
}

impl fmt::Debug for RequestMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMatcher")
            .field("cq_count", &self.requests.len())
            .field("pending", &self.pending_len())
            .finish()
    }
}
