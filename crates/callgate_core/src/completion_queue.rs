use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tonic::Status;

/// Opaque application tag identifying one asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// A completed operation.
#[derive(Debug, Clone)]
pub struct Event {
    pub tag: Tag,
    pub result: Result<(), Status>,
}

impl Event {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    outstanding: usize,
    ready: VecDeque<Event>,
    shutdown: bool,
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// A notification queue on which tagged operations complete.
///
/// Every accepted tag is reserved with [`begin_op`](Self::begin_op) and
/// delivered exactly once with [`end_op`](Self::end_op). After
/// [`shutdown`](Self::shutdown) no new tags are accepted, and the queue
/// reports end-of-stream once every reserved tag has been delivered and read.
pub struct CompletionQueue {
    id: u64,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reserve a slot for `tag`. Returns false once the queue is shut down.
    pub fn begin_op(&self, tag: Tag) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            tracing::debug!(cq = self.id, %tag, "begin_op rejected, queue shut down");
            return false;
        }
        state.outstanding += 1;
        true
    }

    /// Deliver the completion of a previously reserved tag.
    pub fn end_op(&self, tag: Tag, result: Result<(), Status>) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.outstanding > 0, "end_op without begin_op for {tag}");
            state.outstanding = state.outstanding.saturating_sub(1);
            state.ready.push_back(Event { tag, result });
        }
        self.notify.notify_waiters();
    }

    /// Stop accepting new tags.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Number of tags reserved but not yet delivered.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Pop the next event without waiting.
    pub fn try_next(&self) -> Option<Event> {
        self.state.lock().ready.pop_front()
    }

    /// Wait for the next event. Returns `None` once the queue is shut down
    /// and fully drained.
    pub async fn next(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(event) = state.ready.pop_front() {
                    return Some(event);
                }
                if state.shutdown && state.outstanding == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// All events as a stream, ending when the queue is shut down and drained.
    pub fn events(self: &Arc<Self>) -> impl Stream<Item = Event> + Send + 'static {
        let queue = Arc::clone(self);
        async_stream::stream! {
            while let Some(event) = queue.next().await {
                yield event;
            }
        }
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionQueue")
            .field("id", &self.id)
            .field("outstanding", &state.outstanding)
            .field("ready", &state.ready.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}
