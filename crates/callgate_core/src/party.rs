use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::Poll;

use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::sync::mpsc;

type PollEndHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PollEnd {
    hooks: Mutex<Vec<PollEndHook>>,
    waker: AtomicWaker,
}

impl PollEnd {
    fn run(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            hook();
        }
    }
}

/// A per-call cooperative executor.
///
/// Steps spawned on a party are polled by one tokio task, so no two steps of
/// the same call ever run at the same time. Steps interleave only at their
/// await points. One poll of the party polls every ready step, then runs the
/// hooks registered with [`at_poll_end`](Self::at_poll_end). The party stops
/// once every handle is dropped and every spawned step has finished.
pub struct Party {
    name: String,
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    poll_end: Arc<PollEnd>,
}

impl Party {
    /// Create a party and start its scheduling task. Must be called from
    /// within a tokio runtime.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();

        let poll_end = Arc::new(PollEnd::default());

        let task_name = name.clone();
        let hooks = Arc::clone(&poll_end);
        tokio::spawn(async move {
            let mut steps = FuturesUnordered::new();
            let mut open = true;
            future::poll_fn(|cx| {
                hooks.waker.register(cx.waker());
                while open {
                    match rx.poll_recv(cx) {
                        Poll::Ready(Some(step)) => steps.push(step),
                        Poll::Ready(None) => open = false,
                        Poll::Pending => break,
                    }
                }
                while let Poll::Ready(Some(())) = steps.poll_next_unpin(cx) {}
                hooks.run();
                if open || !steps.is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            })
            .await;
            tracing::trace!(party = %task_name, "Party finished");
        });

        Arc::new(Self { name, tx, poll_end })
    }

    /// Spawn a step. Steps spawned after the scheduling task has stopped are
    /// dropped without running.
    pub fn spawn<F>(&self, step_name: &'static str, step: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(step)).is_err() {
            tracing::debug!(party = %self.name, step = step_name, "Party closed, step dropped");
        }
    }

    /// Run `hook` once the current poll of the party has polled every ready
    /// step. Wakes the party if called from outside it.
    pub(crate) fn at_poll_end(&self, hook: impl FnOnce() + Send + 'static) {
        self.poll_end.hooks.lock().push(Box::new(hook));
        self.poll_end.waker.wake();
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Party").field("name", &self.name).finish()
    }
}
