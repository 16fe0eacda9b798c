//! A transport that records every stream op, for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tonic::Status;

use super::{
    ClientTransport, OpCompletion, OpPart, StreamId, StreamOp, StreamOpResults, Transport,
};

#[derive(Debug, Clone)]
pub(crate) struct RecordedOp {
    pub stream: StreamId,
    pub op: StreamOp,
}

#[derive(Default)]
struct Recorded {
    ops: Vec<RecordedOp>,
    completions: Vec<Option<OpCompletion>>,
}

pub(crate) struct RecordingTransport {
    coalescing: bool,
    // Complete send parts as soon as they arrive.
    auto_complete_sends: bool,
    recorded: Mutex<Recorded>,
    notify: Notify,
    next_stream: AtomicU64,
}

impl RecordingTransport {
    fn build(coalescing: bool, auto_complete_sends: bool) -> Arc<Self> {
        Arc::new(Self {
            coalescing,
            auto_complete_sends,
            recorded: Mutex::new(Recorded::default()),
            notify: Notify::new(),
            next_stream: AtomicU64::new(1),
        })
    }

    pub(crate) fn new() -> Arc<Self> {
        Self::build(true, true)
    }

    pub(crate) fn without_coalescing() -> Arc<Self> {
        Self::build(false, true)
    }

    /// Every op stays pending until completed by the test.
    pub(crate) fn manual() -> Arc<Self> {
        Self::build(true, false)
    }

    pub(crate) fn ops(&self) -> Vec<RecordedOp> {
        self.recorded.lock().ops.clone()
    }

    /// Complete every pending part of the op at `index`. Panics if nothing
    /// is left to complete.
    pub(crate) fn complete(&self, index: usize, result: Result<StreamOpResults, Status>) {
        let mut completion = self.take_completion(index);
        assert!(completion.is_pending(), "op already completed");
        completion.complete_remaining(result);
    }

    /// Hand the completion of the op at `index` to the test.
    pub(crate) fn take_completion(&self, index: usize) -> OpCompletion {
        self.recorded.lock().completions[index]
            .take()
            .expect("completion already taken")
    }

    /// Index of the first op matching `pred` that is still waiting for completion.
    pub(crate) async fn pending(&self, pred: impl Fn(&StreamOp) -> bool) -> usize {
        loop {
            let notified = self.notify.notified();
            {
                let recorded = self.recorded.lock();
                let found = recorded
                    .ops
                    .iter()
                    .zip(&recorded.completions)
                    .position(|(r, c)| {
                        c.as_ref().is_some_and(OpCompletion::is_pending) && pred(&r.op)
                    });
                if let Some(index) = found {
                    return index;
                }
            }
            notified.await;
        }
    }

    /// The first op matching `pred`, once one has been performed.
    pub(crate) async fn wait_for_op(&self, pred: impl Fn(&StreamOp) -> bool) -> RecordedOp {
        loop {
            let notified = self.notify.notified();
            let found = self.recorded.lock().ops.iter().find(|r| pred(&r.op)).cloned();
            if let Some(found) = found {
                return found;
            }
            notified.await;
        }
    }

    pub(crate) async fn wait_for_ops(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.recorded.lock().ops.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Transport for RecordingTransport {
    fn perform_stream_op(&self, stream: StreamId, op: StreamOp, mut on_complete: OpCompletion) {
        let trailing_metadata_sent = op.send_trailing_metadata.is_some();
        {
            let mut recorded = self.recorded.lock();
            recorded.ops.push(RecordedOp { stream, op });
            if self.auto_complete_sends {
                on_complete.complete_part(
                    OpPart::Sends,
                    Ok(StreamOpResults {
                        trailing_metadata_sent,
                        ..Default::default()
                    }),
                );
            }
            recorded.completions.push(Some(on_complete));
        }
        self.notify.notify_waiters();
    }

    fn supports_coalescing(&self) -> bool {
        self.coalescing
    }

    fn peer(&self) -> String {
        "recording".to_string()
    }
}

impl ClientTransport for RecordingTransport {
    fn open_stream(&self) -> Result<StreamId, Status> {
        Ok(StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed)))
    }
}
