use std::collections::VecDeque;

use tokio::sync::oneshot;
use turnstile_protocol::protocol::OperationKind;
use turnstile_protocol::protocol::OperationOutput;

use crate::error::OperationError;

pub(crate) type OperationReply = oneshot::Sender<Result<OperationOutput, OperationError>>;

/// A maintenance request waiting for the turn slot to clear.
#[derive(Debug)]
pub(crate) struct QueuedOperation {
    pub(crate) seq: u64,
    pub(crate) kind: OperationKind,
    pub(crate) reply: OperationReply,
}

/// FIFO of deferred operations. Sequence numbers are handed out in enqueue
/// order and never reused within a session.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    pending: VecDeque<QueuedOperation>,
    next_seq: u64,
}

impl OperationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, kind: OperationKind, reply: OperationReply) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(QueuedOperation { seq, kind, reply });
        seq
    }

    pub(crate) fn pop_front(&mut self) -> Option<QueuedOperation> {
        self.pending.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Settles every waiting request with `error` and returns their sequence
    /// numbers in queue order.
    pub(crate) fn reject_all(&mut self, error: OperationError) -> Vec<u64> {
        self.pending
            .drain(..)
            .map(|op| {
                // The requester may have stopped waiting.
                let _ = op.reply.send(Err(error.clone()));
                op.seq
            })
            .collect()
    }
}
