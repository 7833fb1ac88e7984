//! Adapter between a transport's asynchronous event producer and the
//! coordinator consuming it one event at a time.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use tokio::sync::mpsc;
use turnstile_protocol::models::AssistantMessage;
use turnstile_protocol::protocol::StreamErrorReason;
use turnstile_protocol::protocol::StreamEvent;

/// Payload of an `error` terminal event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub reason: StreamErrorReason,
    pub message: AssistantMessage,
}

/// One unit of progress observed by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    /// A non-terminal event (`start` or `delta`).
    Event(StreamEvent),
    /// The terminal event, already passed through [`extract_result`].
    Finished(Result<AssistantMessage, StreamFailure>),
    /// The producer went away without a terminal event.
    Ended,
}

pub fn is_terminal(event: &StreamEvent) -> bool {
    event.is_terminal()
}

/// Extracts the outcome carried by a terminal event; `None` for `start` and
/// `delta`.
pub fn extract_result(event: StreamEvent) -> Option<Result<AssistantMessage, StreamFailure>> {
    match event {
        StreamEvent::Done { message } => Some(Ok(message)),
        StreamEvent::Error { reason, error } => Some(Err(StreamFailure {
            reason,
            message: error,
        })),
        StreamEvent::Start { .. } | StreamEvent::Delta { .. } => None,
    }
}

/// Creates a bounded producer/consumer pair for one turn.
pub fn channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx_event, rx_event) = mpsc::channel(capacity.max(1));
    (
        EventSender { tx_event },
        EventStream {
            rx_event,
            finished: false,
        },
    )
}

/// Producer half handed to the transport.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx_event: mpsc::Sender<StreamEvent>,
}

/// Returned when the consumer has torn the stream down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event stream consumer is gone")]
pub struct StreamClosed;

impl EventSender {
    pub async fn send(&self, event: StreamEvent) -> Result<(), StreamClosed> {
        self.tx_event.send(event).await.map_err(|_| StreamClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx_event.is_closed()
    }

    /// Resolves once the consumer dropped the stream, e.g. after an abort.
    pub async fn closed(&self) {
        self.tx_event.closed().await;
    }
}

/// Consumer half read by the coordinator.
#[derive(Debug)]
pub struct EventStream {
    rx_event: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl EventStream {
    /// Waits for the next event. Once a terminal event has been returned the
    /// stream is exhausted and every later call yields [`StreamStep::Ended`].
    ///
    /// Cancel safe: dropping the future before it resolves loses no event.
    pub async fn next_step(&mut self) -> StreamStep {
        if self.finished {
            return StreamStep::Ended;
        }
        match self.rx_event.recv().await {
            Some(event) if is_terminal(&event) => {
                self.finish();
                match extract_result(event) {
                    Some(result) => StreamStep::Finished(result),
                    None => StreamStep::Ended,
                }
            }
            Some(event) => StreamStep::Event(event),
            None => {
                self.finished = true;
                StreamStep::Ended
            }
        }
    }

    /// Whether a terminal event (or the end of the producer) was observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        // Producers blocked on a full channel observe the closure instead of
        // delivering events nobody will read.
        self.rx_event.close();
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx_event.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if is_terminal(&event) {
                    self.finish();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
