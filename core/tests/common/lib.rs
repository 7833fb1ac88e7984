//! Helpers shared by the `turnstile-core` integration tests: a transport the
//! test drives event by event, and an operation executor that records what it
//! was asked to do.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::timeout;
use turnstile_core::EventSender;
use turnstile_core::EventStream;
use turnstile_core::HistoryEntry;
use turnstile_core::ModelTransport;
use turnstile_core::OperationExecutor;
use turnstile_core::Prompt;
use turnstile_core::Session;
use turnstile_core::SessionConfig;
use turnstile_core::TransportError;
use turnstile_core::event_stream;
use turnstile_core::models::AssistantMessage;
use turnstile_core::models::ContentDelta;
use turnstile_core::protocol::CompactionResult;
use turnstile_core::protocol::EventMsg;
use turnstile_core::protocol::OperationKind;
use turnstile_core::protocol::OperationOutput;
use turnstile_core::protocol::SessionStatus;
use turnstile_core::protocol::StreamErrorReason;
use turnstile_core::protocol::StreamEvent;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn assistant_message(text: &str) -> AssistantMessage {
    AssistantMessage::empty("anthropic-messages", "anthropic", "mock").with_text(text)
}

pub fn compact(instructions: &str) -> OperationKind {
    OperationKind::Compact {
        instructions: Some(instructions.to_string()),
    }
}

/// A turn opened by [`ManualTransport`]. The test plays the backend by
/// pushing events through it; dropping it ends the stream without a
/// terminal event.
pub struct OpenedTurn {
    pub prompt: Prompt,
    pub events: EventSender,
}

impl OpenedTurn {
    pub async fn start(&self) {
        self.send(StreamEvent::Start {
            partial: assistant_message(""),
        })
        .await;
    }

    pub async fn delta(&self, text: &str) {
        self.send(StreamEvent::Delta {
            delta: ContentDelta::Text {
                text: text.to_string(),
            },
        })
        .await;
    }

    pub async fn done(&self, text: &str) -> AssistantMessage {
        let message = assistant_message(text);
        self.send(StreamEvent::Done {
            message: message.clone(),
        })
        .await;
        message
    }

    pub async fn error(&self, reason: StreamErrorReason, text: &str) {
        self.send(StreamEvent::Error {
            reason,
            error: assistant_message(text),
        })
        .await;
    }

    async fn send(&self, event: StreamEvent) {
        self.events
            .send(event)
            .await
            .expect("coordinator stopped reading the stream");
    }
}

/// Transport whose turns are driven by the test through [`OpenedTurn`].
pub struct ManualTransport {
    tx_turn: mpsc::UnboundedSender<OpenedTurn>,
    rx_turn: tokio::sync::Mutex<mpsc::UnboundedReceiver<OpenedTurn>>,
    connect_failure: Mutex<Option<TransportError>>,
    held_connect: Mutex<Option<oneshot::Receiver<Result<(), TransportError>>>>,
}

impl ManualTransport {
    pub fn new() -> Self {
        let (tx_turn, rx_turn) = mpsc::unbounded_channel();
        Self {
            tx_turn,
            rx_turn: tokio::sync::Mutex::new(rx_turn),
            connect_failure: Mutex::new(None),
            held_connect: Mutex::new(None),
        }
    }

    /// Makes the next `stream` call fail with `error` instead of opening a
    /// turn.
    pub fn fail_next_connect(&self, error: TransportError) {
        *self.connect_failure.lock().expect("lock") = Some(error);
    }

    /// Holds the next `stream` call in its connecting phase until the
    /// returned sender fires. Sending an error fails the connect with it;
    /// while the sender is alive the turn never gets a stream.
    pub fn hold_next_connect(&self) -> oneshot::Sender<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        *self.held_connect.lock().expect("lock") = Some(rx);
        tx
    }

    /// Waits for the coordinator to open the next turn.
    pub async fn next_turn(&self) -> OpenedTurn {
        let mut rx = self.rx_turn.lock().await;
        timeout(DEFAULT_TIMEOUT, rx.recv())
            .await
            .expect("timeout waiting for a turn to open")
            .expect("transport channel closed")
    }
}

impl Default for ManualTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelTransport for ManualTransport {
    async fn stream(&self, prompt: Prompt) -> Result<EventStream, TransportError> {
        if let Some(error) = self.connect_failure.lock().expect("lock").take() {
            return Err(error);
        }
        let held = self.held_connect.lock().expect("lock").take();
        if let Some(held) = held {
            if let Ok(Err(error)) = held.await {
                return Err(error);
            }
        }
        let (events, stream) = event_stream::channel(prompt.stream_channel_capacity);
        self.tx_turn
            .send(OpenedTurn { prompt, events })
            .map_err(|_| TransportError::Connect("test dropped the transport".to_string()))?;
        Ok(stream)
    }
}

/// One call observed by [`RecordingExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorCall {
    pub kind: OperationKind,
    pub history_len: usize,
    /// `is_streaming` as published by the session when the call started.
    pub streaming: Option<bool>,
}

/// Compaction executor that keeps the newest history entry and summarizes
/// the rest.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<ExecutorCall>>,
    failing: Mutex<HashSet<String>>,
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    status: Mutex<Option<watch::Receiver<SessionStatus>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the first call until the returned sender fires.
    pub fn gated() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let executor = Self {
            gate: tokio::sync::Mutex::new(Some(rx)),
            ..Self::default()
        };
        (executor, tx)
    }

    /// Compactions with these instructions fail.
    pub fn failing_on(self, instructions: &str) -> Self {
        self.failing
            .lock()
            .expect("lock")
            .insert(instructions.to_string());
        self
    }

    pub fn observe(&self, status: watch::Receiver<SessionStatus>) {
        *self.status.lock().expect("lock") = Some(status);
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn instructions(&self) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .map(|call| match call.kind {
                OperationKind::Compact { instructions } => instructions,
            })
            .collect()
    }
}

#[async_trait]
impl OperationExecutor for RecordingExecutor {
    async fn execute(
        &self,
        kind: &OperationKind,
        history: &[HistoryEntry],
    ) -> anyhow::Result<OperationOutput> {
        let streaming = self
            .status
            .lock()
            .expect("lock")
            .as_ref()
            .map(|rx| rx.borrow().is_streaming);
        self.calls.lock().expect("lock").push(ExecutorCall {
            kind: kind.clone(),
            history_len: history.len(),
            streaming,
        });

        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let OperationKind::Compact { instructions } = kind;
        if let Some(instructions) = instructions {
            if self.failing.lock().expect("lock").contains(instructions) {
                return Err(anyhow!("compaction failed for {instructions:?}"));
            }
        }

        Ok(OperationOutput::Compaction(CompactionResult {
            summary: format!("summary of {} entries", history.len().saturating_sub(1)),
            first_kept_entry_id: history
                .last()
                .map(|entry| entry.id.clone())
                .unwrap_or_default(),
            tokens_before: history.len() as u64 * 100,
        }))
    }
}

/// A session wired to a [`ManualTransport`] and a [`RecordingExecutor`].
pub struct TestSession {
    pub session: Session,
    pub transport: Arc<ManualTransport>,
    pub executor: Arc<RecordingExecutor>,
    pub events: broadcast::Receiver<EventMsg>,
}

pub struct TestSessionBuilder {
    config: SessionConfig,
    executor: RecordingExecutor,
}

pub fn test_session() -> TestSessionBuilder {
    TestSessionBuilder {
        config: SessionConfig::default(),
        executor: RecordingExecutor::new(),
    }
}

impl TestSessionBuilder {
    pub fn with_config(mut self, mutator: impl FnOnce(&mut SessionConfig)) -> Self {
        mutator(&mut self.config);
        self
    }

    pub fn with_executor(mut self, executor: RecordingExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn build(self) -> TestSession {
        let transport = Arc::new(ManualTransport::new());
        let executor = Arc::new(self.executor);
        let session = Session::spawn(self.config, transport.clone(), executor.clone());
        executor.observe(session.status_receiver());
        let events = session.subscribe();
        TestSession {
            session,
            transport,
            executor,
            events,
        }
    }
}

/// Waits until an event matching `predicate` arrives and returns it.
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<EventMsg>, predicate: F) -> EventMsg
where
    F: FnMut(&EventMsg) -> bool,
{
    wait_for_event_with_timeout(rx, predicate, DEFAULT_TIMEOUT).await
}

pub async fn wait_for_event_with_timeout<F>(
    rx: &mut broadcast::Receiver<EventMsg>,
    mut predicate: F,
    wait_time: Duration,
) -> EventMsg
where
    F: FnMut(&EventMsg) -> bool,
{
    loop {
        let event = timeout(wait_time, rx.recv())
            .await
            .expect("timeout waiting for event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// Everything already buffered on `rx`, without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<EventMsg>) -> Vec<EventMsg> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
