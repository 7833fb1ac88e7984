use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use turnstile_protocol::models::AssistantMessage;
use turnstile_protocol::protocol::CompactionResult;
use turnstile_protocol::protocol::EventMsg;
use turnstile_protocol::protocol::OperationKind;
use turnstile_protocol::protocol::OperationOutput;
use turnstile_protocol::protocol::SessionStatus;

use crate::config::SessionConfig;
use crate::conversation_history::HistoryEntry;
use crate::coordinator::Coordinator;
use crate::coordinator::Submission;
use crate::error::OperationError;
use crate::error::TurnError;
use crate::operations::OperationExecutor;
use crate::state::Turn;
use crate::transport::ModelTransport;

/// Handle to one conversation. Cloning is cheap and every clone talks to the
/// same coordinator task; the task shuts down once the last clone is dropped
/// or [`Session::dispose`] is called.
#[derive(Clone)]
pub struct Session {
    tx_sub: async_channel::Sender<Submission>,
    status_rx: watch::Receiver<SessionStatus>,
    tx_event: broadcast::Sender<EventMsg>,
}

/// A prompt that has been accepted by the session and is waiting for its
/// turn to settle.
#[derive(Debug)]
pub struct PendingTurn {
    rx: oneshot::Receiver<Result<AssistantMessage, TurnError>>,
}

impl PendingTurn {
    pub async fn wait(self) -> Result<AssistantMessage, TurnError> {
        self.rx.await.unwrap_or(Err(TurnError::Disposed))
    }
}

/// An operation request that has been handed to the session.
#[derive(Debug)]
pub struct PendingOperation {
    rx: oneshot::Receiver<Result<OperationOutput, OperationError>>,
}

impl PendingOperation {
    pub async fn wait(self) -> Result<OperationOutput, OperationError> {
        self.rx.await.unwrap_or(Err(OperationError::Disposed))
    }
}

impl Session {
    /// Spawns the coordinator task on the current tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        transport: Arc<dyn ModelTransport>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        let (tx_sub, rx_sub) = async_channel::unbounded();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (tx_event, _) = broadcast::channel(config.event_buffer());

        let coordinator = Coordinator::new(
            config,
            transport,
            executor,
            rx_sub,
            status_tx,
            tx_event.clone(),
        );
        tokio::spawn(coordinator.run());

        Self {
            tx_sub,
            status_rx,
            tx_event,
        }
    }

    /// Hands `input` to the session without waiting for the turn. Once this
    /// returns, later requests on this handle are ordered after the prompt.
    pub async fn submit_prompt(&self, input: impl Into<String>) -> Result<PendingTurn, TurnError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Submission::Prompt {
            input: input.into(),
            reply,
        })
        .await
        .map_err(|_| TurnError::Disposed)?;
        Ok(PendingTurn { rx })
    }

    /// Runs one turn and resolves once it settles. Fails with
    /// [`TurnError::AlreadyStreaming`] if another turn is in flight.
    pub async fn prompt(&self, input: impl Into<String>) -> Result<AssistantMessage, TurnError> {
        self.submit_prompt(input).await?.wait().await
    }

    pub async fn submit_operation(
        &self,
        kind: OperationKind,
    ) -> Result<PendingOperation, OperationError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Submission::RequestOperation { kind, reply })
            .await
            .map_err(|_| OperationError::Disposed)?;
        Ok(PendingOperation { rx })
    }

    /// Runs `kind` now if the session is idle, otherwise after the turn in
    /// flight settles and every earlier request has run.
    pub async fn request_operation(
        &self,
        kind: OperationKind,
    ) -> Result<OperationOutput, OperationError> {
        self.submit_operation(kind).await?.wait().await
    }

    pub async fn queue_compaction(
        &self,
        instructions: Option<String>,
    ) -> Result<CompactionResult, OperationError> {
        let OperationOutput::Compaction(result) = self
            .request_operation(OperationKind::Compact { instructions })
            .await?;
        Ok(result)
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.status_rx.borrow().is_streaming
    }

    pub fn status_receiver(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMsg> {
        self.tx_event.subscribe()
    }

    /// Snapshot of the transcript, or `None` once the session is gone.
    pub async fn history(&self) -> Option<Vec<HistoryEntry>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Submission::History { reply }).await.ok()?;
        rx.await.ok()
    }

    /// The turn currently in the slot, including a settled one.
    pub async fn last_turn(&self) -> Option<Turn> {
        let (reply, rx) = oneshot::channel();
        self.submit(Submission::LastTurn { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Cancels the turn in flight, if any. Queued operations still run
    /// afterwards.
    pub async fn abort(&self) {
        if self.submit(Submission::Abort).await.is_err() {
            debug!("abort on a disposed session");
        }
    }

    /// Aborts the turn in flight and rejects every queued operation with
    /// [`OperationError::Disposed`]. An operation that is already executing
    /// finishes first. Calling this more than once is harmless.
    pub async fn dispose(&self) {
        let (ack, rx) = oneshot::channel();
        if self.submit(Submission::Shutdown { ack }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn submit(&self, sub: Submission) -> Result<(), async_channel::SendError<Submission>> {
        self.tx_sub.send(sub).await
    }
}
