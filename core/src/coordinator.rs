//! The per-session actor that owns the turn slot and the operation queue.
//!
//! Every mutation of turn state, queue and history happens on the task
//! running [`Coordinator::run`]. Callers talk to it through [`Submission`]s
//! and get their outcomes back over oneshot channels.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use turnstile_protocol::TurnId;
use turnstile_protocol::models::AssistantMessage;
use turnstile_protocol::models::ContentDelta;
use turnstile_protocol::protocol::EventMsg;
use turnstile_protocol::protocol::OperationKind;
use turnstile_protocol::protocol::OperationOutput;
use turnstile_protocol::protocol::SessionStatus;
use turnstile_protocol::protocol::StreamEvent;

use crate::config::SessionConfig;
use crate::conversation_history::HistoryEntry;
use crate::conversation_history::HistoryItem;
use crate::error::OperationError;
use crate::error::TransportError;
use crate::error::TurnError;
use crate::event_stream::EventStream;
use crate::event_stream::StreamFailure;
use crate::event_stream::StreamStep;
use crate::operations::OperationExecutor;
use crate::queue::OperationReply;
use crate::queue::QueuedOperation;
use crate::state::SessionState;
use crate::state::Turn;
use crate::transport::ModelTransport;
use crate::transport::Prompt;

pub(crate) type TurnReply = oneshot::Sender<Result<AssistantMessage, TurnError>>;

/// Requests accepted by the coordinator task.
#[derive(Debug)]
pub(crate) enum Submission {
    Prompt {
        input: String,
        reply: TurnReply,
    },
    RequestOperation {
        kind: OperationKind,
        reply: OperationReply,
    },
    Abort,
    History {
        reply: oneshot::Sender<Vec<HistoryEntry>>,
    },
    LastTurn {
        reply: oneshot::Sender<Option<Turn>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

enum TurnPhase {
    /// Waiting for the transport to hand back its event stream.
    Connecting(BoxFuture<'static, Result<EventStream, TransportError>>),
    Streaming(EventStream),
}

/// What moved an in-flight turn forward.
#[derive(Debug)]
enum TurnProgress {
    Started(AssistantMessage),
    Delta(ContentDelta),
    Finished(Result<AssistantMessage, StreamFailure>),
    Ended,
    ConnectFailed(TransportError),
    IdleTimeout,
}

/// Runtime handles of the turn occupying the slot.
struct ActiveTurn {
    turn_id: TurnId,
    phase: TurnPhase,
    reply: TurnReply,
    cancellation: CancellationToken,
    idle_timeout: Duration,
    deadline: Instant,
}

impl ActiveTurn {
    /// Cancel safe: an interrupted call keeps the pending connect future and
    /// the idle deadline, so nothing is lost when `select!` picks another
    /// branch.
    async fn next_progress(&mut self) -> TurnProgress {
        loop {
            match &mut self.phase {
                TurnPhase::Connecting(connect) => {
                    match tokio::time::timeout_at(self.deadline, connect).await {
                        Ok(Ok(stream)) => {
                            self.phase = TurnPhase::Streaming(stream);
                            self.deadline = Instant::now() + self.idle_timeout;
                        }
                        Ok(Err(err)) => return TurnProgress::ConnectFailed(err),
                        Err(_) => return TurnProgress::IdleTimeout,
                    }
                }
                TurnPhase::Streaming(stream) => {
                    let step = match tokio::time::timeout_at(self.deadline, stream.next_step()).await
                    {
                        Ok(step) => step,
                        Err(_) => return TurnProgress::IdleTimeout,
                    };
                    self.deadline = Instant::now() + self.idle_timeout;
                    return match step {
                        StreamStep::Event(StreamEvent::Start { partial }) => {
                            TurnProgress::Started(partial)
                        }
                        StreamStep::Event(StreamEvent::Delta { delta }) => {
                            TurnProgress::Delta(delta)
                        }
                        StreamStep::Finished(result) => TurnProgress::Finished(result),
                        // Terminal events always arrive as `Finished`.
                        StreamStep::Event(_) | StreamStep::Ended => TurnProgress::Ended,
                    };
                }
            }
        }
    }
}

enum Next {
    Submission(Option<Submission>),
    Progress(TurnProgress),
}

pub(crate) struct Coordinator {
    state: SessionState,
    active: Option<ActiveTurn>,
    transport: Arc<dyn ModelTransport>,
    executor: Arc<dyn OperationExecutor>,
    config: SessionConfig,
    rx_sub: async_channel::Receiver<Submission>,
    status_tx: watch::Sender<SessionStatus>,
    tx_event: broadcast::Sender<EventMsg>,
}

impl Coordinator {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn ModelTransport>,
        executor: Arc<dyn OperationExecutor>,
        rx_sub: async_channel::Receiver<Submission>,
        status_tx: watch::Sender<SessionStatus>,
        tx_event: broadcast::Sender<EventMsg>,
    ) -> Self {
        Self {
            state: SessionState::new(),
            active: None,
            transport,
            executor,
            config,
            rx_sub,
            status_tx,
            tx_event,
        }
    }

    /// Runs until the session is disposed or every [`Submission`] sender is
    /// gone.
    pub(crate) async fn run(mut self) {
        loop {
            // Every settlement path falls through to here before the next
            // submission or stream event is looked at.
            self.drain_if_idle().await;
            if self.state.disposed {
                break;
            }

            let next = match self.active.as_mut() {
                Some(active) => {
                    tokio::select! {
                        sub = self.rx_sub.recv() => Next::Submission(sub.ok()),
                        progress = active.next_progress() => Next::Progress(progress),
                    }
                }
                None => Next::Submission(self.rx_sub.recv().await.ok()),
            };

            match next {
                Next::Submission(Some(sub)) => self.handle_submission(sub),
                Next::Submission(None) => {
                    debug!("all session handles dropped; disposing");
                    self.dispose();
                }
                Next::Progress(progress) => self.handle_progress(progress),
            }
        }
        self.reject_late_submissions();
        debug!("coordinator exited");
    }

    fn handle_submission(&mut self, sub: Submission) {
        match sub {
            Submission::Prompt { input, reply } => self.start_turn(input, reply),
            Submission::RequestOperation { kind, reply } => self.enqueue_operation(kind, reply),
            Submission::Abort => self.abort_turn(),
            Submission::History { reply } => {
                let _ = reply.send(self.state.history.contents());
            }
            Submission::LastTurn { reply } => {
                let _ = reply.send(self.state.turn.clone());
            }
            Submission::Shutdown { ack } => {
                self.dispose();
                let _ = ack.send(());
            }
        }
    }

    fn start_turn(&mut self, input: String, reply: TurnReply) {
        if self.active.is_some() || self.state.turn_in_flight() {
            debug!("rejecting prompt while a turn is in flight");
            let _ = reply.send(Err(TurnError::AlreadyStreaming));
            return;
        }

        let turn = Turn::new();
        let turn_id = turn.id();
        self.state.history.record(HistoryItem::User {
            text: input.clone(),
        });
        let cancellation = CancellationToken::new();
        let prompt = Prompt {
            turn_id,
            input,
            history: self.state.history.contents(),
            cancellation: cancellation.clone(),
            stream_channel_capacity: self.config.stream_channel_capacity(),
        };
        let transport = Arc::clone(&self.transport);
        let connect = async move { transport.stream(prompt).await }.boxed();
        let idle_timeout = self.config.stream_idle_timeout();

        self.state.turn = Some(turn);
        self.active = Some(ActiveTurn {
            turn_id,
            phase: TurnPhase::Connecting(connect),
            reply,
            cancellation,
            idle_timeout,
            deadline: Instant::now() + idle_timeout,
        });
        info!(%turn_id, "turn started");
        self.publish_status();
        self.emit(EventMsg::TurnStarted { turn_id });
    }

    fn handle_progress(&mut self, progress: TurnProgress) {
        let Some(turn_id) = self.active.as_ref().map(|active| active.turn_id) else {
            return;
        };
        match progress {
            TurnProgress::Started(partial) => {
                let Some(turn) = self.state.turn.as_mut() else {
                    return;
                };
                match turn.start(partial) {
                    Ok(()) => self.emit(EventMsg::MessageStarted { turn_id }),
                    Err(err) => warn!("ignoring start event: {err}"),
                }
            }
            TurnProgress::Delta(delta) => {
                let Some(turn) = self.state.turn.as_mut() else {
                    return;
                };
                match turn.apply_delta(&delta) {
                    Ok(()) => self.emit(EventMsg::MessageDelta { turn_id, delta }),
                    Err(err) => warn!("ignoring delta event: {err}"),
                }
            }
            TurnProgress::Finished(Ok(message)) => self.finish_turn(Ok(message)),
            TurnProgress::Finished(Err(StreamFailure { reason, message })) => {
                self.finish_turn(Err(TurnError::Transport(TransportError::Backend {
                    reason,
                    message: Box::new(message),
                })));
            }
            TurnProgress::Ended => {
                self.finish_turn(Err(TransportError::ImplicitStreamEnd.into()));
            }
            TurnProgress::ConnectFailed(err) => self.finish_turn(Err(err.into())),
            TurnProgress::IdleTimeout => {
                let timeout = self.config.stream_idle_timeout();
                self.finish_turn(Err(TransportError::IdleTimeout(timeout).into()));
            }
        }
    }

    fn abort_turn(&mut self) {
        match self.active.as_ref() {
            Some(active) => {
                info!(turn_id = %active.turn_id, "aborting turn");
                self.finish_turn(Err(TurnError::Aborted));
            }
            None => debug!("abort requested with no turn in flight"),
        }
    }

    /// The only place a turn leaves the slot. Whatever ended it, the reply is
    /// settled and the status published here, and the caller's loop drains the
    /// queue right after.
    fn finish_turn(&mut self, outcome: Result<AssistantMessage, TurnError>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveTurn {
            turn_id,
            phase,
            reply,
            cancellation,
            ..
        } = active;
        // Fires on every settlement, and dropping the phase closes the channel,
        // so a producer still running stops without waiting for its next send.
        cancellation.cancel();
        drop(phase);

        let status = match self.state.turn.as_mut() {
            Some(turn) => {
                let transition = match &outcome {
                    Ok(message) => turn.complete(message.clone()),
                    Err(TurnError::Transport(err)) => turn.fail(err.clone()),
                    Err(_) => turn.abort(),
                };
                if let Err(err) = transition {
                    warn!("turn settled twice: {err}");
                }
                turn.status()
            }
            None => {
                warn!(%turn_id, "active turn had no state slot");
                return;
            }
        };

        match &outcome {
            Ok(message) => {
                self.state
                    .history
                    .record(HistoryItem::Assistant(message.clone()));
            }
            Err(TurnError::Transport(TransportError::Backend { message, .. })) => {
                self.state
                    .history
                    .record(HistoryItem::Assistant(message.as_ref().clone()));
            }
            Err(_) => {}
        }

        match &outcome {
            Ok(_) => info!(%turn_id, "turn completed"),
            Err(err) => info!(%turn_id, %status, "turn ended: {err}"),
        }
        self.publish_status();
        self.emit(EventMsg::TurnEnded { turn_id, status });
        // The prompt caller may have stopped waiting.
        let _ = reply.send(outcome);
    }

    fn enqueue_operation(&mut self, kind: OperationKind, reply: OperationReply) {
        let seq = self.state.queue.enqueue(kind.clone(), reply);
        debug!(
            seq,
            %kind,
            deferred = self.state.turn_in_flight(),
            "operation queued"
        );
        self.emit(EventMsg::OperationQueued { seq, kind });
        self.publish_status();
    }

    /// Runs queued operations one at a time until the queue is empty or a turn
    /// occupies the slot again. Submissions that arrived while an operation
    /// was executing are handled between operations, so a prompt sent during
    /// a drain holds back the rest of the queue until its turn settles.
    async fn drain_if_idle(&mut self) {
        while !self.state.disposed && !self.state.turn_in_flight() {
            let Some(op) = self.state.queue.pop_front() else {
                break;
            };
            self.publish_status();
            self.run_operation(op).await;

            while let Ok(sub) = self.rx_sub.try_recv() {
                self.handle_submission(sub);
                if self.state.disposed {
                    return;
                }
            }
        }
    }

    async fn run_operation(&mut self, op: QueuedOperation) {
        let QueuedOperation { seq, kind, reply } = op;
        info!(seq, %kind, "running queued operation");
        self.emit(EventMsg::OperationStarted { seq });

        let history = self.state.history.contents();
        let result = match self.executor.execute(&kind, &history).await {
            Ok(output) => {
                self.apply_output(&output);
                Ok(output)
            }
            Err(err) => {
                warn!(seq, "queued operation failed: {err:#}");
                Err(OperationError::Failed(format!("{err:#}")))
            }
        };

        self.emit(EventMsg::OperationFinished {
            seq,
            success: result.is_ok(),
        });
        let _ = reply.send(result);
    }

    fn apply_output(&mut self, output: &OperationOutput) {
        let OperationOutput::Compaction(result) = output;
        if let Some(removed_entries) = self.state.history.apply_compaction(result) {
            self.emit(EventMsg::HistoryCompacted {
                removed_entries,
                tokens_before: result.tokens_before,
            });
        }
    }

    fn dispose(&mut self) {
        if self.state.disposed {
            return;
        }
        self.abort_turn();
        for seq in self.state.queue.reject_all(OperationError::Disposed) {
            debug!(seq, "rejecting queued operation on dispose");
            self.emit(EventMsg::OperationRejected { seq });
        }
        self.state.disposed = true;
        info!("session disposed");
        self.publish_status();
        self.emit(EventMsg::SessionDisposed);
    }

    /// Answers whatever is still buffered once the loop has stopped, so no
    /// caller waits on a reply that will never come.
    fn reject_late_submissions(&mut self) {
        self.rx_sub.close();
        while let Ok(sub) = self.rx_sub.try_recv() {
            match sub {
                Submission::Prompt { reply, .. } => {
                    let _ = reply.send(Err(TurnError::Disposed));
                }
                Submission::RequestOperation { reply, .. } => {
                    let _ = reply.send(Err(OperationError::Disposed));
                }
                Submission::Shutdown { ack } => {
                    let _ = ack.send(());
                }
                // Dropping the reply reports the session as gone.
                Submission::History { .. } | Submission::LastTurn { .. } | Submission::Abort => {}
            }
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.state.status());
    }

    fn emit(&self, msg: EventMsg) {
        // No subscribers is fine.
        let _ = self.tx_event.send(msg);
    }
}
