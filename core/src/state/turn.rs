use thiserror::Error;
use turnstile_protocol::TurnId;
use turnstile_protocol::models::AssistantMessage;
use turnstile_protocol::models::ContentDelta;
use turnstile_protocol::protocol::TurnStatus;

use crate::error::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} turn {turn_id} while it is {status}")]
pub struct TransitionError {
    pub turn_id: TurnId,
    pub action: &'static str,
    pub status: TurnStatus,
}

/// One prompt/response cycle.
///
/// `pending -> active -> {completed, aborted, errored}`; a turn that fails
/// before its `start` event moves straight from `pending` to a terminal
/// status. Once terminal, every transition is rejected and the turn is
/// effectively immutable.
#[derive(Debug, Clone)]
pub struct Turn {
    id: TurnId,
    status: TurnStatus,
    partial_message: Option<AssistantMessage>,
    final_message: Option<AssistantMessage>,
    error: Option<TransportError>,
}

impl Turn {
    pub(crate) fn new() -> Self {
        Self {
            id: TurnId::new(),
            status: TurnStatus::Pending,
            partial_message: None,
            final_message: None,
            error: None,
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }

    pub fn partial_message(&self) -> Option<&AssistantMessage> {
        self.partial_message.as_ref()
    }

    /// Set only once the turn completed.
    pub fn final_message(&self) -> Option<&AssistantMessage> {
        self.final_message.as_ref()
    }

    /// Set only once the turn errored.
    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    pub(crate) fn start(&mut self, partial: AssistantMessage) -> Result<(), TransitionError> {
        self.expect(TurnStatus::Pending, "start")?;
        self.partial_message = Some(partial);
        self.status = TurnStatus::Active;
        Ok(())
    }

    pub(crate) fn apply_delta(&mut self, delta: &ContentDelta) -> Result<(), TransitionError> {
        self.expect(TurnStatus::Active, "stream into")?;
        if let Some(partial) = self.partial_message.as_mut() {
            partial.apply_delta(delta);
        }
        Ok(())
    }

    pub(crate) fn complete(&mut self, message: AssistantMessage) -> Result<(), TransitionError> {
        self.expect_in_flight("complete")?;
        self.final_message = Some(message);
        self.status = TurnStatus::Completed;
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: TransportError) -> Result<(), TransitionError> {
        self.expect_in_flight("fail")?;
        self.error = Some(error);
        self.status = TurnStatus::Errored;
        Ok(())
    }

    pub(crate) fn abort(&mut self) -> Result<(), TransitionError> {
        self.expect_in_flight("abort")?;
        self.status = TurnStatus::Aborted;
        Ok(())
    }

    fn expect(&self, status: TurnStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status == status {
            Ok(())
        } else {
            Err(self.illegal(action))
        }
    }

    fn expect_in_flight(&self, action: &'static str) -> Result<(), TransitionError> {
        if self.is_in_flight() {
            Ok(())
        } else {
            Err(self.illegal(action))
        }
    }

    fn illegal(&self, action: &'static str) -> TransitionError {
        TransitionError {
            turn_id: self.id,
            action,
            status: self.status,
        }
    }
}
