use async_trait::async_trait;
use turnstile_protocol::protocol::OperationKind;
use turnstile_protocol::protocol::OperationOutput;

use crate::conversation_history::HistoryEntry;

/// Runs maintenance operations such as compaction.
///
/// The coordinator only calls this while no turn is in flight, and never more
/// than once for the same queued request.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        kind: &OperationKind,
        history: &[HistoryEntry],
    ) -> anyhow::Result<OperationOutput>;
}
