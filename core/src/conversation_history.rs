use serde::Deserialize;
use serde::Serialize;
use tracing::warn;
use turnstile_protocol::models::AssistantMessage;
use turnstile_protocol::protocol::CompactionResult;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryItem {
    User { text: String },
    Assistant(AssistantMessage),
    CompactionSummary { summary: String, tokens_before: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub id: String,
    pub item: HistoryItem,
}

impl HistoryEntry {
    fn new(item: HistoryItem) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            item,
        }
    }
}

/// Transcript of the conversation owned by a session.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    /// The oldest entries are at the beginning of the vector.
    entries: Vec<HistoryEntry>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns a clone of the entries in the transcript.
    pub fn contents(&self) -> Vec<HistoryEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends `item` and returns the id assigned to the new entry.
    pub fn record(&mut self, item: HistoryItem) -> String {
        let entry = HistoryEntry::new(item);
        let id = entry.id.clone();
        self.entries.push(entry);
        id
    }

    /// Replaces every entry older than `first_kept_entry_id` with a single
    /// summary entry. Returns the number of entries removed, or `None` when the
    /// id is unknown and the transcript was left untouched.
    pub fn apply_compaction(&mut self, result: &CompactionResult) -> Option<usize> {
        let Some(first_kept) = self
            .entries
            .iter()
            .position(|entry| entry.id == result.first_kept_entry_id)
        else {
            warn!(
                first_kept_entry_id = %result.first_kept_entry_id,
                "compaction refers to an unknown history entry; keeping history as is"
            );
            return None;
        };

        let kept = self.entries.split_off(first_kept);
        let removed = self.entries.len();
        self.entries = Vec::with_capacity(kept.len() + 1);
        self.entries.push(HistoryEntry::new(HistoryItem::CompactionSummary {
            summary: result.summary.clone(),
            tokens_before: result.tokens_before,
        }));
        self.entries.extend(kept);
        Some(removed)
    }
}
