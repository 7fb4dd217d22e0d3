use colloquy_protocol::ContentBlock;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Local notices such as server errors.
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    /// Local, monotonically increasing; not shared with the server.
    pub id: u64,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// True only for the placeholder mirroring the message being streamed.
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

/// Ordered conversation as seen by the client.
/// Holds at most one streaming placeholder, replaced by the final assistant message.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
}

impl Transcript {
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn streaming_entry(&self) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.streaming)
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, vec![ContentBlock::text(text)], None);
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.push(Role::System, vec![ContentBlock::text(message)], None);
    }

    /// Create or overwrite the streaming placeholder in place.
    /// Complexity: O(n) search, n = entries.
    pub fn upsert_streaming(&mut self, content: Vec<ContentBlock>, parent_tool_use_id: Option<String>) {
        match self.entries.iter_mut().find(|entry| entry.streaming) {
            Some(entry) => {
                entry.content = content;
                entry.parent_tool_use_id = parent_tool_use_id;
            }
            None => {
                let entry = self.entry(Role::Assistant, content, parent_tool_use_id);
                self.entries.push(TranscriptEntry {
                    streaming: true,
                    ..entry
                });
            }
        }
    }

    /// Drop the streaming placeholder and append the final assistant message.
    pub fn finalize_assistant(
        &mut self,
        content: Vec<ContentBlock>,
        parent_tool_use_id: Option<String>,
    ) {
        self.discard_streaming();
        self.push(Role::Assistant, content, parent_tool_use_id);
    }

    pub fn discard_streaming(&mut self) {
        self.entries.retain(|entry| !entry.streaming);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn push(&mut self, role: Role, content: Vec<ContentBlock>, parent_tool_use_id: Option<String>) {
        let entry = self.entry(role, content, parent_tool_use_id);
        self.entries.push(entry);
    }

    fn entry(
        &mut self,
        role: Role,
        content: Vec<ContentBlock>,
        parent_tool_use_id: Option<String>,
    ) -> TranscriptEntry {
        self.next_id += 1;
        TranscriptEntry {
            id: self.next_id,
            role,
            content,
            streaming: false,
            parent_tool_use_id,
        }
    }
}
