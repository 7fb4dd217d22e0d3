use std::collections::BTreeMap;

use colloquy_protocol::{empty_input, BlockDelta, ContentBlock, SessionStatus, StreamEvent};
use serde_json::Value;

/// Effect of one applied stream event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    /// Status the session should move to, if the event implies one.
    pub status: Option<SessionStatus>,
    /// True when `snapshot()` differs from before the event.
    pub changed: bool,
}

impl Applied {
    const NONE: Self = Self {
        status: None,
        changed: false,
    };

    const CHANGED: Self = Self {
        status: None,
        changed: true,
    };
}

#[derive(Clone, Debug, PartialEq)]
enum OpenBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        /// Last input known to be complete: the seed, then the parsed fragments on stop.
        input: Value,
        partial_json: String,
    },
    /// Blocks that never receive deltas (tool results, unsupported kinds).
    Sealed(ContentBlock),
}

impl OpenBlock {
    fn from_seed(seed: ContentBlock) -> Self {
        match seed {
            ContentBlock::Text { text } => Self::Text { text },
            ContentBlock::Thinking {
                thinking,
                signature,
            } => Self::Thinking {
                thinking,
                signature,
            },
            ContentBlock::ToolUse { id, name, input } => Self::ToolUse {
                id,
                name,
                input,
                partial_json: String::new(),
            },
            other => Self::Sealed(other),
        }
    }

    /// Returns false when the delta does not fit this block kind.
    fn append(&mut self, delta: &BlockDelta) -> bool {
        match (self, delta) {
            (Self::Text { text }, BlockDelta::TextDelta { text: more }) => {
                text.push_str(more);
                true
            }
            (Self::Thinking { thinking, .. }, BlockDelta::ThinkingDelta { thinking: more }) => {
                thinking.push_str(more);
                true
            }
            (Self::Thinking { signature, .. }, BlockDelta::SignatureDelta { signature: more }) => {
                signature.get_or_insert_with(String::new).push_str(more);
                true
            }
            (Self::ToolUse { partial_json, .. }, BlockDelta::InputJsonDelta { partial_json: more }) => {
                partial_json.push_str(more);
                true
            }
            _ => false,
        }
    }

    fn seal(&mut self) {
        if let Self::ToolUse {
            input,
            partial_json,
            ..
        } = self
        {
            if partial_json.is_empty() {
                return;
            }
            *input = serde_json::from_str(partial_json).unwrap_or_else(|err| {
                tracing::debug!(error = %err, "tool input fragments are not valid JSON");
                empty_input()
            });
            partial_json.clear();
        }
    }

    fn snapshot(&self) -> ContentBlock {
        match self {
            Self::Text { text } => ContentBlock::Text { text: text.clone() },
            Self::Thinking {
                thinking,
                signature,
            } => ContentBlock::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            },
            Self::ToolUse {
                id,
                name,
                input,
                partial_json,
            } => {
                let input = if partial_json.is_empty() {
                    input.clone()
                } else {
                    serde_json::from_str(partial_json).unwrap_or_else(|_| input.clone())
                };
                ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input,
                }
            }
            Self::Sealed(block) => block.clone(),
        }
    }
}

/// Rebuilds the in-flight assistant message from `stream_event` envelopes.
///
/// Blocks are keyed strictly by their index, so overlapping blocks and
/// out-of-order starts assemble the same way. A new `message_start` always
/// discards whatever was being assembled before.
#[derive(Clone, Debug, Default)]
pub struct MessageAssembler {
    blocks: BTreeMap<usize, OpenBlock>,
    streaming: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between `message_start` and the final message (or a reset).
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Apply one stream event in arrival order.
    /// Allocation: appended delta bytes; a tool-use stop allocates its parsed input.
    /// Complexity: O(log b) per event plus the parse on stop, b = open blocks.
    pub fn apply(&mut self, event: &StreamEvent) -> Applied {
        match event {
            StreamEvent::MessageStart { .. } => {
                // A nested start discards the partial message; the snapshot changes with it.
                let discarded = !self.blocks.is_empty();
                self.blocks.clear();
                self.streaming = true;
                Applied {
                    status: Some(SessionStatus::Streaming),
                    changed: discarded,
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let status = content_block
                    .is_tool_use()
                    .then_some(SessionStatus::ToolExecuting);
                self.blocks
                    .insert(*index, OpenBlock::from_seed(content_block.clone()));
                Applied {
                    status,
                    changed: true,
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some(block) = self.blocks.get_mut(index) else {
                    tracing::debug!(index, "delta for unknown block ignored");
                    return Applied::NONE;
                };
                if block.append(delta) {
                    Applied::CHANGED
                } else {
                    Applied::NONE
                }
            }
            StreamEvent::ContentBlockStop { index } => match self.blocks.get_mut(index) {
                Some(block) => {
                    block.seal();
                    Applied::CHANGED
                }
                None => Applied::NONE,
            },
            StreamEvent::MessageDelta { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Unknown => Applied::NONE,
        }
    }

    /// Content blocks assembled so far, in index order.
    /// Allocation: clones every block. Complexity: O(total content bytes).
    pub fn snapshot(&self) -> Vec<ContentBlock> {
        self.blocks.values().map(OpenBlock::snapshot).collect()
    }

    /// Consume the full assistant message that supersedes the streamed snapshot.
    /// Returns its content blocks and resets for the next message.
    pub fn finalize(&mut self, message: &Value) -> Vec<ContentBlock> {
        self.reset();
        ContentBlock::parse_message_content(message)
    }

    pub fn reset(&mut self) {
        self.blocks.clear();
        self.streaming = false;
    }
}
