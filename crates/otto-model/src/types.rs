use serde::{Deserialize, Serialize};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a message.
///
/// The history is provider-invariant: assistant messages carry `ToolUse`
/// blocks, and the matching `ToolResult` blocks travel in the *next user
/// message*.  Every mutation of the history must preserve that pairing —
/// providers reject orphaned results and unanswered tool uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64 payload.
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse { id: id.into(), name: name.into(), input }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Message content — plain text for simple turns, an ordered block list for
/// tool-bearing or multimodal turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }

    /// A user message from explicit blocks.  A single text block collapses to
    /// plain text so that serialized histories stay clean.
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: collapse(blocks) }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content: collapse(blocks) }
    }

    /// A user message carrying exactly one tool result.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        debug_assert!(results.iter().all(|b| b.is_tool_result()));
        Self { role: Role::User, content: MessageContent::Blocks(results) }
    }

    /// The plain text of this message if it is text-only.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// All text content, concatenated across blocks.
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Whether the message is plain text (no blocks, or only text blocks).
    pub fn is_text_only(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => true,
            MessageContent::Blocks(blocks) => {
                blocks.iter().all(|b| matches!(b, ContentBlock::Text { .. }))
            }
        }
    }

    /// The blocks of this message; a plain-text message yields a single
    /// synthesized text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            MessageContent::Text(t) => vec![ContentBlock::text(t.clone())],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Ids of all `tool_use` blocks in this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    /// Ids referenced by all `tool_result` blocks in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    pub fn has_tool_use(&self) -> bool {
        !self.tool_use_ids().is_empty()
    }

    pub fn has_tool_result(&self) -> bool {
        !self.tool_result_ids().is_empty()
    }

    /// Whether this message contains at least one real image block.
    pub fn has_image(&self) -> bool {
        matches!(&self.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })))
    }

    /// Approximate token count used for context management.
    ///
    /// 4-chars-per-token heuristic for text; images use a flat conservative
    /// estimate (the typical high-detail cost of a 512×512 region).
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks.iter().map(block_chars).sum(),
        };
        (chars / 4).max(1)
    }
}

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => text.len(),
        ContentBlock::Image { .. } => 765 * 4,
        ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
        ContentBlock::ToolResult { content, .. } => content.len(),
    }
}

fn collapse(blocks: Vec<ContentBlock>) -> MessageContent {
    if blocks.len() == 1 {
        if let ContentBlock::Text { text } = &blocks[0] {
            return MessageContent::Text(text.clone());
        }
    }
    MessageContent::Blocks(blocks)
}

// ─── Requests and responses ───────────────────────────────────────────────────

/// A tool schema offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: serde_json::Value,
}

/// Request sent to the LLM provider capability.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Per-attempt output-token cap computed by the budget governor.
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    /// Anything the provider reports that the executor has no special
    /// handling for (stop sequences, refusals).
    Other,
}

/// Token usage from one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    /// Cost attributed by the provider layer, when it knows its pricing.
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// A fully collected model response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl CompletionResponse {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        self.content.iter().filter(|b| b.is_tool_use()).collect()
    }
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// The model wants to call a tool.  Arguments may arrive across multiple
    /// events for the same `index`; consumers accumulate by index.
    ToolUse {
        index: u32,
        id: String,
        name: String,
        /// Accumulated JSON argument fragment
        arguments: String,
    },
    /// Final usage statistics
    Usage(Usage),
    /// The provider's stop reason for this response
    Stop(StopReason),
    /// The stream finished normally
    Done,
    /// A recoverable stream error (non-fatal warning)
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn single_text_block_collapses_to_plain_text() {
        let m = Message::user_blocks(vec![ContentBlock::text("only")]);
        assert!(matches!(m.content, MessageContent::Text(_)));
        assert_eq!(m.as_text(), Some("only"));
    }

    #[test]
    fn tool_use_block_does_not_collapse() {
        let m = Message::assistant_blocks(vec![ContentBlock::tool_use("t1", "read_file", json!({}))]);
        assert!(matches!(m.content, MessageContent::Blocks(_)));
        assert!(m.has_tool_use());
    }

    #[test]
    fn as_text_none_for_mixed_content() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::text("thinking"),
            ContentBlock::tool_use("t1", "grep", json!({"pattern": "x"})),
        ]);
        assert!(m.as_text().is_none());
        assert_eq!(m.text_content(), "thinking");
    }

    // ── Pairing accessors ─────────────────────────────────────────────────────

    #[test]
    fn tool_use_ids_collects_in_order() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::tool_use("a", "x", json!({})),
            ContentBlock::text("and"),
            ContentBlock::tool_use("b", "y", json!({})),
        ]);
        assert_eq!(m.tool_use_ids(), vec!["a", "b"]);
    }

    #[test]
    fn tool_result_ids_collects_references() {
        let m = Message::tool_results(vec![
            ContentBlock::tool_result("a", "ok", false),
            ContentBlock::tool_result("b", "boom", true),
        ]);
        assert_eq!(m.tool_result_ids(), vec!["a", "b"]);
        assert!(m.has_tool_result());
    }

    #[test]
    fn plain_text_message_has_no_tool_ids() {
        let m = Message::user("hi");
        assert!(m.tool_use_ids().is_empty());
        assert!(m.tool_result_ids().is_empty());
    }

    // ── Text-only detection ───────────────────────────────────────────────────

    #[test]
    fn text_only_true_for_plain_and_text_blocks() {
        assert!(Message::user("a").is_text_only());
        let m = Message::user_blocks(vec![ContentBlock::text("a"), ContentBlock::text("b")]);
        assert!(m.is_text_only());
    }

    #[test]
    fn text_only_false_with_tool_result() {
        let m = Message::tool_results(vec![ContentBlock::tool_result("a", "r", false)]);
        assert!(!m.is_text_only());
    }

    #[test]
    fn has_image_detects_image_blocks() {
        let m = Message::user_blocks(vec![
            ContentBlock::text("look"),
            ContentBlock::Image { media_type: "image/png".into(), data: "QUJD".into() },
        ]);
        assert!(m.has_image());
        assert!(!Message::user("no image").has_image());
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_text_divides_by_four() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_image_uses_flat_estimate() {
        let m = Message::user_blocks(vec![ContentBlock::Image {
            media_type: "image/png".into(),
            data: "A".into(),
        }]);
        assert_eq!(m.approx_tokens(), 765);
    }

    #[test]
    fn approx_tokens_tool_use_counts_name_and_input() {
        let m = Message::assistant_blocks(vec![ContentBlock::tool_use(
            "id",
            "aaaa",
            serde_json::Value::String("bbbbbb".into()),
        )]);
        // name 4 chars + input "bbbbbb" serialized with quotes = 8 chars → 3 tokens
        assert_eq!(m.approx_tokens(), 3);
    }

    // ── Response accessors ────────────────────────────────────────────────────

    #[test]
    fn response_text_concatenates_text_blocks() {
        let r = CompletionResponse {
            content: vec![
                ContentBlock::text("one "),
                ContentBlock::tool_use("t", "x", json!({})),
                ContentBlock::text("two"),
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        };
        assert_eq!(r.text(), "one two");
        assert_eq!(r.tool_uses().len(), 1);
    }

    #[test]
    fn usage_add_accumulates_all_fields() {
        let mut a = Usage { input_tokens: 1, output_tokens: 2, cache_read_tokens: 3, cache_write_tokens: 4, cost_usd: 0.5 };
        a.add(&Usage { input_tokens: 10, output_tokens: 20, cache_read_tokens: 30, cache_write_tokens: 40, cost_usd: 0.25 });
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 22);
        assert_eq!(a.cache_read_tokens, 33);
        assert_eq!(a.cache_write_tokens, 44);
        assert!((a.cost_usd - 0.75).abs() < f64::EPSILON);
    }

    // ── Serialisation round-trip ──────────────────────────────────────────────

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::assistant_blocks(vec![
            ContentBlock::text("calling"),
            ContentBlock::tool_use("t9", "web_search", json!({"query": "rust"})),
        ]);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn tool_result_round_trip_preserves_error_flag() {
        let m = Message::tool_results(vec![ContentBlock::tool_result("t1", "nope", true)]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&StopReason::EndTurn).unwrap(), "\"end_turn\"");
        assert_eq!(serde_json::to_string(&StopReason::MaxTokens).unwrap(), "\"max_tokens\"");
    }
}
