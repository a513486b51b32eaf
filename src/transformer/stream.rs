//! Upstream event stream decoding and classification.
//!
//! The upstream answers with a line-oriented stream (`data: {...}` per
//! line). [`LineDecoder`] splits raw bytes into lines, [`StreamEvent`]
//! decodes one line, and [`StreamClassifier`] drives the per-attempt state
//! machine that decides between a resolved answer and a typed failure.

use crate::core::error_types::FailureReason;
use crate::transformer::signatures::classify_failure;
use serde::Deserialize;

/// Marker every event line starts with.
pub const DATA_PREFIX: &str = "data:";

/// Field carrying the answer text in delta/field events.
pub const ANSWER_FIELD: &str = "session_state.answer";

// ============================================================================
// Line decoder
// ============================================================================

/// Splits a byte stream into lines, buffering partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(Self::decode(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush the trailing line that had no terminating newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(Self::decode(&raw))
    }

    fn decode(raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        String::from_utf8_lossy(raw).into_owned()
    }
}

// ============================================================================
// Stream events
// ============================================================================

/// One decoded upstream event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "project_start")]
    ProjectStart {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "message_field_delta")]
    FieldDelta {
        #[serde(default)]
        field_name: String,
        #[serde(default)]
        delta: Option<String>,
    },
    #[serde(rename = "message_field")]
    Field {
        #[serde(default)]
        field_name: String,
        #[serde(default)]
        field_value: serde_json::Value,
    },
    #[serde(rename = "message_result")]
    Result {
        #[serde(default)]
        content: Option<String>,
    },
    #[serde(other)]
    Unrecognized,
}

impl StreamEvent {
    /// Decode an event line. Returns `None` for lines without the data
    /// marker; undecodable payloads become [`StreamEvent::Unrecognized`].
    pub fn from_line(line: &str) -> Option<Self> {
        let payload = strip_data_prefix(line)?;
        Some(serde_json::from_str(payload).unwrap_or(StreamEvent::Unrecognized))
    }
}

/// Payload of a `data:` line, if it is one.
pub fn strip_data_prefix(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(DATA_PREFIX)
        .map(|payload| payload.trim_start())
}

// ============================================================================
// Classifier
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierState {
    AwaitingStart,
    Streaming,
    Resolved,
    Failed(FailureReason),
}

impl ClassifierState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Failed(_))
    }
}

/// Outcome of feeding one line to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Ignored,
    ProjectStarted(String),
    /// New answer text, in arrival order.
    Delta(String),
    Resolved {
        content: String,
    },
    Failed(FailureReason),
}

impl Classified {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved { .. } | Self::Failed(_))
    }
}

/// Per-attempt state machine over upstream lines.
#[derive(Debug)]
pub struct StreamClassifier {
    state: ClassifierState,
    conversation_id: Option<String>,
    answer: String,
}

impl Default for StreamClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClassifier {
    pub fn new() -> Self {
        Self {
            state: ClassifierState::AwaitingStart,
            conversation_id: None,
            answer: String::new(),
        }
    }

    pub fn state(&self) -> &ClassifierState {
        &self.state
    }

    /// Conversation id announced by `project_start`, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Answer text observed so far.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Classify one raw line. Lines after a terminal outcome are ignored.
    pub fn feed_line(&mut self, line: &str) -> Classified {
        if self.state.is_terminal() {
            return Classified::Ignored;
        }

        if let Some(reason) = classify_failure(line) {
            self.state = ClassifierState::Failed(reason);
            return Classified::Failed(reason);
        }

        let Some(event) = StreamEvent::from_line(line) else {
            return Classified::Ignored;
        };

        match event {
            StreamEvent::ProjectStart { id } => {
                self.state = ClassifierState::Streaming;
                match id.filter(|id| !id.is_empty()) {
                    Some(id) => {
                        self.conversation_id = Some(id.clone());
                        Classified::ProjectStarted(id)
                    }
                    None => Classified::Ignored,
                }
            }
            StreamEvent::FieldDelta { field_name, delta } if field_name == ANSWER_FIELD => {
                match delta.filter(|d| !d.is_empty()) {
                    Some(delta) => {
                        self.state = ClassifierState::Streaming;
                        self.answer.push_str(&delta);
                        Classified::Delta(delta)
                    }
                    None => Classified::Ignored,
                }
            }
            StreamEvent::Field {
                field_name,
                field_value,
            } if field_name == ANSWER_FIELD => {
                let Some(value) = field_value.as_str() else {
                    return Classified::Ignored;
                };
                match value.strip_prefix(self.answer.as_str()) {
                    Some(suffix) if !suffix.is_empty() => {
                        let suffix = suffix.to_string();
                        self.state = ClassifierState::Streaming;
                        self.answer = value.to_string();
                        Classified::Delta(suffix)
                    }
                    _ => Classified::Ignored,
                }
            }
            StreamEvent::Result { content } => {
                let content = content
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| self.answer.clone());
                if content.is_empty() {
                    self.state = ClassifierState::Failed(FailureReason::NoContent);
                    Classified::Failed(FailureReason::NoContent)
                } else {
                    self.state = ClassifierState::Resolved;
                    Classified::Resolved { content }
                }
            }
            _ => Classified::Ignored,
        }
    }

    /// The stream ended. Without a result this is a `NoContent` failure.
    pub fn finish(&mut self) -> Classified {
        match &self.state {
            ClassifierState::Failed(reason) => Classified::Failed(*reason),
            ClassifierState::Resolved => Classified::Ignored,
            ClassifierState::AwaitingStart | ClassifierState::Streaming => {
                self.state = ClassifierState::Failed(FailureReason::NoContent);
                Classified::Failed(FailureReason::NoContent)
            }
        }
    }

    /// Classify a fully buffered body and return its terminal outcome.
    pub fn classify_body(&mut self, body: &str) -> Classified {
        for line in body.lines() {
            let outcome = self.feed_line(line);
            if outcome.is_terminal() {
                return outcome;
            }
        }
        self.finish()
    }
}

// ============================================================================
// SSE serializer
// ============================================================================

/// Format a data-only SSE event.
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// Format the SSE done marker.
pub fn format_sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}
