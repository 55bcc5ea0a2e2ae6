//! Parser for the agent CLI's stream-json output format.
//!
//! Input is one JSON object per line on the agent's stdout (or its JSONL log
//! file). `LineParser` buffers partial lines across reads; each complete line
//! becomes zero or more typed [`LogEvent`]s that flow to the event bus and to
//! WebSocket subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::now_iso;

/// Byte budget for tool input/result previews.
const PREVIEW_LIMIT: usize = 300;
/// Byte budget for unrecognized passthrough lines.
const RAW_LIMIT: usize = 200;

// ── Input frames (agent stream-json format) ──────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<Value>,
        #[serde(default)]
        message: Option<Value>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        num_turns: Option<u64>,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        message: Option<Value>,
        #[serde(default)]
        subtype: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AssistantMessage {
    Structured {
        #[serde(default)]
        content: Vec<ContentBlock>,
    },
    Plain(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(other)]
    Other,
}

// ── Output events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Assistant {
        text: String,
        timestamp: String,
    },
    ToolUse {
        tool_name: String,
        input_preview: String,
        input_raw: Value,
    },
    ToolResult {
        preview: String,
    },
    Error {
        message: String,
    },
    Result {
        turns: Option<u64>,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    System {
        text: String,
    },
    Raw {
        text: String,
    },
}

/// Truncate to a byte budget without splitting a UTF-8 character.
fn truncate_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn value_preview(value: &Value, limit: usize) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate_bytes(&rendered, limit)
}

/// Parse one complete line into typed events. A single assistant frame can
/// carry both text and tool uses, so the result is a list.
pub fn parse_line(line: &str) -> Vec<LogEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let parsed: Result<StreamEvent, _> = serde_json::from_str(trimmed);
    match parsed {
        Ok(StreamEvent::Assistant { message }) => match message {
            AssistantMessage::Plain(text) => vec![LogEvent::Assistant {
                text,
                timestamp: now_iso(),
            }],
            AssistantMessage::Structured { content } => {
                let mut events = Vec::new();
                let mut texts = Vec::new();
                for block in content {
                    match block {
                        ContentBlock::Text { text } => texts.push(text),
                        ContentBlock::ToolUse { name, input } => {
                            events.push(LogEvent::ToolUse {
                                tool_name: name,
                                input_preview: value_preview(&input, PREVIEW_LIMIT),
                                input_raw: input,
                            });
                        }
                        ContentBlock::Other => {}
                    }
                }
                if !texts.is_empty() {
                    events.insert(
                        0,
                        LogEvent::Assistant {
                            text: texts.join("\n"),
                            timestamp: now_iso(),
                        },
                    );
                }
                events
            }
        },
        Ok(StreamEvent::User {
            tool_use_result, ..
        }) => match tool_use_result {
            Some(result) => vec![LogEvent::ToolResult {
                preview: value_preview(&result, PREVIEW_LIMIT),
            }],
            None => Vec::new(),
        },
        Ok(StreamEvent::Result {
            num_turns,
            cost_usd,
            duration_ms,
        }) => vec![LogEvent::Result {
            turns: num_turns,
            cost_usd,
            duration_ms,
        }],
        Ok(StreamEvent::System { message, subtype }) => {
            let text = message
                .map(|m| value_preview(&m, PREVIEW_LIMIT))
                .or(subtype)
                .unwrap_or_default();
            vec![LogEvent::System { text }]
        }
        Ok(StreamEvent::Error { error }) => vec![LogEvent::Error {
            message: error
                .map(|e| value_preview(&e, PREVIEW_LIMIT))
                .unwrap_or_else(|| "unknown error".to_string()),
        }],
        Err(_) => {
            // Valid JSON of an unrecognized kind passes through as Raw; a
            // line that is not JSON at all is an error frame.
            if serde_json::from_str::<Value>(trimmed).is_ok() {
                vec![LogEvent::Raw {
                    text: truncate_bytes(trimmed, RAW_LIMIT),
                }]
            } else {
                vec![LogEvent::Error {
                    message: format!("malformed stream line: {}", truncate_bytes(trimmed, RAW_LIMIT)),
                }]
            }
        }
    }
}

/// Parse a whole JSONL buffer (a finished plan call, a log file).
pub fn parse_jsonl(content: &str) -> Vec<LogEvent> {
    content.lines().flat_map(parse_line).collect()
}

/// Concatenated assistant text of a stream — the "answer" of an in-process
/// agent call.
pub fn collect_text(events: &[LogEvent]) -> String {
    let mut parts = Vec::new();
    for event in events {
        if let LogEvent::Assistant { text, .. } = event {
            parts.push(text.as_str());
        }
    }
    parts.join("\n")
}

/// Incremental line assembler for streamed bytes. Keeps the trailing partial
/// line buffered until its newline arrives.
#[derive(Default)]
pub struct LineParser {
    buffer: String,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<LogEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            events.extend(parse_line(&line));
        }
        events
    }

    /// Flush a trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Vec<LogEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            Vec::new()
        } else {
            parse_line(&rest)
        }
    }
}
