//! Per-stream accumulators for partial deltas.
//!
//! Each accumulator exposes a single `add_chunk`-style step that
//! returns `Some(..)` when there is something to emit.

use std::collections::BTreeMap;

/// Emit a text delta once this many whitespace-separated tokens of
/// unsent content have buffered up.
const FLUSH_TOKEN_THRESHOLD: usize = 5;

/// Buffers streamed text and decides when to flush a delta.
#[derive(Debug, Default)]
pub struct TextBuffer {
    full: String,
    unsent: String,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta. Returns the buffered chunk to emit when the
    /// unsent content reaches the flush threshold.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.full.push_str(delta);
        self.unsent.push_str(delta);
        if crate::utils::whitespace_tokens(&self.unsent) >= FLUSH_TOKEN_THRESHOLD {
            Some(std::mem::take(&mut self.unsent))
        } else {
            None
        }
    }

    /// Drain whatever is still unsent (end of stream).
    pub fn flush(&mut self) -> Option<String> {
        if self.unsent.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.unsent))
        }
    }

    /// Everything accumulated since the start of the stream.
    pub fn full_text(&self) -> &str {
        &self.full
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }
}

/// A fully accumulated function/tool call ready to emit.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCall {
    pub id: Option<String>,
    pub name: String,
    /// Parsed arguments; `{ "raw": <string> }` when unparsable.
    pub arguments: serde_json::Value,
    pub raw_arguments: String,
}

/// Arguments are complete once the buffered braces balance: as many
/// `{` as `}`, ending on `}`.
fn arguments_complete(buffered: &str) -> bool {
    let opens = buffered.matches('{').count();
    let closes = buffered.matches('}').count();
    opens > 0 && opens == closes && buffered.ends_with('}')
}

fn parse_arguments(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "raw": raw }))
}

/// Accumulates the legacy single `function_call` shape.
#[derive(Debug, Default)]
pub struct FunctionCallAccumulator {
    name: Option<String>,
    buffered_args: String,
    complete: bool,
}

impl FunctionCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta; returns the completed call exactly once, when
    /// the buffered arguments first balance.
    pub fn add_chunk(&mut self, name: Option<&str>, arguments: Option<&str>) -> Option<CompletedCall> {
        if self.complete {
            return None;
        }
        if let Some(n) = name {
            if self.name.is_none() && !n.is_empty() {
                self.name = Some(n.to_string());
            }
        }
        if let Some(a) = arguments {
            self.buffered_args.push_str(a);
        }
        if arguments_complete(&self.buffered_args) {
            self.complete = true;
            return Some(CompletedCall {
                id: None,
                name: self.name.clone().unwrap_or_default(),
                arguments: parse_arguments(&self.buffered_args),
                raw_arguments: self.buffered_args.clone(),
            });
        }
        None
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn started(&self) -> bool {
        self.name.is_some() || !self.buffered_args.is_empty()
    }
}

#[derive(Debug, Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    buffered_args: String,
    complete: bool,
}

/// Accumulates the indexed `tool_calls` array shape.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, ToolCallState>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tool-call delta; returns the completed call for its
    /// index exactly once.
    pub fn add_chunk(&mut self, delta: &crate::providers::ToolCallDelta) -> Option<CompletedCall> {
        let state = self.calls.entry(delta.index).or_default();
        if state.complete {
            return None;
        }
        if let Some(id) = &delta.id {
            if state.id.is_none() && !id.is_empty() {
                state.id = Some(id.clone());
            }
        }
        if let Some(name) = &delta.name {
            if state.name.is_none() && !name.is_empty() {
                state.name = Some(name.clone());
            }
        }
        if let Some(args) = &delta.arguments {
            state.buffered_args.push_str(args);
        }
        if arguments_complete(&state.buffered_args) {
            state.complete = true;
            return Some(CompletedCall {
                id: state.id.clone(),
                name: state.name.clone().unwrap_or_default(),
                arguments: parse_arguments(&state.buffered_args),
                raw_arguments: state.buffered_args.clone(),
            });
        }
        None
    }

    /// Calls that completed during the stream, in index order.
    pub fn completed(&self) -> Vec<CompletedCall> {
        self.calls
            .values()
            .filter(|s| s.complete)
            .map(|s| CompletedCall {
                id: s.id.clone(),
                name: s.name.clone().unwrap_or_default(),
                arguments: parse_arguments(&s.buffered_args),
                raw_arguments: s.buffered_args.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolCallDelta;

    #[test]
    fn text_buffer_flushes_at_token_threshold() {
        let mut buf = TextBuffer::new();
        assert_eq!(buf.push("one two "), None);
        assert_eq!(buf.push("three four "), None);
        let flushed = buf.push("five six").unwrap();
        assert_eq!(flushed, "one two three four five six");
        // The flush drains the unsent buffer but keeps the full text.
        assert_eq!(buf.flush(), None);
        assert_eq!(buf.full_text(), "one two three four five six");
    }

    #[test]
    fn text_buffer_end_of_stream_flush() {
        let mut buf = TextBuffer::new();
        assert_eq!(buf.push("Hello"), None);
        assert_eq!(buf.flush().as_deref(), Some("Hello"));
        assert_eq!(buf.flush(), None);
        assert_eq!(buf.full_text(), "Hello");
    }

    #[test]
    fn text_buffer_counts_only_unsent() {
        let mut buf = TextBuffer::new();
        buf.push("a b c d ");
        let first = buf.push("e").unwrap();
        assert_eq!(first, "a b c d e");
        // After a flush the count restarts.
        assert_eq!(buf.push("f g h"), None);
        assert_eq!(buf.flush().as_deref(), Some("f g h"));
        assert_eq!(buf.full_text(), "a b c d ef g h");
    }

    #[test]
    fn brace_balance_detection() {
        assert!(arguments_complete("{}"));
        assert!(arguments_complete("{\"q\":{\"a\":1}}"));
        assert!(!arguments_complete(""));
        assert!(!arguments_complete("{\"q\":"));
        assert!(!arguments_complete("{\"q\":{\"a\":1}"));
        // Balanced but not terminated by a closing brace.
        assert!(!arguments_complete("{} "));
    }

    #[test]
    fn function_call_accumulates_across_chunks() {
        let mut acc = FunctionCallAccumulator::new();
        assert_eq!(acc.add_chunk(Some("lookup"), Some("{\"q\":")), None);
        assert!(acc.started());
        let call = acc.add_chunk(None, Some("\"rust\"}")).unwrap();
        assert_eq!(call.name, "lookup");
        assert_eq!(call.arguments, serde_json::json!({ "q": "rust" }));
        assert!(acc.is_complete());
        // Further chunks after completion are ignored.
        assert_eq!(acc.add_chunk(None, Some("{}")), None);
    }

    #[test]
    fn unparsable_arguments_fall_back_to_raw() {
        let mut acc = FunctionCallAccumulator::new();
        let call = acc.add_chunk(Some("broken"), Some("{not json}")).unwrap();
        assert_eq!(call.arguments, serde_json::json!({ "raw": "{not json}" }));
    }

    #[test]
    fn tool_calls_tracked_per_index() {
        let mut acc = ToolCallAccumulator::new();
        assert_eq!(
            acc.add_chunk(&ToolCallDelta {
                index: 0,
                id: Some("call_0".into()),
                name: Some("alpha".into()),
                arguments: Some("{\"a\":".into()),
            }),
            None
        );
        assert_eq!(
            acc.add_chunk(&ToolCallDelta {
                index: 1,
                id: Some("call_1".into()),
                name: Some("beta".into()),
                arguments: Some("{}".into()),
            })
            .unwrap()
            .name,
            "beta"
        );
        let done = acc
            .add_chunk(&ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: Some("1}".into()),
            })
            .unwrap();
        assert_eq!(done.name, "alpha");
        assert_eq!(done.id.as_deref(), Some("call_0"));
        assert_eq!(done.arguments, serde_json::json!({ "a": 1 }));
        assert_eq!(acc.completed().len(), 2);
    }
}
