//! Typed Server-Sent Events for the responses surface.
//!
//! Every event carries a `type`, a monotonically increasing
//! `sequence_number` (starting at 0), and the event-specific payload.
//! The terminal `response.completed` uses the sentinel sequence 9999;
//! the stream then closes with a bare `data: [DONE]` frame.

use serde_json::json;

/// Sentinel sequence number marking the terminal event.
pub const FINAL_SEQUENCE: u64 = 9999;

/// The closing frame of every stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One typed event ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent {
    pub kind: &'static str,
    pub data: serde_json::Value,
}

impl TypedEvent {
    /// Render as an SSE frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind, self.data)
    }

    pub fn sequence(&self) -> u64 {
        self.data["sequence_number"].as_u64().unwrap_or(0)
    }
}

/// Stamps sequence numbers onto the typed event sequence of one
/// response stream.
#[derive(Debug, Default)]
pub struct EventSequencer {
    next_seq: u64,
}

impl EventSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn stamp(&mut self, kind: &'static str, mut data: serde_json::Value) -> TypedEvent {
        data["type"] = json!(kind);
        data["sequence_number"] = json!(self.next_seq);
        self.next_seq += 1;
        TypedEvent { kind, data }
    }

    pub fn created(&mut self, response: serde_json::Value) -> TypedEvent {
        self.stamp("response.created", json!({ "response": response }))
    }

    pub fn in_progress(&mut self, response: serde_json::Value) -> TypedEvent {
        self.stamp("response.in_progress", json!({ "response": response }))
    }

    pub fn output_item_added(&mut self, item_id: &str) -> TypedEvent {
        self.stamp(
            "response.output_item.added",
            json!({
                "output_index": 0,
                "item": {
                    "id": item_id,
                    "type": "message",
                    "role": "assistant",
                    "status": "in_progress",
                    "content": [],
                },
            }),
        )
    }

    pub fn content_part_added(&mut self, item_id: &str) -> TypedEvent {
        self.stamp(
            "response.content_part.added",
            json!({
                "item_id": item_id,
                "output_index": 0,
                "content_index": 0,
                "part": { "type": "output_text", "text": "" },
            }),
        )
    }

    pub fn output_text_delta(&mut self, item_id: &str, delta: &str) -> TypedEvent {
        self.stamp(
            "response.output_text.delta",
            json!({
                "item_id": item_id,
                "output_index": 0,
                "content_index": 0,
                "delta": delta,
            }),
        )
    }

    pub fn output_function_calls_delta(
        &mut self,
        item_id: &str,
        name: &str,
        arguments: &serde_json::Value,
    ) -> TypedEvent {
        self.stamp(
            "response.output_function_calls.delta",
            json!({
                "item_id": item_id,
                "output_index": 0,
                "delta": { "name": name, "arguments": arguments },
            }),
        )
    }

    pub fn output_text_done(&mut self, item_id: &str, text: &str) -> TypedEvent {
        self.stamp(
            "response.output_text.done",
            json!({
                "item_id": item_id,
                "output_index": 0,
                "content_index": 0,
                "text": text,
            }),
        )
    }

    pub fn content_part_done(&mut self, item_id: &str, text: &str) -> TypedEvent {
        self.stamp(
            "response.content_part.done",
            json!({
                "item_id": item_id,
                "output_index": 0,
                "content_index": 0,
                "part": { "type": "output_text", "text": text },
            }),
        )
    }

    pub fn output_item_done(&mut self, item_id: &str, text: &str) -> TypedEvent {
        self.stamp(
            "response.output_item.done",
            json!({
                "output_index": 0,
                "item": {
                    "id": item_id,
                    "type": "message",
                    "role": "assistant",
                    "status": "completed",
                    "content": [{ "type": "output_text", "text": text }],
                },
            }),
        )
    }

    /// Terminal event; always stamped with [`FINAL_SEQUENCE`].
    pub fn completed(&mut self, response: serde_json::Value) -> TypedEvent {
        let mut data = json!({ "response": response });
        data["type"] = json!("response.completed");
        data["sequence_number"] = json!(FINAL_SEQUENCE);
        TypedEvent {
            kind: "response.completed",
            data,
        }
    }

    pub fn error(&mut self, code: &str, message: &str) -> TypedEvent {
        self.stamp(
            "response.error",
            json!({ "code": code, "message": message }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase_from_zero() {
        let mut seq = EventSequencer::new();
        let created = seq.created(json!({ "id": "resp_x" }));
        let in_progress = seq.in_progress(json!({ "id": "resp_x" }));
        let added = seq.output_item_added("msg_1");
        assert_eq!(created.sequence(), 0);
        assert_eq!(in_progress.sequence(), 1);
        assert_eq!(added.sequence(), 2);
        assert_eq!(created.kind, "response.created");
        assert_eq!(created.data["response"]["id"], "resp_x");
    }

    #[test]
    fn completed_uses_sentinel_sequence() {
        let mut seq = EventSequencer::new();
        seq.created(json!({}));
        let done = seq.completed(json!({ "status": "completed" }));
        assert_eq!(done.sequence(), FINAL_SEQUENCE);
        assert_eq!(done.data["response"]["status"], "completed");
    }

    #[test]
    fn frame_layout() {
        let mut seq = EventSequencer::new();
        let e = seq.output_text_delta("msg_1", "Hello");
        let frame = e.to_frame();
        assert!(frame.starts_with("event: response.output_text.delta\ndata: {"));
        assert!(frame.ends_with("\n\n"));
        assert_eq!(e.data["delta"], "Hello");
    }

    #[test]
    fn function_call_delta_payload() {
        let mut seq = EventSequencer::new();
        let args = json!({ "q": "rust" });
        let e = seq.output_function_calls_delta("msg_1", "lookup", &args);
        assert_eq!(e.data["delta"]["name"], "lookup");
        assert_eq!(e.data["delta"]["arguments"]["q"], "rust");
    }
}
