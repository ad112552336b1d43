//! Tool-call accumulation across fragmented argument deltas.

use serde_json::Value;
use tracing::debug;

use crate::upstream::StreamEvent;

/// A fully assembled tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed argument object, or the raw accumulated string when the
    /// fragments never formed valid JSON.
    pub input: Value,
}

#[derive(Debug)]
struct OpenCall {
    id: String,
    name: String,
    args: String,
}

impl OpenCall {
    fn finalize(self) -> ToolCall {
        let input = if self.args.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(&self.args) {
                Ok(value) => value,
                Err(_) => {
                    debug!(tool = %self.name, "tool arguments not valid JSON, keeping raw");
                    Value::String(self.args)
                }
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            input,
        }
    }
}

/// At most one tool call accumulates at a time; a start event for a
/// different id finalizes the previous call first.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    current: Option<OpenCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one stream event; returns a call completed by this event.
    pub fn on_event(&mut self, event: &StreamEvent) -> Option<ToolCall> {
        match event {
            StreamEvent::ToolCallStart { id, name } => self.start(id, name),
            StreamEvent::ToolCallArgDelta { id, chunk } => {
                self.push_args(id, chunk);
                None
            }
            StreamEvent::ToolCallEnd { id } => self.end(id),
            _ => None,
        }
    }

    fn start(&mut self, id: &str, name: &str) -> Option<ToolCall> {
        if let Some(open) = &self.current {
            if open.id == id {
                return None;
            }
        }
        let finished = self.current.take().map(OpenCall::finalize);
        self.current = Some(OpenCall {
            id: id.to_string(),
            name: name.to_string(),
            args: String::new(),
        });
        finished
    }

    fn push_args(&mut self, id: &str, chunk: &str) {
        match &mut self.current {
            Some(open) if open.id == id => open.args.push_str(chunk),
            _ => debug!(id = %id, "argument fragment for unknown tool call, dropping"),
        }
    }

    fn end(&mut self, id: &str) -> Option<ToolCall> {
        match &self.current {
            Some(open) if open.id == id => self.current.take().map(OpenCall::finalize),
            _ => None,
        }
    }

    /// Finalizes a call left open at end of stream.
    pub fn finish(&mut self) -> Option<ToolCall> {
        self.current.take().map(OpenCall::finalize)
    }
}
