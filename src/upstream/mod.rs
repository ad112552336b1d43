//! Backend-agnostic stream events and the parsers that produce them.

pub mod event_parser;
pub mod frame_scan;
pub mod reasoning;
pub mod tool_accum;

pub use event_parser::JsonTextParser;
pub use reasoning::ReasoningSplitter;
pub use tool_accum::{ToolCall, ToolCallAccumulator};

/// One unit of reconstructed model output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    Reasoning(String),
    ToolCallStart { id: String, name: String },
    ToolCallArgDelta { id: String, chunk: String },
    ToolCallEnd { id: String },
    Error { message: String },
}

/// Drops a text delta when it repeats the immediately preceding one. The
/// conversation backend occasionally re-sends the last fragment after a
/// keepalive gap.
#[derive(Debug, Default)]
pub struct TextDedup {
    last: Option<String>,
}

impl TextDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the event unless it is a duplicate consecutive text delta.
    pub fn filter(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        match event {
            StreamEvent::TextDelta(text) => {
                if self.last.as_deref() == Some(text.as_str()) {
                    return None;
                }
                self.last = Some(text.clone());
                Some(StreamEvent::TextDelta(text))
            }
            other => {
                // Any other event breaks the run; an identical delta after a
                // tool call is real output again.
                self.last = None;
                Some(other)
            }
        }
    }
}
