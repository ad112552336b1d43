//! Splits reasoning spans out of the text delta stream.
//!
//! The conversation backend inlines model reasoning between `<thinking>`
//! tags inside ordinary content fragments. The splitter runs downstream of
//! the event parser, turning tagged spans into [`StreamEvent::Reasoning`]
//! while passing everything else through as text. Tags can arrive split
//! across any number of fragments.

use crate::upstream::StreamEvent;

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

#[derive(Debug, Default)]
pub struct ReasoningSplitter {
    buf: String,
    in_reasoning: bool,
}

impl ReasoningSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one text fragment, returning zero or more classified events.
    pub fn feed(&mut self, text: &str) -> Vec<StreamEvent> {
        self.buf.push_str(text);
        let mut events = Vec::new();

        loop {
            let tag = if self.in_reasoning { CLOSE_TAG } else { OPEN_TAG };
            match self.buf.find(tag) {
                Some(at) => {
                    let before: String = self.buf.drain(..at + tag.len()).collect();
                    let payload = &before[..at];
                    if !payload.is_empty() {
                        events.push(self.wrap(payload));
                    }
                    self.in_reasoning = !self.in_reasoning;
                }
                None => {
                    // Hold back a tail that could be the start of a tag.
                    let keep = partial_tag_len(&self.buf, tag);
                    let emit_to = self.buf.len() - keep;
                    if emit_to > 0 {
                        let payload: String = self.buf.drain(..emit_to).collect();
                        events.push(self.wrap(&payload));
                    }
                    return events;
                }
            }
        }
    }

    /// Emits whatever is still buffered at end of stream. An unterminated
    /// partial tag is surfaced as literal text.
    pub fn flush(&mut self) -> Option<StreamEvent> {
        if self.buf.is_empty() {
            return None;
        }
        let payload = std::mem::take(&mut self.buf);
        Some(self.wrap(&payload))
    }

    fn wrap(&self, payload: &str) -> StreamEvent {
        if self.in_reasoning {
            StreamEvent::Reasoning(payload.to_string())
        } else {
            StreamEvent::TextDelta(payload.to_string())
        }
    }
}

/// Length of the longest buffer suffix that is a proper prefix of `tag`.
fn partial_tag_len(buf: &str, tag: &str) -> usize {
    let max = tag.len().min(buf.len());
    for keep in (1..=max).rev() {
        if keep == tag.len() {
            continue;
        }
        let start = buf.len() - keep;
        if buf.is_char_boundary(start) && tag.starts_with(&buf[start..]) {
            return keep;
        }
    }
    0
}
