//! Incremental parser for the conversation backend's response stream.
//!
//! The stream is text with JSON event objects embedded at unpredictable
//! offsets. The parser appends each chunk to a buffer, scans for the earliest
//! known object-start marker, brace-matches to find the object end, and
//! classifies whatever parses. Incomplete objects stay buffered until more
//! bytes arrive, which makes the output independent of how the transport
//! splits chunks.

use serde_json::Value;
use tracing::debug;

use crate::upstream::StreamEvent;

/// Object prefixes that can open an event. `followupPrompt` objects are
/// matched so they get consumed and dropped rather than re-scanned forever.
const MARKERS: &[&str] = &[
    "{\"content\":",
    "{\"followupPrompt\":",
    "{\"name\":",
    "{\"input\":",
    "{\"stop\":",
];

#[derive(Debug, Default)]
pub struct JsonTextParser {
    buffer: String,
    /// Undecoded tail of a UTF-8 sequence split across chunks.
    pending: Vec<u8>,
    /// Id of the tool call currently receiving argument fragments.
    current_tool: Option<String>,
}

impl JsonTextParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.push_utf8(chunk);
        self.scan()
    }

    /// Appends the valid UTF-8 prefix of pending + chunk to the buffer,
    /// holding back an incomplete trailing sequence and skipping invalid
    /// bytes.
    fn push_utf8(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let mut bytes = std::mem::take(&mut self.pending);
        loop {
            match std::str::from_utf8(&bytes) {
                Ok(s) => {
                    self.buffer.push_str(s);
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // Safe: valid_up_to marks the boundary.
                    self.buffer
                        .push_str(std::str::from_utf8(&bytes[..valid]).unwrap_or(""));
                    match err.error_len() {
                        Some(bad) => {
                            bytes.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end, keep for the
                            // next chunk.
                            bytes.drain(..valid);
                            self.pending = bytes;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn scan(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut pos = 0;

        let retain_from = loop {
            let Some(start) = earliest_marker(&self.buffer, pos) else {
                break marker_prefix_start(&self.buffer);
            };
            match find_matching_brace(&self.buffer[start..]) {
                Some(len) => {
                    let candidate = &self.buffer[start..start + len];
                    match serde_json::from_str::<Value>(candidate) {
                        Ok(value) => self.classify(&value, &mut events),
                        Err(_) => {
                            debug!(len = candidate.len(), "skipping unparseable event candidate");
                        }
                    }
                    pos = start + len;
                }
                // Object still incomplete; keep it and wait for more bytes.
                None => break start,
            }
        };

        self.buffer.drain(..retain_from);
        events
    }

    fn classify(&mut self, value: &Value, events: &mut Vec<StreamEvent>) {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => return,
        };

        // Assistant text. Objects that also carry a followup prompt are
        // suggestion metadata, not output.
        if let Some(content) = obj.get("content").and_then(|c| c.as_str()) {
            if !content.is_empty() && !obj.contains_key("followupPrompt") {
                events.push(StreamEvent::TextDelta(content.to_string()));
            }
            return;
        }

        // Tool call opening, possibly with inline argument and stop flag.
        if let (Some(name), Some(id)) = (
            obj.get("name").and_then(|n| n.as_str()),
            obj.get("toolUseId").and_then(|i| i.as_str()),
        ) {
            events.push(StreamEvent::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            });
            self.current_tool = Some(id.to_string());
            if let Some(input) = obj.get("input") {
                let chunk = input_fragment(input);
                if !chunk.is_empty() {
                    events.push(StreamEvent::ToolCallArgDelta {
                        id: id.to_string(),
                        chunk,
                    });
                }
            }
            if obj.get("stop").and_then(|s| s.as_bool()).unwrap_or(false) {
                events.push(StreamEvent::ToolCallEnd { id: id.to_string() });
                self.current_tool = None;
            }
            return;
        }

        // Argument fragment for the open tool call.
        if let Some(input) = obj.get("input") {
            if let Some(id) = &self.current_tool {
                let chunk = input_fragment(input);
                if !chunk.is_empty() {
                    events.push(StreamEvent::ToolCallArgDelta {
                        id: id.clone(),
                        chunk,
                    });
                }
            } else {
                debug!("input fragment with no open tool call, dropping");
            }
            return;
        }

        if obj.get("stop").and_then(|s| s.as_bool()).unwrap_or(false) {
            if let Some(id) = self.current_tool.take() {
                events.push(StreamEvent::ToolCallEnd { id });
            }
        }
    }
}

/// Argument fragments arrive as raw string pieces of a JSON document; a
/// non-string value means the backend sent the whole input at once.
fn input_fragment(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn earliest_marker(buffer: &str, from: usize) -> Option<usize> {
    MARKERS
        .iter()
        .filter_map(|m| buffer[from..].find(m).map(|i| from + i))
        .min()
}

/// Start of a marker prefix dangling at the end of the buffer, or the buffer
/// length when the tail cannot begin any marker.
fn marker_prefix_start(buffer: &str) -> usize {
    let max_keep = MARKERS.iter().map(|m| m.len() - 1).max().unwrap_or(0);
    let floor = buffer.len().saturating_sub(max_keep);
    for start in floor..buffer.len() {
        if !buffer.is_char_boundary(start) {
            continue;
        }
        let tail = &buffer[start..];
        if MARKERS.iter().any(|m| m.starts_with(tail)) {
            return start;
        }
    }
    buffer.len()
}

/// Length of the balanced JSON object starting at the beginning of `s`, or
/// `None` while the object is still open. Braces inside strings and escaped
/// quotes do not count.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed_all(parser: &mut JsonTextParser, input: &[u8]) -> Vec<StreamEvent> {
        parser.feed(input)
    }

    #[test]
    fn test_content_object_becomes_text_delta() {
        let mut p = JsonTextParser::new();
        let events = feed_all(&mut p, br#"noise{"content":"hello"}trailing"#);
        assert_eq!(events, vec![StreamEvent::TextDelta("hello".into())]);
    }

    #[test]
    fn test_followup_prompt_dropped() {
        let mut p = JsonTextParser::new();
        let events = feed_all(
            &mut p,
            br#"{"content":"suggestion","followupPrompt":{"content":"next"}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_empty_content_dropped() {
        let mut p = JsonTextParser::new();
        assert!(feed_all(&mut p, br#"{"content":""}"#).is_empty());
    }

    #[test]
    fn test_tool_call_sequence() {
        let mut p = JsonTextParser::new();
        let mut events = Vec::new();
        events.extend(p.feed(br#"{"name":"ls","toolUseId":"t1"}"#));
        events.extend(p.feed(br#"{"input":"{\"path\":"}"#));
        events.extend(p.feed(br#"{"input":"\".\"}"}"#));
        events.extend(p.feed(br#"{"stop":true}"#));
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallStart { id: "t1".into(), name: "ls".into() },
                StreamEvent::ToolCallArgDelta { id: "t1".into(), chunk: "{\"path\":".into() },
                StreamEvent::ToolCallArgDelta { id: "t1".into(), chunk: "\".\"}".into() },
                StreamEvent::ToolCallEnd { id: "t1".into() },
            ]
        );
    }

    #[test]
    fn test_inline_input_and_stop_on_start() {
        let mut p = JsonTextParser::new();
        let events = p.feed(br#"{"name":"ls","toolUseId":"t1","input":"{}","stop":true}"#);
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallStart { id: "t1".into(), name: "ls".into() },
                StreamEvent::ToolCallArgDelta { id: "t1".into(), chunk: "{}".into() },
                StreamEvent::ToolCallEnd { id: "t1".into() },
            ]
        );
    }

    #[test]
    fn test_orphan_input_dropped() {
        let mut p = JsonTextParser::new();
        assert!(p.feed(br#"{"input":"orphan"}"#).is_empty());
    }

    #[test]
    fn test_incomplete_object_waits_for_more_bytes() {
        let mut p = JsonTextParser::new();
        assert!(p.feed(br#"{"content":"hel"#).is_empty());
        let events = p.feed(br#"lo"}"#);
        assert_eq!(events, vec![StreamEvent::TextDelta("hello".into())]);
    }

    #[test]
    fn test_nested_braces_inside_strings() {
        let mut p = JsonTextParser::new();
        let events = p.feed(br#"{"content":"a { b } \" c"}"#);
        assert_eq!(events, vec![StreamEvent::TextDelta("a { b } \" c".into())]);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let mut p = JsonTextParser::new();
        let full = "{\"content\":\"héllo\"}".as_bytes();
        let mut events = Vec::new();
        // Split inside the two-byte é sequence.
        let split = full.iter().position(|&b| b == 0xC3).unwrap() + 1;
        events.extend(p.feed(&full[..split]));
        events.extend(p.feed(&full[split..]));
        assert_eq!(events, vec![StreamEvent::TextDelta("héllo".into())]);
    }

    #[test]
    fn test_find_matching_brace() {
        assert_eq!(find_matching_brace(r#"{"a":1}"#), Some(7));
        assert_eq!(find_matching_brace(r#"{"a":{"b":2}}tail"#), Some(13));
        assert_eq!(find_matching_brace(r#"{"a":"unterminated"#), None);
        assert_eq!(find_matching_brace(r#"{"a":"}"}"#), Some(9));
    }

    proptest! {
        /// Chunk-split invariance: any split of the byte stream yields the
        /// same events as feeding it whole.
        #[test]
        fn prop_chunk_split_invariance(split_points in proptest::collection::vec(0usize..200, 0..8)) {
            let stream = r#"x{"content":"first"}{"name":"run","toolUseId":"t9"}{"input":"{\"cmd\":\"ls\"}"}{"stop":true}{"content":"after é tail"}"#.as_bytes();

            let mut whole = JsonTextParser::new();
            let expected = whole.feed(stream);

            let mut splits: Vec<usize> = split_points
                .into_iter()
                .map(|p| p % (stream.len() + 1))
                .collect();
            splits.sort_unstable();
            splits.dedup();

            let mut parser = JsonTextParser::new();
            let mut got = Vec::new();
            let mut prev = 0;
            for s in splits {
                got.extend(parser.feed(&stream[prev..s]));
                prev = s;
            }
            got.extend(parser.feed(&stream[prev..]));

            prop_assert_eq!(got, expected);
        }
    }
}
