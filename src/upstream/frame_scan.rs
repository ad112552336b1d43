//! Heuristic scanner for the binary-protocol backend's response chunks.
//!
//! The response interleaves text payloads with session metadata inside
//! nested length-delimited frames. There is no published schema; this module
//! reproduces the observed framing: a `0x1A` byte introduces an outer
//! varint-length region whose body starts with `0x0A` and an inner varint
//! length around the payload. Fragments that look like identifiers or
//! metadata are filtered out, first per fragment and once more over the
//! concatenated result, because some metadata only becomes recognizable after
//! reassembly.
//!
//! The public surface is deliberately narrow: bytes in, recovered fragments
//! out. Callers never see offsets or framing details.

use base64::Engine;
use tracing::debug;

use crate::mappers::wire::read_varint;

const OUTER_MARKER: u8 = 0x1A;
const INNER_MARKER: u8 = 0x0A;

/// Substrings marking a fragment as session metadata rather than output.
const SYSTEM_MARKERS: &[&str] = &[
    "conversationId",
    "conversation_id",
    "messageId",
    "message_id",
    "sessionId",
    "session_id",
    "modelId",
];

/// Prefix of tool invocation ids embedded in the stream.
const CALL_ID_PREFIX: &[u8] = b"toolu_";

/// A tool invocation recovered from the binary stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredCommand {
    pub call_id: String,
    pub text: String,
}

/// Everything one chunk yielded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutcome {
    pub text: Option<String>,
    pub command: Option<RecoveredCommand>,
}

/// Scans one response chunk for assistant text and tool invocations.
pub fn scan_chunk(chunk: &[u8]) -> ScanOutcome {
    ScanOutcome {
        text: extract_text(chunk),
        command: detect_command(chunk),
    }
}

/// All plausible text fragments in scan order, per-fragment filters applied.
pub fn extract_text_fragments(chunk: &[u8]) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut i = 0;
    while i < chunk.len() {
        if chunk[i] != OUTER_MARKER {
            i += 1;
            continue;
        }
        let Some((outer_len, body)) = read_varint(chunk, i + 1) else {
            i += 1;
            continue;
        };
        let outer_len = outer_len as usize;
        let outer_end = body + outer_len;
        if outer_len == 0 || outer_end > chunk.len() || chunk.get(body) != Some(&INNER_MARKER) {
            i += 1;
            continue;
        }
        let Some((inner_len, payload)) = read_varint(chunk, body + 1) else {
            i += 1;
            continue;
        };
        let inner_len = inner_len as usize;
        let payload_end = payload + inner_len;
        if inner_len == 0 || payload_end > outer_end {
            i += 1;
            continue;
        }
        match std::str::from_utf8(&chunk[payload..payload_end]) {
            Ok(s) if keep_fragment(s) => {
                fragments.push(s.to_string());
                i = payload_end;
            }
            Ok(_) => {
                debug!(len = inner_len, "filtered metadata fragment");
                i = payload_end;
            }
            Err(_) => {
                i += 1;
            }
        }
    }
    fragments
}

/// Concatenated fragment text, or `None` when nothing survives the filters.
///
/// A fragment can pass the per-fragment filters and still be discarded here:
/// identifiers split across frames only look like identifiers once joined.
pub fn extract_text(chunk: &[u8]) -> Option<String> {
    let fragments = extract_text_fragments(chunk);
    if fragments.is_empty() {
        return None;
    }
    let joined = fragments.concat();
    if !keep_fragment(&joined) {
        debug!("discarding reassembled result, looks like metadata");
        return None;
    }
    Some(joined)
}

fn keep_fragment(s: &str) -> bool {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return false;
    }
    if !is_mostly_printable(trimmed) {
        return false;
    }
    if is_uuid_shape(trimmed) {
        return false;
    }
    if SYSTEM_MARKERS.iter().any(|m| trimmed.contains(m)) {
        return false;
    }
    if looks_like_json_metadata(trimmed) {
        return false;
    }
    if trimmed.len() > 100 && is_base64_alphabet(trimmed) {
        return false;
    }
    true
}

fn is_mostly_printable(s: &str) -> bool {
    s.chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
}

/// 8-4-4-4-12 hex with dashes, 36 chars.
fn is_uuid_shape(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let is_dash_pos = matches!(i, 8 | 13 | 18 | 23);
        if is_dash_pos {
            if b != b'-' {
                return false;
            }
        } else if !b.is_ascii_hexdigit() {
            return false;
        }
    }
    true
}

/// Key-value noise such as `{"status":"COMPLETED"` or bare `"key":"value"`
/// pairs carried in frames alongside real output.
fn looks_like_json_metadata(s: &str) -> bool {
    s.starts_with('{') || s.starts_with("\":") || s.contains("\":\"") || s.contains("\":")
}

fn is_base64_alphabet(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

/// Looks for a call-id marker and recovers the command text near it.
///
/// Two recoveries are attempted: a direct printable run following the id and
/// a nested frame scan of the remainder; the longer result wins. A winner
/// that itself looks like base64 is speculatively decoded and re-scanned,
/// since the backend sometimes wraps the payload one more time.
pub fn detect_command(chunk: &[u8]) -> Option<RecoveredCommand> {
    let marker = find_subslice(chunk, CALL_ID_PREFIX)?;
    let mut id_end = marker + CALL_ID_PREFIX.len();
    while id_end < chunk.len() && chunk[id_end].is_ascii_alphanumeric() {
        id_end += 1;
    }
    if id_end == marker + CALL_ID_PREFIX.len() {
        return None;
    }
    let call_id = String::from_utf8_lossy(&chunk[marker..id_end]).to_string();
    let rest = &chunk[id_end..];

    // The direct scan stops at the first frame marker: outer length bytes,
    // the inner marker and the inner length all land in the printable range
    // and would otherwise count toward the run.
    let frame_at = rest
        .iter()
        .position(|&b| b == OUTER_MARKER)
        .unwrap_or(rest.len());
    let direct = printable_run(&rest[..frame_at]).unwrap_or_default();
    let nested = extract_text_fragments(rest).concat();
    let mut text = if nested.len() > direct.len() { nested } else { direct };

    if text.len() > 20 && is_base64_alphabet(&text) {
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&text) {
            let inner = extract_text_fragments(&decoded).concat();
            let recovered = if inner.is_empty() {
                printable_run(&decoded).unwrap_or_default()
            } else {
                inner
            };
            if !recovered.is_empty() {
                debug!("base64 re-decode recovered command text");
                text = recovered;
            }
        }
    }

    let text = text.trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(RecoveredCommand { call_id, text })
}

/// Longest leading-ish printable ASCII run of useful size.
fn printable_run(bytes: &[u8]) -> Option<String> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        let printable = (0x20..0x7F).contains(&b) || b == b'\n' || b == b'\t';
        match (printable, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if best.map_or(true, |(bs, be)| i - s > be - bs) {
                    best = Some((s, i));
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        let end = bytes.len();
        if best.map_or(true, |(bs, be)| end - s > be - bs) {
            best = Some((s, end));
        }
    }
    let (s, e) = best?;
    if e - s < 4 {
        return None;
    }
    std::str::from_utf8(&bytes[s..e]).ok().map(str::to_string)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}
