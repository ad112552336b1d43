//! Hand-rolled encoder for the binary-protocol backend.
//!
//! The wire format is field-tagged and length-delimited: every field starts
//! with a varint tag of `(field_number << 3) | wire_type`, strings and nested
//! envelopes carry a varint byte length, and the timestamp-seconds field is
//! the single fixed-width (64-bit little-endian) value in the request.
//!
//! Encoding is deterministic: fields are written in ascending field-number
//! order and all environment inputs arrive through [`EnvironmentInfo`], so
//! identical inputs produce identical bytes.

use chrono::{DateTime, Utc};

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;

/// Capability bits advertised in the model-configuration envelope. The
/// backend ignores unknown bits, so these stay constant across models.
const MODEL_CAPABILITY_BITS: u64 = 0b0011_1111;
const CONTEXT_CAPABILITY_BITS: u64 = 0b0000_0111;

const ENTRY_POINT: &str = "chat";

/// Snapshot of the calling environment, sent in the first envelope.
///
/// Captured once per request so the timestamp (and therefore the encoded
/// bytes) stay fixed across retries of the same request.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentInfo {
    pub working_dir: String,
    pub home_dir: String,
    pub os: String,
    pub shell: String,
    pub timestamp: DateTime<Utc>,
}

impl EnvironmentInfo {
    pub fn capture(timestamp: DateTime<Utc>) -> Self {
        let working_dir = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "/".to_string());
        let home_dir = dirs::home_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        EnvironmentInfo {
            working_dir,
            home_dir,
            os: std::env::consts::OS.to_string(),
            shell,
            timestamp,
        }
    }
}

/// A previously executed tool call echoed back into the query envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutputEcho {
    pub command: String,
    pub output: String,
}

/// Everything the binary request encoder consumes.
#[derive(Debug, Clone)]
pub struct BinaryRequest<'a> {
    pub query: &'a str,
    pub model_id: &'a str,
    pub env: &'a EnvironmentInfo,
    pub tool_echo: Option<&'a ToolOutputEcho>,
}

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    put_varint(buf, ((field as u64) << 3) | wire_type as u64);
}

fn put_str(buf: &mut Vec<u8>, field: u32, s: &str) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn put_message(buf: &mut Vec<u8>, field: u32, inner: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, inner.len() as u64);
    buf.extend_from_slice(inner);
}

fn put_u64(buf: &mut Vec<u8>, field: u32, v: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, v);
}

fn put_bool(buf: &mut Vec<u8>, field: u32, v: bool) {
    put_u64(buf, field, v as u64);
}

fn put_fixed64(buf: &mut Vec<u8>, field: u32, v: u64) {
    put_tag(buf, field, WIRE_FIXED64);
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Reads a varint at `pos`. Returns the value and the byte just past it.
/// Rejects runs longer than ten bytes.
pub(crate) fn read_varint(buf: &[u8], pos: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut i = pos;
    loop {
        let byte = *buf.get(i)?;
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7F) << shift;
        i += 1;
        if byte & 0x80 == 0 {
            return Some((value, i));
        }
        shift += 7;
    }
}

fn encode_environment(env: &EnvironmentInfo) -> Vec<u8> {
    let mut ts = Vec::with_capacity(16);
    put_fixed64(&mut ts, 1, env.timestamp.timestamp() as u64);
    put_u64(&mut ts, 2, u64::from(env.timestamp.timestamp_subsec_nanos()));

    let mut buf = Vec::new();
    put_str(&mut buf, 1, &env.working_dir);
    put_str(&mut buf, 2, &env.home_dir);
    put_str(&mut buf, 3, &env.os);
    put_str(&mut buf, 4, &env.shell);
    put_message(&mut buf, 5, &ts);
    buf
}

fn encode_query(query: &str, tool_echo: Option<&ToolOutputEcho>) -> Vec<u8> {
    let text = match tool_echo {
        Some(echo) => format!(
            "{query}\n\n[tool executed] {}\n{}",
            echo.command, echo.output
        ),
        None => query.to_string(),
    };
    let mut buf = Vec::new();
    put_str(&mut buf, 1, &text);
    buf
}

fn encode_model_config(model_id: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    put_str(&mut buf, 1, model_id);
    put_u64(&mut buf, 2, MODEL_CAPABILITY_BITS);
    put_u64(&mut buf, 3, CONTEXT_CAPABILITY_BITS);
    put_bool(&mut buf, 4, true); // streaming
    put_bool(&mut buf, 5, true); // tool use
    buf
}

fn encode_metadata() -> Vec<u8> {
    let mut buf = Vec::new();
    put_str(&mut buf, 1, ENTRY_POINT);
    put_bool(&mut buf, 2, false); // auto-resume
    put_bool(&mut buf, 3, true); // auto-detect
    buf
}

/// Encodes the four request envelopes in field order: environment, query,
/// model configuration, metadata.
pub fn encode_request(req: &BinaryRequest<'_>) -> Vec<u8> {
    let mut buf = Vec::new();
    put_message(&mut buf, 1, &encode_environment(req.env));
    put_message(&mut buf, 2, &encode_query(req.query, req.tool_echo));
    put_message(&mut buf, 3, &encode_model_config(req.model_id));
    put_message(&mut buf, 4, &encode_metadata());
    buf
}
