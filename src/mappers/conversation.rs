//! JSON-conversation request translator.
//!
//! Turns a [`ChatRequest`] into the backend's `conversationState` payload:
//! adjacent same-role turns merged, system prompt folded into the first user
//! turn, all but the last turn serialized as history, and the last user turn
//! becoming the current message.

use std::collections::HashSet;

use serde_json::{json, Value};
use tracing::debug;

use crate::auth::AuthMethod;
use crate::mappers::models::resolve_model_id;
use crate::models::{ChatRequest, ContentPart, Role, ToolSpec, UnifiedMessage};

const ORIGIN: &str = "AI_EDITOR";

/// Placeholder texts for turns that would otherwise be empty. The backend
/// rejects empty content fields.
const CONTINUE_TEXT: &str = "Continue";
const TOOL_RESULTS_TEXT: &str = "Tool results provided.";
const TOOL_CALLS_TEXT: &str = "Tool calls executed.";

/// One merged conversation turn with its structured parts pulled out.
#[derive(Debug, Clone, Default, PartialEq)]
struct Turn {
    role: Option<Role>,
    text: String,
    tool_results: Vec<Value>,
    tool_uses: Vec<Value>,
    images: Vec<Value>,
}

impl Turn {
    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }

    /// The turn's content with the empty-content guard applied.
    fn content(&self) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        match self.role {
            Some(Role::Assistant) if !self.tool_uses.is_empty() => TOOL_CALLS_TEXT.to_string(),
            Some(Role::User) if !self.tool_results.is_empty() => TOOL_RESULTS_TEXT.to_string(),
            _ => CONTINUE_TEXT.to_string(),
        }
    }
}

/// Merges adjacent same-role messages into single turns. Tool results are
/// deduplicated by id across the whole conversation, first occurrence wins.
fn merge_turns(messages: &[UnifiedMessage]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    let mut seen_tool_results: HashSet<String> = HashSet::new();

    for msg in messages {
        if turns.last().map(|t| t.role) != Some(Some(msg.role)) {
            turns.push(Turn {
                role: Some(msg.role),
                ..Turn::default()
            });
        }
        let Some(turn) = turns.last_mut() else {
            continue;
        };

        for part in msg.content.parts() {
            match part {
                ContentPart::Text { text } => turn.push_text(&text),
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    if !seen_tool_results.insert(tool_use_id.clone()) {
                        debug!(tool_use_id = %tool_use_id, "dropping duplicate tool result");
                        continue;
                    }
                    turn.tool_results.push(json!({
                        "toolUseId": tool_use_id,
                        "content": [{"text": tool_result_text(&content)}],
                        "status": if is_error.unwrap_or(false) { "error" } else { "success" },
                    }));
                }
                ContentPart::ToolUse { id, name, input } => {
                    turn.tool_uses.push(json!({
                        "toolUseId": id,
                        "name": name,
                        "input": input,
                    }));
                }
                ContentPart::Image { media_type, data } => {
                    turn.images.push(json!({
                        "format": image_format(&media_type),
                        "source": {"bytes": data},
                    }));
                }
            }
        }
    }
    turns
}

/// Flattens a tool result body to plain text: strings pass through, arrays
/// contribute their text blocks, anything else is serialized.
pub(crate) fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                let piece = match item {
                    Value::String(s) => s.clone(),
                    Value::Object(obj) => obj
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| item.to_string()),
                    other => other.to_string(),
                };
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&piece);
            }
            out
        }
        other => other.to_string(),
    }
}

/// "image/png" → "png". Unrecognized media types pass the subtype through.
fn image_format(media_type: &str) -> &str {
    media_type.split('/').nth(1).unwrap_or(media_type)
}

fn user_history_entry(turn: &Turn, model_id: &str) -> Value {
    let mut msg = json!({
        "content": turn.content(),
        "modelId": model_id,
        "origin": ORIGIN,
    });
    if !turn.images.is_empty() {
        msg["images"] = Value::Array(turn.images.clone());
    }
    if !turn.tool_results.is_empty() {
        msg["userInputMessageContext"] = json!({"toolResults": turn.tool_results});
    }
    json!({"userInputMessage": msg})
}

fn assistant_history_entry(turn: &Turn) -> Value {
    let mut msg = json!({"content": turn.content()});
    if !turn.tool_uses.is_empty() {
        msg["toolUses"] = Value::Array(turn.tool_uses.clone());
    }
    json!({"assistantResponseMessage": msg})
}

fn tool_specifications(tools: &[ToolSpec]) -> Value {
    let specs: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "toolSpecification": {
                    "name": t.name,
                    "description": t.description.clone().unwrap_or_default(),
                    "inputSchema": {"json": t.input_schema},
                }
            })
        })
        .collect();
    Value::Array(specs)
}

/// Builds the full request payload for the conversation backend.
///
/// `profile_arn` is attached for the idc auth method only; other methods
/// authenticate with the bearer token alone.
pub fn build_conversation_payload(
    req: &ChatRequest,
    auth_method: AuthMethod,
    profile_arn: Option<&str>,
) -> Value {
    let model_id = resolve_model_id(&req.model);
    let mut turns = merge_turns(&req.messages);

    // System prompt folds into the first user turn; when the conversation
    // opens with an assistant turn a synthetic user turn carries it.
    if let Some(system) = req.system.as_deref().filter(|s| !s.is_empty()) {
        match turns.first_mut() {
            Some(first) if first.role == Some(Role::User) => {
                let existing = std::mem::take(&mut first.text);
                first.text = if existing.is_empty() {
                    system.to_string()
                } else {
                    format!("{system}\n\n{existing}")
                };
            }
            _ => {
                let mut synthetic = Turn {
                    role: Some(Role::User),
                    ..Turn::default()
                };
                synthetic.text = system.to_string();
                turns.insert(0, synthetic);
            }
        }
    }

    // A conversation ending on an assistant turn keeps that turn in history
    // and asks the model to continue.
    let current = match turns.pop() {
        Some(t) if t.role == Some(Role::User) => t,
        other => {
            turns.extend(other);
            Turn {
                role: Some(Role::User),
                text: CONTINUE_TEXT.to_string(),
                ..Turn::default()
            }
        }
    };

    let history: Vec<Value> = turns
        .iter()
        .map(|t| match t.role {
            Some(Role::Assistant) => assistant_history_entry(t),
            _ => user_history_entry(t, &model_id),
        })
        .collect();

    let mut context = serde_json::Map::new();
    if !current.tool_results.is_empty() {
        context.insert("toolResults".into(), Value::Array(current.tool_results.clone()));
    }
    if let Some(tools) = req.tools.as_deref().filter(|t| !t.is_empty()) {
        context.insert("tools".into(), tool_specifications(tools));
    }

    let mut current_msg = json!({
        "content": current.content(),
        "modelId": model_id,
        "origin": ORIGIN,
    });
    if !current.images.is_empty() {
        current_msg["images"] = Value::Array(current.images.clone());
    }
    if !context.is_empty() {
        current_msg["userInputMessageContext"] = Value::Object(context);
    }

    let mut payload = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": uuid::Uuid::new_v4().to_string(),
            "currentMessage": {"userInputMessage": current_msg},
            "history": history,
        }
    });
    if auth_method == AuthMethod::Idc {
        if let Some(arn) = profile_arn {
            payload["profileArn"] = Value::String(arn.to_string());
        }
    }
    payload
}
