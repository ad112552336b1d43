//! Static caller-model to backend-model lookup.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Model id used when the caller asks for something unmapped.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

static MODEL_TABLE: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-3-7-sonnet", "CLAUDE_3_7_SONNET_20250219_V1_0"),
        ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
        ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
        ("claude-opus-4-1", "CLAUDE_OPUS_4_1_20250805_V1_0"),
    ])
});

/// Resolves a caller-facing model name to the backend id.
///
/// Unknown names fall back to [`DEFAULT_MODEL`]'s mapping; if even that is
/// missing from the table the raw input passes through unchanged.
pub fn resolve_model_id(requested: &str) -> String {
    if let Some(id) = MODEL_TABLE.get(requested) {
        return (*id).to_string();
    }
    if let Some(id) = MODEL_TABLE.get(DEFAULT_MODEL) {
        return (*id).to_string();
    }
    requested.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_models_map_directly() {
        assert_eq!(resolve_model_id("claude-sonnet-4"), "CLAUDE_SONNET_4_20250514_V1_0");
        assert_eq!(
            resolve_model_id("claude-sonnet-4-5-20250929"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        assert_eq!(
            resolve_model_id("claude-3-7-sonnet"),
            "CLAUDE_3_7_SONNET_20250219_V1_0"
        );
    }

    #[test]
    fn test_unknown_model_falls_back_to_default() {
        assert_eq!(resolve_model_id("gpt-9-mega"), "CLAUDE_SONNET_4_20250514_V1_0");
        assert_eq!(resolve_model_id(""), "CLAUDE_SONNET_4_20250514_V1_0");
    }
}
