//! Request translators: unified chat request to backend-native formats.

pub mod conversation;
pub mod models;
pub mod wire;

pub use conversation::build_conversation_payload;
pub use models::{resolve_model_id, DEFAULT_MODEL};
pub use wire::{encode_request, BinaryRequest, EnvironmentInfo, ToolOutputEcho};
