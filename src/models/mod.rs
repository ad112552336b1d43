pub mod credential;
pub mod unified;

pub use credential::{Credential, CredentialErrorRecord, QuotaInfo};
pub use unified::{ChatRequest, ContentPart, MessageContent, Role, ToolSpec, UnifiedMessage};
