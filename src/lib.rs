//! polygate: a protocol gateway core for conversational AI backends.
//!
//! One unified chat request goes in; the crate translates it to the target
//! backend's native format (a JSON conversation-state payload or a
//! length-delimited binary envelope), streams the response back, and
//! reconstructs a unified event stream from whichever wire shape the backend
//! speaks. Around that sit a credential pool with health tracking, a token
//! refresh engine, and a retry/failover controller.
//!
//! The crate is transport-agnostic at the edges: persistence goes through
//! [`pool::CredentialStore`] and the network through
//! [`dispatch::transport::Transport`], so the whole dispatch path can run
//! against in-memory fakes.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mappers;
pub mod models;
pub mod pool;
pub mod upstream;

pub use auth::TokenRefresher;
pub use dispatch::{Backend, Dispatcher};
pub use error::GatewayError;
pub use models::{ChatRequest, Credential, UnifiedMessage};
pub use pool::{CredentialPool, CredentialStore, MemoryStore};
pub use upstream::StreamEvent;
