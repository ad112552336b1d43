pub mod refresh;
pub mod types;

pub use refresh::{PersistFn, TokenRefresher};
pub use types::{AuthError, AuthMethod, TokenUpdate};
