// Authentication module
// Manages the session credential lifecycle and request authorization

mod authenticator;
mod client;
mod coordinator;
mod notifier;
mod scheduler;
mod session;
mod storage;
mod store;
mod token;
mod types;

pub use authenticator::{bearer_token, RequestAuthenticator};
pub use client::{
    AuthClient, AuthEndpoints, DEFAULT_LOGIN_PATH, DEFAULT_LOGOUT_PATH, DEFAULT_REFRESH_PATH,
};
pub use coordinator::{RefreshCoordinator, RefreshOutcome};
pub use notifier::{SessionNotifier, SessionSnapshot, Subscription};
pub use scheduler::{RefreshScheduler, DEFAULT_REFRESH_MARGIN_SECS};
pub use session::SessionManager;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use store::{CredentialStore, DEFAULT_EXPIRY_SKEW_SECS, SESSION_KEY};
pub use token::{decode_claims, redact, Claims, DecodeError};
pub use types::{Access, Credential, LoginOutcome, Profile, Redirect};

#[cfg(any(test, feature = "test-utils"))]
pub use token::encode_unsigned;
