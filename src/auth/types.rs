// Session types

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profile keys that must never be persisted (compared case-insensitively)
const SECRET_FIELDS: &[&str] = &["password", "passwordhash", "secret", "clientsecret"];

/// User payload keys carrying the first-login flag
const FIRST_LOGIN_FIELDS: &[&str] = &["firstLoginFlag", "IS_FIRST_LOGIN"];

/// Profile fields passed through from the login response
pub type Profile = Map<String, Value>;

/// The current session credential.
/// Immutable once issued; a refresh replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub token: String,
    /// Numeric identity, `0` when unknown
    pub subject_id: u64,
    /// Expiry, epoch seconds
    pub expires_at: i64,
    #[serde(default)]
    pub first_login: bool,
    #[serde(default)]
    pub profile: Profile,
}

impl Credential {
    /// True if the token is expired, or within `skew_secs` of expiring, at `now`
    pub fn is_expired_at(&self, now: i64, skew_secs: i64) -> bool {
        now >= self.expires_at.saturating_sub(skew_secs)
    }

    /// Seconds until expiry (negative once expired)
    pub fn expires_in(&self, now: i64) -> i64 {
        self.expires_at.saturating_sub(now)
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }

    /// Whether the subject could be identified from the token
    pub fn has_known_subject(&self) -> bool {
        self.subject_id != 0
    }
}

/// Remove secret material from a profile
pub fn sanitize_profile(mut profile: Profile) -> Profile {
    profile.retain(|key, _| !is_secret_field(key));
    profile
}

fn is_secret_field(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_FIELDS.contains(&lower.as_str())
}

/// Read the first-login flag from a user payload
pub fn first_login_flag(profile: &Profile) -> bool {
    FIRST_LOGIN_FIELDS
        .iter()
        .filter_map(|key| profile.get(*key))
        .any(|v| v.as_bool() == Some(true))
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Login response body. Both fields are required for a usable session,
/// but are optional here so their absence can be reported precisely.
#[derive(Debug, Default, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<Profile>,
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub token: &'a str,
}

/// Refresh response body; `user` omitted means "keep the prior profile"
#[derive(Debug, Default, Deserialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<Profile>,
}

/// Navigation decision handed back to the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Back to the login screen, optionally returning to a page afterwards
    Login { return_to: Option<String> },
    /// Mandatory password change after a first login
    ChangePassword,
}

/// Route guard decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allow,
    Redirect(Redirect),
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub credential: std::sync::Arc<Credential>,
    pub redirect: Option<Redirect>,
}
