// Credential store
// Owns the current session and its persisted copy

use chrono::{TimeZone, Utc};
use std::sync::{Arc, PoisonError, RwLock};

use super::notifier::{SessionNotifier, SessionSnapshot, Subscription};
use super::storage::KeyValueStore;
use super::token::{decode_claims, redact};
use super::types::{first_login_flag, sanitize_profile, Credential, Profile};
use crate::error::AuthError;

/// Storage key of the persisted session
pub const SESSION_KEY: &str = "session.current";

/// Default clock skew tolerated before a token counts as expired
pub const DEFAULT_EXPIRY_SKEW_SECS: i64 = 30;

struct SessionState {
    current: SessionSnapshot,
    /// Bumped on every set/clear so in-flight refreshes can detect that
    /// the session they started from is gone
    generation: u64,
}

/// Holds the current session credential.
///
/// The only component allowed to mutate the session. Readers get `Arc`
/// snapshots and never observe a half-updated credential.
pub struct CredentialStore {
    state: RwLock<SessionState>,
    storage: Arc<dyn KeyValueStore>,
    notifier: SessionNotifier,
    skew_secs: i64,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, notifier: SessionNotifier) -> Self {
        Self::with_skew(storage, notifier, DEFAULT_EXPIRY_SKEW_SECS)
    }

    pub fn with_skew(
        storage: Arc<dyn KeyValueStore>,
        notifier: SessionNotifier,
        skew_secs: i64,
    ) -> Self {
        Self {
            state: RwLock::new(SessionState {
                current: None,
                generation: 0,
            }),
            storage,
            notifier,
            skew_secs,
        }
    }

    /// Load the persisted session into memory.
    /// Absent, unreadable or token-less data yields `None`.
    pub fn restore(&self) -> SessionSnapshot {
        let raw = match self.storage.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read persisted session");
                return None;
            }
        };

        let credential = match serde_json::from_str::<Credential>(&raw) {
            Ok(c) if !c.token.trim().is_empty() && c.expires_at_utc().is_some() => c,
            Ok(_) => {
                tracing::warn!("Persisted session has no token or an invalid expiry, ignoring");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Persisted session is corrupt, ignoring");
                return None;
            }
        };

        let credential = Arc::new(credential);
        self.replace(Some(credential.clone()));

        tracing::info!(
            subject_id = credential.subject_id,
            expires_at = credential.expires_at,
            "Restored persisted session"
        );
        Some(credential)
    }

    /// Validate, sanitize, persist and install a new credential
    pub fn set(&self, token: String, profile: Profile) -> Result<Arc<Credential>, AuthError> {
        let credential = Arc::new(issue(token, profile)?);

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            self.persist(&credential);
            state.current = Some(credential.clone());
            state.generation += 1;
            self.notifier.publish(state.current.clone());
        }

        tracing::info!(
            subject_id = credential.subject_id,
            expires_at = credential.expires_at,
            token = %redact(&credential.token),
            "Session credential updated"
        );
        Ok(credential)
    }

    /// Like `set`, but only commits while the session is still at
    /// `expected` generation. Returns `Ok(None)` when it was superseded.
    pub fn set_if_generation(
        &self,
        expected: u64,
        token: String,
        profile: Profile,
    ) -> Result<Option<Arc<Credential>>, AuthError> {
        let credential = Arc::new(issue(token, profile)?);

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.generation != expected {
                tracing::warn!(
                    expected,
                    actual = state.generation,
                    "Session changed during refresh, discarding refreshed credential"
                );
                return Ok(None);
            }
            self.persist(&credential);
            state.current = Some(credential.clone());
            state.generation += 1;
            self.notifier.publish(state.current.clone());
        }

        tracing::info!(
            subject_id = credential.subject_id,
            expires_at = credential.expires_at,
            "Session credential renewed"
        );
        Ok(Some(credential))
    }

    /// Remove the session from memory and storage.
    /// A no-op (no notification) when there is nothing to clear.
    pub fn clear(&self) {
        let had_session = self.current().is_some();

        let had_persisted = match self.storage.get(SESSION_KEY) {
            Ok(value) => value.is_some(),
            Err(_) => true,
        };

        if !had_session && !had_persisted {
            tracing::debug!("Clear requested with no session present");
            return;
        }

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = self.storage.remove(SESSION_KEY) {
                tracing::warn!(error = %e, "Failed to remove persisted session");
            }
            state.current = None;
            state.generation += 1;
            self.notifier.publish(None);
        }
        tracing::info!("Session cleared");
    }

    /// Clear only if the session is still at `expected` generation.
    /// Returns whether anything was cleared.
    pub fn clear_if_generation(&self, expected: u64) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.generation != expected {
                tracing::debug!(
                    expected,
                    actual = state.generation,
                    "Session replaced since refresh started, not clearing"
                );
                return false;
            }
            if let Err(e) = self.storage.remove(SESSION_KEY) {
                tracing::warn!(error = %e, "Failed to remove persisted session");
            }
            let had_session = state.current.take().is_some();
            state.generation += 1;
            if had_session {
                self.notifier.publish(None);
            }
        }
        tracing::info!("Session cleared");
        true
    }

    /// Snapshot of the current session
    pub fn current(&self) -> SessionSnapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// Current bearer token, if any
    pub fn token(&self) -> Option<String> {
        self.current().map(|c| c.token.clone())
    }

    /// Generation counter of the current session
    pub fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Current session together with its generation, read atomically
    pub fn snapshot(&self) -> (SessionSnapshot, u64) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.current.clone(), state.generation)
    }

    /// True if absent, or if `now >= expires_at - skew`
    pub fn is_expired(&self, skew_secs: i64) -> bool {
        match self.current() {
            None => true,
            Some(c) => c.is_expired_at(Utc::now().timestamp(), skew_secs),
        }
    }

    /// `is_expired` with the configured skew
    pub fn is_expired_default(&self) -> bool {
        self.is_expired(self.skew_secs)
    }

    /// Subscribe to session changes, starting from the current session
    pub fn subscribe(&self) -> Subscription {
        // Held across registration so no publish can slip in between
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        self.notifier.subscribe(state.current.clone())
    }

    fn replace(&self, next: SessionSnapshot) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.current = next;
        state.generation += 1;
        self.notifier.publish(state.current.clone());
    }

    fn persist(&self, credential: &Credential) {
        let json = match serde_json::to_string(credential) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize session");
                return;
            }
        };
        if let Err(e) = self.storage.set(SESSION_KEY, &json) {
            tracing::warn!(error = %e, "Failed to persist session, keeping it in memory only");
        }
    }
}

/// Build a credential from a raw token and user payload.
/// The token must decode and carry an expiry claim.
fn issue(token: String, profile: Profile) -> Result<Credential, AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::InvalidCredential("token is empty".to_string()));
    }

    let claims = decode_claims(&token)
        .map_err(|e| AuthError::InvalidCredential(format!("token could not be decoded: {}", e)))?;

    let expires_at = claims
        .exp
        .ok_or_else(|| AuthError::InvalidCredential("token has no expiry claim".to_string()))?;
    if Utc.timestamp_opt(expires_at, 0).single().is_none() {
        return Err(AuthError::InvalidCredential(format!(
            "token expiry is out of range: {}",
            expires_at
        )));
    }

    let profile = sanitize_profile(profile);

    Ok(Credential {
        subject_id: claims.subject_id(),
        expires_at,
        first_login: first_login_flag(&profile),
        profile,
        token,
    })
}
