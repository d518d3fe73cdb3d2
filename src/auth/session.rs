// Session lifecycle: login, logout, cold start and route guarding

use chrono::Utc;
use std::sync::Arc;

use super::client::AuthClient;
use super::coordinator::{RefreshCoordinator, RefreshOutcome};
use super::notifier::{SessionSnapshot, Subscription};
use super::store::CredentialStore;
use super::types::{Access, LoginOutcome, Redirect};
use crate::error::{AuthError, Result};

/// Owns login, logout and the decision to abandon a session
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<CredentialStore>,
    client: AuthClient,
    coordinator: Arc<RefreshCoordinator>,
    skew_secs: i64,
}

impl SessionManager {
    pub fn new(
        store: Arc<CredentialStore>,
        client: AuthClient,
        coordinator: Arc<RefreshCoordinator>,
        skew_secs: i64,
    ) -> Self {
        Self {
            store,
            client,
            coordinator,
            skew_secs,
        }
    }

    /// Cold start: pick up a persisted session.
    ///
    /// An expired session is refreshed right away; a failed refresh ends
    /// it quietly. A valid one gets its proactive timer armed.
    pub async fn start(&self) -> SessionSnapshot {
        let restored = self.store.restore()?;

        if restored.is_expired_at(Utc::now().timestamp(), self.skew_secs) {
            tracing::info!("Restored session is expired, refreshing");
            return match self.coordinator.refresh().await {
                Ok(credential) => Some(credential),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not renew restored session");
                    None
                }
            };
        }

        self.coordinator.schedule(&restored);
        Some(restored)
    }

    /// Log in with username and password.
    ///
    /// The response must carry both a token and a user payload, and the
    /// token must decode with an expiry. Any failure leaves no session.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        match self.try_login(username, password).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(username = %username, error = %e, "Login failed");
                self.store.clear();
                self.coordinator.cancel_schedule();
                Err(e)
            }
        }
    }

    async fn try_login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        let response = self.client.login(username, password).await?;

        let token = response.token.filter(|t| !t.trim().is_empty());
        let (token, user) = match (token, response.user) {
            (Some(token), Some(user)) => (token, user),
            (None, None) => return Err(missing_field("token and user")),
            (None, Some(_)) => return Err(missing_field("token")),
            (Some(_), None) => return Err(missing_field("user")),
        };

        let credential = self.store.set(token, user)?;
        self.coordinator.schedule(&credential);

        let redirect = credential.first_login.then_some(Redirect::ChangePassword);
        if redirect.is_some() {
            tracing::info!(subject_id = credential.subject_id, "First login, password change required");
        }

        tracing::info!(subject_id = credential.subject_id, "Login successful");
        Ok(LoginOutcome {
            credential,
            redirect,
        })
    }

    /// Log out locally, then tell the backend on a best-effort basis
    pub async fn logout(&self) -> Redirect {
        let token = self.store.token();

        self.store.clear();
        self.coordinator.cancel_schedule();

        if token.is_some() {
            self.client.notify_logout(token.as_deref()).await;
        } else {
            tracing::debug!("Logout requested without a session");
        }

        Redirect::Login { return_to: None }
    }

    /// Renew the session now (single-flight)
    pub async fn refresh(&self) -> RefreshOutcome {
        self.coordinator.refresh().await
    }

    /// A session is present and not expired
    pub fn is_logged_in(&self) -> bool {
        !self.store.is_expired(self.skew_secs)
    }

    /// The session's first-login flag
    pub fn is_first_login(&self) -> bool {
        self.store.current().map(|c| c.first_login).unwrap_or(false)
    }

    pub fn current(&self) -> SessionSnapshot {
        self.store.current()
    }

    /// Subscribe to session changes
    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe()
    }

    /// Decide whether a protected page at `path` may be shown
    pub fn guard(&self, path: &str) -> Access {
        if self.is_logged_in() {
            Access::Allow
        } else {
            Access::Redirect(Redirect::Login {
                return_to: Some(path.to_string()),
            })
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }
}

fn missing_field(what: &str) -> AuthError {
    AuthError::InvalidCredential(format!("login response is missing {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::client::AuthEndpoints;
    use crate::auth::notifier::SessionNotifier;
    use crate::auth::scheduler::RefreshScheduler;
    use crate::auth::storage::{KeyValueStore, MemoryStore};
    use crate::auth::store::SESSION_KEY;
    use crate::auth::token::encode_unsigned;
    use serde_json::json;
    use std::time::Duration;

    fn token(ttl: i64) -> String {
        encode_unsigned(&json!({"exp": Utc::now().timestamp() + ttl, "sub": "12"}))
    }

    fn manager(server_url: &str, storage: &MemoryStore) -> SessionManager {
        let store = Arc::new(CredentialStore::new(
            Arc::new(storage.clone()),
            SessionNotifier::new(),
        ));
        let client =
            AuthClient::new(AuthEndpoints::with_defaults(server_url).unwrap(), 5, 5).unwrap();
        let coordinator =
            RefreshCoordinator::new(store.clone(), client.clone(), RefreshScheduler::new(60));
        SessionManager::new(store, client, coordinator, 30)
    }

    #[tokio::test]
    async fn test_login_arms_scheduler() {
        let mut server = mockito::Server::new_async().await;
        let issued = token(3600);
        server
            .mock("POST", "/auth/login")
            .match_body(mockito::Matcher::Json(
                json!({"username": "alice", "password": "Secr3t!"}),
            ))
            .with_status(200)
            .with_body(json!({"token": issued, "user": {"firstLoginFlag": false}}).to_string())
            .create_async()
            .await;

        let storage = MemoryStore::new();
        let sessions = manager(&server.url(), &storage);
        let outcome = sessions.login("alice", "Secr3t!").await.unwrap();

        assert_eq!(outcome.redirect, None);
        assert_eq!(outcome.credential.subject_id, 12);
        assert!(sessions.is_logged_in());
        assert!(!sessions.is_first_login());

        let fires_in = sessions.coordinator().scheduler().fires_in().unwrap();
        assert!(fires_in <= Duration::from_secs(3540));
        assert!(fires_in >= Duration::from_secs(3530));
    }

    #[tokio::test]
    async fn test_first_login_requests_password_change() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(json!({"token": token(3600), "user": {"IS_FIRST_LOGIN": true}}).to_string())
            .create_async()
            .await;

        let sessions = manager(&server.url(), &MemoryStore::new());
        let outcome = sessions.login("bob", "pw").await.unwrap();

        assert_eq!(outcome.redirect, Some(Redirect::ChangePassword));
        assert!(sessions.is_first_login());
    }

    #[tokio::test]
    async fn test_login_without_user_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(json!({"token": token(3600)}).to_string())
            .create_async()
            .await;

        let storage = MemoryStore::new();
        let sessions = manager(&server.url(), &storage);
        let err = sessions.login("alice", "pw").await.unwrap_err();

        assert_eq!(
            err,
            AuthError::InvalidCredential("login response is missing user".to_string())
        );
        assert!(sessions.current().is_none());
        assert!(storage.get(SESSION_KEY).unwrap().is_none());
        assert!(!sessions.coordinator().scheduler().is_armed());
    }

    #[tokio::test]
    async fn test_login_with_undecodable_token_clears_previous_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(r#"{"token":"opaque","user":{}}"#)
            .create_async()
            .await;

        let storage = MemoryStore::new();
        let sessions = manager(&server.url(), &storage);
        sessions.store.set(token(600), Default::default()).unwrap();

        let err = sessions.login("alice", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential(_)));
        assert!(sessions.current().is_none());
        assert!(storage.get(SESSION_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_with_out_of_range_expiry_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let absurd = encode_unsigned(&json!({"exp": i64::MIN, "sub": 12}));
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(json!({"token": absurd, "user": {}}).to_string())
            .create_async()
            .await;

        let sessions = manager(&server.url(), &MemoryStore::new());
        let err = sessions.login("alice", "pw").await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredential(_)));
        assert!(!sessions.is_logged_in());
        assert!(!sessions.coordinator().scheduler().is_armed());
    }

    #[tokio::test]
    async fn test_login_rejected_surfaces_normalized_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(401)
            .create_async()
            .await;

        let sessions = manager(&server.url(), &MemoryStore::new());
        let err = sessions.login("alice", "wrong").await.unwrap_err();

        assert_eq!(err, AuthError::Unauthorized("HTTP 401 Unauthorized".to_string()));
        assert_eq!(err.display_message(), "Invalid username or password");
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let mut server = mockito::Server::new_async().await;
        let logout = server
            .mock("POST", "/auth/logout")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let storage = MemoryStore::new();
        let sessions = manager(&server.url(), &storage);
        let issued = token(600);
        let credential = sessions.store.set(issued, Default::default()).unwrap();
        sessions.coordinator().schedule(&credential);

        assert_eq!(sessions.logout().await, Redirect::Login { return_to: None });
        assert!(sessions.current().is_none());
        assert!(!sessions.coordinator().scheduler().is_armed());

        // Second logout: nothing to clear, no backend call, no error
        assert_eq!(sessions.logout().await, Redirect::Login { return_to: None });
        logout.assert_async().await;
    }

    #[tokio::test]
    async fn test_start_restores_valid_session() {
        let storage = MemoryStore::new();
        let first = manager("http://127.0.0.1:9", &storage);
        first.store.set(token(3600), Default::default()).unwrap();

        let second = manager("http://127.0.0.1:9", &storage);
        let restored = second.start().await.unwrap();

        assert_eq!(restored.subject_id, 12);
        assert!(second.is_logged_in());
        assert!(second.coordinator().scheduler().is_armed());
    }

    #[tokio::test]
    async fn test_start_refreshes_expired_session() {
        let mut server = mockito::Server::new_async().await;
        let fresh = token(3600);
        let refresh = server
            .mock("POST", "/auth/refresh-token")
            .with_status(200)
            .with_body(json!({"token": fresh}).to_string())
            .expect(1)
            .create_async()
            .await;

        let storage = MemoryStore::new();
        let first = manager(&server.url(), &storage);
        first.store.set(token(10), Default::default()).unwrap();

        let second = manager(&server.url(), &storage);
        let started = second.start().await.unwrap();

        assert_eq!(started.token, fresh);
        assert!(second.is_logged_in());
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_start_with_nothing_persisted() {
        let sessions = manager("http://127.0.0.1:9", &MemoryStore::new());
        assert!(sessions.start().await.is_none());
        assert!(!sessions.is_logged_in());
    }

    #[tokio::test]
    async fn test_guard_redirects_with_return_path() {
        let storage = MemoryStore::new();
        let sessions = manager("http://127.0.0.1:9", &storage);

        assert_eq!(
            sessions.guard("/protected"),
            Access::Redirect(Redirect::Login {
                return_to: Some("/protected".to_string())
            })
        );

        sessions.store.set(token(600), Default::default()).unwrap();
        assert_eq!(sessions.guard("/protected"), Access::Allow);
    }

    #[tokio::test]
    async fn test_subscribers_see_login_and_logout() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(json!({"token": token(3600), "user": {"name": "alice"}}).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/auth/logout")
            .with_status(200)
            .create_async()
            .await;

        let sessions = manager(&server.url(), &MemoryStore::new());
        let mut sub = sessions.subscribe();
        assert!(sub.next().await.unwrap().is_none());

        sessions.login("alice", "pw").await.unwrap();
        let signed_in = sub.next().await.unwrap().unwrap();
        assert_eq!(signed_in.profile["name"], "alice");

        sessions.logout().await;
        assert!(sub.next().await.unwrap().is_none());
    }
}
