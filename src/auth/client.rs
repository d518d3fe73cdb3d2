// Auth endpoint calls: login, refresh and logout notification

use anyhow::Context;
use reqwest::{Client, Url};
use std::time::Duration;

use super::token::redact;
use super::types::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse};
use crate::error::AuthError;

/// Default endpoint paths, relative to the API base URL
pub const DEFAULT_LOGIN_PATH: &str = "auth/login";
pub const DEFAULT_REFRESH_PATH: &str = "auth/refresh-token";
pub const DEFAULT_LOGOUT_PATH: &str = "auth/logout";

/// Resolved auth endpoint URLs
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub login: Url,
    pub refresh: Url,
    pub logout: Url,
}

impl AuthEndpoints {
    /// Join endpoint paths onto `base_url`
    pub fn new(
        base_url: &str,
        login_path: &str,
        refresh_path: &str,
        logout_path: &str,
    ) -> anyhow::Result<Self> {
        // Without a trailing slash `join` would replace the last path segment
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base = Url::parse(&base).with_context(|| format!("Invalid base URL: {}", base_url))?;

        let join = |path: &str| {
            base.join(path.trim_start_matches('/'))
                .with_context(|| format!("Invalid endpoint path: {}", path))
        };

        Ok(Self {
            login: join(login_path)?,
            refresh: join(refresh_path)?,
            logout: join(logout_path)?,
        })
    }

    /// Endpoints at their default paths
    pub fn with_defaults(base_url: &str) -> anyhow::Result<Self> {
        Self::new(
            base_url,
            DEFAULT_LOGIN_PATH,
            DEFAULT_REFRESH_PATH,
            DEFAULT_LOGOUT_PATH,
        )
    }

    /// Whether `url` targets the refresh endpoint
    pub fn is_refresh(&self, url: &Url) -> bool {
        url.path() == self.refresh.path()
    }
}

/// Client for the auth endpoints.
///
/// Requests made here never pass through the request authenticator, so a
/// failing refresh cannot trigger authorization handling on itself.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    endpoints: AuthEndpoints,
}

impl AuthClient {
    pub fn new(endpoints: AuthEndpoints, connect_timeout: u64, request_timeout: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, endpoints })
    }

    /// Share an existing connection pool
    pub fn with_client(client: Client, endpoints: AuthEndpoints) -> Self {
        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Exchange username and password for a token and user payload
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        tracing::info!(username = %username, "Logging in...");

        let response = self
            .client
            .post(self.endpoints.login.clone())
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| AuthError::transport(&e))?;

        let response = check_response(response).await?;
        response
            .json::<LoginResponse>()
            .await
            .map_err(|e| AuthError::InvalidCredential(format!("login response is not valid JSON: {}", e)))
    }

    /// Exchange the current token for a new one
    pub async fn refresh(&self, token: &str) -> Result<RefreshResponse, AuthError> {
        tracing::info!(token = %redact(token), "Refreshing session token...");

        let response = self
            .client
            .post(self.endpoints.refresh.clone())
            .json(&RefreshRequest { token })
            .send()
            .await
            .map_err(|e| AuthError::transport(&e))?;

        let response = check_response(response).await?;
        response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| AuthError::InvalidCredential(format!("refresh response is not valid JSON: {}", e)))
    }

    /// Tell the backend the session is over. Failures are logged and ignored.
    pub async fn notify_logout(&self, token: Option<&str>) {
        let mut request = self
            .client
            .post(self.endpoints.logout.clone())
            .json(&serde_json::json!({}));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("Backend acknowledged logout");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "Logout notification rejected, ignoring");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Logout notification failed, ignoring");
            }
        }
    }
}

async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = %status, "Auth endpoint returned error response");
    Err(AuthError::from_status(status, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_join_base_path() {
        let endpoints = AuthEndpoints::with_defaults("https://api.example.com/api").unwrap();
        assert_eq!(endpoints.login.as_str(), "https://api.example.com/api/auth/login");
        assert_eq!(
            endpoints.refresh.as_str(),
            "https://api.example.com/api/auth/refresh-token"
        );
        assert_eq!(endpoints.logout.as_str(), "https://api.example.com/api/auth/logout");
    }

    #[test]
    fn test_endpoints_accept_leading_slash_and_trailing_base_slash() {
        let endpoints =
            AuthEndpoints::new("http://localhost:8080/", "/login", "/token/renew", "/logout").unwrap();
        assert_eq!(endpoints.refresh.as_str(), "http://localhost:8080/token/renew");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(AuthEndpoints::with_defaults("not a url").is_err());
    }

    #[test]
    fn test_is_refresh_matches_path_only() {
        let endpoints = AuthEndpoints::with_defaults("https://api.example.com").unwrap();
        let refresh = Url::parse("https://api.example.com/auth/refresh-token?x=1").unwrap();
        let other = Url::parse("https://api.example.com/users").unwrap();
        assert!(endpoints.is_refresh(&refresh));
        assert!(!endpoints.is_refresh(&other));
    }

    #[tokio::test]
    async fn test_refresh_posts_token_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh-token")
            .match_body(mockito::Matcher::Json(serde_json::json!({"token": "old"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"new"}"#)
            .create_async()
            .await;

        let client = AuthClient::new(AuthEndpoints::with_defaults(&server.url()).unwrap(), 5, 5).unwrap();
        let response = client.refresh("old").await.unwrap();

        assert_eq!(response.token.as_deref(), Some("new"));
        assert!(response.user.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_error_uses_payload_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(400)
            .with_body(r#"{"message":"Username is required"}"#)
            .create_async()
            .await;

        let client = AuthClient::new(AuthEndpoints::with_defaults(&server.url()).unwrap(), 5, 5).unwrap();
        let err = client.login("", "pw").await.unwrap_err();

        assert_eq!(
            err,
            AuthError::Rejected {
                status: 400,
                message: "Username is required".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_notify_logout_ignores_failures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/logout")
            .match_header("authorization", "Bearer tok")
            .with_status(500)
            .create_async()
            .await;

        let client = AuthClient::new(AuthEndpoints::with_defaults(&server.url()).unwrap(), 5, 5).unwrap();
        client.notify_logout(Some("tok")).await;
        mock.assert_async().await;

        // Unreachable backend is ignored as well
        let dead = AuthClient::new(AuthEndpoints::with_defaults("http://127.0.0.1:9").unwrap(), 1, 1).unwrap();
        dead.notify_logout(None).await;
    }
}
