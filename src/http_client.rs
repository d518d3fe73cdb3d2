use anyhow::{Context, Result};
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{bearer_token, RefreshCoordinator, RequestAuthenticator};
use crate::error::AuthError;

/// HTTP client that authorizes requests with the session token and
/// recovers from expired sessions
pub struct SessionHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Attaches the bearer token
    authenticator: RequestAuthenticator,

    /// Single-flight token renewal
    coordinator: Arc<RefreshCoordinator>,
}

impl SessionHttpClient {
    /// Create a new HTTP client
    pub fn new(
        authenticator: RequestAuthenticator,
        coordinator: Arc<RefreshCoordinator>,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, authenticator, coordinator))
    }

    pub fn with_client(
        client: Client,
        authenticator: RequestAuthenticator,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            client,
            authenticator,
            coordinator,
        }
    }

    /// Attach the current session token to `request`
    pub fn authenticate(&self, request: Request) -> Request {
        self.authenticator.authenticate(request)
    }

    /// Authenticate, send, and recover from a 401 once
    pub async fn execute(&self, request: Request) -> Result<Response, AuthError> {
        let request = self.authenticate(request);
        let replay = request.try_clone();

        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            "Sending HTTP request"
        );

        let response = self.send(request).await?;
        self.on_response(replay, response, false).await
    }

    /// Decide what to do with a response.
    ///
    /// Anything but 401 passes through untouched. A 401 on a first attempt
    /// waits for the session to be renewed and replays `replay` once with
    /// the new token; a 401 on a replayed request is surfaced.
    pub async fn on_response(
        &self,
        replay: Option<Request>,
        response: Response,
        retried: bool,
    ) -> Result<Response, AuthError> {
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if retried {
            tracing::warn!(url = %response.url(), "Replayed request was rejected again");
            return Err(unauthorized(response).await);
        }

        let replay = match replay {
            Some(request) if !self.authenticator.endpoints().is_refresh(request.url()) => request,
            Some(_) => {
                tracing::warn!("Refresh endpoint answered 401, not intercepting");
                return Err(unauthorized(response).await);
            }
            None => {
                tracing::warn!(
                    url = %response.url(),
                    "Received 401 for a request that cannot be replayed"
                );
                return Err(unauthorized(response).await);
            }
        };

        tracing::warn!(url = %replay.url(), "Received 401, renewing session and retrying...");

        let sent = bearer_token(&replay);
        let credential = self.coordinator.handle_unauthorized(sent.as_deref()).await?;

        let replay = self.authenticator.authorize_with(replay, &credential.token);
        let response = self.send(replay).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(url = %response.url(), "Replayed request was rejected again");
            return Err(unauthorized(response).await);
        }

        tracing::debug!(status = %response.status(), "Replayed request completed");
        Ok(response)
    }

    async fn send(&self, request: Request) -> Result<Response, AuthError> {
        let url = request.url().clone();

        self.client.execute(request).await.map_err(|e| {
            // Categorize the error for better debugging
            let error_kind = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connection_failed"
            } else if e.is_request() {
                "request_error"
            } else if e.is_body() {
                "body_error"
            } else if e.is_decode() {
                "decode_error"
            } else {
                "unknown"
            };

            tracing::warn!(
                error_kind = error_kind,
                error = %e,
                url = %url,
                "HTTP request error"
            );

            AuthError::transport(&e)
        })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

async fn unauthorized(response: Response) -> AuthError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    AuthError::from_status(status, &body)
}
