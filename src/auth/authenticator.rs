// Outbound request authentication

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Request;
use std::sync::Arc;

use super::client::AuthEndpoints;
use super::store::CredentialStore;

const BEARER_PREFIX: &str = "Bearer ";

/// Attaches the session bearer token to outbound requests
#[derive(Clone)]
pub struct RequestAuthenticator {
    store: Arc<CredentialStore>,
    endpoints: AuthEndpoints,
}

impl RequestAuthenticator {
    pub fn new(store: Arc<CredentialStore>, endpoints: AuthEndpoints) -> Self {
        Self { store, endpoints }
    }

    /// Attach the current token, if there is one
    pub fn authenticate(&self, request: Request) -> Request {
        match self.store.token() {
            Some(token) => self.authorize_with(request, &token),
            None => request,
        }
    }

    /// Attach a specific token.
    ///
    /// Requests to the refresh endpoint are never modified.
    pub fn authorize_with(&self, mut request: Request, token: &str) -> Request {
        if self.endpoints.is_refresh(request.url()) {
            return request;
        }

        match HeaderValue::from_str(&format!("{}{}", BEARER_PREFIX, token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => {
                tracing::warn!("Session token is not a valid header value, sending request without it");
            }
        }
        request
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }
}

/// Token carried in a request's `Authorization: Bearer` header
pub fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::to_string)
}
