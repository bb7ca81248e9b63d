//! The bearer-token seam of the streamable HTTP server.
//!
//! OAuth flows live outside this crate; the transport only needs a
//! verifier that turns an `Authorization: Bearer` credential into a
//! [`TokenInfo`] handed to request handlers via their context extensions.

use std::time::SystemTime;

use futures::future::BoxFuture;

use crate::model::JsonObject;

/// What a verifier learned about a presented token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenInfo {
    pub scopes: Vec<String>,
    pub expiration: Option<SystemTime>,
    /// Verifier-specific claims (subject, issuer, audience, ...).
    pub extra: JsonObject,
}

/// A rejected token, rendered as a 401 with `WWW-Authenticate`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TokenVerifyError {
    pub message: String,
    /// Value of the `WWW-Authenticate` response header; a bare `Bearer`
    /// challenge when unset.
    pub www_authenticate: Option<String>,
}

impl TokenVerifyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            www_authenticate: None,
        }
    }

    pub fn with_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.www_authenticate = Some(challenge.into());
        self
    }
}

/// Validates bearer tokens for every HTTP request of a session.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<TokenInfo, TokenVerifyError>>;
}
