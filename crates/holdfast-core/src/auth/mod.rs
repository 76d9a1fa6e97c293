//! OIDC authorization-code login flow
//!
//! Runs alongside the session lock but never touches it. Starting a login
//! stores the transient parameters (redirect target, nonce, PKCE verifier,
//! issuer metadata) in session-scoped storage keyed by the `state` value;
//! completing it validates the callback, reloads those parameters, and
//! exchanges the authorization code for an access token.
//!
//! A failed login cannot be resumed: the caller starts over.
//!
//! # Example
//!
//! ```ignore
//! use holdfast_core::auth::{HttpIdentityProvider, LoginFlow, LoginRequest};
//!
//! let flow = LoginFlow::new(session_store, "my-client-id");
//! let request = flow.start(LoginRequest { ... })?;
//! open_browser(&request.url);
//!
//! // ... later, on the redirect back:
//! let provider = HttpIdentityProvider::new("my-client-id");
//! let login = flow.complete(&provider, &callback_query).await?;
//! ```

pub mod flow;
pub mod pkce;
pub mod provider;

pub use flow::LoginFlow;
pub use provider::{HttpIdentityProvider, IdentityProvider, TokenRequest};

use crate::storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for login operations
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Login flow errors
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// The callback lacks `code` or `state`
    #[error("Login callback is missing required query parameters")]
    MissingQueryParameters,

    /// The callback carries an error or a malformed value
    #[error("Login callback has invalid query parameters: {0}")]
    InvalidQueryParameters(String),

    /// Nothing usable was stored for the callback's `state`
    #[error("Stored login parameters are missing or invalid: {0}")]
    InvalidStoredParameters(String),

    /// The identity provider metadata cannot be used
    #[error("Invalid issuer configuration: {0}")]
    InvalidIssuerConfig(String),

    /// The identity provider refused or failed the code exchange
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Session storage failed
    #[error("Login storage error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Get error code for this login error
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingQueryParameters => "E500",
            Self::InvalidQueryParameters(_) => "E501",
            Self::InvalidStoredParameters(_) => "E502",
            Self::InvalidIssuerConfig(_) => "E503",
            Self::TokenExchange(_) => "E504",
            Self::Store(_) => "E505",
        }
    }
}

/// Identity provider metadata needed to run the flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerConfig {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

/// Input for starting a login
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub redirect_uri: String,
    pub issuer_config: IssuerConfig,
    /// Server the resulting token is for
    pub target_server_url: String,
    pub identity_server_url: Option<String>,
    /// Space-separated scopes; `openid` is always requested
    pub scope: String,
}

/// Everything persisted between starting and completing a login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationParams {
    pub redirect_uri: String,
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub issuer_config: IssuerConfig,
    pub target_server_url: String,
    pub identity_server_url: Option<String>,
}

/// Where to send the user to authorize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Successful token endpoint response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Outcome of a completed login
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginResult {
    pub server_url: String,
    pub identity_server_url: Option<String>,
    pub access_token: String,
}
