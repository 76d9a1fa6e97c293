//! Identity provider clients

use super::{AuthError, AuthResult, IssuerConfig, TokenResponse};
use async_trait::async_trait;
use tracing::debug;

/// Parameters for exchanging an authorization code
#[derive(Debug, Clone, Copy)]
pub struct TokenRequest<'a> {
    pub issuer: &'a IssuerConfig,
    pub code: &'a str,
    pub code_verifier: &'a str,
    pub redirect_uri: &'a str,
    pub nonce: &'a str,
}

/// Client able to redeem an authorization code
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange the code for tokens
    async fn exchange_code(&self, request: TokenRequest<'_>) -> AuthResult<TokenResponse>;
}

/// Token endpoint client over HTTP
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    client_id: String,
}

impl HttpIdentityProvider {
    /// Create a client for the registered `client_id`
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), client_id)
    }

    /// Reuse an existing HTTP client
    pub fn with_client(client: reqwest::Client, client_id: impl Into<String>) -> Self {
        Self {
            client,
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn exchange_code(&self, request: TokenRequest<'_>) -> AuthResult<TokenResponse> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", request.code),
            ("redirect_uri", request.redirect_uri),
            ("code_verifier", request.code_verifier),
            ("client_id", self.client_id.as_str()),
        ];

        debug!(token_endpoint = %request.issuer.token_endpoint, "Exchanging authorization code");
        let response = self
            .client
            .post(&request.issuer.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("malformed token response: {}", e)))
    }
}
