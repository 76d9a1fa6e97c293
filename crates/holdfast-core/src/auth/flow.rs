//! Starting and completing a login

use super::pkce;
use super::{
    AuthError, AuthResult, AuthorizationParams, AuthorizationRequest, IdentityProvider,
    IssuerConfig, LoginRequest, LoginResult, TokenRequest,
};
use crate::storage::SharedStore;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FIELD_REDIRECT_URI: &str = "redirect_uri";
const FIELD_NONCE: &str = "nonce";
const FIELD_CODE_VERIFIER: &str = "code_verifier";
const FIELD_ISSUER_CONFIG: &str = "issuer_config";
const FIELD_TARGET_SERVER_URL: &str = "target_server_url";
const FIELD_IDENTITY_SERVER_URL: &str = "identity_server_url";

const ALL_FIELDS: [&str; 6] = [
    FIELD_REDIRECT_URI,
    FIELD_NONCE,
    FIELD_CODE_VERIFIER,
    FIELD_ISSUER_CONFIG,
    FIELD_TARGET_SERVER_URL,
    FIELD_IDENTITY_SERVER_URL,
];

fn param_key(state: &str, field: &str) -> String {
    format!("oidc_{}_{}", state, field)
}

/// Authorization-code login backed by session storage
#[derive(Debug, Clone)]
pub struct LoginFlow {
    storage: Arc<dyn SharedStore>,
    client_id: String,
}

impl LoginFlow {
    /// Create a flow that keeps its parameters in `storage`
    pub fn new(storage: Arc<dyn SharedStore>, client_id: impl Into<String>) -> Self {
        Self {
            storage,
            client_id: client_id.into(),
        }
    }

    /// Persist fresh login parameters and build the authorization URL
    pub fn start(&self, request: LoginRequest) -> AuthResult<AuthorizationRequest> {
        let params = AuthorizationParams {
            redirect_uri: request.redirect_uri,
            state: pkce::random_token(16),
            nonce: pkce::random_token(16),
            code_verifier: pkce::code_verifier(),
            issuer_config: request.issuer_config,
            target_server_url: request.target_server_url,
            identity_server_url: request.identity_server_url,
        };

        let scope = if request.scope.split_whitespace().any(|s| s == "openid") {
            request.scope
        } else {
            format!("openid {}", request.scope).trim().to_string()
        };

        let challenge = pkce::code_challenge(&params.code_verifier);
        let url = Url::parse_with_params(
            &params.issuer_config.authorization_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", params.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", params.state.as_str()),
                ("nonce", params.nonce.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| AuthError::InvalidIssuerConfig(format!("authorization endpoint: {}", e)))?;

        self.store_params(&params)?;
        info!(issuer = %params.issuer_config.issuer, "Login started");

        Ok(AuthorizationRequest {
            url: url.into(),
            state: params.state,
        })
    }

    /// Validate the redirect back from the provider and redeem the code
    ///
    /// Stored parameters are single-use: they are cleared before the
    /// exchange, whatever its outcome.
    pub async fn complete(
        &self,
        provider: &dyn IdentityProvider,
        query: &HashMap<String, String>,
    ) -> AuthResult<LoginResult> {
        if let Some(error) = query.get("error") {
            let detail = match query.get("error_description") {
                Some(description) => format!("{}: {}", error, description),
                None => error.clone(),
            };
            return Err(AuthError::InvalidQueryParameters(detail));
        }

        let code = non_empty(query.get("code")).ok_or(AuthError::MissingQueryParameters)?;
        let state = non_empty(query.get("state")).ok_or(AuthError::MissingQueryParameters)?;
        if !pkce::is_url_safe_token(state) {
            return Err(AuthError::InvalidQueryParameters(
                "state has unexpected characters".to_string(),
            ));
        }

        let params = self.load_params(state)?;
        self.clear_params(state);

        let tokens = provider
            .exchange_code(TokenRequest {
                issuer: &params.issuer_config,
                code,
                code_verifier: &params.code_verifier,
                redirect_uri: &params.redirect_uri,
                nonce: &params.nonce,
            })
            .await?;

        info!(server_url = %params.target_server_url, "Login completed");
        Ok(LoginResult {
            server_url: params.target_server_url,
            identity_server_url: params.identity_server_url,
            access_token: tokens.access_token,
        })
    }

    /// Read back the parameters stored for `state`
    pub fn load_params(&self, state: &str) -> AuthResult<AuthorizationParams> {
        let required = |field: &str| -> AuthResult<String> {
            match self.storage.get(&param_key(state, field))? {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(AuthError::InvalidStoredParameters(format!(
                    "missing {}",
                    field
                ))),
            }
        };

        let raw_issuer = required(FIELD_ISSUER_CONFIG)?;
        let issuer_config: IssuerConfig = serde_json::from_str(&raw_issuer).map_err(|e| {
            AuthError::InvalidStoredParameters(format!("{}: {}", FIELD_ISSUER_CONFIG, e))
        })?;
        if issuer_config.token_endpoint.is_empty() {
            return Err(AuthError::InvalidStoredParameters(
                "issuer has no token endpoint".to_string(),
            ));
        }

        Ok(AuthorizationParams {
            redirect_uri: required(FIELD_REDIRECT_URI)?,
            state: state.to_string(),
            nonce: required(FIELD_NONCE)?,
            code_verifier: required(FIELD_CODE_VERIFIER)?,
            issuer_config,
            target_server_url: required(FIELD_TARGET_SERVER_URL)?,
            identity_server_url: self
                .storage
                .get(&param_key(state, FIELD_IDENTITY_SERVER_URL))?
                .filter(|v| !v.is_empty()),
        })
    }

    fn store_params(&self, params: &AuthorizationParams) -> AuthResult<()> {
        let issuer = serde_json::to_string(&params.issuer_config)
            .map_err(|e| AuthError::InvalidIssuerConfig(e.to_string()))?;
        let state = params.state.as_str();

        self.storage
            .set(&param_key(state, FIELD_REDIRECT_URI), &params.redirect_uri)?;
        self.storage.set(&param_key(state, FIELD_NONCE), &params.nonce)?;
        self.storage
            .set(&param_key(state, FIELD_CODE_VERIFIER), &params.code_verifier)?;
        self.storage
            .set(&param_key(state, FIELD_ISSUER_CONFIG), &issuer)?;
        self.storage.set(
            &param_key(state, FIELD_TARGET_SERVER_URL),
            &params.target_server_url,
        )?;
        if let Some(identity) = &params.identity_server_url {
            self.storage
                .set(&param_key(state, FIELD_IDENTITY_SERVER_URL), identity)?;
        }
        debug!(state = %state, "Stored login parameters");
        Ok(())
    }

    fn clear_params(&self, state: &str) {
        for field in ALL_FIELDS {
            if let Err(e) = self.storage.delete(&param_key(state, field)) {
                warn!(field = field, error = %e, "Failed to clear login parameter");
            }
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}
