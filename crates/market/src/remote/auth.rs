//! OAuth2 token endpoint client
//!
//! Exchanges authorization codes and refresh tokens for access tokens.
//! Uses synchronous HTTP (ureq) to be executor-agnostic; callers run it on
//! worker threads or the inbound request's own thread.

use std::time::Duration;

use super::api::{OAuthErrorBody, TokenResponse};
use super::{ApiError, TokenEndpoint, TokenGrant};

/// OAuth client for the marketplace token endpoint
pub struct OAuthClient {
    agent: ureq::Agent,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    /// Create a client for `token_url` using the application's credentials
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl TokenEndpoint for OAuthClient {
    fn exchange(&self, grant: TokenGrant<'_>) -> Result<TokenResponse, ApiError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        match grant {
            TokenGrant::AuthorizationCode { code, redirect_uri } => {
                form.push(("grant_type", "authorization_code"));
                form.push(("code", code));
                form.push(("redirect_uri", redirect_uri));
            }
            TokenGrant::RefreshToken(refresh_token) => {
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", refresh_token));
            }
        }

        let mut response = self
            .agent
            .post(self.token_url.as_str())
            .header("Accept", "application/json")
            .send_form(form)
            .map_err(|e| ApiError::Transient(format!("token request failed: {}", e)))?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            let mut token: TokenResponse = response
                .body_mut()
                .read_json()
                .map_err(|e| ApiError::Decode(format!("token response: {}", e)))?;

            // Keep the caller's refresh token when the endpoint does not rotate it
            if token.refresh_token.is_none()
                && let TokenGrant::RefreshToken(previous) = grant
            {
                token.refresh_token = Some(previous.to_string());
            }
            return Ok(token);
        }

        let body = response.body_mut().read_to_string().unwrap_or_default();
        Err(classify_token_failure(status, &body))
    }
}

/// Map a failed token-endpoint response onto the error taxonomy.
///
/// Only an explicit `invalid_grant`/`invalid_token` marks the refresh token
/// as burned; a bare 400 without that code may be a misconfigured client and
/// must not lock the seller out.
pub(crate) fn classify_token_failure(status: u16, body: &str) -> ApiError {
    let parsed: Option<OAuthErrorBody> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|b| b.error.as_deref());

    match (status, code) {
        (400 | 401, Some("invalid_grant" | "invalid_token")) => {
            let message = parsed
                .as_ref()
                .and_then(|b| b.message.clone())
                .unwrap_or_else(|| "invalid_grant".to_string());
            ApiError::InvalidGrant(message)
        }
        (429 | 500..=599, _) => ApiError::Transient(format!("HTTP {}", status)),
        _ => ApiError::Rejected {
            status,
            body: body.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_grant_is_terminal() {
        let body = r#"{"message":"Error validating grant. Your authorization code or refresh token may be expired or it was already used","error":"invalid_grant","status":400,"cause":[]}"#;
        match classify_token_failure(400, body) {
            ApiError::InvalidGrant(message) => assert!(message.contains("validating grant")),
            other => panic!("expected InvalidGrant, got {:?}", other),
        }
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert!(classify_token_failure(502, "<html>bad gateway</html>").is_transient());
        assert!(classify_token_failure(429, "").is_transient());
    }

    #[test]
    fn test_other_client_errors_are_rejected() {
        let body = r#"{"error":"invalid_client","message":"invalid client_id or client_secret"}"#;
        assert!(matches!(
            classify_token_failure(400, body),
            ApiError::Rejected { status: 400, .. }
        ));
    }
}
