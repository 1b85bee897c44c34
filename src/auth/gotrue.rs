use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{AuthClient, AuthError, AuthUser, Session};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for a GoTrue-compatible auth service (the flavor the
/// marketplace's backend-as-a-service platform exposes).
pub struct GoTrueClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_in: i64,
    expires_at: Option<i64>,
    user: UserPayload,
}

#[derive(Debug, serde::Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

impl GoTrueClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl AuthClient for GoTrueClient {
    async fn current_session(&self, access_token: &str) -> Result<Option<AuthUser>, AuthError> {
        let response = self
            .http
            .get(self.endpoint("/auth/v1/user"))
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let user: UserPayload = response
                    .json()
                    .await
                    .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
                Ok(Some(AuthUser {
                    id: user.id,
                    email: user.email,
                }))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!("bearer token no longer maps to a live session");
                Ok(None)
            }
            status => Err(AuthError::Rejected(format!(
                "user endpoint returned {}",
                status
            ))),
        }
    }

    async fn set_session(
        &self,
        _access_token: &str,
        refresh_token: &str,
    ) -> Result<Option<Session>, AuthError> {
        let response = self
            .http
            .post(self.endpoint("/auth/v1/token?grant_type=refresh_token"))
            .header("apikey", &self.api_key)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let token: TokenPayload = response
                    .json()
                    .await
                    .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
                let expires_at = token
                    .expires_at
                    .or_else(|| Some(Utc::now().timestamp() + token.expires_in));
                Ok(Some(Session {
                    access_token: token.access_token,
                    refresh_token: token.refresh_token,
                    token_type: token.token_type,
                    expires_in: token.expires_in,
                    expires_at,
                    user: AuthUser {
                        id: token.user.id,
                        email: token.user.email,
                    },
                }))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!("refresh token was not accepted");
                Ok(None)
            }
            status => Err(AuthError::Rejected(format!(
                "token endpoint returned {}",
                status
            ))),
        }
    }
}
