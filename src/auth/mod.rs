/*!
 * # Auth Client
 *
 * All credential handling is delegated to the marketplace's external auth
 * service. This module defines the session model and the narrow client
 * surface the recovery flow needs: checking whether a bearer token still
 * maps to a live session, and re-establishing a session from a backed-up
 * token pair.
 */

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

mod gotrue;

pub use gotrue::GoTrueClient;

/// Auth client errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth service unreachable: {0}")]
    Transport(String),
    #[error("auth service rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected auth response: {0}")]
    InvalidResponse(String),
}

/// The user identity attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

/// An authenticated session as issued by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl Session {
    pub fn new(access_token: String, refresh_token: String, expires_in: i64, user: AuthUser) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            expires_in,
            expires_at: Some(Utc::now().timestamp() + expires_in),
            user,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Utc::now().timestamp() >= at)
            .unwrap_or(false)
    }
}

/// Client for the external auth service.
///
/// Implementations must map "the token is simply invalid/expired" to
/// `Ok(None)` and reserve `Err` for transport and protocol failures, so
/// callers can distinguish a dead session from a dead service.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Validate a bearer token against the auth service.
    async fn current_session(&self, access_token: &str) -> Result<Option<AuthUser>, AuthError>;

    /// Re-establish a session from a backed-up token pair.
    async fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<Option<Session>, AuthError>;
}
