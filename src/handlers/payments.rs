use crate::errors::ServiceError;
use crate::recovery::backup::BackupRequest;
use crate::recovery::lookup::{AutoLoginResult, RecoveryLookupResult, TransactionQuery};
use crate::recovery::navigator::{PaymentNavigator, VerificationOutcome};
use crate::recovery::restore::RestoreOutcome;
use crate::AppState;
use crate::ApiResponse;
use axum::{
    extract::{Json, Query, State},
    http::{header, HeaderMap},
    response::Redirect,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "refresh_token": "v1.MRjzC0aE...",
    "user_id": "8f14e45f-ceea-4672-865e-0a5c9b2b1f11",
    "plan_id": "plan-pro-monthly",
    "order_id": "5O190127TN364715T",
    "user_email": "jane@example.com"
}))]
pub struct BackupSessionRequest {
    /// Refresh token to stash alongside the access token
    #[validate(length(min = 1))]
    pub refresh_token: String,

    /// User about to leave for the payment page
    #[validate(length(min = 1))]
    pub user_id: String,
    /// Plan being purchased
    #[validate(length(min = 1))]
    pub plan_id: String,
    /// Provider order id for this checkout
    #[validate(length(min = 1))]
    pub order_id: String,
    /// Email shown on the recovery page, if known
    #[validate(email)]
    pub user_email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BackupSessionResponse {
    /// Whether at least one recovery record was written
    pub backed_up: bool,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "order_id": "5O190127TN364715T"
}))]
pub struct RecoveryLookupRequest {
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub user_id: Option<String>,
    pub plan_id: Option<String>,
}

impl RecoveryLookupRequest {
    fn into_query(self) -> TransactionQuery {
        TransactionQuery {
            order_id: self.order_id.filter(|s| !s.is_empty()),
            payment_id: self.payment_id.filter(|s| !s.is_empty()),
            user_id: self.user_id.filter(|s| !s.is_empty()),
            plan_id: self.plan_id.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "order_id": "5O190127TN364715T",
    "email": "jane@example.com"
}))]
pub struct AutoLoginRequest {
    #[validate(length(min = 1))]
    pub order_id: String,
    #[validate(email)]
    pub email: String,
}

// Handler functions

/// Back up the current session before the payment redirect
#[utoipa::path(
    post,
    path = "/api/v1/payments/backup",
    request_body = BackupSessionRequest,
    responses(
        (status = 200, description = "Backup attempted", body = crate::ApiResponse<BackupSessionResponse>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payment Recovery"
)]
pub async fn backup_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BackupSessionRequest>,
) -> Result<Json<ApiResponse<BackupSessionResponse>>, ServiceError> {
    request.validate()?;

    let Some(access_token) = super::bearer_token(&headers) else {
        return Err(ServiceError::Unauthorized(
            "Missing bearer token".to_string(),
        ));
    };

    let client_info = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let backed_up = state
        .services
        .backup
        .backup(BackupRequest {
            access_token: access_token.to_string(),
            refresh_token: request.refresh_token,
            user_id: request.user_id,
            plan_id: request.plan_id,
            order_id: request.order_id,
            user_email: request.user_email,
            client_info,
        })
        .await;

    Ok(Json(ApiResponse::success(BackupSessionResponse {
        backed_up,
    })))
}

/// Provider return redirect: verify the payment and route to the frontend
#[utoipa::path(
    get,
    path = "/api/v1/payments/callback",
    params(
        ("token" = Option<String>, Query, description = "Provider order id"),
        ("paymentId" = Option<String>, Query, description = "Provider payment id"),
        ("PayerID" = Option<String>, Query, description = "Provider payer id"),
        ("success" = Option<bool>, Query, description = "Provider success flag"),
        ("plan_id" = Option<String>, Query, description = "Plan id, when the redirect carried one"),
        ("user_id" = Option<String>, Query, description = "User id, when the redirect carried one")
    ),
    responses(
        (status = 307, description = "Redirect to the frontend terminal page"),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse)
    ),
    tag = "Payment Recovery"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Redirect {
    let params = state.services.extractor.extract(&query).await;
    debug!(
        valid = params.is_valid_payment_callback,
        session_independent = params.has_session_independent_data,
        "payment callback received"
    );

    let tx_query = TransactionQuery {
        order_id: params.order_id.clone(),
        payment_id: params.payment_id.clone(),
        user_id: params.user_id.clone(),
        plan_id: params.plan_id.clone(),
    };

    // Nothing identifies this payment; there is no verification to attempt.
    if !params.is_valid_payment_callback && !params.has_session_independent_data {
        let outcome = VerificationOutcome::failed(
            &tx_query,
            Some("Missing payment information".to_string()),
        );
        let target = PaymentNavigator::route(&outcome);
        return Redirect::temporary(&target.location(&state.config.frontend_base_url));
    }

    // Re-establish the session when the checkout has one to recover.
    let needs_authentication = match params.order_id.as_deref() {
        Some(order_id) => {
            let outcome = state
                .services
                .restorer
                .restore(order_id, super::bearer_token(&headers))
                .await;
            if let RestoreOutcome::Failed = outcome {
                info!(
                    session_independent = params.has_session_independent_data,
                    "callback arrived without a recoverable session"
                );
                true
            } else {
                false
            }
        }
        None => true,
    };

    let outcome = state
        .services
        .recovery
        .verify(&tx_query, needs_authentication)
        .await;
    let target = PaymentNavigator::route(&outcome);
    Redirect::temporary(&target.location(&state.config.frontend_base_url))
}

/// Look up a completed payment without a session
#[utoipa::path(
    post,
    path = "/api/v1/payments/recovery",
    request_body = RecoveryLookupRequest,
    responses(
        (status = 200, description = "Lookup result", body = crate::ApiResponse<crate::recovery::lookup::RecoveryLookupResult>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse)
    ),
    tag = "Payment Recovery"
)]
pub async fn recovery_lookup(
    State(state): State<AppState>,
    Json(request): Json<RecoveryLookupRequest>,
) -> Result<Json<ApiResponse<RecoveryLookupResult>>, ServiceError> {
    let query = request.into_query();
    if query.order_id.is_none()
        && query.payment_id.is_none()
        && (query.user_id.is_none() || query.plan_id.is_none())
    {
        return Err(ServiceError::BadRequest(
            "Provide an order id, a payment id, or a user and plan id".to_string(),
        ));
    }

    let result = state.services.recovery.lookup(&query).await;
    Ok(Json(ApiResponse::success(result)))
}

/// Attempt to log the recovered user back in from the session backup
#[utoipa::path(
    post,
    path = "/api/v1/payments/recovery/login",
    request_body = AutoLoginRequest,
    responses(
        (status = 200, description = "Auto-login result", body = crate::ApiResponse<crate::recovery::lookup::AutoLoginResult>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse)
    ),
    tag = "Payment Recovery"
)]
pub async fn recovery_auto_login(
    State(state): State<AppState>,
    Json(request): Json<AutoLoginRequest>,
) -> Result<Json<ApiResponse<AutoLoginResult>>, ServiceError> {
    request.validate()?;

    let result = state
        .services
        .recovery
        .attempt_auto_login(&request.order_id, &request.email)
        .await;
    Ok(Json(ApiResponse::success(result)))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/backup", post(backup_session))
        .route("/callback", get(payment_callback))
        .route("/recovery", post(recovery_lookup))
        .route("/recovery/login", post(recovery_auto_login))
}
