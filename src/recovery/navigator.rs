use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use super::lookup::TransactionQuery;

/// Everything the navigator needs to know about how the checkout ended.
#[derive(Debug, Clone, Serialize, ToSchema, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub is_successful: bool,
    pub has_active_subscription: bool,
    /// The user came back without a session and none could be restored.
    pub needs_authentication: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl VerificationOutcome {
    /// A failed outcome that still carries whatever identifiers the callback
    /// had, so the failure page can reference the attempt.
    pub fn failed(query: &TransactionQuery, reason: Option<String>) -> Self {
        Self {
            is_successful: false,
            has_active_subscription: false,
            needs_authentication: false,
            plan_id: query.plan_id.clone(),
            user_id: query.user_id.clone(),
            payment_id: query.payment_id.clone(),
            order_id: query.order_id.clone(),
            failure_reason: reason,
        }
    }
}

/// A frontend destination: path plus query parameters, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub path: &'static str,
    pub params: Vec<(&'static str, String)>,
}

impl RedirectTarget {
    fn new(path: &'static str) -> Self {
        Self {
            path,
            params: Vec::new(),
        }
    }

    fn param(mut self, name: &'static str, value: Option<String>) -> Self {
        if let Some(value) = value {
            self.params.push((name, value));
        }
        self
    }

    /// Absolute URL under the frontend origin.
    pub fn location(&self, base: &str) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.params {
            serializer.append_pair(name, value);
        }
        let query = serializer.finish();
        if query.is_empty() {
            format!("{}{}", base.trim_end_matches('/'), self.path)
        } else {
            format!("{}{}?{}", base.trim_end_matches('/'), self.path, query)
        }
    }
}

const DEFAULT_FAILURE_REASON: &str = "Payment verification failed";

/// Maps a verification outcome to the terminal frontend page.
///
/// Successful payments land on the success page even when subscription
/// activation is still pending, as long as the user is authenticated. A
/// success without a session is flagged so the frontend can prompt a login
/// before showing account details; the user id is withheld on that path.
pub struct PaymentNavigator;

impl PaymentNavigator {
    pub fn route(outcome: &VerificationOutcome) -> RedirectTarget {
        let target = if outcome.is_successful {
            if outcome.needs_authentication && !outcome.has_active_subscription {
                RedirectTarget::new("/payment-success")
                    .param("planId", outcome.plan_id.clone())
                    .param("payment_id", outcome.payment_id.clone())
                    .param("order_id", outcome.order_id.clone())
                    .param("auth_required", Some("true".to_string()))
            } else {
                RedirectTarget::new("/payment-success")
                    .param("planId", outcome.plan_id.clone())
                    .param("userId", outcome.user_id.clone())
                    .param("payment_id", outcome.payment_id.clone())
                    .param("order_id", outcome.order_id.clone())
            }
        } else {
            let reason = outcome
                .failure_reason
                .clone()
                .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());
            RedirectTarget::new("/payment-failed")
                .param("planId", outcome.plan_id.clone())
                .param("reason", Some(reason))
                .param("status", Some("FAILED".to_string()))
                .param("payment_id", outcome.payment_id.clone())
                .param("order_id", outcome.order_id.clone())
        };

        info!(
            path = target.path,
            successful = outcome.is_successful,
            needs_authentication = outcome.needs_authentication,
            "routing checkout to terminal page"
        );
        target
    }
}
