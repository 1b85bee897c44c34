/*!
 * # Checkout Recovery
 *
 * The checkout round trip leaves the application entirely: the browser is
 * redirected to the external payment page and may come back with its session
 * gone. This module owns everything needed to pick the checkout narrative
 * back up on return:
 *
 * - [`backup::SessionBackupStore`] stashes tokens and payment context before
 *   the redirect, across two redundant storage areas.
 * - [`restore::SessionRestorer`] re-establishes the session on return, with
 *   a bounded, backoff-spaced retry loop.
 * - [`callback::CallbackParameterExtractor`] normalizes the provider's
 *   redirect parameters and backfills gaps from cached context.
 * - [`lookup::PaymentRecoveryService`] is the last-resort path: confirm the
 *   payment from the transaction store without a session.
 * - [`navigator::PaymentNavigator`] picks the terminal frontend page.
 *
 * Recovery records are scoped by order id, the one identifier that reliably
 * survives the provider round trip.
 */

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageArea;

pub mod backup;
pub mod callback;
pub mod lookup;
pub mod navigator;
pub mod restore;

/// Payment-provider token; forced cleanup sweeps any key containing it.
pub const PROVIDER_TOKEN: &str = "paypal";

/// Backups older than this must never be replayed.
pub const BACKUP_TTL_MINUTES: i64 = 60;

/// Cap on session-restoration attempts for a single backup record,
/// persisted across requests.
pub const MAX_RESTORE_ATTEMPTS: u32 = 5;

/// Storage keys, scoped by the checkout's order id.
pub mod keys {
    fn scoped(order_id: &str, name: &str) -> String {
        format!("checkout:{}:{}", order_id, name)
    }

    pub fn session_backup(order_id: &str) -> String {
        scoped(order_id, "session_backup")
    }

    pub fn payment_context(order_id: &str) -> String {
        scoped(order_id, "payment_context")
    }

    pub fn fallback_data(order_id: &str) -> String {
        scoped(order_id, "fallback_data")
    }

    pub fn restore_attempts(order_id: &str) -> String {
        scoped(order_id, "restore_attempts")
    }

    pub fn callback_preservation(order_id: &str) -> String {
        scoped(order_id, "callback_preservation")
    }

    /// Single-key record written by earlier versions of the checkout flow.
    pub fn legacy_payment_data(order_id: &str) -> String {
        format!("paypal_payment_data:{}", order_id)
    }
}

/// Cached copy of the authenticated session, written before navigating away
/// to the payment page. Read once during restoration, then deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionBackup {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionBackup {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.timestamp > Duration::minutes(BACKUP_TTL_MINUTES)
    }
}

/// Non-secret identifiers needed to resume the checkout narrative
/// independent of auth state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentContext {
    pub user_id: String,
    pub plan_id: String,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    /// Caller's user agent, kept for support diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
    /// Which storage area the session backup landed in.
    pub backup_method: StorageArea,
}

/// Minimal subset of [`PaymentContext`] stored without requiring a prior
/// authenticated session, for degraded recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackData {
    pub user_id: String,
    pub plan_id: String,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Identifiers re-persisted by the callback extractor so a later pass can
/// recover them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreservedCallback {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// Identifier record from earlier versions of the checkout flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyPaymentData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// Read a JSON record from the redundant store. Both areas are consulted in
/// order; an unparseable record is skipped rather than masking a usable copy
/// in the other area, and counts as absent only when no area holds one.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    store: &crate::storage::RedundantStore,
    key: &str,
) -> Option<T> {
    for raw in store.get_all(key).await {
        match serde_json::from_str(&raw) {
            Ok(value) => return Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "skipping unparseable recovery record");
            }
        }
    }
    None
}

/// Truncate an identifier for logging: first 8 characters only.
pub fn redact_id(id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    if prefix.len() < id.len() {
        format!("{}***", prefix)
    } else {
        prefix
    }
}

/// Redact an email for logging: domain only.
pub fn redact_email(email: &str) -> String {
    match email.split_once('@') {
        Some((_, domain)) => format!("***@{}", domain),
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_within_ttl_is_not_expired() {
        let backup = SessionBackup {
            access_token: "a".into(),
            refresh_token: "r".into(),
            user_id: "u".into(),
            timestamp: Utc::now() - Duration::minutes(59),
        };
        assert!(!backup.is_expired(Utc::now()));
    }

    #[test]
    fn backup_older_than_sixty_minutes_is_expired() {
        let backup = SessionBackup {
            access_token: "a".into(),
            refresh_token: "r".into(),
            user_id: "u".into(),
            timestamp: Utc::now() - Duration::minutes(61),
        };
        assert!(backup.is_expired(Utc::now()));
    }

    #[test]
    fn long_ids_are_truncated_for_logging() {
        assert_eq!(redact_id("1234567890abcdef"), "12345678***");
        assert_eq!(redact_id("short"), "short");
    }

    #[test]
    fn emails_are_reduced_to_their_domain() {
        assert_eq!(redact_email("jane@example.com"), "***@example.com");
        assert_eq!(redact_email("not-an-email"), "***");
    }
}
