use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::AuthClient;
use crate::storage::RedundantStore;

use super::{keys, read_json, redact_id, FallbackData, PaymentContext, SessionBackup, PROVIDER_TOKEN};

/// Everything the caller knows at the moment it is about to leave for the
/// external payment page.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub plan_id: String,
    pub order_id: String,
    pub user_email: Option<String>,
    pub client_info: Option<String>,
}

/// Stashes the current session and payment intent before the user leaves the
/// application, so both can be restored if the browser loses its session
/// during the provider round trip.
///
/// Side effects are confined to the recovery store; failures are absorbed
/// and reported through the returned boolean, never raised.
pub struct SessionBackupStore {
    store: Arc<RedundantStore>,
    auth: Arc<dyn AuthClient>,
}

impl SessionBackupStore {
    pub fn new(store: Arc<RedundantStore>, auth: Arc<dyn AuthClient>) -> Self {
        Self { store, auth }
    }

    /// Persist the session backup, payment context, and fallback record.
    /// Returns whether any backup was written.
    pub async fn backup(&self, request: BackupRequest) -> bool {
        let order_id = request.order_id.clone();
        let mut wrote_any = false;

        // The session backup and its context only make sense for a live
        // session; the auth client is the authority on that.
        let live = match self.auth.current_session(&request.access_token).await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "could not verify session before backup");
                None
            }
        };

        if let Some(user) = live {
            let backup = SessionBackup {
                access_token: request.access_token.clone(),
                refresh_token: request.refresh_token.clone(),
                user_id: user.id.clone(),
                timestamp: Utc::now(),
            };
            match serde_json::to_string(&backup) {
                Ok(encoded) => match self
                    .store
                    .put_recording(&keys::session_backup(&order_id), &encoded)
                    .await
                {
                    Ok(area) => {
                        wrote_any = true;
                        let context = PaymentContext {
                            user_id: user.id.clone(),
                            plan_id: request.plan_id.clone(),
                            order_id: order_id.clone(),
                            timestamp: backup.timestamp,
                            user_email: request.user_email.clone().or(user.email),
                            client_info: request.client_info.clone(),
                            backup_method: area,
                        };
                        if let Ok(encoded) = serde_json::to_string(&context) {
                            if let Err(e) = self
                                .store
                                .put_recording(&keys::payment_context(&order_id), &encoded)
                                .await
                            {
                                warn!(error = %e, "payment context write failed");
                            }
                        }
                        info!(
                            user_id = %redact_id(&user.id),
                            order_id = %order_id,
                            area = ?area,
                            "session backed up before payment redirect"
                        );
                    }
                    Err(e) => warn!(error = %e, "session backup write failed"),
                },
                Err(e) => warn!(error = %e, "session backup could not be encoded"),
            }
        } else {
            debug!(order_id = %order_id, "no live session to back up");
        }

        // The fallback record is needed even if the user ultimately has no
        // restorable session, so it is written to both areas unconditionally.
        let fallback = FallbackData {
            user_id: request.user_id,
            plan_id: request.plan_id,
            order_id: order_id.clone(),
            timestamp: Utc::now(),
        };
        match serde_json::to_string(&fallback) {
            Ok(encoded) => {
                if self
                    .store
                    .put_both(&keys::fallback_data(&order_id), &encoded)
                    .await
                    .is_ok()
                {
                    wrote_any = true;
                }
            }
            Err(e) => warn!(error = %e, "fallback data could not be encoded"),
        }

        wrote_any
    }

    pub async fn get_session_backup(&self, order_id: &str) -> Option<SessionBackup> {
        read_json(&self.store, &keys::session_backup(order_id)).await
    }

    pub async fn get_payment_context(&self, order_id: &str) -> Option<PaymentContext> {
        read_json(&self.store, &keys::payment_context(order_id)).await
    }

    pub async fn get_fallback_data(&self, order_id: &str) -> Option<FallbackData> {
        read_json(&self.store, &keys::fallback_data(order_id)).await
    }

    /// Whether a session backup exists for this checkout.
    pub async fn has_backup(&self, order_id: &str) -> bool {
        self.store.contains(&keys::session_backup(order_id)).await
    }

    /// Whether anything at all is left to recover from for this checkout.
    pub async fn has_any_recovery_data(&self, order_id: &str) -> bool {
        self.store.contains(&keys::session_backup(order_id)).await
            || self.store.contains(&keys::payment_context(order_id)).await
            || self.store.contains(&keys::fallback_data(order_id)).await
    }

    /// Remove this component's records for the checkout. Non-forced cleanup
    /// preserves the attempt counter (it is reset separately on success);
    /// forced cleanup also removes it and sweeps any key whose name contains
    /// the payment-provider token, as a safety net against orphaned state
    /// from earlier versions.
    pub async fn cleanup(&self, order_id: &str, force: bool) {
        self.store.remove(&keys::session_backup(order_id)).await;
        self.store.remove(&keys::payment_context(order_id)).await;
        self.store.remove(&keys::fallback_data(order_id)).await;
        self.store
            .remove(&keys::callback_preservation(order_id))
            .await;

        if force {
            self.store.remove(&keys::restore_attempts(order_id)).await;
            for key in self.store.keys_containing(PROVIDER_TOKEN).await {
                self.store.remove(&key).await;
            }
        }

        debug!(order_id = %order_id, force, "recovery state cleaned up");
    }
}
