use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::auth::{AuthClient, AuthUser, Session};
use crate::storage::RedundantStore;

use super::backup::SessionBackupStore;
use super::{keys, redact_id, PaymentContext, MAX_RESTORE_ATTEMPTS};

/// Result of a restoration pass. Failures carry no detail beyond the fact of
/// failure; auth-client errors never cross this boundary.
#[derive(Debug)]
pub enum RestoreOutcome {
    /// A live session already existed; backup state was discarded.
    AlreadyLive(AuthUser),
    /// The session was re-established from the backup record.
    Restored {
        session: Session,
        context: Option<PaymentContext>,
    },
    /// No session could be re-established.
    Failed,
}

impl RestoreOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RestoreOutcome::Failed)
    }
}

/// Re-establishes an authenticated session after the return from the
/// external payment redirect.
///
/// The attempt counter is persisted in the recovery store so the cap holds
/// across repeated callbacks for the same checkout. It is read-modified-
/// written without cross-request locking; concurrent callbacks racing
/// through recovery can each increment it independently and exceed the
/// intended cap. Accepted limitation: the data is a self-expiring cache and
/// the counter only bounds wasted work.
pub struct SessionRestorer {
    store: Arc<RedundantStore>,
    backup: Arc<SessionBackupStore>,
    auth: Arc<dyn AuthClient>,
}

impl SessionRestorer {
    pub fn new(
        store: Arc<RedundantStore>,
        backup: Arc<SessionBackupStore>,
        auth: Arc<dyn AuthClient>,
    ) -> Self {
        Self {
            store,
            backup,
            auth,
        }
    }

    /// Attempt to re-establish a session for this checkout. When the caller
    /// presented a bearer token, it is checked first; a still-live session
    /// short-circuits restoration entirely.
    pub async fn restore(
        &self,
        order_id: &str,
        live_access_token: Option<&str>,
    ) -> RestoreOutcome {
        // Attempt budget, persisted across requests.
        let spent = self.attempts(order_id).await;
        if spent >= MAX_RESTORE_ATTEMPTS {
            warn!(
                order_id = %order_id,
                attempts = spent,
                "restoration budget exhausted, abandoning recovery"
            );
            self.backup.cleanup(order_id, true).await;
            return RestoreOutcome::Failed;
        }

        // A live session makes the backup redundant.
        if let Some(token) = live_access_token {
            match self.auth.current_session(token).await {
                Ok(Some(user)) => {
                    info!(user_id = %redact_id(&user.id), "session still live, skipping restore");
                    self.reset_attempts(order_id).await;
                    self.backup.cleanup(order_id, false).await;
                    return RestoreOutcome::AlreadyLive(user);
                }
                Ok(None) => debug!("presented bearer token is no longer live"),
                Err(e) => debug!(error = %e, "live-session check failed"),
            }
        }

        let Some(record) = self.backup.get_session_backup(order_id).await else {
            // Nothing to clean up on this path.
            debug!(order_id = %order_id, "no session backup found");
            return RestoreOutcome::Failed;
        };

        // Stale credentials must not be replayed.
        if record.is_expired(Utc::now()) {
            warn!(
                user_id = %redact_id(&record.user_id),
                "session backup expired, discarding"
            );
            self.backup.cleanup(order_id, false).await;
            return RestoreOutcome::Failed;
        }

        loop {
            let attempt = self.bump_attempts(order_id).await;
            if attempt > MAX_RESTORE_ATTEMPTS {
                break;
            }

            match self
                .auth
                .set_session(&record.access_token, &record.refresh_token)
                .await
            {
                Ok(Some(session)) => {
                    info!(
                        user_id = %redact_id(&session.user.id),
                        attempt,
                        "session restored from backup"
                    );
                    self.reset_attempts(order_id).await;
                    let context = self.backup.get_payment_context(order_id).await;
                    self.backup.cleanup(order_id, false).await;
                    return RestoreOutcome::Restored { session, context };
                }
                Ok(None) => debug!(attempt, "restore attempt returned no session"),
                Err(e) => debug!(attempt, error = %e, "restore attempt failed"),
            }

            // Exponential backoff: 2^n seconds after the nth failed attempt.
            sleep(Duration::from_secs(1u64 << attempt)).await;
        }

        warn!(order_id = %order_id, "all restore attempts failed");
        self.backup.cleanup(order_id, false).await;
        RestoreOutcome::Failed
    }

    async fn attempts(&self, order_id: &str) -> u32 {
        self.store
            .get(&keys::restore_attempts(order_id))
            .await
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    async fn bump_attempts(&self, order_id: &str) -> u32 {
        let next = self.attempts(order_id).await + 1;
        if let Err(e) = self
            .store
            .put_recording(&keys::restore_attempts(order_id), &next.to_string())
            .await
        {
            debug!(error = %e, "attempt counter write failed");
        }
        next
    }

    async fn reset_attempts(&self, order_id: &str) {
        self.store.remove(&keys::restore_attempts(order_id)).await;
    }
}
