use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use utoipa::ToSchema;

use crate::auth::Session;
use crate::entities::{payment_transaction, profile, subscription_plan, user_subscription};
use crate::errors::ServiceError;

use super::backup::SessionBackupStore;
use super::navigator::VerificationOutcome;
use super::restore::{RestoreOutcome, SessionRestorer};
use super::{redact_email, redact_id};

/// Identifiers available for a transaction lookup. Any combination may be
/// present; precedence is order id, then payment id, then user + plan.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub user_id: Option<String>,
    pub plan_id: Option<String>,
}

/// A completed transaction row, as the recovery flow sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTransaction {
    pub user_id: String,
    pub plan_id: String,
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

/// Read-only view of the marketplace tables the recovery flow consults.
#[async_trait]
pub trait RecoveryDirectory: Send + Sync {
    async fn completed_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError>;

    async fn completed_by_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError>;

    async fn completed_by_user_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError>;

    async fn plan_name(&self, plan_id: &str) -> Result<Option<String>, ServiceError>;

    async fn has_active_subscription(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<bool, ServiceError>;

    async fn email_for_user(&self, user_id: &str) -> Result<Option<String>, ServiceError>;
}

/// sea-orm implementation over the marketplace database.
pub struct SeaOrmDirectory {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmDirectory {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn latest_completed(
        &self,
        condition: Condition,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        let row = payment_transaction::Entity::find()
            .filter(condition)
            .filter(
                payment_transaction::Column::Status
                    .eq(payment_transaction::TransactionStatus::Completed),
            )
            .order_by_desc(payment_transaction::Column::CreatedAt)
            .one(self.db.as_ref())
            .await?;

        Ok(row.map(|tx| CompletedTransaction {
            user_id: tx.user_id,
            plan_id: tx.plan_id,
            order_id: tx.paypal_order_id,
            payment_id: tx.paypal_payment_id,
            amount: tx.amount,
            currency: tx.currency,
            completed_at: tx.completed_at,
        }))
    }
}

#[async_trait]
impl RecoveryDirectory for SeaOrmDirectory {
    async fn completed_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        self.latest_completed(
            Condition::all().add(payment_transaction::Column::PaypalOrderId.eq(order_id)),
        )
        .await
    }

    async fn completed_by_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        self.latest_completed(
            Condition::all().add(payment_transaction::Column::PaypalPaymentId.eq(payment_id)),
        )
        .await
    }

    async fn completed_by_user_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        self.latest_completed(
            Condition::all()
                .add(payment_transaction::Column::UserId.eq(user_id))
                .add(payment_transaction::Column::PlanId.eq(plan_id)),
        )
        .await
    }

    async fn plan_name(&self, plan_id: &str) -> Result<Option<String>, ServiceError> {
        let plan = subscription_plan::Entity::find_by_id(plan_id)
            .one(self.db.as_ref())
            .await?;
        Ok(plan.map(|p| p.name))
    }

    async fn has_active_subscription(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<bool, ServiceError> {
        let row = user_subscription::Entity::find()
            .filter(user_subscription::Column::UserId.eq(user_id))
            .filter(user_subscription::Column::PlanId.eq(plan_id))
            .filter(
                user_subscription::Column::Status.eq(user_subscription::SubscriptionStatus::Active),
            )
            .filter(
                Condition::any()
                    .add(user_subscription::Column::ExpiresAt.is_null())
                    .add(user_subscription::Column::ExpiresAt.gt(Utc::now())),
            )
            .one(self.db.as_ref())
            .await?;
        Ok(row.is_some())
    }

    async fn email_for_user(&self, user_id: &str) -> Result<Option<String>, ServiceError> {
        let row = profile::Entity::find_by_id(user_id)
            .one(self.db.as_ref())
            .await?;
        Ok(row.map(|p| p.email))
    }
}

/// What the user gets to see when recovering without a session.
#[derive(Debug, Clone, Serialize, ToSchema, PartialEq)]
pub struct RecoveryLookupResult {
    pub can_recover: bool,
    pub needs_login: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub has_active_subscription: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

impl RecoveryLookupResult {
    fn not_recoverable() -> Self {
        Self {
            can_recover: false,
            needs_login: true,
            order_id: None,
            payment_id: None,
            plan_id: None,
            plan_name: None,
            user_email: None,
            has_active_subscription: false,
            amount: None,
            currency: None,
            completed_at: None,
        }
    }
}

/// Result of the degraded auto-login path.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AutoLoginResult {
    pub logged_in: bool,
    pub needs_manual_login: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

/// Last-resort recovery: confirm a payment's outcome directly from the
/// transaction store when no session could be restored.
///
/// This path runs during an already-degraded scenario, so it never
/// propagates an error to the handler: every query failure is logged and
/// reported as "cannot recover".
pub struct PaymentRecoveryService {
    directory: Arc<dyn RecoveryDirectory>,
    backup: Arc<SessionBackupStore>,
    restorer: Arc<SessionRestorer>,
}

impl PaymentRecoveryService {
    pub fn new(
        directory: Arc<dyn RecoveryDirectory>,
        backup: Arc<SessionBackupStore>,
        restorer: Arc<SessionRestorer>,
    ) -> Self {
        Self {
            directory,
            backup,
            restorer,
        }
    }

    async fn find_completed(
        &self,
        query: &TransactionQuery,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        if let Some(order_id) = query.order_id.as_deref() {
            if let Some(tx) = self.directory.completed_by_order(order_id).await? {
                return Ok(Some(tx));
            }
        }
        if let Some(payment_id) = query.payment_id.as_deref() {
            if let Some(tx) = self.directory.completed_by_payment(payment_id).await? {
                return Ok(Some(tx));
            }
        }
        if let (Some(user_id), Some(plan_id)) = (query.user_id.as_deref(), query.plan_id.as_deref())
        {
            if let Some(tx) = self.directory.completed_by_user_plan(user_id, plan_id).await? {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Look up the payment by its external identifiers and report enough
    /// information for the user to confirm the outcome without being logged
    /// in.
    pub async fn lookup(&self, query: &TransactionQuery) -> RecoveryLookupResult {
        let tx = match self.find_completed(query).await {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                debug!("no completed transaction matched any provided identifier");
                return RecoveryLookupResult::not_recoverable();
            }
            Err(e) => {
                error!(error = %e, "recovery lookup query failed");
                return RecoveryLookupResult::not_recoverable();
            }
        };

        let plan_name = match self.directory.plan_name(&tx.plan_id).await {
            Ok(name) => name,
            Err(e) => {
                debug!(error = %e, "plan name lookup failed");
                None
            }
        };

        // Subscription activation may lag behind transaction completion.
        let has_active_subscription = match self
            .directory
            .has_active_subscription(&tx.user_id, &tx.plan_id)
            .await
        {
            Ok(active) => active,
            Err(e) => {
                debug!(error = %e, "subscription check failed");
                false
            }
        };

        let (user_email, needs_login) = match self.directory.email_for_user(&tx.user_id).await {
            Ok(Some(email)) => {
                info!(
                    user_id = %redact_id(&tx.user_id),
                    email = %redact_email(&email),
                    "payment recovered without a session"
                );
                (Some(email), false)
            }
            Ok(None) => (None, true),
            Err(e) => {
                debug!(error = %e, "email resolution failed");
                (None, true)
            }
        };

        RecoveryLookupResult {
            can_recover: true,
            needs_login,
            order_id: tx.order_id,
            payment_id: tx.payment_id,
            plan_id: Some(tx.plan_id),
            plan_name,
            user_email,
            has_active_subscription,
            amount: Some(tx.amount),
            currency: Some(tx.currency),
            completed_at: tx.completed_at,
        }
    }

    /// Verify a payment against the transaction store and assemble the
    /// navigator's inputs. A payment counts as successful iff a completed
    /// transaction matches one of the identifiers.
    pub async fn verify(
        &self,
        query: &TransactionQuery,
        needs_authentication: bool,
    ) -> VerificationOutcome {
        match self.find_completed(query).await {
            Ok(Some(tx)) => {
                let has_active_subscription = self
                    .directory
                    .has_active_subscription(&tx.user_id, &tx.plan_id)
                    .await
                    .unwrap_or_else(|e| {
                        debug!(error = %e, "subscription check failed during verification");
                        false
                    });
                VerificationOutcome {
                    is_successful: true,
                    has_active_subscription,
                    needs_authentication,
                    plan_id: Some(tx.plan_id),
                    user_id: Some(tx.user_id),
                    payment_id: tx.payment_id.or_else(|| query.payment_id.clone()),
                    order_id: tx.order_id.or_else(|| query.order_id.clone()),
                    failure_reason: None,
                }
            }
            Ok(None) => VerificationOutcome::failed(query, None),
            Err(e) => {
                error!(error = %e, "payment verification query failed");
                VerificationOutcome::failed(query, None)
            }
        }
    }

    /// Degraded auto-login: only sensible while recovery data still exists;
    /// delegates to the session restorer. When this also fails the caller
    /// must fall back to a manual login prompt.
    pub async fn attempt_auto_login(&self, order_id: &str, email: &str) -> AutoLoginResult {
        if !self.backup.has_any_recovery_data(order_id).await {
            debug!(email = %redact_email(email), "no recovery data for auto-login");
            return AutoLoginResult {
                logged_in: false,
                needs_manual_login: true,
                session: None,
            };
        }

        match self.restorer.restore(order_id, None).await {
            RestoreOutcome::Restored { session, .. } => AutoLoginResult {
                logged_in: true,
                needs_manual_login: false,
                session: Some(session),
            },
            RestoreOutcome::AlreadyLive(_) => AutoLoginResult {
                logged_in: true,
                needs_manual_login: false,
                session: None,
            },
            RestoreOutcome::Failed => {
                info!(email = %redact_email(email), "auto-login failed, manual login required");
                AutoLoginResult {
                    logged_in: false,
                    needs_manual_login: true,
                    session: None,
                }
            }
        }
    }
}
