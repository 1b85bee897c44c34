//! Shared fixtures: in-memory stores, a programmable auth client, and a
//! canned transaction directory, so the recovery flow can be exercised
//! without Postgres, Redis, or a live auth service.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use promptmarket_api::auth::{AuthClient, AuthError, AuthUser, Session};
use promptmarket_api::config::AppConfig;
use promptmarket_api::errors::ServiceError;
use promptmarket_api::handlers::AppServices;
use promptmarket_api::recovery::lookup::{CompletedTransaction, RecoveryDirectory};
use promptmarket_api::storage::{MemoryStore, RedundantStore};
use promptmarket_api::AppState;

/// Auth client with scriptable outcomes and call counters.
pub struct FakeAuthClient {
    /// User returned by `current_session` when a token is presented.
    pub live_user: Option<AuthUser>,
    /// `set_session` fails this many times before the scripted outcome.
    pub set_session_failures: u32,
    /// What `set_session` returns once the failures are exhausted.
    pub set_session_user: Option<AuthUser>,
    pub current_session_calls: AtomicU32,
    pub set_session_calls: AtomicU32,
}

impl FakeAuthClient {
    pub fn logged_out() -> Self {
        Self {
            live_user: None,
            set_session_failures: 0,
            set_session_user: None,
            current_session_calls: AtomicU32::new(0),
            set_session_calls: AtomicU32::new(0),
        }
    }

    pub fn live(user: AuthUser) -> Self {
        Self {
            live_user: Some(user),
            ..Self::logged_out()
        }
    }

    pub fn restorable(user: AuthUser) -> Self {
        Self {
            set_session_user: Some(user),
            ..Self::logged_out()
        }
    }

    pub fn restorable_after(failures: u32, user: AuthUser) -> Self {
        Self {
            set_session_failures: failures,
            set_session_user: Some(user),
            ..Self::logged_out()
        }
    }

    pub fn never_restores() -> Self {
        Self::logged_out()
    }

    pub fn set_session_call_count(&self) -> u32 {
        self.set_session_calls.load(Ordering::SeqCst)
    }

    pub fn current_session_call_count(&self) -> u32 {
        self.current_session_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthClient for FakeAuthClient {
    async fn current_session(&self, _access_token: &str) -> Result<Option<AuthUser>, AuthError> {
        self.current_session_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.live_user.clone())
    }

    async fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<Option<Session>, AuthError> {
        let call = self.set_session_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.set_session_failures {
            return Ok(None);
        }
        Ok(self.set_session_user.clone().map(|user| {
            Session::new(
                access_token.to_string(),
                refresh_token.to_string(),
                3600,
                user,
            )
        }))
    }
}

pub fn user(id: &str) -> AuthUser {
    AuthUser {
        id: id.to_string(),
        email: Some(format!("{}@example.com", id)),
    }
}

/// Canned view of the marketplace tables.
#[derive(Default)]
pub struct FakeDirectory {
    pub transactions: Vec<CompletedTransaction>,
    pub plans: HashMap<String, String>,
    pub active_subscriptions: HashSet<(String, String)>,
    pub emails: HashMap<String, String>,
    /// When set, every query fails with a storage error.
    pub broken: bool,
}

impl FakeDirectory {
    pub fn with_transaction(tx: CompletedTransaction) -> Self {
        Self {
            transactions: vec![tx],
            ..Self::default()
        }
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    fn guard(&self) -> Result<(), ServiceError> {
        if self.broken {
            Err(ServiceError::StorageError("directory offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecoveryDirectory for FakeDirectory {
    async fn completed_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        self.guard()?;
        Ok(self
            .transactions
            .iter()
            .find(|tx| tx.order_id.as_deref() == Some(order_id))
            .cloned())
    }

    async fn completed_by_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        self.guard()?;
        Ok(self
            .transactions
            .iter()
            .find(|tx| tx.payment_id.as_deref() == Some(payment_id))
            .cloned())
    }

    async fn completed_by_user_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<Option<CompletedTransaction>, ServiceError> {
        self.guard()?;
        Ok(self
            .transactions
            .iter()
            .find(|tx| tx.user_id == user_id && tx.plan_id == plan_id)
            .cloned())
    }

    async fn plan_name(&self, plan_id: &str) -> Result<Option<String>, ServiceError> {
        self.guard()?;
        Ok(self.plans.get(plan_id).cloned())
    }

    async fn has_active_subscription(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<bool, ServiceError> {
        self.guard()?;
        Ok(self
            .active_subscriptions
            .contains(&(user_id.to_string(), plan_id.to_string())))
    }

    async fn email_for_user(&self, user_id: &str) -> Result<Option<String>, ServiceError> {
        self.guard()?;
        Ok(self.emails.get(user_id).cloned())
    }
}

pub fn completed_transaction(order_id: &str, payment_id: &str) -> CompletedTransaction {
    CompletedTransaction {
        user_id: "user-1".to_string(),
        plan_id: "plan-pro".to_string(),
        order_id: Some(order_id.to_string()),
        payment_id: Some(payment_id.to_string()),
        amount: Decimal::new(2999, 2),
        currency: "USD".to_string(),
        completed_at: Some(Utc::now()),
    }
}

pub fn memory_store() -> Arc<RedundantStore> {
    Arc::new(RedundantStore::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
    ))
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        redis_url: "redis://127.0.0.1:6379".into(),
        auth_url: "http://localhost:9999".into(),
        auth_api_key: "test-key".into(),
        frontend_base_url: "https://promptmarket.test".into(),
        host: "127.0.0.1".into(),
        port: 0,
        environment: "test".into(),
        log_level: "debug".into(),
        log_json: false,
        recovery_namespace: "test:recovery".into(),
        recovery_store_ttl_secs: 7200,
        cors_allowed_origins: None,
        cors_allow_any_origin: true,
        db_max_connections: 1,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_acquire_timeout_secs: 5,
        db_idle_timeout_secs: 60,
        rate_limit_requests_per_window: 1000,
        rate_limit_window_seconds: 60,
        rate_limit_enable_headers: true,
    }
}

/// App state backed entirely by in-memory fakes. The database handle is
/// disconnected; handlers under test must not touch it directly.
pub fn test_state(auth: Arc<FakeAuthClient>, directory: Arc<FakeDirectory>) -> AppState {
    test_state_with_store(memory_store(), auth, directory)
}

/// Like [`test_state`], but sharing a caller-provided store so tests can
/// seed recovery records directly.
pub fn test_state_with_store(
    store: Arc<RedundantStore>,
    auth: Arc<FakeAuthClient>,
    directory: Arc<FakeDirectory>,
) -> AppState {
    let services = AppServices::new(store, auth, directory);
    AppState {
        db: Arc::new(DatabaseConnection::Disconnected),
        config: test_config(),
        redis: Arc::new(
            redis::Client::open("redis://127.0.0.1:6379").expect("redis client handle"),
        ),
        services,
    }
}

pub fn test_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", promptmarket_api::api_v1_routes())
        .with_state(state)
}
