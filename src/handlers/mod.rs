use axum::http::{header, HeaderMap};
use std::sync::Arc;

use crate::auth::AuthClient;
use crate::recovery::backup::SessionBackupStore;
use crate::recovery::callback::CallbackParameterExtractor;
use crate::recovery::lookup::{PaymentRecoveryService, RecoveryDirectory};
use crate::recovery::restore::SessionRestorer;
use crate::storage::RedundantStore;

pub mod payments;

/// The recovery services, wired once at startup and shared by all handlers.
#[derive(Clone)]
pub struct AppServices {
    pub backup: Arc<SessionBackupStore>,
    pub extractor: Arc<CallbackParameterExtractor>,
    pub restorer: Arc<SessionRestorer>,
    pub recovery: Arc<PaymentRecoveryService>,
    pub auth: Arc<dyn AuthClient>,
}

impl AppServices {
    pub fn new(
        store: Arc<RedundantStore>,
        auth: Arc<dyn AuthClient>,
        directory: Arc<dyn RecoveryDirectory>,
    ) -> Self {
        let backup = Arc::new(SessionBackupStore::new(store.clone(), auth.clone()));
        let extractor = Arc::new(CallbackParameterExtractor::new(store.clone()));
        let restorer = Arc::new(SessionRestorer::new(store, backup.clone(), auth.clone()));
        let recovery = Arc::new(PaymentRecoveryService::new(
            directory,
            backup.clone(),
            restorer.clone(),
        ));
        Self {
            backup,
            extractor,
            restorer,
            recovery,
            auth,
        }
    }
}

/// Bearer token from the Authorization header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
