use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::storage::RedundantStore;

use super::{keys, read_json, FallbackData, LegacyPaymentData, PaymentContext, PreservedCallback};

/// Known spellings for each logical callback field, in precedence order.
/// Different provider redirect flows produce different shapes; first match
/// wins per field.
const PAYMENT_ID_PARAMS: &[&str] = &["paymentId", "payment_id", "paypal_payment_id", "capture_id"];
const PAYER_ID_PARAMS: &[&str] = &["PayerID", "payer_id", "PAYERID"];
const ORDER_ID_PARAMS: &[&str] = &["token", "order_id", "orderId", "paypal_order_id"];
const PLAN_ID_PARAMS: &[&str] = &["plan_id", "planId"];
const USER_ID_PARAMS: &[&str] = &["user_id", "userId"];

/// Canonical view of the provider's redirect parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// The `success` flag, when the URL carried one.
    pub success: Option<bool>,
    pub payment_id: Option<String>,
    pub payer_id: Option<String>,
    pub order_id: Option<String>,
    pub plan_id: Option<String>,
    pub user_id: Option<String>,
    /// Recovery can proceed without ever re-authenticating.
    pub has_session_independent_data: bool,
    /// Basic shape check before any processing is attempted.
    pub is_valid_payment_callback: bool,
}

/// One cached source of plan/user identifiers, evaluated in priority order
/// when the URL itself comes up short.
struct BackfillSource {
    name: &'static str,
    plan_id: Option<String>,
    user_id: Option<String>,
    is_legacy: bool,
}

/// Normalizes the heterogeneous query-parameter shapes the payment provider
/// may redirect back with, filling gaps from previously cached context.
pub struct CallbackParameterExtractor {
    store: Arc<RedundantStore>,
}

impl CallbackParameterExtractor {
    pub fn new(store: Arc<RedundantStore>) -> Self {
        Self { store }
    }

    pub async fn extract(&self, query: &HashMap<String, String>) -> CallbackParams {
        let success = first_param(query, &["success"]).map(|v| v == "true");
        let payment_id = first_param(query, PAYMENT_ID_PARAMS);
        let payer_id = first_param(query, PAYER_ID_PARAMS);
        let order_id = first_param(query, ORDER_ID_PARAMS);
        let mut plan_id = first_param(query, PLAN_ID_PARAMS);
        let mut user_id = first_param(query, USER_ID_PARAMS);

        let mut filled_from_legacy = false;
        if let Some(order) = order_id.as_deref() {
            if plan_id.is_none() || user_id.is_none() {
                for source in self.backfill_sources(order).await {
                    let mut used = false;
                    if plan_id.is_none() {
                        if let Some(plan) = source.plan_id {
                            plan_id = Some(plan);
                            used = true;
                        }
                    }
                    if user_id.is_none() {
                        if let Some(user) = source.user_id {
                            user_id = Some(user);
                            used = true;
                        }
                    }
                    if used {
                        debug!(source = source.name, "backfilled callback identifiers");
                        filled_from_legacy |= source.is_legacy;
                    }
                    if plan_id.is_some() && user_id.is_some() {
                        break;
                    }
                }
            }

            self.preserve(order, &plan_id, &user_id).await;

            // Once a newer source has supplied the identifiers, the legacy
            // record has nothing left to offer.
            if !filled_from_legacy && plan_id.is_some() && user_id.is_some() {
                let legacy_key = keys::legacy_payment_data(order);
                if self.store.contains(&legacy_key).await {
                    self.store.remove(&legacy_key).await;
                    debug!("retired legacy payment record");
                }
            }
        }

        let has_plan_or_user = plan_id.is_some() || user_id.is_some();
        let has_session_independent_data = order_id.is_some()
            && has_plan_or_user
            && (success == Some(true) || payment_id.is_some());
        let is_valid_payment_callback =
            (order_id.is_some() || payment_id.is_some()) && success.is_some() && has_plan_or_user;

        CallbackParams {
            success,
            payment_id,
            payer_id,
            order_id,
            plan_id,
            user_id,
            has_session_independent_data,
            is_valid_payment_callback,
        }
    }

    /// Cached identifier sources, in priority order. First `Some` wins per
    /// missing field.
    async fn backfill_sources(&self, order_id: &str) -> Vec<BackfillSource> {
        let mut sources = Vec::with_capacity(4);

        if let Some(context) =
            read_json::<PaymentContext>(&self.store, &keys::payment_context(order_id)).await
        {
            sources.push(BackfillSource {
                name: "payment context",
                plan_id: Some(context.plan_id),
                user_id: Some(context.user_id),
                is_legacy: false,
            });
        }
        if let Some(fallback) =
            read_json::<FallbackData>(&self.store, &keys::fallback_data(order_id)).await
        {
            sources.push(BackfillSource {
                name: "fallback data",
                plan_id: Some(fallback.plan_id),
                user_id: Some(fallback.user_id),
                is_legacy: false,
            });
        }
        if let Some(preserved) =
            read_json::<PreservedCallback>(&self.store, &keys::callback_preservation(order_id))
                .await
        {
            sources.push(BackfillSource {
                name: "preserved callback",
                plan_id: preserved.plan_id,
                user_id: preserved.user_id,
                is_legacy: false,
            });
        }
        if let Some(legacy) =
            read_json::<LegacyPaymentData>(&self.store, &keys::legacy_payment_data(order_id)).await
        {
            sources.push(BackfillSource {
                name: "legacy record",
                plan_id: legacy.plan_id,
                user_id: legacy.user_id,
                is_legacy: true,
            });
        }

        sources
    }

    /// Re-persist the currently known identifiers so a later pass (e.g.
    /// after a session hiccup) can recover them.
    async fn preserve(&self, order_id: &str, plan_id: &Option<String>, user_id: &Option<String>) {
        let record = PreservedCallback {
            plan_id: plan_id.clone(),
            user_id: user_id.clone(),
            order_id: Some(order_id.to_string()),
        };
        match serde_json::to_string(&record) {
            Ok(encoded) => {
                if let Err(e) = self
                    .store
                    .put_recording(&keys::callback_preservation(order_id), &encoded)
                    .await
                {
                    debug!(error = %e, "callback preservation write failed");
                }
            }
            Err(e) => debug!(error = %e, "callback preservation could not be encoded"),
        }
    }
}

fn first_param(query: &HashMap<String, String>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| query.get(*name))
        .find(|value| !value.is_empty())
        .cloned()
}
