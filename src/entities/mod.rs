//! Read-only sea-orm models for the marketplace tables this service consults.

pub mod payment_transaction;
pub mod profile;
pub mod subscription_plan;
pub mod user_subscription;
