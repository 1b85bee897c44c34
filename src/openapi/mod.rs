use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

/// Registers the bearer scheme the backup endpoint authenticates with.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "PromptMarket Checkout Recovery API",
        version = "1.0.0",
        description = r#"
# PromptMarket Checkout Recovery API

Backs up and restores checkout sessions around the external payment redirect,
and verifies payment outcomes when the browser comes back without a session.

## Flow

1. **Backup** the current session before redirecting to the payment provider.
2. The provider redirects back to the **callback** endpoint, which restores
   the session, verifies the payment, and redirects to the frontend.
3. When no session can be restored, the frontend uses the **recovery**
   endpoints to confirm the payment and optionally log the user back in.

## Rate Limiting

Requests are rate-limited per client IP. Check the response headers:
- `X-RateLimit-Limit`: Maximum requests per window
- `X-RateLimit-Remaining`: Remaining requests in current window
- `X-RateLimit-Reset`: Seconds until the window resets
        "#,
        contact(
            name = "PromptMarket Support",
            email = "support@promptmarket.example"
        ),
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Payment Recovery", description = "Session backup, callback handling, and payment recovery"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::payments::backup_session,
        crate::handlers::payments::payment_callback,
        crate::handlers::payments::recovery_lookup,
        crate::handlers::payments::recovery_auto_login,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,

            crate::handlers::payments::BackupSessionRequest,
            crate::handlers::payments::BackupSessionResponse,
            crate::handlers::payments::RecoveryLookupRequest,
            crate::handlers::payments::AutoLoginRequest,
            crate::recovery::lookup::RecoveryLookupResult,
            crate::recovery::lookup::AutoLoginResult,
            crate::recovery::navigator::VerificationOutcome,
            crate::auth::Session,
            crate::auth::AuthUser,

            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_includes_recovery_paths() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("PromptMarket Checkout Recovery API"));
        assert!(json.contains("/api/v1/payments/callback"));
        assert!(json.contains("/api/v1/payments/recovery"));
    }

    #[test]
    fn bearer_scheme_referenced_by_the_backup_path_is_registered() {
        let openapi = ApiDocV1::openapi();
        let components = openapi.components.expect("components");
        assert!(components.security_schemes.contains_key("bearer_auth"));
    }
}
