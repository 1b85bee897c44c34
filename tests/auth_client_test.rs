//! Wire-level tests for the GoTrue auth client against a stub server.

use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use promptmarket_api::auth::{AuthClient, AuthError, GoTrueClient};

async fn client(server: &MockServer) -> GoTrueClient {
    GoTrueClient::new(server.uri(), "anon-key".to_string()).expect("client")
}

#[tokio::test]
async fn current_session_returns_the_user_for_a_live_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .and(header("apikey", "anon-key"))
        .and(header("authorization", "Bearer live-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "user-1",
            "email": "jane@example.com"
        })))
        .mount(&server)
        .await;

    let user = client(&server)
        .await
        .current_session("live-token")
        .await
        .expect("request")
        .expect("live session");
    assert_eq!(user.id, "user-1");
    assert_eq!(user.email.as_deref(), Some("jane@example.com"));
}

#[tokio::test]
async fn current_session_treats_401_as_a_dead_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = client(&server).await.current_session("stale-token").await;
    assert_matches!(result, Ok(None));
}

#[tokio::test]
async fn current_session_surfaces_unexpected_statuses_as_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = client(&server).await.current_session("any-token").await;
    assert_matches!(result, Err(AuthError::Rejected(_)));
}

#[tokio::test]
async fn set_session_exchanges_the_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .and(header("apikey", "anon-key"))
        .and(body_partial_json(json!({ "refresh_token": "stashed-refresh" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": null,
            "user": { "id": "user-1", "email": "jane@example.com" }
        })))
        .mount(&server)
        .await;

    let session = client(&server)
        .await
        .set_session("stashed-access", "stashed-refresh")
        .await
        .expect("request")
        .expect("session");
    assert_eq!(session.access_token, "new-access");
    assert_eq!(session.refresh_token, "new-refresh");
    assert_eq!(session.user.id, "user-1");
    assert!(session.expires_at.is_some());
}

#[tokio::test]
async fn set_session_treats_a_rejected_refresh_token_as_no_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .mount(&server)
        .await;

    let result = client(&server)
        .await
        .set_session("stashed-access", "revoked-refresh")
        .await;
    assert_matches!(result, Ok(None));
}

#[tokio::test]
async fn transport_failures_are_reported_as_errors() {
    // Point at a port nothing listens on.
    let client = GoTrueClient::new("http://127.0.0.1:1".to_string(), "anon-key".to_string())
        .expect("client");
    let result = client.current_session("any-token").await;
    assert_matches!(result, Err(AuthError::Transport(_)));
}
