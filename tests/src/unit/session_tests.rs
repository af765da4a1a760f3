use crate::support::{client_for, mount_login, mount_me, requests_to};
use serde_json::json;
use std::time::Duration;
use tether_core::{ApiError, RefreshError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn login_stores_token_and_user() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;

    let client = client_for(&server);
    let user = client.login("admin", "secret").await.expect("login");

    assert_eq!(user.username, "admin");
    assert_eq!(user.id, "1");
    assert_eq!(client.session().token().as_deref(), Some("T1"));
    assert_eq!(client.session().user(), Some(user));
}

#[tokio::test]
async fn login_is_undone_when_identity_lookup_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "T1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/auth/me"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.login("admin", "secret").await.unwrap_err();

    assert!(matches!(err, ApiError::Status { .. }));
    assert!(!client.session().is_authenticated());
}

#[tokio::test]
async fn logout_clears_session_even_when_server_fails() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    Mock::given(method("POST"))
        .and(path("/api/auth/logout"))
        .and(header("authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");
    client.logout().await;

    assert!(client.session().token().is_none());
    assert!(client.session().user().is_none());
}

#[tokio::test]
async fn initialize_restores_session_once() {
    let server = MockServer::start().await;
    mount_me(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "T9"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.initialize().await);
    assert!(client.initialize().await);

    assert!(client.session().is_initialized());
    assert_eq!(client.session().token().as_deref(), Some("T9"));
    assert_eq!(
        client.session().user().map(|user| user.username),
        Some("admin".to_string())
    );
}

#[tokio::test]
async fn initialize_without_session_stays_signed_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(!client.initialize().await);
    assert!(!client.initialize().await);

    assert!(client.session().is_initialized());
    assert!(!client.session().is_authenticated());
    assert_eq!(requests_to(&server, "/api/auth/me").await, 0);
}

#[tokio::test]
async fn logout_during_refresh_does_not_resurrect_token() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "T2"}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/logout"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get_json::<serde_json::Value>("/items").await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.refresh_coordinator().is_refreshing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("refresh started");

    client.logout().await;
    let result = pending.await.expect("join");

    assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
    assert!(client.session().token().is_none());
}

#[tokio::test]
async fn logout_while_request_in_flight_skips_refresh() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/logout"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "T2"})))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get_json::<serde_json::Value>("/items").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.logout().await;

    let result = pending.await.expect("join");
    assert!(matches!(
        result,
        Err(ApiError::RefreshFailed(RefreshError::SessionEnded))
    ));
    assert!(client.session().token().is_none());
}
