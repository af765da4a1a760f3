use crate::support::{client_for, mount_login, requests_to};
use serde_json::{json, Value};
use std::time::Duration;
use tether_core::{ApiError, ApiRequest, RefreshError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_items(server: &MockServer, good_token: &str) {
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", format!("Bearer {good_token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(server)
        .await;
}

#[tokio::test]
async fn concurrent_expired_requests_share_one_refresh() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    mount_items(&server, "T2").await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "T2"}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");
    assert_eq!(client.session().token().as_deref(), Some("T1"));

    let results = futures::future::join_all(
        (0..5).map(|_| client.get_json::<Value>("/items")),
    )
    .await;

    for result in results {
        assert_eq!(result.expect("request succeeds"), json!({"ok": true}));
    }
    assert_eq!(requests_to(&server, "/api/auth/refresh").await, 1);
    assert_eq!(requests_to(&server, "/api/items").await, 10);
    assert_eq!(client.session().token().as_deref(), Some("T2"));
    assert!(!client.refresh_coordinator().is_refreshing());
}

#[tokio::test]
async fn late_401_after_refresh_replays_without_refreshing_again() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    mount_items(&server, "T2").await;
    Mock::given(method("GET"))
        .and(path("/api/reports"))
        .and(header("authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"report": 7})))
        .mount(&server)
        .await;
    // Answers the stale token only after the first refresh has settled.
    Mock::given(method("GET"))
        .and(path("/api/reports"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "T2"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");

    let (items, report) = tokio::join!(
        client.get_json::<Value>("/items"),
        client.get_json::<Value>("/reports"),
    );

    assert_eq!(items.expect("items"), json!({"ok": true}));
    assert_eq!(report.expect("report"), json!({"report": 7}));
    assert_eq!(requests_to(&server, "/api/auth/refresh").await, 1);
    assert_eq!(requests_to(&server, "/api/reports").await, 2);
    assert_eq!(client.session().token().as_deref(), Some("T2"));
}

#[tokio::test]
async fn failed_refresh_rejects_every_queued_request() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    mount_items(&server, "never-issued").await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");

    let results = futures::future::join_all(
        (0..3).map(|_| client.get_json::<Value>("/items")),
    )
    .await;

    for result in results {
        match result {
            Err(ApiError::RefreshFailed(RefreshError::Rejected { status: 401 })) => {}
            other => panic!("expected refresh failure, got {other:?}"),
        }
    }
    assert!(client.session().token().is_none());
    assert!(client.session().user().is_none());
}

#[tokio::test]
async fn login_rejection_never_triggers_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "success": false,
            "error": {"code": "AUTH_ERROR", "message": "Invalid credentials"},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "T2"})))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    match client.login("admin", "wrong").await {
        Err(ApiError::LoginFailed(message)) => assert_eq!(message, "Invalid credentials"),
        other => panic!("expected login failure, got {other:?}"),
    }
    assert!(!client.session().is_authenticated());
}

#[tokio::test]
async fn refresh_endpoint_401_is_returned_as_is() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let response = client
        .gateway()
        .send(ApiRequest::post("/auth/refresh"))
        .await
        .expect("response");
    assert_eq!(response.status().as_u16(), 401);
    assert!(!client.refresh_coordinator().is_refreshing());
}

#[tokio::test]
async fn replayed_request_is_not_retried_twice() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "T2"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");

    let result = client.get_json::<Value>("/items").await;
    assert!(matches!(result, Err(ApiError::AuthExpired)));
    assert_eq!(requests_to(&server, "/api/items").await, 2);
}

#[tokio::test]
async fn other_failures_pass_through_untouched() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
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

    match client.get_json::<Value>("/items").await {
        Err(ApiError::Status { status, body }) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert_eq!(client.session().token().as_deref(), Some("T1"));
}

#[tokio::test]
async fn empty_error_body_is_reported_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server);
    match client.get_json::<Value>("/missing").await {
        Err(ApiError::Status { status, body }) => {
            assert_eq!(status.as_u16(), 404);
            assert!(body.is_empty());
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn bearer_token_is_attached_and_bodies_are_sent() {
    let server = MockServer::start().await;
    mount_login(&server, "T1").await;
    Mock::given(method("POST"))
        .and(path("/api/applications/install"))
        .and(header("authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "app-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.login("admin", "secret").await.expect("login");

    let created: Value = client
        .post_json("/applications/install", json!({"template_id": "nginx"}))
        .await
        .expect("install");
    assert_eq!(created["id"], "app-1");

    let requests = server.received_requests().await.unwrap_or_default();
    let install = requests
        .iter()
        .find(|request| request.url.path() == "/api/applications/install")
        .expect("install request");
    let body: Value = serde_json::from_slice(&install.body).expect("json body");
    assert_eq!(body["template_id"], "nginx");
}
