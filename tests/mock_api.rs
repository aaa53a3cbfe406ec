//! Mock API tests for the espalier library.
//!
//! These tests use wiremock to simulate the remote service and exercise
//! the handshake, the verb pipeline, response classification, and
//! pagination without network access or real credentials.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use futures_util::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use espalier::{ApiUrl, ConnectionManager, Credential, Error, PageOptions, RateLimitPolicy};

/// Base URL pointing at the mock server.
fn mock_base(server: &MockServer) -> ApiUrl {
    ApiUrl::new(format!("http://127.0.0.1:{}", server.address().port())).unwrap()
}

fn test_credential() -> Credential {
    Credential::new("fvpat-key", "fvpat-secret")
}

/// An unsigned JWT with the given expiry claim. The signature segment is
/// garbage; the client never verifies it.
fn make_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}

/// A JWT that will not need refreshing during a test run.
fn long_lived_jwt() -> String {
    make_jwt(Utc::now().timestamp() + 3600)
}

fn session_response(access_token: &str, refresh_token: &str) -> Value {
    json!({
        "accessToken": access_token,
        "refreshToken": refresh_token,
        "refreshTokenExpiry": Utc::now().timestamp() + 86_400,
        "refreshTokenTtl": "24h",
        "userId": "user-1",
        "orgId": 7
    })
}

/// Mount a key-mode handshake responder issuing the given tokens.
async fn mount_key_handshake(server: &MockServer, access_token: &str, refresh_token: &str) {
    Mock::given(method("POST"))
        .and(path("/session"))
        .and(body_partial_json(json!({"mode": "key"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(session_response(access_token, refresh_token)),
        )
        .mount(server)
        .await;
}

async fn connect(server: &MockServer) -> ConnectionManager {
    ConnectionManager::connect(mock_base(server), test_credential(), None, None)
        .await
        .unwrap()
}

// ============================================================================
// Handshake tests
// ============================================================================

#[tokio::test]
async fn connect_performs_key_handshake() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    let conn = connect(&server).await;
    assert_eq!(conn.session().user_id().await, "user-1");
    assert_eq!(conn.session().org_id().await, 7);

    // Inspect the handshake body for the wire-contract fields.
    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["mode"], "key");
    assert_eq!(body["apiKey"], "fvpat-key");

    let hash = body["apiHash"].as_str().unwrap();
    assert_eq!(hash.len(), 32);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

    let timestamp = body["apiTimestamp"].as_str().unwrap();
    assert!(timestamp.ends_with('Z'));
    assert_eq!(&timestamp[10..11], "T");
}

#[tokio::test]
async fn rejected_handshake_is_auth_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let result = ConnectionManager::connect(mock_base(&server), test_credential(), None, None).await;

    match result.unwrap_err() {
        Error::Auth { status, message, .. } => {
            assert_eq!(status, 401);
            assert_eq!(message, "bad key");
        }
        other => panic!("expected Auth error, got {other:?}"),
    }
}

#[tokio::test]
async fn proactive_refresh_uses_session_mode() {
    let server = MockServer::start().await;

    // Initial token expires inside the 90s safety window, forcing a
    // refresh before the first request.
    let stale_jwt = make_jwt(Utc::now().timestamp() + 50);
    let fresh_jwt = long_lived_jwt();

    mount_key_handshake(&server, &stale_jwt, "refresh-1").await;

    Mock::given(method("POST"))
        .and(path("/session"))
        .and(body_partial_json(json!({
            "mode": "session",
            "apiKey": "fvpat-key",
            "userId": "user-1",
            "orgId": 7,
            "sessionId": "refresh-1"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(session_response(&fresh_jwt, "refresh-2")),
        )
        .expect(1)
        .mount(&server)
        .await;

    // The request must carry the refreshed tokens, not the stale pair.
    Mock::given(method("GET"))
        .and(path("/utils/whoami"))
        .and(header("authorization", format!("Bearer {fresh_jwt}").as_str()))
        .and(header("x-fv-sessionid", "refresh-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"userId": "user-1"})))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let body = conn.get("/utils/whoami", None, None).await.unwrap();
    assert_eq!(body["userId"], "user-1");
}

#[tokio::test]
async fn fresh_token_skips_refresh() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/utils/whoami"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    conn.get("/utils/whoami", None, None).await.unwrap();

    // Exactly one POST /session: the initial handshake.
    let handshakes = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/session")
        .count();
    assert_eq!(handshakes, 1);
}

// ============================================================================
// Verb pipeline and classification tests
// ============================================================================

#[tokio::test]
async fn get_returns_parsed_body() {
    let server = MockServer::start().await;
    let jwt = long_lived_jwt();
    mount_key_handshake(&server, &jwt, "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/documents/42"))
        .and(header("authorization", format!("Bearer {jwt}").as_str()))
        .and(header("x-fv-sessionid", "refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let body = conn.get("/core/documents/42", None, None).await.unwrap();
    assert_eq!(body, json!({"id": 42}));
}

#[tokio::test]
async fn get_forwards_query_params() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .and(query_param("requestedFields", "projectId,name"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let query = [("requestedFields".to_string(), "projectId,name".to_string())];
    let body = conn.get("/core/projects", Some(&query), None).await.unwrap();
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn post_sends_json_body() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("POST"))
        .and(path("/core/custom-contacts"))
        .and(body_partial_json(json!({"firstName": "Ada"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"contactId": 9})))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let body = conn
        .post("/core/custom-contacts", &json!({"firstName": "Ada"}), None)
        .await
        .unwrap();
    assert_eq!(body["contactId"], 9);
}

#[tokio::test]
async fn patch_sends_json_body() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("PATCH"))
        .and(path("/core/projects/3"))
        .and(body_partial_json(json!({"name": "Renamed"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"projectId": 3})))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let body = conn
        .patch("/core/projects/3", &json!({"name": "Renamed"}), None)
        .await
        .unwrap();
    assert_eq!(body["projectId"], 3);
}

#[tokio::test]
async fn delete_expects_no_content() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("DELETE"))
        .and(path("/core/documents/42"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let body = conn.delete("/core/documents/42", None).await.unwrap();
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn unexpected_success_code_is_http_failure() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    // A 200 where a 204 was expected means the endpoint did not do what
    // was asked.
    Mock::given(method("DELETE"))
        .and(path("/core/documents/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let err = conn.delete("/core/documents/42", None).await.unwrap_err();
    match err {
        Error::Http { status, url, .. } => {
            assert_eq!(status, 200);
            assert!(url.contains("/core/documents/42"));
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn server_error_preserves_url_and_message() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/documents/42"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk on fire"))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let err = conn.get("/core/documents/42", None, None).await.unwrap_err();
    match err {
        Error::Http { status, url, message } => {
            assert_eq!(status, 500);
            assert!(url.contains("/core/documents/42"));
            assert_eq!(message, "disk on fire");
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limited_call_notifies_limiter() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .respond_with(ResponseTemplate::new(429).set_body_string("Server Rate Limit Exceeded"))
        .mount(&server)
        .await;

    let conn = ConnectionManager::connect(mock_base(&server), test_credential(), None, Some(8.0))
        .await
        .unwrap();

    let err = conn.get("/core/projects", None, None).await.unwrap_err();
    assert!(err.is_rate_limit());
    assert_eq!(err.status(), Some(429));

    // The 429 path reports a failure to the limiter exactly once.
    let limiter = conn.limiter().unwrap();
    assert_eq!(limiter.failed_attempts().await, 1.0);
}

#[tokio::test]
async fn caller_headers_augment_but_never_override_session_headers() {
    let server = MockServer::start().await;
    let jwt = long_lived_jwt();
    mount_key_handshake(&server, &jwt, "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/utils/whoami"))
        .and(header("x-request-source", "batch-job"))
        .and(header("authorization", format!("Bearer {jwt}").as_str()))
        .and(header("x-fv-sessionid", "refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let mut headers = HeaderMap::new();
    headers.insert("x-request-source", HeaderValue::from_static("batch-job"));
    // Caller-provided values for the session headers are ignored.
    headers.insert("x-fv-sessionid", HeaderValue::from_static("forged"));
    headers.insert("authorization", HeaderValue::from_static("Bearer forged"));

    let conn = connect(&server).await;
    conn.get("/utils/whoami", None, Some(headers)).await.unwrap();
}

// ============================================================================
// Pagination tests
// ============================================================================

#[tokio::test]
async fn list_pages_through_until_has_more_is_false() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"n": 1}, {"n": 2}, {"n": 3}],
            "hasMore": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .and(query_param("offset", "100"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"n": 4}, {"n": 5}],
            "hasMore": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let items: Vec<Value> = conn.list("/core/projects", &[]).try_collect().await.unwrap();

    let numbers: Vec<i64> = items.iter().map(|i| i["n"].as_i64().unwrap()).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn list_retries_rate_limited_page_without_advancing() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    // First fetch of the page is throttled; the retry must use the same
    // offset. Mount order matters: the 429 responder runs once.
    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(429).set_body_string("throttled"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"n": 1}],
            "hasMore": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let items: Vec<Value> = conn.list("/core/projects", &[]).try_collect().await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn list_can_propagate_rate_limit_instead() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .and(query_param("limit", "50"))
        .respond_with(ResponseTemplate::new(429).set_body_string("throttled"))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let options = PageOptions {
        limit: 50,
        on_rate_limit: RateLimitPolicy::Propagate,
    };
    let result: Result<Vec<Value>, Error> = conn
        .list_with_options("/core/projects", &[], options)
        .try_collect()
        .await;

    assert!(result.unwrap_err().is_rate_limit());
}

#[tokio::test]
async fn list_preserves_caller_params() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .and(query_param("requestedFields", "projectId"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [],
            "hasMore": false
        })))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let params = [("requestedFields".to_string(), "projectId".to_string())];
    let items: Vec<Value> = conn
        .list("/core/projects", &params)
        .try_collect()
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn list_rejects_pages_missing_cursor_fields() {
    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/core/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"n": 1}]
        })))
        .mount(&server)
        .await;

    let conn = connect(&server).await;
    let result: Result<Vec<Value>, Error> =
        conn.list("/core/projects", &[]).try_collect().await;

    match result.unwrap_err() {
        Error::UnexpectedResponse { endpoint, message } => {
            assert_eq!(endpoint, "/core/projects");
            assert!(message.contains("hasMore"));
        }
        other => panic!("expected UnexpectedResponse, got {other:?}"),
    }
}

// ============================================================================
// Facade tests
// ============================================================================

#[tokio::test]
async fn facade_connects_from_credential_file() {
    use std::io::Write;

    let server = MockServer::start().await;
    mount_key_handshake(&server, &long_lived_jwt(), "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/utils/whoami"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"userId": "user-1"})))
        .mount(&server)
        .await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"key": "fvpat-key", "secret": "fvpat-secret"}}"#).unwrap();

    let client = espalier::Espalier::connect(file.path(), mock_base(&server), None, None)
        .await
        .unwrap();

    let body = client.conn().get("/utils/whoami", None, None).await.unwrap();
    assert_eq!(body["userId"], "user-1");

    client.close().await;
}
