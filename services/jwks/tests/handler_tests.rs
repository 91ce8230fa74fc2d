#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Router-level tests for the JWKS service, backed by the in-memory device store.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use http_body_util::BodyExt;
use jwks_hsm::{AttributeSet, Curve, HsmKeyManager, KeyManager, MemoryStore, PublicKey};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn create_test_app() -> (Router, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let manager: Arc<dyn KeyManager> = Arc::new(HsmKeyManager::new(Arc::clone(&store)));
    (jwks_service::create_router(manager), store)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn generate(app: &Router, set: &str, kid: &str, alg: &str) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        &format!("/api/keys/{}", set),
        Some(json!({ "kid": kid, "alg": alg, "use": "sig" })),
    )
    .await
}

// ==================== Health Check Tests ====================

#[tokio::test]
async fn test_health_check() {
    let (app, _) = create_test_app();
    let (status, _) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

// ==================== Generation Tests ====================

#[tokio::test]
async fn test_generate_es256_returns_public_entry() {
    let (app, _) = create_test_app();
    let (status, body) = generate(&app, "openid.id-token", "abc", "ES256").await;

    assert_eq!(status, StatusCode::CREATED);
    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kid"], "public:abc");
    assert_eq!(keys[0]["kty"], "EC");
    assert_eq!(keys[0]["crv"], "P-256");
    assert_eq!(keys[0]["alg"], "ES256");
    assert_eq!(keys[0]["use"], "sig");
    assert!(keys[0].get("d").is_none());
}

#[tokio::test]
async fn test_generate_rs256_publishes_modulus_and_exponent() {
    let (app, _) = create_test_app();
    let (status, body) = generate(&app, "openid.id-token", "rsa", "RS256").await;

    assert_eq!(status, StatusCode::CREATED);
    let key = &body["keys"][0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["e"], "AQAB");
    let modulus = URL_SAFE_NO_PAD.decode(key["n"].as_str().unwrap()).unwrap();
    assert_eq!(modulus.len(), 512);
}

#[tokio::test]
async fn test_generate_without_kid_assigns_one() {
    let (app, _) = create_test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/keys/openid.id-token",
        Some(json!({ "alg": "ES512" })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    let kid = body["keys"][0]["kid"].as_str().unwrap();
    let suffix = kid.strip_prefix("public:").unwrap();
    assert_eq!(suffix.len(), 32);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(body["keys"][0]["use"], "sig");
}

#[tokio::test]
async fn test_generate_encryption_key() {
    let (app, _) = create_test_app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/keys/openid.userinfo",
        Some(json!({ "kid": "enc-1", "alg": "RS256", "use": "enc" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "GET", "/api/keys/openid.userinfo/enc-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"][0]["use"], "enc");
}

#[tokio::test]
async fn test_generate_unsupported_algorithm() {
    let (app, store) = create_test_app();
    let (status, body) = generate(&app, "openid.id-token", "abc", "ES384").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("ES384"));
    assert!(store.generate_calls().is_empty());
}

#[tokio::test]
async fn test_generate_unknown_usage() {
    let (app, store) = create_test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/keys/openid.id-token",
        Some(json!({ "kid": "abc", "alg": "ES256", "use": "wrap" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("wrap"));
    assert!(store.generate_calls().is_empty());
}

#[tokio::test]
async fn test_generate_empty_kid() {
    let (app, _) = create_test_app();
    let (status, _) = generate(&app, "openid.id-token", "", "ES256").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_generate_device_failure_is_internal_error() {
    let (app, store) = create_test_app();
    store.fail_generation();
    let (status, _) = generate(&app, "openid.id-token", "abc", "ES256").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

// ==================== Retrieval Tests ====================

#[tokio::test]
async fn test_get_key_set_lists_every_public_entry() {
    let (app, _) = create_test_app();
    generate(&app, "openid.id-token", "a", "ES256").await;
    generate(&app, "openid.id-token", "b", "RS256").await;
    generate(&app, "other", "c", "ES512").await;

    let (status, body) = send(&app, "GET", "/api/keys/openid.id-token", None).await;
    assert_eq!(status, StatusCode::OK);

    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0]["kid"], "public:a");
    assert_eq!(keys[0]["alg"], "ES256");
    assert_eq!(keys[1]["kid"], "public:b");
    assert_eq!(keys[1]["alg"], "RS256");
    assert!(
        keys.iter()
            .all(|k| k["kid"].as_str().unwrap().starts_with("public:"))
    );
}

#[tokio::test]
async fn test_get_key_set_not_found() {
    let (app, _) = create_test_app();
    let (status, body) = send(&app, "GET", "/api/keys/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_get_key_not_found() {
    let (app, _) = create_test_app();
    generate(&app, "openid.id-token", "a", "ES256").await;
    let (status, _) = send(&app, "GET", "/api/keys/openid.id-token/b", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lookup_failure_is_internal_error() {
    let (app, store) = create_test_app();
    store.fail_lookups();
    let (status, _) = send(&app, "GET", "/api/keys/openid.id-token/a", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_malformed_stored_key_is_internal_error() {
    let (app, store) = create_test_app();
    store.insert_key_pair(
        AttributeSet::with_id_and_label(b"short", b"openid.id-token"),
        PublicKey::Ec {
            curve: Curve::P256,
            point: vec![0x04, 0x01, 0x02],
        },
    );

    let (status, _) = send(&app, "GET", "/api/keys/openid.id-token/short", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _) = send(&app, "GET", "/api/keys/openid.id-token", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

// ==================== Deletion Tests ====================

#[tokio::test]
async fn test_delete_key() {
    let (app, store) = create_test_app();
    generate(&app, "openid.id-token", "a", "ES256").await;
    generate(&app, "openid.id-token", "b", "ES256").await;

    let (status, _) = send(&app, "DELETE", "/api/keys/openid.id-token/a", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", "/api/keys/openid.id-token/a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/api/keys/openid.id-token/b", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(store.object_count(), 1);
}

#[tokio::test]
async fn test_delete_missing_key() {
    let (app, _) = create_test_app();
    let (status, _) = send(&app, "DELETE", "/api/keys/openid.id-token/a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_key_set() {
    let (app, store) = create_test_app();
    generate(&app, "openid.id-token", "a", "ES256").await;
    generate(&app, "openid.id-token", "b", "RS256").await;
    generate(&app, "other", "c", "ES256").await;

    let (status, _) = send(&app, "DELETE", "/api/keys/openid.id-token", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", "/api/keys/openid.id-token", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(store.object_count(), 1);
}

#[tokio::test]
async fn test_delete_empty_key_set() {
    let (app, _) = create_test_app();
    let (status, _) = send(&app, "DELETE", "/api/keys/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ==================== Import Tests ====================

#[tokio::test]
async fn test_update_key_set_refused() {
    let (app, store) = create_test_app();
    let (status, body) = send(
        &app,
        "PUT",
        "/api/keys/openid.id-token",
        Some(json!({ "keys": [] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert_eq!(store.object_count(), 0);
}

// ==================== Signing Tests ====================

#[tokio::test]
async fn test_sign_with_generated_key() {
    let (app, _) = create_test_app();
    generate(&app, "openid.id-token", "a", "ES256").await;

    let data = URL_SAFE_NO_PAD.encode(b"header.payload");
    let (status, body) = send(
        &app,
        "POST",
        "/api/keys/openid.id-token/a/sign",
        Some(json!({ "data": data })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kid"], "a");
    assert_eq!(body["alg"], "ES256");
    let signature = URL_SAFE_NO_PAD
        .decode(body["signature"].as_str().unwrap())
        .unwrap();
    assert!(!signature.is_empty());
}

#[tokio::test]
async fn test_sign_is_deterministic_per_key() {
    let (app, _) = create_test_app();
    generate(&app, "openid.id-token", "a", "ES512").await;

    let request = json!({ "data": URL_SAFE_NO_PAD.encode(b"payload") });
    let (_, first) = send(
        &app,
        "POST",
        "/api/keys/openid.id-token/a/sign",
        Some(request.clone()),
    )
    .await;
    let (_, second) = send(
        &app,
        "POST",
        "/api/keys/openid.id-token/a/sign",
        Some(request),
    )
    .await;

    assert_eq!(first["signature"], second["signature"]);
    assert_eq!(first["alg"], "ES512");
}

#[tokio::test]
async fn test_sign_invalid_data() {
    let (app, _) = create_test_app();
    generate(&app, "openid.id-token", "a", "ES256").await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/keys/openid.id-token/a/sign",
        Some(json!({ "data": "not base64!" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sign_missing_key() {
    let (app, _) = create_test_app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/keys/openid.id-token/a/sign",
        Some(json!({ "data": URL_SAFE_NO_PAD.encode(b"x") })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
