use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::ServiceExt;

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use base64::Engine as _;
use sha2::Digest as _;

use autograph::formats::{new_reference, SignatureResponse};
use autograph::hawk::{build_authorization_header, RequestInfo};
use autograph::signing::templated_digest;
use autograph::{build_state, router, AppState, Config};

const ALICE_KEY: &str = "fqm4k6rlqpvrkfy7165u8zgyt0j5mccmmx8on0nrbbzemldw";
const BOB_KEY: &str = "9vh6bhlc10y63ow2k4zke7k0c3l9hpr8mo96p92jmbfqngs9";
const MONITOR_KEY: &str = "1862300e9ddd0a42a1a1aa5c8fb0a1b6c2a9ba4e7f8e0c4d";

// ── Test environment ─────────────────────────────────────────────────

/// A built service over a throwaway chain store directory.
struct TestEnv {
    state: Arc<AppState>,
    _upload_dir: tempfile::TempDir,
}

async fn test_env() -> TestEnv {
    let upload_dir = tempfile::tempdir().unwrap();
    let location = format!("file://{}/", upload_dir.path().display());

    let config = serde_json::json!({
        "server": { "listen": "127.0.0.1:8000" },
        "signers": [
            {
                "id": "appkey1",
                "type": "contentsignature",
                "private_key": include_str!("fixtures/appkey1.key"),
            },
            {
                "id": "pki1",
                "type": "contentsignaturepki",
                "private_key": include_str!("fixtures/inter.key"),
                "issuer_cert": include_str!("fixtures/inter.pem"),
                "root_cert": include_str!("fixtures/root.pem"),
                "chain_upload_location": location,
                "validity_days": 90,
                "refresh_window_days": 30,
            },
            {
                "id": "rsa1",
                "type": "genericrsa",
                "mode": "pss",
                "digest": "sha384",
                "private_key": include_str!("fixtures/rsa1.key"),
            },
            {
                "id": "apk1",
                "type": "apk2",
                "private_key": include_str!("fixtures/apk1.key"),
                "certificate": include_str!("fixtures/apk1.pem"),
            }
        ],
        "authorizations": [
            { "id": "alice", "key": ALICE_KEY, "signers": ["appkey1", "pki1", "rsa1"] },
            { "id": "bob", "key": BOB_KEY, "signers": ["apk1"] }
        ],
        "monitoring": { "key": MONITOR_KEY }
    });

    let config = Config::from_json(&config.to_string()).unwrap();
    let state = Arc::new(build_state(&config).await.unwrap());
    TestEnv {
        state,
        _upload_dir: upload_dir,
    }
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

fn auth_header(id: &str, key: &str, method: &str, path: &str, body: &[u8], ts: i64) -> String {
    build_authorization_header(
        id,
        key,
        &RequestInfo {
            method,
            path,
            host: "localhost",
            port: 8000,
            content_type: "application/json",
            body,
        },
        ts,
        &new_reference(),
        "",
    )
}

fn signed_post(path: &str, id: &str, key: &str, body: &str) -> Request<Body> {
    let authorization = auth_header(id, key, "POST", path, body.as_bytes(), unix_now());
    request_with_header(path, authorization, body)
}

fn request_with_header(path: &str, authorization: String, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::HOST, "localhost:8000")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, authorization)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn response_parts(response: axum::response::Response) -> (StatusCode, String) {
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

fn data_body(payload: &[u8]) -> String {
    serde_json::json!([{ "input": B64.encode(payload) }]).to_string()
}

// ── Happy paths ──────────────────────────────────────────────────────

#[tokio::test]
async fn content_signature_data_request_verifies() {
    let env = test_env().await;
    let body = data_body(b"hello");
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let responses: Vec<SignatureResponse> = serde_json::from_str(&body).unwrap();
    assert_eq!(responses.len(), 1);
    let entry = &responses[0];
    assert_eq!(entry.signer_id, "appkey1");
    assert_eq!(entry.type_tag, "contentsignature");
    assert_eq!(entry.mode, "p256ecdsa");

    // Detached content signatures travel as unpadded URL-safe base64.
    let sig_bytes = B64_URL
        .decode(entry.signature.as_deref().unwrap())
        .unwrap();
    assert_eq!(sig_bytes.len(), 64);

    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::pkcs8::DecodePublicKey as _;
    let public_key_der = B64.decode(entry.public_key.as_deref().unwrap()).unwrap();
    let verifying_key = p256::ecdsa::VerifyingKey::from_public_key_der(&public_key_der).unwrap();
    let signature = p256::ecdsa::Signature::from_slice(&sig_bytes).unwrap();
    verifying_key
        .verify_prehash(&templated_digest(b"hello"), &signature)
        .unwrap();
}

#[tokio::test]
async fn hash_request_with_matching_digest_length_verifies() {
    let env = test_env().await;
    let digest = sha2::Sha384::digest(b"prehashed payload").to_vec();
    let body =
        serde_json::json!([{ "input": hex::encode(&digest), "keyid": "rsa1" }]).to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/hash", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let responses: Vec<SignatureResponse> = serde_json::from_str(&body).unwrap();
    let entry = &responses[0];
    assert_eq!(entry.signer_id, "rsa1");
    assert_eq!(entry.mode, "pss");

    use rsa::pkcs8::DecodePublicKey as _;
    let public_key_der = B64.decode(entry.public_key.as_deref().unwrap()).unwrap();
    let public_key = rsa::RsaPublicKey::from_public_key_der(&public_key_der).unwrap();
    let sig = B64.decode(entry.signature.as_deref().unwrap()).unwrap();
    public_key
        .verify(rsa::Pss::new::<sha2::Sha384>(), &digest, &sig)
        .unwrap();
}

#[tokio::test]
async fn task_options_are_merged_over_signer_defaults() {
    let env = test_env().await;
    let digest = sha2::Sha384::digest(b"salted payload").to_vec();
    // rsa1 defaults to a 48-byte PSS salt; the task shrinks it to 20.
    let body = serde_json::json!([{
        "input": hex::encode(&digest),
        "keyid": "rsa1",
        "options": {"saltlength": 20},
    }])
    .to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/hash", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let responses: Vec<SignatureResponse> = serde_json::from_str(&body).unwrap();
    let entry = &responses[0];

    use rsa::pkcs8::DecodePublicKey as _;
    let public_key_der = B64.decode(entry.public_key.as_deref().unwrap()).unwrap();
    let public_key = rsa::RsaPublicKey::from_public_key_der(&public_key_der).unwrap();
    let sig = B64.decode(entry.signature.as_deref().unwrap()).unwrap();
    public_key
        .verify(rsa::Pss::new_with_salt::<sha2::Sha384>(20), &digest, &sig)
        .unwrap();
}

#[tokio::test]
async fn tasks_are_answered_in_input_order() {
    let env = test_env().await;
    let body = serde_json::json!([
        { "input": B64.encode(b"first") },
        { "input": B64.encode(b"second"), "keyid": "rsa1" },
    ])
    .to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let responses: Vec<SignatureResponse> = serde_json::from_str(&body).unwrap();
    let signers: Vec<&str> = responses.iter().map(|r| r.signer_id.as_str()).collect();
    assert_eq!(signers, ["appkey1", "rsa1"]);
    assert_ne!(responses[0].reference, responses[1].reference);
}

#[tokio::test]
async fn pki_signer_reports_x5u() {
    let env = test_env().await;
    let body = serde_json::json!([{ "input": B64.encode(b"data"), "keyid": "pki1" }]).to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let responses: Vec<SignatureResponse> = serde_json::from_str(&body).unwrap();
    let x5u = responses[0].x5u.as_deref().unwrap();
    assert!(x5u.starts_with("file://"));
    assert!(x5u.ends_with(".pem"));
}

// ── Replay and tampering ─────────────────────────────────────────────

#[tokio::test]
async fn replayed_nonce_is_rejected() {
    let env = test_env().await;
    let body = data_body(b"hello");
    let authorization = auth_header("alice", ALICE_KEY, "POST", "/sign/data", body.as_bytes(), unix_now());

    let response = router(env.state.clone())
        .oneshot(request_with_header("/sign/data", authorization.clone(), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router(env.state.clone())
        .oneshot(request_with_header("/sign/data", authorization, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("nonce"), "{body}");
}

#[tokio::test]
async fn tampered_body_fails_payload_hash() {
    let env = test_env().await;
    let signed_over = data_body(b"hello");
    let authorization = auth_header(
        "alice",
        ALICE_KEY,
        "POST",
        "/sign/data",
        signed_over.as_bytes(),
        unix_now(),
    );
    let tampered = data_body(b"hellp");
    let response = router(env.state.clone())
        .oneshot(request_with_header("/sign/data", authorization, &tampered))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("payload"), "{body}");
}

#[tokio::test]
async fn wrong_secret_fails_mac() {
    let env = test_env().await;
    let body = data_body(b"hello");
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "alice", "wrong-secret", &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("mac"), "{body}");
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let env = test_env().await;
    let body = data_body(b"hello");
    let authorization = auth_header(
        "alice",
        ALICE_KEY,
        "POST",
        "/sign/data",
        body.as_bytes(),
        unix_now() - 3600,
    );
    let response = router(env.state.clone())
        .oneshot(request_with_header("/sign/data", authorization, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("skew"), "{body}");
}

#[tokio::test]
async fn unknown_principal_is_rejected() {
    let env = test_env().await;
    let body = data_body(b"hello");
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "mallory", ALICE_KEY, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_authorization_header_is_rejected() {
    let env = test_env().await;
    let request = Request::builder()
        .method("POST")
        .uri("/sign/data")
        .header(header::HOST, "localhost:8000")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(data_body(b"hello")))
        .unwrap();
    let response = router(env.state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ── Authorization and capabilities ───────────────────────────────────

#[tokio::test]
async fn forbidden_signer_is_rejected() {
    let env = test_env().await;
    let body = serde_json::json!([{ "input": B64.encode(b"x"), "keyid": "appkey1" }]).to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "bob", BOB_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("not authorized"), "{body}");
}

#[tokio::test]
async fn file_only_signer_rejects_hash_route() {
    let env = test_env().await;
    let digest = sha2::Sha256::digest(b"x").to_vec();
    let body = serde_json::json!([{ "input": hex::encode(digest) }]).to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/hash", "bob", BOB_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("hash"), "{body}");
}

#[tokio::test]
async fn data_signer_rejects_file_route() {
    let env = test_env().await;
    let body = data_body(b"not an apk");
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/file", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("file"), "{body}");
}

// ── Input validation ─────────────────────────────────────────────────

#[tokio::test]
async fn short_digest_is_rejected_with_expected_length() {
    let env = test_env().await;
    // rsa1 is configured for SHA-384; a 32-byte digest must not pass.
    let digest = sha2::Sha256::digest(b"x").to_vec();
    let body =
        serde_json::json!([{ "input": hex::encode(digest), "keyid": "rsa1" }]).to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/hash", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("48"), "{body}");
}

#[tokio::test]
async fn malformed_json_body_is_rejected() {
    let env = test_env().await;
    let body = "this is not json";
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "alice", ALICE_KEY, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_base64_input_is_rejected() {
    let env = test_env().await;
    let body = serde_json::json!([{ "input": "!!not base64!!" }]).to_string();
    let response = router(env.state.clone())
        .oneshot(signed_post("/sign/data", "alice", ALICE_KEY, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── Health endpoints ─────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoints_are_unauthenticated() {
    let env = test_env().await;
    for path in ["/__heartbeat__", "/__lbheartbeat__", "/__version__"] {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = router(env.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn version_reports_the_crate() {
    let env = test_env().await;
    let request = Request::builder()
        .uri("/__version__")
        .body(Body::empty())
        .unwrap();
    let response = router(env.state.clone()).oneshot(request).await.unwrap();
    let (status, body) = response_parts(response).await;
    assert_eq!(status, StatusCode::OK);
    let version: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(version["name"], "autograph");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let env = test_env().await;
    let request = Request::builder()
        .uri("/nonexistent")
        .body(Body::empty())
        .unwrap();
    let response = router(env.state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
