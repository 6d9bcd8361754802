use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use common_auth::{parse_jwt, ApiEnv, AuthError, JwksManager};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct SigningKey {
    pem: String,
    jwks_body: Value,
}

fn signing_key(kid: &str) -> Result<SigningKey> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048)?;
    let public_key = private_key.to_public_key();
    let modulus = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let exponent = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
    let pem = private_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)?
        .to_string();
    let jwks_body = json!({
        "keys": [
            { "kid": kid, "kty": "RSA", "alg": "RS256", "use": "sig", "n": modulus, "e": exponent }
        ]
    });
    Ok(SigningKey { pem, jwks_body })
}

fn signed_token(key: &SigningKey, kid: &str, exp: i64) -> Result<String> {
    let claims = json!({
        "client_id": "client",
        "application_name": "app",
        "exp": exp,
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let encoding_key = EncodingKey::from_rsa_pem(key.pem.as_bytes())?;
    Ok(encode(&header, &claims, &encoding_key)?)
}

async fn spawn_certs_server(
    jwks_body: Value,
    attempts: Arc<AtomicUsize>,
    fail_after: usize,
) -> Result<SocketAddr> {
    let router = Router::new().route(
        "/certs",
        get(move || {
            let attempts = attempts.clone();
            let jwks_body = jwks_body.clone();
            async move {
                let step = attempts.fetch_add(1, Ordering::SeqCst);
                if step >= fail_after {
                    StatusCode::BAD_GATEWAY.into_response()
                } else {
                    Json(jwks_body).into_response()
                }
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router.into_make_service()).await {
            eprintln!("certs server error: {err}");
        }
    });
    Ok(addr)
}

fn env_for(addr: SocketAddr) -> ApiEnv {
    ApiEnv::new(
        "org",
        "test",
        format!("http://{addr}"),
        format!("http://{addr}"),
        "key",
        "secret",
        reqwest::Client::new(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn verified_parse_accepts_a_signed_token() -> Result<()> {
    let key = signing_key("test-key")?;
    let attempts = Arc::new(AtomicUsize::new(0));
    let addr = spawn_certs_server(key.jwks_body.clone(), attempts.clone(), usize::MAX).await?;
    let env = env_for(addr);
    let jwks = JwksManager::new(reqwest::Client::new());

    let exp = (Utc::now() + ChronoDuration::minutes(15)).timestamp();
    let token = signed_token(&key, "test-key", exp)?;

    let claims = parse_jwt(&jwks, &env, &token, true).await?;
    assert_eq!(claims["client_id"], "client");
    // The set was fetched lazily exactly once.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    parse_jwt(&jwks, &env, &token, true).await?;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_tokens_fail_signature_aside() -> Result<()> {
    let key = signing_key("test-key")?;
    let attempts = Arc::new(AtomicUsize::new(0));
    let addr = spawn_certs_server(key.jwks_body.clone(), attempts, usize::MAX).await?;
    let env = env_for(addr);
    let jwks = JwksManager::new(reqwest::Client::new());

    // Well past the ±10s skew tolerance.
    let exp = (Utc::now() - ChronoDuration::minutes(5)).timestamp();
    let token = signed_token(&key, "test-key", exp)?;

    match parse_jwt(&jwks, &env, &token, true).await {
        Err(AuthError::InvalidJws(_)) => (),
        other => panic!("expected InvalidJws, got {other:?}"),
    }

    // Unverified parsing still surfaces the claims.
    let claims = parse_jwt(&jwks, &env, &token, false).await?;
    assert_eq!(claims["application_name"], "app");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_kid_is_invalid_jws() -> Result<()> {
    let key = signing_key("other-key")?;
    let attempts = Arc::new(AtomicUsize::new(0));
    let addr = spawn_certs_server(key.jwks_body.clone(), attempts, usize::MAX).await?;
    let env = env_for(addr);
    let jwks = JwksManager::new(reqwest::Client::new());

    let exp = (Utc::now() + ChronoDuration::minutes(15)).timestamp();
    let token = signed_token(&key, "missing-key", exp)?;

    match parse_jwt(&jwks, &env, &token, true).await {
        Err(AuthError::InvalidJws(message)) => {
            assert!(message.contains("missing-key"), "message: {message}")
        }
        other => panic!("expected InvalidJws, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_continues_past_a_failing_issuer() -> Result<()> {
    let key = signing_key("test-key")?;
    let attempts = Arc::new(AtomicUsize::new(0));
    // First fetch succeeds, later refreshes fail.
    let addr = spawn_certs_server(key.jwks_body.clone(), attempts.clone(), 1).await?;
    let env = env_for(addr);
    let jwks = JwksManager::new(reqwest::Client::new());

    jwks.get(&env).await?;
    assert!(jwks.last_error().is_none());

    match jwks.refresh().await {
        Err(AuthError::JwksFetch(_)) => (),
        other => panic!("expected JwksFetch, got {other:?}"),
    }
    assert!(jwks.last_error().is_some());

    // The stale set keeps serving verifications.
    let exp = (Utc::now() + ChronoDuration::minutes(15)).timestamp();
    let token = signed_token(&key, "test-key", exp)?;
    parse_jwt(&jwks, &env, &token, true).await?;

    jwks.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn poller_refreshes_known_sets() -> Result<()> {
    let key = signing_key("test-key")?;
    let attempts = Arc::new(AtomicUsize::new(0));
    let addr = spawn_certs_server(key.jwks_body.clone(), attempts.clone(), usize::MAX).await?;
    let env = env_for(addr);
    let jwks = JwksManager::new(reqwest::Client::new());

    jwks.get(&env).await?;
    jwks.start(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(attempts.load(Ordering::SeqCst) >= 2, "poller never refreshed");

    jwks.close().await;
    Ok(())
}
