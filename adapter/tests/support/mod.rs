#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use apigee_adapter::Config;
use axum::body::Bytes;
use axum::extract::Path as AxumPath;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// In-memory Apigee backend covering verifyApiKey, products, quotas, and the
/// analytics upload flow.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub verify_calls: Arc<AtomicUsize>,
    pub quota_calls: Arc<AtomicUsize>,
    pub uploads: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Number of upcoming PUTs to fail with a 500.
    pub fail_puts: Arc<AtomicUsize>,
    /// Status served by the signed-url endpoint (200 normally).
    pub signed_url_status: Arc<AtomicU16>,
}

fn self_issued_token(application_name: &str, products: &[&str]) -> String {
    let claims = json!({
        "client_id": "test-client",
        "application_name": application_name,
        "api_product_list": products,
        "scopes": ["scope1"],
        "exp": (Utc::now() + ChronoDuration::hours(1)).timestamp(),
        "application_developeremail": "dev@example.com",
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"self-issued"),
    )
    .expect("encode token")
}

fn catalog() -> Value {
    json!({
        "apiProduct": [
            {
                "name": "IstioTestProduct",
                "displayName": "Istio Test Product",
                "environments": ["test"],
                "apiResources": ["/"],
                "scopes": ["scope1"],
                "quota": "1",
                "quotaInterval": "1",
                "quotaTimeUnit": "second",
                "attributes": [
                    { "name": "istio-services", "value": "service" }
                ]
            },
            {
                "name": "FreeProduct",
                "displayName": "Free Product",
                "environments": ["test"],
                "apiResources": ["/free/**"],
                "scopes": [],
                "quota": "",
                "quotaInterval": "",
                "quotaTimeUnit": "",
                "attributes": [
                    { "name": "istio-services", "value": "service" }
                ]
            }
        ]
    })
}

fn unit_seconds(unit: &str) -> i64 {
    match unit {
        "minute" => 60,
        "hour" => 60 * 60,
        "day" => 24 * 60 * 60,
        "month" => 30 * 24 * 60 * 60,
        _ => 1,
    }
}

pub async fn spawn_backend() -> Result<MockBackend> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let verify_calls = Arc::new(AtomicUsize::new(0));
    let quota_calls = Arc::new(AtomicUsize::new(0));
    let uploads: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let fail_puts = Arc::new(AtomicUsize::new(0));
    let signed_url_status = Arc::new(AtomicU16::new(200));
    // identifier -> (window start, counted weight)
    let windows: Arc<Mutex<HashMap<String, (i64, i64)>>> = Arc::new(Mutex::new(HashMap::new()));

    let verify = verify_calls.clone();
    let quota = quota_calls.clone();
    let uploads_sink = uploads.clone();
    let failing = fail_puts.clone();
    let url_status = signed_url_status.clone();

    let router = Router::new()
        .route(
            "/verifyApiKey",
            post(move |Json(body): Json<Value>| {
                let verify = verify.clone();
                async move {
                    verify.fetch_add(1, Ordering::SeqCst);
                    let key = body["apiKey"].as_str().unwrap_or_default();
                    if key == "goodkey" {
                        Json(json!({ "token": self_issued_token("test-app", &["IstioTestProduct"]) }))
                    } else {
                        Json(json!({ "token": "" }))
                    }
                }
            }),
        )
        .route("/products", get(|| async { Json(catalog()) }))
        .route(
            "/quotas",
            post(move |Json(body): Json<Value>| {
                let quota = quota.clone();
                let windows = windows.clone();
                async move {
                    quota.fetch_add(1, Ordering::SeqCst);
                    let identifier = body["identifier"].as_str().unwrap_or_default().to_string();
                    let weight = body["weight"].as_i64().unwrap_or(0);
                    let allow = body["allow"].as_i64().unwrap_or(0);
                    let interval = body["interval"].as_i64().unwrap_or(1).max(1);
                    let window =
                        interval * unit_seconds(body["timeUnit"].as_str().unwrap_or("second"));

                    let now = Utc::now().timestamp();
                    let mut guard = windows.lock().unwrap();
                    let entry = guard.entry(identifier).or_insert((now, 0));
                    if now >= entry.0 + window {
                        *entry = (now, 0);
                    }
                    entry.1 += weight;
                    let exceeded = (entry.1 - allow).max(0);
                    let used = entry.1.min(allow);
                    Json(json!({
                        "allowed": allow,
                        "used": used,
                        "exceeded": exceeded,
                        "expiryTime": entry.0 + window,
                        "timestamp": now,
                    }))
                }
            }),
        )
        .route(
            "/analytics/organization/:org/environment/:env",
            get(move || {
                let url_status = url_status.clone();
                async move {
                    match url_status.load(Ordering::SeqCst) {
                        200 => Json(json!({ "url": format!("http://{addr}/upload/next") }))
                            .into_response(),
                        code => StatusCode::from_u16(code)
                            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                            .into_response(),
                    }
                }
            }),
        )
        .route(
            "/axpublisher/organization/:org/environment/:env",
            post({
                let uploads_sink = uploads_sink.clone();
                move |body: Bytes| {
                    let uploads_sink = uploads_sink.clone();
                    async move {
                        uploads_sink.lock().unwrap().push(body.to_vec());
                        StatusCode::OK
                    }
                }
            }),
        )
        .route(
            "/upload/:id",
            put(move |AxumPath(_id): AxumPath<String>, body: Bytes| {
                let uploads_sink = uploads_sink.clone();
                let failing = failing.clone();
                async move {
                    if failing
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return StatusCode::INTERNAL_SERVER_ERROR;
                    }
                    uploads_sink.lock().unwrap().push(body.to_vec());
                    StatusCode::OK
                }
            }),
        );

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router.into_make_service()).await {
            eprintln!("mock backend error: {err}");
        }
    });

    Ok(MockBackend {
        addr,
        verify_calls,
        quota_calls,
        uploads,
        fail_puts,
        signed_url_status,
    })
}

pub fn test_config(addr: SocketAddr, temp_dir: &Path) -> Config {
    Config {
        apigee_base: format!("http://{addr}"),
        customer_base: format!("http://{addr}"),
        org_name: "org".to_string(),
        env_name: "test".to_string(),
        key: "key".to_string(),
        secret: "secret".to_string(),
        api_key_claim: Some("api_key".to_string()),
        temp_dir: temp_dir.to_path_buf(),
        server_timeout: Duration::from_secs(5),
        products_refresh: Duration::from_secs(60),
        analytics_file_limit: 1024,
        analytics_legacy_endpoint: false,
    }
}
