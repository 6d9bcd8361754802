mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use apigee_adapter::{AdapterMetrics, ProductManager, QuotaArgs, QuotaManager, QuotaOptions};
use chrono::{Duration as ChronoDuration, Utc};
use common_auth::{ApiEnv, AuthContext};
use serde_json::json;

use support::{spawn_backend, MockBackend};

fn env_for(backend: &MockBackend) -> Arc<ApiEnv> {
    Arc::new(ApiEnv::new(
        "org",
        "test",
        format!("http://{}", backend.addr),
        format!("http://{}", backend.addr),
        "key",
        "secret",
        reqwest::Client::new(),
    ))
}

fn context(env: &Arc<ApiEnv>) -> AuthContext {
    let claims = json!({
        "client_id": "client",
        "application_name": "app",
        "api_product_list": ["IstioTestProduct"],
        "scopes": ["scope1"],
        "exp": (Utc::now() + ChronoDuration::hours(1)).timestamp(),
    });
    AuthContext::from_claims(Arc::clone(env), claims.as_object().unwrap()).expect("claims")
}

/// Background scans stay quiet so backend calls are deterministic.
fn manual_options() -> QuotaOptions {
    QuotaOptions {
        sync_rate: Duration::from_secs(3600),
        ..QuotaOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn new_buckets_sync_before_first_apply() -> Result<()> {
    let backend = spawn_backend().await?;
    let env = env_for(&backend);
    let products = ProductManager::new(Arc::clone(&env), Duration::from_secs(60));
    products.refresh().await?;
    let product = products.catalog().get("IstioTestProduct").unwrap().clone();

    let metrics = Arc::new(AdapterMetrics::new()?);
    let quota = QuotaManager::new(Arc::clone(&env), manual_options(), metrics);
    let ctx = context(&env);

    let result = quota
        .apply(&ctx, &product, &QuotaArgs { deduplication_id: String::new(), quota_amount: 1 })
        .await?;
    assert_eq!(result.allowed, 1);
    assert_eq!(result.used, 1);
    assert_eq!(result.exceeded, 0);
    // The authoritative window was established synchronously.
    assert!(result.expiry_time > 0);
    assert_eq!(backend.quota_calls.load(Ordering::SeqCst), 1);

    quota.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deduplicated_applies_return_the_cached_result() -> Result<()> {
    let backend = spawn_backend().await?;
    let env = env_for(&backend);
    let products = ProductManager::new(Arc::clone(&env), Duration::from_secs(60));
    products.refresh().await?;
    let product = products.catalog().get("IstioTestProduct").unwrap().clone();

    let metrics = Arc::new(AdapterMetrics::new()?);
    let quota = QuotaManager::new(Arc::clone(&env), manual_options(), metrics);
    let ctx = context(&env);

    let args = QuotaArgs {
        deduplication_id: "X".to_string(),
        quota_amount: 1,
    };
    let first = quota.apply(&ctx, &product, &args).await?;
    let calls_after_first = backend.quota_calls.load(Ordering::SeqCst);

    let second = quota.apply(&ctx, &product, &args).await?;
    assert_eq!(first, second);
    // The retry neither contacted the backend nor recharged the bucket.
    assert_eq!(backend.quota_calls.load(Ordering::SeqCst), calls_after_first);

    let third = quota
        .apply(
            &ctx,
            &product,
            &QuotaArgs {
                deduplication_id: "Y".to_string(),
                quota_amount: 1,
            },
        )
        .await?;
    assert_eq!(third.exceeded, 1, "fresh id charges the bucket");

    quota.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn background_loop_reconciles_pending_weight() -> Result<()> {
    let backend = spawn_backend().await?;
    let env = env_for(&backend);
    let products = ProductManager::new(Arc::clone(&env), Duration::from_secs(60));
    products.refresh().await?;
    let product = products.catalog().get("IstioTestProduct").unwrap().clone();

    let metrics = Arc::new(AdapterMetrics::new()?);
    let quota = QuotaManager::new(
        Arc::clone(&env),
        QuotaOptions {
            sync_rate: Duration::from_millis(50),
            ..QuotaOptions::default()
        },
        metrics,
    );
    let ctx = context(&env);

    quota
        .apply(&ctx, &product, &QuotaArgs { deduplication_id: String::new(), quota_amount: 1 })
        .await?;
    let initial = backend.quota_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        backend.quota_calls.load(Ordering::SeqCst) > initial,
        "pending weight never synced"
    );

    quota.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_fails_open_when_the_backend_is_down() -> Result<()> {
    let backend = spawn_backend().await?;
    let reachable = env_for(&backend);
    let products = ProductManager::new(Arc::clone(&reachable), Duration::from_secs(60));
    products.refresh().await?;
    let product = products.catalog().get("IstioTestProduct").unwrap().clone();

    // Quota traffic goes to a dead port.
    let dead = Arc::new(ApiEnv::new(
        "org",
        "test",
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
        "key",
        "secret",
        reqwest::Client::new(),
    ));
    let metrics = Arc::new(AdapterMetrics::new()?);
    let quota = QuotaManager::new(Arc::clone(&dead), manual_options(), metrics);
    let ctx = context(&dead);

    let result = quota
        .apply(&ctx, &product, &QuotaArgs { deduplication_id: String::new(), quota_amount: 1 })
        .await?;
    assert_eq!(result.used, 1);
    assert_eq!(result.exceeded, 0);

    quota.close().await;
    Ok(())
}
