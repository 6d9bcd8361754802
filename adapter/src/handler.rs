use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common_auth::{
    ApiEnv, AuthError, AuthManager, ClaimsMap, JwksManager, KeyVerifier, KeyVerifierOptions,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::analytics::{AnalyticsManager, AnalyticsOptions};
use crate::config::Config;
use crate::metrics::AdapterMetrics;
use crate::product::ProductManager;
use crate::quota::{QuotaArgs, QuotaManager, QuotaOptions};
use crate::record::Record;

pub const MSG_MISSING_AUTH: &str = "missing authentication";
pub const MSG_INVALID_AUTH: &str = "invalid authentication";
pub const MSG_NOT_AUTHORIZED: &str = "not authorized";
pub const MSG_QUOTA_EXCEEDED: &str = "quota exceeded";
pub const MSG_INTERNAL: &str = "internal error";

/// Credential material forwarded by the policy plane.
#[derive(Debug, Default, Clone)]
pub struct Subject {
    pub api_key: Option<String>,
    /// JSON object of claims the mesh already decoded from a bearer token.
    pub json_claims: Option<String>,
}

/// The operation being attempted.
#[derive(Debug, Default, Clone)]
pub struct Action {
    pub service: String,
    pub path: String,
    pub method: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    PermissionDenied(&'static str),
    ResourceExhausted(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub verdict: Verdict,
    /// 1 when any matched product carries a positive quota, forcing the
    /// host to consult us on every request.
    pub valid_use_count: i32,
}

/// Per-request dispatcher owning all managers: auth, product resolution,
/// quota, and analytics.
pub struct Handler {
    env: Arc<ApiEnv>,
    api_key_claim: Option<String>,
    auth: AuthManager,
    jwks: JwksManager,
    products: ProductManager,
    quota: QuotaManager,
    analytics: AnalyticsManager,
    metrics: Arc<AdapterMetrics>,
}

impl Handler {
    pub fn builder(config: Config) -> HandlerBuilder {
        HandlerBuilder::new(config)
    }

    pub fn env(&self) -> &Arc<ApiEnv> {
        &self.env
    }

    pub fn metrics(&self) -> &Arc<AdapterMetrics> {
        &self.metrics
    }

    pub fn products(&self) -> &ProductManager {
        &self.products
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn analytics(&self) -> &AnalyticsManager {
        &self.analytics
    }

    pub fn jwks(&self) -> &JwksManager {
        &self.jwks
    }

    /// Authenticate, resolve products, and apply quota for one request.
    ///
    /// Auth errors supersede authorization failures; quota transport errors
    /// are fail-open, so a request is only rejected for quota once a result
    /// actually reports an overage.
    pub async fn authorize(&self, subject: &Subject, action: &Action) -> CheckResult {
        let claims = parse_claims(subject.json_claims.as_deref());
        let ctx = match self
            .auth
            .authenticate(
                &self.env,
                subject.api_key.as_deref(),
                claims.as_ref(),
                self.api_key_claim.as_deref(),
            )
            .await
        {
            Ok(ctx) => ctx,
            Err(err) => {
                let (label, verdict) = match err {
                    AuthError::NoAuth => ("no_auth", Verdict::PermissionDenied(MSG_MISSING_AUTH)),
                    AuthError::BadAuth => {
                        ("bad_auth", Verdict::PermissionDenied(MSG_INVALID_AUTH))
                    }
                    other => {
                        warn!(error = %other, "authentication failed internally");
                        ("internal", Verdict::PermissionDenied(MSG_INTERNAL))
                    }
                };
                self.metrics.record_authorize(label);
                return CheckResult {
                    verdict,
                    valid_use_count: 0,
                };
            }
        };

        let products = self
            .products
            .resolve(&ctx, &action.service, &action.path);
        if products.is_empty() {
            debug!(
                service = %action.service,
                path = %action.path,
                "no product authorizes this call"
            );
            self.metrics.record_authorize("not_authorized");
            return CheckResult {
                verdict: Verdict::PermissionDenied(MSG_NOT_AUTHORIZED),
                valid_use_count: 0,
            };
        }

        let mut any_quota = false;
        let mut exceeded = false;
        for product in &products {
            if !product.has_quota() {
                continue;
            }
            any_quota = true;
            let args = QuotaArgs {
                deduplication_id: String::new(),
                quota_amount: 1,
            };
            match self.quota.apply(&ctx, product, &args).await {
                Ok(result) if result.exceeded > 0 => exceeded = true,
                Ok(_) => {}
                Err(err) => {
                    // Fail open: the local bucket keeps answering.
                    warn!(product = %product.name, error = %err, "quota apply failed");
                }
            }
        }

        let valid_use_count = if any_quota { 1 } else { 0 };
        if exceeded {
            self.metrics.record_authorize("quota_exceeded");
            CheckResult {
                verdict: Verdict::ResourceExhausted(MSG_QUOTA_EXCEEDED),
                valid_use_count,
            }
        } else {
            self.metrics.record_authorize("ok");
            CheckResult {
                verdict: Verdict::Ok,
                valid_use_count,
            }
        }
    }

    /// Attributes reported records to a tenant and enqueues them for the
    /// analytics pipeline. Attribution is best effort; records without a
    /// resolvable identity are dropped with a warning.
    pub async fn report(&self, subject: &Subject, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let claims = parse_claims(subject.json_claims.as_deref());
        match self
            .auth
            .authenticate(
                &self.env,
                subject.api_key.as_deref(),
                claims.as_ref(),
                self.api_key_claim.as_deref(),
            )
            .await
        {
            Ok(ctx) => self.analytics.send_records(&ctx, records).await,
            Err(err) => {
                warn!(error = %err, count = records.len(), "report attribution failed");
            }
        }
    }

    /// Cancels every background loop and flushes analytics.
    pub async fn close(&self) {
        self.products.close().await;
        self.quota.close().await;
        self.analytics.close().await;
        self.jwks.close().await;
        self.auth.verifier().close().await;
    }
}

fn parse_claims(raw: Option<&str>) -> Option<ClaimsMap> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            warn!("ignoring malformed claims payload");
            None
        }
    }
}

/// Wires managers together; tests override the knobs they care about.
pub struct HandlerBuilder {
    config: Config,
    quota_opts: QuotaOptions,
    analytics_opts: Option<AnalyticsOptions>,
    verifier_opts: KeyVerifierOptions,
    jwks_poll: Duration,
}

impl HandlerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            quota_opts: QuotaOptions::default(),
            analytics_opts: None,
            verifier_opts: KeyVerifierOptions::default(),
            jwks_poll: Duration::from_secs(30 * 60),
        }
    }

    pub fn quota_options(mut self, opts: QuotaOptions) -> Self {
        self.quota_opts = opts;
        self
    }

    pub fn analytics_options(mut self, opts: AnalyticsOptions) -> Self {
        self.analytics_opts = Some(opts);
        self
    }

    pub fn verifier_options(mut self, opts: KeyVerifierOptions) -> Self {
        self.verifier_opts = opts;
        self
    }

    pub fn jwks_poll_interval(mut self, interval: Duration) -> Self {
        self.jwks_poll = interval;
        self
    }

    pub async fn build(self) -> Result<Handler> {
        let config = self.config;
        let client = reqwest::Client::builder()
            .timeout(config.server_timeout)
            .build()?;
        let env = Arc::new(ApiEnv::new(
            &config.org_name,
            &config.env_name,
            &config.apigee_base,
            &config.customer_base,
            &config.key,
            &config.secret,
            client.clone(),
        ));
        let metrics = Arc::new(AdapterMetrics::new()?);

        let jwks = JwksManager::new(client.clone());
        jwks.start(self.jwks_poll);

        let auth = AuthManager::new(KeyVerifier::with_options(self.verifier_opts));

        let products = ProductManager::new(Arc::clone(&env), config.products_refresh);
        if let Err(err) = products.refresh().await {
            warn!(error = %err, "initial product pull failed, catalog starts empty");
        }
        products.start();

        let quota = QuotaManager::new(Arc::clone(&env), self.quota_opts, Arc::clone(&metrics));

        let analytics_opts = self.analytics_opts.unwrap_or_else(|| AnalyticsOptions {
            root: config.temp_dir.clone(),
            staging_file_limit: config.analytics_file_limit,
            legacy_endpoint: config.analytics_legacy_endpoint,
            ..AnalyticsOptions::default()
        });
        // Uploads move file-sized bodies; give them more room than control
        // calls get.
        let upload_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let analytics = AnalyticsManager::new(
            Arc::clone(&env),
            upload_client,
            analytics_opts,
            Arc::clone(&metrics),
        )?;

        Ok(Handler {
            env,
            api_key_claim: config.api_key_claim,
            auth,
            jwks,
            products,
            quota,
            analytics,
            metrics,
        })
    }
}
