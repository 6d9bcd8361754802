use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Adapter configuration, loadable from the environment or constructed
/// directly by tests.
#[derive(Debug, Clone)]
pub struct Config {
    pub apigee_base: String,
    pub customer_base: String,
    pub org_name: String,
    pub env_name: String,
    pub key: String,
    pub secret: String,
    /// JWT claim carrying an embedded API key, if the mesh forwards one.
    pub api_key_claim: Option<String>,
    pub temp_dir: PathBuf,
    pub server_timeout: Duration,
    pub products_refresh: Duration,
    pub analytics_file_limit: usize,
    pub analytics_legacy_endpoint: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let apigee_base = env::var("APIGEE_BASE").context("APIGEE_BASE must be set")?;
        let customer_base = env::var("CUSTOMER_BASE").context("CUSTOMER_BASE must be set")?;
        let org_name = env::var("APIGEE_ORG").context("APIGEE_ORG must be set")?;
        let env_name = env::var("APIGEE_ENV").context("APIGEE_ENV must be set")?;
        let key = env::var("APIGEE_KEY").context("APIGEE_KEY must be set")?;
        let secret = env::var("APIGEE_SECRET").context("APIGEE_SECRET must be set")?;
        let api_key_claim = env::var("APIGEE_API_KEY_CLAIM").ok().filter(|v| !v.is_empty());
        let temp_dir = env::var("APIGEE_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/apigee-istio"));
        let server_timeout_secs = env::var("APIGEE_SERVER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(30);
        let products_refresh_mins = env::var("APIGEE_PRODUCTS_REFRESH_MINUTES")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(2);
        let analytics_file_limit = env::var("APIGEE_ANALYTICS_FILE_LIMIT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(1024);
        let analytics_legacy_endpoint = env::var("APIGEE_ANALYTICS_LEGACY_ENDPOINT")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            apigee_base,
            customer_base,
            org_name,
            env_name,
            key,
            secret,
            api_key_claim,
            temp_dir,
            server_timeout: Duration::from_secs(server_timeout_secs.max(1)),
            products_refresh: Duration::from_secs(products_refresh_mins.max(1) * 60),
            analytics_file_limit: analytics_file_limit.max(1),
            analytics_legacy_endpoint,
        })
    }
}
