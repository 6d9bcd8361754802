use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::claims::{
    self, ClaimsMap, CLAIM_ACCESS_TOKEN, CLAIM_API_PRODUCT_LIST, CLAIM_APPLICATION_NAME,
    CLAIM_CLIENT_ID, CLAIM_DEVELOPER_EMAIL, CLAIM_SCOPES,
};
use crate::env::ApiEnv;
use crate::error::AuthResult;
use crate::redact::redact;

/// Fully resolved per-request authentication state.
#[derive(Clone)]
pub struct AuthContext {
    env: Arc<ApiEnv>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub client_id: String,
    pub application_name: String,
    pub api_products: Vec<String>,
    pub scopes: Vec<String>,
    pub developer_email: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AuthContext {
    /// Adopts a claims map. `client_id` and `application_name` are required
    /// strings and `exp` must parse; failure of any rejects the whole map.
    pub fn from_claims(env: Arc<ApiEnv>, map: &ClaimsMap) -> AuthResult<Self> {
        let client_id = claims::require_string(map, CLAIM_CLIENT_ID)?;
        let application_name = claims::require_string(map, CLAIM_APPLICATION_NAME)?;
        let api_products = claims::string_list(map, CLAIM_API_PRODUCT_LIST)?;
        let scopes = claims::string_list(map, CLAIM_SCOPES)?;
        let expires_at = claims::parse_exp(map)?;

        Ok(Self {
            env,
            api_key: None,
            access_token: claims::optional_string(map, CLAIM_ACCESS_TOKEN),
            client_id,
            application_name,
            api_products,
            scopes,
            developer_email: claims::optional_string(map, CLAIM_DEVELOPER_EMAIL),
            expires_at,
        })
    }

    pub fn env(&self) -> &ApiEnv {
        &self.env
    }

    pub fn env_handle(&self) -> Arc<ApiEnv> {
        Arc::clone(&self.env)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// Credentials never appear whole in debug output.
impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("client_id", &redact(&self.client_id))
            .field("application_name", &self.application_name)
            .field("api_products", &self.api_products)
            .field("scopes", &self.scopes)
            .field("developer_email", &self.developer_email)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use serde_json::json;

    fn env() -> Arc<ApiEnv> {
        Arc::new(ApiEnv::new(
            "org",
            "test",
            "https://edge.example.com",
            "https://customer.example.com",
            "key",
            "secret",
            Client::new(),
        ))
    }

    #[test]
    fn adopts_complete_claims() {
        let map = json!({
            "client_id": "client",
            "application_name": "app",
            "api_product_list": ["p1"],
            "scopes": ["scope1"],
            "exp": 4102444800i64,
            "access_token": "token",
            "application_developeremail": "dev@example.com",
        });
        let ctx = AuthContext::from_claims(env(), map.as_object().unwrap()).unwrap();
        assert_eq!(ctx.client_id, "client");
        assert_eq!(ctx.application_name, "app");
        assert_eq!(ctx.api_products, vec!["p1"]);
        assert_eq!(ctx.scopes, vec!["scope1"]);
        assert_eq!(ctx.access_token.as_deref(), Some("token"));
        assert_eq!(ctx.developer_email.as_deref(), Some("dev@example.com"));
        assert!(!ctx.is_expired(Utc::now()));
    }

    #[test]
    fn missing_required_fields_reject() {
        let without_client = json!({"application_name": "app", "exp": 4102444800i64});
        assert!(AuthContext::from_claims(env(), without_client.as_object().unwrap()).is_err());

        let without_app = json!({"client_id": "client", "exp": 4102444800i64});
        assert!(AuthContext::from_claims(env(), without_app.as_object().unwrap()).is_err());

        let without_exp = json!({"client_id": "client", "application_name": "app"});
        assert!(AuthContext::from_claims(env(), without_exp.as_object().unwrap()).is_err());
    }
}
