use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::claims::ClaimsMap;
use crate::context::AuthContext;
use crate::env::ApiEnv;
use crate::error::{AuthError, AuthResult};
use crate::redact::redact;
use crate::verifier::KeyVerifier;

/// Combines claim input and the key verifier to produce a populated auth
/// context.
///
/// Resolution order, falling through on failure: an API key embedded in the
/// claims (under the configured claim name), then the explicit API key, then
/// direct adoption of the raw claims, which must not be expired. A
/// successful adoption overrides an earlier verification error; a
/// verification attempt that never happened yields `NoAuth`.
#[derive(Clone)]
pub struct AuthManager {
    verifier: KeyVerifier,
}

impl AuthManager {
    pub fn new(verifier: KeyVerifier) -> Self {
        Self { verifier }
    }

    pub fn verifier(&self) -> &KeyVerifier {
        &self.verifier
    }

    pub async fn authenticate(
        &self,
        env: &Arc<ApiEnv>,
        api_key: Option<&str>,
        claims: Option<&ClaimsMap>,
        api_key_claim: Option<&str>,
    ) -> AuthResult<AuthContext> {
        let mut attempted = false;
        let mut verify_error: Option<AuthError> = None;
        let mut context: Option<AuthContext> = None;

        let claim_key = claims
            .zip(api_key_claim)
            .and_then(|(map, name)| match map.get(name) {
                Some(Value::String(key)) if !key.is_empty() => Some(key.clone()),
                _ => None,
            });

        if let Some(key) = claim_key {
            attempted = true;
            match self.verify_and_adopt(env, &key).await {
                Ok(ctx) => context = Some(ctx),
                Err(err) => {
                    debug!(api_key = %redact(&key), error = %err, "claim-embedded key failed");
                    verify_error = Some(err);
                }
            }
        }

        if context.is_none() {
            if let Some(key) = api_key.filter(|key| !key.is_empty()) {
                attempted = true;
                match self.verify_and_adopt(env, key).await {
                    Ok(ctx) => context = Some(ctx),
                    Err(err) => {
                        debug!(api_key = %redact(key), error = %err, "api key failed");
                        verify_error = Some(err);
                    }
                }
            }
        }

        // Fall-through adoption: claims usable on their own authenticate the
        // caller even when no key verified. Nothing vouched for these, so an
        // expiry already in the past rejects them outright.
        if context.is_none() {
            if let Some(map) = claims.filter(|map| !map.is_empty()) {
                if let Ok(ctx) = AuthContext::from_claims(Arc::clone(env), map) {
                    if ctx.is_expired(Utc::now()) {
                        debug!(client_id = %redact(&ctx.client_id), "rejecting expired claims");
                        attempted = true;
                        if verify_error.is_none() {
                            verify_error = Some(AuthError::BadAuth);
                        }
                    } else {
                        context = Some(ctx);
                    }
                }
            }
        }

        match context {
            Some(ctx) => Ok(ctx),
            None if !attempted => Err(AuthError::NoAuth),
            None => match verify_error {
                Some(AuthError::BadAuth) | None => Err(AuthError::BadAuth),
                Some(other) => Err(AuthError::Internal(other.to_string())),
            },
        }
    }

    async fn verify_and_adopt(&self, env: &Arc<ApiEnv>, api_key: &str) -> AuthResult<AuthContext> {
        let claims = self.verifier.verify(env, api_key).await?;
        let mut ctx = AuthContext::from_claims(Arc::clone(env), &claims)?;
        ctx.api_key = Some(api_key.to_string());
        Ok(ctx)
    }
}
