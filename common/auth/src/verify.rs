use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::claims::ClaimsMap;
use crate::env::ApiEnv;
use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksManager;

/// Allowed clock skew when validating `exp`/`nbf`.
const CLOCK_SKEW_SECONDS: u64 = 10;

/// Decodes a JWT's claims. With `verify` the signature is checked against the
/// JWKS for the caller's customer base and `exp`/`nbf` are validated with
/// skew tolerance; without it the claims are decoded as-is (used for
/// self-issued backend tokens).
pub async fn parse_jwt(
    jwks: &JwksManager,
    env: &ApiEnv,
    raw: &str,
    verify: bool,
) -> AuthResult<ClaimsMap> {
    let claims = if verify {
        let header =
            decode_header(raw).map_err(|err| AuthError::InvalidJws(err.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidJws("token missing kid header".to_string()))?;
        let set = jwks.get(env).await?;
        let jwk = set
            .find(&kid)
            .ok_or_else(|| AuthError::InvalidJws(format!("no key for kid '{kid}'")))?;
        let key = DecodingKey::from_jwk(jwk)
            .map_err(|err| AuthError::InvalidJws(err.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = CLOCK_SKEW_SECONDS;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        let claims = decode::<Value>(raw, &key, &validation)
            .map_err(|err| AuthError::InvalidJws(err.to_string()))?
            .claims;
        claims_object(claims)?
    } else {
        decode_claims(raw)?
    };

    Ok(claims)
}

/// Decodes a token's claims without any signature or time validation.
pub fn decode_claims(raw: &str) -> AuthResult<ClaimsMap> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = Default::default();
    let key = DecodingKey::from_secret(&[]);
    let claims = decode::<Value>(raw, &key, &validation)
        .map_err(|err| AuthError::ClaimsParse(err.to_string()))?
        .claims;
    claims_object(claims)
}

fn claims_object(claims: Value) -> AuthResult<ClaimsMap> {
    match claims {
        Value::Object(map) => Ok(map),
        other => Err(AuthError::ClaimsParse(format!(
            "claims are not an object: {other}"
        ))),
    }
}
