use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Neither an API key nor usable claims were supplied.
    #[error("missing authentication")]
    NoAuth,
    /// The credential was rejected by the backend or the claims are
    /// inconsistent.
    #[error("invalid authentication")]
    BadAuth,
    #[error("invalid jws")]
    InvalidJws(String),
    #[error("failed to parse claims: {0}")]
    ClaimsParse(String),
    #[error("invalid claim '{0}' with value '{1}'")]
    InvalidClaim(&'static str, String),
    #[error("failed to fetch JWKS: {0}")]
    JwksFetch(String),
    #[error("key verification transport failure: {0}")]
    Transport(String),
    /// Mid-verify transport or parse failure. The display never carries
    /// backend details; the cause stays in the payload for logging.
    #[error("internal error")]
    Internal(String),
}

impl AuthError {
    pub fn is_bad_auth(&self) -> bool {
        matches!(self, AuthError::BadAuth)
    }
}
