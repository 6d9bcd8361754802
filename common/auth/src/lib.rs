pub mod claims;
pub mod context;
pub mod env;
pub mod error;
pub mod jwks;
pub mod manager;
pub mod redact;
pub mod verifier;
pub mod verify;

pub use claims::ClaimsMap;
pub use context::AuthContext;
pub use env::ApiEnv;
pub use error::{AuthError, AuthResult};
pub use jwks::JwksManager;
pub use manager::AuthManager;
pub use redact::redact;
pub use verifier::{KeyVerifier, KeyVerifierOptions};
pub use verify::{decode_claims, parse_jwt};
