use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common_tasks::{ExpiringCache, Looper};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::claims::{self, ClaimsMap};
use crate::env::ApiEnv;
use crate::error::{AuthError, AuthResult};
use crate::redact::redact;
use crate::verify::decode_claims;

#[derive(Debug, Clone)]
pub struct KeyVerifierOptions {
    /// Upper bound on a verified entry's lifetime; the embedded token `exp`
    /// shortens it further.
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_entries: usize,
    pub bad_ttl: Duration,
    pub bad_entries: usize,
}

impl Default for KeyVerifierOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(10),
            max_entries: 10_000,
            bad_ttl: Duration::from_secs(10),
            bad_entries: 100,
        }
    }
}

/// Exchanges opaque API keys for backend-verified claims.
///
/// Verified claims are cached until the embedded token expiry; rejected keys
/// sit in a short-lived known-bad cache. Concurrent verifications of the
/// same key coalesce into a single backend call, and an expired entry keeps
/// serving while at most one background refresh per key replaces it.
#[derive(Clone)]
pub struct KeyVerifier {
    inner: Arc<VerifierInner>,
}

struct VerifierInner {
    opts: KeyVerifierOptions,
    cache: ExpiringCache<ClaimsMap>,
    known_bad: ExpiringCache<()>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<FetchOutcome>>>,
    refreshing: Mutex<HashSet<String>>,
    sweepers: Mutex<Vec<Looper>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone)]
enum FetchOutcome {
    Verified(ClaimsMap),
    Bad,
    Failed(String),
}

#[derive(Serialize)]
struct VerifyApiKeyRequest<'a> {
    #[serde(rename = "apiKey")]
    api_key: &'a str,
}

#[derive(Deserialize)]
struct VerifyApiKeyResponse {
    #[serde(default)]
    token: String,
}

impl KeyVerifier {
    pub fn new() -> Self {
        Self::with_options(KeyVerifierOptions::default())
    }

    pub fn with_options(opts: KeyVerifierOptions) -> Self {
        let cache = ExpiringCache::new(opts.cache_ttl, opts.max_entries);
        let known_bad = ExpiringCache::new(opts.bad_ttl, opts.bad_entries);
        let sweepers = vec![
            cache.spawn_sweeper(opts.sweep_interval),
            known_bad.spawn_sweeper(opts.sweep_interval),
        ];
        Self {
            inner: Arc::new(VerifierInner {
                opts,
                cache,
                known_bad,
                in_flight: Mutex::new(HashMap::new()),
                refreshing: Mutex::new(HashSet::new()),
                sweepers: Mutex::new(sweepers),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub async fn verify(&self, env: &Arc<ApiEnv>, api_key: &str) -> AuthResult<ClaimsMap> {
        if self.inner.known_bad.get(api_key).is_some() {
            debug!(api_key = %redact(api_key), "key in known-bad cache");
            return Err(AuthError::BadAuth);
        }

        if let Some((cached, expired)) = self.inner.cache.get_stale(api_key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            if expired {
                self.spawn_refresh(env, api_key);
            }
            return Ok(cached);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);

        match self.fetch_coalesced(env, api_key).await {
            FetchOutcome::Verified(map) => Ok(map),
            FetchOutcome::Bad => Err(AuthError::BadAuth),
            FetchOutcome::Failed(cause) => Err(AuthError::Transport(cause)),
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    pub async fn close(&self) {
        let sweepers: Vec<Looper> = self
            .inner
            .sweepers
            .lock()
            .expect("mutex poisoned")
            .drain(..)
            .collect();
        for sweeper in sweepers {
            sweeper.close().await;
        }
    }

    /// At most one background refresh per key; the in-flight set drops the
    /// key once the fetch settles either way.
    fn spawn_refresh(&self, env: &Arc<ApiEnv>, api_key: &str) {
        let fresh = self
            .inner
            .refreshing
            .lock()
            .expect("mutex poisoned")
            .insert(api_key.to_string());
        if !fresh {
            return;
        }
        let verifier = self.clone();
        let env = Arc::clone(env);
        let api_key = api_key.to_string();
        tokio::spawn(async move {
            let _ = verifier.fetch_coalesced(&env, &api_key).await;
            verifier
                .inner
                .refreshing
                .lock()
                .expect("mutex poisoned")
                .remove(&api_key);
        });
    }

    async fn fetch_coalesced(&self, env: &Arc<ApiEnv>, api_key: &str) -> FetchOutcome {
        let waiter = {
            let mut in_flight = self.inner.in_flight.lock().expect("mutex poisoned");
            match in_flight.get(api_key) {
                Some(leader) => Some(leader.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    in_flight.insert(api_key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => FetchOutcome::Failed("verification leader went away".to_string()),
            };
        }

        let outcome = self.fetch(env, api_key).await;
        let leader = self
            .inner
            .in_flight
            .lock()
            .expect("mutex poisoned")
            .remove(api_key);
        if let Some(tx) = leader {
            let _ = tx.send(outcome.clone());
        }
        outcome
    }

    async fn fetch(&self, env: &ApiEnv, api_key: &str) -> FetchOutcome {
        let url = env.customer_url("verifyApiKey");
        let request = env
            .authorize(env.client().post(&url))
            .json(&VerifyApiKeyRequest { api_key });
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return FetchOutcome::Failed(err.to_string()),
        };

        if !response.status().is_success() {
            warn!(
                api_key = %redact(api_key),
                status = %response.status(),
                "verifyApiKey rejected key"
            );
            self.mark_bad(api_key);
            return FetchOutcome::Bad;
        }

        let body: VerifyApiKeyResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => return FetchOutcome::Failed(err.to_string()),
        };
        if body.token.is_empty() {
            self.mark_bad(api_key);
            return FetchOutcome::Bad;
        }

        // The token is self-issued by the backend; its claims are adopted
        // without a signature check.
        let map = match decode_claims(&body.token) {
            Ok(map) => map,
            Err(err) => return FetchOutcome::Failed(err.to_string()),
        };
        let ttl = match claims::parse_exp(&map) {
            Ok(exp) => (exp - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.inner.opts.cache_ttl),
            Err(err) => return FetchOutcome::Failed(err.to_string()),
        };

        self.inner.cache.insert_with_ttl(api_key, map.clone(), ttl);
        self.inner.known_bad.remove(api_key);
        FetchOutcome::Verified(map)
    }

    fn mark_bad(&self, api_key: &str) {
        self.inner.known_bad.insert(api_key, ());
        self.inner.cache.remove(api_key);
    }
}

impl Default for KeyVerifier {
    fn default() -> Self {
        Self::new()
    }
}
