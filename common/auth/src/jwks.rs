use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use common_tasks::{ExponentialBackoff, Looper};
use jsonwebtoken::jwk::JwkSet;
use reqwest::Client;
use tracing::{debug, warn};

use crate::env::ApiEnv;
use crate::error::{AuthError, AuthResult};

/// Holds a JSON Web Key Set per issuer URL, refreshed on demand or on a poll
/// interval. Concurrent safe; readers see whole sets only.
#[derive(Clone)]
pub struct JwksManager {
    inner: Arc<JwksInner>,
}

struct JwksInner {
    client: Client,
    sets: RwLock<HashMap<String, JwkSet>>,
    last_error: Mutex<Option<String>>,
    poller: Mutex<Option<Looper>>,
}

impl JwksManager {
    pub fn new(client: Client) -> Self {
        Self {
            inner: Arc::new(JwksInner {
                client,
                sets: RwLock::new(HashMap::new()),
                last_error: Mutex::new(None),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Fetches and stores the key set for `url`, replacing any previous one.
    pub async fn ensure_set(&self, url: &str) -> AuthResult<()> {
        let set = self.fetch(url).await?;
        let mut sets = self.inner.sets.write().expect("rwlock poisoned");
        sets.insert(url.to_string(), set);
        Ok(())
    }

    /// Re-fetches every known issuer. A partial failure records the last
    /// error and keeps going so one broken issuer cannot starve the rest.
    pub async fn refresh(&self) -> AuthResult<()> {
        let urls: Vec<String> = {
            let sets = self.inner.sets.read().expect("rwlock poisoned");
            sets.keys().cloned().collect()
        };
        let mut last_error = None;
        for url in urls {
            match self.fetch(&url).await {
                Ok(set) => {
                    let mut sets = self.inner.sets.write().expect("rwlock poisoned");
                    sets.insert(url, set);
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "JWKS refresh failed");
                    last_error = Some(err);
                }
            }
        }
        *self.inner.last_error.lock().expect("mutex poisoned") =
            last_error.as_ref().map(|err| err.to_string());
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().expect("mutex poisoned").clone()
    }

    /// Starts the periodic refresh loop; a zero interval disables polling.
    pub fn start(&self, poll_interval: Duration) {
        if poll_interval.is_zero() {
            return;
        }
        let manager = self.clone();
        let looper = Looper::spawn(
            "jwks-refresh",
            poll_interval,
            ExponentialBackoff::default().with_jitter(),
            move |_cancel| {
                let manager = manager.clone();
                async move { manager.refresh().await }
            },
            |_err| Ok(()),
        );
        *self.inner.poller.lock().expect("mutex poisoned") = Some(looper);
    }

    /// Key set for the caller's customer base, fetched lazily on miss.
    pub async fn get(&self, env: &ApiEnv) -> AuthResult<JwkSet> {
        let url = env.customer_url("certs");
        {
            let sets = self.inner.sets.read().expect("rwlock poisoned");
            if let Some(set) = sets.get(&url) {
                return Ok(set.clone());
            }
        }
        self.ensure_set(&url).await?;
        let sets = self.inner.sets.read().expect("rwlock poisoned");
        sets.get(&url)
            .cloned()
            .ok_or_else(|| AuthError::JwksFetch(format!("no key set for {url}")))
    }

    pub async fn close(&self) {
        let poller = self.inner.poller.lock().expect("mutex poisoned").take();
        if let Some(poller) = poller {
            poller.close().await;
        }
    }

    async fn fetch(&self, url: &str) -> AuthResult<JwkSet> {
        let response = self
            .inner
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }
        let set: JwkSet = response
            .json()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;
        debug!(url = %url, keys = set.keys.len(), "loaded JWKS");
        Ok(set)
    }
}
