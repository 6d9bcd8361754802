use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use common_auth::{ApiEnv, AuthContext};
use common_tasks::{ExponentialBackoff, Looper, WorkerPool};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::QuotaError;
use crate::metrics::AdapterMetrics;
use crate::product::Product;

#[derive(Debug, Clone)]
pub struct QuotaOptions {
    /// Tick of the bucket scan loop.
    pub sync_rate: Duration,
    /// A bucket with no pending weight still re-syncs this often.
    pub refresh_after: Duration,
    /// An idle bucket with no local applies for this long is dropped.
    pub delete_after: Duration,
    pub sync_workers: usize,
    pub sync_queue: usize,
    pub dedup_entries: usize,
}

impl Default for QuotaOptions {
    fn default() -> Self {
        Self {
            sync_rate: Duration::from_secs(1),
            refresh_after: Duration::from_secs(60),
            delete_after: Duration::from_secs(10 * 60),
            sync_workers: 10,
            sync_queue: 100,
            dedup_entries: 30,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct QuotaArgs {
    pub deduplication_id: String,
    pub quota_amount: i64,
}

/// Prototype of a server quota exchange; `weight` accumulates local applies
/// not yet reconciled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRequest {
    pub identifier: String,
    pub weight: i64,
    pub interval: i64,
    pub allow: i64,
    pub time_unit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResult {
    pub allowed: i64,
    pub used: i64,
    pub exceeded: i64,
    /// Unix seconds at which the server window rolls.
    pub expiry_time: i64,
    pub timestamp: i64,
}

/// Distributed quota counters, one bucket per application and product pair.
///
/// Buckets apply locally against the last server-known result and reconcile
/// through a worker pool; a retried call carrying a deduplication id is
/// answered from a small FIFO cache without touching a bucket.
#[derive(Clone)]
pub struct QuotaManager {
    inner: Arc<QuotaInner>,
}

struct QuotaInner {
    env: Arc<ApiEnv>,
    opts: QuotaOptions,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    dedup: Mutex<DedupCache>,
    in_flight: Mutex<HashSet<String>>,
    metrics: Arc<AdapterMetrics>,
    loops: Mutex<QuotaLoops>,
}

#[derive(Default)]
struct QuotaLoops {
    scanner: Option<Looper>,
    pool: Option<WorkerPool>,
}

impl QuotaManager {
    pub fn new(env: Arc<ApiEnv>, opts: QuotaOptions, metrics: Arc<AdapterMetrics>) -> Self {
        let manager = Self {
            inner: Arc::new(QuotaInner {
                env,
                dedup: Mutex::new(DedupCache::new(opts.dedup_entries)),
                opts,
                buckets: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                metrics,
                loops: Mutex::new(QuotaLoops::default()),
            }),
        };
        manager.start();
        manager
    }

    /// Applies `args.quota_amount` for this context against the product's
    /// budget. Local state answers immediately; the backend catches up
    /// asynchronously, except for a freshly created bucket which syncs
    /// synchronously to establish the authoritative window first.
    pub async fn apply(
        &self,
        ctx: &AuthContext,
        product: &Product,
        args: &QuotaArgs,
    ) -> Result<QuotaResult, QuotaError> {
        if !args.deduplication_id.is_empty() {
            let cached = self
                .inner
                .dedup
                .lock()
                .expect("mutex poisoned")
                .get(&args.deduplication_id);
            if let Some(result) = cached {
                return Ok(result);
            }
        }

        let quota_id = format!("{}-{}", ctx.application_name, product.name);
        let prototype = QuotaRequest {
            identifier: quota_id.clone(),
            weight: 0,
            interval: product.quota_interval,
            allow: product.quota_limit,
            time_unit: product
                .quota_time_unit
                .map(|unit| unit.as_str().to_string())
                .unwrap_or_default(),
        };

        let bucket = self.bucket_for(&quota_id, &prototype).await;
        let (result, sync_error) = bucket.apply(args.quota_amount);
        if let Some(cause) = sync_error {
            warn!(identifier = %quota_id, cause = %cause, "quota sync lagging, applying locally");
        }

        if !args.deduplication_id.is_empty() {
            self.inner
                .dedup
                .lock()
                .expect("mutex poisoned")
                .insert(args.deduplication_id.clone(), result.clone());
        }
        Ok(result)
    }

    /// Existing compatible bucket, or a replacement synced before first use.
    async fn bucket_for(&self, quota_id: &str, prototype: &QuotaRequest) -> Arc<Bucket> {
        {
            let buckets = self.inner.buckets.read().expect("rwlock poisoned");
            if let Some(bucket) = buckets.get(quota_id) {
                if bucket.is_compatible(prototype) {
                    return Arc::clone(bucket);
                }
            }
        }

        let (bucket, created) = {
            let mut buckets = self.inner.buckets.write().expect("rwlock poisoned");
            match buckets.get(quota_id) {
                Some(existing) if existing.is_compatible(prototype) => {
                    (Arc::clone(existing), false)
                }
                _ => {
                    let bucket = Arc::new(Bucket::new(
                        Arc::clone(&self.inner.env),
                        prototype.clone(),
                        self.inner.opts.refresh_after,
                        self.inner.opts.delete_after,
                    ));
                    buckets.insert(quota_id.to_string(), Arc::clone(&bucket));
                    (bucket, true)
                }
            }
        };

        if created {
            if let Err(err) = bucket.sync().await {
                self.inner.metrics.record_quota_sync("error");
                warn!(identifier = %quota_id, error = %err, "initial quota sync failed");
            } else {
                self.inner.metrics.record_quota_sync("ok");
            }
        }
        bucket
    }

    fn start(&self) {
        let pool = WorkerPool::new(self.inner.opts.sync_workers, self.inner.opts.sync_queue);
        let manager = self.clone();
        let scanner = Looper::spawn(
            "quota-scan",
            self.inner.opts.sync_rate,
            ExponentialBackoff::default(),
            move |_cancel| {
                let manager = manager.clone();
                async move {
                    manager.scan();
                    Ok::<(), QuotaError>(())
                }
            },
            |_err| Ok(()),
        );
        let mut loops = self.inner.loops.lock().expect("mutex poisoned");
        loops.scanner = Some(scanner);
        loops.pool = Some(pool);
    }

    /// One pass over the buckets: drop the idle, enqueue the stale.
    fn scan(&self) {
        let now = Instant::now();
        let mut to_delete = Vec::new();
        let mut to_sync = Vec::new();
        {
            let buckets = self.inner.buckets.read().expect("rwlock poisoned");
            for (id, bucket) in buckets.iter() {
                if bucket.needs_delete(now) {
                    to_delete.push(id.clone());
                } else if bucket.needs_sync(now) {
                    to_sync.push((id.clone(), Arc::clone(bucket)));
                }
            }
        }

        if !to_delete.is_empty() {
            let mut buckets = self.inner.buckets.write().expect("rwlock poisoned");
            for id in to_delete {
                // Re-check under the write lock; an apply may have landed.
                if buckets.get(&id).is_some_and(|b| b.needs_delete(now)) {
                    debug!(identifier = %id, "dropping idle quota bucket");
                    buckets.remove(&id);
                }
            }
        }

        for (id, bucket) in to_sync {
            let fresh = self
                .inner
                .in_flight
                .lock()
                .expect("mutex poisoned")
                .insert(id.clone());
            if !fresh {
                continue;
            }
            let manager = self.clone();
            let job_id = id.clone();
            let job: common_tasks::Job = Box::pin(async move {
                match bucket.sync().await {
                    Ok(()) => manager.inner.metrics.record_quota_sync("ok"),
                    Err(err) => {
                        manager.inner.metrics.record_quota_sync("error");
                        debug!(identifier = %job_id, error = %err, "quota sync failed");
                    }
                }
                manager
                    .inner
                    .in_flight
                    .lock()
                    .expect("mutex poisoned")
                    .remove(&job_id);
            });
            let submitted = {
                let loops = self.inner.loops.lock().expect("mutex poisoned");
                match &loops.pool {
                    Some(pool) => pool.try_submit(job).is_ok(),
                    None => false,
                }
            };
            if !submitted {
                // Release the id so the next scan retries this bucket.
                warn!(identifier = %id, "quota sync queue full");
                self.inner
                    .in_flight
                    .lock()
                    .expect("mutex poisoned")
                    .remove(&id);
            }
        }
    }

    pub async fn close(&self) {
        let (scanner, pool) = {
            let mut loops = self.inner.loops.lock().expect("mutex poisoned");
            (loops.scanner.take(), loops.pool.take())
        };
        if let Some(scanner) = scanner {
            scanner.close().await;
        }
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

/// In-memory counter for one application's budget against one product.
pub struct Bucket {
    env: Arc<ApiEnv>,
    refresh_after: Duration,
    delete_after: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    request: QuotaRequest,
    result: Option<QuotaResult>,
    checked: Instant,
    synced: Instant,
    sync_error: Option<String>,
}

impl Bucket {
    fn new(
        env: Arc<ApiEnv>,
        prototype: QuotaRequest,
        refresh_after: Duration,
        delete_after: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            env,
            refresh_after,
            delete_after,
            state: Mutex::new(BucketState {
                request: prototype,
                result: None,
                checked: now,
                synced: now,
                sync_error: None,
            }),
        }
    }

    /// A bucket only serves requests whose prototype matches exactly; any
    /// drift in limit, interval, or unit forces a replacement.
    fn is_compatible(&self, prototype: &QuotaRequest) -> bool {
        let state = self.state.lock().expect("mutex poisoned");
        state.request.identifier == prototype.identifier
            && state.request.interval == prototype.interval
            && state.request.allow == prototype.allow
            && state.request.time_unit == prototype.time_unit
    }

    /// Local apply: charge the weight against the last server-known counts.
    /// Overflow accumulates in `exceeded`; `used` never passes `allowed`.
    fn apply(&self, amount: i64) -> (QuotaResult, Option<String>) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.checked = Instant::now();
        state.request.weight += amount;

        let allowed = state.request.allow;
        let (server_used, server_exceeded, expiry_time) = match &state.result {
            Some(result) => (result.used, result.exceeded, result.expiry_time),
            None => (0, 0, 0),
        };

        let mut used = server_used + server_exceeded + state.request.weight;
        let mut exceeded = 0;
        if used > allowed {
            exceeded = used - allowed;
            used = allowed;
        }

        let result = QuotaResult {
            allowed,
            used,
            exceeded,
            expiry_time,
            timestamp: Utc::now().timestamp(),
        };
        (result, state.sync_error.clone())
    }

    /// Reconciles with the authoritative server counter.
    ///
    /// The weight sent is subtracted on success so applies that landed while
    /// the call was in flight stay pending; a rolled window resets pending
    /// weight entirely so a new window is not charged for the old one.
    pub async fn sync(&self) -> Result<(), QuotaError> {
        let request = {
            let mut state = self.state.lock().expect("mutex poisoned");
            if Self::window_expired(&state) {
                state.request.weight = 0;
            }
            state.request.clone()
        };
        let sent_weight = request.weight;

        let outcome = self.post(&request).await;
        let mut state = self.state.lock().expect("mutex poisoned");
        match outcome {
            Ok(result) => {
                state.synced = Instant::now();
                let rolled = state
                    .result
                    .as_ref()
                    .is_some_and(|old| old.expiry_time != result.expiry_time);
                if rolled {
                    state.request.weight = 0;
                } else {
                    state.request.weight -= sent_weight;
                }
                state.result = Some(result);
                state.sync_error = None;
                Ok(())
            }
            Err(err) => {
                state.sync_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn post(&self, request: &QuotaRequest) -> Result<QuotaResult, QuotaError> {
        let url = self.env.apigee_url("quotas");
        let response = self
            .env
            .authorize(self.env.client().post(&url))
            .json(request)
            .send()
            .await
            .map_err(|err| QuotaError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(QuotaError::Status(response.status().as_u16()));
        }
        response
            .json::<QuotaResult>()
            .await
            .map_err(|err| QuotaError::Decode(err.to_string()))
    }

    fn needs_sync(&self, now: Instant) -> bool {
        let state = self.state.lock().expect("mutex poisoned");
        state.request.weight > 0 || now.duration_since(state.synced) >= self.refresh_after
    }

    fn needs_delete(&self, now: Instant) -> bool {
        let state = self.state.lock().expect("mutex poisoned");
        state.request.weight == 0 && now.duration_since(state.checked) >= self.delete_after
    }

    fn window_expired(state: &BucketState) -> bool {
        match &state.result {
            Some(result) if result.expiry_time > 0 => {
                Utc::now().timestamp() > result.expiry_time
            }
            _ => false,
        }
    }
}

/// Bounded FIFO of recent deduplication ids.
struct DedupCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, QuotaResult>,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, id: &str) -> Option<QuotaResult> {
        self.entries.get(id).cloned()
    }

    fn insert(&mut self, id: String, result: QuotaResult) {
        if self.entries.insert(id.clone(), result).is_none() {
            self.order.push_back(id);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }
}
