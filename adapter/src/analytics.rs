use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common_auth::{ApiEnv, AuthContext};
use common_tasks::{reservoir, ExponentialBackoff, Looper, ReservoirHandles};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AnalyticsError;
use crate::metrics::AdapterMetrics;
use crate::record::Record;

#[derive(Debug, Clone)]
pub struct AnalyticsOptions {
    /// Root of the temp/staging layout.
    pub root: PathBuf,
    /// How often open temp files rotate into staging.
    pub collection_interval: Duration,
    /// How often staged files are pushed to the backend.
    pub upload_interval: Duration,
    /// Per-tenant cap on staged files; the oldest beyond it are dropped.
    pub staging_file_limit: usize,
    /// Select the direct-POST upload protocol instead of signed URLs.
    pub legacy_endpoint: bool,
    /// Batches buffered between ingress and the writer before overflow.
    pub reservoir_limit: usize,
}

impl Default for AnalyticsOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/apigee-istio"),
            collection_interval: Duration::from_secs(2),
            upload_interval: Duration::from_secs(10),
            staging_file_limit: 1024,
            legacy_endpoint: false,
            reservoir_limit: 1024,
        }
    }
}

type Batch = (String, Vec<Record>);

/// Buffers analytics records to per-tenant gzip files and uploads them.
///
/// Records append to `temp/<tenant>/`, rotate into `staging/<tenant>/`, and
/// leave the disk only after a 2xx upload. Residual temp files from a crash
/// are promoted on startup when well formed and discarded otherwise.
#[derive(Clone)]
pub struct AnalyticsManager {
    inner: Arc<AnalyticsInner>,
}

struct AnalyticsInner {
    env: Arc<ApiEnv>,
    client: reqwest::Client,
    opts: AnalyticsOptions,
    temp_dir: PathBuf,
    staging_dir: PathBuf,
    buckets: Mutex<HashMap<String, Arc<TenantBucket>>>,
    ingest: Mutex<Option<mpsc::Sender<Batch>>>,
    tasks: Mutex<AnalyticsTasks>,
    metrics: Arc<AdapterMetrics>,
}

#[derive(Default)]
struct AnalyticsTasks {
    writer: Option<JoinHandle<()>>,
    overflow: Option<JoinHandle<()>>,
    collector: Option<Looper>,
    uploader: Option<Looper>,
}

impl AnalyticsManager {
    pub fn new(
        env: Arc<ApiEnv>,
        client: reqwest::Client,
        opts: AnalyticsOptions,
        metrics: Arc<AdapterMetrics>,
    ) -> Result<Self, AnalyticsError> {
        let temp_dir = opts.root.join("temp");
        let staging_dir = opts.root.join("staging");
        ensure_dir(&temp_dir)?;
        ensure_dir(&staging_dir)?;

        let manager = Self {
            inner: Arc::new(AnalyticsInner {
                env,
                client,
                temp_dir,
                staging_dir,
                opts,
                buckets: Mutex::new(HashMap::new()),
                ingest: Mutex::new(None),
                tasks: Mutex::new(AnalyticsTasks::default()),
                metrics,
            }),
        };
        manager.recover()?;
        manager.start();
        Ok(manager)
    }

    /// Stamps, validates, and enqueues records for the caller's tenant.
    /// Invalid records are rejected here; overflow beyond the reservoir is
    /// dropped with a warning rather than blocking the ingress path.
    pub async fn send_records(&self, ctx: &AuthContext, records: Vec<Record>) {
        let mut accepted = Vec::with_capacity(records.len());
        for mut record in records {
            record.stamp(ctx);
            if !record.has_valid_timestamps() {
                self.inner.metrics.record_analytics_record("invalid");
                warn!(
                    start = record.client_received_start_timestamp,
                    end = record.client_received_end_timestamp,
                    "rejecting record with invalid timestamps"
                );
                continue;
            }
            self.inner.metrics.record_analytics_record("accepted");
            accepted.push(record);
        }
        if accepted.is_empty() {
            return;
        }

        let sender = {
            let guard = self.inner.ingest.lock().expect("mutex poisoned");
            guard.clone()
        };
        match sender {
            Some(sender) => {
                let batch = (ctx.env().tenant(), accepted);
                if sender.send(batch).await.is_err() {
                    warn!("analytics pipeline closed, dropping records");
                }
            }
            None => warn!("analytics pipeline not running, dropping records"),
        }
    }

    /// Flushes open buckets, drains the pipeline, and makes a final upload
    /// pass so accepted records are staged (or gone) before shutdown.
    pub async fn close(&self) {
        let sender = self.inner.ingest.lock().expect("mutex poisoned").take();
        drop(sender);

        let (writer, overflow, collector, uploader) = {
            let mut tasks = self.inner.tasks.lock().expect("mutex poisoned");
            (
                tasks.writer.take(),
                tasks.overflow.take(),
                tasks.collector.take(),
                tasks.uploader.take(),
            )
        };
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if let Some(overflow) = overflow {
            let _ = overflow.await;
        }
        if let Some(collector) = collector {
            collector.close().await;
        }
        if let Some(uploader) = uploader {
            uploader.close().await;
        }

        if let Err(err) = self.rotate_all() {
            warn!(error = %err, "final rotation failed");
        }
        if let Err(err) = self.upload_all().await {
            warn!(error = %err, "final upload pass failed");
        }
    }

    fn start(&self) {
        let ReservoirHandles {
            input,
            mut output,
            mut overflow,
        } = reservoir::<Batch>(self.inner.opts.reservoir_limit);
        *self.inner.ingest.lock().expect("mutex poisoned") = Some(input);

        let writer_manager = self.clone();
        let writer = tokio::spawn(async move {
            while let Some((tenant, records)) = output.recv().await {
                if let Err(err) = writer_manager.write_records(&tenant, &records) {
                    warn!(tenant = %tenant, error = %err, "failed to buffer records");
                }
            }
        });

        let overflow_metrics = Arc::clone(&self.inner.metrics);
        let overflow_task = tokio::spawn(async move {
            while let Some((tenant, records)) = overflow.recv().await {
                for _ in &records {
                    overflow_metrics.record_analytics_record("dropped");
                }
                warn!(tenant = %tenant, count = records.len(), "analytics backlog full, dropping records");
            }
        });

        let collect_manager = self.clone();
        let collector = Looper::spawn(
            "analytics-collect",
            self.inner.opts.collection_interval,
            ExponentialBackoff::default(),
            move |_cancel| {
                let manager = collect_manager.clone();
                async move { manager.rotate_all() }
            },
            |_err| Ok(()),
        );

        let upload_manager = self.clone();
        let uploader = Looper::spawn(
            "analytics-upload",
            self.inner.opts.upload_interval,
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(60), 2.0)
                .with_jitter(),
            move |_cancel| {
                let manager = upload_manager.clone();
                async move { manager.upload_all().await }
            },
            |_err| Ok(()),
        );

        let mut tasks = self.inner.tasks.lock().expect("mutex poisoned");
        tasks.writer = Some(writer);
        tasks.overflow = Some(overflow_task);
        tasks.collector = Some(collector);
        tasks.uploader = Some(uploader);
    }

    fn write_records(&self, tenant: &str, records: &[Record]) -> Result<(), AnalyticsError> {
        let bucket = {
            let mut buckets = self.inner.buckets.lock().expect("mutex poisoned");
            match buckets.get(tenant) {
                Some(bucket) => Arc::clone(bucket),
                None => {
                    let dir = self.inner.temp_dir.join(tenant);
                    ensure_dir(&dir)?;
                    let bucket = Arc::new(TenantBucket {
                        tenant: tenant.to_string(),
                        dir,
                        state: Mutex::new(None),
                    });
                    buckets.insert(tenant.to_string(), Arc::clone(&bucket));
                    bucket
                }
            }
        };
        bucket.append(records)
    }

    /// Rotates every open temp file into staging and enforces the cap.
    fn rotate_all(&self) -> Result<(), AnalyticsError> {
        let buckets: Vec<Arc<TenantBucket>> = {
            let guard = self.inner.buckets.lock().expect("mutex poisoned");
            guard.values().cloned().collect()
        };
        for bucket in buckets {
            let staged_dir = self.inner.staging_dir.join(&bucket.tenant);
            if let Some(path) = bucket.rotate(&staged_dir)? {
                debug!(tenant = %bucket.tenant, file = %path.display(), "staged analytics file");
            }
            self.enforce_cap(&staged_dir)?;
        }
        Ok(())
    }

    fn enforce_cap(&self, staged_dir: &Path) -> Result<(), AnalyticsError> {
        let mut files = list_files(staged_dir)?;
        if files.len() <= self.inner.opts.staging_file_limit {
            return Ok(());
        }
        // Filenames sort by creation time, so the front is the oldest.
        files.sort();
        let excess = files.len() - self.inner.opts.staging_file_limit;
        for path in files.into_iter().take(excess) {
            warn!(file = %path.display(), "staging limit reached, dropping oldest file");
            self.inner.metrics.record_dropped_file();
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Promotes well-formed residual temp files after a crash; truncated
    /// files are discarded with a warning.
    fn recover(&self) -> Result<(), AnalyticsError> {
        for tenant_dir in list_dirs(&self.inner.temp_dir)? {
            let tenant = match tenant_dir.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            for file in list_files(&tenant_dir)? {
                if gzip_well_formed(&file) {
                    let staged_dir = self.inner.staging_dir.join(&tenant);
                    ensure_dir(&staged_dir)?;
                    let target = staged_dir.join(file.file_name().expect("file name"));
                    fs::rename(&file, &target)?;
                    debug!(file = %target.display(), "recovered staged file");
                } else {
                    warn!(file = %file.display(), "discarding truncated analytics file");
                    fs::remove_file(&file)?;
                }
            }
        }
        Ok(())
    }

    /// One upload pass over every tenant. Transient failures leave files in
    /// place for the next pass; an authorization failure aborts the pass for
    /// the remaining tenants as well.
    async fn upload_all(&self) -> Result<(), AnalyticsError> {
        let tenant_dirs = list_dirs(&self.inner.staging_dir)?;
        let staged_total: usize = tenant_dirs
            .iter()
            .map(|dir| list_files(dir).map(|files| files.len()).unwrap_or(0))
            .sum();
        self.inner.metrics.set_staged_files(staged_total);

        let mut transient: Option<AnalyticsError> = None;
        for tenant_dir in tenant_dirs {
            let tenant = match tenant_dir.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let mut files = list_files(&tenant_dir)?;
            files.sort();
            for file in files {
                match self.upload_file(&tenant, &file).await {
                    Ok(()) => {
                        self.inner.metrics.record_upload("ok");
                        fs::remove_file(&file)?;
                    }
                    Err(err) if !err.is_retryable() => {
                        self.inner.metrics.record_upload("unauthorized");
                        warn!(tenant = %tenant, error = %err, "upload not authorized, stopping pass");
                        return Err(err);
                    }
                    Err(err) => {
                        self.inner.metrics.record_upload("retry");
                        debug!(tenant = %tenant, file = %file.display(), error = %err, "upload failed");
                        transient = Some(err);
                        break;
                    }
                }
            }
        }
        match transient {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn upload_file(&self, tenant: &str, path: &Path) -> Result<(), AnalyticsError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let body = fs::read(path)?;

        if self.inner.opts.legacy_endpoint {
            return self.upload_legacy(body).await;
        }

        let env = &self.inner.env;
        let url = env.apigee_url(&format!(
            "analytics/organization/{}/environment/{}",
            env.org(),
            env.env()
        ));
        let relative_path = format!("{}/{}", Utc::now().format("%Y-%m-%d"), file_name);
        let response = env
            .authorize(self.inner.client.get(&url))
            .query(&[
                ("tenant", tenant),
                ("relative_file_path", relative_path.as_str()),
                ("file_content_type", "application/x-gzip"),
                ("encrypt", "true"),
            ])
            .send()
            .await
            .map_err(|err| AnalyticsError::Transport(err.to_string()))?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AnalyticsError::NotAuthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(AnalyticsError::SignedUrl(format!("HTTP {status}")));
        }
        let signed: SignedUrlResponse = response
            .json()
            .await
            .map_err(|err| AnalyticsError::SignedUrl(err.to_string()))?;

        let put = self
            .inner
            .client
            .put(&signed.url)
            .header("Content-Type", "application/x-gzip")
            .header("x-amz-server-side-encryption", "AES256")
            .header("Expect", "100-continue")
            .body(body)
            .send()
            .await
            .map_err(|err| AnalyticsError::Transport(err.to_string()))?;
        if !put.status().is_success() {
            return Err(AnalyticsError::UploadStatus(put.status().as_u16()));
        }
        Ok(())
    }

    async fn upload_legacy(&self, body: Vec<u8>) -> Result<(), AnalyticsError> {
        let env = &self.inner.env;
        let url = env.apigee_url(&format!(
            "axpublisher/organization/{}/environment/{}",
            env.org(),
            env.env()
        ));
        let response = env
            .authorize(self.inner.client.post(&url))
            .header("Content-Type", "application/x-gzip")
            .body(body)
            .send()
            .await
            .map_err(|err| AnalyticsError::Transport(err.to_string()))?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AnalyticsError::NotAuthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(AnalyticsError::UploadStatus(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    url: String,
}

/// Owns the open gzip file for one tenant; appends and rotation serialize on
/// the bucket lock, which never spans network I/O.
struct TenantBucket {
    tenant: String,
    dir: PathBuf,
    state: Mutex<Option<OpenFile>>,
}

struct OpenFile {
    path: PathBuf,
    writer: GzEncoder<File>,
    records: usize,
}

impl TenantBucket {
    fn append(&self, records: &[Record]) -> Result<(), AnalyticsError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.is_none() {
            let name = format!(
                "{:013}_{:08x}.json.gz",
                Utc::now().timestamp_millis(),
                rand::random::<u32>()
            );
            let path = self.dir.join(name);
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)?;
            debug!(tenant = %self.tenant, file = %path.display(), "opened temp file");
            *state = Some(OpenFile {
                path,
                writer: GzEncoder::new(file, Compression::default()),
                records: 0,
            });
        }
        let open = state.as_mut().expect("file just opened");
        for record in records {
            let line = serde_json::to_vec(record)
                .map_err(|err| AnalyticsError::Serialize(err.to_string()))?;
            open.writer.write_all(&line)?;
            open.writer.write_all(b"\n")?;
            open.records += 1;
        }
        Ok(())
    }

    /// Finalizes the gzip stream, fsyncs, and atomically renames the file
    /// into staging. Returns the staged path when something was written.
    fn rotate(&self, staged_dir: &Path) -> Result<Option<PathBuf>, AnalyticsError> {
        let open = {
            let mut state = self.state.lock().expect("mutex poisoned");
            match state.take() {
                Some(open) if open.records > 0 => open,
                Some(open) => {
                    // Nothing written; reuse the file instead of staging it.
                    *state = Some(open);
                    return Ok(None);
                }
                None => return Ok(None),
            }
        };

        let file = open.writer.finish()?;
        file.sync_all()?;
        drop(file);

        ensure_dir(staged_dir)?;
        let target = staged_dir.join(open.path.file_name().expect("file name"));
        fs::rename(&open.path, &target)?;
        Ok(Some(target))
    }
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

fn list_dirs(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn list_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn gzip_well_formed(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut decoder = GzDecoder::new(file);
    let mut sink = Vec::new();
    decoder.read_to_end(&mut sink).is_ok()
}
