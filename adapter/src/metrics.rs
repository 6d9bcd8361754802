use anyhow::Result;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct AdapterMetrics {
    registry: Registry,
    authorize_checks: IntCounterVec,
    quota_syncs: IntCounterVec,
    analytics_records: IntCounterVec,
    analytics_uploads: IntCounterVec,
    analytics_dropped_files: IntCounter,
    staged_files: IntGauge,
}

impl AdapterMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let authorize_checks = IntCounterVec::new(
            Opts::new(
                "adapter_authorize_checks_total",
                "Authorize verdicts grouped by result",
            ),
            &["result"],
        )?;
        let quota_syncs = IntCounterVec::new(
            Opts::new(
                "adapter_quota_syncs_total",
                "Quota bucket syncs grouped by result",
            ),
            &["result"],
        )?;
        let analytics_records = IntCounterVec::new(
            Opts::new(
                "adapter_analytics_records_total",
                "Analytics records grouped by disposition",
            ),
            &["disposition"],
        )?;
        let analytics_uploads = IntCounterVec::new(
            Opts::new(
                "adapter_analytics_uploads_total",
                "Staged file uploads grouped by result",
            ),
            &["result"],
        )?;
        let analytics_dropped_files = IntCounter::new(
            "adapter_analytics_dropped_files_total",
            "Staged files dropped to honor the per-tenant cap",
        )?;
        let staged_files = IntGauge::with_opts(Opts::new(
            "adapter_analytics_staged_files",
            "Files currently staged for upload",
        ))?;
        registry.register(Box::new(authorize_checks.clone()))?;
        registry.register(Box::new(quota_syncs.clone()))?;
        registry.register(Box::new(analytics_records.clone()))?;
        registry.register(Box::new(analytics_uploads.clone()))?;
        registry.register(Box::new(analytics_dropped_files.clone()))?;
        registry.register(Box::new(staged_files.clone()))?;
        Ok(Self {
            registry,
            authorize_checks,
            quota_syncs,
            analytics_records,
            analytics_uploads,
            analytics_dropped_files,
            staged_files,
        })
    }

    pub fn record_authorize(&self, result: &str) {
        self.authorize_checks.with_label_values(&[result]).inc();
    }

    pub fn record_quota_sync(&self, result: &str) {
        self.quota_syncs.with_label_values(&[result]).inc();
    }

    pub fn record_analytics_record(&self, disposition: &str) {
        self.analytics_records.with_label_values(&[disposition]).inc();
    }

    pub fn record_upload(&self, result: &str) {
        self.analytics_uploads.with_label_values(&[result]).inc();
    }

    pub fn record_dropped_file(&self) {
        self.analytics_dropped_files.inc();
    }

    pub fn set_staged_files(&self, count: usize) {
        self.staged_files.set(count as i64);
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
