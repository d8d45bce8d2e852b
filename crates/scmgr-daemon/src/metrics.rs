//! Prometheus metrics.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `scmgr_registrations_total` | Counter | `kind`, `status` |
//! | `scmgr_click_reports_total` | Counter | `kind`, `status` |
//! | `scmgr_grants_total` | Counter | `kind` |
//! | `scmgr_quarantined_total` | Counter | |
//! | `scmgr_components_active` | Gauge | |
//!
//! `status` is `OK` or an [`ErrorCode`](scmgr_core::ErrorCode) string.

use std::sync::Arc;

use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors from registering or encoding metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result alias for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Service counters and gauges. Cheap to clone.
#[derive(Clone)]
pub struct ScMetrics {
    registrations_total: CounterVec,
    click_reports_total: CounterVec,
    grants_total: CounterVec,
    quarantined_total: Counter,
    components_active: Gauge,
}

impl std::fmt::Debug for ScMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScMetrics").finish_non_exhaustive()
    }
}

impl ScMetrics {
    /// Creates the service metrics and registers them in `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] if a metric is invalid
    /// or already registered.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let registrations_total = CounterVec::new(
            Opts::new(
                "scmgr_registrations_total",
                "Component registration attempts by kind and result",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(registrations_total.clone()))?;

        let click_reports_total = CounterVec::new(
            Opts::new(
                "scmgr_click_reports_total",
                "Click reports by kind and result",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(click_reports_total.clone()))?;

        let grants_total = CounterVec::new(
            Opts::new("scmgr_grants_total", "Temporary permissions granted"),
            &["kind"],
        )?;
        registry.register(Box::new(grants_total.clone()))?;

        let quarantined_total = Counter::new(
            "scmgr_quarantined_total",
            "Processes flagged as malicious",
        )?;
        registry.register(Box::new(quarantined_total.clone()))?;

        let components_active = Gauge::new(
            "scmgr_components_active",
            "Currently registered security components",
        )?;
        registry.register(Box::new(components_active.clone()))?;

        Ok(Self {
            registrations_total,
            click_reports_total,
            grants_total,
            quarantined_total,
            components_active,
        })
    }

    /// Counts one registration attempt.
    pub fn registration(&self, kind: &str, status: &str) {
        self.registrations_total
            .with_label_values(&[truncate_label(kind), truncate_label(status)])
            .inc();
    }

    /// Registration attempts recorded for `kind` and `status`.
    #[must_use]
    pub fn registration_count(&self, kind: &str, status: &str) -> f64 {
        self.registrations_total
            .with_label_values(&[truncate_label(kind), truncate_label(status)])
            .get()
    }

    /// Counts one click report.
    pub fn click_report(&self, kind: &str, status: &str) {
        self.click_reports_total
            .with_label_values(&[truncate_label(kind), truncate_label(status)])
            .inc();
    }

    /// Click reports recorded for `kind` and `status`.
    #[must_use]
    pub fn click_report_count(&self, kind: &str, status: &str) -> f64 {
        self.click_reports_total
            .with_label_values(&[truncate_label(kind), truncate_label(status)])
            .get()
    }

    /// Counts one permission granted after a verified click.
    pub fn granted(&self, kind: &str) {
        self.grants_total
            .with_label_values(&[truncate_label(kind)])
            .inc();
    }

    /// Grants recorded for `kind`.
    #[must_use]
    pub fn grant_count(&self, kind: &str) -> f64 {
        self.grants_total
            .with_label_values(&[truncate_label(kind)])
            .get()
    }

    /// Counts one process newly quarantined.
    pub fn quarantined(&self) {
        self.quarantined_total.inc();
    }

    /// Processes quarantined so far.
    #[must_use]
    pub fn quarantine_count(&self) -> f64 {
        self.quarantined_total.get()
    }

    /// Sets the live component gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_components_active(&self, count: usize) {
        self.components_active.set(count as f64);
    }

    /// Current value of the live component gauge.
    #[must_use]
    pub fn components_active(&self) -> f64 {
        self.components_active.get()
    }
}

/// Prometheus registry plus the service metrics registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    metrics: ScMetrics,
}

impl MetricsRegistry {
    /// Fresh registry holding the service metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the service metrics cannot be registered.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let metrics = ScMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// Handle used to record metrics.
    #[must_use]
    pub const fn metrics(&self) -> &ScMetrics {
        &self.metrics
    }

    /// Text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Registry shared between the service and its exporters.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// [`MetricsRegistry::new`] wrapped in an [`Arc`].
///
/// # Errors
///
/// Returns an error if the service metrics cannot be registered.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
