use crate::config::EngineConfig;
use crate::mqtt::metrics::QosMetrics;
use anyhow::{Context, Result};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Initialize logging at the level named in the engine configuration.
pub fn init_from_config(config: &EngineConfig) -> Result<LogHandle> {
    init_tracing(config.log_level.as_deref())
}

/// Swap the active filter, e.g. `"quantum_qos=trace,info"`.
pub fn set_log_level(handle: &LogHandle, level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log filter {level}"))?;
    handle
        .modify(|f| *f = filter)
        .map_err(|e| anyhow::anyhow!("failed to reload log filter: {e}"))
}

/// Render engine counters in Prometheus text format, sorted by name.
pub fn render_metrics(metrics: &QosMetrics) -> String {
    let mut lines: Vec<_> = metrics
        .export()
        .into_iter()
        .map(|(name, value)| format!("{name} {value}"))
        .collect();
    lines.sort();
    let mut body = lines.join("\n");
    body.push('\n');
    body
}
