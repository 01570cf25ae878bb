use crate::config::StatsdConfig;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Receives per-statement timings.
pub trait TelemetrySink: Send + Sync {
    fn timing(&self, key: &str, elapsed: Duration) -> anyhow::Result<()>;
}

/// Records timings as `metrics` histograms named after the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTelemetry;

impl TelemetrySink for MetricsTelemetry {
    fn timing(&self, key: &str, elapsed: Duration) -> anyhow::Result<()> {
        metrics::histogram!(key.to_string()).record(elapsed.as_secs_f64());
        Ok(())
    }
}

pub(crate) struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    sample_rate: RwLock<Option<f64>>,
}

impl Telemetry {
    pub(crate) fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            sample_rate: RwLock::new(None),
        }
    }

    /// No `statsd` section means no instrumentation.
    pub(crate) fn configure(&self, config: Option<&StatsdConfig>) {
        let rate = config.map(|c| c.sample_rate.clamp(0.0, 1.0));
        *self.sample_rate.write().unwrap_or_else(|e| e.into_inner()) = rate;
    }

    pub(crate) fn record(&self, key: &str, elapsed: Duration) {
        let rate = match *self.sample_rate.read().unwrap_or_else(|e| e.into_inner()) {
            Some(rate) => rate,
            None => return,
        };
        if rate < 1.0 && rand::random::<f64>() >= rate {
            return;
        }
        if let Err(err) = self.sink.timing(key, elapsed) {
            debug!(key, error = %err, "dropping statement timing");
        }
    }
}

pub(crate) fn statement_key(host: &str, command: &str, error_code: Option<u16>) -> String {
    match error_code {
        Some(code) => format!("sqlfarm.{host}.{command}.{code}"),
        None => format!("sqlfarm.{host}.{command}"),
    }
}
