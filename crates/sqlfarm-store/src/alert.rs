use crate::config::AlertingConfig;
use crate::context::{process, ProcessContext};
use serde::Serialize;
use sqlfarm_core::SqlFarmError;
use std::backtrace::Backtrace;
use std::sync::{Arc, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

/// Where a failure surfaced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertSource {
    pub store: String,
    pub farm: Option<String>,
    pub host: Option<String>,
    pub client: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertReport {
    pub message: String,
    pub kind: &'static str,
    pub driver_code: u16,
    /// Operators suppress paging for these.
    pub ignorable: bool,
    pub sql: Option<String>,
    pub source: AlertSource,
    pub process: ProcessContext,
    pub dsn: String,
    pub backtrace: String,
}

pub trait AlertSink: Send + Sync {
    fn report(&self, report: &AlertReport) -> anyhow::Result<()>;
}

/// Emits reports as structured log events under `sqlfarm::alert`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn report(&self, report: &AlertReport) -> anyhow::Result<()> {
        if report.ignorable {
            warn!(
                target: "sqlfarm::alert",
                kind = report.kind,
                code = report.driver_code,
                farm = report.source.farm.as_deref().unwrap_or(""),
                sql = report.sql.as_deref().unwrap_or(""),
                "{}",
                report.message
            );
        } else {
            error!(
                target: "sqlfarm::alert",
                kind = report.kind,
                code = report.driver_code,
                farm = report.source.farm.as_deref().unwrap_or(""),
                host = report.source.host.as_deref().unwrap_or(""),
                sql = report.sql.as_deref().unwrap_or(""),
                user = %report.process.user,
                cmdline = %report.process.cmdline,
                "{}",
                report.message
            );
        }
        Ok(())
    }
}

pub(crate) struct Alerts {
    sink: Arc<dyn AlertSink>,
    dsn: RwLock<Option<String>>,
    store_id: Uuid,
}

impl Alerts {
    pub(crate) fn new(sink: Arc<dyn AlertSink>, store_id: Uuid) -> Self {
        Self {
            sink,
            dsn: RwLock::new(None),
            store_id,
        }
    }

    /// Reports are only sent while the config carries an `alerting` section.
    pub(crate) fn configure(&self, config: Option<&AlertingConfig>) {
        *self.dsn.write().unwrap_or_else(|e| e.into_inner()) = config.map(|c| c.dsn.clone());
    }

    pub(crate) fn source(&self) -> AlertSource {
        AlertSource {
            store: self.store_id.to_string(),
            ..AlertSource::default()
        }
    }

    pub(crate) fn send(&self, err: &SqlFarmError, sql: Option<&str>, source: AlertSource) {
        let dsn = match self.dsn.read().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(dsn) => dsn,
            None => return,
        };
        let report = AlertReport {
            message: format!("{}: {}", err.kind_name(), err),
            kind: err.kind_name(),
            driver_code: err.driver_code(),
            ignorable: err.is_ignorable(),
            sql: sql.map(str::to_string),
            source,
            process: process().clone(),
            dsn,
            backtrace: Backtrace::force_capture().to_string(),
        };
        if let Err(send_err) = self.sink.report(&report) {
            warn!(error = %send_err, "SEND_ALERT_FAIL");
        }
    }
}
