pub mod alert;
pub mod blacklist;
pub mod cache;
pub mod config;
pub mod context;
pub mod cursor;
pub mod farm;
pub mod querylog;
pub mod reload;
pub mod routing;
pub mod store;
pub mod telemetry;
pub mod transaction;

pub use alert::{AlertReport, AlertSink, AlertSource, TracingAlertSink};
pub use blacklist::{BlacklistUpdate, FingerprintKind, QueryBlacklist};
pub use cache::StoreCache;
pub use config::{ConfigSource, RuntimeOptions, StoreConfig};
pub use cursor::Cursor;
pub use farm::{Farm, FarmSettings, SessionInfo};
pub use querylog::{LogFormat, QueryLog, QueryLogEntry};
pub use reload::{spawn_reload_listener, ReloadHub, ReloadMessage};
pub use routing::Target;
pub use store::{SqlStore, StoreBuilder};
pub use telemetry::{MetricsTelemetry, TelemetrySink};
pub use transaction::TransactionReport;

#[cfg(test)]
mod mock;
