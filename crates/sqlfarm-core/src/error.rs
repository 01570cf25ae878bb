use crate::driver::DriverError;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlFarmError {
    #[error("routing error: {0}")]
    Routing(String),
    #[error("query is temporarily disabled due to performance issue (will be recovered after {}): {sql}", format_unix(.until))]
    QueryDisabled { sql: String, until: SystemTime },
    #[error("forbidden statement: {0}")]
    ForbiddenStatement(String),
    #[error("{message}: SQL:{sql} args:{args}")]
    InvalidData {
        message: String,
        sql: String,
        args: String,
    },
    #[error("connection error: {0}")]
    Connection(DriverError),
    #[error("this error is only meaningful to DBAs, please ignore: {0}")]
    IgnorableServer(DriverError),
    #[error("{source}")]
    ProtocolDesync {
        source: DriverError,
        recent: Vec<String>,
    },
    #[error("{0}")]
    Driver(DriverError),
    #[error("another transaction has not been finished: {0}")]
    TransactionInProgress(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("sql error: {0}")]
    Sql(String),
    #[error("not supported: {0}")]
    Unsupported(String),
}

impl SqlFarmError {
    /// The driver error code behind this failure, 0 for failures raised by
    /// the access layer itself.
    pub fn driver_code(&self) -> u16 {
        self.driver_error().map(|err| err.code).unwrap_or(0)
    }

    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            SqlFarmError::Connection(err)
            | SqlFarmError::IgnorableServer(err)
            | SqlFarmError::Driver(err)
            | SqlFarmError::ProtocolDesync { source: err, .. } => Some(err),
            _ => None,
        }
    }

    /// Operators suppress alerting for these; the call still fails.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, SqlFarmError::IgnorableServer(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SqlFarmError::Routing(_) => "RoutingError",
            SqlFarmError::QueryDisabled { .. } => "QueryDisabled",
            SqlFarmError::ForbiddenStatement(_) => "ForbiddenStatement",
            SqlFarmError::InvalidData { .. } => "InvalidData",
            SqlFarmError::Connection(_) => "ConnectionError",
            SqlFarmError::IgnorableServer(_) => "IgnorableServerError",
            SqlFarmError::ProtocolDesync { .. } => "ProtocolDesyncError",
            SqlFarmError::Driver(_) => "DriverError",
            SqlFarmError::TransactionInProgress(_) => "TransactionInProgress",
            SqlFarmError::Config(_) => "ConfigError",
            SqlFarmError::Sql(_) => "SqlError",
            SqlFarmError::Unsupported(_) => "Unsupported",
        }
    }
}

fn format_unix(at: &SystemTime) -> String {
    match at.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => format!("unix {}", elapsed.as_secs()),
        Err(_) => "unix 0".to_string(),
    }
}
