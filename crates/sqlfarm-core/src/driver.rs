//! The surface the access layer needs from a database driver.
//!
//! The driver itself (wire protocol, sockets, result decoding) is supplied by
//! the embedding application through [`ConnectionFactory`].

use crate::types::{DataRow, DataValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::Duration;

/// Client-side error codes (`CR_*`). Anything in this range means the
/// connection itself is unusable.
pub const CONNECTION_ERROR_CODES: Range<u16> = 2000..3000;
pub const SERVER_GONE_ERROR: u16 = 2006;
pub const COMMANDS_OUT_OF_SYNC: u16 = 2014;

pub const DEFAULT_PORT: u16 = 3306;
pub const DEFAULT_INIT_COMMAND: &str = "set names utf8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Server or network trouble outside the caller's control.
    Operational,
    /// Misuse of the client API, e.g. reading results out of order.
    Programming,
    /// Integrity, data or anything else the driver reports.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub code: u16,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn operational(code: u16, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Operational, code, message)
    }

    pub fn programming(code: u16, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Programming, code, message)
    }

    pub fn is_connection_level(&self) -> bool {
        CONNECTION_ERROR_CODES.contains(&self.code)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.code, self.message)
    }
}

impl std::error::Error for DriverError {}

/// A server warning raised by the last statement (`SHOW WARNINGS` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverWarning {
    pub level: String,
    pub code: u16,
    pub message: String,
}

impl fmt::Display for DriverWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.level, self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub password: String,
    pub init_command: String,
    pub connect_timeout: Option<Duration>,
}

impl ConnectParams {
    pub fn new(host: &str, port: u16, db: &str, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            db: db.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            init_command: DEFAULT_INIT_COMMAND.to_string(),
            connect_timeout: None,
        }
    }
}

/// One live session with a database server.
///
/// `execute` substitutes `%s` placeholders from `args` the way the driver
/// always does; an empty slice still collapses `%%` to `%`.
pub trait Connection: Send {
    fn execute(&mut self, sql: &str, args: &[DataValue]) -> Result<u64, DriverError>;

    fn fetch_all(&mut self) -> Result<Vec<DataRow>, DriverError>;

    fn last_insert_id(&self) -> Option<u64>;

    /// Warnings produced by the most recent `execute`, draining them.
    fn take_warnings(&mut self) -> Vec<DriverWarning>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    fn thread_id(&self) -> u64;

    /// Driver-specific literal escaping. `None` defers to the generic
    /// MySQL-style escaping of the access layer.
    fn literal(&self, _value: &DataValue) -> Option<String> {
        None
    }

    fn close(&mut self);
}

pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, DriverError>;
}
