pub mod clock;
pub mod driver;
pub mod error;
pub mod isolation;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::{
    ConnectParams, Connection, ConnectionFactory, DriverError, DriverErrorKind, DriverWarning,
};
pub use error::SqlFarmError;
pub use isolation::IsolationLevel;
pub use types::{DataRow, DataValue, ExecuteResult};

pub type Result<T> = std::result::Result<T, SqlFarmError>;
