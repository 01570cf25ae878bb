use std::fmt;

/// Session transaction isolation as reported by `select @@tx_isolation`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// Not yet observed, or a level this layer does not recognise.
    #[default]
    Unknown,
}

impl IsolationLevel {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().replace(' ', "-").as_str() {
            "READ-UNCOMMITTED" => IsolationLevel::ReadUncommitted,
            "READ-COMMITTED" => IsolationLevel::ReadCommitted,
            "REPEATABLE-READ" => IsolationLevel::RepeatableRead,
            "SERIALIZABLE" => IsolationLevel::Serializable,
            _ => IsolationLevel::Unknown,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IsolationLevel::ReadUncommitted => 1,
            IsolationLevel::ReadCommitted => 2,
            IsolationLevel::RepeatableRead => 3,
            IsolationLevel::Serializable => 4,
            IsolationLevel::Unknown => 100,
        }
    }

    /// Whether a long-lived session keeps reading from one snapshot until it
    /// ends its transaction. Unknown levels are treated as strict.
    pub fn holds_snapshot(&self) -> bool {
        self.rank() > IsolationLevel::ReadCommitted.rank()
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ-UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ-COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE-READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}
