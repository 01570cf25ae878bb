use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataValue {
    Null,
    Int64(i64),
    Float64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Null => write!(f, "NULL"),
            DataValue::Int64(v) => write!(f, "{v}"),
            DataValue::Float64(v) => write!(f, "{v}"),
            DataValue::Bool(v) => write!(f, "{v}"),
            DataValue::String(v) => write!(f, "{v:?}"),
            DataValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Int64(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::String(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::String(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRow {
    pub values: Vec<DataValue>,
}

impl DataRow {
    pub fn new(values: Vec<DataValue>) -> Self {
        Self { values }
    }

    pub fn first(&self) -> Option<&DataValue> {
        self.values.first()
    }
}

/// What a statement hands back to the caller: fetched rows for a select,
/// the generated id for an insert when the driver has one, otherwise the
/// affected-row count.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResult {
    Rows(Vec<DataRow>),
    Affected(u64),
    InsertId(u64),
}

impl ExecuteResult {
    pub fn rows(&self) -> &[DataRow] {
        match self {
            ExecuteResult::Rows(rows) => rows,
            _ => &[],
        }
    }

    pub fn into_rows(self) -> Vec<DataRow> {
        match self {
            ExecuteResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            ExecuteResult::Rows(rows) => rows.len() as u64,
            ExecuteResult::Affected(count) => *count,
            ExecuteResult::InsertId(_) => 1,
        }
    }
}

/// Renders an argument list the way it shows up in diagnostics.
pub fn format_args_list(args: Option<&[DataValue]>) -> String {
    match args {
        None => "None".to_string(),
        Some(values) => {
            let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}
