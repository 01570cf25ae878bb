use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One statement recorded while a farm's query log is running. Failed
/// statements are recorded with zero elapsed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub sql: String,
    pub args: Option<String>,
    pub elapsed_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text { with_backtrace: bool },
    Structured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryLog {
    Text(String),
    Structured(BTreeMap<String, Vec<QueryLogEntry>>),
}

impl QueryLog {
    pub fn build(logs: BTreeMap<String, Vec<QueryLogEntry>>, format: LogFormat) -> Self {
        match format {
            LogFormat::Structured => QueryLog::Structured(logs),
            LogFormat::Text { with_backtrace } => {
                let parts: Vec<String> = logs
                    .iter()
                    .map(|(farm, entries)| format_farm_log(farm, entries, with_backtrace))
                    .collect();
                QueryLog::Text(parts.join(" "))
            }
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            QueryLog::Text(text) => Some(text),
            QueryLog::Structured(_) => None,
        }
    }
}

/// The text report of a single farm, slowest statement first. A farm that
/// recorded nothing renders as an empty string.
pub fn format_farm_log(farm: &str, entries: &[QueryLogEntry], with_backtrace: bool) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<&QueryLogEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| b.elapsed_secs.total_cmp(&a.elapsed_secs));
    let total: f64 = entries.iter().map(|e| e.elapsed_secs).sum();

    let mut out = format!("{farm}: {} SQL statements ({total} seconds):\n", entries.len());
    for entry in sorted {
        let _ = writeln!(out, "{:8.6}sec {}", entry.elapsed_secs, entry.sql);
        if with_backtrace {
            let _ = writeln!(out, "{}", entry.backtrace.as_deref().unwrap_or(""));
        }
    }
    out.push('\n');
    out
}
