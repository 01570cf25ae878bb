use once_cell::sync::Lazy;
use serde::Serialize;
use std::time::SystemTime;

/// Who is running statements: stamped onto every statement comment and
/// every alert.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessContext {
    pub cmdline: String,
    pub user: String,
    pub host: String,
    pub pid: u32,
    #[serde(skip)]
    pub started_at: SystemTime,
}

static PROCESS: Lazy<ProcessContext> = Lazy::new(|| {
    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    let user = ["USER", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|raw| raw.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    ProcessContext {
        cmdline,
        user,
        host,
        pid: std::process::id(),
        started_at: SystemTime::now(),
    }
});

pub fn process() -> &'static ProcessContext {
    &PROCESS
}

/// `SQLFARM_SOURCE` when set, otherwise the command line. `%` is doubled so
/// the driver's placeholder substitution leaves it alone.
pub fn statement_source() -> String {
    std::env::var("SQLFARM_SOURCE")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| process().cmdline.clone())
        .replace('%', "%%")
}
