use crate::table_finder::find_tables;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlfarm_core::{Result, SqlFarmError};
use std::collections::BTreeSet;
use std::fmt;

const GARBAGE_CHARS: &[char] = &[' ', '\t', '\n', '\r', '\x0b', '\x0c', ';'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Other(String),
}

impl Command {
    pub fn parse(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "select" => Command::Select,
            "insert" => Command::Insert,
            "update" => Command::Update,
            "delete" => Command::Delete,
            "replace" => Command::Replace,
            other => Command::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Select => "select",
            Command::Insert => "insert",
            Command::Update => "update",
            Command::Delete => "delete",
            Command::Replace => "replace",
            Command::Other(word) => word,
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self, Command::Select)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips surrounding whitespace and statement terminators.
pub fn normalize(sql: &str) -> &str {
    sql.trim_matches(GARBAGE_CHARS)
}

/// First whitespace-delimited token of the statement.
pub fn command_of(sql: &str) -> Command {
    Command::parse(sql.split_whitespace().next().unwrap_or(""))
}

static PRIMARY_TABLE: Lazy<[(Command, Regex); 5]> = Lazy::new(|| {
    [
        (
            Command::Select,
            Regex::new(r"(?is)^select\s.*?\sfrom\s+`?(?P<table>\w+)`?").expect("select pattern"),
        ),
        (
            Command::Insert,
            Regex::new(r"(?i)^insert\s+(ignore\s+)?(into\s+)?`?(?P<table>\w+)`?")
                .expect("insert pattern"),
        ),
        (
            Command::Update,
            Regex::new(r"(?i)^update\s+(ignore\s+)?`?(?P<table>\w+)`?\s+set")
                .expect("update pattern"),
        ),
        (
            Command::Replace,
            Regex::new(r"(?i)^replace\s+(into\s+)?`?(?P<table>\w+)`?").expect("replace pattern"),
        ),
        (
            Command::Delete,
            Regex::new(r"(?i)^delete\s+from\s+`?(?P<table>\w+)`?").expect("delete pattern"),
        ),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatement {
    pub command: Command,
    /// The table named right after the command keyword (or the first `from`).
    pub primary_table: String,
    /// Every table the extractor found, primary table included.
    pub tables: BTreeSet<String>,
}

/// Classifies a statement for routing. Only the five data-manipulation
/// commands are routable.
pub fn parse_statement(sql: &str) -> Result<ParsedStatement> {
    let sql = sql.trim_start();
    let command = command_of(sql);
    let pattern = PRIMARY_TABLE
        .iter()
        .find(|(cmd, _)| *cmd == command)
        .map(|(_, re)| re)
        .ok_or_else(|| {
            SqlFarmError::Unsupported(format!("SQL command {} is not yet supported", command))
        })?;
    let primary_table = pattern
        .captures(sql)
        .and_then(|caps| caps.name("table"))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| SqlFarmError::Unsupported(sql.to_string()))?;
    Ok(ParsedStatement {
        command,
        primary_table,
        tables: find_tables(sql),
    })
}
