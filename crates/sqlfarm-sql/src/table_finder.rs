//! Best-effort lexical table extraction.
//!
//! This is not a SQL parser. Select, update and delete statements are cut on
//! the keywords that bound their table-reference clauses and the leading
//! identifier of each comma-separated item is taken as a table name, which
//! can pick up an alias in unusual statements. Insert and replace statements
//! name their single table right after the command.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static SELECT_SPLIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)select.*?\s+from\s+|\swhere\s.*|\sjoin\s|\susing\s").unwrap()
});
static UPDATE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)update\s+(?:ignore\s+)?|\sset\s.*").unwrap());
static DELETE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)delete.*?from\s+|\swhere\s.*").unwrap());

static INSERT_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^insert\s+(?:ignore\s+)?(?:into\s+)?`?(\w+)`?").unwrap());
static REPLACE_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^replace\s+(?:into\s+)?`?(\w+)`?").unwrap());

static CLEANUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s,]").unwrap());
static TABLE_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|,)\s*(\w+)").unwrap());
static HAS_FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\sfrom\s").unwrap());

pub fn find_tables(sql: &str) -> BTreeSet<String> {
    let command = sql.split(' ').next().unwrap_or("").to_ascii_lowercase();
    match command.as_str() {
        "select" => {
            if !HAS_FROM.is_match(sql) {
                return BTreeSet::new();
            }
            split_tables(&SELECT_SPLIT, sql)
        }
        "update" => split_tables(&UPDATE_SPLIT, sql),
        "delete" => split_tables(&DELETE_SPLIT, sql),
        "insert" => leading_table(&INSERT_TABLE, sql),
        "replace" => leading_table(&REPLACE_TABLE, sql),
        _ => BTreeSet::new(),
    }
}

fn split_tables(boundaries: &Regex, sql: &str) -> BTreeSet<String> {
    boundaries
        .split(sql)
        .filter(|fragment| !fragment.is_empty())
        .flat_map(|fragment| {
            let cleaned = CLEANUP.replace_all(fragment, "");
            TABLE_ITEM
                .captures_iter(&cleaned)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn leading_table(pattern: &Regex, sql: &str) -> BTreeSet<String> {
    pattern
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| BTreeSet::from([m.as_str().to_string()]))
        .unwrap_or_default()
}
