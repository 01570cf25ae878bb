//! Time-boxed denylist of statement fingerprints.
//!
//! Two maps are kept: `partial` holds fingerprints of statement text with its
//! placeholders left in (blocks a whole query shape), `full` holds
//! fingerprints of statements with their arguments interpolated (blocks one
//! exact query). Lookups read an `Arc` snapshot of both; refreshes build a
//! merged copy and swap it in.

use serde::{Deserialize, Serialize};
use sqlfarm_core::clock::from_unix_f64;
use sqlfarm_core::{Clock, DataValue, Result, SqlFarmError};
use sqlfarm_sql::{fingerprint, interpolate};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintKind {
    Partial,
    Full,
}

/// A pushed blacklist change: fingerprint to unix-seconds expiry. An expiry
/// at or before now unblocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlacklistUpdate {
    #[serde(default)]
    pub partial: BTreeMap<String, f64>,
    #[serde(default)]
    pub full: BTreeMap<String, f64>,
}

impl BlacklistUpdate {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SqlFarmError::Config(format!("invalid blacklist document: {e}")))
    }

    pub fn block(mut self, kind: FingerprintKind, digest: &str, until: f64) -> Self {
        self.entries_mut(kind).insert(digest.to_string(), until);
        self
    }

    pub fn unblock(self, kind: FingerprintKind, digest: &str) -> Self {
        self.block(kind, digest, -1.0)
    }

    fn entries(&self, kind: FingerprintKind) -> &BTreeMap<String, f64> {
        match kind {
            FingerprintKind::Partial => &self.partial,
            FingerprintKind::Full => &self.full,
        }
    }

    fn entries_mut(&mut self, kind: FingerprintKind) -> &mut BTreeMap<String, f64> {
        match kind {
            FingerprintKind::Partial => &mut self.partial,
            FingerprintKind::Full => &mut self.full,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Entries {
    partial: HashMap<String, SystemTime>,
    full: HashMap<String, SystemTime>,
}

impl Entries {
    fn get(&self, kind: FingerprintKind) -> &HashMap<String, SystemTime> {
        match kind {
            FingerprintKind::Partial => &self.partial,
            FingerprintKind::Full => &self.full,
        }
    }

    fn get_mut(&mut self, kind: FingerprintKind) -> &mut HashMap<String, SystemTime> {
        match kind {
            FingerprintKind::Partial => &mut self.partial,
            FingerprintKind::Full => &mut self.full,
        }
    }
}

#[derive(Debug)]
pub struct QueryBlacklist {
    entries: RwLock<Arc<Entries>>,
    refresh_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl QueryBlacklist {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(Entries::default())),
            refresh_lock: Mutex::new(()),
            clock,
        }
    }

    fn snapshot(&self) -> Arc<Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Merges `update` into the current entries: active entries survive,
    /// updated fingerprints are overwritten, anything expired is dropped.
    pub fn refresh(&self, update: &BlacklistUpdate) {
        let _serialized = self.refresh_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let current = self.snapshot();
        let mut merged = Entries::default();
        for kind in [FingerprintKind::Partial, FingerprintKind::Full] {
            let target = merged.get_mut(kind);
            for (digest, until) in current.get(kind) {
                if *until > now {
                    target.insert(digest.clone(), *until);
                }
            }
            for (digest, raw_until) in update.entries(kind) {
                let until = from_unix_f64(*raw_until);
                if until > now {
                    target.insert(digest.clone(), until);
                } else {
                    target.remove(digest);
                }
            }
        }
        info!(
            partial = merged.partial.len(),
            full = merged.full.len(),
            "query blacklist refreshed"
        );
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(merged);
    }

    pub fn len(&self, kind: FingerprintKind) -> usize {
        self.snapshot().get(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        let entries = self.snapshot();
        entries.partial.is_empty() && entries.full.is_empty()
    }

    /// The expiry of an active block on `digest`, if any. Expired entries
    /// found on the way are evicted.
    pub fn is_blocked(&self, kind: FingerprintKind, digest: &str) -> Option<SystemTime> {
        let until = *self.snapshot().get(kind).get(digest)?;
        let now = self.clock.now();
        if until > now {
            return Some(until);
        }
        self.evict(kind, digest, now);
        None
    }

    fn evict(&self, kind: FingerprintKind, digest: &str, now: SystemTime) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let still_expired = guard
            .get(kind)
            .get(digest)
            .map(|until| *until <= now)
            .unwrap_or(false);
        if still_expired {
            Arc::make_mut(&mut guard).get_mut(kind).remove(digest);
        }
    }

    /// Fails with `QueryDisabled` when either form of the statement is
    /// blocked. Returns the partial fingerprint, which callers stamp onto the
    /// statement.
    ///
    /// The full form needs the arguments rendered, so it is only computed
    /// while full-form entries exist.
    pub fn check<F>(&self, sql: &str, args: Option<&[DataValue]>, literal: F) -> Result<String>
    where
        F: Fn(&DataValue) -> String,
    {
        if !self.snapshot().full.is_empty() {
            let full_sql = match args {
                Some(values) if !values.is_empty() => interpolate(sql, values, literal)?,
                _ => sql.to_string(),
            };
            if let Some(until) = self.is_blocked(FingerprintKind::Full, &fingerprint(&full_sql)) {
                return Err(SqlFarmError::QueryDisabled {
                    sql: full_sql,
                    until,
                });
            }
        }

        let digest = fingerprint(sql);
        if let Some(until) = self.is_blocked(FingerprintKind::Partial, &digest) {
            return Err(SqlFarmError::QueryDisabled {
                sql: sql.to_string(),
                until,
            });
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlfarm_core::clock::to_unix_f64;
    use sqlfarm_core::ManualClock;
    use sqlfarm_sql::escape_literal;
    use std::time::Duration;

    const SQL: &str = "select * from users where id=%s";

    fn setup() -> (Arc<ManualClock>, QueryBlacklist) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let blacklist = QueryBlacklist::new(clock.clone());
        (clock, blacklist)
    }

    fn now_plus(clock: &ManualClock, secs: f64) -> f64 {
        to_unix_f64(clock.now()) + secs
    }

    #[test]
    fn blocks_until_expiry_then_allows() {
        let (clock, blacklist) = setup();
        let digest = fingerprint(SQL);
        blacklist.refresh(&BlacklistUpdate::default().block(
            FingerprintKind::Partial,
            &digest,
            now_plus(&clock, 60.0),
        ));

        let err = blacklist.check(SQL, None, escape_literal).unwrap_err();
        assert!(matches!(err, SqlFarmError::QueryDisabled { .. }));

        clock.advance(Duration::from_secs(59));
        assert!(blacklist.check(SQL, None, escape_literal).is_err());

        clock.advance(Duration::from_secs(2));
        assert_eq!(blacklist.check(SQL, None, escape_literal).expect("allowed"), digest);
        assert_eq!(blacklist.len(FingerprintKind::Partial), 0, "expired entry evicted");
    }

    #[test]
    fn unblock_entry_allows_immediately() {
        let (clock, blacklist) = setup();
        let digest = fingerprint(SQL);
        blacklist.refresh(&BlacklistUpdate::default().block(
            FingerprintKind::Partial,
            &digest,
            now_plus(&clock, 3600.0),
        ));
        assert!(blacklist.check(SQL, None, escape_literal).is_err());

        blacklist.refresh(&BlacklistUpdate::default().unblock(FingerprintKind::Partial, &digest));
        assert!(blacklist.check(SQL, None, escape_literal).is_ok());
        assert!(blacklist.is_empty());
    }

    #[test]
    fn refresh_merges_instead_of_replacing() {
        let (clock, blacklist) = setup();
        let until = now_plus(&clock, 60.0);
        blacklist.refresh(
            &BlacklistUpdate::default()
                .block(FingerprintKind::Partial, "a", until)
                .block(FingerprintKind::Full, "b", until),
        );
        blacklist.refresh(
            &BlacklistUpdate::default()
                .block(FingerprintKind::Partial, "c", until)
                .block(FingerprintKind::Full, "b", now_plus(&clock, 120.0)),
        );
        assert_eq!(blacklist.len(FingerprintKind::Partial), 2);
        assert_eq!(blacklist.len(FingerprintKind::Full), 1);
        assert!(blacklist.is_blocked(FingerprintKind::Partial, "a").is_some());
        assert!(blacklist.is_blocked(FingerprintKind::Partial, "c").is_some());

        clock.advance(Duration::from_secs(90));
        assert!(blacklist.is_blocked(FingerprintKind::Full, "b").is_some());
        blacklist.refresh(&BlacklistUpdate::default());
        assert_eq!(blacklist.len(FingerprintKind::Partial), 0, "stale entries pruned");
        assert_eq!(blacklist.len(FingerprintKind::Full), 1);
    }

    #[test]
    fn full_form_blocks_one_argument_set() {
        let (clock, blacklist) = setup();
        let blocked = fingerprint("select * from users where id=42");
        blacklist.refresh(&BlacklistUpdate::default().block(
            FingerprintKind::Full,
            &blocked,
            now_plus(&clock, 60.0),
        ));

        let err = blacklist
            .check(SQL, Some(&[DataValue::Int64(42)]), escape_literal)
            .unwrap_err();
        match err {
            SqlFarmError::QueryDisabled { sql, .. } => {
                assert_eq!(sql, "select * from users where id=42")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(blacklist
            .check(SQL, Some(&[DataValue::Int64(7)]), escape_literal)
            .is_ok());
    }

    #[test]
    fn blacklist_document_parses() {
        let update = BlacklistUpdate::from_json(
            br#"{"partial": {"d41d8cd98f00b204e9800998ecf8427e": 1700000060.5}}"#,
        )
        .expect("document");
        assert_eq!(update.partial.len(), 1);
        assert!(update.full.is_empty());
        assert!(BlacklistUpdate::from_json(b"[1, 2]").is_err());
    }
}
