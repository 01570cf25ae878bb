//! A scripted in-memory driver.

use crate::farm::{CLIENT_QUERY, DISABLE_QUERY_CACHE, ISOLATION_QUERY, SORT_BUFFER_SETUP};
use sqlfarm_core::{
    ConnectParams, Connection, ConnectionFactory, DataRow, DataValue, DriverError, DriverWarning,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub host: String,
    pub thread_id: u64,
    pub sql: String,
    pub args: Vec<DataValue>,
}

#[derive(Default)]
struct MockState {
    connects: Vec<String>,
    connect_failures: Vec<DriverError>,
    executed: Vec<Executed>,
    failures: Vec<(String, DriverError)>,
    warnings: Vec<(String, DriverWarning)>,
    rows: Vec<(String, Vec<DataRow>)>,
    isolation: HashMap<String, String>,
    commits: Vec<(String, u64)>,
    rollbacks: Vec<(String, u64)>,
    commit_failures: Vec<(String, DriverError)>,
    rollback_failures: Vec<(String, DriverError)>,
    insert_id: Option<u64>,
    closed: Vec<u64>,
    next_thread_id: u64,
}

/// Shared script and record of everything the mock connections saw.
#[derive(Clone, Default)]
pub struct MockDb {
    state: Arc<Mutex<MockState>>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(MockFactory { db: self.clone() })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_connect(&self, err: DriverError) {
        self.lock().connect_failures.push(err);
    }

    /// The next statement containing `needle` fails with `err`.
    pub fn fail_next(&self, needle: &str, err: DriverError) {
        self.lock().failures.push((needle.to_string(), err));
    }

    pub fn warn_on(&self, needle: &str, warning: DriverWarning) {
        self.lock().warnings.push((needle.to_string(), warning));
    }

    pub fn rows_for(&self, needle: &str, rows: Vec<DataRow>) {
        self.lock().rows.push((needle.to_string(), rows));
    }

    pub fn set_isolation(&self, host: &str, level: &str) {
        self.lock()
            .isolation
            .insert(host.to_string(), level.to_string());
    }

    pub fn fail_commit(&self, host: &str, err: DriverError) {
        self.lock().commit_failures.push((host.to_string(), err));
    }

    pub fn fail_rollback(&self, host: &str, err: DriverError) {
        self.lock().rollback_failures.push((host.to_string(), err));
    }

    pub fn set_insert_id(&self, id: Option<u64>) {
        self.lock().insert_id = id;
    }

    /// Hosts connected to, in order.
    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    /// Statements run by callers, session setup excluded.
    pub fn statements(&self) -> Vec<Executed> {
        self.lock()
            .executed
            .iter()
            .filter(|e| !is_setup(&e.sql))
            .cloned()
            .collect()
    }

    pub fn statements_on(&self, host: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|e| e.host == host)
            .map(|e| e.sql)
            .collect()
    }

    pub fn all_statements(&self) -> Vec<String> {
        self.lock().executed.iter().map(|e| e.sql.clone()).collect()
    }

    pub fn commits(&self) -> Vec<String> {
        self.lock().commits.iter().map(|(host, _)| host.clone()).collect()
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.lock().rollbacks.iter().map(|(host, _)| host.clone()).collect()
    }

    pub fn closed(&self) -> usize {
        self.lock().closed.len()
    }
}

fn is_setup(sql: &str) -> bool {
    sql == SORT_BUFFER_SETUP || sql == DISABLE_QUERY_CACHE || sql == ISOLATION_QUERY || sql == CLIENT_QUERY
}

struct MockFactory {
    db: MockDb,
}

impl ConnectionFactory for MockFactory {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, DriverError> {
        let mut state = self.db.lock();
        if !state.connect_failures.is_empty() {
            return Err(state.connect_failures.remove(0));
        }
        state.next_thread_id += 1;
        state.connects.push(params.host.clone());
        Ok(Box::new(MockConnection {
            db: self.db.clone(),
            host: params.host.clone(),
            thread_id: state.next_thread_id,
            pending: Vec::new(),
            warnings: Vec::new(),
            last_insert_id: None,
        }))
    }
}

struct MockConnection {
    db: MockDb,
    host: String,
    thread_id: u64,
    pending: Vec<DataRow>,
    warnings: Vec<DriverWarning>,
    last_insert_id: Option<u64>,
}

impl Connection for MockConnection {
    fn execute(&mut self, sql: &str, args: &[DataValue]) -> Result<u64, DriverError> {
        let mut state = self.db.lock();
        state.executed.push(Executed {
            host: self.host.clone(),
            thread_id: self.thread_id,
            sql: sql.to_string(),
            args: args.to_vec(),
        });
        self.pending.clear();
        self.warnings.clear();
        self.last_insert_id = None;

        if let Some(pos) = state.failures.iter().position(|(needle, _)| sql.contains(needle.as_str())) {
            let (_, err) = state.failures.remove(pos);
            return Err(err);
        }
        self.warnings = state
            .warnings
            .iter()
            .filter(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, w)| w.clone())
            .collect();

        if sql == ISOLATION_QUERY {
            let level = state
                .isolation
                .get(&self.host)
                .cloned()
                .unwrap_or_else(|| "REPEATABLE-READ".to_string());
            self.pending = vec![DataRow::new(vec![DataValue::String(level)])];
        } else if sql == CLIENT_QUERY {
            self.pending = vec![DataRow::new(vec![DataValue::String(format!(
                "10.0.0.1:{}",
                40000 + self.thread_id
            ))])];
        } else if let Some((_, rows)) = state.rows.iter().find(|(needle, _)| sql.contains(needle.as_str())) {
            self.pending = rows.clone();
        }
        if sql.to_ascii_lowercase().starts_with("insert") {
            self.last_insert_id = state.insert_id;
        }
        Ok(if self.pending.is_empty() { 1 } else { self.pending.len() as u64 })
    }

    fn fetch_all(&mut self) -> Result<Vec<DataRow>, DriverError> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn last_insert_id(&self) -> Option<u64> {
        self.last_insert_id
    }

    fn take_warnings(&mut self) -> Vec<DriverWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        let mut state = self.db.lock();
        if let Some(pos) = state.commit_failures.iter().position(|(host, _)| *host == self.host) {
            let (_, err) = state.commit_failures.remove(pos);
            return Err(err);
        }
        state.commits.push((self.host.clone(), self.thread_id));
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        let mut state = self.db.lock();
        if let Some(pos) = state
            .rollback_failures
            .iter()
            .position(|(host, _)| *host == self.host)
        {
            let (_, err) = state.rollback_failures.remove(pos);
            return Err(err);
        }
        state.rollbacks.push((self.host.clone(), self.thread_id));
        Ok(())
    }

    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    fn close(&mut self) {
        self.db.lock().closed.push(self.thread_id);
    }
}
