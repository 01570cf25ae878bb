//! A named shard: one database target and its single connection slot.

use crate::alert::{AlertSource, Alerts};
use crate::config::{parse_master, FarmConfig, DEFAULT_CONNECTION_EXPIRE_SECONDS};
use crate::cursor::classify;
use crate::querylog::QueryLogEntry;
use sqlfarm_core::clock::saturating_add;
use sqlfarm_core::{
    Clock, ConnectParams, Connection, ConnectionFactory, DataValue, DriverError, IsolationLevel,
    Result, SqlFarmError,
};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

pub(crate) const HISTORY_LEN: usize = 10;
pub(crate) const SORT_BUFFER_SETUP: &str = "set sort_buffer_size=2000000";
pub(crate) const DISABLE_QUERY_CACHE: &str = "set session query_cache_type = OFF";
pub(crate) const ISOLATION_QUERY: &str = "select @@tx_isolation";
pub(crate) const CLIENT_QUERY: &str = "select host from information_schema.processlist where id=%s";

/// Everything that decides whether two farms are interchangeable. A farm
/// whose settings are unchanged by a reload keeps its open connection.
#[derive(Debug, Clone, PartialEq)]
pub struct FarmSettings {
    pub params: ConnectParams,
    pub ttl: Duration,
    pub disable_query_cache: bool,
    pub delete_without_where: bool,
}

impl FarmSettings {
    pub fn from_config(
        config: &FarmConfig,
        delete_without_where: bool,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut params = parse_master(&config.master)?;
        params.connect_timeout = connect_timeout;
        Ok(Self {
            params,
            ttl: Duration::from_secs(
                config
                    .connection_expire_seconds
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_CONNECTION_EXPIRE_SECONDS),
            ),
            disable_query_cache: config.disable_query_cache,
            delete_without_where: config.delete_without_where || delete_without_where,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HistoryEntry {
    pub at: SystemTime,
    pub sql: String,
    pub args: Option<Vec<DataValue>>,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3}, {:?}, {})",
            sqlfarm_core::clock::to_unix_f64(self.at),
            self.sql,
            sqlfarm_core::types::format_args_list(self.args.as_deref())
        )
    }
}

/// A live connection plus the per-connection bookkeeping that is discarded
/// with it.
pub(crate) struct Session {
    pub conn: Box<dyn Connection>,
    pub generation: u64,
    pub client: String,
    pub history: VecDeque<HistoryEntry>,
    pub tables: BTreeSet<String>,
    pub call_sites: Vec<String>,
}

impl Session {
    pub fn remember(&mut self, at: SystemTime, sql: &str, args: Option<&[DataValue]>) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            at,
            sql: sql.to_string(),
            args: args.map(<[DataValue]>::to_vec),
        });
    }

    pub fn recent(&self) -> Vec<String> {
        self.history.iter().map(|entry| entry.to_string()).collect()
    }

    /// Text form of a value as this driver would render it.
    pub fn literal(&self, value: &DataValue) -> String {
        self.conn
            .literal(value)
            .unwrap_or_else(|| sqlfarm_sql::escape_literal(value))
    }
}

pub(crate) struct FarmState {
    pub session: Option<Session>,
    expires_at: SystemTime,
    isolation: IsolationLevel,
    generation: u64,
    pub log: Option<Vec<QueryLogEntry>>,
}

/// What a caller learns about the connection it was handed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub generation: u64,
    pub thread_id: u64,
    pub client: String,
    pub isolation: IsolationLevel,
}

pub struct Farm {
    name: String,
    settings: FarmSettings,
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn Clock>,
    alerts: Arc<Alerts>,
    state: Mutex<FarmState>,
}

impl fmt::Debug for Farm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Farm")
            .field("name", &self.name)
            .field("host", &self.settings.params.host)
            .field("db", &self.settings.params.db)
            .finish()
    }
}

impl Farm {
    pub(crate) fn new(
        name: &str,
        settings: FarmSettings,
        factory: Arc<dyn ConnectionFactory>,
        clock: Arc<dyn Clock>,
        alerts: Arc<Alerts>,
    ) -> Self {
        let expires_at = saturating_add(clock.now(), settings.ttl);
        Self {
            name: name.to_string(),
            settings,
            factory,
            clock,
            alerts,
            state: Mutex::new(FarmState {
                session: None,
                expires_at,
                isolation: IsolationLevel::Unknown,
                generation: 0,
                log: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.settings.params.host
    }

    pub fn params(&self) -> &ConnectParams {
        &self.settings.params
    }

    pub fn settings(&self) -> &FarmSettings {
        &self.settings
    }

    pub fn delete_without_where(&self) -> bool {
        self.settings.delete_without_where
    }

    /// Databases whose name starts with `test` are test targets.
    pub fn is_test_target(&self) -> bool {
        self.settings.params.db.starts_with("test")
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.lock().isolation.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn is_expired(&self) -> bool {
        let state = self.lock();
        self.clock.now() > state.expires_at
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FarmState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn alert_source(&self, client: Option<&str>) -> AlertSource {
        AlertSource {
            farm: Some(self.name.clone()),
            host: Some(self.settings.params.host.clone()),
            client: client.map(str::to_string),
            ..self.alerts.source()
        }
    }

    pub(crate) fn alerts(&self) -> &Alerts {
        &self.alerts
    }

    pub(crate) fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// The open session, connecting first if the slot is empty.
    pub(crate) fn session<'s>(&self, state: &'s mut FarmState) -> Result<&'s mut Session> {
        if state.session.is_none() {
            self.connect(state)?;
        }
        match state.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(SqlFarmError::Connection(DriverError::operational(
                2013,
                "connection slot empty after connect",
            ))),
        }
    }

    /// Reuses the open connection unless the slot is empty or the connection
    /// outlived its lifetime.
    pub fn get_connection(&self) -> Result<SessionInfo> {
        let mut state = self.lock();
        if state.session.is_some() && self.clock.now() > state.expires_at {
            debug!(farm = %self.name, "connection expired, reconnecting");
            Self::drop_session(&mut state);
        }
        let session = self.session(&mut state)?;
        let (generation, thread_id, client) = (
            session.generation,
            session.conn.thread_id(),
            session.client.clone(),
        );
        Ok(SessionInfo {
            generation,
            thread_id,
            client,
            isolation: state.isolation.clone(),
        })
    }

    fn connect(&self, state: &mut FarmState) -> Result<()> {
        let mut conn = match self.factory.connect(&self.settings.params) {
            Ok(conn) => conn,
            Err(err) => return Err(self.connect_failure(err)),
        };
        let (isolation, client) = match self.setup(conn.as_mut()) {
            Ok(found) => found,
            Err(err) => {
                conn.close();
                return Err(self.connect_failure(err));
            }
        };

        state.generation += 1;
        state.isolation = isolation;
        state.expires_at = saturating_add(self.clock.now(), self.settings.ttl);
        info!(
            farm = %self.name,
            host = %self.settings.params.host,
            db = %self.settings.params.db,
            isolation = %state.isolation,
            generation = state.generation,
            "connected"
        );
        let generation = state.generation;
        state.session = Some(Session {
            conn,
            generation,
            client,
            history: VecDeque::with_capacity(HISTORY_LEN),
            tables: BTreeSet::new(),
            call_sites: Vec::new(),
        });
        Ok(())
    }

    fn setup(
        &self,
        conn: &mut dyn Connection,
    ) -> std::result::Result<(IsolationLevel, String), DriverError> {
        conn.execute(SORT_BUFFER_SETUP, &[])?;
        if self.settings.disable_query_cache {
            conn.execute(DISABLE_QUERY_CACHE, &[])?;
        }
        conn.execute(ISOLATION_QUERY, &[])?;
        let isolation = match first_value(conn.fetch_all()?) {
            Some(DataValue::String(level)) => IsolationLevel::parse(&level),
            _ => IsolationLevel::Unknown,
        };

        let thread_id = conn.thread_id() as i64;
        conn.execute(CLIENT_QUERY, &[DataValue::Int64(thread_id)])?;
        let client = match first_value(conn.fetch_all()?) {
            Some(DataValue::String(host)) => host,
            _ => "unknown".to_string(),
        };
        Ok((isolation, client))
    }

    fn connect_failure(&self, err: DriverError) -> SqlFarmError {
        let classified = classify(err, Vec::new());
        self.alerts
            .send(&classified.error, None, self.alert_source(None));
        warn!(farm = %self.name, error = %classified.error, "connect failed");
        classified.error
    }

    /// Forces the next use to reconnect.
    pub fn invalidate(&self) {
        Self::drop_session(&mut self.lock());
    }

    pub(crate) fn drop_session(state: &mut FarmState) {
        if let Some(mut session) = state.session.take() {
            session.conn.close();
        }
    }

    /// Starts a fresh snapshot on a long-lived connection by rolling back.
    /// Returns whether a rollback was issued.
    pub fn refresh_snapshot(&self) -> bool {
        let mut state = self.lock();
        if !state.isolation.holds_snapshot() {
            return false;
        }
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        match session.conn.rollback() {
            Ok(()) => true,
            Err(err) => {
                let client = session.client.clone();
                let classified = classify(err, Vec::new());
                if classified.alert {
                    self.alerts.send(
                        &classified.error,
                        None,
                        self.alert_source(Some(&client)),
                    );
                }
                warn!(farm = %self.name, error = %classified.error, "snapshot refresh failed");
                if classified.invalidate {
                    Self::drop_session(&mut state);
                }
                false
            }
        }
    }

    /// Commits whatever the open connection holds.
    pub fn commit_open(&self) -> Result<()> {
        self.finish_open(Finish::Commit)
    }

    pub fn rollback_open(&self) -> Result<()> {
        self.finish_open(Finish::Rollback)
    }

    fn finish_open(&self, finish: Finish) -> Result<()> {
        let mut state = self.lock();
        match state.session.as_ref() {
            Some(session) => {
                let generation = session.generation;
                self.finish_in(&mut state, generation, finish)
            }
            None => Ok(()),
        }
    }

    /// Commits the writes made on connection `generation`. Those writes are
    /// lost if that connection has since been dropped, which is an error.
    pub(crate) fn commit_generation(&self, generation: u64) -> Result<()> {
        self.finish_in(&mut self.lock(), generation, Finish::Commit)
    }

    /// Rolls back connection `generation`; a connection that is already gone
    /// has nothing left to roll back.
    pub(crate) fn rollback_generation(&self, generation: u64) -> Result<()> {
        self.finish_in(&mut self.lock(), generation, Finish::Rollback)
    }

    fn finish_in(&self, state: &mut FarmState, generation: u64, finish: Finish) -> Result<()> {
        let session = match state.session.as_mut() {
            Some(session) if session.generation == generation => session,
            _ => {
                return match finish {
                    Finish::Rollback => Ok(()),
                    Finish::Commit => Err(SqlFarmError::Connection(DriverError::operational(
                        2013,
                        format!("connection to farm {} was lost before commit", self.name),
                    ))),
                }
            }
        };
        let outcome = match finish {
            Finish::Commit => session.conn.commit(),
            Finish::Rollback => session.conn.rollback(),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                let client = session.client.clone();
                let recent = session.recent();
                Self::drop_session(state);
                let classified = classify(err, recent);
                if classified.alert {
                    self.alerts.send(
                        &classified.error,
                        None,
                        self.alert_source(Some(&client)),
                    );
                }
                Err(classified.error)
            }
        }
    }

    /// Rolls back the open connection, connecting first. Any failure drops
    /// the connection instead of surfacing.
    pub(crate) fn force_rollback(&self) {
        let mut state = self.lock();
        let failed = match self.session(&mut state) {
            Ok(session) => session.conn.rollback().is_err(),
            Err(_) => true,
        };
        if failed {
            debug!(farm = %self.name, "forced rollback failed, dropping connection");
            Self::drop_session(&mut state);
        }
    }

    pub fn close(&self) {
        Self::drop_session(&mut self.lock());
    }

    /// Starts recording statements, opening the connection if needed.
    pub fn start_log(&self) -> Result<()> {
        let mut state = self.lock();
        self.session(&mut state)?;
        if state.log.is_none() {
            state.log = Some(Vec::new());
        }
        Ok(())
    }

    pub fn stop_log(&self) {
        self.lock().log = None;
    }

    pub fn log_entries(&self) -> Vec<QueryLogEntry> {
        self.lock().log.clone().unwrap_or_default()
    }

    pub fn is_logging(&self) -> bool {
        self.lock().log.is_some()
    }
}

impl Drop for Farm {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        Self::drop_session(state);
    }
}

#[derive(Debug, Clone, Copy)]
enum Finish {
    Commit,
    Rollback,
}

fn first_value(rows: Vec<sqlfarm_core::DataRow>) -> Option<DataValue> {
    rows.into_iter().next()?.values.into_iter().next()
}
