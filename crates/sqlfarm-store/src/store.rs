//! The shard router: resolves statements to farms and keeps the transaction
//! bookkeeping that spans them.

use crate::alert::{AlertSink, Alerts, TracingAlertSink};
use crate::blacklist::{BlacklistUpdate, QueryBlacklist};
use crate::config::{ConfigSource, RuntimeOptions, StoreConfig};
use crate::cursor::Cursor;
use crate::farm::{Farm, FarmSettings};
use crate::querylog::{LogFormat, QueryLog};
use crate::reload::ReloadHub;
use crate::routing::{Target, Topology};
use crate::telemetry::{MetricsTelemetry, Telemetry, TelemetrySink};
use crate::transaction::{TransactionReport, TransactionState};
use sqlfarm_core::{
    Clock, ConnectionFactory, DataValue, ExecuteResult, Result, SqlFarmError, SystemClock,
};
use sqlfarm_sql::parse_statement;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State reachable from every cursor a store hands out.
pub(crate) struct Shared {
    pub id: Uuid,
    pub clock: Arc<dyn Clock>,
    pub options: RwLock<RuntimeOptions>,
    pub blacklist: QueryBlacklist,
    pub txn: Mutex<TransactionState>,
    pub telemetry: Telemetry,
    pub alerts: Arc<Alerts>,
    pub topology: RwLock<Arc<Topology>>,
}

impl Shared {
    pub fn options(&self) -> RuntimeOptions {
        self.options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn txn(&self) -> MutexGuard<'_, TransactionState> {
        self.txn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a write made through connection `generation` of `farm`.
    pub fn touch(&self, farm: &Arc<Farm>, generation: u64) {
        self.txn().touch(farm, generation);
    }
}

#[derive(Clone)]
pub struct StoreBuilder {
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    alerts: Arc<dyn AlertSink>,
    aliases: HashMap<String, String>,
    delete_without_where: bool,
    connect_timeout: Option<Duration>,
}

impl StoreBuilder {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(MetricsTelemetry),
            alerts: Arc::new(TracingAlertSink),
            aliases: HashMap::new(),
            delete_without_where: false,
            connect_timeout: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    /// Extra table to farm-name routes consulted after the configured table
    /// map.
    pub fn aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    /// Lets every farm run `delete`/`update` statements without `where`.
    pub fn delete_without_where(mut self, allowed: bool) -> Self {
        self.delete_without_where = allowed;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(&self, config: StoreConfig) -> Result<SqlStore> {
        let id = Uuid::new_v4();
        let alerts = Arc::new(Alerts::new(self.alerts.clone(), id));
        let shared = Arc::new(Shared {
            id,
            clock: self.clock.clone(),
            options: RwLock::new(RuntimeOptions::default()),
            blacklist: QueryBlacklist::new(self.clock.clone()),
            txn: Mutex::new(TransactionState::default()),
            telemetry: Telemetry::new(self.telemetry.clone()),
            alerts,
            topology: RwLock::new(Arc::new(Topology::default())),
        });
        let store = SqlStore {
            shared,
            factory: self.factory.clone(),
            aliases: self.aliases.clone(),
            delete_without_where: self.delete_without_where,
            connect_timeout: self.connect_timeout,
            applied: Mutex::new(None),
        };
        store.apply_config(config)?;
        Ok(store)
    }

    pub fn build_from(&self, source: &ConfigSource) -> Result<SqlStore> {
        self.build(source.load()?)
    }
}

pub struct SqlStore {
    shared: Arc<Shared>,
    factory: Arc<dyn ConnectionFactory>,
    aliases: HashMap<String, String>,
    delete_without_where: bool,
    connect_timeout: Option<Duration>,
    applied: Mutex<Option<StoreConfig>>,
}

impl fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topology = self.shared.topology();
        f.debug_struct("SqlStore")
            .field("id", &self.shared.id)
            .field("farms", &topology.farms.keys().collect::<Vec<_>>())
            .field("tables", &topology.tables.len())
            .finish()
    }
}

impl SqlStore {
    pub fn builder(factory: Arc<dyn ConnectionFactory>) -> StoreBuilder {
        StoreBuilder::new(factory)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn options(&self) -> RuntimeOptions {
        self.shared.options()
    }

    pub fn blacklist(&self) -> &QueryBlacklist {
        &self.shared.blacklist
    }

    pub fn farm(&self, name: &str) -> Option<Arc<Farm>> {
        self.shared.topology().farms.get(name).cloned()
    }

    pub fn farms(&self) -> Vec<Arc<Farm>> {
        self.shared.topology().farms.values().cloned().collect()
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.shared.topology().tables.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Applies `config` unless it is the one already in effect. Returns
    /// whether anything changed. A rejected config leaves the previous one
    /// active.
    pub fn apply_config(&self, config: StoreConfig) -> Result<bool> {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        if applied.as_ref() == Some(&config) {
            debug!(store = %self.shared.id, "config unchanged");
            return Ok(false);
        }
        config.validate()?;

        let previous = self.shared.topology();
        let topology = Topology::build(
            &config,
            &previous,
            |farm_config| {
                FarmSettings::from_config(
                    farm_config,
                    self.delete_without_where,
                    self.connect_timeout,
                )
            },
            |name, settings| {
                Arc::new(Farm::new(
                    name,
                    settings,
                    self.factory.clone(),
                    self.shared.clock.clone(),
                    self.shared.alerts.clone(),
                ))
            },
        )?;
        let kept = topology
            .farms
            .iter()
            .filter(|(name, farm)| {
                previous
                    .farms
                    .get(*name)
                    .map(|old| Arc::ptr_eq(old, *farm))
                    .unwrap_or(false)
            })
            .count();
        info!(
            store = %self.shared.id,
            farms = topology.farms.len(),
            kept,
            tables = topology.tables.len(),
            "applying config"
        );
        *self
            .shared
            .topology
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(topology);

        *self
            .shared
            .options
            .write()
            .unwrap_or_else(|e| e.into_inner()) = RuntimeOptions::from_config(&config.options);
        self.shared.telemetry.configure(config.statsd.as_ref());
        self.shared.alerts.configure(config.alerting.as_ref());
        *applied = Some(config);
        Ok(true)
    }

    /// Applies a pushed config document (TOML or JSON).
    pub fn receive_config(&self, data: &[u8]) -> Result<()> {
        let outcome = StoreConfig::from_document(data).and_then(|config| self.apply_config(config));
        match outcome {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(store = %self.shared.id, error = %err, "rejected pushed config");
                self.shared
                    .alerts
                    .send(&err, None, self.shared.alerts.source());
                Err(err)
            }
        }
    }

    pub fn receive_blacklist(&self, data: &[u8]) -> Result<()> {
        match BlacklistUpdate::from_json(data) {
            Ok(update) => {
                self.shared.blacklist.refresh(&update);
                Ok(())
            }
            Err(err) => {
                warn!(store = %self.shared.id, error = %err, "rejected pushed blacklist");
                self.shared
                    .alerts
                    .send(&err, None, self.shared.alerts.source());
                Err(err)
            }
        }
    }

    /// The config document currently in effect. Building a store from it
    /// reproduces the routing; connections and transactions never travel.
    pub fn export_config(&self) -> StoreConfig {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    /// Subscribes this store to the reload topics its config names. The hub
    /// only holds a weak reference.
    pub fn register_reload(self: &Arc<Self>, hub: &ReloadHub) -> usize {
        let Some(reload) = self.export_config().reload else {
            return 0;
        };
        let subscriber = self.shared.id.to_string();
        let mut registered = 0;
        if let Some(topic) = reload.config_node {
            let store = Arc::downgrade(self);
            hub.subscribe(&topic, &subscriber, move |data| match store.upgrade() {
                Some(store) => store.receive_config(data),
                None => Ok(()),
            });
            registered += 1;
        }
        if let Some(topic) = reload.blacklist_node {
            let store = Arc::downgrade(self);
            hub.subscribe(&topic, &subscriber, move |data| match store.upgrade() {
                Some(store) => store.receive_blacklist(data),
                None => Ok(()),
            });
            registered += 1;
        }
        registered
    }

    pub fn resolve_farm(&self, target: Target<'_>) -> Result<Arc<Farm>> {
        self.shared.topology().resolve(target, &self.aliases)
    }

    /// A cursor on the farm `target` routes to. Calls that give no table are
    /// remembered by call site so shared use of the default farm shows up in
    /// the logs.
    #[track_caller]
    pub fn get_cursor(&self, target: Target<'_>) -> Result<Cursor> {
        let caller = Location::caller();
        let farm = self.resolve_farm(target)?;
        farm.get_connection()?;
        {
            let mut state = farm.lock();
            if let Some(session) = state.session.as_mut() {
                if session.call_sites.len() > 1 {
                    info!(farm = %farm.name(), "get_cursor: {}", session.call_sites.join("|"));
                }
                session.call_sites.clear();
                session.tables.clear();
                if target.is_unspecified() {
                    session.call_sites.push(format!(
                        "{}|{}|{}",
                        caller.file(),
                        caller.line(),
                        caller.column()
                    ));
                }
            }
        }
        Ok(Cursor::new(farm, self.shared.clone()))
    }

    /// Routes `sql` by the first table it names and runs it. Writes are
    /// tracked for the next commit or rollback.
    pub fn execute(&self, sql: &str, args: Option<&[DataValue]>) -> Result<ExecuteResult> {
        let parsed = parse_statement(sql)?;
        let topology = self.shared.topology();
        let mut tables = vec![parsed.primary_table.clone()];
        tables.extend(
            parsed
                .tables
                .iter()
                .filter(|table| **table != parsed.primary_table && topology.contains_table(table))
                .cloned(),
        );
        if tables.len() > 1 && self.shared.options().logging {
            info!(
                "MULTIPLE_TABLES_WITH_SINGLE_CURSOR {} {}",
                sql.trim(),
                tables.join(",")
            );
        }

        let cursor = self.get_cursor(Target::Table(&tables[0]))?;
        let result = cursor.execute_from_store(sql, args)?;
        if !parsed.command.is_select() {
            let mut txn = self.shared.txn();
            txn.tables.extend(tables);
            txn.statements.insert(sql.trim().to_string());
        }
        Ok(result)
    }

    pub fn in_transaction(&self) -> bool {
        self.shared.txn().in_transaction
    }

    /// Whether writes are waiting for a commit or rollback.
    pub fn has_pending_writes(&self) -> bool {
        self.shared.txn().has_pending_writes()
    }

    pub fn begin(&self) -> Result<()> {
        let mut txn = self.shared.txn();
        if txn.in_transaction || txn.has_pending_writes() {
            let tables: Vec<&str> = txn.tables.iter().map(String::as_str).collect();
            return Err(SqlFarmError::TransactionInProgress(tables.join(",")));
        }
        *txn = TransactionState {
            in_transaction: true,
            ..TransactionState::default()
        };
        Ok(())
    }

    /// Commits every connection written to since the last commit or
    /// rollback. All are attempted; the first failure is returned.
    pub fn commit(&self) -> Result<TransactionReport> {
        self.finish(true)
    }

    pub fn rollback(&self) -> Result<TransactionReport> {
        self.finish(false)
    }

    fn finish(&self, commit: bool) -> Result<TransactionReport> {
        let finished = self.shared.txn().take();
        let report = finished.report();
        if finished.in_transaction && report.cross_farm {
            warn!(
                farms = %report.farms.join(","),
                "WRITE_TABLES_IN_DIFFERENT_FARM {}",
                report.tables.join(",")
            );
        }

        let mut first_error = None;
        for touched in &finished.farms {
            let outcome = if commit {
                touched.farm.commit_generation(touched.generation)
            } else {
                touched.farm.rollback_generation(touched.generation)
            };
            if let Err(err) = outcome {
                warn!(farm = %touched.farm.name(), error = %err, commit, "finishing transaction failed");
                first_error.get_or_insert(err);
            }
        }

        if finished.tables.len() > 1 && self.shared.options().logging {
            let statements: Vec<&str> = finished.statements.iter().map(String::as_str).collect();
            info!(
                "MULTIPLE_TABLES_IN_TRANSACTION {} {}",
                statements.join("\n"),
                report.tables.join(",")
            );
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Rolls back outside the begin/commit protocol. `force` rolls back every
    /// farm, not just the ones written to. Failures only drop connections.
    pub fn rollback_all(&self, force: bool) {
        let finished = self.shared.txn().take();
        if force {
            for farm in self.shared.topology().farms.values() {
                farm.force_rollback();
            }
        } else {
            for touched in &finished.farms {
                if let Err(err) = touched.farm.rollback_generation(touched.generation) {
                    debug!(farm = %touched.farm.name(), error = %err, "rollback failed");
                }
            }
        }
    }

    /// Gives every farm holding a stale snapshot a fresh one. Returns how
    /// many farms rolled back.
    pub fn refresh_all(&self) -> usize {
        self.shared
            .topology()
            .farms
            .values()
            .filter(|farm| farm.refresh_snapshot())
            .count()
    }

    pub fn close(&self) {
        for farm in self.shared.topology().farms.values() {
            farm.close();
        }
    }

    pub fn is_testing(&self) -> bool {
        self.shared
            .topology()
            .farms
            .values()
            .any(|farm| farm.is_test_target())
    }

    /// Runs `f` with a cursor. With `commit`, the cursor's connection is
    /// committed when `f` succeeds and rolled back when it fails, and the
    /// farm no longer counts as holding pending writes. Without `commit` the
    /// writes stay pending until [`SqlStore::commit`] or [`SqlStore::rollback`].
    #[track_caller]
    pub fn with_cursor<T>(
        &self,
        target: Target<'_>,
        commit: bool,
        f: impl FnOnce(&Cursor) -> Result<T>,
    ) -> Result<T> {
        let cursor = self.get_cursor(target)?;
        match f(&cursor) {
            Ok(value) => {
                if commit {
                    cursor.commit()?;
                    self.shared.txn().forget(cursor.farm());
                }
                Ok(value)
            }
            Err(err) => {
                if commit {
                    if let Err(rollback_err) = cursor.rollback() {
                        warn!(farm = %cursor.farm().name(), error = %rollback_err, "rollback after failure failed");
                    }
                    self.shared.txn().forget(cursor.farm());
                }
                Err(err)
            }
        }
    }

    pub fn start_log(&self) -> Result<()> {
        for farm in self.shared.topology().farms.values() {
            farm.start_log()?;
        }
        Ok(())
    }

    pub fn stop_log(&self) {
        for farm in self.shared.topology().farms.values() {
            farm.stop_log();
        }
    }

    pub fn get_log(&self, format: LogFormat) -> QueryLog {
        let logs: BTreeMap<String, _> = self
            .shared
            .topology()
            .farms
            .iter()
            .filter(|(_, farm)| farm.is_logging())
            .map(|(name, farm)| (name.clone(), farm.log_entries()))
            .collect();
        QueryLog::build(logs, format)
    }
}
