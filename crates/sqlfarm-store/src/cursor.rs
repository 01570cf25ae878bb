//! Statement execution on one farm's connection.

use crate::context::{process, statement_source};
use crate::farm::{Farm, FarmState, Session};
use crate::querylog::QueryLogEntry;
use crate::store::Shared;
use crate::telemetry::statement_key;
use sqlfarm_core::driver::{COMMANDS_OUT_OF_SYNC, SERVER_GONE_ERROR};
use sqlfarm_core::types::format_args_list;
use sqlfarm_core::{
    DataValue, DriverError, DriverErrorKind, DriverWarning, ExecuteResult, Result, SqlFarmError,
};
use sqlfarm_sql::literal::has_placeholder;
use sqlfarm_sql::{command_of, find_tables, normalize, Command};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A driver failure sorted into the error taxonomy.
pub(crate) struct Classified {
    pub error: SqlFarmError,
    /// The connection can no longer be trusted.
    pub invalidate: bool,
    pub alert: bool,
}

pub(crate) fn classify(err: DriverError, recent: Vec<String>) -> Classified {
    match err.kind {
        DriverErrorKind::Operational => {
            let invalidate = err.is_connection_level();
            let error = if err.code == SERVER_GONE_ERROR {
                SqlFarmError::IgnorableServer(err)
            } else if invalidate {
                SqlFarmError::Connection(err)
            } else {
                SqlFarmError::Driver(err)
            };
            Classified {
                error,
                invalidate,
                alert: true,
            }
        }
        DriverErrorKind::Programming if err.code == COMMANDS_OUT_OF_SYNC => {
            for query in &recent {
                error!(query = %query, "COMMANDS_OUT_OF_SYNC");
            }
            Classified {
                error: SqlFarmError::ProtocolDesync { source: err, recent },
                invalidate: true,
                alert: true,
            }
        }
        DriverErrorKind::Programming => Classified {
            error: SqlFarmError::Driver(err),
            invalidate: false,
            alert: true,
        },
        DriverErrorKind::Other => Classified {
            error: SqlFarmError::Driver(err),
            invalidate: false,
            alert: false,
        },
    }
}

enum Failure {
    Driver(DriverError),
    Warning(DriverWarning),
}

#[derive(Debug, Clone, Copy)]
struct WarningPolicy {
    capture: bool,
    promote: bool,
}

/// Runs statements against one farm on behalf of a store.
pub struct Cursor {
    farm: Arc<Farm>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("farm", &self.farm.name())
            .field("host", &self.farm.host())
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(farm: Arc<Farm>, shared: Arc<Shared>) -> Self {
        Self { farm, shared }
    }

    pub fn farm(&self) -> &Arc<Farm> {
        &self.farm
    }

    /// Runs one statement. `%s` placeholders in `sql` are filled from `args`
    /// by the driver.
    pub fn execute(&self, sql: &str, args: Option<&[DataValue]>) -> Result<ExecuteResult> {
        self.run(sql, args, false)
    }

    pub(crate) fn execute_from_store(
        &self,
        sql: &str,
        args: Option<&[DataValue]>,
    ) -> Result<ExecuteResult> {
        self.run(sql, args, true)
    }

    pub fn commit(&self) -> Result<()> {
        self.farm.commit_open()
    }

    pub fn rollback(&self) -> Result<()> {
        self.farm.rollback_open()
    }

    fn run(&self, sql: &str, args: Option<&[DataValue]>, from_store: bool) -> Result<ExecuteResult> {
        let started = Instant::now();
        let sql = normalize(sql);
        let command = command_of(sql);
        let outcome = self.pipeline(sql, &command, args, from_store);
        let code = outcome.as_ref().err().map(SqlFarmError::driver_code);
        self.shared.telemetry.record(
            &statement_key(self.farm.host(), command.as_str(), code),
            started.elapsed(),
        );
        outcome
    }

    fn pipeline(
        &self,
        sql: &str,
        command: &Command,
        args: Option<&[DataValue]>,
        from_store: bool,
    ) -> Result<ExecuteResult> {
        let options = self.shared.options();
        let now = self.farm.now();
        let mut state = self.farm.lock();
        let session = self.farm.session(&mut state)?;

        session.remember(now, sql, args);
        if !command.is_select() {
            self.shared.touch(&self.farm, session.generation);
        }

        let digest = self
            .shared
            .blacklist
            .check(sql, args, |value| session.literal(value))?;

        if args.is_none() && has_placeholder(sql) {
            warn!(sql, "POSSIBLE_MISTAKENLY_ESCAPED_SQL");
        }

        let statement = format!(
            "{sql} -- SRC:{} MD5:{digest} USER:{} CLIENT:{}",
            statement_source(),
            process().user,
            session.client
        );

        if options.logging && !from_store {
            self.track_tables(session, sql, &statement);
        }

        if !self.farm.delete_without_where() {
            let lowered = sql.to_ascii_lowercase();
            match command {
                Command::Delete if !lowered.contains("where") => {
                    return Err(SqlFarmError::ForbiddenStatement(
                        "delete without where is forbidden".to_string(),
                    ));
                }
                Command::Update if !lowered.contains("where") => {
                    return Err(SqlFarmError::ForbiddenStatement(
                        "update without where is forbidden".to_string(),
                    ));
                }
                _ => {}
            }
        }

        let sampled = options.treat_warning_as_error_sampling_rate > 0.0
            && rand::random::<f64>() < options.treat_warning_as_error_sampling_rate;
        let policy = WarningPolicy {
            capture: options.show_warnings || options.treat_warning_as_error || sampled,
            promote: options.treat_warning_as_error || sampled,
        };

        let driver_started = Instant::now();
        let outcome = drive(session, &statement, args, command, policy);
        let elapsed = match outcome {
            Ok(_) => driver_started.elapsed(),
            Err(_) => Duration::ZERO,
        };
        if let Some(log) = state.log.as_mut() {
            log.push(QueryLogEntry {
                sql: statement.clone(),
                args: args.map(|values| format_args_list(Some(values))),
                elapsed_secs: elapsed.as_secs_f64(),
                backtrace: captured_backtrace(),
            });
        }

        match outcome {
            Ok(result) => Ok(result),
            Err(Failure::Driver(err)) => Err(self.fail(&mut state, err, &statement)),
            Err(Failure::Warning(first)) => {
                let error = SqlFarmError::InvalidData {
                    message: first.message,
                    sql: statement.clone(),
                    args: format_args_list(args),
                };
                let client = state.session.as_ref().map(|s| s.client.clone());
                self.farm.alerts().send(
                    &error,
                    Some(&statement),
                    self.farm.alert_source(client.as_deref()),
                );
                Err(error)
            }
        }
    }

    /// Accumulates the known tables this connection has touched since it was
    /// handed out.
    fn track_tables(&self, session: &mut Session, sql: &str, statement: &str) {
        let topology = self.shared.topology();
        let before = session.tables.len();
        session.tables.extend(
            find_tables(sql)
                .into_iter()
                .filter(|table| topology.contains_table(table)),
        );
        if session.tables.len() > 1 && session.tables.len() != before {
            let tables: Vec<&str> = session.tables.iter().map(String::as_str).collect();
            info!(
                farm = %self.farm.name(),
                "MULTIPLE_TABLES_WITH_SINGLE_CURSOR {} {}",
                statement,
                tables.join(",")
            );
        }
        if !session.call_sites.is_empty() {
            session.call_sites.push(statement.to_string());
        }
    }

    fn fail(&self, state: &mut FarmState, err: DriverError, statement: &str) -> SqlFarmError {
        let (client, recent) = match state.session.as_ref() {
            Some(session) => (Some(session.client.clone()), session.recent()),
            None => (None, Vec::new()),
        };
        let classified = classify(err, recent);
        if classified.invalidate {
            Farm::drop_session(state);
        }
        if classified.alert {
            self.farm.alerts().send(
                &classified.error,
                Some(statement),
                self.farm.alert_source(client.as_deref()),
            );
        }
        classified.error
    }
}

fn drive(
    session: &mut Session,
    statement: &str,
    args: Option<&[DataValue]>,
    command: &Command,
    policy: WarningPolicy,
) -> std::result::Result<ExecuteResult, Failure> {
    let affected = session
        .conn
        .execute(statement, args.unwrap_or(&[]))
        .map_err(Failure::Driver)?;

    if policy.capture {
        let warnings = session.conn.take_warnings();
        if let Some(first) = warnings.first() {
            if policy.promote {
                session.conn.rollback().map_err(Failure::Driver)?;
                return Err(Failure::Warning(first.clone()));
            }
            for warning in &warnings {
                warn!(
                    sql = statement,
                    args = %format_args_list(args),
                    "MySQL warning: {}",
                    warning
                );
            }
        }
    }

    match command {
        Command::Select => {
            let rows = session.conn.fetch_all().map_err(Failure::Driver)?;
            Ok(ExecuteResult::Rows(rows))
        }
        Command::Insert => match session.conn.last_insert_id() {
            Some(id) if id > 0 => Ok(ExecuteResult::InsertId(id)),
            _ => Ok(ExecuteResult::Affected(affected)),
        },
        _ => Ok(ExecuteResult::Affected(affected)),
    }
}

fn captured_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}
