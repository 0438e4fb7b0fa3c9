//! Connection lifecycle: open, configure, transactions, catalog
//! introspection, and detach/attach.

mod config;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::client::{ClientConn, ConnStatus, Driver, ExecStatus, QueryResult, exec_simple_query};
use crate::env::Environment;
use crate::error::{Error, GENERAL_SQLSTATE, NESTED_TXN_SQLSTATE, NO_TXN_SQLSTATE};
use crate::registry::{self, DetachedConn};
use crate::statement::{CacheSlot, FrozenStatement, StatementRecord};
use crate::types::{ColumnInfo, IsolationLevel, parse_bool};

use config::{CONNINFO_SLOTS, OPTIONS, OptKind, OptionDef};

static INCARNATIONS: AtomicU64 = AtomicU64::new(0);

/// A process-unique id for one client session.
///
/// Statement handles memoize the incarnation their resolution was made
/// against; attach assigns a fresh one, so resolutions never leak across a
/// detach/attach cycle.
fn next_incarnation() -> u64 {
    INCARNATIONS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Mutable connection state, shared with every statement record prepared on
/// this connection.
pub(crate) struct ConnInner {
    pub(crate) env: Environment,
    /// `None` only mid-detach, after the client has been handed over.
    pub(crate) client: Option<Box<dyn ClientConn>>,
    pub(crate) incarnation: u64,
    /// Statement cache keyed by the original SQL text.
    pub(crate) cache: HashMap<String, CacheSlot>,
    statement_seq: u32,
    in_transaction: bool,
    isolation: Option<IsolationLevel>,
    readonly: bool,
    /// Connection-string option values, indexed per the option table.
    saved_options: Vec<Option<String>>,
}

impl ConnInner {
    pub(crate) fn client_mut(&mut self) -> Result<&mut dyn ClientConn, Error> {
        match self.client.as_deref_mut() {
            Some(client) => Ok(client),
            None => Err(Error::Connection("connection is closed".into())),
        }
    }

    /// Next server-side prepared-statement name: `statement1`, `statement2`,
    /// ... The counter survives a detach, so names stay unique per client
    /// session.
    pub(crate) fn next_statement_name(&mut self) -> String {
        self.statement_seq += 1;
        format!("statement{}", self.statement_seq)
    }
}

/// One session-layer connection.
///
/// A connection owns its client session, its statement cache, and a
/// single-level transaction flag. Statements, result sets, and statement
/// handles all point back into it through shared statement records;
/// [`Connection::detach`] converts the whole graph into plain owned data
/// that any thread can later adopt via the `attach` connect option.
pub struct Connection {
    /// `None` once the connection has been detached.
    inner: Option<Rc<RefCell<ConnInner>>>,
}

impl Connection {
    /// Open a connection from `(option, value)` pairs.
    ///
    /// The single pair `("attach", handle)` adopts a previously detached
    /// connection instead of opening a new one; it cannot be combined with
    /// any other option.
    pub fn connect(
        env: &Environment,
        driver: &dyn Driver,
        options: &[(&str, &str)],
    ) -> Result<Connection, Error> {
        let mut saved: Vec<Option<String>> = vec![None; CONNINFO_SLOTS];
        let mut encoding: Option<String> = None;
        let mut isolation: Option<IsolationLevel> = None;
        let mut readonly: Option<bool> = None;
        for (name, value) in options {
            let def = config::find_option(name)?;
            match def.kind {
                OptKind::Conninfo { slot, .. } => saved[slot] = Some((*value).to_string()),
                OptKind::Port { slot, .. } => saved[slot] = Some(config::validate_port(value)?),
                OptKind::Encoding => encoding = Some((*value).to_string()),
                OptKind::Isolation => isolation = Some(config::parse_isolation(value)?),
                OptKind::ReadOnly => readonly = Some(parse_bool(name, value)?),
                OptKind::Attach => {
                    if options.len() > 1 {
                        return Err(Error::Config("attach must be the only option".into()));
                    }
                    return Connection::attach(env, value);
                }
            }
        }

        let conninfo = config::conninfo(&saved);
        tracing::debug!(options = options.len(), "opening client connection");
        let Some(mut client) = driver.connect(&conninfo) else {
            return Err(Error::ConnectionFailed);
        };
        if client.status() != ConnStatus::Ok {
            return Err(Error::Connection(client.error_message()));
        }
        client.ignore_notices();

        if let Some(name) = &encoding {
            set_encoding(client.as_mut(), name)?;
        }
        if let Some(level) = isolation {
            apply_isolation(client.as_mut(), level)?;
        }
        if let Some(flag) = readonly {
            apply_readonly(client.as_mut(), flag)?;
        }

        let major = probe_server_version(client.as_mut())?;
        if major >= 9 {
            // Newer servers default to hex bytea output; force the escape
            // format the retrieval path decodes.
            exec_simple_query(client.as_mut(), "SET bytea_output = 'escape'")?;
        }
        let incarnation = next_incarnation();
        tracing::debug!(incarnation, server_major = major, "connection open");

        Ok(Connection {
            inner: Some(Rc::new(RefCell::new(ConnInner {
                env: env.clone(),
                client: Some(client),
                incarnation,
                cache: HashMap::new(),
                statement_seq: 0,
                in_transaction: false,
                isolation,
                readonly: readonly.unwrap_or(false),
                saved_options: saved,
            }))),
        })
    }

    /// Adopt a detached connection by its registry handle, consuming the
    /// registry entry.
    fn attach(env: &Environment, handle: &str) -> Result<Connection, Error> {
        let Some(detached) = registry::take(handle) else {
            return Err(Error::Config(format!(
                "\"{handle}\" is not a valid detached connection handle"
            )));
        };
        let DetachedConn {
            client,
            statements,
            statement_seq,
            in_transaction,
            isolation,
            readonly,
            saved_options,
        } = detached;
        let mut cache = HashMap::with_capacity(statements.len());
        for (sql, frozen) in statements {
            let record = StatementRecord::from_frozen(sql.clone(), frozen);
            cache.insert(sql, CacheSlot::Frozen(Rc::new(RefCell::new(record))));
        }
        let incarnation = next_incarnation();
        tracing::debug!(
            handle = %handle,
            incarnation,
            statements = cache.len(),
            "adopted detached connection"
        );
        Ok(Connection {
            inner: Some(Rc::new(RefCell::new(ConnInner {
                env: env.clone(),
                client: Some(client),
                incarnation,
                cache,
                statement_seq,
                in_transaction,
                isolation,
                readonly,
                saved_options,
            }))),
        })
    }

    pub(crate) fn inner(&self) -> Result<&Rc<RefCell<ConnInner>>, Error> {
        self.inner
            .as_ref()
            .ok_or_else(|| Error::Connection("connection is detached".into()))
    }

    /// Every reportable option and its current value, in option-table order.
    /// Alias rows and the `attach` pseudo-option are omitted; `password`
    /// always reports empty.
    pub fn configuration(&self) -> Result<IndexMap<&'static str, String>, Error> {
        let inner = self.inner()?;
        let mut out = IndexMap::new();
        for def in OPTIONS {
            if def.alias || matches!(def.kind, OptKind::Attach) {
                continue;
            }
            out.insert(def.name, query_option(inner, def)?);
        }
        Ok(out)
    }

    /// The current value of a single option.
    pub fn option_value(&self, name: &str) -> Result<String, Error> {
        let inner = self.inner()?;
        let def = config::find_option(name)?;
        query_option(inner, def)
    }

    /// Change modifiable options on the open connection. Options fixed at
    /// connect time are rejected by name; nothing is applied until every
    /// pair has been validated.
    pub fn configure(&self, options: &[(&str, &str)]) -> Result<(), Error> {
        let inner = self.inner()?;
        let mut encoding: Option<&str> = None;
        let mut isolation: Option<IsolationLevel> = None;
        let mut readonly: Option<bool> = None;
        for (name, value) in options {
            let def = config::find_option(name)?;
            if !def.modifiable {
                return Err(Error::Config(format!(
                    "\"{name}\" option cannot be changed dynamically"
                )));
            }
            match def.kind {
                OptKind::Encoding => encoding = Some(value),
                OptKind::Isolation => isolation = Some(config::parse_isolation(value)?),
                OptKind::ReadOnly => readonly = Some(parse_bool(name, value)?),
                // Every other kind is immutable and already rejected above.
                _ => {}
            }
        }
        let mut guard = inner.borrow_mut();
        if let Some(name) = encoding {
            set_encoding(guard.client_mut()?, name)?;
        }
        if let Some(level) = isolation {
            apply_isolation(guard.client_mut()?, level)?;
            guard.isolation = Some(level);
        }
        if let Some(flag) = readonly {
            apply_readonly(guard.client_mut()?, flag)?;
            guard.readonly = flag;
        }
        Ok(())
    }

    /// Open a transaction. The server rejects nesting, so beginning while
    /// one is already open fails without touching the server.
    pub fn begin_transaction(&self) -> Result<(), Error> {
        let inner = self.inner()?;
        let mut guard = inner.borrow_mut();
        if guard.in_transaction {
            return Err(Error::usage(
                "Postgres does not support nested transactions",
                NESTED_TXN_SQLSTATE,
            ));
        }
        guard.in_transaction = true;
        exec_simple_query(guard.client_mut()?, "BEGIN")?;
        Ok(())
    }

    /// Commit the open transaction.
    pub fn commit(&self) -> Result<(), Error> {
        self.end_transaction("COMMIT")
    }

    /// Roll back the open transaction.
    pub fn rollback(&self) -> Result<(), Error> {
        self.end_transaction("ROLLBACK")
    }

    fn end_transaction(&self, sql: &str) -> Result<(), Error> {
        let inner = self.inner()?;
        let mut guard = inner.borrow_mut();
        if !guard.in_transaction {
            return Err(Error::usage(
                "no transaction is in progress",
                NO_TXN_SQLSTATE,
            ));
        }
        guard.in_transaction = false;
        exec_simple_query(guard.client_mut()?, sql)?;
        Ok(())
    }

    /// List public tables, optionally filtered by a SQL `LIKE` pattern, in
    /// server order.
    pub fn tables(&self, pattern: Option<&str>) -> Result<Vec<String>, Error> {
        let inner = self.inner()?;
        let mut sql = String::from("SELECT tablename FROM pg_tables WHERE schemaname = 'public'");
        if let Some(pattern) = pattern {
            sql.push_str(" AND tablename LIKE '");
            sql.push_str(pattern);
            sql.push('\'');
        }
        let result = {
            let mut guard = inner.borrow_mut();
            exec_simple_query(guard.client_mut()?, &sql)?
        };
        let mut names = Vec::with_capacity(result.ntuples());
        for row in 0..result.ntuples() {
            if !result.is_null(row, 0) {
                names.push(String::from_utf8_lossy(result.value(row, 0)).into_owned());
            }
        }
        Ok(names)
    }

    /// Describe the columns of `table`, optionally filtered by a SQL `LIKE`
    /// pattern, in catalog order.
    pub fn columns(&self, table: &str, pattern: Option<&str>) -> Result<Vec<ColumnInfo>, Error> {
        let inner = self.inner()?;
        // One probe row settles the column type ids; information_schema has
        // everything else.
        let (probe, info) = {
            let mut guard = inner.borrow_mut();
            let client = guard.client_mut()?;
            let probe = exec_simple_query(client, &format!("SELECT * FROM {table}"))?;
            let mut sql = format!(
                "SELECT column_name, numeric_precision, character_maximum_length, \
                 numeric_scale, is_nullable FROM information_schema.columns \
                 WHERE table_name='{table}'"
            );
            if let Some(pattern) = pattern {
                sql.push_str(&format!(" AND column_name LIKE '{pattern}'"));
            }
            let info = exec_simple_query(client, &sql)?;
            (probe, info)
        };
        let env = inner.borrow().env.clone();
        let mut out = Vec::with_capacity(info.ntuples());
        for row in 0..info.ntuples() {
            let name = String::from_utf8_lossy(info.value(row, 0)).into_owned();
            let type_name = probe_field(&*probe, &name)
                .and_then(|col| env.type_name(probe.field_type(col)));
            let precision = if !info.is_null(row, 1) {
                cell_i32(&*info, row, 1)
            } else if !info.is_null(row, 2) {
                cell_i32(&*info, row, 2)
            } else {
                None
            };
            let scale = if info.is_null(row, 3) {
                None
            } else {
                cell_i32(&*info, row, 3)
            };
            let nullable = !info.is_null(row, 4) && info.value(row, 4) == b"YES";
            out.push(ColumnInfo {
                name,
                type_name,
                precision,
                scale,
                nullable,
            });
        }
        Ok(out)
    }

    /// Whether the server is still answering on this session: a trivial
    /// empty query must come back as the empty-query response.
    #[must_use]
    pub fn connected(&self) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        let mut guard = inner.borrow_mut();
        let Some(client) = guard.client.as_deref_mut() else {
            return false;
        };
        if client.status() != ConnStatus::Ok {
            return false;
        }
        match client.exec("") {
            Some(result) => result.status() == ExecStatus::EmptyQuery,
            None => false,
        }
    }

    /// Park this connection in the process-wide registry and hand back the
    /// claim handle.
    ///
    /// Every [`crate::Statement`] and [`crate::ResultSet`] created from this
    /// connection must be gone first; resolved [`crate::StatementHandle`]s
    /// are fine, they are invalidated in place. On success the connection
    /// object is hollow and every later call on it fails; on failure nothing
    /// has changed and the connection stays usable.
    pub fn detach(&mut self) -> Result<String, Error> {
        let inner = self
            .inner
            .as_ref()
            .ok_or_else(|| Error::Connection("connection is detached".into()))?;

        // Count the references a detach would orphan before touching
        // anything. Each live record owns one reference to the connection,
        // and each resolved handle cell owns one reference to its record;
        // anything beyond those and this connection object itself blocks
        // the detach.
        let mut live: Vec<(String, Rc<RefCell<StatementRecord>>)> = Vec::new();
        {
            let guard = inner.borrow();
            for (sql, slot) in &guard.cache {
                if let CacheSlot::Live(weak) = slot {
                    if let Some(record) = weak.upgrade() {
                        live.push((sql.clone(), record));
                    }
                }
            }
        }
        let mut remaining = Rc::strong_count(inner) - live.len();
        for (_, record) in &live {
            remaining += Rc::strong_count(record) - record.borrow().handle_ref_count() - 1;
        }
        if remaining != 1 {
            return Err(Error::usage(
                format!("Could not detach connection because references remain: {remaining}"),
                GENERAL_SQLSTATE,
            ));
        }

        // Freeze while still holding strong references, then drain the
        // cache into plain owned data.
        for (_, record) in &live {
            record.borrow_mut().freeze()?;
        }
        let detached = {
            let mut guard = inner.borrow_mut();
            let mut statements = HashMap::with_capacity(guard.cache.len());
            for (sql, record) in live {
                guard.cache.remove(&sql);
                let frozen = unwrap_record(record)?;
                statements.insert(sql, frozen);
            }
            let leftovers: Vec<(String, CacheSlot)> = guard.cache.drain().collect();
            for (sql, slot) in leftovers {
                // A never-thawed leftover from a previous attach travels
                // onward as-is; a dead live slot has nothing left to park.
                if let CacheSlot::Frozen(record) = slot {
                    statements.insert(sql, unwrap_record(record)?);
                }
            }
            let client = guard
                .client
                .take()
                .ok_or_else(|| Error::Connection("connection is closed".into()))?;
            DetachedConn {
                client,
                statements,
                statement_seq: guard.statement_seq,
                in_transaction: guard.in_transaction,
                isolation: guard.isolation,
                readonly: guard.readonly,
                saved_options: std::mem::take(&mut guard.saved_options),
            }
        };
        self.inner = None;
        registry::put(detached)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("attached", &self.inner.is_some())
            .finish()
    }
}

/// Take sole ownership of a frozen record and extract its portable state.
fn unwrap_record(record: Rc<RefCell<StatementRecord>>) -> Result<FrozenStatement, Error> {
    let cell = Rc::try_unwrap(record).map_err(|rc| {
        Error::usage(
            format!(
                "Could not detach connection because references remain: {}",
                Rc::strong_count(&rc)
            ),
            GENERAL_SQLSTATE,
        )
    })?;
    cell.into_inner().take_frozen()
}

fn set_encoding(client: &mut dyn ClientConn, name: &str) -> Result<(), Error> {
    if client.set_client_encoding(name) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "failed to set client encoding to \"{name}\""
        )))
    }
}

fn apply_isolation(client: &mut dyn ClientConn, level: IsolationLevel) -> Result<(), Error> {
    exec_simple_query(
        client,
        &format!("SET TRANSACTION ISOLATION LEVEL {}", level.sql()),
    )?;
    Ok(())
}

fn apply_readonly(client: &mut dyn ClientConn, readonly: bool) -> Result<(), Error> {
    let sql = if readonly {
        "SET TRANSACTION READ ONLY"
    } else {
        "SET TRANSACTION READ WRITE"
    };
    exec_simple_query(client, sql)?;
    Ok(())
}

/// Major server version from the `SELECT version()` banner.
fn probe_server_version(client: &mut dyn ClientConn) -> Result<i32, Error> {
    let result = exec_simple_query(client, "SELECT version()")?;
    let banner = first_cell(&*result);
    config::parse_major_version(&banner)
}

/// First cell of a result as text, empty when there is no such cell.
fn first_cell(result: &dyn QueryResult) -> String {
    if result.ntuples() > 0 && result.nfields() > 0 && !result.is_null(0, 0) {
        String::from_utf8_lossy(result.value(0, 0)).into_owned()
    } else {
        String::new()
    }
}

fn query_option(inner: &Rc<RefCell<ConnInner>>, def: &OptionDef) -> Result<String, Error> {
    match def.kind {
        OptKind::Conninfo { slot, .. } | OptKind::Port { slot, .. } => {
            // Never echo credentials back.
            if def.name == "password" {
                return Ok(String::new());
            }
            Ok(inner
                .borrow()
                .saved_options
                .get(slot)
                .and_then(Option::as_ref)
                .cloned()
                .unwrap_or_default())
        }
        OptKind::Encoding => {
            let mut guard = inner.borrow_mut();
            Ok(guard.client_mut()?.client_encoding())
        }
        OptKind::Isolation => Ok(isolation_value(inner)?.as_str().to_string()),
        OptKind::ReadOnly => Ok(if inner.borrow().readonly { "1" } else { "0" }.to_string()),
        OptKind::Attach => Ok(String::new()),
    }
}

/// The cached isolation level, reading and caching the server default the
/// first time it is asked for.
fn isolation_value(inner: &Rc<RefCell<ConnInner>>) -> Result<IsolationLevel, Error> {
    if let Some(level) = inner.borrow().isolation {
        return Ok(level);
    }
    let level = {
        let mut guard = inner.borrow_mut();
        let result = exec_simple_query(guard.client_mut()?, "SHOW default_transaction_isolation")?;
        let reported = first_cell(&*result);
        config::parse_isolation(&config::collapse_isolation_name(&reported))?
    };
    inner.borrow_mut().isolation = Some(level);
    Ok(level)
}

/// Column index of `name` in a probe result, matched exactly.
fn probe_field(result: &dyn QueryResult, name: &str) -> Option<usize> {
    (0..result.nfields()).find(|&col| result.field_name(col) == name)
}

fn cell_i32(result: &dyn QueryResult, row: usize, col: usize) -> Option<i32> {
    std::str::from_utf8(result.value(row, col))
        .ok()?
        .trim()
        .parse()
        .ok()
}
