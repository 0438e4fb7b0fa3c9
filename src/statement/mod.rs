//! Statement records, the per-connection statement cache, and freeze/thaw.
//!
//! Every distinct SQL text prepared on a connection gets one
//! [`StatementRecord`] behind `Rc<RefCell<…>>`. The connection's cache maps
//! the original text to that record so repeated preparation of the same text
//! resolves to the same server-side prepared statement. While any owner is
//! alive the cache holds the record weakly; across a detach/attach cycle it
//! holds the frozen record strongly, and the first use after attach thaws it
//! back without re-preparing anything server-side.

mod rewrite;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::client::{check_result, unallocate_statement};
use crate::connection::{ConnInner, Connection};
use crate::error::{Error, GENERAL_SQLSTATE};
use crate::types::{Direction, Oid, ParamInfo, ParamSpec, oid};

use rewrite::rewrite_variables;

/// One declared-parameter slot: direction plus the declared or inferred
/// server type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParamDescriptor {
    pub(crate) direction: Direction,
    pub(crate) type_oid: Oid,
    pub(crate) precision: i32,
    pub(crate) scale: i32,
}

impl Default for ParamDescriptor {
    fn default() -> Self {
        ParamDescriptor {
            direction: Direction::In,
            type_oid: oid::UNTYPED,
            precision: 0,
            scale: 0,
        }
    }
}

/// The rewrite artifacts in portable form. List-shaped fields are flattened
/// to JSON arrays so the round trip is lossless for any SQL text.
#[derive(Debug, Clone)]
pub(crate) struct PortableForm {
    pub(crate) native_sql: String,
    /// JSON array of substitution-variable names, in placeholder order.
    pub(crate) sub_vars: String,
    /// JSON array of disambiguated column names; `None` until first execution.
    pub(crate) column_names: Option<String>,
}

/// A statement as parked in the detached-connection registry: everything the
/// record held except the connection reference, as plain `Send` data.
pub(crate) struct FrozenStatement {
    pub(crate) form: PortableForm,
    pub(crate) prepared_name: String,
    pub(crate) params: Vec<ParamDescriptor>,
    pub(crate) types_changed: bool,
}

/// Working form of the rewrite artifacts.
pub(crate) struct LiveForm {
    pub(crate) native_sql: String,
    pub(crate) sub_vars: Vec<String>,
    pub(crate) column_names: Option<Rc<Vec<String>>>,
}

enum StatementForm {
    Live(LiveForm),
    Frozen(PortableForm),
}

/// One cache slot: weak while owners keep the record alive, strong (and
/// frozen) between a detach and the first use after attach.
pub(crate) enum CacheSlot {
    Live(Weak<RefCell<StatementRecord>>),
    Frozen(Rc<RefCell<StatementRecord>>),
}

/// Shared statement state, one per distinct SQL text per connection.
///
/// Strong owners are [`Statement`] objects, open result sets, and resolved
/// [`StatementHandle`] links; the connection cannot detach while any of the
/// first two exist.
pub(crate) struct StatementRecord {
    /// Owning connection; `None` iff the record is frozen.
    pub(crate) conn: Option<Rc<RefCell<ConnInner>>>,
    pub(crate) orig_sql: String,
    /// Server-side prepared-statement name. Survives freezing: the server
    /// session keeps its prepared statements across a detach.
    pub(crate) prepared_name: String,
    pub(crate) params: Vec<ParamDescriptor>,
    /// The primary prepared name is executing in an open result set.
    pub(crate) busy: bool,
    /// A declared type changed since the last preparation; the next
    /// primary-name execution must re-prepare.
    pub(crate) types_changed: bool,
    form: StatementForm,
    /// Resolved handle cells, keyed by cell address. Freezing clears every
    /// cell so stale handles re-resolve through the cache.
    handles: HashMap<usize, Weak<RefCell<Option<HandleLink>>>>,
}

impl StatementRecord {
    pub(crate) fn live(&self) -> Result<&LiveForm, Error> {
        match &self.form {
            StatementForm::Live(live) => Ok(live),
            StatementForm::Frozen(_) => {
                Err(Error::Internal("statement record is frozen".into()))
            }
        }
    }

    pub(crate) fn native_sql(&self) -> &str {
        match &self.form {
            StatementForm::Live(live) => &live.native_sql,
            StatementForm::Frozen(portable) => &portable.native_sql,
        }
    }

    pub(crate) fn set_column_names(&mut self, names: Rc<Vec<String>>) {
        if let StatementForm::Live(live) = &mut self.form {
            live.column_names = Some(names);
        }
    }

    /// Strong references held through resolved handle cells.
    pub(crate) fn handle_ref_count(&self) -> usize {
        self.handles
            .values()
            .filter(|cell| cell.upgrade().is_some())
            .count()
    }

    fn register_handle(&mut self, key: usize, cell: &Rc<RefCell<Option<HandleLink>>>) {
        self.handles.insert(key, Rc::downgrade(cell));
    }

    fn unregister_handle(&mut self, key: usize) {
        self.handles.remove(&key);
    }

    /// Invalidate every resolved handle and flatten the rewrite artifacts to
    /// portable strings. The caller keeps a strong reference for the
    /// duration, so clearing handle cells cannot drop the record mid-borrow.
    pub(crate) fn freeze(&mut self) -> Result<(), Error> {
        for (_, cell) in self.handles.drain() {
            if let Some(cell) = cell.upgrade() {
                cell.borrow_mut().take();
            }
        }
        if let StatementForm::Live(live) = &self.form {
            let sub_vars = serde_json::to_string(&live.sub_vars).map_err(|err| {
                Error::Internal(format!("could not flatten substitution list: {err}"))
            })?;
            let column_names = match &live.column_names {
                Some(names) => Some(serde_json::to_string(names.as_ref()).map_err(|err| {
                    Error::Internal(format!("could not flatten column names: {err}"))
                })?),
                None => None,
            };
            self.form = StatementForm::Frozen(PortableForm {
                native_sql: live.native_sql.clone(),
                sub_vars,
                column_names,
            });
        }
        tracing::trace!(sql = %self.orig_sql, name = %self.prepared_name, "froze statement");
        self.conn = None;
        Ok(())
    }

    /// Parse the portable strings back and rebind the record to `conn`.
    pub(crate) fn thaw(&mut self, conn: Rc<RefCell<ConnInner>>) -> Result<(), Error> {
        let StatementForm::Frozen(portable) = &self.form else {
            return Err(Error::Internal("statement record is not frozen".into()));
        };
        let sub_vars: Vec<String> = serde_json::from_str(&portable.sub_vars).map_err(|err| {
            Error::Internal(format!("corrupt frozen substitution list: {err}"))
        })?;
        let column_names = match &portable.column_names {
            Some(json) => Some(Rc::new(serde_json::from_str::<Vec<String>>(json).map_err(
                |err| Error::Internal(format!("corrupt frozen column names: {err}")),
            )?)),
            None => None,
        };
        tracing::trace!(sql = %self.orig_sql, name = %self.prepared_name, "thawed statement");
        self.form = StatementForm::Live(LiveForm {
            native_sql: portable.native_sql.clone(),
            sub_vars,
            column_names,
        });
        self.conn = Some(conn);
        Ok(())
    }

    /// Extract the portable state of a frozen record for the registry.
    pub(crate) fn take_frozen(&mut self) -> Result<FrozenStatement, Error> {
        if self.conn.is_some() {
            return Err(Error::Internal("statement record is still live".into()));
        }
        let husk = StatementForm::Frozen(PortableForm {
            native_sql: String::new(),
            sub_vars: "[]".to_string(),
            column_names: None,
        });
        let StatementForm::Frozen(portable) = std::mem::replace(&mut self.form, husk) else {
            return Err(Error::Internal("statement record is not frozen".into()));
        };
        Ok(FrozenStatement {
            form: portable,
            prepared_name: std::mem::take(&mut self.prepared_name),
            params: std::mem::take(&mut self.params),
            types_changed: self.types_changed,
        })
    }

    /// Rebuild an in-cache frozen record from a registry entry. The first
    /// use after attach thaws it.
    pub(crate) fn from_frozen(orig_sql: String, frozen: FrozenStatement) -> StatementRecord {
        StatementRecord {
            conn: None,
            orig_sql,
            prepared_name: frozen.prepared_name,
            params: frozen.params,
            busy: false,
            types_changed: frozen.types_changed,
            form: StatementForm::Frozen(frozen.form),
            handles: HashMap::new(),
        }
    }
}

impl Drop for StatementRecord {
    fn drop(&mut self) {
        // Frozen records have no connection; their prepared statement stays
        // on the server session for whoever attaches next.
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Ok(mut inner) = conn.try_borrow_mut() {
            if let Some(client) = inner.client.as_deref_mut() {
                unallocate_statement(client, &self.prepared_name);
            }
            // Remove the cache entry unless it was already replaced by a
            // newer record for the same text.
            let stale = match inner.cache.get(&self.orig_sql) {
                Some(CacheSlot::Live(weak)) => weak.upgrade().is_none(),
                _ => false,
            };
            if stale {
                inner.cache.remove(&self.orig_sql);
            }
        }
    }
}

/// A memoized resolution from SQL text to a statement record. The
/// incarnation pins the client session the resolution was made against.
pub(crate) struct HandleLink {
    record: Rc<RefCell<StatementRecord>>,
    incarnation: u64,
}

/// A reusable, value-like key into a connection's statement cache.
///
/// A handle is SQL text plus a memoized resolution. Resolution is lazy:
/// [`StatementHandle::statement`] reuses the memoized record while it still
/// belongs to the connection's current client session and re-obtains it
/// through the cache otherwise. Detaching invalidates every memoized
/// resolution, so handles survive a detach/attach cycle and simply
/// re-resolve afterwards.
pub struct StatementHandle {
    sql: String,
    cell: Rc<RefCell<Option<HandleLink>>>,
}

impl StatementHandle {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        StatementHandle {
            sql: sql.into(),
            cell: Rc::new(RefCell::new(None)),
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether the handle currently memoizes a resolution.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.cell.borrow().is_some()
    }

    fn key(&self) -> usize {
        Rc::as_ptr(&self.cell) as usize
    }

    /// Resolve to a statement on `conn`, preparing it server-side on a cache
    /// miss and memoizing the resolution for next time.
    pub fn statement(&self, conn: &Connection) -> Result<Statement, Error> {
        let inner = conn.inner()?;
        let incarnation = inner.borrow().incarnation;
        if let Some(link) = self.cell.borrow().as_ref() {
            if link.incarnation == incarnation {
                return Ok(Statement {
                    record: Rc::clone(&link.record),
                });
            }
        }
        let record = obtain(inner, &self.sql)?;
        if let Some(stale) = self.cell.borrow_mut().take() {
            stale.record.borrow_mut().unregister_handle(self.key());
        }
        record.borrow_mut().register_handle(self.key(), &self.cell);
        *self.cell.borrow_mut() = Some(HandleLink {
            record: Rc::clone(&record),
            incarnation,
        });
        Ok(Statement { record })
    }
}

impl Clone for StatementHandle {
    /// The copy keeps the memoized resolution under its own registration.
    fn clone(&self) -> Self {
        let copy = StatementHandle {
            sql: self.sql.clone(),
            cell: Rc::new(RefCell::new(None)),
        };
        if let Some(link) = self.cell.borrow().as_ref() {
            link.record
                .borrow_mut()
                .register_handle(copy.key(), &copy.cell);
            *copy.cell.borrow_mut() = Some(HandleLink {
                record: Rc::clone(&link.record),
                incarnation: link.incarnation,
            });
        }
        copy
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        let key = self.key();
        let link = self.cell.borrow_mut().take();
        if let Some(link) = link {
            link.record.borrow_mut().unregister_handle(key);
        }
    }
}

impl std::fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementHandle")
            .field("sql", &self.sql)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A prepared statement bound to its connection.
///
/// Holding one keeps the underlying record and its server-side prepared
/// statement alive; the connection cannot detach until every statement and
/// result set created from it is dropped.
pub struct Statement {
    record: Rc<RefCell<StatementRecord>>,
}

impl Statement {
    /// Resolve `sql` through `conn`'s statement cache, preparing it
    /// server-side on a miss.
    pub fn new(conn: &Connection, sql: &str) -> Result<Statement, Error> {
        Ok(Statement {
            record: obtain(conn.inner()?, sql)?,
        })
    }

    /// The original SQL text this statement was created from.
    #[must_use]
    pub fn sql(&self) -> String {
        self.record.borrow().orig_sql.clone()
    }

    /// The rewritten text actually prepared on the server, with positional
    /// `$1`, `$2`, ... placeholders.
    #[must_use]
    pub fn native_sql(&self) -> String {
        self.record.borrow().native_sql().to_string()
    }

    /// Parameter descriptors keyed by name, in first-appearance order.
    /// A name used several times reports one entry.
    #[must_use]
    pub fn params(&self) -> IndexMap<String, ParamInfo> {
        let record = self.record.borrow();
        let mut out = IndexMap::new();
        let Ok(live) = record.live() else {
            return out;
        };
        let env = record.conn.as_ref().map(|conn| conn.borrow().env.clone());
        for (i, name) in live.sub_vars.iter().enumerate() {
            let desc = record.params.get(i).copied().unwrap_or_default();
            let type_name = env.as_ref().and_then(|e| e.type_name(desc.type_oid));
            out.insert(
                name.clone(),
                ParamInfo {
                    direction: desc.direction,
                    type_name,
                    precision: desc.precision,
                    scale: desc.scale,
                },
            );
        }
        out
    }

    /// Declare direction, type, precision, and scale for every occurrence of
    /// the named parameter. Changing the type marks the statement for
    /// re-preparation before its next primary-name execution.
    pub fn set_param_type(&self, name: &str, spec: ParamSpec) -> Result<(), Error> {
        let mut guard = self.record.borrow_mut();
        let record = &mut *guard;
        let StatementForm::Live(live) = &record.form else {
            return Err(Error::Internal("statement record is frozen".into()));
        };
        let type_oid = spec.sql_type.type_oid();
        let mut matched = 0usize;
        let mut changed = false;
        for (i, sub) in live.sub_vars.iter().enumerate() {
            if sub != name {
                continue;
            }
            if let Some(desc) = record.params.get_mut(i) {
                matched += 1;
                desc.direction = spec.direction;
                if desc.type_oid != type_oid {
                    changed = true;
                }
                desc.type_oid = type_oid;
                desc.precision = spec.precision;
                desc.scale = spec.scale;
            }
        }
        if changed {
            record.types_changed = true;
        }
        if matched == 0 {
            return Err(Error::usage(
                unknown_param_message(name, &live.sub_vars),
                GENERAL_SQLSTATE,
            ));
        }
        Ok(())
    }

    pub(crate) fn record(&self) -> &Rc<RefCell<StatementRecord>> {
        &self.record
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.borrow();
        f.debug_struct("Statement")
            .field("sql", &record.orig_sql)
            .field("prepared_name", &record.prepared_name)
            .finish()
    }
}

fn unknown_param_message(name: &str, names: &[String]) -> String {
    let mut message = format!("unknown parameter \"{name}\": must be ");
    for (i, sub) in names.iter().enumerate() {
        if i > 0 {
            message.push_str(if i + 1 == names.len() { " or " } else { ", " });
        }
        message.push_str(sub);
    }
    message
}

/// Resolve SQL text to its statement record on `conn`.
///
/// Live cache hits hand out another strong reference. Frozen hits thaw in
/// place, transferring the cache's strong reference to the caller and
/// leaving a weak slot behind. Misses rewrite, prepare, and describe the
/// text, then insert a weak slot for it.
pub(crate) fn obtain(
    conn: &Rc<RefCell<ConnInner>>,
    sql: &str,
) -> Result<Rc<RefCell<StatementRecord>>, Error> {
    enum Probe {
        Live(Rc<RefCell<StatementRecord>>),
        Frozen(Rc<RefCell<StatementRecord>>),
        Miss,
    }
    let probe = {
        let inner = conn.borrow();
        match inner.cache.get(sql) {
            Some(CacheSlot::Live(weak)) => match weak.upgrade() {
                Some(record) => Probe::Live(record),
                None => Probe::Miss,
            },
            Some(CacheSlot::Frozen(record)) => Probe::Frozen(Rc::clone(record)),
            None => Probe::Miss,
        }
    };
    match probe {
        Probe::Live(record) => {
            tracing::trace!(sql, "statement cache hit");
            Ok(record)
        }
        Probe::Frozen(record) => {
            record.borrow_mut().thaw(Rc::clone(conn))?;
            conn.borrow_mut()
                .cache
                .insert(sql.to_string(), CacheSlot::Live(Rc::downgrade(&record)));
            Ok(record)
        }
        Probe::Miss => prepare_new(conn, sql),
    }
}

fn prepare_new(
    conn: &Rc<RefCell<ConnInner>>,
    sql: &str,
) -> Result<Rc<RefCell<StatementRecord>>, Error> {
    let rewritten = rewrite_variables(sql)?;
    let prepared_name = conn.borrow_mut().next_statement_name();
    let params = vec![ParamDescriptor::default(); rewritten.param_names.len()];
    let record = Rc::new(RefCell::new(StatementRecord {
        conn: Some(Rc::clone(conn)),
        orig_sql: sql.to_string(),
        prepared_name,
        params,
        busy: false,
        types_changed: false,
        form: StatementForm::Live(LiveForm {
            native_sql: rewritten.native_sql,
            sub_vars: rewritten.param_names,
            column_names: None,
        }),
        handles: HashMap::new(),
    }));
    // A failure here drops the record, which deallocates the name
    // best-effort; the cache was never touched.
    prepare_record(&record, None)?;
    conn.borrow_mut()
        .cache
        .insert(sql.to_string(), CacheSlot::Live(Rc::downgrade(&record)));
    tracing::trace!(sql, name = %record.borrow().prepared_name, "statement prepared and cached");
    Ok(record)
}

/// Prepare the record's native text under its primary name, or under
/// `name_override` for result sets that need an alternate. Each preparation
/// asks the server to re-infer parameter types; the inferred ids overwrite
/// the descriptors and reset precision and scale.
pub(crate) fn prepare_record(
    record: &Rc<RefCell<StatementRecord>>,
    name_override: Option<&str>,
) -> Result<(), Error> {
    let (conn, name, native_sql) = {
        let rec = record.borrow();
        let conn = rec
            .conn
            .clone()
            .ok_or_else(|| Error::Internal("statement record is frozen".into()))?;
        let name = name_override.map_or_else(|| rec.prepared_name.clone(), str::to_string);
        (conn, name, rec.native_sql().to_string())
    };
    let inferred = {
        let mut inner = conn.borrow_mut();
        let client = inner.client_mut()?;
        tracing::trace!(name = %name, sql = %native_sql, "preparing statement");
        let result = client
            .prepare(&name, &native_sql)
            .ok_or_else(|| Error::Connection(client.error_message()))?;
        check_result(&*result)?;
        let described = client
            .describe_prepared(&name)
            .ok_or_else(|| Error::Connection(client.error_message()))?;
        (0..described.nparams())
            .map(|i| described.param_type(i))
            .collect::<Vec<Oid>>()
    };
    let mut rec = record.borrow_mut();
    for (i, type_oid) in inferred.into_iter().enumerate() {
        if let Some(desc) = rec.params.get_mut(i) {
            desc.type_oid = type_oid;
            desc.precision = 0;
            desc.scale = 0;
        }
    }
    Ok(())
}
