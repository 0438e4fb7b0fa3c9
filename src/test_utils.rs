//! Scripted client doubles for exercising the session layer offline.
//!
//! [`MockDriver`] hands out pre-built [`MockConn`]s and keeps a shared
//! [`Calls`] log of everything they do, so tests can assert on the exact
//! client-library traffic: which SQL ran, what got prepared under which
//! name, and the wire format of every bound parameter. Unscripted calls get
//! serviceable defaults, so most tests only script the responses they
//! actually care about.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;

use crate::client::{BoundParam, ClientConn, ConnStatus, Driver, ExecStatus, QueryResult};
use crate::types::{Oid, oid};

/// Shared, thread-safe log of client-library calls.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    fn push(&self, entry: String) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Every call recorded so far, in order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded calls that start with `prefix`, in order.
    #[must_use]
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|entry| entry.starts_with(prefix))
            .collect()
    }

    /// Whether some recorded call equals `entry` exactly.
    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.snapshot().iter().any(|recorded| recorded == entry)
    }
}

/// One pre-scripted server response.
#[derive(Clone)]
pub struct ScriptedResult {
    status: ExecStatus,
    error_message: String,
    sqlstate: Option<String>,
    columns: Vec<(String, Oid)>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
    cmd_tuples: String,
    param_types: Vec<Oid>,
}

impl ScriptedResult {
    fn base(status: ExecStatus) -> ScriptedResult {
        ScriptedResult {
            status,
            error_message: String::new(),
            sqlstate: None,
            columns: Vec::new(),
            rows: Vec::new(),
            cmd_tuples: String::new(),
            param_types: Vec::new(),
        }
    }

    /// A rowless successful command.
    #[must_use]
    pub fn command_ok() -> ScriptedResult {
        ScriptedResult::base(ExecStatus::CommandOk)
    }

    /// The response to an empty statement text.
    #[must_use]
    pub fn empty_query() -> ScriptedResult {
        ScriptedResult::base(ExecStatus::EmptyQuery)
    }

    /// A fatal server error with a message and SQLSTATE.
    #[must_use]
    pub fn server_error(message: &str, sqlstate: &str) -> ScriptedResult {
        let mut result = ScriptedResult::base(ExecStatus::FatalError);
        result.error_message = message.to_string();
        result.sqlstate = Some(sqlstate.to_string());
        result
    }

    /// A successful query result. `None` cells are SQL NULL.
    #[must_use]
    pub fn rows(columns: &[(&str, Oid)], rows: &[&[Option<&str>]]) -> ScriptedResult {
        let mut result = ScriptedResult::base(ExecStatus::TuplesOk);
        result.columns = columns
            .iter()
            .map(|(name, type_oid)| ((*name).to_string(), *type_oid))
            .collect();
        result.rows = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.map(|text| text.as_bytes().to_vec()))
                    .collect()
            })
            .collect();
        result
    }

    /// Attach an affected-row count, as the server reports it.
    #[must_use]
    pub fn with_cmd_tuples(mut self, tuples: &str) -> ScriptedResult {
        self.cmd_tuples = tuples.to_string();
        self
    }
}

impl QueryResult for ScriptedResult {
    fn status(&self) -> ExecStatus {
        self.status
    }
    fn error_message(&self) -> String {
        self.error_message.clone()
    }
    fn sqlstate(&self) -> Option<String> {
        self.sqlstate.clone()
    }
    fn ntuples(&self) -> usize {
        self.rows.len()
    }
    fn nfields(&self) -> usize {
        self.columns.len()
    }
    fn field_name(&self, col: usize) -> String {
        self.columns[col].0.clone()
    }
    fn field_type(&self, col: usize) -> Oid {
        self.columns[col].1
    }
    fn is_null(&self, row: usize, col: usize) -> bool {
        self.rows[row][col].is_none()
    }
    fn value(&self, row: usize, col: usize) -> &[u8] {
        self.rows[row][col].as_deref().unwrap_or(&[])
    }
    fn cmd_tuples(&self) -> String {
        self.cmd_tuples.clone()
    }
    fn nparams(&self) -> usize {
        self.param_types.len()
    }
    fn param_type(&self, idx: usize) -> Oid {
        self.param_types[idx]
    }
}

/// A scripted client connection.
///
/// Defaults when nothing is scripted: an empty statement answers with the
/// empty-query status, `SELECT version()` with the configured banner,
/// `SHOW default_transaction_isolation` with the configured level, and
/// everything else with a bare command-ok. Prepared statements remember
/// their SQL, so describes and executions are scripted per statement text
/// rather than per generated name, and an unscripted describe reports one
/// text parameter per `$n` placeholder.
pub struct MockConn {
    status: ConnStatus,
    error_message: String,
    version_banner: String,
    default_isolation: String,
    encoding: String,
    reject_encoding: bool,
    prepared: HashMap<String, String>,
    exec_overrides: HashMap<String, VecDeque<ScriptedResult>>,
    prepare_overrides: HashMap<String, VecDeque<ScriptedResult>>,
    describe_overrides: HashMap<String, Vec<Oid>>,
    exec_prepared_overrides: HashMap<String, VecDeque<ScriptedResult>>,
    calls: Calls,
}

impl MockConn {
    #[must_use]
    pub fn new() -> MockConn {
        MockConn {
            status: ConnStatus::Ok,
            error_message: String::new(),
            version_banner: "PostgreSQL 14.5 on x86_64-pc-linux-gnu".to_string(),
            default_isolation: "read committed".to_string(),
            encoding: "UTF8".to_string(),
            reject_encoding: false,
            prepared: HashMap::new(),
            exec_overrides: HashMap::new(),
            prepare_overrides: HashMap::new(),
            describe_overrides: HashMap::new(),
            exec_prepared_overrides: HashMap::new(),
            calls: Calls::default(),
        }
    }

    /// A connection the server refused: bad status plus its error message.
    #[must_use]
    pub fn refused(message: &str) -> MockConn {
        let mut conn = MockConn::new();
        conn.status = ConnStatus::Bad;
        conn.error_message = message.to_string();
        conn
    }

    /// Replace the `SELECT version()` banner.
    #[must_use]
    pub fn with_version(mut self, banner: &str) -> MockConn {
        self.version_banner = banner.to_string();
        self
    }

    /// Replace the server default isolation spelling, e.g. `serializable`.
    #[must_use]
    pub fn with_default_isolation(mut self, level: &str) -> MockConn {
        self.default_isolation = level.to_string();
        self
    }

    /// Make every encoding change fail.
    #[must_use]
    pub fn with_rejected_encoding(mut self) -> MockConn {
        self.reject_encoding = true;
        self
    }

    /// Script the next response to `exec` of exactly `sql`. Responses for
    /// the same text queue up and are consumed in order.
    #[must_use]
    pub fn on_exec(mut self, sql: &str, result: ScriptedResult) -> MockConn {
        self.exec_overrides
            .entry(sql.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Script the next response to preparing exactly `sql`.
    #[must_use]
    pub fn on_prepare(mut self, sql: &str, result: ScriptedResult) -> MockConn {
        self.prepare_overrides
            .entry(sql.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Script the parameter types a describe of `sql` reports.
    #[must_use]
    pub fn on_describe(mut self, sql: &str, types: &[Oid]) -> MockConn {
        self.describe_overrides.insert(sql.to_string(), types.to_vec());
        self
    }

    /// Script the next response to executing the statement prepared from
    /// exactly `sql`, whatever name it was prepared under.
    #[must_use]
    pub fn on_exec_prepared(mut self, sql: &str, result: ScriptedResult) -> MockConn {
        self.exec_prepared_overrides
            .entry(sql.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Handle to the call log this connection writes to. Connections handed
    /// out by a [`MockDriver`] share the driver's log instead.
    #[must_use]
    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

impl Default for MockConn {
    fn default() -> Self {
        MockConn::new()
    }
}

impl ClientConn for MockConn {
    fn status(&self) -> ConnStatus {
        self.status
    }

    fn error_message(&self) -> String {
        self.error_message.clone()
    }

    fn ignore_notices(&mut self) {
        self.calls.push("ignore_notices".to_string());
    }

    fn client_encoding(&self) -> String {
        self.encoding.clone()
    }

    fn set_client_encoding(&mut self, encoding: &str) -> bool {
        self.calls.push(format!("set_encoding:{encoding}"));
        if self.reject_encoding {
            self.error_message = format!("invalid client encoding \"{encoding}\"");
            false
        } else {
            self.encoding = encoding.to_string();
            true
        }
    }

    fn exec(&mut self, sql: &str) -> Option<Box<dyn QueryResult>> {
        self.calls.push(format!("exec:{sql}"));
        if let Some(result) = take_scripted(&mut self.exec_overrides, sql) {
            return Some(Box::new(result));
        }
        let result = if sql.is_empty() {
            ScriptedResult::empty_query()
        } else if sql == "SELECT version()" {
            ScriptedResult::rows(
                &[("version", oid::TEXT)],
                &[&[Some(self.version_banner.as_str())]],
            )
        } else if sql == "SHOW default_transaction_isolation" {
            ScriptedResult::rows(
                &[("default_transaction_isolation", oid::TEXT)],
                &[&[Some(self.default_isolation.as_str())]],
            )
        } else {
            ScriptedResult::command_ok()
        };
        Some(Box::new(result))
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Option<Box<dyn QueryResult>> {
        self.calls.push(format!("prepare:{name}:{sql}"));
        let result =
            take_scripted(&mut self.prepare_overrides, sql).unwrap_or_else(ScriptedResult::command_ok);
        if !matches!(result.status, ExecStatus::FatalError | ExecStatus::BadResponse) {
            self.prepared.insert(name.to_string(), sql.to_string());
        }
        Some(Box::new(result))
    }

    fn describe_prepared(&mut self, name: &str) -> Option<Box<dyn QueryResult>> {
        self.calls.push(format!("describe:{name}"));
        let sql = self.prepared.get(name).cloned().unwrap_or_default();
        let types = self
            .describe_overrides
            .get(&sql)
            .cloned()
            .unwrap_or_else(|| vec![oid::TEXT; count_placeholders(&sql)]);
        let mut result = ScriptedResult::command_ok();
        result.param_types = types;
        Some(Box::new(result))
    }

    fn exec_prepared(
        &mut self,
        name: &str,
        params: &[BoundParam],
    ) -> Option<Box<dyn QueryResult>> {
        self.calls
            .push(format!("exec_prepared:{name}:{}", render_params(params)));
        let sql = self.prepared.get(name).cloned().unwrap_or_default();
        if let Some(result) = take_scripted(&mut self.exec_prepared_overrides, &sql) {
            return Some(Box::new(result));
        }
        Some(Box::new(ScriptedResult::command_ok()))
    }
}

impl Drop for MockConn {
    fn drop(&mut self) {
        self.calls.push("close".to_string());
    }
}

/// Hands out queued connections in order and records their traffic.
///
/// An empty queue answers every connect with a fresh default connection, so
/// tests that only exercise the happy path need no setup at all.
pub struct MockDriver {
    queue: RefCell<VecDeque<Option<MockConn>>>,
    calls: Calls,
}

impl MockDriver {
    #[must_use]
    pub fn new() -> MockDriver {
        MockDriver {
            queue: RefCell::new(VecDeque::new()),
            calls: Calls::default(),
        }
    }

    /// Queue a connection for the next connect call. Its traffic flows into
    /// this driver's log.
    #[must_use]
    pub fn with_conn(self, mut conn: MockConn) -> MockDriver {
        conn.calls = self.calls.clone();
        self.queue.borrow_mut().push_back(Some(conn));
        self
    }

    /// Make the next connect call fail outright, as if the client library
    /// could not allocate a connection.
    #[must_use]
    pub fn with_alloc_failure(self) -> MockDriver {
        self.queue.borrow_mut().push_back(None);
        self
    }

    /// Handle to the shared call log.
    #[must_use]
    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        MockDriver::new()
    }
}

impl Driver for MockDriver {
    fn connect(&self, conninfo: &str) -> Option<Box<dyn ClientConn>> {
        self.calls.push(format!("connect:{conninfo}"));
        match self.queue.borrow_mut().pop_front() {
            Some(Some(conn)) => Some(Box::new(conn)),
            Some(None) => None,
            None => {
                let mut conn = MockConn::new();
                conn.calls = self.calls.clone();
                Some(Box::new(conn))
            }
        }
    }
}

fn take_scripted(
    overrides: &mut HashMap<String, VecDeque<ScriptedResult>>,
    sql: &str,
) -> Option<ScriptedResult> {
    overrides.get_mut(sql)?.pop_front()
}

/// Parameters as logged: NULL marker, text verbatim, binary as hex.
fn render_params(params: &[BoundParam]) -> String {
    let rendered: Vec<String> = params
        .iter()
        .map(|param| match param {
            BoundParam::Null => "NULL".to_string(),
            BoundParam::Text(text) => text.clone(),
            BoundParam::Binary(bytes) => {
                let mut hex = String::with_capacity(2 + bytes.len() * 2);
                hex.push_str("0x");
                for byte in bytes {
                    hex.push_str(&format!("{byte:02x}"));
                }
                hex
            }
        })
        .collect();
    format!("[{}]", rendered.join(", "))
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("placeholder pattern"));

/// Highest `$n` placeholder number in a statement text.
fn count_placeholders(sql: &str) -> usize {
    PLACEHOLDER
        .captures_iter(sql)
        .filter_map(|caps| caps[1].parse().ok())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_exec_answers_the_session_probes() {
        let mut conn = MockConn::new().with_version("PostgreSQL 8.4.22");
        let empty = conn.exec("").unwrap();
        assert_eq!(empty.status(), ExecStatus::EmptyQuery);
        let version = conn.exec("SELECT version()").unwrap();
        assert_eq!(version.value(0, 0), b"PostgreSQL 8.4.22");
        let isolation = conn.exec("SHOW default_transaction_isolation").unwrap();
        assert_eq!(isolation.value(0, 0), b"read committed");
        let other = conn.exec("SET x = 'y'").unwrap();
        assert_eq!(other.status(), ExecStatus::CommandOk);
    }

    #[test]
    fn scripted_exec_responses_are_consumed_in_order() {
        let mut conn = MockConn::new()
            .on_exec("BEGIN", ScriptedResult::server_error("boom", "57014"))
            .on_exec("BEGIN", ScriptedResult::command_ok());
        assert_eq!(conn.exec("BEGIN").unwrap().status(), ExecStatus::FatalError);
        assert_eq!(conn.exec("BEGIN").unwrap().status(), ExecStatus::CommandOk);
        // queue exhausted, back to the default
        assert_eq!(conn.exec("BEGIN").unwrap().status(), ExecStatus::CommandOk);
    }

    #[test]
    fn describe_counts_placeholders_by_default() {
        let mut conn = MockConn::new();
        conn.prepare("statement1", "SELECT $1, $2 WHERE a = $2").unwrap();
        let described = conn.describe_prepared("statement1").unwrap();
        assert_eq!(described.nparams(), 2);
        assert_eq!(described.param_type(0), oid::TEXT);
    }

    #[test]
    fn bound_parameters_are_logged_in_wire_form() {
        let mut conn = MockConn::new();
        let calls = conn.calls();
        conn.prepare("statement1", "SELECT $1, $2, $3").unwrap();
        conn.exec_prepared(
            "statement1",
            &[
                BoundParam::Binary(vec![0, 7]),
                BoundParam::Text("x".to_string()),
                BoundParam::Null,
            ],
        )
        .unwrap();
        assert!(calls.contains("exec_prepared:statement1:[0x0007, x, NULL]"));
    }
}
