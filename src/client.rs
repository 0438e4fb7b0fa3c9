//! Seam between the session layer and the PostgreSQL client library.
//!
//! The session never talks to a socket itself. Everything it needs from the
//! client library is expressed through three object-safe traits: [`Driver`]
//! opens connections, [`ClientConn`] is one open connection, and
//! [`QueryResult`] is one materialized server response. Production embedders
//! implement them over their client library of choice; the test suite runs
//! against the scripted mock in [`crate::test_utils`].

use crate::error::Error;
use crate::types::Oid;

/// Connection status as reported by the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
}

/// Execution status of one server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// A command that returns no rows completed.
    CommandOk,
    /// A query completed and rows (possibly zero) are available.
    TuplesOk,
    /// The statement text was empty.
    EmptyQuery,
    /// A notice-level problem; the operation itself proceeded.
    NonfatalError,
    /// The server rejected the operation.
    FatalError,
    /// The response could not be understood.
    BadResponse,
}

/// One parameter bound for prepared execution.
///
/// `Text` is sent in the text format, `Binary` in the binary format with its
/// length; `Null` sends SQL NULL regardless of the declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundParam {
    Null,
    Text(String),
    Binary(Vec<u8>),
}

/// Factory for client connections.
pub trait Driver {
    /// Open a connection described by a `key = 'value'` conninfo string.
    ///
    /// Returns `None` only when the client library could not allocate a
    /// connection object at all; a reachable-but-refused server still yields
    /// a connection whose [`ClientConn::status`] is [`ConnStatus::Bad`].
    fn connect(&self, conninfo: &str) -> Option<Box<dyn ClientConn>>;
}

/// One open connection inside the client library.
///
/// Dropping the box closes the connection. Implementations must be `Send`
/// so a detached connection can be adopted from another thread.
pub trait ClientConn: Send {
    fn status(&self) -> ConnStatus;

    /// The connection-level error message, empty if none.
    fn error_message(&self) -> String;

    /// Stop the client library from printing server notices on its own.
    fn ignore_notices(&mut self);

    /// Name of the current client encoding.
    fn client_encoding(&self) -> String;

    /// Change the client encoding; `false` leaves the failure reason in
    /// [`ClientConn::error_message`].
    fn set_client_encoding(&mut self, encoding: &str) -> bool;

    /// Run a bare SQL string. `None` models an out-of-memory or send
    /// failure inside the client library.
    fn exec(&mut self, sql: &str) -> Option<Box<dyn QueryResult>>;

    /// Prepare `sql` under `name` for later execution.
    fn prepare(&mut self, name: &str, sql: &str) -> Option<Box<dyn QueryResult>>;

    /// Describe a prepared statement; the result carries the server's
    /// inferred parameter types.
    fn describe_prepared(&mut self, name: &str) -> Option<Box<dyn QueryResult>>;

    /// Execute a prepared statement. Results come back in the text format.
    fn exec_prepared(&mut self, name: &str, params: &[BoundParam])
    -> Option<Box<dyn QueryResult>>;
}

/// One materialized server response.
pub trait QueryResult {
    fn status(&self) -> ExecStatus;

    /// Primary error message for a failed result, empty if none.
    fn error_message(&self) -> String;

    /// Five-character SQLSTATE for a failed result, when the server sent one.
    fn sqlstate(&self) -> Option<String>;

    fn ntuples(&self) -> usize;

    fn nfields(&self) -> usize;

    fn field_name(&self, col: usize) -> String;

    /// Server type id of a result column.
    fn field_type(&self, col: usize) -> Oid;

    fn is_null(&self, row: usize, col: usize) -> bool;

    /// Raw cell bytes; text format unless the column is binary.
    fn value(&self, row: usize, col: usize) -> &[u8];

    /// Affected-row count as reported by the server, empty when the command
    /// has no such count.
    fn cmd_tuples(&self) -> String;

    /// Number of parameters, for describe results.
    fn nparams(&self) -> usize;

    /// Inferred type id of one parameter, for describe results.
    fn param_type(&self, idx: usize) -> Oid;
}

/// Run a bare query and fail unless the server reports success.
///
/// This is the path used for transaction control, session settings, and
/// catalog probes.
pub(crate) fn exec_simple_query(
    client: &mut dyn ClientConn,
    sql: &str,
) -> Result<Box<dyn QueryResult>, Error> {
    tracing::trace!(sql, "simple query");
    let Some(result) = client.exec(sql) else {
        return Err(Error::Connection(client.error_message()));
    };
    check_result(&*result)?;
    Ok(result)
}

/// Lower a failed result into an error. Nonfatal notices are logged and
/// swallowed; an empty query is reported as an error because nothing on the
/// statement path ever sends one on purpose.
pub(crate) fn check_result(result: &dyn QueryResult) -> Result<(), Error> {
    match result.status() {
        ExecStatus::CommandOk | ExecStatus::TuplesOk => Ok(()),
        ExecStatus::NonfatalError => {
            tracing::debug!(message = %result.error_message(), "nonfatal server notice");
            Ok(())
        }
        ExecStatus::EmptyQuery => Err(Error::server("empty query", result.sqlstate())),
        ExecStatus::FatalError | ExecStatus::BadResponse => {
            Err(Error::server(result.error_message(), result.sqlstate()))
        }
    }
}

/// Best-effort `DEALLOCATE`. Failures are ignored; the statement is going
/// away on this session either way.
pub(crate) fn unallocate_statement(client: &mut dyn ClientConn, name: &str) {
    tracing::trace!(name, "deallocating prepared statement");
    let _ = client.exec(&format!("DEALLOCATE {name}"));
}
