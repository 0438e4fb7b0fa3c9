use thiserror::Error;

/// SQLSTATE used when a server never supplied one.
pub const GENERAL_SQLSTATE: &str = "HY000";
/// SQLSTATE for an allocation-style connect failure.
pub const ALLOC_SQLSTATE: &str = "HY001";
/// SQLSTATE for commit/rollback with no open transaction.
pub const NO_TXN_SQLSTATE: &str = "HY010";
/// SQLSTATE for an unsupported nested transaction.
pub const NESTED_TXN_SQLSTATE: &str = "HYC00";

/// Errors surfaced by the session layer.
///
/// Every variant lowers to a structured [`ErrorCode`] via [`Error::code`],
/// so embedders that speak the five-part code convention (domain, category,
/// SQLSTATE, source, native number) can recover it without string matching.
#[derive(Debug, Error)]
pub enum Error {
    /// The client library could not even allocate a connection object.
    #[error("connect failed, probably out of memory")]
    ConnectionFailed,

    #[error("Connection error: {0}")]
    Connection(String),

    /// A server-reported failure from preparing or executing a statement.
    #[error("{message}")]
    Server {
        message: String,
        /// Five-character SQLSTATE, when the server supplied one.
        sqlstate: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller misused the protocol (nested transaction, semicolons, ...).
    #[error("{message}")]
    Usage {
        message: String,
        sqlstate: &'static str,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn server(message: impl Into<String>, sqlstate: Option<String>) -> Self {
        Error::Server {
            message: message.into(),
            sqlstate,
        }
    }

    pub(crate) fn usage(message: impl Into<String>, sqlstate: &'static str) -> Self {
        Error::Usage {
            message: message.into(),
            sqlstate,
        }
    }

    /// The structured code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        let sqlstate = match self {
            Error::ConnectionFailed => ALLOC_SQLSTATE,
            Error::Server {
                sqlstate: Some(state),
                ..
            } => state.as_str(),
            Error::Usage { sqlstate, .. } => sqlstate,
            _ => GENERAL_SQLSTATE,
        };
        ErrorCode {
            domain: "TDBC",
            category: category_for_sqlstate(sqlstate),
            sqlstate: sqlstate.to_string(),
            source: "POSTGRES",
            number: -1,
        }
    }
}

/// The five-part structured error code: domain, mapped category, SQLSTATE,
/// source tag, and native error number (the client library exposes none, so
/// the number is always -1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub domain: &'static str,
    pub category: &'static str,
    pub sqlstate: String,
    pub source: &'static str,
    pub number: i32,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.domain, self.category, self.sqlstate, self.source, self.number
        )
    }
}

/// Map a SQLSTATE to its standard class category.
///
/// Unknown classes (including the CLI-defined `HY` class) report as
/// `GENERAL_ERROR`.
#[must_use]
pub fn category_for_sqlstate(sqlstate: &str) -> &'static str {
    if sqlstate.len() < 2 {
        return "GENERAL_ERROR";
    }
    match &sqlstate[..2] {
        "01" => "WARNING",
        "02" => "NO_DATA",
        "08" => "CONNECTION_EXCEPTION",
        "0A" => "FEATURE_NOT_SUPPORTED",
        "21" => "CARDINALITY_VIOLATION",
        "22" => "DATA_EXCEPTION",
        "23" => "INTEGRITY_CONSTRAINT_VIOLATION",
        "24" => "INVALID_CURSOR_STATE",
        "25" => "INVALID_TRANSACTION_STATE",
        "26" => "INVALID_SQL_STATEMENT_NAME",
        "28" => "INVALID_AUTHORIZATION_SPECIFICATION",
        "2D" => "INVALID_TRANSACTION_TERMINATION",
        "34" => "INVALID_CURSOR_NAME",
        "3D" => "INVALID_CATALOG_NAME",
        "3F" => "INVALID_SCHEMA_NAME",
        "40" => "TRANSACTION_ROLLBACK",
        "42" => "SYNTAX_OR_ACCESS_RULE_VIOLATION",
        "53" => "INSUFFICIENT_RESOURCES",
        "54" => "PROGRAM_LIMIT_EXCEEDED",
        "55" => "OBJECT_NOT_IN_PREREQUISITE_STATE",
        "57" => "OPERATOR_INTERVENTION",
        "58" => "SYSTEM_ERROR",
        "XX" => "INTERNAL_ERROR",
        _ => "GENERAL_ERROR",
    }
}
