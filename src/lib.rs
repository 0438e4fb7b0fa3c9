//! Synchronous PostgreSQL session layer.
//!
//! A [`Connection`] owns one client session and a cache of prepared
//! statements keyed by their original SQL text. [`Statement`]s rewrite
//! driver-portable `:name` markers into the positional placeholders the
//! server expects, [`ResultSet`]s execute them and walk their rows, and a
//! whole connection can be detached into a process-wide registry and
//! attached again later, from any thread, with its server-side prepared
//! statements intact.
//!
//! The layer talks to the client library only through the traits in
//! [`client`], so embedders bring their own transport and tests run against
//! the scripted doubles in `test_utils`.

pub mod client;
mod connection;
pub mod env;
pub mod error;
pub mod prelude;
mod registry;
mod result_set;
mod statement;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
mod token;
pub mod types;

pub use connection::Connection;
pub use env::Environment;
pub use error::{Error, ErrorCode};
pub use result_set::ResultSet;
pub use statement::{Statement, StatementHandle};
pub use types::{
    ColumnInfo, Direction, IsolationLevel, Oid, ParamInfo, ParamSpec, SqlType, Value,
};
