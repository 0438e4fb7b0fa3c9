//! Convenient imports for common functionality.
//!
//! Re-exports the types most embedders touch on every call, plus the client
//! traits needed to plug in a transport.

pub use crate::client::{BoundParam, ClientConn, ConnStatus, Driver, ExecStatus, QueryResult};
pub use crate::connection::Connection;
pub use crate::env::Environment;
pub use crate::error::{Error, ErrorCode};
pub use crate::result_set::ResultSet;
pub use crate::statement::{Statement, StatementHandle};
pub use crate::types::{
    ColumnInfo, Direction, IsolationLevel, Oid, ParamInfo, ParamSpec, SqlType, Value,
};
