use clap::ValueEnum;
use serde::Serialize;

use crate::error::Error;

/// PostgreSQL type object id.
pub type Oid = u32;

/// Type object ids the session layer makes binding decisions on.
pub mod oid {
    use super::Oid;

    pub const UNTYPED: Oid = 0;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIME: Oid = 1083;
    pub const TIMESTAMP: Oid = 1114;
    pub const BIT: Oid = 1560;
    pub const NUMERIC: Oid = 1700;
}

/// SQL type names accepted by [`crate::Statement::set_param_type`].
///
/// Several names are synonyms for the same server type (`float` and
/// `double`, `numeric` and `decimal`); reverse lookups report the canonical
/// name, i.e. the first table entry with that id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    SmallInt,
    Integer,
    TinyInt,
    Float,
    Real,
    Double,
    Timestamp,
    BigInt,
    Date,
    Time,
    Bit,
    Numeric,
    Decimal,
    Text,
    VarBinary,
    VarChar,
    Char,
}

pub(crate) const TYPE_TABLE: &[(SqlType, &str, Oid)] = &[
    (SqlType::SmallInt, "smallint", oid::INT2),
    (SqlType::Integer, "integer", oid::INT4),
    (SqlType::TinyInt, "tinyint", oid::INT2),
    (SqlType::Float, "float", oid::FLOAT8),
    (SqlType::Real, "real", oid::FLOAT4),
    (SqlType::Double, "double", oid::FLOAT8),
    (SqlType::Timestamp, "timestamp", oid::TIMESTAMP),
    (SqlType::BigInt, "bigint", oid::INT8),
    (SqlType::Date, "date", oid::DATE),
    (SqlType::Time, "time", oid::TIME),
    (SqlType::Bit, "bit", oid::BIT),
    (SqlType::Numeric, "numeric", oid::NUMERIC),
    (SqlType::Decimal, "decimal", oid::NUMERIC),
    (SqlType::Text, "text", oid::TEXT),
    (SqlType::VarBinary, "varbinary", oid::BYTEA),
    (SqlType::VarChar, "varchar", oid::VARCHAR),
    (SqlType::Char, "char", oid::BPCHAR),
];

impl SqlType {
    #[must_use]
    pub fn name(self) -> &'static str {
        TYPE_TABLE
            .iter()
            .find(|(ty, _, _)| *ty == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("text")
    }

    #[must_use]
    pub fn type_oid(self) -> Oid {
        TYPE_TABLE
            .iter()
            .find(|(ty, _, _)| *ty == self)
            .map(|(_, _, id)| *id)
            .unwrap_or(oid::TEXT)
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        TYPE_TABLE
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(ty, _, _)| *ty)
    }
}

/// Canonical type name for a server type id, if the id is one this layer
/// knows. Synonym ids resolve to their first table entry (`700` → `real`,
/// `701` → `float`).
#[must_use]
pub fn type_name_for_oid(id: Oid) -> Option<&'static str> {
    TYPE_TABLE
        .iter()
        .find(|(_, _, table_id)| *table_id == id)
        .map(|(_, name, _)| *name)
}

/// Parameter direction. Output directions are carried through the metadata
/// but this dialect only ever binds inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::InOut => "inout",
        }
    }
}

/// Transaction isolation levels, in the server's escalating order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum IsolationLevel {
    #[value(name = "readuncommitted")]
    ReadUncommitted,
    #[value(name = "readcommitted")]
    ReadCommitted,
    #[value(name = "repeatableread")]
    RepeatableRead,
    #[value(name = "serializable")]
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "readuncommitted",
            IsolationLevel::ReadCommitted => "readcommitted",
            IsolationLevel::RepeatableRead => "repeatableread",
            IsolationLevel::Serializable => "serializable",
        }
    }

    /// The `SET TRANSACTION ISOLATION LEVEL` spelling.
    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "readuncommitted" => Some(IsolationLevel::ReadUncommitted),
            "readcommitted" => Some(IsolationLevel::ReadCommitted),
            "repeatableread" => Some(IsolationLevel::RepeatableRead),
            "serializable" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// Values crossing the session layer: query parameters in, row cells out.
///
/// The server talks text on this path, so retrieval only ever produces
/// `Text`, `Bytes` (binary columns), or `Null`; the numeric variants exist so
/// callers can bind without stringifying first.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// NULL value
    Null,
}

impl Value {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The value's text rendering, as it would be sent for a text-format
    /// parameter. `None` for NULL.
    #[must_use]
    pub fn render_text(&self) -> Option<String> {
        match self {
            Value::Int(value) => Some(value.to_string()),
            Value::Float(value) => Some(value.to_string()),
            Value::Text(value) => Some(value.clone()),
            Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Value::Null => None,
        }
    }

    /// The value's byte rendering, for binary-format parameters.
    #[must_use]
    pub fn render_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(bytes) => Some(bytes.clone()),
            other => other.render_text().map(String::into_bytes),
        }
    }

    /// Integer reading used by the fixed-width and big-integer bindings:
    /// native for `Int`, parsed from trimmed text for `Text`.
    #[must_use]
    pub fn coerce_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    /// Float reading used by the floating-point binding.
    #[must_use]
    pub fn coerce_float(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            Value::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

/// Declared-type specification for [`crate::Statement::set_param_type`].
///
/// ```rust
/// use pg_session::{ParamSpec, SqlType, Direction};
///
/// let spec = ParamSpec::new(SqlType::Numeric)
///     .with_direction(Direction::In)
///     .with_precision(12)
///     .with_scale(4);
/// # let _ = spec;
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub direction: Direction,
    pub sql_type: SqlType,
    pub precision: i32,
    pub scale: i32,
}

impl ParamSpec {
    /// Direction defaults to `in`, precision and scale to 0.
    #[must_use]
    pub fn new(sql_type: SqlType) -> Self {
        ParamSpec {
            direction: Direction::In,
            sql_type,
            precision: 0,
            scale: 0,
        }
    }

    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: i32) -> Self {
        self.precision = precision;
        self
    }

    #[must_use]
    pub fn with_scale(mut self, scale: i32) -> Self {
        self.scale = scale;
        self
    }
}

/// One entry of [`crate::Statement::params`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamInfo {
    pub direction: Direction,
    /// Canonical name for the declared/inferred type id; `None` when the id
    /// is not in the type table.
    pub type_name: Option<&'static str>,
    pub precision: i32,
    pub scale: i32,
}

/// One entry of [`crate::Connection::columns`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: Option<&'static str>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    pub nullable: bool,
}

/// Parse a text option as a boolean the way the host convention allows:
/// `0`/`1`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive).
pub(crate) fn parse_bool(option: &str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "expected boolean value for \"{option}\" but got \"{value}\""
        ))),
    }
}
