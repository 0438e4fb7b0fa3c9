//! Execution of prepared statements and retrieval of their rows.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::client::{BoundParam, QueryResult, check_result, unallocate_statement};
use crate::connection::ConnInner;
use crate::error::{Error, GENERAL_SQLSTATE};
use crate::statement::{Statement, StatementRecord, prepare_record};
use crate::types::{Oid, Value, oid};

/// One execution of a prepared statement and its materialized rows.
///
/// The row cursor only moves forward. While a result set runs under the
/// statement's primary prepared name that name is marked busy, so another
/// execution of the same statement prepares and runs under an alternate
/// name; dropping the result set releases whichever name it used.
pub struct ResultSet {
    record: Rc<RefCell<StatementRecord>>,
    result: Box<dyn QueryResult>,
    /// Prepared name this execution ran under. Differs from the record's
    /// primary name when the primary was busy at construction.
    exec_name: String,
    columns: Rc<Vec<String>>,
    cursor: usize,
}

impl ResultSet {
    /// Execute `statement`, binding parameters by substitution-variable
    /// name. A name missing from the map (or a `None` map) binds SQL NULL.
    pub fn new(
        statement: &Statement,
        params: Option<&HashMap<String, Value>>,
    ) -> Result<ResultSet, Error> {
        let record = Rc::clone(statement.record());
        let conn = record
            .borrow()
            .conn
            .clone()
            .ok_or_else(|| Error::Internal("statement record is frozen".into()))?;

        // Settle which prepared name this execution runs under. A busy
        // primary forces a freshly prepared alternate; an idle primary is
        // claimed, re-preparing it first if declared types changed since.
        let busy = record.borrow().busy;
        let (exec_name, claimed) = if busy {
            let name = conn.borrow_mut().next_statement_name();
            prepare_record(&record, Some(&name))?;
            (name, false)
        } else {
            record.borrow_mut().busy = true;
            if record.borrow().types_changed {
                if let Err(err) = resettle_primary(&record, &conn) {
                    record.borrow_mut().busy = false;
                    return Err(err);
                }
            }
            (record.borrow().prepared_name.clone(), true)
        };

        match execute(&record, &conn, &exec_name, params) {
            Ok((result, columns)) => Ok(ResultSet {
                record,
                result,
                exec_name,
                columns,
                cursor: 0,
            }),
            Err(err) => {
                if claimed {
                    record.borrow_mut().busy = false;
                } else if let Ok(client) = conn.borrow_mut().client_mut() {
                    // the alternate was prepared just for this execution
                    unallocate_statement(client, &exec_name);
                }
                Err(err)
            }
        }
    }

    /// Disambiguated column names of this execution.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The next row as positional values, NULL cells included as
    /// [`Value::Null`]. `None` once the rows are exhausted; a zero-column
    /// result never yields any.
    pub fn next_row(&mut self) -> Option<Vec<Value>> {
        let row = self.advance()?;
        let mut out = Vec::with_capacity(self.columns.len());
        for col in 0..self.columns.len() {
            out.push(self.cell(row, col));
        }
        Some(out)
    }

    /// The next row keyed by disambiguated column name, NULL cells omitted.
    pub fn next_row_map(&mut self) -> Option<IndexMap<String, Value>> {
        let row = self.advance()?;
        let mut out = IndexMap::new();
        for (col, name) in self.columns.iter().enumerate() {
            let value = self.cell(row, col);
            if !value.is_null() {
                out.insert(name.clone(), value);
            }
        }
        Some(out)
    }

    /// Affected-row count reported by the server; 0 when the command has no
    /// such count.
    #[must_use]
    pub fn rowcount(&self) -> u64 {
        self.result.cmd_tuples().parse().unwrap_or(0)
    }

    fn advance(&mut self) -> Option<usize> {
        if self.cursor >= self.result.ntuples() || self.columns.is_empty() {
            return None;
        }
        let row = self.cursor;
        self.cursor += 1;
        Some(row)
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        if self.result.is_null(row, col) {
            return Value::Null;
        }
        let raw = self.result.value(row, col);
        if self.result.field_type(col) == oid::BYTEA {
            Value::Bytes(decode_bytea(raw))
        } else {
            Value::Text(String::from_utf8_lossy(raw).into_owned())
        }
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        let (primary, conn) = {
            let rec = self.record.borrow();
            (rec.prepared_name == self.exec_name, rec.conn.clone())
        };
        if primary {
            self.record.borrow_mut().busy = false;
        } else if let Some(conn) = conn {
            if let Ok(mut guard) = conn.try_borrow_mut() {
                if let Ok(client) = guard.client_mut() {
                    unallocate_statement(client, &self.exec_name);
                }
            }
        }
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("exec_name", &self.exec_name)
            .field("columns", &self.columns.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// Throw away the stale primary preparation and prepare the text again
/// under a fresh primary name.
fn resettle_primary(
    record: &Rc<RefCell<StatementRecord>>,
    conn: &Rc<RefCell<ConnInner>>,
) -> Result<(), Error> {
    let fresh = {
        let mut guard = conn.borrow_mut();
        let old = record.borrow().prepared_name.clone();
        unallocate_statement(guard.client_mut()?, &old);
        guard.next_statement_name()
    };
    record.borrow_mut().prepared_name = fresh;
    prepare_record(record, None)?;
    record.borrow_mut().types_changed = false;
    Ok(())
}

/// Bind every substitution variable and run the prepared statement,
/// refreshing the record's column names from the result description.
fn execute(
    record: &Rc<RefCell<StatementRecord>>,
    conn: &Rc<RefCell<ConnInner>>,
    exec_name: &str,
    params: Option<&HashMap<String, Value>>,
) -> Result<(Box<dyn QueryResult>, Rc<Vec<String>>), Error> {
    let bound = {
        let rec = record.borrow();
        let live = rec.live()?;
        let mut bound = Vec::with_capacity(live.sub_vars.len());
        for (i, name) in live.sub_vars.iter().enumerate() {
            let value = params.and_then(|map| map.get(name));
            let declared = rec.params.get(i).map_or(oid::UNTYPED, |desc| desc.type_oid);
            bound.push(bind_param(value, declared)?);
        }
        bound
    };
    let result = {
        let mut guard = conn.borrow_mut();
        let client = guard.client_mut()?;
        tracing::trace!(name = %exec_name, params = bound.len(), "executing prepared statement");
        let result = client
            .exec_prepared(exec_name, &bound)
            .ok_or_else(|| Error::Connection(client.error_message()))?;
        check_result(&*result)?;
        result
    };
    let columns = Rc::new(disambiguate_columns(&*result));
    record.borrow_mut().set_column_names(Rc::clone(&columns));
    Ok((result, columns))
}

/// Lower one parameter to its wire form per the declared or inferred type.
///
/// Small integers go binary big-endian. Big integers, numerics, and floats
/// go as canonicalized text when the value parses as a number, and as raw
/// text otherwise, leaving the rejection to the server. Binary columns go
/// as raw bytes; everything else is text.
fn bind_param(value: Option<&Value>, declared: Oid) -> Result<BoundParam, Error> {
    let Some(value) = value else {
        return Ok(BoundParam::Null);
    };
    if value.is_null() {
        return Ok(BoundParam::Null);
    }
    match declared {
        oid::INT2 => {
            let int = value.coerce_int().ok_or_else(|| expected_integer(value))?;
            Ok(BoundParam::Binary((int as i16).to_be_bytes().to_vec()))
        }
        oid::INT4 => {
            let int = value.coerce_int().ok_or_else(|| expected_integer(value))?;
            Ok(BoundParam::Binary((int as i32).to_be_bytes().to_vec()))
        }
        oid::INT8 | oid::NUMERIC => match value.coerce_int() {
            Some(int) => Ok(BoundParam::Text(int.to_string())),
            None => Ok(text_param(value)),
        },
        oid::FLOAT4 | oid::FLOAT8 => match value.coerce_float() {
            Some(float) => Ok(BoundParam::Text(float.to_string())),
            None => Ok(text_param(value)),
        },
        oid::BYTEA => Ok(BoundParam::Binary(value.render_bytes().unwrap_or_default())),
        _ => Ok(text_param(value)),
    }
}

fn text_param(value: &Value) -> BoundParam {
    BoundParam::Text(value.render_text().unwrap_or_default())
}

fn expected_integer(value: &Value) -> Error {
    Error::usage(
        format!(
            "expected integer but got \"{}\"",
            value.render_text().unwrap_or_default()
        ),
        GENERAL_SQLSTATE,
    )
}

/// Result column names with duplicates disambiguated by a `#n` suffix,
/// where `n` counts occurrences of the colliding name: `[a, a, b, a]`
/// becomes `[a, a#2, b, a#3]`. Suffixed names are probed again, so a
/// literal `a#2` column never collides silently.
fn disambiguate_columns(result: &dyn QueryResult) -> Vec<String> {
    let mut names: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(result.nfields());
    for col in 0..result.nfields() {
        let mut name = result.field_name(col);
        let mut count = 1usize;
        loop {
            match names.entry(name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(count);
                    break;
                }
                Entry::Occupied(mut slot) => {
                    count = *slot.get() + 1;
                    *slot.get_mut() = count;
                    name.push_str(&format!("#{count}"));
                }
            }
        }
        out.push(name);
    }
    out
}

/// Undo the server's escape-format rendering of a binary column: `\\` is a
/// backslash, `\nnn` an octal byte, anything else verbatim. A malformed
/// escape keeps its backslash as-is.
fn decode_bytea(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'\\' {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        if raw.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
            continue;
        }
        let octal = raw
            .get(i + 1..i + 4)
            .filter(|digits| digits.iter().all(|d| (b'0'..=b'7').contains(d)));
        match octal {
            Some(digits) => {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push((value & 0xff) as u8);
                i += 4;
            }
            None => {
                out.push(b'\\');
                i += 1;
            }
        }
    }
    out
}
