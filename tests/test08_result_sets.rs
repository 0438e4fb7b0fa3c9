use std::collections::HashMap;

use pg_session::test_utils::{MockConn, MockDriver, ScriptedResult};
use pg_session::types::oid;
use pg_session::{Connection, Environment, ResultSet, Statement, Value};

fn open(driver: &MockDriver) -> Connection {
    Connection::connect(&Environment::new(), driver, &[]).unwrap()
}

fn one_param(name: &str, value: Value) -> HashMap<String, Value> {
    HashMap::from([(name.to_string(), value)])
}

#[test]
fn rows_come_back_in_order_with_nulls_present() {
    let driver = MockDriver::new().with_conn(MockConn::new().on_exec_prepared(
        "SELECT * FROM t",
        ScriptedResult::rows(
            &[("id", oid::INT4), ("label", oid::TEXT)],
            &[
                &[Some("1"), Some("one")],
                &[Some("2"), None],
            ],
        ),
    ));
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT * FROM t").unwrap();
    let mut rs = ResultSet::new(&stmt, None).unwrap();

    assert_eq!(rs.columns(), ["id", "label"]);
    assert_eq!(
        rs.next_row().unwrap(),
        vec![Value::Text("1".into()), Value::Text("one".into())]
    );
    assert_eq!(
        rs.next_row().unwrap(),
        vec![Value::Text("2".into()), Value::Null]
    );
    assert!(rs.next_row().is_none());
    assert!(rs.next_row().is_none());
}

#[test]
fn row_maps_keep_column_order_and_omit_nulls() {
    let driver = MockDriver::new().with_conn(MockConn::new().on_exec_prepared(
        "SELECT * FROM t",
        ScriptedResult::rows(
            &[("id", oid::INT4), ("label", oid::TEXT)],
            &[&[Some("2"), None]],
        ),
    ));
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT * FROM t").unwrap();
    let mut rs = ResultSet::new(&stmt, None).unwrap();

    let row = rs.next_row_map().unwrap();
    assert_eq!(row.len(), 1);
    assert_eq!(row["id"], Value::Text("2".into()));
    assert!(!row.contains_key("label"));
    assert!(rs.next_row_map().is_none());
}

#[test]
fn duplicate_column_names_are_disambiguated() {
    let driver = MockDriver::new().with_conn(MockConn::new().on_exec_prepared(
        "SELECT a, a, b, a FROM t",
        ScriptedResult::rows(
            &[
                ("a", oid::TEXT),
                ("a", oid::TEXT),
                ("b", oid::TEXT),
                ("a", oid::TEXT),
            ],
            &[&[Some("w"), Some("x"), Some("y"), Some("z")]],
        ),
    ));
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT a, a, b, a FROM t").unwrap();
    let mut rs = ResultSet::new(&stmt, None).unwrap();

    assert_eq!(rs.columns(), ["a", "a#2", "b", "a#3"]);
    let row = rs.next_row_map().unwrap();
    assert_eq!(row["a#3"], Value::Text("z".into()));
}

#[test]
fn rowcount_comes_from_the_command_tally() {
    let driver = MockDriver::new().with_conn(
        MockConn::new()
            .on_exec_prepared(
                "UPDATE t SET x = 1",
                ScriptedResult::command_ok().with_cmd_tuples("3"),
            )
            .on_exec_prepared("UPDATE t SET x = 1", ScriptedResult::command_ok()),
    );
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "UPDATE t SET x = 1").unwrap();
    let rs = ResultSet::new(&stmt, None).unwrap();
    assert_eq!(rs.rowcount(), 3);
    drop(rs);

    // Commands without a tally report zero.
    let rs = ResultSet::new(&stmt, None).unwrap();
    assert_eq!(rs.rowcount(), 0);
}

#[test]
fn rowless_results_yield_no_rows() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "CREATE TABLE t (x int)").unwrap();
    let mut rs = ResultSet::new(&stmt, None).unwrap();
    assert!(rs.columns().is_empty());
    assert!(rs.next_row().is_none());
    assert!(rs.next_row_map().is_none());
}

#[test]
fn binary_columns_decode_the_escape_format() {
    let driver = MockDriver::new().with_conn(MockConn::new().on_exec_prepared(
        "SELECT blob FROM t",
        ScriptedResult::rows(
            &[("blob", oid::BYTEA)],
            &[&[Some("ab\\134cd\\000")]],
        ),
    ));
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT blob FROM t").unwrap();
    let mut rs = ResultSet::new(&stmt, None).unwrap();
    assert_eq!(
        rs.next_row().unwrap(),
        vec![Value::Bytes(b"ab\\cd\0".to_vec())]
    );
}

#[test]
fn a_failed_execution_leaves_the_statement_usable() {
    let driver = MockDriver::new().with_conn(
        MockConn::new()
            .on_exec_prepared(
                "SELECT 1/0",
                ScriptedResult::server_error("division by zero", "22012"),
            )
            .on_exec_prepared(
                "SELECT 1/0",
                ScriptedResult::rows(&[("?column?", oid::INT4)], &[&[Some("1")]]),
            ),
    );
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT 1/0").unwrap();

    let err = ResultSet::new(&stmt, None).unwrap_err();
    assert_eq!(err.to_string(), "division by zero");
    assert_eq!(err.code().sqlstate, "22012");
    assert_eq!(err.code().category, "DATA_EXCEPTION");
    // The primary name was released, not deallocated.
    assert!(driver.calls().matching("exec:DEALLOCATE").is_empty());

    let mut rs = ResultSet::new(&stmt, None).unwrap();
    assert_eq!(rs.next_row().unwrap(), vec![Value::Text("1".into())]);
    assert_eq!(driver.calls().matching("prepare:").len(), 1);
}

#[test]
fn each_execution_reports_its_own_columns() {
    let driver = MockDriver::new().with_conn(
        MockConn::new()
            .on_exec_prepared(
                "SELECT $1",
                ScriptedResult::rows(&[("a", oid::TEXT)], &[&[Some("1")]]),
            )
            .on_exec_prepared(
                "SELECT $1",
                ScriptedResult::rows(
                    &[("a", oid::TEXT), ("a", oid::TEXT)],
                    &[&[Some("1"), Some("2")]],
                ),
            ),
    );
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT :x").unwrap();

    let rs = ResultSet::new(&stmt, Some(&one_param("x", Value::Int(1)))).unwrap();
    assert_eq!(rs.columns(), ["a"]);
    drop(rs);
    let rs = ResultSet::new(&stmt, Some(&one_param("x", Value::Int(1)))).unwrap();
    assert_eq!(rs.columns(), ["a", "a#2"]);
}
