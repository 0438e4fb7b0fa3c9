use std::collections::HashMap;

use pg_session::test_utils::{MockConn, MockDriver, ScriptedResult};
use pg_session::types::oid;
use pg_session::{Connection, Environment, ParamSpec, ResultSet, SqlType, Statement, Value};

fn open(driver: &MockDriver) -> Connection {
    Connection::connect(&Environment::new(), driver, &[]).unwrap()
}

fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

#[test]
fn changing_a_type_reprepares_under_a_fresh_name() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT :a").unwrap();
    stmt.set_param_type("a", ParamSpec::new(SqlType::Integer))
        .unwrap();

    let _rs = ResultSet::new(&stmt, None).unwrap();
    let calls = driver.calls().snapshot();
    let position = |entry: &str| calls.iter().position(|c| c == entry).unwrap();
    assert!(position("exec:DEALLOCATE statement1") < position("prepare:statement2:SELECT $1"));
    assert!(position("prepare:statement2:SELECT $1") < position("describe:statement2"));
    assert!(driver.calls().contains("exec_prepared:statement2:[NULL]"));
}

#[test]
fn each_preparation_reinstates_the_server_inferred_types() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT :a").unwrap();
    stmt.set_param_type(
        "a",
        ParamSpec::new(SqlType::Integer).with_precision(10),
    )
    .unwrap();
    assert_eq!(stmt.params()["a"].type_name, Some("integer"));

    // The re-preparation asks the server again and keeps its answer.
    let _rs = ResultSet::new(&stmt, None).unwrap();
    let info = &stmt.params()["a"];
    assert_eq!(info.type_name, Some("text"));
    assert_eq!(info.precision, 0);
}

#[test]
fn redeclaring_the_same_type_does_not_reprepare() {
    let driver =
        MockDriver::new().with_conn(MockConn::new().on_describe("SELECT $1", &[oid::INT2]));
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT :a").unwrap();
    // Matches what the server already inferred; only precision changes.
    stmt.set_param_type("a", ParamSpec::new(SqlType::SmallInt).with_precision(4))
        .unwrap();

    let _rs = ResultSet::new(&stmt, Some(&params(&[("a", Value::Int(7))]))).unwrap();
    assert_eq!(driver.calls().matching("prepare:").len(), 1);
    assert!(driver.calls().matching("exec:DEALLOCATE").is_empty());
    // The declaration survived, so the small-integer binding applied.
    assert!(driver.calls().contains("exec_prepared:statement1:[0x0007]"));
}

#[test]
fn a_failed_repreparation_retries_on_the_next_execution() {
    let driver = MockDriver::new().with_conn(
        MockConn::new()
            .on_prepare("SELECT $1", ScriptedResult::command_ok())
            .on_prepare(
                "SELECT $1",
                ScriptedResult::server_error("out of memory", "53200"),
            )
            .on_prepare("SELECT $1", ScriptedResult::command_ok()),
    );
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT :a").unwrap();
    stmt.set_param_type("a", ParamSpec::new(SqlType::Integer))
        .unwrap();

    let err = ResultSet::new(&stmt, None).unwrap_err();
    assert_eq!(err.to_string(), "out of memory");

    // The pending type change stuck around, so this run re-prepares again.
    let _rs = ResultSet::new(&stmt, None).unwrap();
    let prepares = driver.calls().matching("prepare:");
    assert_eq!(
        prepares,
        vec![
            "prepare:statement1:SELECT $1",
            "prepare:statement2:SELECT $1",
            "prepare:statement3:SELECT $1",
        ]
    );
    assert!(driver.calls().contains("exec_prepared:statement3:[NULL]"));
}
