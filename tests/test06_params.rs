use pg_session::test_utils::{MockConn, MockDriver};
use pg_session::types::oid;
use pg_session::{Connection, Direction, Environment, ParamSpec, SqlType, Statement};

fn open(driver: &MockDriver) -> Connection {
    Connection::connect(&Environment::new(), driver, &[]).unwrap()
}

#[test]
fn named_markers_become_positional_placeholders() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT :name, :name").unwrap();
    assert_eq!(stmt.sql(), "SELECT :name, :name");
    assert_eq!(stmt.native_sql(), "SELECT $1, $2");
    assert!(driver.calls().contains("prepare:statement1:SELECT $1, $2"));
    // Two placeholders, one declared parameter.
    assert_eq!(stmt.params().len(), 1);
    assert!(stmt.params().contains_key("name"));
}

#[test]
fn dollar_markers_and_casts_coexist() {
    let conn = open(&MockDriver::new());
    let stmt = Statement::new(&conn, "SELECT $a, b::int8 WHERE c = :a").unwrap();
    assert_eq!(stmt.native_sql(), "SELECT $1, b::int8 WHERE c = $2");
    let params = stmt.params();
    let names: Vec<&String> = params.keys().collect();
    assert_eq!(names, vec!["a"]);
}

#[test]
fn at_markers_pass_through_to_the_server() {
    let conn = open(&MockDriver::new());
    let stmt = Statement::new(&conn, "SELECT @scratch, :x").unwrap();
    assert_eq!(stmt.native_sql(), "SELECT @scratch, $1");
    assert_eq!(stmt.params().len(), 1);
}

#[test]
fn semicolons_are_rejected_before_anything_reaches_the_server() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let err = Statement::new(&conn, "SELECT 1; SELECT 2").unwrap_err();
    assert_eq!(
        err.to_string(),
        "pg-session does not support semicolons in statements"
    );
    assert_eq!(err.code().sqlstate, "HY000");
    assert!(driver.calls().matching("prepare:").is_empty());
}

#[test]
fn described_types_become_parameter_metadata() {
    let driver = MockDriver::new()
        .with_conn(MockConn::new().on_describe("SELECT $1, $2", &[oid::INT4, oid::INT8]));
    let conn = open(&driver);
    let stmt = Statement::new(&conn, "SELECT :a, :b").unwrap();
    let params = stmt.params();
    assert_eq!(params["a"].type_name, Some("integer"));
    assert_eq!(params["b"].type_name, Some("bigint"));
    assert_eq!(params["a"].direction, Direction::In);
    assert_eq!(params["a"].precision, 0);
}

#[test]
fn undescribed_parameters_default_to_text() {
    let conn = open(&MockDriver::new());
    let stmt = Statement::new(&conn, "SELECT :a").unwrap();
    assert_eq!(stmt.params()["a"].type_name, Some("text"));
}

#[test]
fn declared_types_override_the_described_ones() {
    let conn = open(&MockDriver::new());
    let stmt = Statement::new(&conn, "SELECT :a").unwrap();
    stmt.set_param_type(
        "a",
        ParamSpec::new(SqlType::Numeric).with_precision(12).with_scale(4),
    )
    .unwrap();
    let info = &stmt.params()["a"];
    assert_eq!(info.type_name, Some("numeric"));
    assert_eq!(info.precision, 12);
    assert_eq!(info.scale, 4);
}

#[test]
fn unknown_parameter_names_list_the_alternatives() {
    let conn = open(&MockDriver::new());
    let stmt = Statement::new(&conn, "SELECT :a, :b").unwrap();
    let err = stmt
        .set_param_type("x", ParamSpec::new(SqlType::Integer))
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown parameter \"x\": must be a or b");
}

#[test]
fn declaring_covers_every_occurrence_of_the_name() {
    let conn = open(&MockDriver::new());
    let stmt = Statement::new(&conn, "SELECT :a, :b, :a").unwrap();
    stmt.set_param_type("a", ParamSpec::new(SqlType::SmallInt))
        .unwrap();
    let params = stmt.params();
    assert_eq!(params["a"].type_name, Some("smallint"));
    assert_eq!(params["b"].type_name, Some("text"));
}

#[test]
fn quoted_markers_are_not_parameters() {
    let conn = open(&MockDriver::new());
    let stmt = Statement::new(&conn, "SELECT ':a', \":b\", :c").unwrap();
    assert_eq!(stmt.native_sql(), "SELECT ':a', \":b\", $1");
    assert_eq!(stmt.params().len(), 1);
}
