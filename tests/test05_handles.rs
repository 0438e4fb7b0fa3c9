use pg_session::test_utils::MockDriver;
use pg_session::{Connection, Environment, StatementHandle};

fn open(driver: &MockDriver) -> Connection {
    Connection::connect(&Environment::new(), driver, &[]).unwrap()
}

#[test]
fn handles_resolve_lazily() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let handle = StatementHandle::new("SELECT :x");
    assert_eq!(handle.sql(), "SELECT :x");
    assert!(!handle.is_resolved());
    assert!(driver.calls().matching("prepare:").is_empty());

    let stmt = handle.statement(&conn).unwrap();
    assert!(handle.is_resolved());
    assert_eq!(stmt.native_sql(), "SELECT $1");
    assert_eq!(driver.calls().matching("prepare:").len(), 1);
}

#[test]
fn a_resolved_handle_keeps_the_preparation_alive() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let handle = StatementHandle::new("SELECT 1");
    let stmt = handle.statement(&conn).unwrap();
    drop(stmt);
    // The handle's memoized link still owns the record.
    assert!(driver.calls().matching("exec:DEALLOCATE").is_empty());

    let _again = handle.statement(&conn).unwrap();
    assert_eq!(driver.calls().matching("prepare:").len(), 1);
}

#[test]
fn dropping_the_handle_releases_the_statement() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let handle = StatementHandle::new("SELECT 1");
    handle.statement(&conn).unwrap();
    drop(handle);
    assert!(driver.calls().contains("exec:DEALLOCATE statement1"));
}

#[test]
fn clones_carry_the_resolution_independently() {
    let driver = MockDriver::new();
    let conn = open(&driver);
    let original = StatementHandle::new("SELECT 1");
    original.statement(&conn).unwrap();

    let copy = original.clone();
    assert!(copy.is_resolved());
    drop(original);
    // The copy's registration still holds the record.
    assert!(driver.calls().matching("exec:DEALLOCATE").is_empty());
    assert_eq!(copy.statement(&conn).unwrap().sql(), "SELECT 1");
    assert_eq!(driver.calls().matching("prepare:").len(), 1);
    drop(copy);
    assert!(driver.calls().contains("exec:DEALLOCATE statement1"));
}

#[test]
fn unresolved_clones_stay_unresolved() {
    let handle = StatementHandle::new("SELECT 1");
    let copy = handle.clone();
    assert!(!copy.is_resolved());
}
