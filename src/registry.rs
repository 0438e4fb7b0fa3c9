//! Process-wide parking lot for detached connections.
//!
//! [`crate::Connection::detach`] strips a connection down to plain owned
//! data and parks it here under a generated handle; a later
//! [`crate::Connection::connect`] with the `attach` option claims it, on
//! any thread. Entries are consumed by the first claim.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::client::ClientConn;
use crate::error::Error;
use crate::statement::FrozenStatement;
use crate::types::IsolationLevel;

/// Everything a connection owns once its per-thread wrappers are gone.
///
/// Every field is plain owned data (the client driver handle is `Send` by
/// trait bound), so the whole record can cross threads.
pub(crate) struct DetachedConn {
    pub(crate) client: Box<dyn ClientConn>,
    /// Frozen statement cache, keyed by original SQL text.
    pub(crate) statements: HashMap<String, FrozenStatement>,
    pub(crate) statement_seq: u32,
    pub(crate) in_transaction: bool,
    pub(crate) isolation: Option<IsolationLevel>,
    pub(crate) readonly: bool,
    /// Connection-string option values, indexed per the option table.
    pub(crate) saved_options: Vec<Option<String>>,
}

struct Registry {
    entries: HashMap<String, DetachedConn>,
    sequence: u64,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| {
    Mutex::new(Registry {
        entries: HashMap::new(),
        sequence: 0,
    })
});

fn lock() -> MutexGuard<'static, Registry> {
    match REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            // Clear the poison and continue with the recovered data
            poisoned.into_inner()
        }
    }
}

/// Park a detached connection and hand back its claim handle.
///
/// Handles are `pqhandle1`, `pqhandle2`, ... from a process-wide sequence
/// that never repeats, so a collision can only mean the sequence was
/// corrupted; it is reported rather than silently overwriting an entry.
pub(crate) fn put(conn: DetachedConn) -> Result<String, Error> {
    let mut registry = lock();
    registry.sequence += 1;
    let handle = format!("pqhandle{}", registry.sequence);
    match registry.entries.entry(handle.clone()) {
        Entry::Occupied(_) => Err(Error::Internal(format!(
            "generated a handle but it wasn't new: \"{handle}\""
        ))),
        Entry::Vacant(slot) => {
            slot.insert(conn);
            tracing::debug!(handle = %handle, "parked detached connection");
            Ok(handle)
        }
    }
}

/// Claim a parked connection, consuming the entry.
pub(crate) fn take(handle: &str) -> Option<DetachedConn> {
    let taken = lock().entries.remove(handle);
    tracing::debug!(handle = %handle, found = taken.is_some(), "claimed detached connection");
    taken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BoundParam, ConnStatus, QueryResult};

    struct NullConn;

    impl ClientConn for NullConn {
        fn status(&self) -> ConnStatus {
            ConnStatus::Ok
        }
        fn error_message(&self) -> String {
            String::new()
        }
        fn ignore_notices(&mut self) {}
        fn client_encoding(&self) -> String {
            "UTF8".into()
        }
        fn set_client_encoding(&mut self, _encoding: &str) -> bool {
            true
        }
        fn exec(&mut self, _sql: &str) -> Option<Box<dyn QueryResult>> {
            None
        }
        fn prepare(&mut self, _name: &str, _sql: &str) -> Option<Box<dyn QueryResult>> {
            None
        }
        fn describe_prepared(&mut self, _name: &str) -> Option<Box<dyn QueryResult>> {
            None
        }
        fn exec_prepared(
            &mut self,
            _name: &str,
            _params: &[BoundParam],
        ) -> Option<Box<dyn QueryResult>> {
            None
        }
    }

    fn parked() -> DetachedConn {
        DetachedConn {
            client: Box::new(NullConn),
            statements: HashMap::new(),
            statement_seq: 3,
            in_transaction: false,
            isolation: None,
            readonly: false,
            saved_options: vec![None; 13],
        }
    }

    #[test]
    fn take_of_unknown_handle_is_none() {
        assert!(take("pqhandle-never-issued").is_none());
    }

    #[test]
    fn put_take_round_trip_consumes_the_entry() {
        let handle = put(parked()).unwrap();
        assert!(handle.starts_with("pqhandle"));
        let claimed = take(&handle).expect("entry should be present");
        assert_eq!(claimed.statement_seq, 3);
        assert!(take(&handle).is_none(), "second claim must find nothing");
    }

    #[test]
    fn handles_are_distinct() {
        let first = put(parked()).unwrap();
        let second = put(parked()).unwrap();
        assert_ne!(first, second);
        take(&first);
        take(&second);
    }

    #[test]
    fn parked_connections_cross_threads() {
        let handle = put(parked()).unwrap();
        let claimed = std::thread::spawn(move || take(&handle))
            .join()
            .expect("claim thread panicked");
        assert!(claimed.is_some());
    }
}
