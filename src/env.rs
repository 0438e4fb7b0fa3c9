//! Per-context shared state.

use std::collections::HashMap;
use std::rc::Rc;

use crate::types::{Oid, SqlType, TYPE_TABLE};

/// Shared per-context state: the type lookup tables every connection in the
/// context consults.
///
/// Cloning is cheap; connections hold a clone for as long as they live, so
/// the tables outlive any connection created from them.
#[derive(Clone)]
pub struct Environment {
    inner: Rc<EnvInner>,
}

struct EnvInner {
    names_by_oid: HashMap<Oid, &'static str>,
    types_by_name: HashMap<&'static str, SqlType>,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        let mut names_by_oid = HashMap::new();
        let mut types_by_name = HashMap::new();
        for (sql_type, name, type_oid) in TYPE_TABLE {
            // first entry wins, so synonym ids keep their canonical name
            names_by_oid.entry(*type_oid).or_insert(*name);
            types_by_name.insert(*name, *sql_type);
        }
        Environment {
            inner: Rc::new(EnvInner {
                names_by_oid,
                types_by_name,
            }),
        }
    }

    /// Canonical type name for a server type id, if known.
    #[must_use]
    pub fn type_name(&self, type_oid: Oid) -> Option<&'static str> {
        self.inner.names_by_oid.get(&type_oid).copied()
    }

    /// Declared type for a name accepted by
    /// [`crate::Statement::set_param_type`].
    #[must_use]
    pub fn type_for_name(&self, name: &str) -> Option<SqlType> {
        self.inner.types_by_name.get(name).copied()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::new()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("types", &self.inner.names_by_oid.len())
            .finish()
    }
}
