//! Host-variable rewriting.
//!
//! Turns driver-portable `:name` / `$name` markers into the positional `$1`,
//! `$2`, ... placeholders the server expects, recording the variable names in
//! positional order. `@name` markers and `::` casts pass through untouched,
//! and top-level semicolons are rejected before anything reaches the server.

use crate::error::{Error, GENERAL_SQLSTATE};
use crate::token::{Token, tokenize};

/// A statement rewritten for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RewrittenSql {
    /// Text with positional placeholders.
    pub native_sql: String,
    /// Variable names, marker stripped, one entry per placeholder.
    pub param_names: Vec<String>,
}

pub(crate) fn rewrite_variables(sql: &str) -> Result<RewrittenSql, Error> {
    let mut native_sql = String::with_capacity(sql.len());
    let mut param_names = Vec::new();

    for token in tokenize(sql) {
        match token {
            Token::Literal(text) => native_sql.push_str(text),
            Token::Variable(marker) => {
                if marker.starts_with('@') {
                    native_sql.push_str(marker);
                } else {
                    param_names.push(marker[1..].to_string());
                    native_sql.push_str(&format!("${}", param_names.len()));
                }
            }
            Token::Separator => {
                return Err(Error::usage(
                    "pg-session does not support semicolons in statements",
                    GENERAL_SQLSTATE,
                ));
            }
        }
    }

    Ok(RewrittenSql {
        native_sql,
        param_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_each_occurrence_separately() {
        let rewritten = rewrite_variables("SELECT :name, :name").unwrap();
        assert_eq!(rewritten.native_sql, "SELECT $1, $2");
        assert_eq!(rewritten.param_names, vec!["name", "name"]);
    }

    #[test]
    fn mixed_markers_count_in_order() {
        let rewritten = rewrite_variables("SELECT $a, :b WHERE c = :a").unwrap();
        assert_eq!(rewritten.native_sql, "SELECT $1, $2 WHERE c = $3");
        assert_eq!(rewritten.param_names, vec!["a", "b", "a"]);
    }

    #[test]
    fn casts_pass_through() {
        let rewritten = rewrite_variables("SELECT a::int8, :b::text FROM t").unwrap();
        assert_eq!(rewritten.native_sql, "SELECT a::int8, $1::text FROM t");
        assert_eq!(rewritten.param_names, vec!["b"]);
    }

    #[test]
    fn at_variables_pass_through() {
        let rewritten = rewrite_variables("SELECT @scratch, :x").unwrap();
        assert_eq!(rewritten.native_sql, "SELECT @scratch, $1");
        assert_eq!(rewritten.param_names, vec!["x"]);
    }

    #[test]
    fn quoted_markers_stay_literal() {
        let rewritten = rewrite_variables("SELECT ':a', \":b\" FROM t").unwrap();
        assert_eq!(rewritten.native_sql, "SELECT ':a', \":b\" FROM t");
        assert!(rewritten.param_names.is_empty());
    }

    #[test]
    fn semicolons_are_rejected() {
        let err = rewrite_variables("SELECT 1; SELECT 2").unwrap_err();
        assert_eq!(
            err.to_string(),
            "pg-session does not support semicolons in statements"
        );

        // inside a literal is fine
        assert!(rewrite_variables("SELECT 'a;b'").is_ok());
    }
}
