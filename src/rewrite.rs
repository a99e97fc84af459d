//! Name rewriting and SQL identifier quoting.
//!
//! Rewrites map *source* database and table names to their *target*
//! counterparts. State tracking is always keyed by source names; rewrites are
//! applied only at the point where SQL is rendered against the target.

use std::collections::HashMap;

/// Resolve the target database name for a source database name.
pub fn rewrite_database<'a>(rewrites: &'a HashMap<String, String>, database: &'a str) -> &'a str {
    rewrites.get(database).map(String::as_str).unwrap_or(database)
}

/// Resolve the target table name for a source table name.
pub fn rewrite_table<'a>(rewrites: &'a HashMap<String, String>, table: &'a str) -> &'a str {
    rewrites.get(table).map(String::as_str).unwrap_or(table)
}

/// Quote an identifier for use in MySQL SQL text.
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Render a fully-qualified, quoted `db`.`table` reference.
pub fn qualified_name(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(table))
}
