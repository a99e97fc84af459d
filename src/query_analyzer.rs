//! Classification of binlog query events into schema-change descriptors.
//!
//! The analyzer recognises the five table-shaping statement families (CREATE
//! TABLE, ALTER TABLE, DROP TABLE, RENAME TABLE, TRUNCATE TABLE). Anything
//! else - stored-routine DDL, privilege changes, transaction markers - yields
//! no descriptors and no error; the run survives by applying nothing.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use regex::Regex;

use crate::rewrite::quote_ident;
use crate::tables::QualifiedTableName;

const TABLE_REF: &str = r"(?:`[^`]+`|[A-Za-z0-9_$]+)(?:\s*\.\s*(?:`[^`]+`|[A-Za-z0-9_$]+))?";

fn create_table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?({TABLE_REF})"
        ))
        .unwrap()
    })
}

fn alter_table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?is)^\s*ALTER\s+TABLE\s+({TABLE_REF})\s+(.*)$")).unwrap()
    })
}

fn alter_rename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*RENAME\s+(?:TO\s+|AS\s+)?({TABLE_REF})\s*$"
        ))
        .unwrap()
    })
}

fn drop_table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^\s*DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?(.+?)\s*$").unwrap()
    })
}

fn rename_table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^\s*RENAME\s+TABLES?\s+(.+?)\s*$").unwrap())
}

fn rename_pair_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*({TABLE_REF})\s+TO\s+({TABLE_REF})\s*$"
        ))
        .unwrap()
    })
}

fn truncate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?is)^\s*TRUNCATE\s+(?:TABLE\s+)?({TABLE_REF})\s*$")).unwrap()
    })
}

fn table_ref_parts_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)^(?:`(?P<first_q>[^`]+)`|(?P<first_u>[A-Za-z0-9_$]+))(?:\s*\.\s*(?:`(?P<second_q>[^`]+)`|(?P<second_u>[A-Za-z0-9_$]+)))?$",
        )
        .unwrap()
    })
}

/// One table-shaping change extracted from a query event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// The table the statement operates on, in source names.
    pub affected_table: QualifiedTableName,
    /// Set for drops and for the old side of renames.
    pub deleted_table: Option<QualifiedTableName>,
    /// Set for the new side of renames.
    pub created_table: Option<QualifiedTableName>,
    /// The statement to apply on the target, table references unqualified.
    pub statement: String,
    pub is_schema_change: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Break a query event down into zero or more schema-change descriptors.
    /// `current_schema` is the default database the statement executed under.
    pub fn parse_schema_changes(
        &self,
        query: &str,
        current_schema: &str,
    ) -> Result<Vec<SchemaChange>> {
        let query = query.trim().trim_end_matches(';').trim();

        if let Some(captures) = create_table_regex().captures(query) {
            let table = parse_table_ref(&captures[1], current_schema)?;
            return Ok(vec![SchemaChange {
                affected_table: table,
                deleted_table: None,
                created_table: None,
                statement: query.to_string(),
                is_schema_change: true,
            }]);
        }

        if let Some(captures) = alter_table_regex().captures(query) {
            let table = parse_table_ref(&captures[1], current_schema)?;
            // ALTER TABLE ... RENAME TO is a rename in alter clothing.
            if let Some(rename) = alter_rename_regex().captures(&captures[2]) {
                let new_table = parse_table_ref(&rename[1], current_schema)?;
                return Ok(vec![SchemaChange {
                    affected_table: table.clone(),
                    deleted_table: Some(table.clone()),
                    created_table: Some(new_table.clone()),
                    statement: format!(
                        "RENAME TABLE {} TO {}",
                        quote_ident(&table.table_name),
                        quote_ident(&new_table.table_name)
                    ),
                    is_schema_change: true,
                }]);
            }
            return Ok(vec![SchemaChange {
                affected_table: table,
                deleted_table: None,
                created_table: None,
                statement: query.to_string(),
                is_schema_change: true,
            }]);
        }

        if let Some(captures) = rename_table_regex().captures(query) {
            let mut changes = Vec::new();
            for pair in captures[1].split(',') {
                let parts = rename_pair_regex()
                    .captures(pair)
                    .ok_or_else(|| anyhow!("unparsable RENAME TABLE clause: {pair:?}"))?;
                let old_table = parse_table_ref(&parts[1], current_schema)?;
                let new_table = parse_table_ref(&parts[2], current_schema)?;
                changes.push(SchemaChange {
                    affected_table: old_table.clone(),
                    deleted_table: Some(old_table.clone()),
                    created_table: Some(new_table.clone()),
                    statement: format!(
                        "RENAME TABLE {} TO {}",
                        quote_ident(&old_table.table_name),
                        quote_ident(&new_table.table_name)
                    ),
                    is_schema_change: true,
                });
            }
            return Ok(changes);
        }

        if let Some(captures) = drop_table_regex().captures(query) {
            let mut changes = Vec::new();
            for name in captures[1].split(',') {
                let table = parse_table_ref(name.trim(), current_schema)?;
                changes.push(SchemaChange {
                    affected_table: table.clone(),
                    deleted_table: Some(table.clone()),
                    created_table: None,
                    statement: format!("DROP TABLE IF EXISTS {}", quote_ident(&table.table_name)),
                    is_schema_change: true,
                });
            }
            return Ok(changes);
        }

        if let Some(captures) = truncate_regex().captures(query) {
            let table = parse_table_ref(&captures[1], current_schema)?;
            return Ok(vec![SchemaChange {
                affected_table: table.clone(),
                deleted_table: None,
                created_table: None,
                statement: format!("TRUNCATE TABLE {}", quote_ident(&table.table_name)),
                is_schema_change: true,
            }]);
        }

        Ok(Vec::new())
    }
}

fn parse_table_ref(reference: &str, default_schema: &str) -> Result<QualifiedTableName> {
    let captures = table_ref_parts_regex()
        .captures(reference.trim())
        .ok_or_else(|| anyhow!("unparsable table reference: {reference:?}"))?;

    let first = captures
        .name("first_q")
        .or_else(|| captures.name("first_u"))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("unparsable table reference: {reference:?}"))?;
    let second = captures
        .name("second_q")
        .or_else(|| captures.name("second_u"))
        .map(|m| m.as_str().to_string());

    Ok(match second {
        Some(table) => QualifiedTableName::new(first, table),
        None => QualifiedTableName::new(default_schema, first),
    })
}
