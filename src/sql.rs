// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Literal SQL rendering for row images, DDL classification and XID decoding.
//!
//! Row events are replayed as plain statements with inlined literals; the
//! destination never sees placeholders. Rendering rules:
//!
//! | Value | Rendered |
//! |-------|----------|
//! | `Null` | `NULL` (`IS NULL` in a WHERE clause) |
//! | `Int` / `UInt` / `Float` | bare number |
//! | `Text` | single-quoted, `'` and `\` escaped |
//! | `Bytes` | `X'..'` hex literal |

use std::fmt::Write;

/// One column value from a decoded row image.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render as a SQL literal.
    pub fn to_sql(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(n) => n.to_string(),
            Value::UInt(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => quote(s),
            Value::Bytes(b) => format!("X'{}'", hex::encode(b)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Ordered column name → value image of one row.
pub type ColumnMap = Vec<(String, Value)>;

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn where_clause(row: &ColumnMap) -> String {
    row.iter()
        .map(|(k, v)| {
            if v.is_null() {
                format!("{} IS NULL", k)
            } else {
                format!("{}={}", k, v.to_sql())
            }
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

/// `insert into schema.table(a,b) values(..)`
pub fn sql_insert(table: &str, row: &ColumnMap) -> String {
    let cols = row.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(",");
    let vals = row.iter().map(|(_, v)| v.to_sql()).collect::<Vec<_>>().join(",");
    format!("insert into {}({}) values({})", table, cols, vals)
}

/// `update schema.table set <after> where <before>`
pub fn sql_update(table: &str, before: &ColumnMap, after: &ColumnMap) -> String {
    let mut sql = format!("update {} set ", table);
    for (i, (k, v)) in after.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        let _ = write!(sql, "{}={}", k, v.to_sql());
    }
    sql.push_str(" where ");
    sql.push_str(&where_clause(before));
    sql
}

/// `delete from schema.table where <row>`
pub fn sql_delete(table: &str, row: &ColumnMap) -> String {
    format!("delete from {} where {}", table, where_clause(row))
}

const DDL_PREFIXES: &[&str] = &[
    "create table",
    "drop table",
    "create index",
    "drop index",
    "truncate table",
    "alter table",
    "alter index",
    "create database",
    "drop database",
    "create user",
    "drop user",
];

const DDL_DATABASE_PREFIXES: &[&str] = &["create database", "drop database"];

/// Remove `/* ... */` comments, collapse whitespace and lowercase.
pub fn normalize(sql: &str) -> String {
    let mut stripped = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(start) = rest.find("/*") {
        stripped.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                // unterminated comment swallows the remainder
                rest = "";
            }
        }
    }
    stripped.push_str(rest);
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Whether a query event is one of the replicated DDL forms.
pub fn is_ddl(sql: &str) -> bool {
    let normalized = normalize(sql);
    DDL_PREFIXES.iter().any(|p| normalized.starts_with(p))
}

/// `CREATE DATABASE` / `DROP DATABASE`, which must not be prefixed by `use`.
pub fn is_ddl_database(sql: &str) -> bool {
    let normalized = normalize(sql);
    DDL_DATABASE_PREFIXES.iter().any(|p| normalized.starts_with(p))
}

/// Case-insensitive prefix check on the trimmed statement.
pub fn starts_with_ci(sql: &str, prefix: &str) -> bool {
    let sql = sql.trim_start();
    sql.len() >= prefix.len()
        && sql.is_char_boundary(prefix.len())
        && sql[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Decode the gtrid from `XA COMMIT X'6162',X'',1` style statement text.
///
/// Returns `None` when the third token is not a hex literal.
pub fn parse_xa_xid(sql: &str) -> Option<String> {
    let token = sql.split_whitespace().nth(2)?;
    let gtrid = token.split(',').next()?;
    let hex_body = gtrid
        .strip_prefix("X'")
        .or_else(|| gtrid.strip_prefix("x'"))?
        .strip_suffix('\'')?;
    let bytes = hex::decode(hex_body).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> ColumnMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_update_renders_set_and_where() {
        let before = row(&[("id", Value::Int(1)), ("name", "a".into())]);
        let after = row(&[("id", Value::Int(1)), ("name", "b".into())]);
        assert_eq!(
            sql_update("d.t", &before, &after),
            "update d.t set id=1,name='b' where id=1 and name='a'"
        );
    }

    #[test]
    fn test_insert_renders_null() {
        let r = row(&[("a", "1".into()), ("b", Value::Null)]);
        assert_eq!(sql_insert("d.t", &r), "insert into d.t(a,b) values('1',NULL)");
    }

    #[test]
    fn test_update_null_in_set_and_where() {
        let before = row(&[("id", Value::Int(2)), ("c", Value::Null)]);
        let after = row(&[("id", Value::Int(2)), ("c", Value::Null)]);
        assert_eq!(
            sql_update("d.t", &before, &after),
            "update d.t set id=2,c=NULL where id=2 and c IS NULL"
        );
    }

    #[test]
    fn test_delete() {
        let r = row(&[("id", Value::UInt(9)), ("s", "x".into())]);
        assert_eq!(sql_delete("d.t", &r), "delete from d.t where id=9 and s='x'");
    }

    #[test]
    fn test_text_escaping() {
        assert_eq!(Value::from("it's").to_sql(), "'it\\'s'");
        assert_eq!(Value::from("a\\b").to_sql(), "'a\\\\b'");
    }

    #[test]
    fn test_bytes_hex_literal() {
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_sql(), "X'dead'");
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::Int(3));
    }

    #[test]
    fn test_is_ddl_variants() {
        assert!(is_ddl("CREATE TABLE t (id int)"));
        assert!(is_ddl("  alter   TABLE t add column x int"));
        assert!(is_ddl("/* generated */ DROP INDEX i ON t"));
        assert!(is_ddl("/* multi\nline */truncate table t"));
        assert!(is_ddl("create user 'u'@'%'"));
        assert!(!is_ddl("BEGIN"));
        assert!(!is_ddl("insert into t values(1)"));
        assert!(!is_ddl("CREATE VIEW v AS SELECT 1"));
    }

    #[test]
    fn test_is_ddl_database() {
        assert!(is_ddl_database("CREATE DATABASE d"));
        assert!(is_ddl_database("/*!40000*/ drop database d"));
        assert!(!is_ddl_database("CREATE TABLE d.t (id int)"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("A /* x */  B\n\tC"), "a b c");
        assert_eq!(normalize("keep /* open"), "keep");
    }

    #[test]
    fn test_parse_xa_xid() {
        // hex("abc") = 616263
        assert_eq!(parse_xa_xid("XA COMMIT X'616263',X'',1").as_deref(), Some("abc"));
        assert_eq!(parse_xa_xid("XA ROLLBACK X'616263',X'01',1").as_deref(), Some("abc"));
        assert_eq!(parse_xa_xid("XA COMMIT 'plain'"), None);
        assert_eq!(parse_xa_xid("XA COMMIT"), None);
        assert_eq!(parse_xa_xid("XA COMMIT X'zz'"), None);
    }

    #[test]
    fn test_starts_with_ci() {
        assert!(starts_with_ci("xa start X'01'", "XA START"));
        assert!(starts_with_ci("  XA END X'01'", "XA END"));
        assert!(!starts_with_ci("XA", "XA END"));
        assert!(!starts_with_ci("é", "XA"));
    }
}
