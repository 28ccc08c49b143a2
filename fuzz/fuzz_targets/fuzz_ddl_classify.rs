//! Fuzz target for statement normalization and DDL classification.

#![no_main]

use binlog_replay::sql::{is_ddl, is_ddl_database, normalize, starts_with_ci};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|sql: &str| {
    let normalized = normalize(sql);

    // Should never panic
    let ddl = is_ddl(sql);
    let database = is_ddl_database(sql);

    // database DDL is a subset of DDL
    if database {
        assert!(ddl);
    }
    assert!(!normalized.contains("  "));
    assert_eq!(normalized.trim(), normalized);

    let _ = starts_with_ci(sql, "XA COMMIT");
    let _ = starts_with_ci(sql, "é");
});
