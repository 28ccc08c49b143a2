//! Fuzz target for XA xid decoding.
//!
//! Checks that arbitrary statement text never panics and that a hex-encoded
//! gtrid always decodes back to its source text.

#![no_main]

use binlog_replay::sql::parse_xa_xid;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (raw, gtrid) = data;

    // Should never panic
    let _ = parse_xa_xid(raw);

    let sql = format!("XA COMMIT X'{}',X'',1", hex::encode(gtrid));
    if !gtrid.is_empty() {
        assert_eq!(parse_xa_xid(&sql).as_deref(), Some(gtrid));
    }
});
