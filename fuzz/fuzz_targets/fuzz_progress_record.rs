//! Fuzz target for progress log line parsing.
//!
//! A crash can leave any byte sequence at the end of the log, so parsing
//! must never panic, and anything that parses must print back to a line
//! that parses to the same record.

#![no_main]

use binlog_replay::ProgressRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|line: &str| {
    let Ok(record) = line.parse::<ProgressRecord>() else {
        return;
    };
    let printed = record.to_string();
    let reparsed: ProgressRecord = printed.parse().expect("printed record must parse");
    assert_eq!(reparsed, record);
});
