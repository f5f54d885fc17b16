//! Property-based tests for the runtime's counting protocols.
//!
//! Uses proptest to drive the packed reader counter, the strong/weak
//! handle protocol, and configuration parsing through arbitrary
//! sequences, checking each against a simple model.

use proptest::prelude::*;

use boc_runtime::cown::{CownPtr, ReadRefCount, ReadStatus};
use boc_runtime::log::{LogFormat, LogLevel};

/// One step against a reader counter.
#[derive(Debug, Clone, Copy)]
enum ReadOp {
    AddRead(usize),
    ReleaseRead,
    TryWrite,
}

fn read_op() -> impl Strategy<Value = ReadOp> {
    prop_oneof![
        (1usize..4).prop_map(ReadOp::AddRead),
        Just(ReadOp::ReleaseRead),
        Just(ReadOp::TryWrite),
    ]
}

proptest! {
    /// The packed counter agrees with a plain model of (readers, writer
    /// pending) through any legal op sequence.
    #[test]
    fn read_ref_count_matches_model(ops in proptest::collection::vec(read_op(), 1..64)) {
        let rc = ReadRefCount::default();
        let mut readers: usize = 0;
        let mut writer_pending = false;

        for op in ops {
            match op {
                ReadOp::AddRead(n) => {
                    // Readers may not join past a pending writer.
                    if writer_pending {
                        continue;
                    }
                    let first = rc.add_read(n);
                    prop_assert_eq!(first, readers == 0);
                    readers += n;
                }
                ReadOp::ReleaseRead => {
                    if readers == 0 {
                        continue;
                    }
                    let status = rc.release_read();
                    readers -= 1;
                    match status {
                        ReadStatus::NotLast => prop_assert!(readers > 0),
                        ReadStatus::LastReader => {
                            prop_assert_eq!(readers, 0);
                            prop_assert!(!writer_pending);
                        }
                        ReadStatus::LastReaderWaitingWriter => {
                            prop_assert_eq!(readers, 0);
                            prop_assert!(writer_pending);
                            // The counter was handed to the writer clean.
                            writer_pending = false;
                            prop_assert_eq!(rc.get(), 0);
                        }
                    }
                }
                ReadOp::TryWrite => {
                    // One writer at a time; the protocol never retries
                    // while a mark is pending.
                    if writer_pending {
                        continue;
                    }
                    let can_write = rc.try_write();
                    prop_assert_eq!(can_write, readers == 0);
                    if can_write {
                        // The writer ran and left; the counter is clean.
                        prop_assert_eq!(rc.get(), 0);
                    } else {
                        writer_pending = true;
                    }
                }
            }
        }

        prop_assert_eq!(rc.get(), readers * 2 + usize::from(writer_pending));
    }

    /// Any interleaving of clones, downgrades, upgrades, and drops keeps
    /// the counts balanced and frees the value exactly once.
    #[test]
    fn handle_churn_balances(ops in proptest::collection::vec(0u8..4, 1..40)) {
        let root = CownPtr::new(String::from("payload"));
        let mut strongs = vec![root.clone()];
        let mut weaks = Vec::new();

        for op in ops {
            match op {
                0 => {
                    if let Some(s) = strongs.last() {
                        strongs.push(s.clone());
                    }
                }
                1 => {
                    if let Some(s) = strongs.last() {
                        weaks.push(s.downgrade());
                    }
                }
                2 => {
                    strongs.pop();
                }
                _ => {
                    if let Some(w) = weaks.pop() {
                        // The root handle is still alive, so promotion
                        // must succeed.
                        let promoted = w.upgrade();
                        prop_assert!(promoted.is_some());
                        strongs.extend(promoted);
                    }
                }
            }
        }

        prop_assert_eq!(root.strong_count(), 1 + strongs.len());
        prop_assert_eq!(root.weak_count(), 1 + weaks.len());

        drop(strongs);
        prop_assert_eq!(root.strong_count(), 1);
        drop(root);
        for w in &weaks {
            prop_assert!(w.upgrade().is_none());
        }
    }

    /// Log levels round-trip through their string and numeric forms.
    #[test]
    fn log_level_roundtrips(v in 0u8..6) {
        let level = LogLevel::from_u8(v).unwrap();
        prop_assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        prop_assert_eq!(level as u8, v);
    }

    /// Format parsing accepts exactly its own names, in any case.
    #[test]
    fn log_format_parse_is_total(s in "[a-zA-Z]{0,8}") {
        let parsed = LogFormat::parse(&s);
        match s.to_lowercase().as_str() {
            "plain" | "text" => prop_assert_eq!(parsed, Some(LogFormat::Plain)),
            "json" => prop_assert_eq!(parsed, Some(LogFormat::Json)),
            _ => prop_assert_eq!(parsed, None),
        }
    }
}
