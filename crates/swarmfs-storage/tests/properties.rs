//! Property tests for document round-trips and compaction ordering.

#![allow(clippy::needless_pass_by_value)]

use proptest::prelude::*;
use serde_json::{Map, Value, json};
use swarmfs_core::CompactionPolicy;
use swarmfs_storage::{CompactionConfig, CompactionOutcome, DocumentStore, MemoryCompactor};
use tempfile::TempDir;

fn pt_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    }
}

/// Arbitrary JSON values, a few levels deep. Floats are kept finite and
/// integral so the comparison is not at the mercy of float formatting.
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        "[a-zA-Z0-9 _\\-\u{e9}\u{4e2d}\"\\\\]{0,24}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z_]{1,8}", inner), 0..6)
                .prop_map(|pairs| Value::Object(pairs.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

proptest! {
    #![proptest_config(pt_config())]

    /// Whatever is written is exactly what is read back.
    #[test]
    fn prop_write_then_read_round_trips(value in arb_json()) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        let store = DocumentStore::default();
        store.write(&path, &value).unwrap();
        prop_assert_eq!(store.read(&path).unwrap(), Some(value));
    }

    /// keep_n retains exactly the last `n` entries, in their original order.
    #[test]
    fn prop_keep_n_preserves_tail_order(len in 0usize..40, n in 0usize..20) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("segment.json");
        let entries: Vec<Value> = (0..len).map(|i| json!({"seq": i})).collect();
        std::fs::write(&path, serde_json::to_vec(&entries).unwrap()).unwrap();

        let compactor = MemoryCompactor::new(
            CompactionConfig {
                max_entries: 0,
                policy: CompactionPolicy::KeepN { n },
                ..CompactionConfig::default()
            },
            DocumentStore::default(),
        );
        let outcome = compactor.compact(&path).unwrap();

        let kept: Vec<Value> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let expected_len = len.min(n);
        prop_assert_eq!(kept.len(), expected_len);
        prop_assert_eq!(&kept[..], &entries[len - expected_len..]);
        if len > 0 {
            prop_assert_eq!(outcome, CompactionOutcome::Compacted { before: len, after: expected_len });
        } else {
            prop_assert_eq!(outcome, CompactionOutcome::NotTriggered);
        }
    }
}
