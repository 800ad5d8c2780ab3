//! Property tests for the fold, the merge window and undo.

use cms_collab::operator::{fold, LogSource, Origin, Operator, Projection, SpliceToggleOperator};
use cms_collab::ops::{Operation, Transaction};
use cms_collab::queue::Queue;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

fn base() -> Value {
    json!({"list": [], "flags": {}})
}

fn queue() -> Queue {
    Queue::new("doc", "config", Duration::from_millis(500))
}

fn splice() -> impl Strategy<Value = Transaction> {
    let items = prop::collection::vec(0i64..100, 0..4);
    (0usize..8, 0usize..4, items).prop_map(|(index, remove, insert)| {
        Transaction::single(
            "list",
            Operation::splice(index, remove, insert.into_iter().map(Value::from).collect()),
        )
    })
}

fn toggle() -> impl Strategy<Value = Transaction> {
    let names = prop::sample::select(vec!["a", "b", "c"]);
    (names, prop::option::of(0i64..10)).prop_map(|(name, value)| {
        let value = value.map_or(Value::Null, Value::from);
        Transaction::single("flags", Operation::toggle(name, value))
    })
}

fn transaction() -> impl Strategy<Value = Transaction> {
    prop_oneof![splice(), toggle()]
}

fn root_edit() -> impl Strategy<Value = Transaction> {
    prop_oneof![
        (0usize..4, prop::collection::vec(0i64..100, 1..3)).prop_map(|(index, items)| {
            let items = items.into_iter().map(Value::from).collect();
            Transaction::single("", Operation::insert(index, items))
        }),
        (prop::sample::select(vec!["a", "b"]), 0i64..10)
            .prop_map(|(name, value)| Transaction::single("", Operation::toggle(name, value))),
    ]
}

fn apply_all(txns: &[Transaction]) -> Value {
    let mut state = base();
    for txn in txns {
        txn.apply(&mut state);
    }
    state
}

proptest! {
    #[test]
    fn prop_fold_is_deterministic(txns in prop::collection::vec(transaction(), 0..24)) {
        let q = queue();
        for txn in &txns {
            q.push(txn.clone());
        }
        let first = fold(&base(), &q as &dyn LogSource);
        let second =
            SpliceToggleOperator::new(base()).project(&q as &dyn LogSource, Origin::Update);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first, &apply_all(&txns));

        let projection = Projection::new(q.clone(), SpliceToggleOperator::new(base()));
        prop_assert_eq!(&*projection.state(), &first);
    }

    #[test]
    fn prop_merged_pushes_equal_sequential_application(
        prefix in prop::collection::vec(transaction(), 0..6),
        first in splice(),
        second in splice(),
    ) {
        let q = queue();
        for txn in &prefix {
            q.push(txn.clone());
        }
        let before = q.pending_len();
        let pushed_first = q.push_mergeable(first.clone());
        let pushed_second = q.push_mergeable(second.clone());

        let mut sequence = prefix.clone();
        sequence.push(first.clone());
        sequence.push(second.clone());
        prop_assert_eq!(fold(&base(), &q as &dyn LogSource), apply_all(&sequence));

        if pushed_first && pushed_second {
            prop_assert_eq!(q.pending_len(), before + 1);
        }
    }

    #[test]
    fn prop_undo_restores_pre_push_state(
        history in prop::collection::vec(transaction(), 0..12),
        txn in transaction(),
    ) {
        let mut mutator = queue().bound_mutate(base());
        for t in &history {
            mutator.push(t.clone());
        }
        let before = mutator.current();
        let recorded = mutator.tracker().undo_len();
        mutator.push(txn);
        if mutator.tracker().undo_len() > recorded {
            prop_assert!(mutator.undo());
        }
        prop_assert_eq!(mutator.current(), before);
    }

    #[test]
    fn prop_undo_everything_returns_to_base(
        history in prop::collection::vec(transaction(), 0..12),
    ) {
        let mut mutator = queue().bound_mutate(base());
        for t in &history {
            mutator.push(t.clone());
        }
        while mutator.undo() {}
        prop_assert_eq!(mutator.current(), base());
    }

    #[test]
    fn prop_undo_everything_restores_null_nodes(
        nested in any::<bool>(),
        history in prop::collection::vec(prop_oneof![transaction(), root_edit()], 0..10),
    ) {
        let start = if nested { json!({"list": null, "flags": null}) } else { Value::Null };
        let mut mutator = queue().bound_mutate(start.clone());
        for t in &history {
            mutator.push(t.clone());
        }
        while mutator.undo() {}
        prop_assert_eq!(mutator.current(), start);
    }
}

#[test]
fn test_scenario_merge_window_splits_after_timeout() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    runtime.block_on(async {
        let q = queue();
        let key = |index: usize, ch: &str| {
            Transaction::single("title", Operation::insert(index, vec![json!(ch)]))
        };

        q.push_mergeable(key(0, "H"));
        tokio::time::advance(Duration::from_millis(200)).await;
        q.push_mergeable(key(1, "i"));
        assert_eq!(q.pending_len(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        q.push_mergeable(key(2, "!"));
        assert_eq!(q.pending_len(), 2);

        let state = fold(&json!({"title": []}), &q as &dyn LogSource);
        assert_eq!(state, json!({"title": ["H", "i", "!"]}));
    });
}
