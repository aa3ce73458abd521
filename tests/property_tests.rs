//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::RecordingSink;
use mirror_sync::mapping::is_plain_identifier;
use mirror_sync::origin::SubscriptionFilter;
use mirror_sync::resilience::Backoff;
use mirror_sync::{deduplicate_actions, ChangeAction, Priority, RateLimiter, RetryPolicy, TracingAlerter, UpdateQueue};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Strategies
// =============================================================================

/// Small id pools so generated actions collide often.
fn action_strategy() -> impl Strategy<Value = ChangeAction> {
    (
        prop::sample::select(vec!["appA", "appB"]),
        prop::sample::select(vec!["tbl1", "tbl2"]),
        prop::sample::select(vec!["rec1", "rec2", "rec3"]),
        prop::option::of(prop::collection::btree_set(
            prop::sample::select(vec!["fld1", "fld2", "fld3", "fld4"]),
            1..3,
        )),
        any::<bool>(),
    )
        .prop_map(|(base, table, record, fields, is_delete)| {
            let action = if is_delete {
                ChangeAction::delete(base, table, record)
            } else {
                ChangeAction::upsert(base, table, record)
            };
            match fields {
                Some(fields) => action.with_fields(fields),
                None => action,
            }
        })
}

type Key = (String, String, String);

fn by_key(actions: &[ChangeAction]) -> BTreeMap<Key, (Option<BTreeSet<String>>, bool)> {
    actions
        .iter()
        .map(|a| {
            (
                (a.base_id.clone(), a.table_id.clone(), a.record_id.clone()),
                (a.field_ids.clone(), a.is_delete),
            )
        })
        .collect()
}

// =============================================================================
// Deduplication Properties
// =============================================================================

proptest! {
    /// Deduplicating twice changes nothing
    #[test]
    fn dedup_is_idempotent(actions in prop::collection::vec(action_strategy(), 0..40)) {
        let once = deduplicate_actions(actions);
        let twice = deduplicate_actions(once.clone());
        prop_assert_eq!(by_key(&once), by_key(&twice));
        prop_assert_eq!(once.len(), twice.len());
    }

    /// Output has exactly one action per distinct record key
    #[test]
    fn dedup_yields_one_action_per_key(actions in prop::collection::vec(action_strategy(), 0..40)) {
        let keys: BTreeSet<Key> = actions
            .iter()
            .map(|a| (a.base_id.clone(), a.table_id.clone(), a.record_id.clone()))
            .collect();
        let deduped = deduplicate_actions(actions);
        prop_assert_eq!(deduped.len(), keys.len());
    }

    /// Delete flag is the OR of every input for the key
    #[test]
    fn dedup_delete_flag_is_or(actions in prop::collection::vec(action_strategy(), 1..40)) {
        let deduped = by_key(&deduplicate_actions(actions.clone()));
        for (key, (_, is_delete)) in &deduped {
            let expected = actions
                .iter()
                .filter(|a| (&a.base_id, &a.table_id, &a.record_id) == (&key.0, &key.1, &key.2))
                .any(|a| a.is_delete);
            prop_assert_eq!(*is_delete, expected);
        }
    }

    /// Field set is the union of present sets; absent only if all were absent
    #[test]
    fn dedup_field_ids_are_union(actions in prop::collection::vec(action_strategy(), 1..40)) {
        let deduped = by_key(&deduplicate_actions(actions.clone()));
        for (key, (field_ids, _)) in &deduped {
            let inputs: Vec<&ChangeAction> = actions
                .iter()
                .filter(|a| (&a.base_id, &a.table_id, &a.record_id) == (&key.0, &key.1, &key.2))
                .collect();
            let present: Vec<&BTreeSet<String>> = inputs.iter().filter_map(|a| a.field_ids.as_ref()).collect();
            if present.is_empty() {
                prop_assert!(field_ids.is_none());
            } else {
                let union: BTreeSet<String> = present.into_iter().flatten().cloned().collect();
                prop_assert_eq!(field_ids.as_ref(), Some(&union));
            }
        }
    }

    /// Output keeps first-seen key order
    #[test]
    fn dedup_preserves_first_seen_order(actions in prop::collection::vec(action_strategy(), 0..40)) {
        let mut seen = BTreeSet::new();
        let expected: Vec<Key> = actions
            .iter()
            .map(|a| (a.base_id.clone(), a.table_id.clone(), a.record_id.clone()))
            .filter(|k| seen.insert(k.clone()))
            .collect();
        let got: Vec<Key> = deduplicate_actions(actions)
            .into_iter()
            .map(|a| (a.base_id, a.table_id, a.record_id))
            .collect();
        prop_assert_eq!(got, expected);
    }
}

#[test]
fn dedup_empty_is_empty() {
    assert!(deduplicate_actions(Vec::new()).is_empty());
}

#[test]
fn dedup_union_or_example() {
    let deduped = deduplicate_actions(vec![
        ChangeAction::upsert("b1", "t1", "r1").with_fields(["f1"]),
        ChangeAction::upsert("b1", "t1", "r1").with_fields(["f2"]),
        ChangeAction::delete("b1", "t1", "r1"),
    ]);

    assert_eq!(deduped.len(), 1);
    let merged = &deduped[0];
    assert!(merged.is_delete);
    assert_eq!(
        merged.field_ids,
        Some(["f1", "f2"].iter().map(|s| s.to_string()).collect())
    );
}

// =============================================================================
// Update Queue Properties
// =============================================================================

const MAX_ATTEMPTS: u32 = 3;

fn push_strategy() -> impl Strategy<Value = Vec<(&'static str, bool)>> {
    prop::collection::vec(
        (prop::sample::select(vec!["r1", "r2", "r3", "r4", "r5", "r6"]), any::<bool>()),
        0..30,
    )
}

fn drain(pushes: &[(&'static str, bool)], failures: &HashMap<&'static str, usize>) -> RecordingSink {
    let queue = UpdateQueue::new(
        RetryPolicy::fixed(MAX_ATTEMPTS as usize, Duration::ZERO),
        Arc::new(TracingAlerter),
    );
    let sink = RecordingSink::default();
    for (record, times) in failures {
        sink.fail(record, *times);
    }
    for (record, high) in pushes {
        let priority = if *high { Priority::High } else { Priority::Low };
        queue.push(vec![ChangeAction::upsert("app", "tbl", *record)], priority);
    }

    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    // A failed entry waits for the next drain
    for _ in 0..=MAX_ATTEMPTS {
        runtime.block_on(queue.process(&sink));
    }
    assert!(queue.is_idle());
    sink
}

proptest! {
    /// Every pushed record is applied exactly once; pending entries merge
    #[test]
    fn queue_applies_each_record_once(pushes in push_strategy()) {
        let sink = drain(&pushes, &HashMap::new());
        let distinct: BTreeSet<&str> = pushes.iter().map(|(r, _)| *r).collect();
        let applied: Vec<String> = sink.applied().into_iter().map(|a| a.record_id).collect();
        let applied_set: BTreeSet<&str> = applied.iter().map(String::as_str).collect();
        prop_assert_eq!(applied.len(), distinct.len());
        prop_assert_eq!(applied_set, distinct);
    }

    /// Without failures, nothing that was ever pushed high is applied after
    /// a low-only record
    #[test]
    fn queue_drains_high_before_low(pushes in push_strategy()) {
        let sink = drain(&pushes, &HashMap::new());
        let high: BTreeSet<&str> = pushes.iter().filter(|(_, h)| *h).map(|(r, _)| *r).collect();
        let order: Vec<bool> = sink
            .applied()
            .iter()
            .map(|a| high.contains(a.record_id.as_str()))
            .collect();
        let first_low = order.iter().position(|h| !h).unwrap_or(order.len());
        prop_assert!(order[first_low..].iter().all(|h| !h));
    }

    /// Failures below the attempt limit never lose a record; failures at the
    /// limit drop it after exactly that many attempts
    #[test]
    fn queue_retries_until_limit(
        pushes in push_strategy(),
        failures in prop::collection::hash_map(
            prop::sample::select(vec!["r1", "r2", "r3", "r4", "r5", "r6"]),
            0usize..=3,
            0..4,
        ),
    ) {
        let sink = drain(&pushes, &failures);
        let distinct: BTreeSet<&str> = pushes.iter().map(|(r, _)| *r).collect();
        let applied: BTreeSet<String> = sink.applied().into_iter().map(|a| a.record_id).collect();
        let attempts = sink.attempts();

        for record in distinct {
            let fails = failures.get(record).copied().unwrap_or(0);
            let tries = attempts.iter().filter(|a| a.as_str() == record).count();
            if fails < MAX_ATTEMPTS as usize {
                prop_assert!(applied.contains(record));
                prop_assert_eq!(tries, fails + 1);
            } else {
                prop_assert!(!applied.contains(record));
                prop_assert_eq!(tries, MAX_ATTEMPTS as usize);
            }
        }
    }
}

// =============================================================================
// Rate Limiter Properties
// =============================================================================

proptest! {
    /// Within one window exactly `limit` calls are admitted and the last of
    /// them is flagged as the final slot
    #[test]
    fn limiter_admits_exactly_limit(limit in 1usize..50, extra in 1usize..20) {
        let limiter = RateLimiter::new(limit, Duration::from_secs(3600));

        for i in 1..=limit {
            let admission = limiter.try_acquire();
            prop_assert!(admission.allowed);
            prop_assert_eq!(admission.is_last_slot_before_limit, i == limit);
        }
        for _ in 0..extra {
            prop_assert!(!limiter.try_acquire().allowed);
        }
        prop_assert_eq!(limiter.in_flight(), limit);
    }
}

#[tokio::test(start_paused = true)]
async fn limiter_limit_one_spaces_second_acquire() {
    let limiter = RateLimiter::new(1, Duration::from_millis(500));
    let start = tokio::time::Instant::now();
    limiter.acquire().await;
    limiter.acquire().await;
    assert!(start.elapsed() >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn limiter_n_acquires_within_limit_do_not_wait() {
    let limiter = RateLimiter::new(5, Duration::from_secs(1));
    let start = tokio::time::Instant::now();
    for _ in 0..5 {
        limiter.acquire().await;
    }
    assert_eq!(start.elapsed(), Duration::ZERO);
}

// =============================================================================
// Retry Policy Properties
// =============================================================================

proptest! {
    /// Linear backoff grows by one step per attempt
    #[test]
    fn linear_backoff_is_attempt_times_step(step_ms in 1u64..10_000, attempt in 1usize..100) {
        let policy = RetryPolicy::linear(attempt + 1, Duration::from_millis(step_ms));
        prop_assert_eq!(
            policy.delay_for_attempt(attempt),
            Duration::from_millis(step_ms * attempt as u64)
        );
    }

    /// Exponential backoff never exceeds its cap, even for huge attempt counts
    #[test]
    fn exponential_backoff_respects_cap(attempt in 1usize..10_000, max_secs in 1u64..120) {
        let policy = RetryPolicy {
            max_attempts: attempt,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(max_secs),
                factor: 2.0,
            },
        };
        prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(max_secs));
    }
}

// =============================================================================
// Subscription Filter Properties
// =============================================================================

proptest! {
    /// A filter is always satisfied by itself
    #[test]
    fn filter_satisfied_by_itself(fields in prop::collection::btree_set("fld[A-Za-z0-9]{3,8}", 0..6)) {
        let filter = SubscriptionFilter::for_fields(&fields);
        prop_assert!(filter.is_satisfied_by(&filter));
    }

    /// A filter with a different allowlist never stands in
    #[test]
    fn filter_with_extra_field_not_adopted(
        fields in prop::collection::btree_set("fld[a-z]{4}", 1..6),
        extra in "fldX[0-9]{4}",
    ) {
        let desired = SubscriptionFilter::for_fields(&fields);
        let mut wider = fields.clone();
        wider.insert(extra);
        let existing = SubscriptionFilter::for_fields(&wider);
        prop_assert!(!desired.is_satisfied_by(&existing));
    }
}

// =============================================================================
// Identifier Properties
// =============================================================================

proptest! {
    /// Generated plain identifiers are accepted
    #[test]
    fn plain_identifiers_accepted(name in "[A-Za-z_][A-Za-z0-9_]{0,30}") {
        prop_assert!(is_plain_identifier(&name));
    }

    /// Anything containing a quote, space or semicolon is rejected
    #[test]
    fn identifiers_with_sql_punctuation_rejected(
        prefix in "[a-z]{1,5}",
        bad in prop::sample::select(vec!["\"", " ", ";", "-", "'"]),
        suffix in "[a-z]{0,5}",
    ) {
        let name = format!("{}{}{}", prefix, bad, suffix);
        prop_assert!(!is_plain_identifier(&name));
    }
}
