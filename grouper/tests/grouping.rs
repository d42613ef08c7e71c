use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use common_locks::MemoryLockStore;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

use grouper::diff::{merge, Delta};
use grouper::hashing::group_hash;
use grouper::unsafe_fields::decode_unsafe_fields;
use grouper::{worker_names, Grouper, GrouperConfig, GroupTask, MemoryEventStore};
use worker_core::broker::Broker;
use worker_core::{InMemoryBroker, Publisher, Registry, TaskHandler, Worker, WorkerConfig, WorkerError};

const PROJECT: &str = "507f1f77bcf86cd799439011";
const CATCHER: &str = "errors/javascript";

struct Fixture {
    store: Arc<MemoryEventStore>,
    broker: Arc<InMemoryBroker>,
    grouper: Arc<Grouper>,
}

fn fixture_with(config: &GrouperConfig) -> Fixture {
    let store = Arc::new(MemoryEventStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let locks = Arc::new(MemoryLockStore::new());
    let registry = Registry::new().with_route(worker_names::NOTIFIER, worker_names::NOTIFIER);
    let publisher = Publisher::new(broker.clone(), registry);
    let grouper = Arc::new(Grouper::new(store.clone(), locks, publisher, config));
    Fixture {
        store,
        broker,
        grouper,
    }
}

fn fixture() -> Fixture {
    fixture_with(&GrouperConfig::for_tests())
}

fn hash_of(title: &str) -> String {
    group_hash(&GrouperConfig::for_tests().event_secret, CATCHER, title)
}

fn task_with_event(event: Value) -> GroupTask {
    serde_json::from_value(json!({
        "projectId": PROJECT,
        "catcherType": CATCHER,
        "event": event,
    }))
    .unwrap()
}

fn task(title: &str, user: Option<&str>, timestamp: i64) -> GroupTask {
    let mut event = json!({ "title": title, "timestamp": timestamp });
    if let Some(id) = user {
        event["user"] = json!({ "id": id });
    }
    task_with_event(event)
}

#[tokio::test]
async fn first_occurrence_creates_a_grouped_event() {
    let f = fixture();

    f.grouper
        .handle(task("TypeError: x is undefined", Some("u1"), 1_700_000_000))
        .await
        .unwrap();

    let hash = hash_of("TypeError: x is undefined");
    let event = f.store.event(PROJECT, &hash).expect("event was stored");
    assert_eq!(event.total_count, 1);
    assert_eq!(event.catcher_type, CATCHER);
    assert!(event.visited_users.contains("u1"));
    assert_eq!(event.payload["title"], "TypeError: x is undefined");
    assert!(f.store.repetitions(PROJECT, &hash).is_empty());
}

#[tokio::test]
async fn repeats_yield_one_group_and_n_minus_one_repetitions() {
    let f = fixture();
    let n = 5;

    for _ in 0..n {
        f.grouper
            .handle(task("boom", None, 1_700_000_000))
            .await
            .unwrap();
    }

    let hash = hash_of("boom");
    let event = f.store.event(PROJECT, &hash).unwrap();
    assert_eq!(event.total_count, n);
    assert_eq!(f.store.repetitions(PROJECT, &hash).len(), n as usize - 1);
}

#[tokio::test]
async fn visited_users_grow_only_for_unseen_user_ids() {
    let f = fixture();
    let hash = hash_of("boom");

    f.grouper
        .handle(task("boom", Some("u1"), 1_700_000_000))
        .await
        .unwrap();
    let event = f.store.event(PROJECT, &hash).unwrap();
    assert_eq!(event.total_count, 1);
    assert_eq!(event.visited_users.len(), 1);

    f.grouper
        .handle(task("boom", Some("u2"), 1_700_000_100))
        .await
        .unwrap();
    let event = f.store.event(PROJECT, &hash).unwrap();
    assert_eq!(event.total_count, 2);
    assert_eq!(event.visited_users.len(), 2);
    assert_eq!(f.store.repetitions(PROJECT, &hash).len(), 1);

    // u1 again: count grows, the user set does not.
    f.grouper
        .handle(task("boom", Some("u1"), 1_700_000_200))
        .await
        .unwrap();
    let event = f.store.event(PROJECT, &hash).unwrap();
    assert_eq!(event.total_count, 3);
    assert_eq!(event.visited_users.len(), 2);
    assert_eq!(f.store.repetitions(PROJECT, &hash).len(), 2);
}

#[tokio::test]
async fn concurrent_occurrences_count_each_user_exactly_once() {
    let f = fixture();
    let k = 8;

    let handles: Vec<_> = (0..k)
        .map(|i| {
            let grouper = f.grouper.clone();
            tokio::spawn(async move {
                grouper
                    .handle(task("boom", Some(&format!("user-{i}")), 1_700_000_000))
                    .await
            })
        })
        .collect();
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    let hash = hash_of("boom");
    let event = f.store.event(PROJECT, &hash).unwrap();
    assert_eq!(event.total_count, k);
    assert_eq!(event.visited_users.len(), k as usize);
    assert_eq!(f.store.repetitions(PROJECT, &hash).len(), k as usize - 1);
}

#[tokio::test]
async fn daily_buckets_conserve_the_total_count() {
    let f = fixture();
    let day = 86_400;
    let monday = 1_700_006_400;

    // Three on one day, two on the next, one a week later.
    for ts in [
        monday,
        monday + 60,
        monday + 120,
        monday + day,
        monday + day + 60,
        monday + 7 * day,
    ] {
        f.grouper.handle(task("boom", None, ts)).await.unwrap();
    }

    let hash = hash_of("boom");
    let event = f.store.event(PROJECT, &hash).unwrap();
    let buckets = f.store.daily_buckets(PROJECT, &hash);

    assert_eq!(buckets.len(), 3);
    assert_eq!(buckets[0].count, 3);
    assert_eq!(buckets[1].count, 2);
    assert_eq!(buckets[2].count, 1);
    assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), event.total_count);
    assert_eq!(buckets[0].last_timestamp, monday + 120);
}

#[tokio::test]
async fn repetition_deltas_reconstruct_the_repeat_payload() {
    let f = fixture();

    f.grouper
        .handle(task_with_event(json!({
            "title": "boom",
            "timestamp": 1_700_000_000,
            "line": 10,
        })))
        .await
        .unwrap();
    f.grouper
        .handle(task_with_event(json!({
            "title": "boom",
            "timestamp": 1_700_000_100,
            "line": 11,
            "column": 4,
        })))
        .await
        .unwrap();

    let hash = hash_of("boom");
    let original = f.store.event(PROJECT, &hash).unwrap().payload;
    let repetitions = f.store.repetitions(PROJECT, &hash);
    assert_eq!(repetitions.len(), 1);

    let reconstructed = merge(&original, &repetitions[0].delta);
    assert_json_eq!(
        reconstructed,
        json!({
            "title": "boom",
            "timestamp": 1_700_000_100,
            "line": 11,
            "column": 4,
        })
    );
}

#[tokio::test]
async fn out_of_range_timestamps_fail_before_any_write() {
    let f = fixture();
    f.grouper
        .handle(task("boom", None, 1_700_000_000))
        .await
        .unwrap();

    let err = f
        .grouper
        .handle(task("boom", None, i64::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::NonCritical { .. }));

    // The rejected occurrence left no trace: count, repetitions and daily
    // buckets still agree.
    let hash = hash_of("boom");
    let event = f.store.event(PROJECT, &hash).unwrap();
    assert_eq!(event.total_count, 1);
    assert!(f.store.repetitions(PROJECT, &hash).is_empty());
    let buckets = f.store.daily_buckets(PROJECT, &hash);
    assert_eq!(
        buckets.iter().map(|b| b.count).sum::<u64>(),
        event.total_count
    );
}

#[tokio::test]
async fn similar_titles_fold_into_the_existing_group() {
    let f = fixture();

    f.grouper
        .handle(task("TypeError: x is undefined", Some("u1"), 1_700_000_000))
        .await
        .unwrap();
    f.grouper
        .handle(task("TypeError: y is undefined", Some("u2"), 1_700_000_100))
        .await
        .unwrap();

    // The retitled occurrence joined the original group instead of
    // creating one under its own hash.
    let original_hash = hash_of("TypeError: x is undefined");
    assert!(f.store.event(PROJECT, &hash_of("TypeError: y is undefined")).is_none());
    let event = f.store.event(PROJECT, &original_hash).unwrap();
    assert_eq!(event.total_count, 2);
    assert_eq!(event.visited_users.len(), 2);
    assert_eq!(f.store.repetitions(PROJECT, &original_hash).len(), 1);
}

#[tokio::test]
async fn dissimilar_titles_start_their_own_group() {
    let f = fixture();

    f.grouper
        .handle(task("TypeError: x is undefined", None, 1_700_000_000))
        .await
        .unwrap();
    f.grouper
        .handle(task("Segfault in renderer", None, 1_700_000_100))
        .await
        .unwrap();

    assert!(f.store.event(PROJECT, &hash_of("TypeError: x is undefined")).is_some());
    let second = f
        .store
        .event(PROJECT, &hash_of("Segfault in renderer"))
        .unwrap();
    assert_eq!(second.total_count, 1);
}

#[tokio::test]
async fn context_deltas_are_stored_encoded() {
    let f = fixture();

    f.grouper
        .handle(task_with_event(json!({
            "title": "boom",
            "timestamp": 1_700_000_000,
            "context": {"build": "a1"},
        })))
        .await
        .unwrap();
    f.grouper
        .handle(task_with_event(json!({
            "title": "boom",
            "timestamp": 1_700_000_100,
            "context": {"build": "a2", "user.flag": true},
        })))
        .await
        .unwrap();

    let hash = hash_of("boom");
    let repetitions = f.store.repetitions(PROJECT, &hash);
    assert_eq!(repetitions.len(), 1);
    let Delta::Record(entries) = &repetitions[0].delta else {
        panic!("expected a record delta");
    };
    assert!(matches!(entries.get("context"), Some(Delta::Encoded(_))));

    // The encoded entry still reconstructs the repeat's context.
    let mut original = f.store.event(PROJECT, &hash).unwrap().payload;
    decode_unsafe_fields(&mut original);
    let reconstructed = merge(&original, &repetitions[0].delta);
    assert_eq!(reconstructed["context"]["build"], "a2");
    assert_eq!(reconstructed["context"]["user.flag"], true);
}

#[tokio::test]
async fn context_is_scrubbed_and_stored_as_a_string() {
    let f = fixture();

    f.grouper
        .handle(task_with_event(json!({
            "title": "boom",
            "timestamp": 1_700_000_000,
            "context": {
                "password": "hunter2",
                "card": "4111 1111 1111 1111",
                "user.locale": "en",
            },
        })))
        .await
        .unwrap();

    let hash = hash_of("boom");
    let stored = f.store.event(PROJECT, &hash).unwrap().payload;
    let context_raw = stored["context"].as_str().expect("context is encoded");
    let context: Value = serde_json::from_str(context_raw).unwrap();

    assert_eq!(context["password"], "[filtered]");
    assert_eq!(context["card"], "[filtered]");
    assert_eq!(context["user.locale"], "en");
}

#[tokio::test]
async fn notifier_handoff_carries_the_new_flag() {
    let f = fixture();

    f.grouper
        .handle(task("boom", None, 1_700_000_000))
        .await
        .unwrap();
    f.grouper
        .handle(task("boom", None, 1_700_000_100))
        .await
        .unwrap();

    let mut sub = f.broker.consume(worker_names::NOTIFIER, 10).await.unwrap();
    let first: Value =
        serde_json::from_slice(&sub.deliveries.recv().await.unwrap().payload).unwrap();
    let second: Value =
        serde_json::from_slice(&sub.deliveries.recv().await.unwrap().payload).unwrap();

    assert_eq!(first["new"], true);
    assert_eq!(first["projectId"], PROJECT);
    assert_eq!(first["catcherType"], CATCHER);
    assert_eq!(first["payload"]["title"], "boom");
    assert_eq!(second["new"], false);
}

#[tokio::test]
async fn notifier_handoff_can_be_disabled() {
    let mut config = GrouperConfig::for_tests();
    config.notifier_enabled = false;
    let f = fixture_with(&config);

    f.grouper
        .handle(task("boom", None, 1_700_000_000))
        .await
        .unwrap();

    assert_eq!(f.broker.queue_len(worker_names::NOTIFIER), 0);
}

#[tokio::test]
async fn invalid_project_ids_are_non_critical() {
    let f = fixture();
    let mut bad = task("boom", None, 1_700_000_000);
    bad.project_id = "not-an-id".to_string();

    let err = f.grouper.handle(bad).await.unwrap_err();
    assert!(matches!(err, WorkerError::NonCritical { .. }));
}

#[tokio::test]
async fn store_outages_are_critical() {
    let f = fixture();
    f.store.set_unavailable(true);

    let err = f
        .grouper
        .handle(task("boom", None, 1_700_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Critical { .. }));
}

#[tokio::test]
async fn grouper_processes_tasks_end_to_end_through_the_worker() {
    let f = fixture();
    let worker = Worker::new(
        worker_names::GROUPER,
        f.broker.clone(),
        Registry::new(),
        f.grouper.clone(),
        &WorkerConfig::for_tests(2),
    );

    f.broker.declare_queue(worker_names::GROUPER).await.unwrap();
    f.broker
        .publish(
            worker_names::GROUPER,
            serde_json::to_vec(&task("boom", Some("u1"), 1_700_000_000)).unwrap(),
        )
        .await
        .unwrap();

    worker.start().await.unwrap();
    let hash = hash_of("boom");
    timeout(Duration::from_secs(5), async {
        while f.store.event(PROJECT, &hash).is_none() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event was not stored in time");
    worker.finish().await.unwrap();

    let event = f.store.event(PROJECT, &hash).unwrap();
    assert_eq!(event.total_count, 1);
    assert!(event.visited_users.contains("u1"));
    assert_eq!(f.broker.queue_len(worker_names::NOTIFIER), 1);
}
