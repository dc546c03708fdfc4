use std::ops::Deref;
use std::time::Duration;

use relayq::config::TargetConfig;
use relayq::store::memory::MemoryStore;
use relayq::store::sqlite::SqliteStore;
use relayq::store::{DeliveryStatus, QueueStore, RetryPolicy};
use tempfile::TempDir;

struct TmpStore {
    store: SqliteStore,
    _tmpdir: TempDir,
}

impl Deref for TmpStore {
    type Target = SqliteStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

async fn setup() -> TmpStore {
    setup_with_retry(RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60))).await
}

async fn setup_with_retry(retry: RetryPolicy) -> TmpStore {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("relayq.db");

    TmpStore {
        store: SqliteStore::connect(path.to_str().unwrap(), retry)
            .await
            .unwrap(),
        _tmpdir: tmpdir,
    }
}

fn target(id: &str, enabled: bool, max_retries: u32) -> TargetConfig {
    TargetConfig {
        id: id.to_owned(),
        name: format!("{id}-name"),
        address: format!("127.0.0.1:7{}", id.len()),
        enabled,
        timeout_secs: 5,
        max_retries,
        batch_size: 100,
        priority: 100,
    }
}

#[tokio::test]
async fn save_message_fans_out_to_enabled_targets() {
    let store = setup().await;

    store
        .reconcile_targets(&[
            target("t1", true, 5),
            target("t2", true, 5),
            target("t3", false, 5),
        ])
        .await
        .unwrap();

    let first = store.save_message(b"one", Some("10.0.0.9:9100")).await.unwrap();
    let second = store.save_message(b"two", None).await.unwrap();

    for message_id in [first, second] {
        for enabled in ["t1", "t2"] {
            let delivery = store.delivery(message_id, enabled).await.unwrap().unwrap();
            assert_eq!(delivery.status, DeliveryStatus::Pending);
            assert_eq!(delivery.send_attempts, 0);
            assert_eq!(delivery.max_attempts, 5);
            assert!(delivery.next_retry_at.is_none());
        }
        assert!(store.delivery(message_id, "t3").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn delivery_snapshot_survives_target_rename() {
    let store = setup().await;

    store.reconcile_targets(&[target("t1", true, 3)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    let mut renamed = target("t1", true, 3);
    renamed.name = "renamed".to_owned();
    renamed.address = "10.9.9.9:1234".to_owned();
    store.reconcile_targets(&[renamed]).await.unwrap();

    let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
    assert_eq!(delivery.target_server_name, "t1-name");
    assert_eq!(delivery.target_address, "127.0.0.1:72");
}

#[tokio::test]
async fn sent_is_terminal() {
    let store = setup().await;

    store.reconcile_targets(&[target("t1", true, 5)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    store.mark_sending(message_id, "t1", 0).await.unwrap();
    let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sending);
    assert!(delivery.last_attempt_at.is_some());

    store.mark_sent(message_id, "t1").await.unwrap();
    let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sent);
    assert!(delivery.sent_at.is_some());
    assert!(delivery.last_error.is_none());

    // No transition leaves `sent`.
    store.mark_failed(message_id, "t1", 1, "late failure").await.unwrap();
    store.mark_sending(message_id, "t1", 0).await.unwrap();
    store.mark_sent(message_id, "t1").await.unwrap();

    let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sent);
    assert_eq!(delivery.send_attempts, 0);
    assert!(delivery.last_error.is_none());
}

#[tokio::test]
async fn message_is_stamped_processed_once_all_deliveries_sent() {
    let store = setup().await;

    store
        .reconcile_targets(&[target("t1", true, 5), target("t2", true, 5)])
        .await
        .unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    store.mark_sent(message_id, "t1").await.unwrap();
    let (processed_at, status): (Option<i64>, String) =
        sqlx::query_as("SELECT processed_at, status FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_one(store.db())
            .await
            .unwrap();
    assert!(processed_at.is_none());
    assert_eq!(status, "received");

    store.mark_sent(message_id, "t2").await.unwrap();
    let (processed_at, status): (Option<i64>, String) =
        sqlx::query_as("SELECT processed_at, status FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_one(store.db())
            .await
            .unwrap();
    assert!(processed_at.is_some());
    assert_eq!(status, "processed");
}

#[tokio::test]
async fn claim_is_fifo_and_respects_limit() {
    let store = setup().await;

    store.reconcile_targets(&[target("t1", true, 5)]).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(store.save_message(format!("m{i}").as_bytes(), None).await.unwrap());
    }

    let claimed = store.claim_pending("t1", 10).await.unwrap();
    assert_eq!(claimed.iter().map(|m| m.id).collect::<Vec<_>>(), ids);

    let limited = store.claim_pending("t1", 2).await.unwrap();
    assert_eq!(limited.iter().map(|m| m.id).collect::<Vec<_>>(), &ids[..2]);
}

#[tokio::test]
async fn failed_delivery_is_invisible_until_due() {
    let store =
        setup_with_retry(RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60))).await;

    store.reconcile_targets(&[target("t1", true, 5)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    store.mark_failed(message_id, "t1", 1, "refused").await.unwrap();

    // next_retry_at is a minute out; not claimable.
    assert!(store.claim_pending("t1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_delivery_is_claimable_once_due() {
    let store = setup_with_retry(RetryPolicy::new(Duration::ZERO, Duration::ZERO)).await;

    store.reconcile_targets(&[target("t1", true, 5)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    store.mark_failed(message_id, "t1", 1, "refused").await.unwrap();

    let claimed = store.claim_pending("t1", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, message_id);
}

#[tokio::test]
async fn interrupted_sending_rows_are_reclaimed() {
    let store = setup().await;

    store.reconcile_targets(&[target("t1", true, 5)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    // A crash between mark_sending and the send leaves the row like this.
    store.mark_sending(message_id, "t1", 0).await.unwrap();

    let claimed = store.claim_pending("t1", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, message_id);
}

#[tokio::test]
async fn retry_schedule_doubles_per_failure() {
    let store = setup().await;

    store.reconcile_targets(&[target("t1", true, 5)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    for (attempts, expected_gap) in [(1, 1), (2, 2), (3, 4), (4, 8), (5, 16)] {
        store
            .mark_failed(message_id, "t1", attempts, "refused")
            .await
            .unwrap();

        let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
        assert_eq!(delivery.send_attempts, attempts as i64);
        assert_eq!(delivery.error_count, attempts as i64);
        let gap = delivery.next_retry_at.unwrap() - delivery.last_attempt_at.unwrap();
        assert_eq!(gap, expected_gap, "failure #{attempts}");
    }
}

#[tokio::test]
async fn delivery_is_dead_lettered_at_max_attempts() {
    // Zero base interval keeps failed rows immediately due, so only the
    // attempts cap can make them terminal.
    let store = setup_with_retry(RetryPolicy::new(Duration::ZERO, Duration::ZERO)).await;

    store.reconcile_targets(&[target("t1", true, 3)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    for attempts in 1..=2 {
        store.mark_failed(message_id, "t1", attempts, "refused").await.unwrap();
        assert_eq!(store.claim_pending("t1", 10).await.unwrap().len(), 1);
    }

    store.mark_failed(message_id, "t1", 3, "refused").await.unwrap();
    assert!(store.claim_pending("t1", 10).await.unwrap().is_empty());

    let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.send_attempts, 3);
    assert_eq!(delivery.last_error.as_deref(), Some("refused"));
}

#[tokio::test]
async fn get_attempts_tracks_failures() {
    let store = setup().await;

    store.reconcile_targets(&[target("t1", true, 5)]).await.unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    assert_eq!(store.get_attempts(message_id, "t1").await.unwrap(), 0);

    store.mark_failed(message_id, "t1", 1, "refused").await.unwrap();
    assert_eq!(store.get_attempts(message_id, "t1").await.unwrap(), 1);

    // The "sending" sentinel zeroes the visible count; the real count is
    // whatever the next mark_failed writes.
    store.mark_sending(message_id, "t1", 0).await.unwrap();
    assert_eq!(store.get_attempts(message_id, "t1").await.unwrap(), 0);
}

#[tokio::test]
async fn claims_are_isolated_per_target() {
    let store = setup().await;

    store
        .reconcile_targets(&[target("t1", true, 5), target("t2", true, 5)])
        .await
        .unwrap();
    let message_id = store.save_message(b"payload", None).await.unwrap();

    store.mark_sent(message_id, "t1").await.unwrap();

    assert!(store.claim_pending("t1", 10).await.unwrap().is_empty());
    assert_eq!(store.claim_pending("t2", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let store = setup().await;

    let configured = vec![target("t1", true, 5), target("t2", true, 3)];

    store.reconcile_targets(&configured).await.unwrap();
    let first = store.list_enabled_targets().await.unwrap();

    store.reconcile_targets(&configured).await.unwrap();
    let second = store.list_enabled_targets().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn reconcile_updates_and_soft_disables() {
    let store = setup().await;

    store
        .reconcile_targets(&[target("t1", true, 5), target("t2", true, 5)])
        .await
        .unwrap();

    let mut changed = target("t1", true, 9);
    changed.address = "10.1.1.1:9999".to_owned();
    store.reconcile_targets(&[changed]).await.unwrap();

    let enabled = store.list_enabled_targets().await.unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].id, "t1");
    assert_eq!(enabled[0].address, "10.1.1.1:9999");
    assert_eq!(enabled[0].max_retries, 9);

    // t2 is disabled, never deleted: bringing it back re-enables the same row.
    store
        .reconcile_targets(&[target("t1", true, 9), target("t2", true, 5)])
        .await
        .unwrap();
    let enabled = store.list_enabled_targets().await.unwrap();
    assert_eq!(enabled.len(), 2);
}

#[tokio::test]
async fn targets_are_ordered_by_priority() {
    let store = setup().await;

    let mut low = target("low", true, 5);
    low.priority = 200;
    let mut high = target("high", true, 5);
    high.priority = 1;

    store.reconcile_targets(&[low, high]).await.unwrap();

    let enabled = store.list_enabled_targets().await.unwrap();
    assert_eq!(
        enabled.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
        vec!["high", "low"]
    );
}

#[tokio::test]
async fn memory_store_has_the_same_ledger_semantics() {
    let store =
        MemoryStore::new(RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60)));

    store
        .reconcile_targets(&[target("t1", true, 2), target("t2", false, 2)])
        .await
        .unwrap();

    let message_id = store.save_message(b"payload", Some("src")).await.unwrap();
    assert!(store.delivery(message_id, "t2").await.unwrap().is_none());

    let claimed = store.claim_pending("t1", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].original_data, b"payload");

    store.mark_sending(message_id, "t1", 0).await.unwrap();
    store.mark_failed(message_id, "t1", 1, "refused").await.unwrap();
    assert_eq!(store.get_attempts(message_id, "t1").await.unwrap(), 1);
    assert!(store.claim_pending("t1", 10).await.unwrap().is_empty());

    store.mark_sent(message_id, "t1").await.unwrap();
    let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sent);

    store.mark_failed(message_id, "t1", 2, "late").await.unwrap();
    let delivery = store.delivery(message_id, "t1").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sent);
}
