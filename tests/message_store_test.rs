//! Backlog store invariants exercised through a real database file.

mod support;

use corral::database::{DatabaseConnection, DatabasePath};
use corral::store::{EnqueueOutcome, MessageStore};
use std::collections::HashSet;
use support::{agent, mid};
use tempfile::TempDir;

async fn file_store() -> (MessageStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let path = DatabasePath::new(dir.path().join("message_backlog.db")).unwrap();
    let conn = DatabaseConnection::open(path).await.unwrap();
    (MessageStore::new(conn), dir)
}

#[tokio::test]
async fn claims_replay_enqueue_order_exactly() {
    let (store, _dir) = file_store().await;
    let alpha = agent("alpha");

    let ids: Vec<String> = (0..20).map(|i| format!("m{i:02}")).collect();
    for id in &ids {
        store
            .enqueue(&mid(id), &alpha, "bob", &format!("payload {id}"))
            .await
            .unwrap();
        // Every id enqueued twice; the duplicate must not reorder or dupe.
        assert_eq!(
            store.enqueue(&mid(id), &alpha, "bob", "dup").await.unwrap(),
            EnqueueOutcome::Duplicate
        );
    }

    let mut claimed = Vec::new();
    while let Some(m) = store.claim(&alpha).await.unwrap() {
        claimed.push(m.id.to_string());
        store.complete(&m.id, &alpha).await.unwrap();
    }
    assert_eq!(claimed, ids, "claims must replay enqueue order, no loss");
}

#[tokio::test]
async fn concurrent_claimers_never_share_a_row() {
    let (store, _dir) = file_store().await;
    let alpha = agent("alpha");
    for i in 0..10 {
        store
            .enqueue(&mid(&format!("m{i}")), &alpha, "bob", "x")
            .await
            .unwrap();
    }

    // Two workers race the claim path the way a mistakenly doubled
    // processor would. Between them they must see each row exactly once.
    let worker = |store: MessageStore, alpha: corral::domain_types::AgentName| async move {
        let mut seen = Vec::new();
        loop {
            match store.claim(&alpha).await {
                Ok(Some(m)) => {
                    seen.push(m.id.to_string());
                    store.complete(&m.id, &alpha).await.unwrap();
                }
                Ok(None) => {
                    if store.stats(&alpha).await.unwrap().pending == 0 {
                        return seen;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                }
                Err(e) if e.is_transient() => {
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                }
                Err(e) => panic!("claim failed: {e}"),
            }
        }
    };

    let (a, b) = tokio::join!(
        worker(store.clone(), alpha.clone()),
        worker(store.clone(), alpha.clone())
    );

    let mut all: Vec<String> = a.into_iter().chain(b).collect();
    all.sort();
    let distinct: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 10, "every row claimed");
    assert_eq!(distinct.len(), 10, "no row claimed twice");
}

#[tokio::test]
async fn round_trip_leaves_only_a_tombstone() {
    let (store, _dir) = file_store().await;
    let alpha = agent("alpha");

    store.enqueue(&mid("m1"), &alpha, "bob", "hi").await.unwrap();
    let m = store.claim(&alpha).await.unwrap().unwrap();
    store.complete(&m.id, &alpha).await.unwrap();

    let stats = store.stats(&alpha).await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.completed_last_24h, 1);
    assert!(stats.avg_process_ms.is_some());

    // The tombstone still dedups a redelivery.
    assert_eq!(
        store.enqueue(&mid("m1"), &alpha, "bob", "hi").await.unwrap(),
        EnqueueOutcome::Duplicate
    );
}

#[tokio::test]
async fn agents_have_independent_queues() {
    let (store, _dir) = file_store().await;
    let alpha = agent("alpha");
    let beta = agent("beta");

    // One bus message addressed to both agents: two independent rows.
    for recipient in [&alpha, &beta] {
        store
            .enqueue(&mid("shared"), recipient, "bob", "hi both")
            .await
            .unwrap();
    }

    let claimed_alpha = store.claim(&alpha).await.unwrap().unwrap();
    store.complete(&claimed_alpha.id, &alpha).await.unwrap();

    // Beta's copy is untouched by alpha's lifecycle.
    let beta_copy = store.peek_next(&beta).await.unwrap().unwrap();
    assert_eq!(beta_copy.id.as_str(), "shared");
}
