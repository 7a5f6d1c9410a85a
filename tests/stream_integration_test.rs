//! End-to-end stream subsystem tests: lifecycle, offsets, retention,
//! consumer groups, and subscriptions, against both the memory and
//! SQLite repositories.

use std::sync::Arc;
use std::time::Duration;

use stratum::core::{Error, PayloadId};
use stratum::repository::{MemoryRepository, Repository, SqliteRepository};
use stratum::stream::{AppendItem, StreamManager};

fn item() -> AppendItem {
    AppendItem {
        payload_uuid: PayloadId::generate(),
        event_time_ms: None,
        duration_ns: None,
        tags: String::new(),
    }
}

fn memory_streams() -> Arc<StreamManager> {
    Arc::new(StreamManager::new(Arc::new(MemoryRepository::new())))
}

async fn sqlite_streams() -> Arc<StreamManager> {
    let repository: Arc<dyn Repository> =
        Arc::new(SqliteRepository::open_in_memory().await.unwrap());
    Arc::new(StreamManager::new(repository))
}

async fn stream_lifecycle(streams: Arc<StreamManager>) {
    streams
        .create_stream("examples", "s", None, None)
        .await
        .unwrap();

    let first = streams.append("examples", "s", vec![item()]).await.unwrap();
    assert_eq!(first.first_offset, 0);
    assert_eq!(first.last_offset, 0);

    let batch = streams
        .append("examples", "s", vec![item(), item()])
        .await
        .unwrap();
    assert_eq!(batch.first_offset, 1);
    assert_eq!(batch.last_offset, 2);

    let entries = streams.read("examples", "s", 0, None, None).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.windows(2).all(|w| w[1].offset == w[0].offset + 1));

    streams
        .commit_offset("examples", "s", "g", 2)
        .await
        .unwrap();
    assert_eq!(
        streams.get_committed("examples", "s", "g").await.unwrap(),
        2
    );

    streams.delete_stream("examples", "s").await.unwrap();
    assert!(matches!(
        streams.read("examples", "s", 0, None, None).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stream_lifecycle_memory() {
    stream_lifecycle(memory_streams()).await;
}

#[tokio::test]
async fn test_stream_lifecycle_sqlite() {
    stream_lifecycle(sqlite_streams().await).await;
}

#[tokio::test]
async fn test_retention_window_of_two() {
    let streams = memory_streams();
    streams
        .create_stream("ns", "bounded", Some(2), None)
        .await
        .unwrap();

    for _ in 0..4 {
        streams.append("ns", "bounded", vec![item()]).await.unwrap();
    }

    // exactly the two newest entries survive, offsets preserved
    let entries = streams.read("ns", "bounded", 0, None, None).await.unwrap();
    let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![2, 3]);

    // groups that never committed read back 0
    assert_eq!(
        streams.get_committed("ns", "bounded", "fresh").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_retention_leaves_consumer_offsets_alone() {
    let streams = sqlite_streams().await;
    streams
        .create_stream("ns", "bounded", Some(1), None)
        .await
        .unwrap();
    streams.append("ns", "bounded", vec![item()]).await.unwrap();
    streams
        .commit_offset("ns", "bounded", "g", 0)
        .await
        .unwrap();

    for _ in 0..3 {
        streams.append("ns", "bounded", vec![item()]).await.unwrap();
    }
    assert_eq!(
        streams.get_committed("ns", "bounded", "g").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_offsets_continue_after_trim() {
    let streams = sqlite_streams().await;
    streams
        .create_stream("ns", "s", Some(2), None)
        .await
        .unwrap();
    for _ in 0..5 {
        streams.append("ns", "s", vec![item()]).await.unwrap();
    }
    let next = streams.append("ns", "s", vec![item()]).await.unwrap();
    assert_eq!(next.first_offset, 5);
}

#[tokio::test]
async fn test_range_and_filtered_read() {
    let streams = memory_streams();
    streams.create_stream("ns", "s", None, None).await.unwrap();
    streams
        .append("ns", "s", vec![item(), item(), item(), item(), item()])
        .await
        .unwrap();

    let range = streams.get_range("ns", "s", 1, 3).await.unwrap();
    assert_eq!(
        range.iter().map(|e| e.offset).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let capped = streams.read("ns", "s", 0, Some(2), None).await.unwrap();
    assert_eq!(capped.len(), 2);
}

#[tokio::test]
async fn test_subscription_follows_appends_and_delete() {
    let streams = memory_streams();
    streams.create_stream("ns", "live", None, None).await.unwrap();
    streams.append("ns", "live", vec![item()]).await.unwrap();

    let mut feed = streams.subscribe("ns", "live", 0, 16).await.unwrap();
    assert_eq!(feed.recv().await.unwrap().offset, 0);

    let streams_clone = streams.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        streams_clone
            .append("ns", "live", vec![item()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        streams_clone.delete_stream("ns", "live").await.unwrap();
    });

    let second = tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.offset, 1);

    // after the delete the feed terminates without error
    let end = tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .unwrap();
    assert!(end.is_none());
}
