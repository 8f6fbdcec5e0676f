use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rentwatch::config::QueueConfig;
use rentwatch::models::NewQueueItem;
use rentwatch::WorkQueue;

use super::*;

fn queue_config(batch_size: usize) -> QueueConfig {
    QueueConfig {
        batch_size,
        retry_delay_secs: 0,
        ..QueueConfig::default()
    }
}

#[tokio::test]
async fn test_concurrent_dispatchers_never_share_items() -> anyhow::Result<()> {
    let (_dir, pool) = create_test_db().await?;
    let queue = Arc::new(WorkQueue::new(pool, queue_config(7), HashMap::new()));

    let sources = ["immowelt", "wg-gesucht", "kleinanzeigen", "immoscout"];
    let items: Vec<NewQueueItem> = (0..200)
        .map(|n| {
            let source = sources[n % sources.len()];
            NewQueueItem::detail(source, &detail_url(source, n as u32))
        })
        .collect();
    assert_eq!(queue.enqueue(items).await?, 200);

    let workers = (0..8).map(|_| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = queue.next_batch(None).await?;
                if batch.is_empty() {
                    return Ok::<_, rentwatch::AppError>(claimed);
                }
                claimed.extend(batch.into_iter().map(|item| item.id));
            }
        })
    });

    let mut seen = HashSet::new();
    for result in futures::future::join_all(workers).await {
        for id in result?? {
            assert!(seen.insert(id), "item {} was claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 200);

    let stats = queue.stats(Duration::from_secs(60)).await?;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 200);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_fair_share_batches_are_disjoint() -> anyhow::Result<()> {
    let (_dir, pool) = create_test_db().await?;
    let queue = Arc::new(WorkQueue::new(pool, queue_config(10), HashMap::new()));

    let mut items = Vec::new();
    for n in 0..30 {
        items.push(NewQueueItem::detail("immowelt", &detail_url("immowelt", n)));
    }
    for n in 0..4 {
        items.push(NewQueueItem::detail("wg-gesucht", &detail_url("wg-gesucht", n)));
    }
    queue.enqueue(items).await?;

    let (a, b) = tokio::join!(queue.by_fair_share(), queue.by_fair_share());
    let (a, b) = (a?, b?);

    let ids = |batches: &HashMap<String, Vec<rentwatch::models::QueueItem>>| -> Vec<i64> {
        batches.values().flatten().map(|item| item.id).collect()
    };
    let mut seen = HashSet::new();
    for id in ids(&a).into_iter().chain(ids(&b)) {
        assert!(seen.insert(id), "item {} was claimed twice", id);
    }

    // no batch exceeds the configured size, and no source takes more than its share
    for batches in [&a, &b] {
        assert!(batches.values().map(Vec::len).sum::<usize>() <= 10);
        assert!(batches.values().all(|items| items.len() <= 5));
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_enqueue_of_same_target_keeps_one_row() -> anyhow::Result<()> {
    let (_dir, pool) = create_test_db().await?;
    let queue = Arc::new(WorkQueue::new(pool, queue_config(10), HashMap::new()));
    let url = detail_url("immowelt", 1);

    let producers = (0..10i64).map(|priority| {
        let queue = Arc::clone(&queue);
        let url = url.clone();
        async move {
            queue
                .enqueue(vec![NewQueueItem::detail("immowelt", &url).with_priority(priority * 10)])
                .await
        }
    });
    for result in futures::future::join_all(producers).await {
        result?;
    }

    let stats = queue.stats(Duration::from_secs(60)).await?;
    assert_eq!(stats.pending, 1);

    let item = queue.find("immowelt", &url).await?.expect("queued item");
    assert_eq!(item.priority, 90);
    Ok(())
}

#[tokio::test]
async fn test_release_in_flight_returns_claims_without_charging_attempts() -> anyhow::Result<()> {
    let (_dir, pool) = create_test_db().await?;
    let queue = WorkQueue::new(pool, queue_config(5), HashMap::new());
    queue
        .enqueue((0..5).map(|n| NewQueueItem::detail("immowelt", &detail_url("immowelt", n))).collect())
        .await?;

    let claimed = queue.next_batch(None).await?;
    assert_eq!(claimed.len(), 5);
    assert_eq!(queue.release_in_flight().await?, 5);

    let again = queue.next_batch(None).await?;
    assert_eq!(again.len(), 5);
    assert!(again.iter().all(|item| item.attempts == 0));
    Ok(())
}
