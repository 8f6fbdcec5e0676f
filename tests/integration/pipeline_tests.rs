use std::sync::atomic::Ordering;
use std::time::Duration;

use rentwatch::coordinator::CoordinatorState;
use rentwatch::events::HealthWarningKind;
use rentwatch::models::{NewQueueItem, QueueStatus, UserPreferenceProfile};
use rentwatch::store::{ListingStore, MatchStore};

use super::*;

#[tokio::test]
async fn test_discovery_to_matches() -> anyhow::Result<()> {
    let system = create_test_system(get_test_config(&["immowelt", "wg-gesucht"])).await?;
    system.site.publish("immowelt", &[1, 2, 3], 800.0);
    system.site.publish("wg-gesucht", &[10, 11], 1600.0);

    let mut alice = UserPreferenceProfile::new("alice");
    alice.max_rent = Some(1000.0);
    alice.min_match_score = Some(80);
    system.store.save_profile(&alice, true).await?;

    let discovery = system.coordinator.run_discovery_cycle().await?;
    assert_eq!(discovery.enqueued, 2);

    let search = system.coordinator.run_update_cycle().await?;
    assert_eq!(search.processed, 2);
    assert_eq!(search.discovered, 5);

    let details = system.coordinator.run_update_cycle().await?;
    assert_eq!(details.processed, 5);
    assert_eq!(details.new, 5);
    assert_eq!(details.failed, 0);

    let counts = system.store.listing_counts().await?;
    assert_eq!(counts.total, 5);

    // only the cheap flats fit alice's budget
    let matches = system.store.matches_for_user("alice").await?;
    assert_eq!(matches.len(), 3);
    assert!(matches.iter().all(|m| m.score >= 80));

    // one session per source was enough
    assert_eq!(system.factory.sessions.load(Ordering::SeqCst), 2);
    assert_eq!(system.site.visits(), 7);

    let stats = system.coordinator.stats().await;
    assert_eq!(stats.discovery_cycles, 1);
    assert_eq!(stats.update_cycles, 2);
    assert_eq!(stats.items_processed, 7);
    assert_eq!(stats.listings_new, 5);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_pages_exhaust_retries() -> anyhow::Result<()> {
    let system = create_test_system(get_test_config(&["immowelt"])).await?;
    let url = detail_url("immowelt", 404);
    system.queue.enqueue(vec![NewQueueItem::detail("immowelt", &url)]).await?;

    let attempts = system.queue.config().max_retries;
    for _ in 0..attempts {
        let report = system.coordinator.run_update_cycle().await?;
        assert_eq!(report.failed, 1);
    }

    let item = system.queue.find("immowelt", &url).await?.expect("queued item");
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.attempts, attempts);

    // nothing left to claim
    let report = system.coordinator.run_update_cycle().await?;
    assert_eq!(report.processed + report.failed, 0);

    let health = system.coordinator.run_health_check().await?;
    assert!(health.warnings.contains(&HealthWarningKind::HighFailureRatio));
    assert_eq!(system.coordinator.recent_errors().await.len(), attempts as usize);
    Ok(())
}

#[tokio::test]
async fn test_captcha_page_is_not_stored() -> anyhow::Result<()> {
    let system = create_test_system(get_test_config(&["immowelt"])).await?;
    let url = detail_url("immowelt", 7);
    system.site.serve(&url, json!({ "kind": "captcha" }));
    system.queue.enqueue(vec![NewQueueItem::detail("immowelt", &url)]).await?;

    let report = system.coordinator.run_update_cycle().await?;
    assert_eq!(report.failed, 1);
    assert_eq!(system.store.listing_counts().await?.total, 0);

    let errors = system.coordinator.recent_errors().await;
    assert_eq!(errors[0].kind, "blocked");
    Ok(())
}

#[tokio::test]
async fn test_start_discovers_and_stop_releases_everything() -> anyhow::Result<()> {
    let system = create_test_system(get_test_config(&["immowelt"])).await?;
    system.site.publish("immowelt", &[1], 900.0);

    system.coordinator.start().await?;
    assert_eq!(system.coordinator.state().await, CoordinatorState::Running);

    // discovery runs right away instead of waiting for its first interval
    let coordinator = &system.coordinator;
    let discovered = wait_for_condition(|| async move { coordinator.stats().await.discovery_cycles >= 1 }, 5).await;
    assert!(discovered);

    let item = system.queue.find("immowelt", &search_url("immowelt")).await?;
    assert!(item.is_some());

    system.coordinator.stop().await?;
    assert_eq!(system.coordinator.state().await, CoordinatorState::Stopped);
    let queue_stats = system.queue.stats(Duration::from_secs(60)).await?;
    assert_eq!(queue_stats.processing, 0);
    Ok(())
}

#[tokio::test]
async fn test_rescrape_refreshes_existing_listing() -> anyhow::Result<()> {
    let system = create_test_system(get_test_config(&["immowelt"])).await?;
    let url = detail_url("immowelt", 3);
    system.site.serve(
        &url,
        json!({ "kind": "flat", "id": "3", "title": "Altbau", "rent": 500.0, "city": "Berlin" }),
    );
    system.queue.enqueue(vec![NewQueueItem::detail("immowelt", &url)]).await?;

    let mut bob = UserPreferenceProfile::new("bob");
    bob.max_rent = Some(1200.0);
    system.store.save_profile(&bob, true).await?;

    let first = system.coordinator.run_update_cycle().await?;
    assert_eq!(first.new, 1);
    assert_eq!(system.store.matches_for_user("bob").await?.len(), 1);

    // a second scrape of the same page refreshes rather than duplicates
    system.queue.enqueue(vec![NewQueueItem::detail("immowelt", &url)]).await?;
    let second = system.coordinator.run_update_cycle().await?;
    assert_eq!(second.new, 0);
    assert_eq!(second.updated, 1);
    assert_eq!(system.store.listing_counts().await?.total, 1);
    Ok(())
}
