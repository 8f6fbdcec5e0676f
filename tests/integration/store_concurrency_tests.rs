use std::collections::HashMap;
use std::sync::Arc;

use rentwatch::models::NormalizedListing;
use rentwatch::store::{ListingStore, UpsertOutcome};
use rentwatch::SqliteStore;

use super::*;

fn flat(source: &str, external_id: &str, rent: f64) -> NormalizedListing {
    let mut listing = NormalizedListing::new(source, external_id, &detail_url(source, 0), "Altbau flat");
    listing.costs.total_rent = Some(rent);
    listing
}

#[tokio::test]
async fn test_parallel_sources_save_listings_without_lock_errors() -> anyhow::Result<()> {
    let (_dir, pool) = create_test_db().await?;
    let store = Arc::new(SqliteStore::new(pool));

    // every task writes its own flats plus the same shared ones
    let writers = ["immowelt", "wg-gesucht", "kleinanzeigen", "immoscout"].into_iter().map(|source| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut outcomes = Vec::new();
            for n in 0..25 {
                let own = flat(source, &format!("{}-{}", source, n), 700.0 + n as f64);
                outcomes.push((own.external_id.clone(), store.upsert_listing(&own).await?));
                let shared = flat("shared", &format!("shared-{}", n % 5), 900.0);
                outcomes.push((shared.external_id.clone(), store.upsert_listing(&shared).await?));
            }
            Ok::<Vec<(String, UpsertOutcome)>, rentwatch::AppError>(outcomes)
        })
    });

    let mut ids: HashMap<String, Vec<UpsertOutcome>> = HashMap::new();
    for result in futures::future::join_all(writers).await {
        for (external_id, outcome) in result?? {
            ids.entry(external_id).or_default().push(outcome);
        }
    }

    let counts = store.listing_counts().await?;
    assert_eq!(counts.total, 4 * 25 + 5);

    // each shared flat was inserted once and kept that id on every later save
    for n in 0..5 {
        let outcomes = &ids[&format!("shared-{}", n)];
        assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);
        let first = &outcomes[0].listing_id;
        assert!(outcomes.iter().all(|o| &o.listing_id == first));

        let stored = store.get_listing(first).await?.expect("stored listing");
        assert_eq!(&stored.id, first);
    }
    Ok(())
}
