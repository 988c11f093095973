//! Postgres integration tests
//!
//! These exercise the real SQL paths and run only when `STATEFLOW_PG_URL`
//! points at a reachable database; otherwise each test returns early. Every
//! test uses its own key prefix so runs can share a database.

use std::collections::HashSet;

use stateflow_store::{
    Metadata, MetadataFilter, Operation, PostgresStateStore, PostgresStoreConfig, State,
    StateStore, VERSION_INITIAL,
};

async fn connect() -> Option<PostgresStateStore> {
    let url = std::env::var("STATEFLOW_PG_URL").ok()?;
    PostgresStateStore::new(PostgresStoreConfig::new(url))
        .await
        .ok()
}

fn keyed(prefix: &str, name: &str) -> String {
    format!("{prefix}:{name}")
}

#[tokio::test]
async fn create_get_update_delete_cycle() {
    let Some(store) = connect().await else {
        return;
    };
    let prefix = format!("cycle-{}", std::process::id());
    let key = keyed(&prefix, "a");

    let failed = store
        .create(&[State::new(&key, b"v0".to_vec())])
        .await
        .unwrap();
    assert!(failed.is_empty());

    let fetched = store.get(&[key.clone()]).await.unwrap();
    assert_eq!(fetched[&key].version, VERSION_INITIAL);
    assert_eq!(fetched[&key].value, b"v0");

    // Second create reports the key and leaves the row alone.
    let failed = store
        .create(&[State::new(&key, b"other".to_vec())])
        .await
        .unwrap();
    assert_eq!(failed, HashSet::from([key.clone()]));

    // Update with the observed version succeeds and bumps the version.
    let mut current = fetched[&key].clone();
    current.value = b"v1".to_vec();
    assert!(store.update(&[current.clone()]).await.unwrap().is_empty());

    // Stale update is reported and the row is untouched.
    let failed = store.update(&[current.clone()]).await.unwrap();
    assert_eq!(failed, HashSet::from([key.clone()]));
    let fetched = store.get(&[key.clone()]).await.unwrap();
    assert_eq!(fetched[&key].version, 1);
    assert_eq!(fetched[&key].value, b"v1");

    // Version-checked delete.
    let failed = store.delete(&[current]).await.unwrap();
    assert_eq!(failed, HashSet::from([key.clone()]));
    let failed = store.delete(&[fetched[&key].clone()]).await.unwrap();
    assert!(failed.is_empty());
    assert!(store.get(&[key]).await.unwrap().is_empty());
}

#[tokio::test]
async fn metadata_filters_compile_to_native_comparisons() {
    let Some(store) = connect().await else {
        return;
    };
    let prefix = format!("meta-{}", std::process::id());

    let states: Vec<State> = (0..=20i64)
        .map(|number| {
            State::new(keyed(&prefix, &number.to_string()), b"x".to_vec()).with_metadata(
                Metadata::new()
                    .with("suite", prefix.clone())
                    .with("number", number)
                    .with("boolean", number % 2 == 0)
                    .with("string", format!("random_{number}")),
            )
        })
        .collect();
    assert!(store.create(&states).await.unwrap().is_empty());

    let found = store
        .find_by_metadata_matching_all(&[
            MetadataFilter::new("suite", Operation::Equals, prefix.clone()),
            MetadataFilter::new("number", Operation::GreaterThan, 5i64),
            MetadataFilter::new("number", Operation::LesserThan, 7i64),
            MetadataFilter::new("boolean", Operation::Equals, true),
            MetadataFilter::new("string", Operation::Equals, "random_6"),
        ])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found.contains_key(&keyed(&prefix, "6")));

    let found = store
        .find_by_metadata_matching_all(&[
            MetadataFilter::new("suite", Operation::Equals, prefix.clone()),
            MetadataFilter::new("number", Operation::GreaterThan, 5i64),
            MetadataFilter::new("number", Operation::LesserThan, 5i64),
        ])
        .await
        .unwrap();
    assert!(found.is_empty());

    // Disjunction: numbers 0 and 1 under this suite tag would match "any",
    // but scope with the suite filter conjunction first to stay isolated.
    let found = store
        .find_by_metadata_matching_all(&[
            MetadataFilter::new("suite", Operation::Equals, prefix.clone()),
            MetadataFilter::new("number", Operation::NotEquals, 6i64),
        ])
        .await
        .unwrap();
    assert_eq!(found.len(), 20);

    // Cleanup.
    let all: Vec<State> = store
        .find_by_metadata_matching_all(&[MetadataFilter::new(
            "suite",
            Operation::Equals,
            prefix.clone(),
        )])
        .await
        .unwrap()
        .into_values()
        .collect();
    assert!(store.delete(&all).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_updates_admit_one_winner() {
    let Some(store) = connect().await else {
        return;
    };
    let store = std::sync::Arc::new(store);
    let key = format!("race-{}", std::process::id());

    store
        .create(&[State::new(&key, b"seed".to_vec())])
        .await
        .unwrap();
    let base = store.get(&[key.clone()]).await.unwrap()[&key].clone();

    let mut handles = Vec::new();
    for writer in 0..8u8 {
        let store = store.clone();
        let mut attempt = base.clone();
        handles.push(tokio::spawn(async move {
            attempt.value = vec![writer];
            store.update(&[attempt]).await.unwrap().is_empty()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    let current = store.get(&[key.clone()]).await.unwrap()[&key].clone();
    assert_eq!(current.version, base.version + 1);
    assert!(store.delete(&[current]).await.unwrap().is_empty());
}
