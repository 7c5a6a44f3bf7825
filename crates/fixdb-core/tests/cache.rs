//! Integration tests for query caching.

use std::path::Path;

use fixdb_core::{Fields, Filter, QuerySet, Store, StoreConfig};

fn town_with(config: StoreConfig) -> Store {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/town");
    Store::load_dir(&dir, config).unwrap()
}

fn indoor_folk(store: &Store) -> QuerySet {
    store
        .objects("Character")
        .unwrap()
        .filter(Filter::new().with("place__kind", "indoor"))
        .unwrap()
}

#[test]
fn repeated_filter_returns_the_cached_set() {
    let store = town_with(StoreConfig::default());
    let first = indoor_folk(&store);
    let second = indoor_folk(&store);
    assert!(QuerySet::ptr_eq(&first, &second));

    let stats = store.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.plans_compiled, 1);
}

#[test]
fn write_to_a_joined_model_forces_recompute() {
    let store = town_with(StoreConfig::default());
    let before = indoor_folk(&store);
    assert_eq!(before.pks(), [2, 3, 4, 8]);

    let docks = store.get_or_create("Place", 4).unwrap();
    docks.update(Fields::new().set("kind", "indoor")).unwrap();

    let after = indoor_folk(&store);
    assert!(!QuerySet::ptr_eq(&before, &after));
    assert_eq!(after.pks(), [2, 3, 4, 6, 8]);
    assert!(store.cache_stats().invalidations >= 1);
}

#[test]
fn write_to_an_unrelated_model_keeps_the_entry() {
    let store = town_with(StoreConfig::default());
    let before = indoor_folk(&store);
    let cooking = store.get_or_create("Skill", 1).unwrap();
    cooking.update(Fields::new().set("difficulty", 3)).unwrap();
    assert!(QuerySet::ptr_eq(&before, &indoor_folk(&store)));
}

#[test]
fn operands_are_part_of_the_key() {
    let store = town_with(StoreConfig::default());
    let characters = store.objects("Character").unwrap();
    let low = characters.filter(Filter::new().with("energy__lt", 40)).unwrap();
    let high = characters.filter(Filter::new().with("energy__lt", 70)).unwrap();
    assert_eq!(low.pks(), [2, 4]);
    assert_eq!(high.pks(), [2, 3, 4, 5, 7]);
    // Same shape, so one compiled plan serves both.
    assert_eq!(store.cache_stats().plans_compiled, 1);
}

#[test]
fn disabled_cache_still_answers_correctly() {
    let store = town_with(StoreConfig { query_cache: false });
    let first = indoor_folk(&store);
    let second = indoor_folk(&store);
    assert!(!QuerySet::ptr_eq(&first, &second));
    assert_eq!(first.pks(), second.pks());
    assert_eq!(store.cache_stats().entries, 0);
}

#[test]
fn reset_clears_cached_results() {
    let store = town_with(StoreConfig::default());
    let before = indoor_folk(&store);
    store.reset();
    let after = indoor_folk(&store);
    assert!(!QuerySet::ptr_eq(&before, &after));
    assert_eq!(after.pks(), before.pks());
}
