//! Property-based tests for the store.

use std::path::Path;

use fixdb_core::{Entity, Fields, Filter, Store, StoreConfig, Value};
use proptest::prelude::*;

fn town() -> Store {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/town");
    Store::load_dir(&dir, StoreConfig::default()).unwrap()
}

proptest! {
    #[test]
    fn update_clamps_into_declared_range(energy in -1_000i64..1_000, mood in -100i64..100) {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        alice.update(Fields::new().set("energy", energy).set("mood", mood)).unwrap();
        prop_assert_eq!(alice.get("energy").unwrap(), Value::Int(energy.clamp(0, 100)));
        prop_assert_eq!(alice.get("mood").unwrap(), Value::Int(mood.clamp(-10, 10)));
    }

    #[test]
    fn get_or_create_is_an_identity(pk in 1i64..=8) {
        let store = town();
        let direct = store.get_or_create("Character", pk).unwrap();
        let again = store.get_or_create("Character", pk).unwrap();
        prop_assert!(Entity::ptr_eq(&direct, &again));

        let queried = store
            .objects("Character")
            .unwrap()
            .get(Filter::new().with("id", pk))
            .unwrap()
            .unwrap();
        prop_assert!(Entity::ptr_eq(&direct, &queried));
    }

    #[test]
    fn created_fields_read_back(title in "[A-Za-z]{1,12}", energy in 0i64..=100) {
        let store = town();
        let created = store
            .create("Character", Fields::new().set("title", title.as_str()).set("energy", energy))
            .unwrap();
        prop_assert_eq!(created.get("title").unwrap(), Value::from(title));
        prop_assert_eq!(created.get("energy").unwrap(), Value::Int(energy));
    }
}
