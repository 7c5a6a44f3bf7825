//! Scenario tests over the town fixtures.

use std::path::Path;

use fixdb_core::{Entity, Fields, Filter, OrmError, Store, StoreConfig, Value};

fn town() -> Store {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/town");
    Store::load_dir(&dir, StoreConfig::default()).unwrap()
}

#[test]
fn create_link_and_delete_round_trip() {
    let store = town();

    let town_square = store
        .create("Place", Fields::new().set("title", "Town"))
        .unwrap();
    assert_eq!(town_square.pk(), Some(5));
    assert_eq!(town_square.get("kind").unwrap(), Value::from("outdoor"));

    let bob = store
        .create(
            "Character",
            Fields::new().set("title", "Bob").set("place", &town_square),
        )
        .unwrap();
    assert_eq!(bob.pk(), Some(9));
    assert_eq!(bob.get("place_id").unwrap(), Value::Int(5));

    let residents = town_square
        .related_set("character_set")
        .unwrap()
        .filter(Filter::new())
        .unwrap();
    assert!(residents.contains(&bob));

    bob.delete().unwrap();

    let residents = town_square
        .related_set("character_set")
        .unwrap()
        .filter(Filter::new())
        .unwrap();
    assert!(residents.is_empty());
    let gone = store
        .objects("Character")
        .unwrap()
        .get(Filter::new().with("id", 9))
        .unwrap();
    assert!(gone.is_none());
    assert!(matches!(bob.get("title"), Err(OrmError::Deleted { .. })));
}

#[test]
fn relation_paths_reach_the_same_instances() {
    let store = town();
    let clara = store.get_or_create("Character", 3).unwrap();
    let tavern = clara.related("place").unwrap().unwrap();
    assert!(Entity::ptr_eq(
        &tavern,
        &store.get_or_create("Place", 2).unwrap()
    ));

    let via_reverse = tavern
        .related_set("character_set")
        .unwrap()
        .all()
        .unwrap();
    let found = via_reverse.iter().find(|e| e.pk() == Some(3)).unwrap();
    assert!(Entity::ptr_eq(found, &clara));

    let via_filter = store
        .objects("Character")
        .unwrap()
        .filter(Filter::new().with("place__title", "Tavern"))
        .unwrap();
    assert!(via_filter.iter().any(|e| Entity::ptr_eq(e, &clara)));
}

#[test]
fn deleting_a_parent_disassociates_children() {
    let store = town();
    let library = store.get_or_create("Place", 3).unwrap();
    library.delete().unwrap();

    assert_eq!(store.row_count("Character").unwrap(), 8);
    for pk in [4, 8] {
        let row = store.row("Character", pk).unwrap();
        assert_eq!(row["place_id"], Value::Null);
    }
    let orphans = store
        .objects("Character")
        .unwrap()
        .filter(Filter::new().with("place_id__isnull", true))
        .unwrap();
    assert_eq!(orphans.pks(), [4, 5, 8]);
}

#[test]
fn deleting_through_rows_shrinks_many_to_many_sets() {
    let store = town();
    let alice = store.get_or_create("Character", 1).unwrap();
    assert_eq!(alice.related_set("skills").unwrap().count().unwrap(), 2);

    let link = store.get_or_create("CharacterSkill", 2).unwrap();
    link.delete().unwrap();

    let skills = alice.related_set("skills").unwrap().all().unwrap();
    assert_eq!(skills.pks(), [1]);
}

#[test]
fn writes_are_visible_through_every_handle() {
    let store = town();
    let hugo = store.get_or_create("Character", 8).unwrap();
    let same = store
        .objects("Character")
        .unwrap()
        .get(Filter::new().with("title", "Hugo"))
        .unwrap()
        .unwrap();
    same.update(Fields::new().set("mood", 7)).unwrap();
    assert_eq!(hugo.get("mood").unwrap(), Value::Int(7));
    assert_eq!(store.row("Character", 8).unwrap()["mood"], Value::Int(7));
}
