use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::cache::{CacheStats, QueryCache};
use crate::config::StoreConfig;
use crate::entity::{Assign, Entity, Fields};
use crate::error::{OrmError, OrmResult};
use crate::loader::{self, LoadedFixtures};
use crate::lookup::Filter;
use crate::query::QuerySet;
use crate::schema::{
    ModelId, ModelSchema, PRIMARY_KEY, Pk, Record, Relation, Schema, Table,
    relation_for_foreign_key,
};
use crate::value::Value;

pub(crate) struct StoreShared {
    schema: Schema,
    config: StoreConfig,
    seeds: Vec<Table>,
    tables: RefCell<Vec<Table>>,
    identity: RefCell<HashMap<(ModelId, Pk), Entity>>,
    cache: RefCell<QueryCache>,
    // Bumped on every write to a model; lets entities detect stale collections.
    revisions: RefCell<Vec<u64>>,
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        // Relation caches can link entities to each other; clear them so the
        // entities are freed with the store.
        for entity in self.identity.get_mut().values() {
            entity.clear_relations();
        }
    }
}

/// The record tables and identity map of every model.
///
/// A `Store` is a cheap handle: clones share the same arena. Entities and
/// query sets refer back to it weakly, so dropping the last `Store` handle
/// releases everything.
#[derive(Clone)]
pub struct Store {
    shared: Rc<StoreShared>,
}

impl Store {
    /// Build a store over linked fixtures.
    pub fn new(fixtures: LoadedFixtures, config: StoreConfig) -> Self {
        let LoadedFixtures { schema, tables } = fixtures;
        let revisions = vec![0; tables.len()];
        Self {
            shared: Rc::new(StoreShared {
                cache: RefCell::new(QueryCache::new(config.query_cache)),
                schema,
                config,
                seeds: tables.clone(),
                tables: RefCell::new(tables),
                identity: RefCell::new(HashMap::new()),
                revisions: RefCell::new(revisions),
            }),
        }
    }

    /// Load and link a fixture directory, then build a store over it.
    pub fn load_dir(dir: &Path, config: StoreConfig) -> OrmResult<Self> {
        Ok(Self::new(loader::load_dir(dir)?, config))
    }

    pub(crate) fn from_shared(shared: Rc<StoreShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<StoreShared> {
        Rc::downgrade(&self.shared)
    }

    /// The linked schema.
    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    /// Settings the store was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Schema of the named model.
    pub fn model(&self, name: &str) -> OrmResult<&ModelSchema> {
        self.shared
            .schema
            .lookup(name)
            .ok_or_else(|| OrmError::UnknownModel(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Identity map
    // -----------------------------------------------------------------------

    /// The unique live entity for `(model, pk)`, materialized on first access.
    pub fn get_or_create(&self, model: &str, pk: Pk) -> OrmResult<Entity> {
        let id = self.model(model)?.id();
        self.entity(id, pk)
    }

    pub(crate) fn entity(&self, model: ModelId, pk: Pk) -> OrmResult<Entity> {
        let key = (model, pk);
        let existing = self.shared.identity.borrow().get(&key).cloned();
        if let Some(entity) = existing {
            return Ok(entity);
        }

        if !self.shared.tables.borrow()[model.0].contains_key(&pk) {
            return Err(self.record_not_found(model, pk));
        }
        let name = self.shared.schema.model(model).name().to_string();
        let entity = Entity::materialize(model, name, pk, self.downgrade());
        self.shared.identity.borrow_mut().insert(key, entity.clone());
        Ok(entity)
    }

    /// Number of entities currently materialized.
    pub fn live_entities(&self) -> usize {
        self.shared.identity.borrow().len()
    }

    /// An unevaluated query set over every row of `model`.
    pub fn objects(&self, model: &str) -> OrmResult<QuerySet> {
        let id = self.model(model)?.id();
        Ok(QuerySet::unevaluated(self.downgrade(), id, Filter::new()))
    }

    // -----------------------------------------------------------------------
    // Raw records
    // -----------------------------------------------------------------------

    /// A copy of the raw record behind `(model, pk)`.
    pub fn row(&self, model: &str, pk: Pk) -> OrmResult<Record> {
        let id = self.model(model)?.id();
        self.read_record(id, pk)
    }

    /// Number of rows currently stored for `model`.
    pub fn row_count(&self, model: &str) -> OrmResult<usize> {
        let id = self.model(model)?.id();
        Ok(self.shared.tables.borrow()[id.0].len())
    }

    pub(crate) fn read_record(&self, model: ModelId, pk: Pk) -> OrmResult<Record> {
        self.shared.tables.borrow()[model.0]
            .get(&pk)
            .cloned()
            .ok_or_else(|| self.record_not_found(model, pk))
    }

    pub(crate) fn read_field(&self, model: ModelId, pk: Pk, field: &str) -> OrmResult<Value> {
        let tables = self.shared.tables.borrow();
        let record = tables[model.0]
            .get(&pk)
            .ok_or_else(|| self.record_not_found(model, pk))?;
        record
            .get(field)
            .cloned()
            .ok_or_else(|| OrmError::FieldNotFound {
                model: self.shared.schema.model(model).name().to_string(),
                field: field.to_string(),
            })
    }

    pub(crate) fn tables(&self) -> Ref<'_, Vec<Table>> {
        self.shared.tables.borrow()
    }

    pub(crate) fn cache_mut(&self) -> RefMut<'_, QueryCache> {
        self.shared.cache.borrow_mut()
    }

    pub(crate) fn revision(&self, model: ModelId) -> u64 {
        self.shared.revisions.borrow()[model.0]
    }

    /// Current query cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.borrow().stats()
    }

    /// Discard every runtime change: live entities are tombstoned, tables go
    /// back to their seed rows, and cached results are dropped.
    pub fn reset(&self) {
        let entities: Vec<Entity> = self
            .shared
            .identity
            .borrow_mut()
            .drain()
            .map(|(_, entity)| entity)
            .collect();
        for entity in &entities {
            entity.tombstone();
        }
        *self.shared.tables.borrow_mut() = self.shared.seeds.clone();
        for revision in self.shared.revisions.borrow_mut().iter_mut() {
            *revision += 1;
        }
        self.shared.cache.borrow_mut().clear();
        tracing::debug!(dropped = entities.len(), "store reset to seed state");
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a new record and return its entity.
    ///
    /// `fields` may name stored fields, or many-to-one relations with an
    /// entity (or none) from which the foreign key is derived. Fields left
    /// out take their default or null. Without an explicit `id` the key is
    /// one past the current maximum.
    pub fn create(&self, model: &str, fields: Fields) -> OrmResult<Entity> {
        let id = self.model(model)?.id();
        self.create_in(id, fields)
    }

    pub(crate) fn create_in(&self, model: ModelId, fields: Fields) -> OrmResult<Entity> {
        let schema = self.shared.schema.model(model);
        let mut supplied = Record::new();
        let mut links: Vec<(String, Option<Entity>)> = Vec::new();

        for (name, assign) in fields {
            if name == PRIMARY_KEY {
                let Assign::Value(value) = assign else {
                    return Err(illegal(schema, &name, "primary keys take integer values"));
                };
                supplied.insert(name, value);
                continue;
            }
            match (schema.relation(&name), assign) {
                (Some(Relation::ManyToOne { foreign_key, target }), assign) => {
                    let linked = self.assigned_entity(schema, &name, *target, assign)?;
                    supplied.insert(foreign_key.clone(), key_value(linked.as_ref())?);
                    links.push((name, linked));
                }
                (_, Assign::Value(value)) if schema.has_field(&name) => {
                    supplied.insert(name, value);
                }
                (_, Assign::Entity(_)) if schema.has_field(&name) => {
                    return Err(illegal(schema, &name, "stored fields take values, not entities"));
                }
                _ => return Err(field_not_found(schema, &name)),
            }
        }

        let pk = match supplied.remove(PRIMARY_KEY) {
            Some(value) => value
                .as_i64()
                .ok_or_else(|| invalid_key(schema, PRIMARY_KEY, &value))?,
            None => self.next_pk(model)?,
        };
        if self.shared.tables.borrow()[model.0].contains_key(&pk) {
            return Err(OrmError::DuplicateKey {
                model: schema.name().to_string(),
                pk,
            });
        }

        let mut record = schema.blank_record(pk);
        for (field, value) in supplied {
            let value = schema
                .coerce(&field, value)
                .ok_or_else(|| illegal(schema, &field, "time fields take HH:MM:SS values"))?;
            record.insert(field, value);
        }

        // Every non-null `<relation>_id` must belong to a declared many-to-one.
        for (field, value) in &record {
            let Some(relation) = relation_for_foreign_key(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let Some(Relation::ManyToOne { target, .. }) = schema.relation(relation) else {
                return Err(illegal(
                    schema,
                    field,
                    "foreign-key fields need a matching many-to-one relation",
                ));
            };
            let linked = self.linked_entity(schema, field, *target, value)?;
            links.retain(|(name, _)| name != relation);
            links.push((relation.to_string(), linked));
        }

        self.shared.tables.borrow_mut()[model.0].insert(pk, record);
        self.touch(model);

        let entity = self.entity(model, pk)?;
        for (name, linked) in links {
            entity.set_link(name, linked);
        }
        tracing::debug!(model = schema.name(), pk, "created record");
        Ok(entity)
    }

    pub(crate) fn update_entity(&self, entity: &Entity, fields: Fields) -> OrmResult<()> {
        let pk = entity.id()?;
        if fields.is_empty() {
            return Ok(());
        }
        let model = entity.model();
        let schema = self.shared.schema.model(model);

        // Validate everything first; nothing is written if any field fails.
        let mut writes: Vec<(String, Value)> = Vec::new();
        let mut links: Vec<(String, Option<Entity>)> = Vec::new();
        for (name, assign) in fields {
            if name == PRIMARY_KEY {
                return Err(illegal(schema, &name, "primary keys are immutable"));
            }

            if let Some(range) = schema.range(&name) {
                let Assign::Value(value) = assign else {
                    return Err(illegal(schema, &name, "range-constrained attributes take values"));
                };
                writes.push((name, range.clamp(value)));
                continue;
            }

            if let Some(Relation::ManyToOne {
                foreign_key,
                target,
            }) = schema.relation(&name)
            {
                let linked = self.assigned_entity(schema, &name, *target, assign)?;
                writes.push((foreign_key.clone(), key_value(linked.as_ref())?));
                links.push((name, linked));
                continue;
            }

            if let Some(relation) = relation_for_foreign_key(&name) {
                let Some(Relation::ManyToOne { target, .. }) = schema.relation(relation) else {
                    return Err(illegal(
                        schema,
                        &name,
                        "foreign-key fields need a matching many-to-one relation",
                    ));
                };
                let Assign::Value(value) = assign else {
                    return Err(illegal(schema, &name, "foreign-key fields take key values"));
                };
                let linked = self.linked_entity(schema, &name, *target, &value)?;
                links.push((relation.to_string(), linked));
                writes.push((name, value));
                continue;
            }

            if !schema.has_field(&name) {
                return Err(field_not_found(schema, &name));
            }
            let Assign::Value(value) = assign else {
                return Err(illegal(schema, &name, "stored fields take values, not entities"));
            };
            let value = schema
                .coerce(&name, value)
                .ok_or_else(|| illegal(schema, &name, "time fields take HH:MM:SS values"))?;
            writes.push((name, value));
        }

        self.apply(entity, model, pk, writes, links)
    }

    fn apply(
        &self,
        entity: &Entity,
        model: ModelId,
        pk: Pk,
        writes: Vec<(String, Value)>,
        links: Vec<(String, Option<Entity>)>,
    ) -> OrmResult<()> {
        {
            let mut tables = self.shared.tables.borrow_mut();
            let record = tables[model.0]
                .get_mut(&pk)
                .ok_or_else(|| self.record_not_found(model, pk))?;
            for (field, value) in writes {
                record.insert(field, value);
            }
        }
        for (name, linked) in links {
            entity.set_link(name, linked);
        }
        self.touch(model);
        Ok(())
    }

    pub(crate) fn delete_entity(&self, entity: &Entity) -> OrmResult<()> {
        let Some(pk) = entity.pk() else {
            return Ok(());
        };
        let model = entity.model();
        let schema = self.shared.schema.model(model);

        // Disassociate reverse-set children; they are never deleted.
        for (name, relation) in schema.relations() {
            let Relation::ReverseSet {
                target,
                foreign_key,
            } = relation
            else {
                continue;
            };
            let children = entity.related_set(name)?.filter(Filter::new())?;
            let child_schema = self.shared.schema.model(*target);
            let child_link = relation_for_foreign_key(foreign_key)
                .filter(|rel| matches!(child_schema.relation(rel), Some(Relation::ManyToOne { .. })));
            for child in &children {
                let Some(child_pk) = child.pk() else {
                    continue;
                };
                let links = child_link
                    .map(|rel| vec![(rel.to_string(), None)])
                    .unwrap_or_default();
                self.apply(
                    child,
                    *target,
                    child_pk,
                    vec![(foreign_key.clone(), Value::Null)],
                    links,
                )?;
            }
            if !children.is_empty() {
                tracing::debug!(
                    model = schema.name(),
                    pk,
                    relation = name,
                    children = children.len(),
                    "disassociated children"
                );
            }
        }

        self.shared.tables.borrow_mut()[model.0].remove(&pk);
        self.shared.identity.borrow_mut().remove(&(model, pk));
        entity.tombstone();
        self.touch(model);
        tracing::debug!(model = schema.name(), pk, "deleted record");
        Ok(())
    }

    fn next_pk(&self, model: ModelId) -> OrmResult<Pk> {
        let Some(&max) = self.shared.tables.borrow()[model.0].keys().next_back() else {
            return Ok(1);
        };
        max.checked_add(1).ok_or_else(|| OrmError::KeysExhausted {
            model: self.shared.schema.model(model).name().to_string(),
            max,
        })
    }

    /// Record a write to `model` and drop every cached query touching it.
    fn touch(&self, model: ModelId) {
        self.shared.revisions.borrow_mut()[model.0] += 1;
        let dropped = self.shared.cache.borrow_mut().invalidate(model);
        if dropped > 0 {
            tracing::debug!(
                model = self.shared.schema.model(model).name(),
                dropped,
                "invalidated cached queries"
            );
        }
    }

    /// The entity a many-to-one assignment links to.
    fn assigned_entity(
        &self,
        schema: &ModelSchema,
        name: &str,
        target: ModelId,
        assign: Assign,
    ) -> OrmResult<Option<Entity>> {
        match assign {
            Assign::Entity(None) | Assign::Value(Value::Null) => Ok(None),
            Assign::Entity(Some(linked)) => {
                if linked.model() != target {
                    return Err(illegal(schema, name, "entity belongs to a different model"));
                }
                linked.id()?;
                Ok(Some(linked))
            }
            Assign::Value(_) => Err(illegal(schema, name, "many-to-one relations take an entity")),
        }
    }

    /// The entity a foreign-key value points at.
    fn linked_entity(
        &self,
        schema: &ModelSchema,
        field: &str,
        target: ModelId,
        value: &Value,
    ) -> OrmResult<Option<Entity>> {
        if value.is_null() {
            return Ok(None);
        }
        let pk = value
            .as_i64()
            .ok_or_else(|| invalid_key(schema, field, value))?;
        self.entity(target, pk).map(Some)
    }

    fn record_not_found(&self, model: ModelId, pk: Pk) -> OrmError {
        OrmError::RecordNotFound {
            model: self.shared.schema.model(model).name().to_string(),
            pk,
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("models", &self.shared.schema.len())
            .field("live_entities", &self.live_entities())
            .finish()
    }
}

fn key_value(linked: Option<&Entity>) -> OrmResult<Value> {
    match linked {
        Some(entity) => entity.id().map(Value::Int),
        None => Ok(Value::Null),
    }
}

fn illegal(schema: &ModelSchema, field: &str, reason: &'static str) -> OrmError {
    OrmError::IllegalField {
        model: schema.name().to_string(),
        field: field.to_string(),
        reason,
    }
}

fn field_not_found(schema: &ModelSchema, field: &str) -> OrmError {
    OrmError::FieldNotFound {
        model: schema.name().to_string(),
        field: field.to_string(),
    }
}

fn invalid_key(schema: &ModelSchema, field: &str, value: &Value) -> OrmError {
    OrmError::InvalidKey {
        model: schema.name().to_string(),
        field: field.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::town;

    #[test]
    fn get_or_create_returns_the_same_entity() {
        let store = town();
        let a = store.get_or_create("Character", 1).unwrap();
        let b = store.get_or_create("Character", 1).unwrap();
        assert!(Entity::ptr_eq(&a, &b));
        assert_eq!(store.live_entities(), 1);
    }

    #[test]
    fn get_or_create_rejects_missing_rows() {
        let store = town();
        assert!(matches!(
            store.get_or_create("Character", 99),
            Err(OrmError::RecordNotFound { pk: 99, .. })
        ));
        assert!(matches!(
            store.get_or_create("Dragon", 1),
            Err(OrmError::UnknownModel(_))
        ));
    }

    #[test]
    fn create_assigns_next_key_and_defaults() {
        let store = town();
        let bob = store
            .create("Character", Fields::new().set("title", "Bob"))
            .unwrap();
        assert_eq!(bob.pk(), Some(9));
        assert_eq!(bob.get("energy").unwrap(), Value::Int(50));
        assert_eq!(bob.get("place_id").unwrap(), Value::Null);
        assert_eq!(bob.get("is_player").unwrap(), Value::Bool(false));
        assert_eq!(store.row_count("Character").unwrap(), 9);
    }

    #[test]
    fn create_on_empty_table_starts_at_one() {
        let store = crate::testing::store_from(vec![serde_json::json!({
            "name": "Note",
            "fields": ["text"]
        })]);
        let note = store.create("Note", Fields::new().set("text", "hi")).unwrap();
        assert_eq!(note.pk(), Some(1));
    }

    #[test]
    fn create_with_explicit_key() {
        let store = town();
        let place = store
            .create("Place", Fields::new().set("id", 40).set("title", "Mill"))
            .unwrap();
        assert_eq!(place.pk(), Some(40));
        assert!(matches!(
            store.create("Place", Fields::new().set("id", 40)),
            Err(OrmError::DuplicateKey { pk: 40, .. })
        ));
    }

    #[test]
    fn create_after_largest_key_fails_cleanly() {
        let store = town();
        store
            .create("Skill", Fields::new().set("id", i64::MAX).set("title", "Last"))
            .unwrap();
        assert!(matches!(
            store.create("Skill", Fields::new().set("title", "Overflow")),
            Err(OrmError::KeysExhausted { max: i64::MAX, .. })
        ));
        assert_eq!(store.row_count("Skill").unwrap(), 4);
    }

    #[test]
    fn create_derives_foreign_key_from_entity() {
        let store = town();
        let tavern = store.get_or_create("Place", 2).unwrap();
        let bob = store
            .create(
                "Character",
                Fields::new().set("title", "Bob").set("place", &tavern),
            )
            .unwrap();
        assert_eq!(bob.get("place_id").unwrap(), Value::Int(2));
        let place = bob.related("place").unwrap().unwrap();
        assert!(Entity::ptr_eq(&place, &tavern));
    }

    #[test]
    fn create_rejects_illegal_foreign_key_fields() {
        let store = crate::testing::store_from(vec![serde_json::json!({
            "name": "Note",
            "fields": ["text", "author_id"]
        })]);
        let err = store
            .create("Note", Fields::new().set("author_id", 3))
            .unwrap_err();
        assert!(matches!(err, OrmError::IllegalField { ref field, .. } if field == "author_id"));

        // A null key is not checked.
        assert!(store.create("Note", Fields::new().set("text", "x")).is_ok());
    }

    #[test]
    fn create_rejects_unknown_fields_and_dangling_keys() {
        let store = town();
        assert!(matches!(
            store.create("Character", Fields::new().set("colour", "red")),
            Err(OrmError::FieldNotFound { .. })
        ));
        assert!(matches!(
            store.create("Character", Fields::new().set("place_id", 77)),
            Err(OrmError::RecordNotFound { pk: 77, .. })
        ));
        // Nothing was written by the failed calls.
        assert_eq!(store.row_count("Character").unwrap(), 8);
    }

    #[test]
    fn create_parses_time_fields() {
        let store = town();
        let bob = store
            .create(
                "Character",
                Fields::new().set("title", "Bob").set("wake_at", "06:00:00"),
            )
            .unwrap();
        assert_eq!(
            bob.get("wake_at").unwrap(),
            Value::parse_time("06:00:00").unwrap()
        );
        assert!(matches!(
            store.create("Character", Fields::new().set("wake_at", "dawn")),
            Err(OrmError::IllegalField { .. })
        ));
    }

    #[test]
    fn reset_restores_seed_rows() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        alice.update(Fields::new().set("energy", 5)).unwrap();
        store.create("Place", Fields::new().set("title", "Mill")).unwrap();

        store.reset();

        assert!(alice.is_deleted());
        assert_eq!(store.live_entities(), 0);
        assert_eq!(store.row_count("Place").unwrap(), 4);
        let alice = store.get_or_create("Character", 1).unwrap();
        assert_eq!(alice.get("energy").unwrap(), Value::Int(80));
    }

    #[test]
    fn dropping_the_store_invalidates_handles() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        alice.related("place").unwrap();
        drop(store);
        assert!(matches!(alice.get("title"), Err(OrmError::StoreDropped)));
    }
}
