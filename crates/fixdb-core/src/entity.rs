use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::error::{OrmError, OrmResult};
use crate::lookup::Filter;
use crate::query::QuerySet;
use crate::schema::{ModelId, PRIMARY_KEY, Pk, Record, Relation};
use crate::store::{Store, StoreShared};
use crate::value::Value;

/// Cached resolution of one relation on an entity.
enum RelationSlot {
    ManyToOne(Option<Entity>),
    Collection {
        set: QuerySet,
        // Through-table revision the set was built from; `None` for reverse
        // sets, whose filter never goes stale.
        revision: Option<u64>,
    },
}

struct EntityCell {
    model: ModelId,
    model_name: String,
    key: Pk,
    deleted: Cell<bool>,
    store: Weak<StoreShared>,
    relations: RefCell<HashMap<String, RelationSlot>>,
}

/// A live handle to one record.
///
/// There is at most one live entity per `(model, pk)`; clones are the same
/// handle. Field reads always go through the store, so writes made through
/// any path are visible immediately. Entities are only obtained from a
/// [`Store`] or a [`QuerySet`].
#[derive(Clone)]
pub struct Entity(Rc<EntityCell>);

/// The result of reading a name on an entity.
#[derive(Debug, Clone)]
pub enum Attr {
    /// A stored field.
    Value(Value),
    /// A many-to-one relation.
    Entity(Option<Entity>),
    /// A reverse-set or many-to-many relation.
    Set(QuerySet),
}

impl Entity {
    pub(crate) fn materialize(
        model: ModelId,
        model_name: String,
        pk: Pk,
        store: Weak<StoreShared>,
    ) -> Self {
        Self(Rc::new(EntityCell {
            model,
            model_name,
            key: pk,
            deleted: Cell::new(false),
            store,
            relations: RefCell::new(HashMap::new()),
        }))
    }

    /// Model this entity belongs to.
    pub fn model(&self) -> ModelId {
        self.0.model
    }

    /// Name of the entity's model.
    pub fn model_name(&self) -> &str {
        &self.0.model_name
    }

    /// Primary key, or `None` once deleted.
    pub fn pk(&self) -> Option<Pk> {
        (!self.is_deleted()).then_some(self.0.key)
    }

    /// Primary key of a live entity.
    pub fn id(&self) -> OrmResult<Pk> {
        self.pk().ok_or_else(|| OrmError::Deleted {
            model: self.0.model_name.clone(),
        })
    }

    /// Whether the record behind this handle was deleted.
    pub fn is_deleted(&self) -> bool {
        self.0.deleted.get()
    }

    /// Whether both handles are the same live instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// The store that owns this entity. Fails once it has been dropped.
    pub fn store(&self) -> OrmResult<Store> {
        self.0
            .store
            .upgrade()
            .map(Store::from_shared)
            .ok_or(OrmError::StoreDropped)
    }

    /// Current value of a stored field.
    pub fn get(&self, field: &str) -> OrmResult<Value> {
        let pk = self.id()?;
        self.store()?.read_field(self.model(), pk, field)
    }

    /// A copy of every stored field.
    pub fn fields(&self) -> OrmResult<Record> {
        let pk = self.id()?;
        self.store()?.read_record(self.model(), pk)
    }

    /// Read a stored field or a relation by name.
    pub fn attr(&self, name: &str) -> OrmResult<Attr> {
        self.id()?;
        let store = self.store()?;
        let schema = store.schema().model(self.model());
        if schema.has_field(name) {
            return self.get(name).map(Attr::Value);
        }
        match schema.relation(name) {
            Some(Relation::ManyToOne { .. }) => self.related(name).map(Attr::Entity),
            Some(_) => self.related_set(name).map(Attr::Set),
            None => Err(OrmError::FieldNotFound {
                model: self.0.model_name.clone(),
                field: name.to_string(),
            }),
        }
    }

    /// The entity a many-to-one relation points at, or `None` for a null key.
    ///
    /// The cached link is reused while it still matches the stored key.
    pub fn related(&self, name: &str) -> OrmResult<Option<Entity>> {
        let pk = self.id()?;
        let store = self.store()?;
        let Some(Relation::ManyToOne {
            foreign_key,
            target,
        }) = store.schema().model(self.model()).relation(name)
        else {
            return Err(self.relation_not_found(name));
        };

        let current = store.read_field(self.model(), pk, foreign_key)?;
        let wanted = match &current {
            Value::Null => None,
            value => Some(value.as_i64().ok_or_else(|| OrmError::InvalidKey {
                model: self.0.model_name.clone(),
                field: foreign_key.clone(),
                value: value.to_string(),
            })?),
        };

        let cached = match self.0.relations.borrow().get(name) {
            Some(RelationSlot::ManyToOne(linked)) => Some(linked.clone()),
            _ => None,
        };
        if let Some(linked) = cached.filter(|linked| linked.as_ref().and_then(Entity::pk) == wanted) {
            return Ok(linked);
        }

        let linked = wanted.map(|fk| store.entity(*target, fk)).transpose()?;
        self.set_link(name.to_string(), linked.clone());
        Ok(linked)
    }

    /// The query set behind a reverse-set or many-to-many relation.
    ///
    /// The set is unevaluated; reads evaluate it against the current rows.
    /// A many-to-many set is rebuilt once its through table changes.
    pub fn related_set(&self, name: &str) -> OrmResult<QuerySet> {
        let pk = self.id()?;
        let store = self.store()?;
        match store.schema().model(self.model()).relation(name) {
            Some(Relation::ReverseSet {
                target,
                foreign_key,
            }) => {
                if let Some(set) = self.cached_collection(name, None) {
                    return Ok(set);
                }
                let filter = Filter::new().with(foreign_key.clone(), pk);
                let set = QuerySet::unevaluated(store.downgrade(), *target, filter);
                self.set_collection(name, set.clone(), None);
                Ok(set)
            }
            Some(Relation::ManyToMany {
                through,
                from_key,
                target_key,
                target,
            }) => {
                let revision = store.revision(*through);
                if let Some(set) = self.cached_collection(name, Some(revision)) {
                    return Ok(set);
                }
                let owner = Value::Int(pk);
                let ids: Vec<Value> = store.tables()[through.0]
                    .values()
                    .filter(|row| row.get(from_key).is_some_and(|key| key.loose_eq(&owner)))
                    .filter_map(|row| row.get(target_key))
                    .filter(|key| !key.is_null())
                    .cloned()
                    .collect();
                let filter = Filter::new().with("id__in", Value::List(ids));
                let set = QuerySet::unevaluated(store.downgrade(), *target, filter);
                self.set_collection(name, set.clone(), Some(revision));
                Ok(set)
            }
            _ => Err(self.relation_not_found(name)),
        }
    }

    /// Write fields, clamping ranged attributes. Nothing is written if any
    /// field is rejected.
    pub fn update(&self, fields: Fields) -> OrmResult<()> {
        self.store()?.update_entity(self, fields)
    }

    /// Delete the record, disassociating reverse-set children. Deleting twice
    /// is a no-op.
    pub fn delete(&self) -> OrmResult<()> {
        if self.is_deleted() {
            return Ok(());
        }
        self.store()?.delete_entity(self)
    }

    /// Create a new record from this one's fields with `overrides` applied.
    pub fn clone_with(&self, overrides: Fields) -> OrmResult<Entity> {
        let mut record = self.fields()?;
        record.remove(PRIMARY_KEY);
        let mut fields: Fields = record.into_iter().collect();
        fields.extend(overrides);
        self.store()?.create_in(self.model(), fields)
    }

    pub(crate) fn set_link(&self, name: String, linked: Option<Entity>) {
        self.0
            .relations
            .borrow_mut()
            .insert(name, RelationSlot::ManyToOne(linked));
    }

    pub(crate) fn tombstone(&self) {
        self.0.deleted.set(true);
        self.clear_relations();
    }

    pub(crate) fn clear_relations(&self) {
        self.0.relations.borrow_mut().clear();
    }

    fn cached_collection(&self, name: &str, revision: Option<u64>) -> Option<QuerySet> {
        match self.0.relations.borrow().get(name) {
            Some(RelationSlot::Collection {
                set,
                revision: built,
            }) if *built == revision => Some(set.clone()),
            _ => None,
        }
    }

    fn set_collection(&self, name: &str, set: QuerySet, revision: Option<u64>) {
        self.0
            .relations
            .borrow_mut()
            .insert(name.to_string(), RelationSlot::Collection { set, revision });
    }

    fn relation_not_found(&self, name: &str) -> OrmError {
        OrmError::RelationNotFound {
            model: self.0.model_name.clone(),
            relation: name.to_string(),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.model() == other.model() && self.0.key == other.0.key
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.model().hash(state);
        self.0.key.hash(state);
    }
}

/// Entities have no order; every comparison is false.
impl PartialOrd for Entity {
    fn partial_cmp(&self, _other: &Self) -> Option<Ordering> {
        None
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pk() {
            Some(pk) => write!(f, "{}({pk})", self.0.model_name),
            None => write!(f, "{}(deleted)", self.0.model_name),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("model", &self.0.model_name)
            .field("pk", &self.pk())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Write arguments
// ---------------------------------------------------------------------------

/// A value written to one name by `create` or `update`.
#[derive(Debug, Clone)]
pub enum Assign {
    /// A stored field value.
    Value(Value),
    /// The entity a many-to-one relation should point at.
    Entity(Option<Entity>),
}

macro_rules! assign_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Assign {
                fn from(value: $ty) -> Self {
                    Self::Value(value.into())
                }
            }
        )*
    };
}

assign_from_value!(Value, bool, i64, i32, u32, f64, &str, String, chrono::NaiveTime);

impl From<Entity> for Assign {
    fn from(entity: Entity) -> Self {
        Self::Entity(Some(entity))
    }
}

impl From<&Entity> for Assign {
    fn from(entity: &Entity) -> Self {
        Self::Entity(Some(entity.clone()))
    }
}

impl From<Option<&Entity>> for Assign {
    fn from(entity: Option<&Entity>) -> Self {
        Self::Entity(entity.cloned())
    }
}

/// An ordered list of name/value assignments. Later entries win.
#[derive(Debug, Clone, Default)]
pub struct Fields(Vec<(String, Assign)>);

impl Fields {
    /// An empty assignment list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Fields::push`].
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Assign>) -> Self {
        self.push(name, value);
        self
    }

    /// Assign null to `name`.
    pub fn null(self, name: impl Into<String>) -> Self {
        self.set(name, Value::Null)
    }

    /// Append one assignment.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Assign>) {
        self.0.push((name.into(), value.into()));
    }

    /// Append every assignment of `other`.
    pub fn extend(&mut self, other: Fields) {
        self.0.extend(other.0);
    }

    /// Number of assignments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is assigned.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Fields {
    type Item = (String, Assign);
    type IntoIter = std::vec::IntoIter<(String, Assign)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name, Assign::Value(value)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::town;
    use std::collections::HashSet;

    #[test]
    fn reads_fields_through_the_store() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        assert_eq!(alice.get("title").unwrap(), Value::from("Alice"));
        assert_eq!(alice.to_string(), "Character(1)");
        assert!(matches!(alice.get("colour"), Err(OrmError::FieldNotFound { .. })));
    }

    #[test]
    fn update_clamps_ranged_fields() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        alice.update(Fields::new().set("energy", 500)).unwrap();
        assert_eq!(alice.get("energy").unwrap(), Value::Int(100));
        alice.update(Fields::new().set("mood", -40)).unwrap();
        assert_eq!(alice.get("mood").unwrap(), Value::Int(-10));
    }

    #[test]
    fn update_is_all_or_nothing() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        let err = alice
            .update(Fields::new().set("energy", 20).set("colour", "red"))
            .unwrap_err();
        assert!(matches!(err, OrmError::FieldNotFound { .. }));
        assert_eq!(alice.get("energy").unwrap(), Value::Int(80));
    }

    #[test]
    fn update_rejects_primary_key() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        assert!(matches!(
            alice.update(Fields::new().set("id", 12)),
            Err(OrmError::IllegalField { .. })
        ));
    }

    #[test]
    fn update_relation_sets_foreign_key() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        let docks = store.get_or_create("Place", 4).unwrap();
        alice.update(Fields::new().set("place", &docks)).unwrap();
        assert_eq!(alice.get("place_id").unwrap(), Value::Int(4));
        assert_eq!(alice.related("place").unwrap(), Some(docks));

        alice.update(Fields::new().set("place", None::<&Entity>)).unwrap();
        assert_eq!(alice.get("place_id").unwrap(), Value::Null);
        assert_eq!(alice.related("place").unwrap(), None);
    }

    #[test]
    fn related_follows_raw_key_writes() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        assert_eq!(alice.related("place").unwrap().unwrap().pk(), Some(1));
        alice.update(Fields::new().set("place_id", 3)).unwrap();
        assert_eq!(alice.related("place").unwrap().unwrap().pk(), Some(3));
    }

    #[test]
    fn attr_dispatches_on_name() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        assert!(matches!(alice.attr("title").unwrap(), Attr::Value(_)));
        assert!(matches!(alice.attr("place").unwrap(), Attr::Entity(Some(_))));
        assert!(matches!(alice.attr("skills").unwrap(), Attr::Set(_)));
        assert!(matches!(alice.attr("nope"), Err(OrmError::FieldNotFound { .. })));
    }

    #[test]
    fn many_to_many_resolves_through_rows() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        let skills = alice.related_set("skills").unwrap().all().unwrap();
        assert_eq!(skills.pks(), vec![1, 3]);
    }

    #[test]
    fn many_to_many_sees_new_through_rows() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        assert_eq!(alice.related_set("skills").unwrap().count().unwrap(), 2);
        let fishing = store.get_or_create("Skill", 2).unwrap();
        store
            .create(
                "CharacterSkill",
                Fields::new().set("character", &alice).set("skill", &fishing),
            )
            .unwrap();
        assert_eq!(alice.related_set("skills").unwrap().count().unwrap(), 3);
    }

    #[test]
    fn delete_tombstones_and_disassociates_children() {
        let store = town();
        let tavern = store.get_or_create("Place", 2).unwrap();
        let bruno = store.get_or_create("Character", 2).unwrap();
        assert_eq!(bruno.related("place").unwrap(), Some(tavern.clone()));

        tavern.delete().unwrap();

        assert!(tavern.is_deleted());
        assert_eq!(tavern.to_string(), "Place(deleted)");
        assert!(matches!(tavern.get("title"), Err(OrmError::Deleted { .. })));
        assert_eq!(bruno.get("place_id").unwrap(), Value::Null);
        assert_eq!(bruno.related("place").unwrap(), None);
        assert_eq!(store.row("Character", 3).unwrap()["place_id"], Value::Null);
        assert!(matches!(
            store.get_or_create("Place", 2),
            Err(OrmError::RecordNotFound { .. })
        ));

        tavern.delete().unwrap();
    }

    #[test]
    fn clone_with_copies_fields_under_a_new_key() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        let twin = alice
            .clone_with(Fields::new().set("title", "Alicia"))
            .unwrap();
        assert_eq!(twin.pk(), Some(9));
        assert_eq!(twin.get("title").unwrap(), Value::from("Alicia"));
        assert_eq!(twin.get("energy").unwrap(), Value::Int(80));
        assert_eq!(twin.related("place").unwrap().unwrap().pk(), Some(1));
    }

    #[test]
    // Hashing reads only the immutable model and key.
    #[allow(clippy::mutable_key_type)]
    fn equality_and_hash_follow_identity() {
        let store = town();
        let a = store.get_or_create("Character", 1).unwrap();
        let b = store.get_or_create("Character", 2).unwrap();
        let place = store.get_or_create("Place", 1).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, place);
        let set: HashSet<Entity> = [a.clone(), a.clone(), b.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    // Hashing reads only the immutable model and key.
    #[allow(clippy::mutable_key_type)]
    fn deleted_entities_keep_their_identity() {
        let store = town();
        let bruno = store.get_or_create("Character", 2).unwrap();
        let dmitri = store.get_or_create("Character", 4).unwrap();
        let tavern_folk = store
            .objects("Character")
            .unwrap()
            .filter(Filter::new().with("place_id", 2))
            .unwrap();
        let held: HashSet<Entity> = [bruno.clone()].into_iter().collect();

        bruno.delete().unwrap();
        dmitri.delete().unwrap();

        assert_ne!(bruno, dmitri);
        assert!(held.contains(&bruno));
        assert!(tavern_folk.contains(&bruno));
        assert!(!tavern_folk.contains(&dmitri));
        assert_eq!(bruno.pk(), None);
    }

    #[test]
    fn update_rejects_foreign_key_without_relation() {
        let store = town();
        let alice = store.get_or_create("Character", 1).unwrap();
        let before = alice.fields().unwrap();
        let err = alice
            .update(Fields::new().set("energy", 5).set("guild_id", 3))
            .unwrap_err();
        assert!(matches!(err, OrmError::IllegalField { ref field, .. } if field == "guild_id"));
        assert_eq!(alice.fields().unwrap(), before);
    }

    #[test]
    fn deleted_handles_reject_empty_updates() {
        let store = town();
        let greta = store.get_or_create("Character", 7).unwrap();
        greta.delete().unwrap();
        assert!(matches!(
            greta.update(Fields::new()),
            Err(OrmError::Deleted { .. })
        ));
    }

    #[test]
    #[allow(clippy::nonminimal_bool)]
    fn entities_are_unordered() {
        let store = town();
        let a = store.get_or_create("Character", 1).unwrap();
        let b = store.get_or_create("Character", 2).unwrap();
        assert!(!(a < b) && !(a > b) && !(a <= b) && !(a >= b));
        assert_eq!(a.partial_cmp(&b), None);
    }
}
