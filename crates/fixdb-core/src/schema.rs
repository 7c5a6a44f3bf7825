use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::value::Value;

/// Primary key type shared by every model.
pub type Pk = i64;

/// A raw field-name to value table for one row.
pub type Record = BTreeMap<String, Value>;

/// All records of one model, iterated in ascending primary-key order.
pub type Table = BTreeMap<Pk, Record>;

/// Name of the primary-key field every model stores.
pub const PRIMARY_KEY: &str = "id";

/// Suffix that marks a field as the foreign key of a many-to-one relation.
pub const FOREIGN_KEY_SUFFIX: &str = "_id";

/// Foreign-key field name for a many-to-one relation (`place` -> `place_id`).
pub fn foreign_key_for(relation: &str) -> String {
    format!("{relation}{FOREIGN_KEY_SUFFIX}")
}

/// Relation name implied by a foreign-key field (`place_id` -> `place`).
pub fn relation_for_foreign_key(field: &str) -> Option<&str> {
    field
        .strip_suffix(FOREIGN_KEY_SUFFIX)
        .filter(|relation| !relation.is_empty())
}

/// Index of a model within its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub(crate) usize);

impl ModelId {
    /// Position of the model in declaration order.
    pub fn index(self) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// One declarative schema+seed document, as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDocument {
    /// Model name, unique across the document set.
    pub name: String,
    /// Stored field names. `id` is implied.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Values used for fields a row or `create` call leaves out.
    #[serde(default)]
    pub defaults: BTreeMap<String, serde_json::Value>,
    /// Inclusive numeric bounds enforced on update.
    #[serde(default)]
    pub ranges: BTreeMap<String, RangeDocument>,
    /// Fields holding `HH:MM:SS` time-of-day strings.
    #[serde(default)]
    pub time_fields: Vec<String>,
    /// Relation name to target model. The foreign key is `<relation>_id`.
    #[serde(default)]
    pub many_to_one: BTreeMap<String, String>,
    /// Relations traversing a through table.
    #[serde(default)]
    pub many_to_many: BTreeMap<String, ManyToManyDocument>,
    /// Collections of target rows pointing back at this model.
    #[serde(default)]
    pub reverse_sets: BTreeMap<String, ReverseSetDocument>,
    /// Seed rows keyed by decimal primary key.
    #[serde(default)]
    pub objects: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl SchemaDocument {
    /// Parse a document from JSON text. `origin` names it in errors.
    pub fn from_json_str(origin: &str, json: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(json).map_err(|error| SchemaError::Json {
            origin: origin.to_string(),
            error,
        })
    }
}

/// Declared `{min, max}` bounds of a numeric attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeDocument {
    /// Lower bound.
    pub min: serde_json::Number,
    /// Upper bound.
    pub max: serde_json::Number,
}

/// Declaration of a many-to-many relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManyToManyDocument {
    /// Target model.
    pub model: String,
    /// Model whose rows join the two sides.
    pub through: String,
    /// Through-table field holding this model's key.
    pub from_key: String,
    /// Through-table field holding the target's key.
    pub target_key: String,
}

/// Declaration of a reverse-set relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseSetDocument {
    /// Model whose rows point here.
    pub model: String,
    /// Field on the target model holding this model's key.
    pub foreign_key: String,
}

// ---------------------------------------------------------------------------
// Linked schema
// ---------------------------------------------------------------------------

/// Inclusive bounds of a range-constrained attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrRange {
    /// Smallest value kept.
    pub min: Value,
    /// Largest value kept.
    pub max: Value,
}

impl AttrRange {
    /// Clamp `value` into `[min, max]`. Incomparable values pass through.
    pub fn clamp(&self, value: Value) -> Value {
        if value.compare(&self.min) == Some(std::cmp::Ordering::Less) {
            self.min.clone()
        } else if value.compare(&self.max) == Some(std::cmp::Ordering::Greater) {
            self.max.clone()
        } else {
            value
        }
    }
}

/// How one model reaches another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// This model stores the target's key in `foreign_key`.
    ManyToOne {
        /// Stored field on this model.
        foreign_key: String,
        /// Model pointed at.
        target: ModelId,
    },
    /// Rows of `through` pair `from_key` (this model) with `target_key`.
    ManyToMany {
        /// Join model.
        through: ModelId,
        /// Through field holding this model's key.
        from_key: String,
        /// Through field holding the target's key.
        target_key: String,
        /// Model reached through the join.
        target: ModelId,
    },
    /// Rows of `target` store this model's key in `foreign_key`.
    ReverseSet {
        /// Model whose rows point here.
        target: ModelId,
        /// Field on `target` holding this model's key.
        foreign_key: String,
    },
}

impl Relation {
    /// The model the relation lands on.
    pub fn target(&self) -> ModelId {
        match self {
            Self::ManyToOne { target, .. }
            | Self::ManyToMany { target, .. }
            | Self::ReverseSet { target, .. } => *target,
        }
    }

    /// Every model a traversal of this relation reads, through tables included.
    pub fn models(&self) -> Vec<ModelId> {
        match self {
            Self::ManyToMany {
                through, target, ..
            } => vec![*through, *target],
            other => vec![other.target()],
        }
    }
}

/// The linked schema of one model.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    pub(crate) id: ModelId,
    pub(crate) name: String,
    pub(crate) fields: BTreeSet<String>,
    pub(crate) defaults: BTreeMap<String, Value>,
    pub(crate) ranges: BTreeMap<String, AttrRange>,
    pub(crate) time_fields: BTreeSet<String>,
    pub(crate) relations: BTreeMap<String, Relation>,
}

impl ModelSchema {
    /// Position of this model in its schema.
    pub fn id(&self) -> ModelId {
        self.id
    }

    /// Declared model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored field names, `id` included.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    /// Whether `field` is stored.
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// Declared default of `field`.
    pub fn default_for(&self, field: &str) -> Option<&Value> {
        self.defaults.get(field)
    }

    /// Declared bounds of `field`.
    pub fn range(&self, field: &str) -> Option<&AttrRange> {
        self.ranges.get(field)
    }

    /// Whether `field` holds times of day.
    pub fn is_time_field(&self, field: &str) -> bool {
        self.time_fields.contains(field)
    }

    /// The relation named `name`.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Every relation with its name.
    pub fn relations(&self) -> impl Iterator<Item = (&str, &Relation)> {
        self.relations.iter().map(|(name, rel)| (name.as_str(), rel))
    }

    /// A record holding defaults (or null) for every field.
    pub fn blank_record(&self, pk: Pk) -> Record {
        self.fields
            .iter()
            .map(|field| {
                let value = if field == PRIMARY_KEY {
                    Value::Int(pk)
                } else {
                    self.defaults.get(field).cloned().unwrap_or_default()
                };
                (field.clone(), value)
            })
            .collect()
    }

    /// Normalize a value written to `field`: time fields accept `HH:MM:SS`
    /// strings. Returns `None` when a time field gets an unparseable value.
    pub(crate) fn coerce(&self, field: &str, value: Value) -> Option<Value> {
        if !self.is_time_field(field) {
            return Some(value);
        }
        match value {
            Value::Str(s) => Value::parse_time(&s),
            Value::Time(_) | Value::Null => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ModelSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Every linked model schema, indexed by [`ModelId`] and by name.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub(crate) models: Vec<ModelSchema>,
    pub(crate) by_name: HashMap<String, ModelId>,
}

impl Schema {
    /// Schema of a model id minted by this schema.
    pub fn model(&self, id: ModelId) -> &ModelSchema {
        &self.models[id.0]
    }

    /// Find a model by name.
    pub fn lookup(&self, name: &str) -> Option<&ModelSchema> {
        self.by_name.get(name).map(|id| &self.models[id.0])
    }

    /// Id of the model named `name`.
    pub fn id_of(&self, name: &str) -> Option<ModelId> {
        self.by_name.get(name).copied()
    }

    /// Models in declaration order.
    pub fn models(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models.iter()
    }

    /// Number of models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no models are declared.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_convention() {
        assert_eq!(foreign_key_for("place"), "place_id");
        assert_eq!(relation_for_foreign_key("place_id"), Some("place"));
        assert_eq!(relation_for_foreign_key("id"), None);
        assert_eq!(relation_for_foreign_key("_id"), None);
        assert_eq!(relation_for_foreign_key("title"), None);
    }

    #[test]
    fn clamp_keeps_values_inside_bounds() {
        let range = AttrRange {
            min: Value::Int(0),
            max: Value::Int(100),
        };
        assert_eq!(range.clamp(Value::Int(-5)), Value::Int(0));
        assert_eq!(range.clamp(Value::Int(150)), Value::Int(100));
        assert_eq!(range.clamp(Value::Int(42)), Value::Int(42));
        assert_eq!(range.clamp(Value::Float(99.5)), Value::Float(99.5));
        assert_eq!(range.clamp(Value::Null), Value::Null);
    }

    #[test]
    fn document_parses_with_missing_sections() {
        let doc = SchemaDocument::from_json_str("inline", r#"{"name": "Place", "fields": ["title"]}"#)
            .unwrap();
        assert_eq!(doc.name, "Place");
        assert!(doc.objects.is_empty());
        assert!(doc.many_to_one.is_empty());
    }

    #[test]
    fn document_parse_error_names_origin() {
        let err = SchemaDocument::from_json_str("place.json", "{").unwrap_err();
        assert!(err.to_string().contains("place.json"));
    }
}
