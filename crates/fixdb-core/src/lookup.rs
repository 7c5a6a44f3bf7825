//! Lookup strings and their compiled form.
//!
//! A lookup is `hop__hop__field__comparator`, optionally followed by a
//! grouping suffix: `__orN` joins predicates into OR group `N`, and
//! `__orNaM` joins them into AND subgroup `M` of that OR group. A missing
//! index means 1.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{OrmError, OrmResult};
use crate::schema::{ModelId, PRIMARY_KEY, Relation, Schema};
use crate::value::Value;

/// Separator between lookup segments.
pub const SEPARATOR: &str = "__";

/// A predicate applied to a leaf field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    /// Loose equality; the default when no suffix is given.
    Exact,
    /// Loose inequality.
    Ne,
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    Gte,
    /// Strictly less.
    Lt,
    /// Less or equal.
    Lte,
    /// Member of a list operand.
    In,
    /// Not a member of a list operand.
    Nin,
    /// Null-ness equals a boolean operand.
    IsNull,
}

impl Comparator {
    /// Every recognized comparator.
    pub const ALL: [Self; 9] = [
        Self::Exact,
        Self::Ne,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::In,
        Self::Nin,
        Self::IsNull,
    ];

    /// Parse a comparator suffix.
    pub fn parse(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == segment)
    }

    /// The suffix naming this comparator in a lookup.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Nin => "nin",
            Self::IsNull => "isnull",
        }
    }

    /// Apply the comparator to a field value. Ordering comparisons against
    /// null or a value of another type are false.
    pub fn test(self, field: &Value, operand: &Value) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Exact => field.loose_eq(operand),
            Self::Ne => !field.loose_eq(operand),
            Self::Gt => field.compare(operand) == Some(Greater),
            Self::Gte => matches!(field.compare(operand), Some(Greater | Equal)),
            Self::Lt => field.compare(operand) == Some(Less),
            Self::Lte => matches!(field.compare(operand), Some(Less | Equal)),
            Self::In => field.is_in(operand),
            Self::Nin => !field.is_in(operand),
            Self::IsNull => field.is_null() == operand.is_truthy(),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// Which part of a filter a lookup belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {
    /// ANDed with every other base predicate.
    Base,
    /// A member of OR group `N`.
    Or(u32),
    /// A member of AND subgroup `M` inside OR group `N`.
    OrAnd(u32, u32),
}

/// Split a grouping suffix off a lookup key.
pub fn split_group(lookup: &str) -> (&str, Group) {
    lookup
        .rsplit_once(SEPARATOR)
        .and_then(|(head, tail)| parse_group(tail).map(|group| (head, group)))
        .unwrap_or((lookup, Group::Base))
}

fn parse_group(tail: &str) -> Option<Group> {
    let rest = tail.strip_prefix("or")?;
    let (or_digits, and_digits) = match rest.split_once('a') {
        Some((or_digits, and_digits)) => (or_digits, Some(and_digits)),
        None => (rest, None),
    };
    let or = parse_index(or_digits)?;
    match and_digits {
        None => Some(Group::Or(or)),
        Some(digits) => Some(Group::OrAnd(or, parse_index(digits)?)),
    }
}

fn parse_index(digits: &str) -> Option<u32> {
    if digits.is_empty() {
        return Some(1);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// A set of lookups and their operands, combined per their grouping suffixes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(BTreeMap<String, Value>);

impl Filter {
    /// An empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Filter::insert`].
    pub fn with(mut self, lookup: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(lookup, value);
        self
    }

    /// Add one lookup, replacing any previous operand.
    pub fn insert(&mut self, lookup: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(lookup.into(), value.into());
    }

    /// Add every lookup of `other`, replacing operands of repeated keys.
    pub fn extend(&mut self, other: Filter) {
        self.0.extend(other.0);
    }

    /// Operand of `lookup`.
    pub fn get(&self, lookup: &str) -> Option<&Value> {
        self.0.get(lookup)
    }

    /// Lookups in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of lookups.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the filter has no lookups.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Order-independent rendering of lookups and operands, used as a cache key.
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v:?}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// The lookups without their operands.
    pub fn shape(&self) -> String {
        self.0.keys().cloned().collect::<Vec<_>>().join("&")
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Filter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Compiled lookups
// ---------------------------------------------------------------------------

/// One step of a relation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Hop {
    /// Follow a stored foreign key.
    Forward {
        foreign_key: String,
        target: ModelId,
    },
    /// Join through rows of `through`. With `stop_at_through` the path lands
    /// on the through rows themselves.
    Through {
        through: ModelId,
        from_key: String,
        target_key: String,
        target: ModelId,
        stop_at_through: bool,
    },
    /// Collect target rows whose `foreign_key` points back.
    Reverse {
        target: ModelId,
        foreign_key: String,
    },
}

/// A lookup resolved against a schema.
#[derive(Debug, Clone)]
pub(crate) struct CompiledLookup {
    pub(crate) hops: Vec<Hop>,
    /// Model owning `field`.
    pub(crate) leaf: ModelId,
    pub(crate) field: String,
    pub(crate) comparator: Comparator,
    /// Every model the lookup reads.
    pub(crate) touched: BTreeSet<ModelId>,
}

/// Compile a lookup (without grouping suffix) on `model`.
pub(crate) fn compile(schema: &Schema, model: ModelId, lookup: &str) -> OrmResult<CompiledLookup> {
    let mut segments: Vec<&str> = lookup.split(SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(OrmError::EmptyLookup(lookup.to_string()));
    }

    let comparator = match segments.last().and_then(|s| Comparator::parse(s)) {
        Some(comparator) => {
            segments.pop();
            comparator
        }
        None => Comparator::Exact,
    };
    let Some((field, hops)) = segments.split_last() else {
        return Err(OrmError::EmptyLookup(lookup.to_string()));
    };

    let (hops, leaf, touched) = compile_path(schema, model, hops, field)
        .map_err(|error| unknown_comparator(schema, model, lookup, &segments, error))?;
    Ok(CompiledLookup {
        hops,
        leaf,
        field: field.to_string(),
        comparator,
        touched,
    })
}

/// Compile a value path (`hop__hop__field`, no comparator) on `model`.
pub(crate) fn compile_values_path(
    schema: &Schema,
    model: ModelId,
    path: &str,
) -> OrmResult<CompiledLookup> {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    let Some((field, hops)) = segments.split_last().filter(|_| !segments.iter().any(|s| s.is_empty()))
    else {
        return Err(OrmError::EmptyLookup(path.to_string()));
    };
    let (hops, leaf, touched, field) = match compile_path(schema, model, hops, field) {
        Ok((hops, leaf, touched)) => (hops, leaf, touched, field.to_string()),
        Err(OrmError::FieldNotFound { model: owner, field: name }) => {
            // A bare many-to-one name projects the linked key.
            let Some(Relation::ManyToOne { foreign_key, .. }) =
                schema.lookup(&owner).and_then(|m| m.relation(&name))
            else {
                return Err(OrmError::FieldNotFound { model: owner, field: name });
            };
            let (hops, leaf, touched) = compile_path(schema, model, hops, foreign_key)?;
            (hops, leaf, touched, foreign_key.clone())
        }
        Err(error) => return Err(error),
    };
    Ok(CompiledLookup {
        hops,
        leaf,
        field,
        comparator: Comparator::Exact,
        touched,
    })
}

fn compile_path(
    schema: &Schema,
    model: ModelId,
    hops: &[&str],
    field: &str,
) -> OrmResult<(Vec<Hop>, ModelId, BTreeSet<ModelId>)> {
    let mut context = model;
    let mut compiled = Vec::with_capacity(hops.len());
    let mut touched = BTreeSet::from([model]);

    for (i, name) in hops.iter().enumerate() {
        let current = schema.model(context);
        let Some(relation) = current.relation(name) else {
            return Err(OrmError::RelationNotFound {
                model: current.name().to_string(),
                relation: name.to_string(),
            });
        };
        touched.extend(relation.models());
        let hop = match relation {
            Relation::ManyToOne {
                foreign_key,
                target,
            } => Hop::Forward {
                foreign_key: foreign_key.clone(),
                target: *target,
            },
            Relation::ManyToMany {
                through,
                from_key,
                target_key,
                target,
            } => {
                // The last join may stop on the through rows when the leaf
                // field lives there.
                let stop_at_through = i + 1 == hops.len()
                    && field != PRIMARY_KEY
                    && schema.model(*through).has_field(field);
                Hop::Through {
                    through: *through,
                    from_key: from_key.clone(),
                    target_key: target_key.clone(),
                    target: *target,
                    stop_at_through,
                }
            }
            Relation::ReverseSet {
                target,
                foreign_key,
            } => Hop::Reverse {
                target: *target,
                foreign_key: foreign_key.clone(),
            },
        };
        context = match &hop {
            Hop::Through {
                through,
                stop_at_through: true,
                ..
            } => *through,
            _ => relation.target(),
        };
        compiled.push(hop);
    }

    let leaf = schema.model(context);
    if !leaf.has_field(field) {
        return Err(OrmError::FieldNotFound {
            model: leaf.name().to_string(),
            field: field.to_string(),
        });
    }
    Ok((compiled, context, touched))
}

/// `title__foo` fails as a missing relation `title`; report it as an unknown
/// comparator `foo` on the stored field instead.
fn unknown_comparator(
    schema: &Schema,
    model: ModelId,
    lookup: &str,
    segments: &[&str],
    error: OrmError,
) -> OrmError {
    let relation = match &error {
        OrmError::RelationNotFound { relation, .. } => relation.clone(),
        _ => return error,
    };
    let Some(position) = segments.iter().position(|s| *s == relation) else {
        return error;
    };
    if position + 2 != segments.len() {
        return error;
    }
    // Walk to the model owning the would-be field.
    let mut context = model;
    for name in &segments[..position] {
        match schema.model(context).relation(name) {
            Some(relation) => context = relation.target(),
            None => return error,
        }
    }
    if schema.model(context).has_field(&relation) {
        return OrmError::UnknownComparator {
            lookup: lookup.to_string(),
            comparator: segments[position + 1].to_string(),
        };
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::town;

    #[test]
    fn parses_group_suffixes() {
        assert_eq!(split_group("title"), ("title", Group::Base));
        assert_eq!(split_group("energy__gt__or"), ("energy__gt", Group::Or(1)));
        assert_eq!(split_group("energy__gt__or2"), ("energy__gt", Group::Or(2)));
        assert_eq!(split_group("mood__or1a"), ("mood", Group::OrAnd(1, 1)));
        assert_eq!(split_group("mood__or3a2"), ("mood", Group::OrAnd(3, 2)));
        assert_eq!(split_group("mood__ora"), ("mood", Group::OrAnd(1, 1)));
        assert_eq!(split_group("mood__orb"), ("mood__orb", Group::Base));
        assert_eq!(split_group("place__origin"), ("place__origin", Group::Base));
    }

    #[test]
    fn comparators_follow_loose_typing() {
        let five = Value::Int(5);
        assert!(Comparator::Exact.test(&five, &Value::Float(5.0)));
        assert!(Comparator::Gt.test(&five, &Value::Int(4)));
        assert!(!Comparator::Gt.test(&Value::Null, &Value::Int(4)));
        assert!(!Comparator::Lt.test(&Value::Null, &Value::Int(4)));
        assert!(Comparator::Ne.test(&Value::Null, &Value::Int(4)));
        assert!(Comparator::In.test(&five, &Value::from(vec![1, 5])));
        assert!(Comparator::Nin.test(&five, &Value::from(vec![1, 2])));
        assert!(Comparator::IsNull.test(&Value::Null, &Value::Bool(true)));
        assert!(Comparator::IsNull.test(&five, &Value::Bool(false)));
    }

    #[test]
    fn canonical_form_ignores_insertion_order() {
        let a = Filter::new().with("b", 1).with("a", "x");
        let b = Filter::new().with("a", "x").with("b", 1);
        assert_eq!(a.canonical(), b.canonical());
        assert_ne!(
            Filter::new().with("a", 1).canonical(),
            Filter::new().with("a", "1").canonical()
        );
        assert_eq!(a.shape(), "a&b");
    }

    #[test]
    fn compiles_paths_across_relation_kinds() {
        let store = town();
        let schema = store.schema();
        let character = schema.id_of("Character").unwrap();
        let place = schema.id_of("Place").unwrap();

        let direct = compile(schema, character, "energy__gte").unwrap();
        assert!(direct.hops.is_empty());
        assert_eq!(direct.comparator, Comparator::Gte);

        let forward = compile(schema, character, "place__title").unwrap();
        assert_eq!(forward.comparator, Comparator::Exact);
        assert!(matches!(forward.hops[..], [Hop::Forward { .. }]));
        assert!(forward.touched.contains(&place));

        let multi = compile(schema, place, "character_set__skills__difficulty__gt").unwrap();
        assert!(matches!(
            multi.hops[..],
            [Hop::Reverse { .. }, Hop::Through { stop_at_through: false, .. }]
        ));
        assert_eq!(multi.touched.len(), 4);
    }

    #[test]
    fn many_to_many_leaf_on_through_table_stops_early() {
        let store = town();
        let schema = store.schema();
        let character = schema.id_of("Character").unwrap();
        let level = compile(schema, character, "skills__level__gte").unwrap();
        assert!(matches!(level.hops[..], [Hop::Through { stop_at_through: true, .. }]));
        let id = compile(schema, character, "skills__id").unwrap();
        assert!(matches!(id.hops[..], [Hop::Through { stop_at_through: false, .. }]));
    }

    #[test]
    fn reports_lookup_errors() {
        let store = town();
        let schema = store.schema();
        let character = schema.id_of("Character").unwrap();
        assert!(matches!(
            compile(schema, character, "gt"),
            Err(OrmError::EmptyLookup(_))
        ));
        assert!(matches!(
            compile(schema, character, "place____title"),
            Err(OrmError::EmptyLookup(_))
        ));
        assert!(matches!(
            compile(schema, character, "colour"),
            Err(OrmError::FieldNotFound { .. })
        ));
        assert!(matches!(
            compile(schema, character, "house__title"),
            Err(OrmError::RelationNotFound { .. })
        ));
        assert!(matches!(
            compile(schema, character, "energy__most"),
            Err(OrmError::UnknownComparator { ref comparator, .. }) if comparator == "most"
        ));
        assert!(matches!(
            compile(schema, character, "place__title__like"),
            Err(OrmError::UnknownComparator { .. })
        ));
    }
}
