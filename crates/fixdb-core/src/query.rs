use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::cache::CacheKey;
use crate::entity::Entity;
use crate::error::{OrmError, OrmResult};
use crate::lookup::{self, Comparator, CompiledLookup, Filter, Group};
use crate::resolver;
use crate::schema::{ModelId, PRIMARY_KEY, Pk, Record, Schema, Table};
use crate::store::{Store, StoreShared};
use crate::value::Value;

static NULL: Value = Value::Null;

/// A possibly unevaluated sequence of entities of one model.
///
/// Query sets are immutable: `filter`, `exclude`, and `order_by` return new
/// sets. A set from [`Store::objects`] or a relation is unevaluated until
/// read; reading methods evaluate it against the current rows first.
#[derive(Clone)]
pub struct QuerySet {
    store: Weak<StoreShared>,
    model: ModelId,
    base: Filter,
    exclude: Filter,
    instances: Option<Rc<[Entity]>>,
}

impl QuerySet {
    pub(crate) fn unevaluated(store: Weak<StoreShared>, model: ModelId, base: Filter) -> Self {
        Self {
            store,
            model,
            base,
            exclude: Filter::new(),
            instances: None,
        }
    }

    pub(crate) fn evaluated(
        store: Weak<StoreShared>,
        model: ModelId,
        base: Filter,
        exclude: Filter,
        instances: Vec<Entity>,
    ) -> Self {
        Self {
            store,
            model,
            base,
            exclude,
            instances: Some(instances.into()),
        }
    }

    /// Model the set ranges over.
    pub fn model(&self) -> ModelId {
        self.model
    }

    /// Lookups every member satisfies.
    pub fn base_filter(&self) -> &Filter {
        &self.base
    }

    /// Lookups no member satisfies.
    pub fn exclude_filter(&self) -> &Filter {
        &self.exclude
    }

    /// Whether the members have been computed.
    pub fn is_evaluated(&self) -> bool {
        self.instances.is_some()
    }

    /// Whether both sets share one evaluated instance list, as cached
    /// results do.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        match (&a.instances, &b.instances) {
            (Some(x), Some(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    fn store(&self) -> OrmResult<Store> {
        self.store
            .upgrade()
            .map(Store::from_shared)
            .ok_or(OrmError::StoreDropped)
    }

    fn snapshot(&self) -> OrmResult<Rc<[Entity]>> {
        match &self.instances {
            Some(instances) => Ok(instances.clone()),
            None => Ok(self
                .filter(Filter::new())?
                .instances
                .unwrap_or_else(|| Rc::from(Vec::new()))),
        }
    }

    /// This set, evaluated.
    pub fn all(&self) -> OrmResult<QuerySet> {
        if self.is_evaluated() {
            return Ok(self.clone());
        }
        self.filter(Filter::new())
    }

    /// Rows matching this set's lookups and `lookups`, evaluated now.
    pub fn filter(&self, lookups: Filter) -> OrmResult<QuerySet> {
        let mut base = self.base.clone();
        base.extend(lookups);
        evaluate(&self.store()?, self.model, base, self.exclude.clone(), false)
    }

    /// The first row matching this set's lookups and `lookups`. Stops
    /// scanning at the first match.
    pub fn get(&self, lookups: Filter) -> OrmResult<Option<Entity>> {
        let mut base = self.base.clone();
        base.extend(lookups);
        let found = evaluate(&self.store()?, self.model, base, self.exclude.clone(), true)?;
        Ok(found.iter().next().cloned())
    }

    /// Members that match none of `lookups`. Grouping suffixes are ignored;
    /// every exclude lookup stands alone.
    pub fn exclude(&self, lookups: Filter) -> OrmResult<QuerySet> {
        let current = self.snapshot()?;
        let mut exclude = self.exclude.clone();
        if lookups.is_empty() {
            return Ok(self.with_instances(exclude, current.to_vec()));
        }

        let store = self.store()?;
        let plan = plan_for(&store, self.model, &Filter::new(), &lookups)?;
        let kept: Vec<Entity> = {
            let tables = store.tables();
            let table = &tables[self.model.0];
            current
                .iter()
                .filter(|entity| {
                    entity
                        .pk()
                        .and_then(|pk| table.get(&pk).map(|row| (pk, row)))
                        .is_some_and(|(pk, row)| !plan.excluded(&tables, pk, row, &lookups))
                })
                .cloned()
                .collect()
        };
        exclude.extend(lookups);
        Ok(self.with_instances(exclude, kept))
    }

    /// Members sorted by `field`; a leading `-` sorts descending. The sort is
    /// stable and nulls sort first.
    pub fn order_by(&self, field: &str) -> OrmResult<QuerySet> {
        let (field, descending) = match field.strip_prefix('-') {
            Some(field) => (field, true),
            None => (field, false),
        };
        let current = self.snapshot()?;
        let mut keyed = current
            .iter()
            .map(|entity| Ok((entity.get(field)?, entity.clone())))
            .collect::<OrmResult<Vec<(Value, Entity)>>>()?;
        keyed.sort_by(|(a, _), (b, _)| {
            let ordering = a.total_cmp(b);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        let sorted = keyed.into_iter().map(|(_, entity)| entity).collect();
        Ok(self.with_instances(self.exclude.clone(), sorted))
    }

    /// First member, evaluating the set if needed.
    pub fn first(&self) -> OrmResult<Option<Entity>> {
        Ok(self.snapshot()?.first().cloned())
    }

    /// Number of members, evaluating the set if needed.
    pub fn count(&self) -> OrmResult<usize> {
        Ok(self.snapshot()?.len())
    }

    /// Members not deleted since the set was evaluated.
    pub fn count_live(&self) -> OrmResult<usize> {
        Ok(self.snapshot()?.iter().filter(|e| !e.is_deleted()).count())
    }

    /// One row of field values per member, in member order.
    pub fn values(&self, fields: &[&str]) -> OrmResult<Vec<Vec<Value>>> {
        let store = self.store()?;
        let paths = fields
            .iter()
            .map(|field| lookup::compile_values_path(store.schema(), self.model, field))
            .collect::<OrmResult<Vec<_>>>()?;
        self.snapshot()?
            .iter()
            .map(|entity| {
                paths
                    .iter()
                    .map(|path| project(&store, entity, path))
                    .collect::<OrmResult<Vec<Value>>>()
            })
            .collect()
    }

    /// Values of one field path per member. A path through relations yields
    /// a list of every value reached.
    pub fn values_list(&self, path: &str) -> OrmResult<Vec<Value>> {
        let store = self.store()?;
        let path = lookup::compile_values_path(store.schema(), self.model, path)?;
        self.snapshot()?
            .iter()
            .map(|entity| project(&store, entity, &path))
            .collect()
    }

    /// Members of an evaluated set. Unevaluated sets yield nothing; call
    /// [`QuerySet::all`] first.
    pub fn iter(&self) -> std::slice::Iter<'_, Entity> {
        self.instances.as_deref().unwrap_or(&[]).iter()
    }

    /// Number of members of an evaluated set.
    pub fn len(&self) -> usize {
        self.instances.as_deref().map_or(0, <[Entity]>::len)
    }

    /// Whether an evaluated set has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `entity` is a member of an evaluated set.
    pub fn contains(&self, entity: &Entity) -> bool {
        self.iter().any(|member| member == entity)
    }

    /// Primary keys of live members.
    pub fn pks(&self) -> Vec<Pk> {
        self.iter().filter_map(Entity::pk).collect()
    }

    fn with_instances(&self, exclude: Filter, instances: Vec<Entity>) -> QuerySet {
        QuerySet::evaluated(
            self.store.clone(),
            self.model,
            self.base.clone(),
            exclude,
            instances,
        )
    }
}

impl<'a> IntoIterator for &'a QuerySet {
    type Item = &'a Entity;
    type IntoIter = std::slice::Iter<'a, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instances {
            Some(instances) => {
                let members: Vec<String> = instances.iter().map(ToString::to_string).collect();
                write!(f, "QuerySet({})", members.join(", "))
            }
            None => write!(f, "QuerySet(<unevaluated>)"),
        }
    }
}

impl fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model)
            .field("base", &self.base)
            .field("exclude", &self.exclude)
            .field("instances", &self.instances.as_deref())
            .finish()
    }
}

fn project(store: &Store, entity: &Entity, path: &CompiledLookup) -> OrmResult<Value> {
    let pk = entity.id()?;
    if path.hops.is_empty() {
        return entity.get(&path.field);
    }
    let tables = store.tables();
    let reached = resolver::reachable(&tables, &path.hops, entity.model(), pk)
        .into_iter()
        .map(|row| row.get(&path.field).cloned().unwrap_or_default())
        .collect();
    Ok(Value::List(reached))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// A compiled lookup and the filter key holding its operand.
#[derive(Debug)]
struct Predicate {
    key: String,
    lookup: CompiledLookup,
    // Leaf is a time field; string operands are parsed as `HH:MM:SS`.
    time_field: bool,
}

impl Predicate {
    fn new(schema: &Schema, key: &str, lookup: CompiledLookup) -> Self {
        let time_field = schema.model(lookup.leaf).is_time_field(&lookup.field);
        Self {
            key: key.to_string(),
            lookup,
            time_field,
        }
    }

    fn matches(&self, tables: &[Table], model: ModelId, pk: Pk, row: &Record, filter: &Filter) -> bool {
        let operand = filter.get(&self.key).unwrap_or(&NULL);
        let parsed;
        let operand = if self.time_field {
            parsed = time_operand(operand);
            &parsed
        } else {
            operand
        };
        let lookup = &self.lookup;
        if lookup.hops.is_empty() {
            let field = row.get(&lookup.field).unwrap_or(&NULL);
            return lookup.comparator.test(field, operand);
        }
        resolver::reachable(tables, &lookup.hops, model, pk)
            .into_iter()
            .any(|reached| {
                let field = reached.get(&lookup.field).unwrap_or(&NULL);
                lookup.comparator.test(field, operand)
            })
    }
}

fn time_operand(operand: &Value) -> Value {
    match operand {
        Value::Str(s) => Value::parse_time(s).unwrap_or_else(|| operand.clone()),
        Value::List(items) => Value::List(items.iter().map(time_operand).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Default)]
struct OrGroup {
    singles: Vec<Predicate>,
    subgroups: BTreeMap<u32, Vec<Predicate>>,
}

/// The compiled form of one filter shape: which lookups there are and how
/// they combine, independent of their operands.
#[derive(Debug)]
pub(crate) struct FilterPlan {
    model: ModelId,
    // Ungrouped `id`, `id__in`, and `id__nin` lookups.
    id_lookups: Vec<(Comparator, String)>,
    base: Vec<Predicate>,
    groups: BTreeMap<u32, OrGroup>,
    excludes: Vec<Predicate>,
    touched: BTreeSet<ModelId>,
}

impl FilterPlan {
    pub(crate) fn compile(
        schema: &Schema,
        model: ModelId,
        base: &Filter,
        exclude: &Filter,
    ) -> OrmResult<Self> {
        let mut plan = Self {
            model,
            id_lookups: Vec::new(),
            base: Vec::new(),
            groups: BTreeMap::new(),
            excludes: Vec::new(),
            touched: BTreeSet::from([model]),
        };

        for (key, _) in base.iter() {
            let (lookup, group) = lookup::split_group(key);
            let compiled = lookup::compile(schema, model, lookup)?;
            plan.touched.extend(compiled.touched.iter().copied());

            let is_id = compiled.hops.is_empty()
                && compiled.field == PRIMARY_KEY
                && matches!(
                    compiled.comparator,
                    Comparator::Exact | Comparator::In | Comparator::Nin
                );
            let predicate = Predicate::new(schema, key, compiled);
            match group {
                Group::Base if is_id => plan
                    .id_lookups
                    .push((predicate.lookup.comparator, predicate.key)),
                Group::Base => plan.base.push(predicate),
                Group::Or(n) => plan.groups.entry(n).or_default().singles.push(predicate),
                Group::OrAnd(n, m) => plan
                    .groups
                    .entry(n)
                    .or_default()
                    .subgroups
                    .entry(m)
                    .or_default()
                    .push(predicate),
            }
        }

        for (key, _) in exclude.iter() {
            let (lookup, _) = lookup::split_group(key);
            let compiled = lookup::compile(schema, model, lookup)?;
            plan.touched.extend(compiled.touched.iter().copied());
            plan.excludes.push(Predicate::new(schema, key, compiled));
        }

        Ok(plan)
    }

    fn admits(&self, tables: &[Table], pk: Pk, row: &Record, filter: &Filter) -> bool {
        let id = Value::Int(pk);
        let key_ok = self
            .id_lookups
            .iter()
            .all(|(comparator, key)| comparator.test(&id, filter.get(key).unwrap_or(&NULL)));
        let matches = |p: &Predicate| p.matches(tables, self.model, pk, row, filter);
        key_ok
            && self.base.iter().all(matches)
            && self.groups.values().all(|group| {
                group.singles.iter().any(matches)
                    || group.subgroups.values().any(|sub| sub.iter().all(matches))
            })
    }

    fn excluded(&self, tables: &[Table], pk: Pk, row: &Record, exclude: &Filter) -> bool {
        self.excludes
            .iter()
            .any(|p| p.matches(tables, self.model, pk, row, exclude))
    }

    fn matching(&self, tables: &[Table], base: &Filter, exclude: &Filter, first_only: bool) -> Vec<Pk> {
        let table = &tables[self.model.0];
        // An exact key lookup narrows the scan to one row.
        let exact = self
            .id_lookups
            .iter()
            .find(|(comparator, _)| *comparator == Comparator::Exact)
            .and_then(|(_, key)| base.get(key))
            .and_then(Value::as_i64);
        let rows: Box<dyn Iterator<Item = (&Pk, &Record)> + '_> = match exact {
            Some(pk) => Box::new(table.get_key_value(&pk).into_iter()),
            None => Box::new(table.iter()),
        };

        let mut found = Vec::new();
        for (&pk, row) in rows {
            if self.admits(tables, pk, row, base) && !self.excluded(tables, pk, row, exclude) {
                found.push(pk);
                if first_only {
                    break;
                }
            }
        }
        found
    }
}

fn plan_for(store: &Store, model: ModelId, base: &Filter, exclude: &Filter) -> OrmResult<Rc<FilterPlan>> {
    let shape = format!("{}|{}", base.shape(), exclude.shape());
    let cached = store.cache_mut().plan(model, &shape);
    if let Some(plan) = cached {
        return Ok(plan);
    }
    let plan = Rc::new(FilterPlan::compile(store.schema(), model, base, exclude)?);
    store.cache_mut().store_plan(model, shape, plan.clone());
    Ok(plan)
}

/// Evaluate a filter against the current rows, consulting the query cache.
pub(crate) fn evaluate(
    store: &Store,
    model: ModelId,
    base: Filter,
    exclude: Filter,
    first_only: bool,
) -> OrmResult<QuerySet> {
    let started = Instant::now();
    let name = store.schema().model(model).name();
    let key = CacheKey::new(model, &base, &exclude, first_only);
    let cached = store.cache_mut().lookup(&key);
    if let Some(hit) = cached {
        tracing::trace!(model = name, filter = %base, rows = hit.len(), "query cache hit");
        return Ok(hit);
    }

    let plan = plan_for(store, model, &base, &exclude)?;
    let pks = plan.matching(&store.tables(), &base, &exclude, first_only);
    let instances = pks
        .into_iter()
        .map(|pk| store.entity(model, pk))
        .collect::<OrmResult<Vec<_>>>()?;
    let set = QuerySet::evaluated(store.downgrade(), model, base, exclude, instances);
    store
        .cache_mut()
        .store(key, set.clone(), plan.touched.clone());

    tracing::trace!(
        model = name,
        filter = %set.base,
        rows = set.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "query cache miss"
    );
    Ok(set)
}
