use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use crate::lookup::Filter;
use crate::query::{FilterPlan, QuerySet};
use crate::schema::ModelId;

/// Identity of one evaluated query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    model: ModelId,
    filter: String,
    exclude: String,
    first_only: bool,
}

impl CacheKey {
    pub(crate) fn new(model: ModelId, filter: &Filter, exclude: &Filter, first_only: bool) -> Self {
        Self {
            model,
            filter: filter.canonical(),
            exclude: exclude.canonical(),
            first_only,
        }
    }
}

/// Counters describing query cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Queries answered from the cache.
    pub hits: u64,
    /// Queries that had to be evaluated.
    pub misses: u64,
    /// Cached results dropped by writes.
    pub invalidations: u64,
    /// Distinct filter shapes compiled.
    pub plans_compiled: u64,
    /// Results currently cached.
    pub entries: usize,
}

struct CachedQuery {
    set: QuerySet,
    touched: BTreeSet<ModelId>,
}

/// Memoized query results, indexed by every model each result read.
pub(crate) struct QueryCache {
    enabled: bool,
    results: HashMap<CacheKey, CachedQuery>,
    by_model: HashMap<ModelId, HashSet<CacheKey>>,
    plans: HashMap<(ModelId, String), Rc<FilterPlan>>,
    stats: CacheStats,
}

impl QueryCache {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            results: HashMap::new(),
            by_model: HashMap::new(),
            plans: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub(crate) fn lookup(&mut self, key: &CacheKey) -> Option<QuerySet> {
        match self.results.get(key) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.set.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub(crate) fn store(&mut self, key: CacheKey, set: QuerySet, touched: BTreeSet<ModelId>) {
        if !self.enabled {
            return;
        }
        for model in &touched {
            self.by_model.entry(*model).or_default().insert(key.clone());
        }
        self.results.insert(key, CachedQuery { set, touched });
    }

    /// Drop every result that read `model`. Returns how many were dropped.
    pub(crate) fn invalidate(&mut self, model: ModelId) -> usize {
        let Some(keys) = self.by_model.remove(&model) else {
            return 0;
        };
        let mut dropped = 0;
        for key in keys {
            let Some(entry) = self.results.remove(&key) else {
                continue;
            };
            dropped += 1;
            for other in entry.touched.iter().filter(|m| **m != model) {
                if let Some(keys) = self.by_model.get_mut(other) {
                    keys.remove(&key);
                }
            }
        }
        self.stats.invalidations += dropped as u64;
        dropped
    }

    /// Drop every cached result. Compiled plans stay valid and are kept.
    pub(crate) fn clear(&mut self) {
        self.stats.invalidations += self.results.len() as u64;
        self.results.clear();
        self.by_model.clear();
    }

    pub(crate) fn plan(&self, model: ModelId, shape: &str) -> Option<Rc<FilterPlan>> {
        self.plans.get(&(model, shape.to_string())).cloned()
    }

    pub(crate) fn store_plan(&mut self, model: ModelId, shape: String, plan: Rc<FilterPlan>) {
        self.stats.plans_compiled += 1;
        self.plans.insert((model, shape), plan);
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.results.len(),
            ..self.stats
        }
    }
}
