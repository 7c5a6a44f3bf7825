//! Relation traversal over raw tables.

use std::collections::BTreeSet;

use crate::lookup::Hop;
use crate::schema::{ModelId, Pk, Record, Table};
use crate::value::Value;

/// Rows reached by following `hops` from row `start` of `source`.
///
/// To-many hops fan out; the result is the union over every path. A null
/// or dangling key ends its path.
pub(crate) fn reachable<'t>(
    tables: &'t [Table],
    hops: &[Hop],
    source: ModelId,
    start: Pk,
) -> Vec<&'t Record> {
    let mut context = source;
    let mut candidates: BTreeSet<Pk> = BTreeSet::from([start]);

    for hop in hops {
        match hop {
            Hop::Forward {
                foreign_key,
                target,
            } => {
                let rows = &tables[context.0];
                candidates = candidates
                    .iter()
                    .filter_map(|pk| rows.get(pk))
                    .filter_map(|row| key_of(row, foreign_key))
                    .collect();
                context = *target;
            }
            Hop::Through {
                through,
                from_key,
                target_key,
                target,
                stop_at_through,
            } => {
                let joined = tables[through.0].iter().filter(|(_, row)| {
                    key_of(row, from_key).is_some_and(|key| candidates.contains(&key))
                });
                if *stop_at_through {
                    candidates = joined.map(|(pk, _)| *pk).collect();
                    context = *through;
                } else {
                    candidates = joined
                        .filter_map(|(_, row)| key_of(row, target_key))
                        .collect();
                    context = *target;
                }
            }
            Hop::Reverse {
                target,
                foreign_key,
            } => {
                candidates = tables[target.0]
                    .iter()
                    .filter(|(_, row)| {
                        key_of(row, foreign_key).is_some_and(|key| candidates.contains(&key))
                    })
                    .map(|(pk, _)| *pk)
                    .collect();
                context = *target;
            }
        }
        if candidates.is_empty() {
            return Vec::new();
        }
    }

    let rows = &tables[context.0];
    candidates.iter().filter_map(|pk| rows.get(pk)).collect()
}

fn key_of(row: &Record, field: &str) -> Option<Pk> {
    row.get(field).and_then(Value::as_i64)
}
