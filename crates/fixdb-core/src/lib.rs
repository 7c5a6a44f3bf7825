//! Core of fixdb: an in-memory ORM over declarative fixture data.
//!
//! Schema documents declare models, their relations, and seed rows. The
//! [`loader`] links them into a [`Schema`], a [`Store`] holds the rows and
//! hands out identity-mapped [`Entity`] handles, and [`QuerySet`] filters
//! rows with Django-style lookups across relations, memoizing results until
//! a write invalidates them.

/// Memoized query results and cache counters.
pub mod cache;
/// Store options.
pub mod config;
/// Live entity handles and write arguments.
pub mod entity;
/// Error types used throughout the crate.
pub mod error;
/// Two-phase loading and linking of schema documents.
pub mod loader;
/// Lookup strings, comparators, and filters.
pub mod lookup;
/// Query sets and filter evaluation.
pub mod query;
mod resolver;
/// Schema documents and the linked model schema.
pub mod schema;
/// Record tables and the identity map.
pub mod store;
/// Dynamically typed field values.
pub mod value;

pub use cache::CacheStats;
pub use config::StoreConfig;
pub use entity::{Assign, Attr, Entity, Fields};
pub use error::{OrmError, OrmResult, SchemaError};
pub use loader::LoadedFixtures;
pub use lookup::{Comparator, Filter, Group};
pub use query::QuerySet;
pub use schema::{ModelId, ModelSchema, Pk, Record, Relation, Schema, SchemaDocument};
pub use store::Store;
pub use value::Value;
