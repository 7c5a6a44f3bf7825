use std::path::PathBuf;

use crate::schema::Pk;

/// Alias for `Result<T, OrmError>`.
pub type OrmResult<T> = Result<T, OrmError>;

/// Errors raised by store, entity, and query operations.
#[derive(Debug, thiserror::Error)]
pub enum OrmError {
    /// A field name that cannot be written the way it was supplied.
    #[error("illegal field \"{field}\" on {model}: {reason}")]
    IllegalField {
        /// Model the write targeted.
        model: String,
        /// The offending field name.
        field: String,
        /// What made the field illegal.
        reason: &'static str,
    },

    /// The name is neither a stored field nor a relation of the model.
    #[error("field \"{field}\" not found on {model}")]
    FieldNotFound {
        /// Model that was searched.
        model: String,
        /// The missing field name.
        field: String,
    },

    /// A lookup hop or relation access named no declared relation.
    #[error("relation \"{relation}\" not found on {model}")]
    RelationNotFound {
        /// Model that was searched.
        model: String,
        /// The missing relation name.
        relation: String,
    },

    /// A lookup ended in a comparator suffix outside the recognized set.
    #[error("unknown comparator \"{comparator}\" in lookup \"{lookup}\"")]
    UnknownComparator {
        /// The full lookup string.
        lookup: String,
        /// The unrecognized suffix.
        comparator: String,
    },

    /// A lookup with no resolvable leaf field.
    #[error("empty lookup: \"{0}\"")]
    EmptyLookup(String),

    /// No model with this name was declared.
    #[error("unknown model: \"{0}\"")]
    UnknownModel(String),

    /// No record exists for the primary key.
    #[error("{model}({pk}) does not exist")]
    RecordNotFound {
        /// Model that was searched.
        model: String,
        /// The missing primary key.
        pk: Pk,
    },

    /// `create` was given a primary key that is already taken.
    #[error("{model}({pk}) already exists")]
    DuplicateKey {
        /// Model the create targeted.
        model: String,
        /// The taken primary key.
        pk: Pk,
    },

    /// The table already holds the largest representable key.
    #[error("no primary key left on {model} after {max}")]
    KeysExhausted {
        /// Model the create targeted.
        model: String,
        /// The current largest key.
        max: Pk,
    },

    /// A key field holds something other than an integer.
    #[error("field \"{field}\" on {model} must hold an integer key, got {value}")]
    InvalidKey {
        /// Model owning the field.
        model: String,
        /// The key field.
        field: String,
        /// Rendered offending value.
        value: String,
    },

    /// The entity was deleted; its handle is a tombstone.
    #[error("{model} entity was deleted")]
    Deleted {
        /// Model of the deleted entity.
        model: String,
    },

    /// The store backing this handle has been dropped.
    #[error("the store owning this handle has been dropped")]
    StoreDropped,

    /// Fixture documents failed to load or link.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

/// Errors raised while loading and linking fixture documents.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A relation or through table names a model that was never declared.
    #[error("model \"{model}\" references undeclared model \"{referenced}\"")]
    UndeclaredModel {
        /// The referencing model.
        model: String,
        /// The missing model name.
        referenced: String,
    },

    /// Two documents declare the same model name.
    #[error("model \"{0}\" is declared more than once")]
    DuplicateModel(String),

    /// A many-to-one relation has no stored foreign-key field.
    #[error("relation \"{relation}\" on {model} requires stored field \"{field}\"")]
    MissingForeignKey {
        /// The declaring model.
        model: String,
        /// The many-to-one relation name.
        relation: String,
        /// The expected foreign-key field.
        field: String,
    },

    /// A document refers to a field its model does not store.
    #[error("{context} refers to unknown field \"{field}\" on {model}")]
    UnknownField {
        /// Model that should store the field.
        model: String,
        /// The unknown field name.
        field: String,
        /// Where the reference came from.
        context: String,
    },

    /// A seed row key is not a decimal primary key.
    #[error("seed row key \"{key}\" of {model} is not an integer primary key")]
    InvalidKey {
        /// Model owning the row.
        model: String,
        /// The offending key.
        key: String,
    },

    /// A time field holds something other than `HH:MM:SS`.
    #[error("time field \"{field}\" of {model} holds invalid value {value}")]
    InvalidTime {
        /// Model owning the field.
        model: String,
        /// The time field.
        field: String,
        /// Rendered offending value.
        value: String,
    },

    /// A document is structurally invalid.
    #[error("invalid document {origin}: {message}")]
    InvalidDocument {
        /// Document name or path.
        origin: String,
        /// What is wrong with it.
        message: String,
    },

    /// A fixture directory holds no schema documents.
    #[error("no schema documents found in {}", .0.display())]
    NoDocuments(PathBuf),

    /// A fixture file or directory could not be read.
    #[error("cannot read {}: {error}", .path.display())]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        error: std::io::Error,
    },

    /// A fixture file is not valid JSON for a schema document.
    #[error("cannot parse {origin}: {error}")]
    Json {
        /// Document name or path.
        origin: String,
        /// Underlying parse error.
        #[source]
        error: serde_json::Error,
    },
}
