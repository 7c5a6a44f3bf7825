//! Two-phase loading of schema+seed documents.
//!
//! Phase one declares every model and assigns its [`ModelId`], so documents
//! may reference each other in any order. Phase two links each relation to
//! the declared target and fails on anything undeclared.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use crate::error::SchemaError;
use crate::schema::{
    AttrRange, ModelId, ModelSchema, PRIMARY_KEY, Pk, Relation, Schema, SchemaDocument, Table,
    foreign_key_for,
};
use crate::value::Value;

/// Linked schemas plus the seed table of every model, indexed by [`ModelId`].
#[derive(Debug, Clone, Default)]
pub struct LoadedFixtures {
    /// Linked schema for every model.
    pub schema: Schema,
    /// Seed rows, indexed by `ModelId`.
    pub tables: Vec<Table>,
}

impl LoadedFixtures {
    /// Total seed rows across all models.
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(Table::len).sum()
    }
}

/// Load every `*.json` document in `dir`, in file-name order, and link them.
pub fn load_dir(dir: &Path) -> Result<LoadedFixtures, SchemaError> {
    let io_error = |error| SchemaError::Io {
        path: dir.to_path_buf(),
        error,
    };
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(io_error)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(SchemaError::NoDocuments(dir.to_path_buf()));
    }

    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path).map_err(|error| SchemaError::Io {
            path: path.clone(),
            error,
        })?;
        docs.push(SchemaDocument::from_json_str(
            &path.display().to_string(),
            &content,
        )?);
    }
    from_documents(docs)
}

/// Declare and link in-memory documents.
pub fn from_documents(docs: Vec<SchemaDocument>) -> Result<LoadedFixtures, SchemaError> {
    let mut by_name = HashMap::new();
    for (index, doc) in docs.iter().enumerate() {
        if doc.name.is_empty() {
            return Err(SchemaError::InvalidDocument {
                origin: format!("#{index}"),
                message: "model name is empty".into(),
            });
        }
        if by_name.insert(doc.name.clone(), ModelId(index)).is_some() {
            return Err(SchemaError::DuplicateModel(doc.name.clone()));
        }
    }

    let mut models = docs
        .iter()
        .enumerate()
        .map(|(index, doc)| declare(ModelId(index), doc))
        .collect::<Result<Vec<_>, _>>()?;

    for (index, doc) in docs.iter().enumerate() {
        let relations = link(doc, &by_name, &models)?;
        models[index].relations = relations;
    }

    let schema = Schema { models, by_name };
    let tables = docs
        .into_iter()
        .enumerate()
        .map(|(index, doc)| seed_table(schema.model(ModelId(index)), doc.objects))
        .collect::<Result<Vec<_>, _>>()?;

    let fixtures = LoadedFixtures { schema, tables };
    tracing::info!(
        models = fixtures.schema.len(),
        rows = fixtures.row_count(),
        "linked fixture schemas"
    );
    Ok(fixtures)
}

/// Phase one: everything but relations.
fn declare(id: ModelId, doc: &SchemaDocument) -> Result<ModelSchema, SchemaError> {
    let mut fields: BTreeSet<String> = doc.fields.iter().cloned().collect();
    fields.insert(PRIMARY_KEY.to_string());

    let unknown = |field: &str, context: &str| SchemaError::UnknownField {
        model: doc.name.clone(),
        field: field.to_string(),
        context: context.to_string(),
    };

    let mut time_fields = BTreeSet::new();
    for field in &doc.time_fields {
        if !fields.contains(field) {
            return Err(unknown(field, "time_fields"));
        }
        time_fields.insert(field.clone());
    }

    let mut ranges = BTreeMap::new();
    for (field, range) in &doc.ranges {
        if !fields.contains(field) {
            return Err(unknown(field, "ranges"));
        }
        ranges.insert(
            field.clone(),
            AttrRange {
                min: Value::from_number(&range.min),
                max: Value::from_number(&range.max),
            },
        );
    }

    let mut schema = ModelSchema {
        id,
        name: doc.name.clone(),
        fields,
        defaults: BTreeMap::new(),
        ranges,
        time_fields,
        relations: BTreeMap::new(),
    };

    for (field, json) in &doc.defaults {
        if !schema.has_field(field) {
            return Err(unknown(field, "defaults"));
        }
        let value = convert(&schema, field, json.clone())?;
        schema.defaults.insert(field.clone(), value);
    }

    Ok(schema)
}

/// Phase two: resolve every relation against the declared models.
fn link(
    doc: &SchemaDocument,
    by_name: &HashMap<String, ModelId>,
    models: &[ModelSchema],
) -> Result<BTreeMap<String, Relation>, SchemaError> {
    let resolve = |referenced: &str| {
        by_name
            .get(referenced)
            .copied()
            .ok_or_else(|| SchemaError::UndeclaredModel {
                model: doc.name.clone(),
                referenced: referenced.to_string(),
            })
    };
    let owner = &models[resolve(&doc.name)?.0];
    let require_field = |model: &ModelSchema, field: &str, relation: &str| {
        if model.has_field(field) {
            Ok(())
        } else {
            Err(SchemaError::UnknownField {
                model: model.name.clone(),
                field: field.to_string(),
                context: format!("relation \"{relation}\" of {}", doc.name),
            })
        }
    };

    let mut relations = BTreeMap::new();
    let mut insert = |name: &str, relation: Relation| {
        if owner.has_field(name) || relations.insert(name.to_string(), relation).is_some() {
            return Err(SchemaError::InvalidDocument {
                origin: doc.name.clone(),
                message: format!("relation name \"{name}\" is already used"),
            });
        }
        Ok(())
    };

    for (name, target) in &doc.many_to_one {
        let target = resolve(target)?;
        let foreign_key = foreign_key_for(name);
        if !owner.has_field(&foreign_key) {
            return Err(SchemaError::MissingForeignKey {
                model: doc.name.clone(),
                relation: name.clone(),
                field: foreign_key,
            });
        }
        insert(
            name,
            Relation::ManyToOne {
                foreign_key,
                target,
            },
        )?;
    }

    for (name, m2m) in &doc.many_to_many {
        let target = resolve(&m2m.model)?;
        let through = resolve(&m2m.through)?;
        require_field(&models[through.0], &m2m.from_key, name)?;
        require_field(&models[through.0], &m2m.target_key, name)?;
        insert(
            name,
            Relation::ManyToMany {
                through,
                from_key: m2m.from_key.clone(),
                target_key: m2m.target_key.clone(),
                target,
            },
        )?;
    }

    for (name, set) in &doc.reverse_sets {
        let target = resolve(&set.model)?;
        require_field(&models[target.0], &set.foreign_key, name)?;
        insert(
            name,
            Relation::ReverseSet {
                target,
                foreign_key: set.foreign_key.clone(),
            },
        )?;
    }

    Ok(relations)
}

fn seed_table(
    schema: &ModelSchema,
    objects: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
) -> Result<Table, SchemaError> {
    let mut table = Table::new();
    for (key, row) in objects {
        let pk: Pk = key.trim().parse().map_err(|_| SchemaError::InvalidKey {
            model: schema.name.clone(),
            key: key.clone(),
        })?;
        let mut record = schema.blank_record(pk);
        for (field, json) in row {
            // The object key is authoritative for the primary key.
            if field == PRIMARY_KEY {
                continue;
            }
            if !schema.has_field(&field) {
                return Err(SchemaError::UnknownField {
                    model: schema.name.clone(),
                    field,
                    context: format!("seed row {key}"),
                });
            }
            let value = convert(schema, &field, json)?;
            record.insert(field, value);
        }
        table.insert(pk, record);
    }
    Ok(table)
}

fn convert(
    schema: &ModelSchema,
    field: &str,
    json: serde_json::Value,
) -> Result<Value, SchemaError> {
    let rendered = json.to_string();
    let value = Value::from_json(json).ok_or_else(|| SchemaError::InvalidDocument {
        origin: schema.name.clone(),
        message: format!("field \"{field}\" holds an object"),
    })?;
    schema
        .coerce(field, value)
        .ok_or_else(|| SchemaError::InvalidTime {
            model: schema.name.clone(),
            field: field.to_string(),
            value: rendered,
        })
}
