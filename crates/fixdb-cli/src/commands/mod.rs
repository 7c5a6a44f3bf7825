pub mod check;
pub mod list;
pub mod models;
pub mod query;
pub mod show;

use std::path::Path;

use comfy_table::{ContentArrangement, Table};
use fixdb_core::{Entity, ModelSchema, Store, Value};

use crate::config::CliConfig;

/// Load and link a fixture directory.
fn open_store(dir: &Path, config: &CliConfig) -> Result<Store, String> {
    Store::load_dir(dir, config.store.clone()).map_err(|e| e.to_string())
}

fn model<'s>(store: &'s Store, name: &str) -> Result<&'s ModelSchema, String> {
    store.model(name).map_err(|e| e.to_string())
}

/// Parse a `LOOKUP=VALUE` argument. The value is read as JSON when it
/// parses, otherwise as a plain string.
fn parse_lookup(arg: &str) -> Result<(String, Value), String> {
    let (lookup, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected LOOKUP=VALUE, got \"{arg}\""))?;
    if lookup.is_empty() {
        return Err(format!("empty lookup in \"{arg}\""));
    }
    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::from_json(json)
            .ok_or_else(|| format!("objects are not valid lookup values: {raw}"))?,
        Err(_) => Value::Str(raw.to_string()),
    };
    Ok((lookup.to_string(), value))
}

/// Render a cell value; null becomes a dash.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => "—".to_string(),
        Value::Str(s) if s.is_empty() => "—".to_string(),
        other => other.to_string(),
    }
}

/// Stored field names with `id` first.
fn columns(schema: &ModelSchema) -> Vec<String> {
    let mut columns = vec!["id".to_string()];
    columns.extend(schema.fields().filter(|f| *f != "id").map(str::to_string));
    columns
}

/// A table with one row per entity, showing every stored field.
fn entity_table(schema: &ModelSchema, entities: &[Entity]) -> Result<Table, String> {
    let columns = columns(schema);
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(columns.clone());

    for entity in entities {
        let record = entity.fields().map_err(|e| e.to_string())?;
        let row: Vec<String> = columns
            .iter()
            .map(|column| record.get(column).map_or_else(String::new, cell))
            .collect();
        table.add_row(row);
    }
    Ok(table)
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_values_parse_as_json_or_text() {
        assert_eq!(
            parse_lookup("energy__gt=60").unwrap(),
            ("energy__gt".to_string(), Value::Int(60))
        );
        assert_eq!(
            parse_lookup("id__in=[1,2]").unwrap().1,
            Value::from(vec![1, 2])
        );
        assert_eq!(
            parse_lookup("title=Alice").unwrap().1,
            Value::from("Alice")
        );
        assert_eq!(
            parse_lookup("title=\"42\"").unwrap().1,
            Value::from("42")
        );
        assert_eq!(parse_lookup("place_id=null").unwrap().1, Value::Null);
    }

    #[test]
    fn malformed_lookups_are_rejected() {
        assert!(parse_lookup("energy").is_err());
        assert!(parse_lookup("=3").is_err());
        assert!(parse_lookup("title={\"a\":1}").is_err());
    }
}
