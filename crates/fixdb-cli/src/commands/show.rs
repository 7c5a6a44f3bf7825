use std::path::Path;

use colored::Colorize;
use fixdb_core::{Attr, Entity, Pk};

use crate::config::CliConfig;

pub fn run(dir: &Path, config: &CliConfig, model: &str, pk: Pk) -> Result<(), String> {
    let store = super::open_store(dir, config)?;
    let schema = super::model(&store, model)?;
    let entity = store.get_or_create(model, pk).map_err(|e| e.to_string())?;

    println!("  {}", entity.to_string().bold());
    println!();

    let record = entity.fields().map_err(|e| e.to_string())?;
    let columns = super::columns(schema);
    let width = columns.iter().map(String::len).max().unwrap_or(0);
    for column in &columns {
        if let Some(value) = record.get(column) {
            println!("  {column:<width$}  {}", super::cell(value));
        }
    }

    let relations: Vec<&str> = schema.relations().map(|(name, _)| name).collect();
    if relations.is_empty() {
        return Ok(());
    }

    println!();
    println!("  {}", "Relations:".dimmed());
    for name in relations {
        let shown = match entity.attr(name).map_err(|e| e.to_string())? {
            Attr::Entity(Some(linked)) => linked.to_string(),
            Attr::Entity(None) => "none".to_string(),
            Attr::Set(set) => {
                let members = set.all().map_err(|e| e.to_string())?;
                if members.is_empty() {
                    "none".to_string()
                } else {
                    members
                        .iter()
                        .map(Entity::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                }
            }
            Attr::Value(value) => super::cell(&value),
        };
        println!("    {name}: {shown}");
    }

    Ok(())
}
