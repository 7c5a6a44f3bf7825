use std::path::Path;

use comfy_table::{ContentArrangement, Table};
use fixdb_core::{Relation, Store};

use crate::config::CliConfig;

pub fn run(dir: &Path, config: &CliConfig) -> Result<(), String> {
    let store = super::open_store(dir, config)?;
    let schema = store.schema();

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Model", "Rows", "Fields", "Relations"]);

    for model in schema.models() {
        let rows = store.row_count(model.name()).map_err(|e| e.to_string())?;
        let relations: Vec<String> = model
            .relations()
            .map(|(name, relation)| describe(&store, name, relation))
            .collect();
        let relations = if relations.is_empty() {
            "—".to_string()
        } else {
            relations.join("\n")
        };
        table.add_row(vec![
            model.name().to_string(),
            rows.to_string(),
            super::columns(model).join(", "),
            relations,
        ]);
    }

    println!("{table}");
    println!();
    println!("  {}", super::plural(schema.len(), "model"));

    Ok(())
}

fn describe(store: &Store, name: &str, relation: &Relation) -> String {
    let model_name = |id| store.schema().model(id).name().to_string();
    match relation {
        Relation::ManyToOne {
            foreign_key,
            target,
        } => format!("{name} -> {} (via {foreign_key})", model_name(*target)),
        Relation::ManyToMany {
            through, target, ..
        } => format!("{name} -> [{}] (through {})", model_name(*target), model_name(*through)),
        Relation::ReverseSet {
            target,
            foreign_key,
        } => format!("{name} -> [{}] (by {foreign_key})", model_name(*target)),
    }
}
