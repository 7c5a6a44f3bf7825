use std::path::Path;

use comfy_table::{ContentArrangement, Table};
use fixdb_core::Filter;

use crate::config::CliConfig;

/// Arguments of the `query` subcommand.
pub struct QueryArgs<'a> {
    pub model: &'a str,
    pub filter: &'a [String],
    pub exclude: &'a [String],
    pub order_by: Option<&'a str>,
    pub values: &'a [String],
    pub first: bool,
}

fn parse_filter(args: &[String]) -> Result<Filter, String> {
    args.iter().map(|arg| super::parse_lookup(arg)).collect()
}

pub fn run(dir: &Path, config: &CliConfig, args: &QueryArgs<'_>) -> Result<(), String> {
    let store = super::open_store(dir, config)?;
    let schema = super::model(&store, args.model)?;
    let filter = parse_filter(args.filter)?;
    let exclude = parse_filter(args.exclude)?;

    let mut set = store
        .objects(args.model)
        .and_then(|objects| objects.filter(filter))
        .map_err(|e| e.to_string())?;
    if !exclude.is_empty() {
        set = set.exclude(exclude).map_err(|e| e.to_string())?;
    }
    if let Some(field) = args.order_by {
        set = set.order_by(field).map_err(|e| e.to_string())?;
    }

    let entities: Vec<_> = if args.first {
        set.first().map_err(|e| e.to_string())?.into_iter().collect()
    } else {
        set.iter().cloned().collect()
    };

    if entities.is_empty() {
        println!("  No rows found.");
        return Ok(());
    }

    if args.values.is_empty() {
        println!("{}", super::entity_table(schema, &entities)?);
    } else {
        let fields: Vec<&str> = args.values.iter().map(String::as_str).collect();
        let projected = set.values(&fields).map_err(|e| e.to_string())?;
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(fields.clone());
        for row in projected.iter().take(entities.len()) {
            table.add_row(row.iter().map(super::cell).collect::<Vec<_>>());
        }
        println!("{table}");
    }

    println!();
    println!("  {}", super::plural(entities.len(), "row"));
    tracing::debug!(
        model = args.model,
        rows = entities.len(),
        cache = ?store.cache_stats(),
        "query finished"
    );

    Ok(())
}
