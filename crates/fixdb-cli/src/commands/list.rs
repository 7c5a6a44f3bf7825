use std::path::Path;

use crate::config::CliConfig;

pub fn run(
    dir: &Path,
    config: &CliConfig,
    model: &str,
    order_by: Option<&str>,
    limit: Option<usize>,
) -> Result<(), String> {
    let store = super::open_store(dir, config)?;
    let schema = super::model(&store, model)?;

    let mut set = store
        .objects(model)
        .and_then(|objects| objects.all())
        .map_err(|e| e.to_string())?;
    if let Some(field) = order_by {
        set = set.order_by(field).map_err(|e| e.to_string())?;
    }

    if set.is_empty() {
        println!("  No rows found.");
        return Ok(());
    }

    let total = set.len();
    let shown: Vec<_> = set.iter().take(limit.unwrap_or(total)).cloned().collect();
    let table = super::entity_table(schema, &shown)?;

    println!("{table}");
    println!();
    if shown.len() < total {
        println!("  {} of {}", shown.len(), super::plural(total, "row"));
    } else {
        println!("  {}", super::plural(total, "row"));
    }

    Ok(())
}
