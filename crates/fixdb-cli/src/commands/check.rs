use std::path::Path;

use crate::config::CliConfig;

pub fn run(dir: &Path, config: &CliConfig) -> Result<(), String> {
    let store = super::open_store(dir, config)?;

    let mut rows = 0;
    for model in store.schema().models() {
        rows += store.row_count(model.name()).map_err(|e| e.to_string())?;
    }

    println!("  All checks passed for '{}'.", dir.display());
    println!(
        "  {}, {}",
        super::plural(store.schema().len(), "model"),
        super::plural(rows, "row")
    );

    Ok(())
}
