use schemars::schema_for;

use crate::config::TownConfig;

/// Print the JSON Schema for `town.toml` to stdout.
pub fn run_schema() -> anyhow::Result<()> {
    let schema = schema_for!(TownConfig);
    let json = serde_json::to_string_pretty(&schema)?;
    println!("{json}");
    Ok(())
}
