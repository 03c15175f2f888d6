//! Configuration display command.

use std::path::Path;

use anyhow::{Context, Result, bail};
use gcprobe_config::GcProbeConfig;

/// Shows the configuration after every source has been merged.
pub fn show(project: &Path, format: &str) -> Result<()> {
    let config = GcProbeConfig::load_from_dir(project).context("Failed to load configuration")?;

    match format {
        "toml" => println!("{}", config.to_toml()?),
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        other => bail!("Unknown format '{other}' (expected toml or json)"),
    }

    println!();
    println!("# Endpoints");
    println!("#   pd:     {}", config.cluster.pd_addr());
    println!("#   status: {}", config.cluster.status_addr());
    Ok(())
}
