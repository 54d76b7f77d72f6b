//! Config command: print the effective configuration or write the default one.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::error::ChainbanError;

/// Run the config command
pub async fn run(init: bool, force: bool, config_path: &Path) -> Result<()> {
    if init {
        if config_path.exists() && !force {
            return Err(ChainbanError::Configuration(format!(
                "{} already exists (use --force to overwrite)",
                config_path.display()
            ))
            .into());
        }
        Config::default().save(config_path)?;
        println!("Wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let config = Config::load_or_default(config_path)?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
