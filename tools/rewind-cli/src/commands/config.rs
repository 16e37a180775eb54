//! Show or initialize the config file.

use std::path::Path;

use rewind_common::config::{config_file_path, AppConfig};

pub fn run(config: &AppConfig, explicit: Option<&Path>, init: bool) -> anyhow::Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(config_file_path);

    if init {
        if path.exists() {
            println!("Config already exists at {}", path.display());
        } else {
            AppConfig::default().save_to(&path)?;
            println!("Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
