use crate::config::parse::load_config;
use std::path::PathBuf;

/// Load and validate the config, then print the effective client identity.
pub fn check(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = config_path else {
        return Err("no config file found; use --config <path>".into());
    };

    let config = load_config(&path)?;
    let name = crate::client::effective_name(&config.client)?;

    println!("Config OK: {}", path.display());
    println!("  client:     {}", name);
    println!("  url:        {}", config.client.url);
    if config.client.wal.enabled {
        println!("  wal dir:    {}", config.client.wal.dir.join(&name).display());
    } else {
        println!("  wal:        disabled");
    }
    Ok(())
}
