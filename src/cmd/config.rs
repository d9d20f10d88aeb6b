//! Configuration view and init commands: `hostdeck config`.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use hostdeck::config::{CONFIG_ENV, DEFAULT_CONFIG_PATH, HostdeckConfig};

use super::super::ConfigCommands;

pub fn cmd_config(explicit: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = HostdeckConfig::load_or_default(explicit)?;
            let source = config_source(explicit);
            match &source {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# No config file found; built-in defaults"),
            }
            print!("{}", config.to_toml_string()?);
        }
        Some(ConfigCommands::Init { force }) => {
            let path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
            if path.exists() && !force {
                bail!(
                    "{} already exists. Use --force to overwrite.",
                    path.display()
                );
            }
            HostdeckConfig::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

/// The file `load_or_default` would read, if any.
fn config_source(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    default_path.exists().then_some(default_path)
}
