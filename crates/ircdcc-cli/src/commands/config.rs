//! Config command implementation.

use anyhow::{bail, Context, Result};

use ircdcc_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: &ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = Config::load().context("Failed to load config")?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => println!("{}", Config::config_path().display()),
        ConfigAction::Init { force } => {
            let path = Config::config_path();
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to replace it)",
                    path.display()
                );
            }
            Config::default()
                .save_to(&path)
                .context("Failed to write config")?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
