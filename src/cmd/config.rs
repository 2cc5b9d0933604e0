//! Configuration view and validation: `reelsmith config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use reelsmith::config::{Config, ReelsmithToml};

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Reelsmith Configuration");
            println!("=======================");
            println!();
            if config.from_file {
                println!("Config file: {}", config.path.display());
            } else {
                println!(
                    "No config file at {}; using defaults.",
                    config.path.display()
                );
            }
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.toml.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                println!();
                return Ok(());
            }
            println!("Configuration problems:");
            for problem in &problems {
                println!("  - {}", problem);
            }
            println!();
            anyhow::bail!("{} configuration problem(s) found", problems.len());
        }
        Some(ConfigCommands::Init) => {
            if config.path.exists() {
                println!("reelsmith.toml already exists at {}", config.path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            let content = ReelsmithToml::default().to_toml()?;
            std::fs::write(&config.path, content)
                .with_context(|| format!("Failed to write {}", config.path.display()))?;

            println!("Created reelsmith.toml at {}", config.path.display());
            println!();
            println!("You can now customize:");
            println!("  - [encoder] program, args");
            println!("  - [providers.speech] / [providers.visuals] commands");
            println!("  - [stages] percent bands");
            println!();
        }
    }

    Ok(())
}
