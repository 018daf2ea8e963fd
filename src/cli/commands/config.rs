//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration.
    Validate,
    /// Print the effective configuration with defaults.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command on an already loaded and validated config.
pub fn run_config(args: ConfigArgs, config: &Config) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => {
            println!("✓ Configuration is valid");
            Ok(())
        }
        ConfigCommand::Show { format } => {
            println!("{}", render(config, &format)?);
            Ok(())
        }
    }
}

fn render(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(config)?),
        "toml" => Ok(toml::to_string_pretty(config)?),
        other => anyhow::bail!("unknown format: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_round_trips_defaults() {
        let config = Config::default();
        let text = render(&config, "toml").unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.namespaces.ns, config.namespaces.ns);
        assert!(render(&config, "json").unwrap().contains("\"redis\""));
        assert!(render(&config, "yaml").is_err());
    }
}
