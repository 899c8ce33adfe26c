//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use parley_domain::config::{Config, ConfigSeverity};
use parley_domain::error::Result;

#[derive(Parser)]
#[command(name = "parley", about = "Conversational session gateway", version)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway server (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration and report issues.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    Config::load(path)
}

/// Print validation issues; returns `false` when any is an error.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("config ok");
        return true;
    }
    let mut valid = true;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("warning: {issue}"),
            ConfigSeverity::Error => {
                valid = false;
                println!("error: {issue}");
            }
        }
    }
    valid
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
