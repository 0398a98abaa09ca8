//! Command-line interface of the agent.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = "nodeagent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    /// Path to the configuration file. Built-in defaults are used without one.
    #[arg(short, long, env = "NODEAGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

/// Supported log formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_config_and_format() {
        let cli = Cli::try_parse_from(["nodeagent", "-c", "/etc/nodeagent.toml", "--log-format", "json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/nodeagent.toml")));
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
