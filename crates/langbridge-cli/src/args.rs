//! CLI argument definitions using clap

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "langbridge")]
#[command(about = "Bridge between coding agents and language servers / MCP tool servers")]
#[command(
    long_about = r#"Langbridge serves agent tool calls over stdin/stdout.

Each message is a JSON object framed with a Content-Length header:
  call:    {"id": "1", "tool": "hover", "arguments": {"file": "a.py", "line": 10, "column": 4}}
  cancel:  {"cancel": "1"}

Backends are configured per language in langbridge.toml."#
)]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./langbridge.toml, then the user config dir)
    #[arg(long, short, env = "LANGBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Default workspace root for requests that name none
    #[arg(long, short)]
    pub workspace: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Forward new diagnostics to the agent as they arrive
    #[arg(long)]
    pub push_diagnostics: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["langbridge"]);
        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
        assert!(!cli.push_diagnostics);
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::parse_from([
            "langbridge",
            "--config",
            "/etc/langbridge.toml",
            "--workspace",
            "/proj",
            "--log-level",
            "debug",
            "--log-json",
            "--push-diagnostics",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/langbridge.toml")));
        assert_eq!(cli.workspace, Some(PathBuf::from("/proj")));
        assert_eq!(cli.log_level, "debug");
        assert!(cli.log_json);
        assert!(cli.push_diagnostics);
    }
}
