use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::{BackendType, Mount};

#[derive(Parser, Debug)]
#[clap(name = "codelet")]
#[clap(version, about = "Run Python snippets in a persistent sandboxed interpreter")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "CODELET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run Python files as consecutive snippets in one sandbox
    Run(RunArgs),

    /// Read snippets from stdin, separated by lines containing only `%%`
    Repl(ReplArgs),

    /// Show which sandbox backends are usable on this machine
    Backends,

    /// Initialize a new codelet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Execution Commands
// ============================================================================

/// Sandbox options shared by every command that starts an executor.
#[derive(Args, Debug, Clone)]
pub struct SandboxOpts {
    /// Sandbox backend (overrides executor.backend)
    #[clap(long, short = 'b', value_enum)]
    pub backend: Option<BackendType>,

    /// Extra packages to install, by import or distribution name
    #[clap(long = "import", short = 'i')]
    pub imports: Vec<String>,

    /// Python file whose definitions are loaded before the first snippet
    #[clap(long = "tool", short = 't')]
    pub tools: Vec<PathBuf>,

    /// JSON object file whose entries become interpreter globals
    #[clap(long)]
    pub vars: Option<PathBuf>,

    /// Mount host directories into the container (host_path:guest_path[:ro])
    #[clap(long = "mount", short = 'm', value_parser = parse_mount)]
    pub mounts: Vec<Mount>,

    /// Environment variables to set in the container (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Python files, submitted in order
    #[clap(required = true)]
    pub files: Vec<PathBuf>,

    #[clap(flatten)]
    pub sandbox: SandboxOpts,
}

#[derive(Args, Debug)]
pub struct ReplArgs {
    #[clap(flatten)]
    pub sandbox: SandboxOpts,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_mount(s: &str) -> Result<Mount, String> {
    s.parse()
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Environment variable format: KEY=VALUE".to_string())
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "codelet",
            "run",
            "a.py",
            "b.py",
            "--import",
            "numpy",
            "-b",
            "docker",
            "-m",
            "./data:/data:ro",
            "-e",
            "MODE=test",
            "--format",
            "json",
        ])
        .unwrap();

        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.files, vec![PathBuf::from("a.py"), PathBuf::from("b.py")]);
        assert_eq!(args.sandbox.imports, vec!["numpy"]);
        assert_eq!(args.sandbox.backend, Some(BackendType::Docker));
        assert!(args.sandbox.mounts[0].readonly);
        assert_eq!(
            args.sandbox.env_vars,
            vec![("MODE".to_string(), "test".to_string())]
        );
    }

    #[test]
    fn test_run_requires_files() {
        assert!(Cli::try_parse_from(["codelet", "run"]).is_err());
    }

    #[test]
    fn test_bad_env_var_is_rejected() {
        assert!(Cli::try_parse_from(["codelet", "repl", "-e", "NOVALUE"]).is_err());
    }
}
