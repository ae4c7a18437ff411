use clap::Parser;

use codelet::cli::args::{Cli, Commands};
use codelet::cli::commands;
use codelet::config::loader::load_config;
use codelet::error::Result;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    let format = cli.global_opts.format;

    // Dispatch to subcommand handler
    match cli.command {
        Commands::Init(args) => {
            commands::init(args, cli.global_opts.config.as_deref())?;
        }
        command => {
            let config = load_config(cli.global_opts.config.as_deref())?;
            match command {
                Commands::Run(args) => commands::run(args, config, format)?,
                Commands::Repl(args) => commands::repl(args, config, format)?,
                Commands::Backends => commands::backends(config, format)?,
                Commands::Config(args) => commands::config(args, config)?,
                Commands::Init(_) => {}
            }
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
