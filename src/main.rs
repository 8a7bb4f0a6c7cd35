use clap::Parser;
use tracing::info;

use sandkit::cli::args::{Cli, Commands, OutputFormat};
use sandkit::cli::commands;
use sandkit::cli::signals::terminate_signal;
use sandkit::config::loader::load_config;
use sandkit::config::types::SandkitConfig;
use sandkit::error::Result;
use sandkit::sandbox::ExecutionEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    // Load configuration (file + CLI overrides)
    let config = load_config(cli.global_opts.config.as_deref())?;
    let format = cli.global_opts.format.clone();

    let engine = ExecutionEngine::new(config.engine.clone());

    // Ctrl-C or SIGTERM abandons the running command; the pool is drained
    // either way
    let terminated = terminate_signal();
    let outcome = tokio::select! {
        outcome = dispatch(cli.command, &engine, config, format) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(130)
        }
        _ = terminated => {
            info!("Terminated, shutting down");
            Ok(143)
        }
    };

    engine.shutdown();

    let code = outcome?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn dispatch(
    command: Commands,
    engine: &ExecutionEngine,
    config: SandkitConfig,
    format: OutputFormat,
) -> Result<i32> {
    match command {
        Commands::Exec(args) => commands::exec(args, engine, format).await,
        Commands::Parse(args) => commands::parse(args, engine, format).await,
        Commands::Analyze(args) => commands::analyze(args, engine, &config, format).await,
        Commands::Repl(args) => commands::repl(args, engine, format).await,
        Commands::Init(args) => commands::init(args).await.map(|()| 0),
        Commands::Config(args) => commands::config(args, config).await.map(|()| 0),
    }
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
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
