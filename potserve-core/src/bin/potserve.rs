// MIT License
// Copyright 2023--present potserve developers

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, error, info};

use potserve_core::config::ServerConfig;
use potserve_core::error::ServerError;
use potserve_core::logging::setup_logging;
use potserve_core::net::Server;
use potserve_core::registry::{HandlerSource, ModelFile, PotentialRegistry};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Serve energies and forces from a swappable potential over a binary socket protocol."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a model and serve it until interrupted twice.
    Serve(ServeArgs),
    /// Load a model file and report what it builds, without serving.
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Model file (TOML with `kind` and `[parameters]`). Overrides `model`
    /// from the config file.
    #[arg(value_name = "MODEL")]
    model: Option<PathBuf>,

    /// Server config file with a `[server]` table.
    #[arg(short, long, env = "POTSERVE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Listen backlog
    #[arg(long, value_name = "N")]
    max_connections: Option<u32>,

    /// Receive timeout in seconds
    #[arg(long, value_name = "SECS")]
    recv_timeout: Option<f64>,

    /// Send timeout in seconds
    #[arg(long, value_name = "SECS")]
    send_timeout: Option<f64>,

    /// Largest accepted atom count
    #[arg(long, value_name = "N")]
    max_atoms: Option<usize>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(value_name = "MODEL")]
    model: PathBuf,
}

impl ServeArgs {
    fn resolve(self) -> Result<ServerConfig, ServerError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(model) = self.model {
            config.model = Some(model);
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        if let Some(t) = self.recv_timeout {
            config.recv_timeout_s = t;
        }
        if let Some(t) = self.send_timeout {
            config.send_timeout_s = t;
        }
        if let Some(n) = self.max_atoms {
            config.max_atoms = n;
        }
        config.validated()
    }
}

fn serve(args: ServeArgs) -> Result<(), ServerError> {
    let config = args.resolve()?;
    debug!(?config, "resolved configuration");
    let mut server = Server::from_config(config)?;
    server.serve_blocking(true)
}

fn check(args: CheckArgs) -> Result<(), ServerError> {
    let registry = PotentialRegistry::with_builtins();
    let source = ModelFile::new(&args.model);
    let spec = source.read_spec()?;
    let potential = source.load()?;
    info!(kind = %spec.kind, "model loaded");
    println!(
        "{}: {} (available kinds: {})",
        args.model.display(),
        potential.name(),
        registry.kinds().join(", ")
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = setup_logging(cli.verbose, cli.quiet, cli.log_file.clone()) {
        eprintln!("potserve: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Serve(args) => serve(args),
        Commands::Check(args) => check(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("potserve: {e}");
            ExitCode::FAILURE
        }
    }
}
