mod cmd;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use pressdev_core::paths::Paths;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pressdev",
    about = "Provision and supervise a local WordPress development environment",
    version,
    propagate_version = true
)]
struct Cli {
    /// Data directory (default: <platform data dir>/pressdev)
    #[arg(long, global = true, env = "PRESSDEV_HOME")]
    home: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the toolchain, install, build and run the stack until Ctrl-C
    Up {
        /// Node.js distribution directory to install from
        #[arg(long, env = "PRESSDEV_DIST_URL")]
        dist_url: Option<String>,

        /// Platform tag of the Node.js build (e.g. linux-x64, darwin-arm64)
        #[arg(long, env = "PRESSDEV_PLATFORM")]
        platform: Option<String>,
    },

    /// Show or change settings
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Show the last reported state of every service
    Status,

    /// Print the docker-compose file for the current settings
    Compose,
}

fn main() {
    let cli = Cli::parse();

    let paths = match Paths::resolve(cli.home.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let log_file = match &cli.command {
        Commands::Up { .. } => Some(paths.log_file()),
        _ => None,
    };
    let default_level = match &cli.command {
        Commands::Up { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    logging::init(default_level, log_file.as_deref());

    let result = match cli.command {
        Commands::Up { dist_url, platform } => cmd::up::run(&paths, dist_url, platform),
        Commands::Config { subcommand } => cmd::config::run(&paths, subcommand, cli.json),
        Commands::Status => cmd::status::run(&paths, cli.json),
        Commands::Compose => cmd::compose::run(&paths),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
