// heraldd: the event broker daemon.
//
// Exit codes: 0 normal shutdown, 1 fatal startup (bind failure, TLS
// material unreadable), 2 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, Command};
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "heraldd starting");

    let matches = Command::new("heraldd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Event broker: accepts event notifications and fans them out")
        .arg(
            Arg::new("config")
                .help("Path to the broker TOML configuration")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(broker::config::DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .expect("config has a default");

    let config = match broker::config::load_config_from_path(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {}", error);
            return ExitCode::from(2);
        }
    };

    match broker::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("fatal: {}", error);
            ExitCode::from(1)
        }
    }
}
