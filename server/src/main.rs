use std::path::PathBuf;

use clap::{arg, Command};
use tracing::error;
use tracing_subscriber::EnvFilter;

use tumble_env::Config;
use tumble_server::context::ApplicationContext;
use tumble_server::server::run_server;

fn cli() -> Command {
    Command::new("tumble-server")
        .about("Tumble realtime room server.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run").arg(
                arg!([config] "The path to config file")
                    .value_parser(clap::value_parser!(PathBuf)),
            ),
        )
}

pub async fn run(path: Option<&PathBuf>) {
    let config = match path {
        Some(path) => Config::from_path(path),
        None => Config::from_env(),
    };
    let (ctx, signal_loop) = ApplicationContext::try_new_and_start_signal_loop(config)
        .await
        .expect("Failed to initialize application context");
    if let Err(e) = run_server(ctx).await {
        error!("Unexpected error occured: {}", e);
    }
    if let Err(e) = signal_loop.await {
        error!("Error waiting for signal loop: {}", e);
    }
}

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("run", subcommand_matches)) => {
            let path = subcommand_matches.get_one::<PathBuf>("config");
            run(path).await;
        }
        _ => unreachable!(),
    }
}
