use clap::Parser;
use tracing_subscriber::EnvFilter;

use warp::cli::{Cli, Command};
use warp::client::{self, ConnectArgs};
use warp::dial::DialOptions;
use warp::host::{self, OpenArgs};
use warp::local;

#[tokio::main]
async fn main() {
    // Logs go to stderr and default to errors only; anything louder would
    // scribble over the raw terminal.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Open {
            id,
            no_tls,
            insecure_tls,
        } => {
            host::run(OpenArgs {
                id,
                dial: DialOptions::resolve(&cli.address, no_tls, insecure_tls),
            })
            .await
        }
        Command::Connect {
            id,
            no_tls,
            insecure_tls,
        } => {
            client::run(ConnectArgs {
                id,
                dial: DialOptions::resolve(&cli.address, no_tls, insecure_tls),
            })
            .await
        }
        Command::State => local::state().await,
        Command::Authorize { user } => local::authorize(user).await,
        Command::Revoke { users } => local::revoke(users).await,
    };

    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
