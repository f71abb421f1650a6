use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warpd::Srv;

#[derive(Parser, Debug)]
#[command(name = "warpd", about = "Relay daemon for warp terminal sharing", version)]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, env = "WARPD_LISTEN", default_value = "0.0.0.0:4242")]
    address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let listener = TcpListener::bind(&cli.address).await?;
    info!(target: "warpd", address = %cli.address, "listening");
    println!("warpd listening on {}", cli.address);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "warpd", "shutting down");
            cancel.cancel();
        });
    }

    Srv::new().serve(listener, cancel).await
}
