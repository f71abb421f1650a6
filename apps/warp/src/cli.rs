use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "warp", about = "Secure and simple terminal sharing", version)]
pub struct Cli {
    /// Address of the warpd relay daemon.
    #[arg(
        long,
        global = true,
        env = "WARPD_ADDRESS",
        default_value = warp_proto::DEFAULT_ADDRESS
    )]
    pub address: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new warp and start sharing your terminal (read-only).
    Open {
        /// ID to assign to the new warp; a random one is generated when
        /// omitted.
        id: Option<String>,
        /// Connect to warpd over plain TCP.
        #[arg(long)]
        no_tls: bool,
        /// Skip TLS certificate verification.
        #[arg(long)]
        insecure_tls: bool,
    },
    /// Connect to an existing warp (read-only until authorized).
    Connect {
        /// The ID of the warp to connect to.
        id: String,
        /// Connect to warpd over plain TCP.
        #[arg(long)]
        no_tls: bool,
        /// Skip TLS certificate verification.
        #[arg(long)]
        insecure_tls: bool,
    },
    /// Display the state of the current warp (in-warp).
    State,
    /// Authorize a connected user to write to your terminal (in-warp).
    Authorize {
        /// The token of the user to authorize.
        user: String,
    },
    /// Revoke write authorizations; with no argument, every user (in-warp).
    Revoke {
        /// Tokens of the users to revoke.
        users: Vec<String>,
    },
}
