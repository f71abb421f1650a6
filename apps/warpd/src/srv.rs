use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp_mux::{Mux, MuxConfig};
use warp_proto::{codes, Role};

use crate::client::Client;
use crate::warp::Warp;

type WarpTable = Arc<StdMutex<HashMap<String, Arc<Warp>>>>;

/// Accepts connections, decodes their hello and routes them to a warp as host
/// or client. Owns the warp table.
pub struct Srv {
    warps: WarpTable,
}

impl Default for Srv {
    fn default() -> Self {
        Self::new()
    }
}

impl Srv {
    pub fn new() -> Srv {
        Srv {
            warps: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Serve connections until cancelled.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => break,
            };
            let (conn, remote) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(target: "warpd", error = %err, "error accepting connection");
                    continue;
                }
            };
            let _ = conn.set_nodelay(true);
            let warps = self.warps.clone();
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                handle(warps, conn, remote, conn_cancel).await;
            });
        }
        Ok(())
    }
}

async fn handle(warps: WarpTable, conn: TcpStream, remote: SocketAddr, cancel: CancellationToken) {
    debug!(target: "warpd", remote = %remote, "handling new connection");

    let mux = Mux::server(conn, MuxConfig::default());
    let client = match Client::accept(&mux, cancel.child_token()).await {
        Ok(client) => Arc::new(client),
        Err(err) => {
            debug!(target: "warpd", remote = %remote, error = %err, "session setup failed");
            mux.close();
            return;
        }
    };

    // When the transport dies (error, reset, keepalive timeout) the session
    // token fires so the warp handlers unblock promptly.
    {
        let client = client.clone();
        let closed = mux.closed();
        tokio::spawn(async move {
            closed.cancelled().await;
            client.teardown();
        });
    }

    info!(
        target: "warpd",
        remote = %remote,
        session = %client.identity(),
        warp = %client.warp(),
        role = %client.role(),
        username = %client.username(),
        "session accepted"
    );

    match client.role() {
        Role::Host => handle_host(&warps, &client).await,
        Role::ShellClient => handle_shell_client(&warps, &client).await,
        Role::ChatClient => {
            client
                .send_error(
                    codes::UNSUPPORTED_ROLE,
                    format!("Unsupported role: {}", client.role()),
                )
                .await;
        }
    }

    client.teardown();
    debug!(target: "warpd", remote = %remote, "done handling connection");
}

async fn handle_host(warps: &WarpTable, client: &Arc<Client>) {
    let token = client.warp().to_string();
    let created = {
        let mut table = warps.lock().unwrap();
        if table.contains_key(&token) {
            None
        } else {
            let warp = Warp::new(&token, client.clone());
            table.insert(token.clone(), warp.clone());
            Some(warp)
        }
    };
    match created {
        None => {
            warn!(target: "warpd", warp = %token, session = %client.identity(), "warp already in use");
            client
                .send_error(codes::WARP_IN_USE, format!("Warp already in use: {token}"))
                .await;
        }
        Some(warp) => {
            warp.handle_host(client.clone()).await;
            warps.lock().unwrap().remove(&token);
            info!(target: "warpd", warp = %token, "warp deleted");
        }
    }
}

async fn handle_shell_client(warps: &WarpTable, client: &Arc<Client>) {
    let warp = warps.lock().unwrap().get(client.warp()).cloned();
    match warp {
        None => {
            client
                .send_error(
                    codes::WARP_UNKNOWN,
                    format!("Unknown warp: {}", client.warp()),
                )
                .await;
        }
        Some(warp) => warp.handle_client(client.clone()).await,
    }
}
