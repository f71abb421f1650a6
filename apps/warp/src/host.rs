//! The host supervisor behind `warp open`: spawns the shared shell under a
//! pty, keeps a resilient session to the relay, and fans bytes out between
//! the pty, the local terminal and the network.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warp_proto::{
    prefixed_token, random_token, read_record, valid_token, HostUpdate, Role, SessionIdentity,
    WarpState, WireError, ENV_WARP, ENV_WARP_UNIX_SOCKET,
};

use crate::config;
use crate::dial::{dial, Conn, DialOptions};
use crate::errors::ErrorSink;
use crate::pty::LocalPty;
use crate::session::{Session, SessionReaders};
use crate::srv::{HostState, LocalSrv};
use crate::term;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct OpenArgs {
    pub id: Option<String>,
    pub dial: DialOptions,
}

struct Supervisor {
    host: Arc<HostState>,
    pty: Arc<LocalPty>,
    root: CancellationToken,
    errors: ErrorSink,
    inited: Arc<Notify>,
    dial: DialOptions,
    username: String,
}

pub async fn run(args: OpenArgs) -> anyhow::Result<()> {
    let warp_token = args.id.unwrap_or_else(random_token);
    if !valid_token(&warp_token) {
        bail!("Malformed warp ID: {warp_token}");
    }

    let config = config::load_or_generate().context("Failed to load credentials")?;
    let identity = SessionIdentity {
        token: prefixed_token("session"),
        user: config.credentials.user.clone(),
        secret: config.credentials.secret.clone(),
    };
    let username = config::username();

    if !term::stdin_is_terminal() {
        bail!("Not running in a terminal.");
    }
    let initial_size = term::window_size().context("Failed to retrieve the terminal size")?;

    println!("Opened warp: {warp_token}");

    let host = HostState::new(&warp_token, identity.clone(), initial_size);
    let srv = Arc::new(LocalSrv::new(host.clone()));
    let socket = srv.path().display().to_string();

    // Raw mode stays on for the lifetime of the warp; the guard restores the
    // terminal on every exit path.
    let raw = term::RawModeGuard::new().context("Unable to put terminal in raw mode")?;

    let pty = Arc::new(
        LocalPty::spawn(
            &LocalPty::default_shell(),
            initial_size,
            &[
                (ENV_WARP, warp_token.clone()),
                (ENV_WARP_UNIX_SOCKET, socket),
            ],
        )
        .context("Failed to create pty")?,
    );

    let root = CancellationToken::new();
    let errors = ErrorSink::new(root.clone());
    let inited = Arc::new(Notify::new());

    // Shell exit ends the warp.
    {
        let root = root.clone();
        let exited = pty.exited();
        tokio::spawn(async move {
            exited.cancelled().await;
            root.cancel();
        });
    }

    // So does ctrl-c, for the rare case where the terminal is not in raw
    // mode anymore but the supervisor still runs.
    {
        let root = root.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            root.cancel();
        });
    }

    // pty → (stdout, network).
    {
        let mut output = pty
            .take_output()
            .expect("pty output channel already taken");
        let host = host.clone();
        let root = root.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                let chunk = tokio::select! {
                    chunk = output.recv() => chunk,
                    _ = root.cancelled() => break,
                };
                let Some(chunk) = chunk else { break };
                if stdout.write_all(&chunk).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
                let attached = host.attached.lock().await.clone();
                if let Some(session) = attached {
                    session.write_data(&chunk).await;
                }
            }
            root.cancel();
        });
    }

    // stdin → pty.
    {
        let input = pty.input();
        let root = root.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                let read = tokio::select! {
                    read = stdin.read(&mut buf) => read,
                    _ = root.cancelled() => break,
                };
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if input
                            .send(bytes::Bytes::copy_from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            root.cancel();
        });
    }

    // WINCH watcher: resize the pty, remember the size, tell the relay.
    {
        let host = host.clone();
        let pty = pty.clone();
        let root = root.clone();
        let errors = errors.clone();
        let warp = warp_token.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let mut winch = match signal(SignalKind::window_change()) {
                Ok(winch) => winch,
                Err(err) => {
                    errors.fire(anyhow!("Failed to install WINCH handler: {err}"));
                    return;
                }
            };
            loop {
                tokio::select! {
                    changed = winch.recv() => {
                        if changed.is_none() {
                            break;
                        }
                    }
                    _ = root.cancelled() => break,
                }
                let size = match term::window_size() {
                    Ok(size) => size,
                    Err(err) => {
                        errors.fire(anyhow!("Failed to retrieve the terminal size: {err}"));
                        break;
                    }
                };
                if let Err(err) = pty.resize(size) {
                    errors.fire(anyhow!("Failed to resize pty: {err}"));
                    break;
                }
                *host.size.lock().unwrap() = size;
                let attached = host.attached.lock().await.clone();
                if let Some(session) = attached {
                    // Errors are ignored; a dead session is the reconnect
                    // loop's problem.
                    let _ = session
                        .send_host_update(HostUpdate {
                            warp: warp.clone(),
                            from: identity.clone(),
                            window_size: size,
                            modes: BTreeMap::new(),
                        })
                        .await;
                }
            }
        });
    }

    // Local command server, once the first handshake succeeded.
    {
        let srv = srv.clone();
        let root = root.clone();
        let inited = inited.clone();
        let errors = errors.clone();
        tokio::spawn(async move {
            inited.notified().await;
            if let Err(err) = srv.run(root.child_token()).await {
                errors.fire(anyhow!("Local command server error: {err}"));
            }
        });
    }

    // Reconnect loop.
    {
        let supervisor = Arc::new(Supervisor {
            host: host.clone(),
            pty: pty.clone(),
            root: root.clone(),
            errors: errors.clone(),
            inited,
            dial: args.dial,
            username,
        });
        tokio::spawn(async move {
            conn_loop(supervisor).await;
        });
    }

    root.cancelled().await;
    drop(raw);
    match errors.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Dial the relay forever. The first attempt's failures are fatal and user
/// visible; later iterations retry silently every 500ms, surfacing only
/// relay-originated errors.
async fn conn_loop(supervisor: Arc<Supervisor>) {
    let mut first = true;
    loop {
        if supervisor.root.is_cancelled() {
            break;
        }
        let conn = match dial(&supervisor.dial).await {
            Ok(conn) => conn,
            Err(err) => {
                if first {
                    supervisor
                        .errors
                        .fire(anyhow!("Connection error: {err}"));
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    _ = supervisor.root.cancelled() => break,
                }
            }
        };
        manage_session(&supervisor, conn, !first).await;
        first = false;
    }
}

/// Run one session against the relay until it dies: handshake, initial state
/// merge, then the per-session workers.
async fn manage_session(supervisor: &Supervisor, conn: Box<dyn Conn>, warpd_err_only: bool) {
    let cancel = supervisor.root.child_token();
    let connected = Session::connect(
        conn,
        supervisor.host.identity.clone(),
        &supervisor.host.warp,
        Role::Host,
        &supervisor.username,
        cancel.clone(),
    )
    .await;
    let (session, readers) = match connected {
        Ok(pair) => pair,
        Err(err) => {
            if !warpd_err_only {
                supervisor
                    .errors
                    .fire(anyhow!("Failed to open session to warpd: {err}"));
            }
            return;
        }
    };
    let SessionReaders {
        state: mut state_r,
        error: mut error_r,
        data: mut data_r,
    } = readers;

    // Relay-originated errors always surface, even during silent reconnects.
    {
        let errors = supervisor.errors.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Ok(err) = read_record::<WireError, _>(&mut error_r).await {
                errors.fire(anyhow!("Received {}: {}", err.code, err.message));
            }
            cancel.cancel();
        });
    }

    // Initial host update carries the current window size.
    let initial = HostUpdate {
        warp: supervisor.host.warp.clone(),
        from: supervisor.host.identity.clone(),
        window_size: *supervisor.host.size.lock().unwrap(),
        modes: BTreeMap::new(),
    };
    if session.send_host_update(initial).await.is_err() {
        if !warpd_err_only {
            supervisor
                .errors
                .fire(anyhow!("Failed to send initial host update."));
        }
        session.tear_down();
        return;
    }

    // The first snapshot confirms the handshake.
    match read_record::<WarpState, _>(&mut state_r).await {
        Ok(state) => {
            if let Err(err) = session.update_state(&state, true) {
                if !warpd_err_only {
                    supervisor
                        .errors
                        .fire(anyhow!("Failed to apply initial state update: {err}"));
                }
                session.tear_down();
                return;
            }
        }
        Err(_) => {
            // The error listener surfaced whatever the relay had to say.
            session.tear_down();
            return;
        }
    }

    supervisor.inited.notify_one();
    *supervisor.host.attached.lock().await = Some(session.clone());
    debug!(target: "warp::host", warp = %supervisor.host.warp, "session attached");

    // State loop: merge snapshots, never trusting the relay with modes.
    {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                match read_record::<WarpState, _>(&mut state_r).await {
                    Ok(state) => {
                        if session.update_state(&state, true).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            cancel.cancel();
        });
    }

    // Network → pty, gated on the local shadow's writer set.
    {
        let session = session.clone();
        let input = supervisor.pty.input();
        tokio::spawn(async move {
            while let Some(chunk) = data_r.read_chunk().await {
                if session.host_can_receive_write() && input.send(chunk).await.is_err() {
                    break;
                }
            }
            session.tear_down();
        });
    }

    cancel.cancelled().await;
    session.tear_down();
    *supervisor.host.attached.lock().await = None;
    debug!(target: "warp::host", warp = %supervisor.host.warp, "session detached");
}
