//! The shell client behind `warp connect`: read-only until the host grants
//! writes, at which point local keystrokes start reaching the shared shell.

use std::io::Write as _;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use warp_proto::{
    prefixed_token, read_record, valid_token, Role, SessionIdentity, WarpState, WireError,
};

use crate::config;
use crate::dial::{dial, DialOptions};
use crate::errors::ErrorSink;
use crate::session::{Session, SessionReaders};
use crate::term;

pub struct ConnectArgs {
    pub id: String,
    pub dial: DialOptions,
}

pub async fn run(args: ConnectArgs) -> anyhow::Result<()> {
    if !valid_token(&args.id) {
        bail!("Malformed warp ID: {}", args.id);
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

    let conn = dial(&args.dial)
        .await
        .map_err(|err| anyhow!("Connection to warpd failed: {err}"))?;

    let root = CancellationToken::new();
    let (session, readers) = Session::connect(
        conn,
        identity,
        &args.id,
        Role::ShellClient,
        &username,
        root.clone(),
    )
    .await
    .context("Failed to open session to warpd")?;

    println!("Connected to warp: {}", args.id);

    let raw = term::RawModeGuard::new().context("Unable to put terminal in raw mode")?;
    let errors = ErrorSink::new(root.clone());
    let SessionReaders {
        state: mut state_r,
        error: mut error_r,
        data: mut data_r,
    } = readers;

    // Relay errors surface to the user verbatim.
    {
        let errors = errors.clone();
        tokio::spawn(async move {
            if let Ok(err) = read_record::<WireError, _>(&mut error_r).await {
                errors.fire(anyhow!("Received {}: {}", err.code, err.message));
            }
        });
    }

    // State loop: track the warp and chase the host's window size.
    {
        let session = session.clone();
        let root = root.clone();
        tokio::spawn(async move {
            loop {
                match read_record::<WarpState, _>(&mut state_r).await {
                    Ok(state) => {
                        if session.update_state(&state, false).is_err() {
                            break;
                        }
                        let mut stdout = std::io::stdout();
                        let _ = write!(
                            stdout,
                            "\x1b[8;{};{}t",
                            state.window_size.rows, state.window_size.cols
                        );
                        let _ = stdout.flush();
                    }
                    Err(_) => break,
                }
            }
            root.cancel();
        });
    }

    // stdin → dataC. The relay drops these bytes unless the host authorized
    // this user for writing.
    {
        let session = session.clone();
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
                    Ok(n) => session.write_data(&buf[..n]).await,
                }
            }
            root.cancel();
        });
    }

    // dataC → stdout.
    {
        let errors = errors.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = data_r.read_chunk().await {
                if stdout.write_all(&chunk).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
            errors.fire(anyhow!(
                "Lost connection to warpd. You can attempt to reconnect once you regain connectivity."
            ));
        });
    }

    root.cancelled().await;
    session.tear_down();
    drop(raw);
    match errors.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
