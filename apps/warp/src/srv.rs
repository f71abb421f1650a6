//! Local command server: a unix socket inside the host process answering the
//! in-warp `state` / `authorize` / `revoke` commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warp_proto::{
    command, read_record, write_record, Command, CommandResult, Mode, ProtoError, SessionIdentity,
    WarpState, WindowSize,
};

use crate::session::Session;

/// Shared supervisor state: the warp being hosted and the currently attached
/// relay session, if any. The attached reference is the single handoff point
/// between the reconnect loop and the command server.
pub struct HostState {
    pub warp: String,
    pub identity: SessionIdentity,
    pub size: StdMutex<WindowSize>,
    pub attached: Mutex<Option<Arc<Session>>>,
}

impl HostState {
    pub fn new(warp: &str, identity: SessionIdentity, size: WindowSize) -> Arc<HostState> {
        Arc::new(HostState {
            warp: warp.to_string(),
            identity,
            size: StdMutex::new(size),
            attached: Mutex::new(None),
        })
    }
}

/// Socket path derived from the warp token, exported to the hosted shell as
/// `WARP_UNIX_SOCKET`.
pub fn socket_path(warp: &str) -> PathBuf {
    std::env::temp_dir().join(format!("_warp_{warp}.sock"))
}

pub struct LocalSrv {
    path: PathBuf,
    host: Arc<HostState>,
}

impl LocalSrv {
    pub fn new(host: Arc<HostState>) -> LocalSrv {
        LocalSrv {
            path: socket_path(&host.warp),
            host,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one-shot command connections until cancelled. The socket is
    /// unlinked first so a crashed previous run cannot block us.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        debug!(target: "warp::srv", path = %self.path.display(), "local command server listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => break,
            };
            let Ok((stream, _)) = accepted else { continue };
            let host = self.host.clone();
            tokio::spawn(async move {
                if let Err(err) = handle(host, stream).await {
                    debug!(target: "warp::srv", error = %err, "command connection failed");
                }
            });
        }

        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}

/// One connection carries exactly one command and one reply. The attached-
/// session lock is held across the whole exchange so authorization changes
/// are atomic with respect to session teardown.
async fn handle(host: Arc<HostState>, mut stream: UnixStream) -> Result<(), ProtoError> {
    let cmd: Command = read_record(&mut stream).await?;
    debug!(target: "warp::srv", kind = %cmd.kind, args = cmd.args.len(), "received command");

    let attached = host.attached.lock().await;
    let session = attached.as_ref();

    let mut result = match cmd.kind.as_str() {
        command::STATE => CommandResult::new(command::STATE),
        command::AUTHORIZE => execute_authorize(session, &cmd).await,
        command::REVOKE => execute_revoke(session, &cmd).await,
        other => CommandResult::with_error(
            other,
            command::COMMAND_UNKNOWN,
            format!("Invalid command: {other}."),
        ),
    };

    // Every reply carries the current state, or the disconnection marker with
    // just the warp token.
    match session {
        Some(session) => result.state = Some(session.state_snapshot()),
        None => {
            result.disconnected = true;
            result.state = Some(WarpState {
                warp: host.warp.clone(),
                window_size: WindowSize::default(),
                users: BTreeMap::new(),
            });
        }
    }
    drop(attached);

    write_record(&mut stream, &result).await
}

async fn execute_authorize(session: Option<&Arc<Session>>, cmd: &Command) -> CommandResult {
    let Some(session) = session else {
        return CommandResult::new(command::AUTHORIZE);
    };
    if cmd.args.len() != 1 {
        return CommandResult::with_error(
            command::AUTHORIZE,
            command::USER_TOKEN_REQUIRED,
            "User token to authorize is required.",
        );
    }
    let user = &cmd.args[0];

    let mode = match session.get_mode(user) {
        Ok(mode) => mode,
        Err(err) => {
            return CommandResult::with_error(
                command::AUTHORIZE,
                command::USER_UNKNOWN,
                format!("{err}."),
            );
        }
    };
    if let Err(err) = session.set_mode(user, mode.with(Mode::SHELL_WRITE)) {
        return CommandResult::with_error(
            command::AUTHORIZE,
            command::USER_UNKNOWN,
            format!("{err}."),
        );
    }

    if session.send_host_update(session.host_update()).await.is_err() {
        return CommandResult::with_error(
            command::AUTHORIZE,
            command::UPDATE_FAILED,
            "Failed to apply update to warp.",
        );
    }

    CommandResult::new(command::AUTHORIZE)
}

async fn execute_revoke(session: Option<&Arc<Session>>, cmd: &Command) -> CommandResult {
    let Some(session) = session else {
        return CommandResult::new(command::REVOKE);
    };

    // No arguments means revoke every client.
    let targets: Vec<String> = if cmd.args.is_empty() {
        session.modes().into_keys().collect()
    } else {
        cmd.args.clone()
    };

    for user in &targets {
        let mode = match session.get_mode(user) {
            Ok(mode) => mode,
            Err(err) => {
                return CommandResult::with_error(
                    command::REVOKE,
                    command::USER_UNKNOWN,
                    format!("{err}."),
                );
            }
        };
        let _ = session.set_mode(user, mode.without(Mode::SHELL_WRITE));
    }

    if session.send_host_update(session.host_update()).await.is_err() {
        return CommandResult::with_error(
            command::REVOKE,
            command::UPDATE_FAILED,
            "Failed to apply update to warp.",
        );
    }

    CommandResult::new(command::REVOKE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp_mux::{Mux, MuxConfig, MuxStream};
    use warp_proto::{HostUpdate, Role, User};

    /// A session wired to an in-memory fake relay. Returns the relay-side
    /// sub-streams so tests can observe what the session sent.
    async fn attached_session() -> (Arc<Session>, Vec<MuxStream>, Mux) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let relay = Mux::server(server_io, MuxConfig::default());
        let identity = SessionIdentity {
            token: "session_1".into(),
            user: "host_user".into(),
            secret: "shh".into(),
        };
        let connect = Session::connect(
            Box::new(client_io),
            identity,
            "demo",
            Role::Host,
            "alice",
            CancellationToken::new(),
        );
        let accept = async {
            let mut streams = Vec::new();
            for _ in 0..4 {
                streams.push(relay.accept_stream().await.unwrap());
            }
            streams
        };
        let ((session, _readers), streams) =
            tokio::join!(async { connect.await.unwrap() }, accept);

        // Make a viewer known to the shadow.
        let mut users = BTreeMap::new();
        users.insert(
            "host_user".into(),
            User {
                token: "host_user".into(),
                username: "alice".into(),
                mode: Mode::HOST_DEFAULT,
                hosting: true,
            },
        );
        users.insert(
            "viewer".into(),
            User {
                token: "viewer".into(),
                username: "bob".into(),
                mode: Mode::USER_DEFAULT,
                hosting: false,
            },
        );
        let state = WarpState {
            warp: "demo".into(),
            window_size: WindowSize { rows: 24, cols: 80 },
            users,
        };
        session.update_state(&state, true).unwrap();
        (session, streams, relay)
    }

    #[tokio::test]
    async fn authorize_requires_exactly_one_argument() {
        let (session, _streams, _relay) = attached_session().await;
        let result = execute_authorize(
            Some(&session),
            &Command {
                kind: command::AUTHORIZE.into(),
                args: vec![],
            },
        )
        .await;
        assert_eq!(result.error.unwrap().code, command::USER_TOKEN_REQUIRED);
    }

    #[tokio::test]
    async fn authorize_unknown_user_is_reported() {
        let (session, _streams, _relay) = attached_session().await;
        let result = execute_authorize(
            Some(&session),
            &Command {
                kind: command::AUTHORIZE.into(),
                args: vec!["ghost".into()],
            },
        )
        .await;
        assert_eq!(result.error.unwrap().code, command::USER_UNKNOWN);
    }

    #[tokio::test]
    async fn authorize_grants_write_and_sends_update() {
        let (session, mut streams, _relay) = attached_session().await;
        let result = execute_authorize(
            Some(&session),
            &Command {
                kind: command::AUTHORIZE.into(),
                args: vec!["viewer".into()],
            },
        )
        .await;
        assert!(result.error.is_none());
        assert!(session
            .get_mode("viewer")
            .unwrap()
            .contains(Mode::SHELL_WRITE));

        // The fake relay sees the hello followed by the mode update.
        let update_stream = &mut streams[1];
        let _hello: warp_proto::Hello = read_record(update_stream).await.unwrap();
        let update: HostUpdate = read_record(update_stream).await.unwrap();
        assert_eq!(update.warp, "demo");
        assert!(update.modes["viewer"].contains(Mode::SHELL_WRITE));
    }

    #[tokio::test]
    async fn revoke_without_args_clears_every_writer() {
        let (session, mut streams, _relay) = attached_session().await;
        session
            .set_mode("viewer", Mode::USER_DEFAULT.with(Mode::SHELL_WRITE))
            .unwrap();

        let result = execute_revoke(
            Some(&session),
            &Command {
                kind: command::REVOKE.into(),
                args: vec![],
            },
        )
        .await;
        assert!(result.error.is_none());
        assert_eq!(session.get_mode("viewer").unwrap(), Mode::USER_DEFAULT);

        let update_stream = &mut streams[1];
        let _hello: warp_proto::Hello = read_record(update_stream).await.unwrap();
        let update: HostUpdate = read_record(update_stream).await.unwrap();
        assert!(!update.modes["viewer"].contains(Mode::SHELL_WRITE));
    }

    #[tokio::test]
    async fn revoke_unknown_user_is_reported() {
        let (session, _streams, _relay) = attached_session().await;
        let result = execute_revoke(
            Some(&session),
            &Command {
                kind: command::REVOKE.into(),
                args: vec!["ghost".into()],
            },
        )
        .await;
        assert_eq!(result.error.unwrap().code, command::USER_UNKNOWN);
    }

    #[tokio::test]
    async fn detached_commands_succeed_without_error() {
        let result = execute_authorize(
            None,
            &Command {
                kind: command::AUTHORIZE.into(),
                args: vec!["viewer".into()],
            },
        )
        .await;
        assert!(result.error.is_none());
        let result = execute_revoke(
            None,
            &Command {
                kind: command::REVOKE.into(),
                args: vec![],
            },
        )
        .await;
        assert!(result.error.is_none());
    }
}
