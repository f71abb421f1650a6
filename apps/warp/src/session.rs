//! Endpoint view of one connection to warpd.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use warp_mux::{Mux, MuxConfig, MuxError, MuxStream, StreamWriter};
use warp_proto::{
    encode_record, Hello, HostUpdate, Mode, ProtoError, Role, SessionIdentity, WarpState,
    WindowSize,
};

use crate::dial::Conn;
use crate::state::{StateError, WarpShadow};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("sub-stream error: {0}")]
    Mux(#[from] MuxError),
    #[error("record error: {0}")]
    Proto(#[from] ProtoError),
}

/// The read halves of a session's sub-streams. Each is single-reader; the
/// caller moves them into the tasks that consume them. Teardown of the
/// session unblocks all of them with end-of-stream.
pub struct SessionReaders {
    pub state: MuxStream,
    pub error: MuxStream,
    pub data: MuxStream,
}

/// One endpoint session: the four sub-streams, the warp shadow, and an
/// idempotent teardown. Write paths are safe for concurrent callers and
/// become silent no-ops once the session is torn down.
pub struct Session {
    identity: SessionIdentity,
    warp: String,
    mux: Mux,
    cancel: CancellationToken,
    torn_down: AtomicBool,
    update_w: StreamWriter,
    data_w: StreamWriter,
    shadow: StdMutex<WarpShadow>,
}

impl Session {
    /// Open the sub-streams in protocol order (state, update, error, data),
    /// send the hello, and seed the local warp shadow. On failure everything
    /// opened so far is torn down.
    pub async fn connect(
        conn: Box<dyn Conn>,
        identity: SessionIdentity,
        warp: &str,
        role: Role,
        username: &str,
        cancel: CancellationToken,
    ) -> Result<(Arc<Session>, SessionReaders), SessionError> {
        let mux = Mux::client(conn, MuxConfig::default());
        match Session::open(&mux, identity, warp, role, username, cancel.clone()).await {
            Ok(pair) => Ok(pair),
            Err(err) => {
                cancel.cancel();
                mux.close();
                Err(err)
            }
        }
    }

    async fn open(
        mux: &Mux,
        identity: SessionIdentity,
        warp: &str,
        role: Role,
        username: &str,
        cancel: CancellationToken,
    ) -> Result<(Arc<Session>, SessionReaders), SessionError> {
        let state = mux.open_stream().await?;
        let update = mux.open_stream().await?;

        let hello = Hello {
            warp: warp.to_string(),
            from: identity.clone(),
            version: warp_proto::VERSION.to_string(),
            role,
            username: username.to_string(),
        };
        update.write_all(&encode_record(&hello)?).await?;

        let error = mux.open_stream().await?;
        let data = mux.open_stream().await?;

        let shadow = WarpShadow::new(&hello);
        let session = Arc::new(Session {
            identity,
            warp: warp.to_string(),
            mux: mux.clone(),
            cancel,
            torn_down: AtomicBool::new(false),
            update_w: update.writer(),
            data_w: data.writer(),
            shadow: StdMutex::new(shadow),
        });
        Ok((session, SessionReaders { state, error, data }))
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn warp(&self) -> &str {
        &self.warp
    }

    /// Send a host update. Safe for concurrent callers; a no-op after
    /// teardown; transport errors surface.
    pub async fn send_host_update(&self, update: HostUpdate) -> Result<(), SessionError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Ok(());
        }
        let buf = encode_record(&update)?;
        self.update_w.write_all(&buf).await?;
        Ok(())
    }

    /// Write bytes on the data sub-stream. Safe for concurrent callers; a
    /// silent no-op after teardown.
    pub async fn write_data(&self, chunk: &[u8]) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.data_w.write_all(chunk).await {
            debug!(target: "warp::session", error = %err, "data write failed");
        }
    }

    /// Idempotent teardown: marks the session, fires its cancellation token
    /// and closes the multiplexer, which closes every sub-stream and the
    /// transport. Blocked readers observe end-of-stream.
    pub fn tear_down(&self) {
        if !self.torn_down.swap(true, Ordering::AcqRel) {
            debug!(target: "warp::session", session = %self.identity, "tearing session down");
            self.cancel.cancel();
            self.mux.close();
        }
    }

    pub fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Build a host update carrying the shadow's current window size and
    /// modes, the shape sent after an authorize or revoke.
    pub fn host_update(&self) -> HostUpdate {
        let shadow = self.shadow.lock().unwrap();
        HostUpdate {
            warp: self.warp.clone(),
            from: self.identity.clone(),
            window_size: shadow.window_size(),
            modes: shadow.modes(),
        }
    }

    pub fn update_state(&self, state: &WarpState, hosting: bool) -> Result<(), StateError> {
        self.shadow.lock().unwrap().update(state, hosting)
    }

    pub fn host_can_receive_write(&self) -> bool {
        self.shadow.lock().unwrap().host_can_receive_write()
    }

    pub fn get_mode(&self, user: &str) -> Result<Mode, StateError> {
        self.shadow.lock().unwrap().get_mode(user)
    }

    pub fn set_mode(&self, user: &str, mode: Mode) -> Result<(), StateError> {
        self.shadow.lock().unwrap().set_mode(user, mode)
    }

    pub fn window_size(&self) -> WindowSize {
        self.shadow.lock().unwrap().window_size()
    }

    pub fn modes(&self) -> std::collections::BTreeMap<String, Mode> {
        self.shadow.lock().unwrap().modes()
    }

    pub fn state_snapshot(&self) -> WarpState {
        self.shadow.lock().unwrap().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp_mux::{Mux as ServerMux, MuxConfig as ServerConfig};
    use warp_proto::read_record;

    async fn session_pair() -> (Arc<Session>, SessionReaders, Vec<MuxStream>, ServerMux) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = ServerMux::server(server_io, ServerConfig::default());
        let identity = SessionIdentity {
            token: "session_t".into(),
            user: "user_u".into(),
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
                streams.push(server.accept_stream().await.unwrap());
            }
            streams
        };
        let ((session, readers), streams) = tokio::join!(
            async { connect.await.unwrap() },
            accept
        );
        (session, readers, streams, server)
    }

    #[tokio::test]
    async fn hello_is_first_record_on_update_stream() {
        let (_session, _readers, mut streams, _server) = session_pair().await;
        let hello: Hello = read_record(&mut streams[1]).await.unwrap();
        assert_eq!(hello.warp, "demo");
        assert_eq!(hello.role, Role::Host);
        assert_eq!(hello.username, "alice");
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_silences_writes() {
        let (session, mut readers, _streams, _server) = session_pair().await;
        session.tear_down();
        session.tear_down();
        assert!(session.torn_down());

        // Writes after teardown are silent no-ops.
        session.write_data(b"late").await;
        session.send_host_update(session.host_update()).await.unwrap();

        // Blocked reads resolve to end-of-stream.
        let err = read_record::<WarpState, _>(&mut readers.state)
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn shadow_flows_through_session() {
        let (session, _readers, _streams, _server) = session_pair().await;
        assert_eq!(session.get_mode("user_u").unwrap(), Mode::HOST_DEFAULT);
        assert!(!session.host_can_receive_write());
        assert!(session.modes().is_empty());
        let update = session.host_update();
        assert_eq!(update.warp, "demo");
        assert!(update.modes.is_empty());
    }
}
