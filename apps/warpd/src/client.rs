use std::sync::Mutex as StdMutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use warp_mux::{Mux, MuxError, MuxStream, StreamWriter};
use warp_proto::{encode_record, read_record, Hello, ProtoError, Role, SessionIdentity, WarpState, WireError};

/// Errors raised while setting a connection up, before it is routed to a warp.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// The relay's view of one connected endpoint: the four accepted sub-streams,
/// the identity from its hello, and a cancellation token that tears the
/// session down.
///
/// Write paths (`send_state`, `send_error`, `write_data`) are safe from any
/// task. The update and data read halves are taken once by the warp handlers.
pub struct Client {
    hello: Hello,
    cancel: CancellationToken,
    mux: Mux,
    state_w: StreamWriter,
    error_w: StreamWriter,
    data_w: StreamWriter,
    update_r: StdMutex<Option<MuxStream>>,
    data_r: StdMutex<Option<MuxStream>>,
}

impl Client {
    /// Accept the four sub-streams in opening order and decode the hello off
    /// the update sub-stream.
    pub async fn accept(mux: &Mux, cancel: CancellationToken) -> Result<Client, AcceptError> {
        let state = mux.accept_stream().await?;
        let mut update = mux.accept_stream().await?;
        let hello: Hello = read_record(&mut update).await?;
        let error = mux.accept_stream().await?;
        let data = mux.accept_stream().await?;
        Ok(Client {
            hello,
            cancel,
            mux: mux.clone(),
            state_w: state.writer(),
            error_w: error.writer(),
            data_w: data.writer(),
            update_r: StdMutex::new(Some(update)),
            data_r: StdMutex::new(Some(data)),
        })
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.hello.from
    }

    pub fn user_token(&self) -> &str {
        &self.hello.from.user
    }

    pub fn session_token(&self) -> &str {
        &self.hello.from.token
    }

    pub fn username(&self) -> &str {
        &self.hello.username
    }

    pub fn warp(&self) -> &str {
        &self.hello.warp
    }

    pub fn role(&self) -> Role {
        self.hello.role
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn take_update_reader(&self) -> Option<MuxStream> {
        self.update_r.lock().unwrap().take()
    }

    pub fn take_data_reader(&self) -> Option<MuxStream> {
        self.data_r.lock().unwrap().take()
    }

    pub async fn send_state(&self, state: &WarpState) -> Result<(), AcceptError> {
        let buf = encode_record(state)?;
        self.state_w.write_all(&buf).await?;
        Ok(())
    }

    /// Best-effort error record; the session is usually torn down right
    /// after, so failures only get a debug line.
    pub async fn send_error(&self, code: &str, message: String) {
        debug!(
            target: "warpd::client",
            session = %self.hello.from,
            code,
            message = %message,
            "sending error"
        );
        let record = WireError::new(code, message);
        match encode_record(&record) {
            Ok(buf) => {
                let _ = self.error_w.write_all(&buf).await;
            }
            Err(err) => {
                debug!(target: "warpd::client", error = %err, "failed to encode error record");
            }
        }
    }

    pub async fn write_data(&self, chunk: &[u8]) -> Result<(), MuxError> {
        self.data_w.write_all(chunk).await
    }

    /// Idempotent teardown: cancels the session token and closes the mux,
    /// which unblocks every pending read and write.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.mux.close();
    }
}
