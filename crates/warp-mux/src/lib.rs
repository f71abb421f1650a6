//! Stream multiplexer for warp sessions.
//!
//! One reliable byte transport (TCP or TLS) carries several independent,
//! ordered, full-duplex sub-streams. The dialing side opens sub-streams with
//! sequential ids; the accepting side observes them in the same order, which
//! is how the session layer pins each sub-stream to a role. Per-sub-stream
//! flow control keeps a stalled consumer from blocking the siblings, and
//! keepalive probes tear down connections that stop moving.

mod frame;
mod mux;
mod stream;

pub use mux::{Mux, MuxConfig};
pub use stream::{MuxStream, StreamWriter};

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("multiplexer closed")]
    Closed,
    #[error("keepalive deadline exceeded")]
    Timeout,
    #[error("flow control violation on sub-stream {0}")]
    FlowControl(u16),
}
