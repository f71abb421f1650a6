//! Wire data model shared by the warp endpoint and the warpd relay.
//!
//! Everything exchanged on the control sub-streams is one of the types below,
//! encoded as a length-prefixed record (see [`records`]). The data sub-stream
//! carries opaque bytes and never goes through this crate.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod records;
mod token;

pub use records::{encode_record, read_record, write_record};
pub use token::{prefixed_token, random_token, valid_token};

/// Advisory protocol version carried in every [`Hello`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default relay address, overridable with `WARPD_ADDRESS`.
pub const DEFAULT_ADDRESS: &str = "warp.link:4242";

/// Env variable exporting the warp token into the hosted shell.
pub const ENV_WARP: &str = "WARP";
/// Env variable exporting the local command socket path into the hosted shell.
pub const ENV_WARP_UNIX_SOCKET: &str = "WARP_UNIX_SOCKET";
/// Env variable overriding the relay address.
pub const ENV_WARPD_ADDRESS: &str = "WARPD_ADDRESS";
/// Env variable disabling TLS on the relay connection.
pub const ENV_WARPD_NO_TLS: &str = "WARPD_NO_TLS";
/// Env variable disabling TLS certificate verification.
pub const ENV_WARPD_INSECURE_TLS: &str = "WARPD_INSECURE_TLS";

/// Error codes sent on the error sub-stream by the relay.
pub mod codes {
    pub const WARP_IN_USE: &str = "warp_in_use";
    pub const WARP_UNKNOWN: &str = "warp_unknown";
    pub const INVALID_HOST_UPDATE: &str = "invalid_host_update";
    pub const UNSUPPORTED_ROLE: &str = "unsupported_role";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const HOST_DISCONNECTED: &str = "host_disconnected";
    pub const DATA_RECEIVE_FAILED: &str = "data_receive_failed";
    pub const DATA_SEND_FAILED: &str = "data_send_failed";
}

/// Local command kinds and result codes.
pub mod command {
    pub const STATE: &str = "state";
    pub const AUTHORIZE: &str = "authorize";
    pub const REVOKE: &str = "revoke";

    pub const USER_UNKNOWN: &str = "user_unknown";
    pub const USER_TOKEN_REQUIRED: &str = "user_token_required";
    pub const COMMAND_UNKNOWN: &str = "command_unknown";
    pub const UPDATE_FAILED: &str = "update_failed";
}

/// What a user may do inside a warp, as a bitset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Mode(u32);

impl Mode {
    pub const SHELL_READ: Mode = Mode(1);
    pub const SHELL_WRITE: Mode = Mode(1 << 1);

    /// Mode granted to the hosting user.
    pub const HOST_DEFAULT: Mode = Mode(1 | 1 << 1);
    /// Mode granted to any freshly joined non-host user.
    pub const USER_DEFAULT: Mode = Mode(1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Mode) -> Mode {
        Mode(self.0 | other.0)
    }

    pub fn without(self, other: Mode) -> Mode {
        Mode(self.0 & !other.0)
    }
}

/// The credential triple identifying one connection of one user.
///
/// The secret is shared between the host endpoint and the relay so that the
/// relay can reject spoofed host updates. It is deliberately excluded from the
/// `Display` form so it never lands in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub token: String,
    pub user: String,
    pub secret: String,
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.token)
    }
}

/// A terminal window size, in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

/// A user of a warp as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub token: String,
    pub username: String,
    pub mode: Mode,
    pub hosting: bool,
}

/// Authoritative warp state snapshot, broadcast by the relay on the state
/// sub-stream whenever the warp changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpState {
    pub warp: String,
    pub window_size: WindowSize,
    pub users: BTreeMap<String, User>,
}

/// The role a session asks for in its hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Host,
    ShellClient,
    /// Reserved; rejected by the relay with `unsupported_role`.
    ChatClient,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::ShellClient => write!(f, "shell-client"),
            Role::ChatClient => write!(f, "chat-client"),
        }
    }
}

/// First record an endpoint sends on the update sub-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub warp: String,
    pub from: SessionIdentity,
    pub version: String,
    pub role: Role,
    pub username: String,
}

/// A host-issued update to the warp state. Follows the hello on the update
/// sub-stream; only valid from the hosting session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUpdate {
    pub warp: String,
    pub from: SessionIdentity,
    pub window_size: WindowSize,
    /// Mode changes keyed by user token. Absent users keep their mode.
    #[serde(default)]
    pub modes: BTreeMap<String, Mode>,
}

/// Error record sent on the error sub-stream before teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A request on the local command socket. `kind` is kept as a string on the
/// wire so an unknown command can be answered with `command_unknown` instead
/// of a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The single reply to a local command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub kind: String,
    #[serde(default)]
    pub disconnected: bool,
    #[serde(default)]
    pub state: Option<WarpState>,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl CommandResult {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            disconnected: false,
            state: None,
            error: None,
        }
    }

    pub fn with_error(kind: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(WireError::new(code, message)),
            ..Self::new(kind)
        }
    }
}

/// Errors produced by this crate's codec layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),
    /// The stream ended cleanly at a record boundary.
    #[error("stream closed")]
    Closed,
}

impl ProtoError {
    /// Whether this error is a plain end-of-stream rather than corruption.
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtoError::Closed)
    }
}
