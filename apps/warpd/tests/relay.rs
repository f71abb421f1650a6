//! End-to-end relay tests driving real multiplexed sessions over loopback TCP.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use warp_mux::{Mux, MuxConfig, MuxStream, StreamWriter};
use warp_proto::{
    encode_record, prefixed_token, read_record, Hello, HostUpdate, Mode, ProtoError, Role,
    SessionIdentity, WarpState, WindowSize, WireError,
};
use warpd::Srv;

async fn t<F: Future>(fut: F) -> F::Output {
    timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation timed out")
}

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = Srv::new().serve(listener, CancellationToken::new()).await;
    });
    addr
}

struct Endpoint {
    mux: Mux,
    state: MuxStream,
    update: StreamWriter,
    error: MuxStream,
    data: MuxStream,
    data_w: StreamWriter,
    identity: SessionIdentity,
}

impl Endpoint {
    async fn connect(addr: SocketAddr, warp: &str, role: Role, user: &str) -> Endpoint {
        Endpoint::connect_with_identity(
            addr,
            warp,
            role,
            SessionIdentity {
                token: prefixed_token("session"),
                user: user.to_string(),
                secret: prefixed_token("secret"),
            },
        )
        .await
    }

    async fn connect_with_identity(
        addr: SocketAddr,
        warp: &str,
        role: Role,
        identity: SessionIdentity,
    ) -> Endpoint {
        let conn = TcpStream::connect(addr).await.unwrap();
        let mux = Mux::client(conn, MuxConfig::default());
        let state = mux.open_stream().await.unwrap();
        let update = mux.open_stream().await.unwrap();
        let hello = Hello {
            warp: warp.to_string(),
            from: identity.clone(),
            version: warp_proto::VERSION.to_string(),
            role,
            username: identity.user.clone(),
        };
        update
            .write_all(&encode_record(&hello).unwrap())
            .await
            .unwrap();
        let error = mux.open_stream().await.unwrap();
        let data = mux.open_stream().await.unwrap();
        Endpoint {
            data_w: data.writer(),
            update: update.writer(),
            mux,
            state,
            error,
            data,
            identity,
        }
    }

    /// Connect as host and send the seeding host update.
    async fn host(addr: SocketAddr, warp: &str, user: &str, size: WindowSize) -> Endpoint {
        let endpoint = Endpoint::connect(addr, warp, Role::Host, user).await;
        send_update(&endpoint, warp, size, BTreeMap::new()).await;
        endpoint
    }

    async fn next_state(&mut self) -> Result<WarpState, ProtoError> {
        read_record(&mut self.state).await
    }

    async fn next_error(&mut self) -> Result<WireError, ProtoError> {
        read_record(&mut self.error).await
    }

    async fn read_data(&mut self) -> Option<Bytes> {
        self.data.read_chunk().await
    }

    async fn write_data(&self, bytes: &[u8]) {
        self.data_w.write_all(bytes).await.unwrap();
    }
}

async fn send_update(
    endpoint: &Endpoint,
    warp: &str,
    window_size: WindowSize,
    modes: BTreeMap<String, Mode>,
) {
    let update = HostUpdate {
        warp: warp.to_string(),
        from: endpoint.identity.clone(),
        window_size,
        modes,
    };
    endpoint
        .update
        .write_all(&encode_record(&update).unwrap())
        .await
        .unwrap();
}

fn size() -> WindowSize {
    WindowSize { rows: 24, cols: 80 }
}

async fn read_exactly(endpoint: &mut Endpoint, expected: &[u8]) {
    let mut received = Vec::new();
    while received.len() < expected.len() {
        let chunk = t(endpoint.read_data()).await.expect("data stream ended");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, expected);
}

#[tokio::test]
async fn open_connect_echo() {
    let addr = start_relay().await;

    let mut host = t(Endpoint::host(addr, "demo-1", "host_user", size())).await;
    let first = t(host.next_state()).await.unwrap();
    assert_eq!(first.warp, "demo-1");
    assert_eq!(first.window_size, size());
    assert_eq!(first.users.len(), 1);
    let host_user = &first.users["host_user"];
    assert!(host_user.hosting);
    assert_eq!(host_user.mode, Mode::HOST_DEFAULT);

    let mut client = t(Endpoint::connect(addr, "demo-1", Role::ShellClient, "user_a")).await;
    let joined = t(client.next_state()).await.unwrap();
    assert_eq!(joined.users.len(), 2);
    assert!(joined.users["host_user"].hosting);
    assert_eq!(joined.users["host_user"].mode, Mode::HOST_DEFAULT);
    assert!(!joined.users["user_a"].hosting);
    assert_eq!(joined.users["user_a"].mode, Mode::USER_DEFAULT);

    // The host sees the join too before any bytes flow.
    let joined_host_view = t(host.next_state()).await.unwrap();
    assert_eq!(joined_host_view.users.len(), 2);

    host.write_data(&[0x68, 0x69, 0x0a]).await;
    read_exactly(&mut client, &[0x68, 0x69, 0x0a]).await;

    // Byte fidelity across consecutive chunks.
    host.write_data(b"alpha ").await;
    host.write_data(b"beta ").await;
    host.write_data(b"gamma").await;
    read_exactly(&mut client, b"alpha beta gamma").await;
}

#[tokio::test]
async fn authorize_keystroke_then_revoke() {
    let addr = start_relay().await;

    let mut host = t(Endpoint::host(addr, "demo-auth", "host_user", size())).await;
    t(host.next_state()).await.unwrap();
    let mut client = t(Endpoint::connect(addr, "demo-auth", Role::ShellClient, "user_a")).await;
    t(client.next_state()).await.unwrap();
    t(host.next_state()).await.unwrap();

    // Authorize user_a for writing.
    let mut modes = BTreeMap::new();
    modes.insert("user_a".to_string(), Mode::HOST_DEFAULT);
    send_update(&host, "demo-auth", size(), modes).await;
    let granted = t(client.next_state()).await.unwrap();
    assert_eq!(granted.users["user_a"].mode, Mode::HOST_DEFAULT);

    client.write_data(b"x").await;
    let keystroke = t(host.read_data()).await.unwrap();
    assert_eq!(&keystroke[..], b"x");

    // Revoke and make sure further keystrokes are dropped.
    let mut modes = BTreeMap::new();
    modes.insert("user_a".to_string(), Mode::USER_DEFAULT);
    send_update(&host, "demo-auth", size(), modes).await;
    let revoked = t(client.next_state()).await.unwrap();
    assert_eq!(revoked.users["user_a"].mode, Mode::USER_DEFAULT);

    client.write_data(b"y").await;
    let dropped = timeout(Duration::from_millis(300), host.read_data()).await;
    assert!(dropped.is_err(), "revoked keystroke must not reach the host");
}

#[tokio::test]
async fn second_host_gets_warp_in_use() {
    let addr = start_relay().await;

    let mut host = t(Endpoint::host(addr, "demo-2", "host_user", size())).await;
    t(host.next_state()).await.unwrap();

    let mut intruder = t(Endpoint::host(addr, "demo-2", "other_user", size())).await;
    let err = t(intruder.next_error()).await.unwrap();
    assert_eq!(err.code, "warp_in_use");

    // The original warp keeps serving.
    let mut client = t(Endpoint::connect(addr, "demo-2", Role::ShellClient, "user_a")).await;
    let state = t(client.next_state()).await.unwrap();
    assert_eq!(state.users.len(), 2);
}

#[tokio::test]
async fn client_to_unknown_warp_is_rejected() {
    let addr = start_relay().await;
    let mut client = t(Endpoint::connect(addr, "demo-3", Role::ShellClient, "user_a")).await;
    let err = t(client.next_error()).await.unwrap();
    assert_eq!(err.code, "warp_unknown");
}

#[tokio::test]
async fn chat_role_is_rejected() {
    let addr = start_relay().await;
    let mut client = t(Endpoint::connect(addr, "demo-chat", Role::ChatClient, "user_a")).await;
    let err = t(client.next_error()).await.unwrap();
    assert_eq!(err.code, "unsupported_role");
}

#[tokio::test]
async fn host_crash_evicts_clients_and_deletes_warp() {
    let addr = start_relay().await;

    let mut host = t(Endpoint::host(addr, "demo-4", "host_user", size())).await;
    t(host.next_state()).await.unwrap();
    let mut a = t(Endpoint::connect(addr, "demo-4", Role::ShellClient, "user_a")).await;
    t(a.next_state()).await.unwrap();
    let mut b = t(Endpoint::connect(addr, "demo-4", Role::ShellClient, "user_b")).await;
    t(b.next_state()).await.unwrap();

    // Severing the host transport kills the warp.
    host.mux.close();

    let err_a = t(a.next_error()).await.unwrap();
    assert_eq!(err_a.code, "host_disconnected");
    let err_b = t(b.next_error()).await.unwrap();
    assert_eq!(err_b.code, "host_disconnected");
    assert!(t(a.read_data()).await.is_none());

    // The warp is gone; late joiners see warp_unknown.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut late = t(Endpoint::connect(addr, "demo-4", Role::ShellClient, "user_c")).await;
    let err = t(late.next_error()).await.unwrap();
    assert_eq!(err.code, "warp_unknown");
}

#[tokio::test]
async fn spoofed_host_update_tears_the_session_down() {
    let addr = start_relay().await;

    let mut host = t(Endpoint::host(addr, "demo-6", "host_user", size())).await;
    t(host.next_state()).await.unwrap();

    // Same user, wrong secret: the relay must refuse the update.
    let spoofed = SessionIdentity {
        token: host.identity.token.clone(),
        user: host.identity.user.clone(),
        secret: "not-the-secret".to_string(),
    };
    let update = HostUpdate {
        warp: "demo-6".to_string(),
        from: spoofed,
        window_size: size(),
        modes: BTreeMap::new(),
    };
    host.update
        .write_all(&encode_record(&update).unwrap())
        .await
        .unwrap();

    let err = t(host.next_error()).await.unwrap();
    assert_eq!(err.code, "invalid_host_update");
    assert!(t(host.next_state()).await.is_err());
}

#[tokio::test]
async fn unknown_user_in_modes_is_ignored() {
    let addr = start_relay().await;

    let mut host = t(Endpoint::host(addr, "demo-7", "host_user", size())).await;
    t(host.next_state()).await.unwrap();

    let mut modes = BTreeMap::new();
    modes.insert("ghost_user".to_string(), Mode::HOST_DEFAULT);
    send_update(&host, "demo-7", WindowSize { rows: 50, cols: 120 }, modes).await;

    // The update still applies (new window size, no ghost user) and the warp
    // survives.
    let state = t(host.next_state()).await.unwrap();
    assert_eq!(state.window_size, WindowSize { rows: 50, cols: 120 });
    assert!(!state.users.contains_key("ghost_user"));
}

#[tokio::test]
async fn conflicting_session_token_supersedes_old_session() {
    let addr = start_relay().await;

    let mut host = t(Endpoint::host(addr, "demo-8", "host_user", size())).await;
    t(host.next_state()).await.unwrap();

    let identity = SessionIdentity {
        token: "session_fixed".to_string(),
        user: "user_a".to_string(),
        secret: "secret_a".to_string(),
    };
    let mut first =
        t(Endpoint::connect_with_identity(addr, "demo-8", Role::ShellClient, identity.clone()))
            .await;
    t(first.next_state()).await.unwrap();

    let mut second =
        t(Endpoint::connect_with_identity(addr, "demo-8", Role::ShellClient, identity)).await;
    let state = t(second.next_state()).await.unwrap();
    assert_eq!(state.users.len(), 2);

    // The first session was torn down by the conflict; its streams end.
    loop {
        match t(first.next_state()).await {
            Ok(_) => continue,
            Err(err) => {
                assert!(err.is_closed());
                break;
            }
        }
    }

    // The surviving session still receives host bytes.
    host.write_data(b"still here").await;
    read_exactly(&mut second, b"still here").await;
}
