use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp_proto::{codes, read_record, HostUpdate, Mode, User, WarpState, WindowSize};

use crate::client::Client;

/// How long a fan-out write to a single client may stall before that client
/// is considered dead and evicted.
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct UserEntry {
    token: String,
    username: String,
    mode: Mode,
    /// Live sessions of this user, by session token.
    sessions: HashMap<String, Arc<Client>>,
}

impl UserEntry {
    fn to_user(&self, hosting: bool) -> User {
        User {
            token: self.token.clone(),
            username: self.username.clone(),
            mode: self.mode,
            hosting,
        }
    }
}

struct HostEntry {
    /// The hosting user; `sessions` holds extra observer connections made by
    /// the same user, never the hosting session itself.
    user: UserEntry,
    session: Arc<Client>,
}

struct WarpInner {
    window_size: WindowSize,
    host: HostEntry,
    clients: HashMap<String, UserEntry>,
}

/// Authoritative per-warp state and data plane. Owned by the dispatcher; owns
/// its session handles by session token.
pub struct Warp {
    token: String,
    inner: StdMutex<WarpInner>,
    /// Rendezvous carrying authorized client keystrokes to the host.
    host_tx: mpsc::Sender<Bytes>,
    host_rx: StdMutex<Option<mpsc::Receiver<Bytes>>>,
}

impl Warp {
    pub fn new(token: &str, host: Arc<Client>) -> Arc<Warp> {
        let (host_tx, host_rx) = mpsc::channel(1);
        Arc::new(Warp {
            token: token.to_string(),
            inner: StdMutex::new(WarpInner {
                window_size: WindowSize::default(),
                host: HostEntry {
                    user: UserEntry {
                        token: host.user_token().to_string(),
                        username: host.username().to_string(),
                        mode: Mode::HOST_DEFAULT,
                        sessions: HashMap::new(),
                    },
                    session: host,
                },
                clients: HashMap::new(),
            }),
            host_tx,
            host_rx: StdMutex::new(Some(host_rx)),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn snapshot(&self) -> WarpState {
        let inner = self.inner.lock().unwrap();
        let mut users = BTreeMap::new();
        users.insert(inner.host.user.token.clone(), inner.host.user.to_user(true));
        for (token, entry) in &inner.clients {
            users.insert(token.clone(), entry.to_user(false));
        }
        WarpState {
            warp: self.token.clone(),
            window_size: inner.window_size,
            users,
        }
    }

    /// Every client session: shell clients plus observer sessions of the
    /// hosting user. Excludes the hosting session itself.
    fn client_sessions(&self) -> Vec<Arc<Client>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions = Vec::new();
        for entry in inner.clients.values() {
            sessions.extend(entry.sessions.values().cloned());
        }
        sessions.extend(inner.host.user.sessions.values().cloned());
        sessions
    }

    fn host_session(&self) -> Arc<Client> {
        self.inner.lock().unwrap().host.session.clone()
    }

    /// Send a fresh snapshot to the host and every client session. Snapshots
    /// to one session stay ordered because each session has a single state
    /// sub-stream writer.
    async fn broadcast(&self) {
        let state = self.snapshot();
        let host = self.host_session();
        debug!(
            target: "warpd::warp",
            warp = %self.token,
            users = state.users.len(),
            rows = state.window_size.rows,
            cols = state.window_size.cols,
            "broadcasting state"
        );
        if host.send_state(&state).await.is_err() {
            debug!(target: "warpd::warp", warp = %self.token, "state send to host failed");
        }
        for session in self.client_sessions() {
            if session.send_state(&state).await.is_err() {
                debug!(
                    target: "warpd::warp",
                    warp = %self.token,
                    session = %session.identity(),
                    "state send to client failed"
                );
            }
        }
    }

    fn validate_update(&self, update: &HostUpdate, host: &Client) -> Result<(), String> {
        if update.warp != self.token {
            return Err(format!("Host update warp mismatch: {}", update.warp));
        }
        if update.from != *host.identity() {
            return Err(format!("Host update host mismatch: {}", update.from));
        }
        Ok(())
    }

    /// Apply a validated host update: replace the window size and the modes
    /// of currently connected clients. Unknown user tokens are skipped.
    fn apply_update(&self, update: &HostUpdate) {
        let mut inner = self.inner.lock().unwrap();
        inner.window_size = update.window_size;
        for (token, mode) in &update.modes {
            match inner.clients.get_mut(token) {
                Some(entry) => entry.mode = *mode,
                None => {
                    warn!(
                        target: "warpd::warp",
                        warp = %self.token,
                        user = %token,
                        "host update names unknown client, skipping"
                    );
                }
            }
        }
    }

    /// Drive the hosting session: consume host updates, fan host bytes out to
    /// clients, pump authorized client bytes back to the host. Returns when
    /// the host session dies, after evicting every remaining client.
    pub async fn handle_host(self: &Arc<Self>, host: Arc<Client>) {
        let (Some(mut update_r), Some(mut data_r)) =
            (host.take_update_reader(), host.take_data_reader())
        else {
            host.teardown();
            return;
        };

        // First host update seeds the window size.
        match read_record::<HostUpdate, _>(&mut update_r).await {
            Ok(update) => {
                if let Err(reason) = self.validate_update(&update, &host) {
                    host.send_error(codes::INVALID_HOST_UPDATE, reason).await;
                    host.teardown();
                    return;
                }
                self.apply_update(&update);
            }
            Err(err) => {
                host.send_error(
                    codes::INVALID_HOST_UPDATE,
                    format!("Host update decoding failed: {err}"),
                )
                .await;
                host.teardown();
                return;
            }
        }
        self.broadcast().await;

        info!(
            target: "warpd::warp",
            warp = %self.token,
            session = %host.identity(),
            "host running"
        );

        // Host update consumer.
        {
            let warp = self.clone();
            let host = host.clone();
            tokio::spawn(async move {
                let cancel = host.cancel_token();
                loop {
                    let update = tokio::select! {
                        record = read_record::<HostUpdate, _>(&mut update_r) => record,
                        _ = cancel.cancelled() => break,
                    };
                    match update {
                        Ok(update) => {
                            if let Err(reason) = warp.validate_update(&update, &host) {
                                host.send_error(codes::INVALID_HOST_UPDATE, reason).await;
                                break;
                            }
                            debug!(
                                target: "warpd::warp",
                                warp = %warp.token,
                                rows = update.window_size.rows,
                                cols = update.window_size.cols,
                                modes = update.modes.len(),
                                "received host update"
                            );
                            warp.apply_update(&update);
                            warp.broadcast().await;
                        }
                        Err(err) if err.is_closed() => break,
                        Err(err) => {
                            host.send_error(
                                codes::INVALID_HOST_UPDATE,
                                format!("Host update decoding failed: {err}"),
                            )
                            .await;
                            break;
                        }
                    }
                }
                host.teardown();
            });
        }

        // Host data consumer: pty bytes fan out to every client session.
        {
            let warp = self.clone();
            let host = host.clone();
            tokio::spawn(async move {
                let cancel = host.cancel_token();
                loop {
                    let chunk = tokio::select! {
                        chunk = data_r.read_chunk() => chunk,
                        _ = cancel.cancelled() => break,
                    };
                    match chunk {
                        Some(chunk) => warp.forward_host_data(&chunk).await,
                        None => {
                            host.send_error(
                                codes::DATA_RECEIVE_FAILED,
                                "Error receiving data from host".to_string(),
                            )
                            .await;
                            break;
                        }
                    }
                }
                host.teardown();
            });
        }

        // Host data producer: authorized client keystrokes reach the host pty.
        {
            let host = host.clone();
            let mut host_rx = self
                .host_rx
                .lock()
                .unwrap()
                .take()
                .expect("host data receiver already taken");
            tokio::spawn(async move {
                let cancel = host.cancel_token();
                loop {
                    let chunk = tokio::select! {
                        chunk = host_rx.recv() => chunk,
                        _ = cancel.cancelled() => break,
                    };
                    match chunk {
                        Some(chunk) => {
                            if host.write_data(&chunk).await.is_err() {
                                host.send_error(
                                    codes::DATA_SEND_FAILED,
                                    "Error sending data to host".to_string(),
                                )
                                .await;
                                break;
                            }
                        }
                        None => break,
                    }
                }
                host.teardown();
            });
        }

        let cancel = host.cancel_token();
        cancel.cancelled().await;

        info!(
            target: "warpd::warp",
            warp = %self.token,
            "host disconnected, evicting clients"
        );
        for session in self.client_sessions() {
            session
                .send_error(
                    codes::HOST_DISCONNECTED,
                    format!("Host disconnected: {}", self.token),
                )
                .await;
            session.teardown();
        }
        host.teardown();
    }

    async fn forward_host_data(&self, chunk: &[u8]) {
        for session in self.client_sessions() {
            let write = tokio::time::timeout(CLIENT_WRITE_TIMEOUT, session.write_data(chunk)).await;
            if !matches!(write, Ok(Ok(()))) {
                session
                    .send_error(codes::INTERNAL_ERROR, "Error sending data".to_string())
                    .await;
                session.teardown();
            }
        }
    }

    /// Drive one client session until it dies, then deregister it.
    pub async fn handle_client(self: &Arc<Self>, client: Arc<Client>) {
        let Some(mut data_r) = client.take_data_reader() else {
            client.teardown();
            return;
        };
        let user_token = client.user_token().to_string();
        let session_token = client.session_token().to_string();

        let superseded = {
            let mut inner = self.inner.lock().unwrap();
            let entry = if user_token == inner.host.user.token {
                &mut inner.host.user
            } else {
                inner
                    .clients
                    .entry(user_token.clone())
                    .or_insert_with(|| UserEntry {
                        token: user_token.clone(),
                        username: client.username().to_string(),
                        mode: Mode::USER_DEFAULT,
                        sessions: HashMap::new(),
                    })
            };
            entry.sessions.insert(session_token.clone(), client.clone())
        };
        if let Some(old) = superseded {
            // A reconnection with the same session token supersedes the old
            // session.
            debug!(
                target: "warpd::warp",
                warp = %self.token,
                session = %old.identity(),
                "superseding conflicting session"
            );
            old.teardown();
        }

        // Client data consumer: forward to the host only when the client's
        // mode permits writes at the time the chunk is picked up.
        {
            let warp = self.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let cancel = client.cancel_token();
                loop {
                    let chunk = tokio::select! {
                        chunk = data_r.read_chunk() => chunk,
                        _ = cancel.cancelled() => break,
                    };
                    match chunk {
                        Some(chunk) => {
                            let writable = {
                                let inner = warp.inner.lock().unwrap();
                                inner
                                    .clients
                                    .get(client.user_token())
                                    .map(|entry| entry.mode.contains(Mode::SHELL_WRITE))
                                    .unwrap_or(false)
                            };
                            if writable && warp.host_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            client
                                .send_error(
                                    codes::DATA_RECEIVE_FAILED,
                                    "Error receiving data".to_string(),
                                )
                                .await;
                            break;
                        }
                    }
                }
                client.teardown();
            });
        }

        info!(
            target: "warpd::warp",
            warp = %self.token,
            session = %client.identity(),
            "client running"
        );
        self.broadcast().await;

        let cancel = client.cancel_token();
        cancel.cancelled().await;

        debug!(
            target: "warpd::warp",
            warp = %self.token,
            session = %client.identity(),
            "cleaning up client"
        );
        {
            let mut inner = self.inner.lock().unwrap();
            if user_token == inner.host.user.token {
                inner.host.user.sessions.remove(&session_token);
            } else if let Some(entry) = inner.clients.get_mut(&user_token) {
                entry.sessions.remove(&session_token);
                if entry.sessions.is_empty() {
                    inner.clients.remove(&user_token);
                }
            }
        }
        self.broadcast().await;
    }
}
