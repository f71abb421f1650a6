use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::frame::{decode_header, Frame, FrameKind, HEADER_LEN};
use crate::stream::{MuxStream, RecvState, StreamShared};
use crate::MuxError;

/// Multiplexer knobs. The keepalive cadence and deadline are local policy and
/// may differ between peers; `initial_window` is part of the wire contract and
/// both ends must agree on it.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Liveness probe cadence.
    pub keepalive_interval: Duration,
    /// Tear the connection down if nothing was read for this long. Also
    /// bounds a single transport write.
    pub idle_timeout: Duration,
    /// Per-sub-stream receive window.
    pub initial_window: u32,
    /// Sub-streams a peer may open before we call it a protocol violation.
    pub max_streams: u16,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(10),
            initial_window: 256 * 1024,
            max_streams: 16,
        }
    }
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    recv: Arc<RecvState>,
    /// Present until the peer half-closes; dropping it is how readers see EOF.
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
}

struct Inner {
    config: MuxConfig,
    is_client: bool,
    outbound: mpsc::Sender<Frame>,
    streams: StdMutex<HashMap<u16, StreamEntry>>,
    next_open: AtomicU16,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
    shutdown: CancellationToken,
    timed_out: AtomicBool,
    last_read: StdMutex<Instant>,
}

impl Inner {
    fn register(&self, id: u16) -> MuxStream {
        let shared = Arc::new(StreamShared::new(
            id,
            self.config.initial_window,
            self.outbound.clone(),
            self.shutdown.clone(),
        ));
        let recv = Arc::new(RecvState::new(self.config.initial_window));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().insert(
            id,
            StreamEntry {
                shared: shared.clone(),
                recv: recv.clone(),
                inbound: Some(inbound_tx),
            },
        );
        MuxStream::new(shared, recv, inbound_rx)
    }

    fn shutdown_now(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let mut streams = self.streams.lock().unwrap();
        for entry in streams.values_mut() {
            entry.inbound = None;
            entry.shared.wake();
        }
    }

    fn close_error(&self) -> MuxError {
        if self.timed_out.load(Ordering::Acquire) {
            MuxError::Timeout
        } else {
            MuxError::Closed
        }
    }
}

/// One multiplexed connection. Cheap to clone; all clones drive the same
/// transport. Closing is idempotent and closes every sub-stream.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<Inner>,
}

impl Mux {
    /// Endpoint side: opens sub-streams.
    pub fn client<T>(io: T, config: MuxConfig) -> Mux
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Mux::spawn(io, config, true)
    }

    /// Relay side: accepts sub-streams in the order the peer opened them.
    pub fn server<T>(io: T, config: MuxConfig) -> Mux
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Mux::spawn(io, config, false)
    }

    fn spawn<T>(io: T, config: MuxConfig, is_client: bool) -> Mux
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let inner = Arc::new(Inner {
            config: config.clone(),
            is_client,
            outbound: outbound_tx,
            streams: StdMutex::new(HashMap::new()),
            next_open: AtomicU16::new(1),
            accept_rx: Mutex::new(accept_rx),
            shutdown: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
            last_read: StdMutex::new(Instant::now()),
        });
        tokio::spawn(read_loop(inner.clone(), read_half, accept_tx));
        tokio::spawn(write_loop(inner.clone(), write_half, outbound_rx));
        tokio::spawn(keepalive_loop(inner.clone()));
        Mux { inner }
    }

    /// Open the next sub-stream. Only the client side opens; ids are handed
    /// out sequentially starting at 1.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if !self.inner.is_client {
            return Err(MuxError::Protocol("only the dialing side opens sub-streams"));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(self.inner.close_error());
        }
        let id = self.inner.next_open.fetch_add(1, Ordering::AcqRel);
        let stream = self.inner.register(id);
        self.inner
            .outbound
            .send(Frame::open(id))
            .await
            .map_err(|_| self.inner.close_error())?;
        Ok(stream)
    }

    /// Accept the next sub-stream opened by the peer.
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        let mut accept_rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            stream = accept_rx.recv() => stream.ok_or_else(|| self.inner.close_error()),
            _ = self.inner.shutdown.cancelled() => Err(self.inner.close_error()),
        }
    }

    /// Tear the whole connection down: all sub-streams EOF, parked writers
    /// fail with [`MuxError::Closed`]. Idempotent.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            let _ = self.inner.outbound.try_send(Frame::goaway());
        }
        self.inner.shutdown_now();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled when the mux goes down, whatever the cause.
    pub fn closed(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: R, accept_tx: mpsc::Sender<MuxStream>)
where
    R: AsyncRead + Unpin,
{
    let result = read_frames(&inner, &mut reader, &accept_tx).await;
    if let Err(err) = result {
        tracing::debug!(target: "warp_mux", error = %err, "transport read loop ended");
    }
    inner.shutdown_now();
}

async fn read_frames<R>(
    inner: &Arc<Inner>,
    reader: &mut R,
    accept_tx: &mpsc::Sender<MuxStream>,
) -> Result<(), MuxError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut expected_open: u16 = 1;
    loop {
        tokio::select! {
            read = reader.read_exact(&mut header) => { read?; }
            _ = inner.shutdown.cancelled() => return Ok(()),
        }
        *inner.last_read.lock().unwrap() = Instant::now();
        let frame = decode_header(&header)?;
        let payload = if frame.len > 0 {
            let mut buf = vec![0u8; frame.len as usize];
            reader.read_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        match frame.kind {
            FrameKind::Open => {
                if inner.is_client {
                    return Err(MuxError::Protocol("accepting side received open"));
                }
                if frame.stream != expected_open {
                    return Err(MuxError::Protocol("sub-stream opened out of order"));
                }
                if frame.stream > inner.config.max_streams {
                    return Err(MuxError::Protocol("too many sub-streams"));
                }
                expected_open += 1;
                let stream = inner.register(frame.stream);
                if accept_tx.send(stream).await.is_err() {
                    return Ok(());
                }
            }
            FrameKind::Data => {
                let (sender, recv) = {
                    let streams = inner.streams.lock().unwrap();
                    let entry = streams
                        .get(&frame.stream)
                        .ok_or(MuxError::Protocol("data for unknown sub-stream"))?;
                    (entry.inbound.clone(), entry.recv.clone())
                };
                let len = frame.len;
                let mut in_window = false;
                let _ = recv.remaining.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |current| {
                        if current >= len {
                            in_window = true;
                            Some(current - len)
                        } else {
                            None
                        }
                    },
                );
                if !in_window {
                    return Err(MuxError::FlowControl(frame.stream));
                }
                let delivered = match sender {
                    Some(tx) => tx.send(payload).is_ok(),
                    None => false,
                };
                if !delivered {
                    // Reader is gone; hand the credit straight back so the
                    // peer is not starved by bytes nobody will consume.
                    recv.remaining.fetch_add(len, Ordering::AcqRel);
                    let _ = inner.outbound.try_send(Frame::window(frame.stream, len));
                }
            }
            FrameKind::Window => {
                if payload.len() != 4 {
                    return Err(MuxError::Protocol("malformed window grant"));
                }
                let credit = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let shared = {
                    let streams = inner.streams.lock().unwrap();
                    streams.get(&frame.stream).map(|entry| entry.shared.clone())
                };
                match shared {
                    Some(shared) => shared.grant(credit),
                    None => return Err(MuxError::Protocol("window grant for unknown sub-stream")),
                }
            }
            FrameKind::Ping => {
                let _ = inner.outbound.try_send(Frame::pong());
            }
            FrameKind::Pong => {}
            FrameKind::Close => {
                let mut streams = inner.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(&frame.stream) {
                    entry.inbound = None;
                }
            }
            FrameKind::GoAway => return Ok(()),
        }
    }
}

async fn write_loop<W>(inner: Arc<Inner>, mut writer: W, mut outbound_rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let idle_timeout = inner.config.idle_timeout;
    loop {
        let frame = tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = inner.shutdown.cancelled() => {
                // Best-effort drain so a final goaway or error makes it out.
                while let Ok(frame) = outbound_rx.try_recv() {
                    if write_frame(&mut writer, &frame, idle_timeout).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        let last = frame.kind == FrameKind::GoAway;
        if let Err(err) = write_frame(&mut writer, &frame, idle_timeout).await {
            tracing::debug!(target: "warp_mux", error = %err, "transport write loop ended");
            if matches!(err, MuxError::Timeout) {
                inner.timed_out.store(true, Ordering::Release);
            }
            break;
        }
        if last {
            break;
        }
    }
    inner.shutdown_now();
}

async fn write_frame<W>(writer: &mut W, frame: &Frame, limit: Duration) -> Result<(), MuxError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode();
    let write = async {
        writer.write_all(&encoded).await?;
        writer.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(MuxError::Timeout),
    }
}

async fn keepalive_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.shutdown.cancelled() => return,
        }
        let idle = inner.last_read.lock().unwrap().elapsed();
        if idle > inner.config.idle_timeout {
            tracing::debug!(target: "warp_mux", idle_ms = idle.as_millis() as u64, "keepalive deadline exceeded");
            inner.timed_out.store(true, Ordering::Release);
            inner.shutdown_now();
            return;
        }
        let _ = inner.outbound.try_send(Frame::ping());
    }
}
