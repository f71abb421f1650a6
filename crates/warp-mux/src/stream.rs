use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::frame::{Frame, MAX_FRAME_PAYLOAD};
use crate::MuxError;

/// State shared between a sub-stream's handle(s) and the mux tasks.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub id: u16,
    /// Bytes we may still send before the peer grants more credit.
    send_window: AtomicU32,
    window_notify: Notify,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
    write_closed: AtomicBool,
    /// Serializes whole `write_all` calls so records from concurrent writers
    /// never interleave mid-payload.
    write_lock: Mutex<()>,
}

impl StreamShared {
    pub fn new(id: u16, initial_window: u32, outbound: mpsc::Sender<Frame>, closed: CancellationToken) -> Self {
        Self {
            id,
            send_window: AtomicU32::new(initial_window),
            window_notify: Notify::new(),
            outbound,
            closed,
            write_closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Credit granted by the peer.
    pub fn grant(&self, credit: u32) {
        self.send_window.fetch_add(credit, Ordering::AcqRel);
        self.window_notify.notify_waiters();
    }

    /// Wake any writer parked on the window so it can observe closure.
    pub fn wake(&self) {
        self.window_notify.notify_waiters();
    }

    async fn reserve(&self, wanted: u32) -> Result<u32, MuxError> {
        loop {
            if self.closed.is_cancelled() {
                return Err(MuxError::Closed);
            }
            let available = self.send_window.load(Ordering::Acquire);
            if available > 0 {
                let take = available.min(wanted);
                if self
                    .send_window
                    .compare_exchange(available, available - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(take);
                }
                continue;
            }
            // Register with the notifier before re-checking the window, so a
            // grant landing in between cannot be missed.
            let mut notified = std::pin::pin!(self.window_notify.notified());
            notified.as_mut().enable();
            if self.send_window.load(Ordering::Acquire) > 0 {
                continue;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.closed.cancelled() => return Err(MuxError::Closed),
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), MuxError> {
        let _guard = self.write_lock.lock().await;
        while !data.is_empty() {
            let wanted = data.len().min(MAX_FRAME_PAYLOAD) as u32;
            let take = self.reserve(wanted).await? as usize;
            let (chunk, rest) = data.split_at(take);
            self.outbound
                .send(Frame::data(self.id, Bytes::copy_from_slice(chunk)))
                .await
                .map_err(|_| MuxError::Closed)?;
            data = rest;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), MuxError> {
        let _guard = self.write_lock.lock().await;
        if self.write_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.outbound
            .send(Frame::close(self.id))
            .await
            .map_err(|_| MuxError::Closed)
    }
}

/// Receive-side flow-control accounting for one sub-stream.
#[derive(Debug)]
pub(crate) struct RecvState {
    pub window: u32,
    /// How many more bytes the peer may send us.
    pub remaining: AtomicU32,
    /// Bytes consumed locally but not yet returned to the peer as credit.
    pub pending: AtomicU32,
}

impl RecvState {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            remaining: AtomicU32::new(window),
            pending: AtomicU32::new(0),
        }
    }
}

/// The owned read half of a sub-stream, plus a thread-safe write path.
///
/// Reading requires `&mut self` and must stay on a single task; writes go
/// through [`MuxStream::write_all`] or a cloned [`StreamWriter`] and are safe
/// from any number of tasks.
#[derive(Debug)]
pub struct MuxStream {
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) recv: Arc<RecvState>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Bytes>,
    read_buf: BytesMut,
}

impl MuxStream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        recv: Arc<RecvState>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            shared,
            recv,
            inbound,
            read_buf: BytesMut::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    /// Next chunk of payload bytes, in arrival order. `None` means the peer
    /// half-closed this sub-stream or the mux was torn down.
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        if !self.read_buf.is_empty() {
            return Some(self.read_buf.split().freeze());
        }
        let chunk = self.inbound.recv().await?;
        self.return_credit(chunk.len());
        Some(chunk)
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<(), MuxError> {
        self.shared.write_all(data).await
    }

    /// A cloneable handle for the write direction.
    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            shared: self.shared.clone(),
        }
    }

    /// Account consumed bytes and return credit to the peer once half the
    /// window has been freed. Grants ride the regular frame queue; if the
    /// queue is momentarily full the credit stays pending for the next call.
    fn return_credit(&self, consumed: usize) {
        let pending = self.recv.pending.fetch_add(consumed as u32, Ordering::AcqRel) + consumed as u32;
        if pending < self.recv.window / 2 {
            return;
        }
        if self
            .recv
            .pending
            .compare_exchange(pending, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self
            .shared
            .outbound
            .try_send(Frame::window(self.shared.id, pending))
            .is_ok()
        {
            self.recv.remaining.fetch_add(pending, Ordering::AcqRel);
        } else {
            // Queue full or closing: put the credit back for a later grant.
            self.recv.pending.fetch_add(pending, Ordering::AcqRel);
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.read_buf.is_empty() {
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.return_credit(chunk.len());
                    this.read_buf.extend_from_slice(&chunk);
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(this.read_buf.len());
        buf.put_slice(&this.read_buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}

/// Cloneable write handle to a sub-stream. All methods are safe to call
/// concurrently; after mux teardown they return [`MuxError::Closed`].
#[derive(Clone)]
pub struct StreamWriter {
    pub(crate) shared: Arc<StreamShared>,
}

impl StreamWriter {
    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<(), MuxError> {
        self.shared.write_all(data).await
    }

    /// Half-close the write direction. Idempotent.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.shared.close().await
    }
}
