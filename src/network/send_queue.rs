use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::TrySendError;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::BufferChain;
use crate::room::RoomKey;
use crate::{AppError, AppResult};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
struct ClientInner {
    id: ConnectionId,
    peer_addr: String,
    sender: async_channel::Sender<BufferChain>,
    closed: Arc<AtomicBool>,
    /// wakes the writer task when the connection is closed, even in the middle of a write
    cancel: Arc<Notify>,
    /// rooms this connection joined, used to leave them all on teardown
    rooms: Mutex<HashSet<RoomKey>>,
}

///
/// Handle to the outbound side of one socket.
///
/// Cloning is cheap; every clone feeds the same bounded queue, which a single writer task
/// drains in FIFO order, so at most one message is being written to the socket at a time.
#[derive(Debug, Clone)]
pub struct SocketClient {
    inner: Arc<ClientInner>,
}

impl SocketClient {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.inner.sender.len()
    }

    /// Enqueue a chain for writing. A full queue means the consumer cannot keep up, the
    /// connection is closed rather than letting the backlog grow.
    pub fn send(&self, chain: &BufferChain) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(self.id()));
        }
        match self.inner.sender.try_send(chain.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    "connection {} from {} is not draining its send queue, closing it",
                    self.id(),
                    self.peer_addr()
                );
                self.close();
                Err(AppError::SlowConsumer(self.id()))
            }
            Err(TrySendError::Closed(_)) => Err(AppError::ConnectionClosed(self.id())),
        }
    }

    /// Mark the connection closed and abort the write in flight, if any. Queued chains are
    /// released without being written. Returns the rooms it had joined the first time it is
    /// called, `None` afterwards.
    pub fn close(&self) -> Option<HashSet<RoomKey>> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.inner.sender.close();
        self.inner.cancel.notify_one();
        debug!("connection {} closed", self.id());
        Some(std::mem::take(&mut *self.inner.rooms.lock()))
    }

    /// Returns true when the room was not tracked yet.
    pub fn track_join(&self, key: RoomKey) -> bool {
        self.inner.rooms.lock().insert(key)
    }

    pub fn track_leave(&self, key: &RoomKey) -> bool {
        self.inner.rooms.lock().remove(key)
    }

    pub fn rooms(&self) -> Vec<RoomKey> {
        self.inner.rooms.lock().iter().copied().collect()
    }
}

/// Writer task of one socket.
pub struct SendQueue<W> {
    connection_id: ConnectionId,
    writer: BufWriter<W>,
    receiver: async_channel::Receiver<BufferChain>,
    closed: Arc<AtomicBool>,
    cancel: Arc<Notify>,
}

impl<W> SendQueue<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn spawn(
        writer: W,
        connection_id: ConnectionId,
        peer_addr: impl Into<String>,
        capacity: usize,
    ) -> (SocketClient, JoinHandle<AppResult<()>>) {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(Notify::new());
        let client = SocketClient {
            inner: Arc::new(ClientInner {
                id: connection_id,
                peer_addr: peer_addr.into(),
                sender,
                closed: closed.clone(),
                cancel: cancel.clone(),
                rooms: Mutex::new(HashSet::new()),
            }),
        };
        let queue = SendQueue {
            connection_id,
            writer: BufWriter::new(writer),
            receiver,
            closed,
            cancel,
        };
        let handle = tokio::spawn(queue.run());
        (client, handle)
    }

    async fn run(mut self) -> AppResult<()> {
        let cancel = self.cancel.clone();
        let mut cancelled = false;
        let result = loop {
            let chain = tokio::select! {
                biased;
                _ = cancel.notified() => {
                    cancelled = true;
                    break Ok(());
                }
                chain = self.receiver.recv() => match chain {
                    Ok(chain) => chain,
                    // every handle dropped
                    Err(_) => break Ok(()),
                },
            };
            if self.closed.load(Ordering::Acquire) {
                cancelled = true;
                break Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.notified() => {
                    debug!(
                        "connection {} closed while writing {} bytes",
                        self.connection_id,
                        chain.len()
                    );
                    cancelled = true;
                    break Ok(());
                }
                written = self.write_chain(&chain) => {
                    if let Err(e) = written {
                        warn!(
                            "write to connection {} failed: {}, dropping its queue",
                            self.connection_id, e
                        );
                        break Err(e);
                    }
                }
            }
        };

        let SendQueue {
            connection_id,
            mut writer,
            receiver,
            closed,
            ..
        } = self;
        closed.store(true, Ordering::Release);
        receiver.close();
        let mut dropped = 0;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                "connection {} dropped {} queued messages on close",
                connection_id, dropped
            );
        }
        // a closed connection may not be draining, flushing could block forever; dropping the
        // writer closes it without writing what is still buffered
        if !cancelled {
            let _ = writer.shutdown().await;
        }
        drop(writer);
        result
    }

    async fn write_chain(&mut self, chain: &BufferChain) -> AppResult<()> {
        for segment in chain.segments() {
            self.writer.write_all(segment).await?;
        }
        self.writer.flush().await?;
        trace!(
            "wrote {} bytes to connection {}",
            chain.len(),
            self.connection_id
        );
        Ok(())
    }
}
