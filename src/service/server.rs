use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{next_connection_id, Connection, SendQueue};
use crate::sync::ContentSyncService;
use crate::AppError;
use crate::AppResult;

use super::Shutdown;

/// What connects to a listener.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    /// local socket clients subscribing to rooms
    Client,
    /// sibling servers replicating content
    Peer,
}

#[derive(Debug)]
pub struct Server {
    kind: ListenerKind,
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    service: Arc<ContentSyncService>,
}

impl Server {
    pub fn new(
        kind: ListenerKind,
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        service: Arc<ContentSyncService>,
    ) -> Self {
        Server {
            kind,
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            service,
        }
    }

    /// Accept connections until accepting fails for good. Every connection holds a permit
    /// of the connection limit and a shutdown completion sender while it is handled.
    pub async fn run(&self) -> AppResult<()> {
        info!(
            "{:?} listener accepting on {:?}",
            self.kind,
            self.listener.local_addr()
        );
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(e.to_string()))?;
            let socket = self.accept().await?;
            let _ = socket.set_nodelay(true);
            let peer_addr = socket
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let (reader, writer) = socket.into_split();

            let service = self.service.clone();
            let mut shutdown = Shutdown::from_sender(&self.notify_shutdown);
            let shutdown_complete = self.shutdown_complete_tx.clone();
            let kind = self.kind;
            tokio::spawn(async move {
                let result = match kind {
                    ListenerKind::Client => {
                        serve_client(&service, reader, writer, &peer_addr, &mut shutdown).await
                    }
                    ListenerKind::Peer => {
                        service
                            .run_peer(reader, writer, &peer_addr, &mut shutdown)
                            .await
                    }
                };
                if let Err(e) = result {
                    error!("{:?} connection from {} ended: {}", kind, peer_addr, e);
                }
                drop(permit);
                drop(shutdown_complete);
            });
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Handle one local socket client: subscriptions and room traffic in, room deliveries out.
/// The client leaves every room when the connection ends, however it ends.
pub async fn serve_client<R, W>(
    service: &ContentSyncService,
    reader: R,
    writer: W,
    peer_addr: &str,
    shutdown: &mut Shutdown,
) -> AppResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let capacity = service.send_queue_capacity();
    let (client, mut writer_task) = SendQueue::spawn(writer, next_connection_id(), peer_addr, capacity);
    let mut connection = Connection::new(reader, service.max_package_size());
    debug!("client connection {} from {}", client.id(), peer_addr);

    let result = loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("client connection {} exits after shutdown signal", client.id());
                break Ok(());
            }
            written = &mut writer_task => {
                break match written {
                    Ok(result) => result,
                    Err(e) => Err(AppError::IllegalStateError(e.to_string())),
                };
            }
            frame = connection.read_frame() => {
                match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = service.handle_client_frame(&client, frame) {
                            if !e.is_frame_local() {
                                break Err(e);
                            }
                            warn!("client connection {}: frame skipped, {}", client.id(), e);
                        }
                    }
                    // client closed the connection gracefully
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        }
    };
    service.teardown_client(&client);
    result
}
