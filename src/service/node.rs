use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::{runtime, signal};
use tracing::{error, info, trace};

use crate::buffer::BufferPool;
use crate::room::NetworkRoomRegistry;
use crate::service::server::{ListenerKind, Server};
use crate::service::{NodeConfig, Shutdown};
use crate::sync::{dialer, ContentApplier, ContentChange, ContentSyncService, PeerRegistry, SharedSecretSigner};
use crate::AppError::IllegalStateError;
use crate::AppResult;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

///
/// One replicating server: the shared buffer pool, rooms and peers, the client and peer
/// listeners, the dialers and the content publisher.
///
/// Entity changes enter through [`Node::change_sender`].
pub struct Node {
    config: Arc<NodeConfig>,
    service: Arc<ContentSyncService>,
    changes_tx: mpsc::Sender<ContentChange>,
    changes_rx: Option<mpsc::Receiver<ContentChange>>,
}

impl Node {
    pub fn new(config: NodeConfig, applier: Arc<dyn ContentApplier>) -> AppResult<Node> {
        config.validate()?;
        let pool = BufferPool::new(config.buffer_pool.buffer_size);
        let peers = Arc::new(PeerRegistry::new());
        let rooms = Arc::new(NetworkRoomRegistry::new(
            config.rooms.room_type_count,
            peers.clone(),
        ));
        let signer = Arc::new(SharedSecretSigner::new(&config.cluster.shared_secret)?);
        let service = Arc::new(ContentSyncService::new(
            &config, pool, rooms, peers, signer, applier,
        )?);
        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Node {
            config: Arc::new(config),
            service,
            changes_tx,
            changes_rx: Some(changes_rx),
        })
    }

    pub fn config(&self) -> &Arc<NodeConfig> {
        &self.config
    }

    pub fn service(&self) -> &Arc<ContentSyncService> {
        &self.service
    }

    /// The entity change source publishes local mutations here.
    pub fn change_sender(&self) -> mpsc::Sender<ContentChange> {
        self.changes_tx.clone()
    }

    /// Run on a fresh multi-thread runtime until ctrl-c.
    pub fn start(mut self) -> AppResult<()> {
        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
        rt.block_on(async move {
            let (client_listener, peer_listener) = self.bind().await?;
            self.run(client_listener, peer_listener, async {
                if let Err(e) = signal::ctrl_c().await {
                    error!("listening for ctrl-c failed: {}", e);
                }
                info!("get shutdown signal");
            })
            .await
        })
    }

    pub async fn bind(&self) -> AppResult<(TcpListener, TcpListener)> {
        let network = &self.config.network;
        let client_listener = bind(&format!("{}:{}", network.ip, network.client_port)).await?;
        let peer_listener = bind(&format!("{}:{}", network.ip, network.peer_port)).await?;
        Ok((client_listener, peer_listener))
    }

    /// Serve on already bound listeners until `shutdown_signal` completes or a listener
    /// fails, then stop every task and wait for them.
    pub async fn run(
        &mut self,
        client_listener: TcpListener,
        peer_listener: TcpListener,
        shutdown_signal: impl Future<Output = ()>,
    ) -> AppResult<()> {
        let changes_rx = self
            .changes_rx
            .take()
            .ok_or_else(|| IllegalStateError("node is already running".into()))?;
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let limit_connections = Arc::new(Semaphore::new(self.config.network.max_connection));
        let client_server = Server::new(
            ListenerKind::Client,
            client_listener,
            limit_connections.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            self.service.clone(),
        );
        let peer_server = Server::new(
            ListenerKind::Peer,
            peer_listener,
            limit_connections,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            self.service.clone(),
        );

        let publisher = {
            let service = self.service.clone();
            let shutdown = Shutdown::from_sender(&notify_shutdown);
            let shutdown_complete = shutdown_complete_tx.clone();
            tokio::spawn(async move {
                service.run_publisher(changes_rx, shutdown).await;
                drop(shutdown_complete);
            })
        };
        let dialers = dialer::spawn_dialers(
            self.service.clone(),
            &self.config.cluster,
            &notify_shutdown,
            &shutdown_complete_tx,
        );
        info!(
            "server {} of cluster {} started, dialing {} peers",
            self.config.general.server_id,
            self.config.general.cluster_name,
            dialers.len()
        );

        tokio::select! {
            res = client_server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept clients");
                }
            }
            res = peer_server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept peers");
                }
            }
            _ = shutdown_signal => {}
        }

        drop(client_server);
        drop(peer_server);
        let _ = notify_shutdown.send(());
        drop(notify_shutdown);
        drop(shutdown_complete_tx);
        trace!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        let _ = publisher.await;
        info!("server {} shutdown complete", self.config.general.server_id);
        Ok(())
    }
}

async fn bind(address: &str) -> AppResult<TcpListener> {
    match TcpListener::bind(address).await {
        Ok(listener) => {
            info!("tcp server binding to {} for listening", address);
            Ok(listener)
        }
        Err(err) => {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                address, err
            );
            error!(error_msg);
            Err(IllegalStateError(error_msg))
        }
    }
}
