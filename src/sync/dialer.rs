//! Outbound peer connections.
//!
//! Only the server with the lower id dials, so two servers never race to open a connection to
//! each other. A dropped connection is dialed again with exponential backoff; the backoff is
//! reset once a handshake succeeds.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::service::{ClusterConfig, PeerAddress, Shutdown};
use crate::sync::{ContentSyncService, ServerId};

/// Reconnect delays, doubling up to a maximum, with up to 20% random jitter added.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.failures += 1;
        self.current = std::cmp::min(self.current * 2, self.max);
        let jitter_ms = base.as_millis() as u64 / 5;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

pub fn should_dial(own: ServerId, peer: ServerId) -> bool {
    own < peer
}

/// Start one dial loop per configured peer this server is responsible for connecting to.
pub fn spawn_dialers(
    service: Arc<ContentSyncService>,
    cluster: &ClusterConfig,
    notify_shutdown: &broadcast::Sender<()>,
    shutdown_complete_tx: &mpsc::Sender<()>,
) -> Vec<JoinHandle<()>> {
    cluster
        .peers
        .iter()
        .filter(|peer| should_dial(service.server_id(), peer.server_id))
        .map(|peer| {
            let backoff = Backoff::new(
                Duration::from_millis(cluster.reconnect_initial_backoff_ms),
                Duration::from_millis(cluster.reconnect_max_backoff_ms),
            );
            tokio::spawn(dial_loop(
                service.clone(),
                peer.clone(),
                backoff,
                Shutdown::new(notify_shutdown.subscribe()),
                shutdown_complete_tx.clone(),
            ))
        })
        .collect()
}

async fn dial_loop(
    service: Arc<ContentSyncService>,
    target: PeerAddress,
    mut backoff: Backoff,
    mut shutdown: Shutdown,
    _shutdown_complete: mpsc::Sender<()>,
) {
    debug!("dialing peer {} at {}", target.server_id, target.address);
    while !shutdown.is_shutdown() {
        let connected = tokio::select! {
            _ = shutdown.recv() => break,
            connected = TcpStream::connect(&target.address) => connected,
        };
        match connected {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                let session = tokio::select! {
                    _ = shutdown.recv() => break,
                    session = service.establish(reader, writer, &target.address, Some(target.server_id)) => session,
                };
                match session {
                    Ok(session) => {
                        backoff.reset();
                        match service.serve(session, &mut shutdown).await {
                            Ok(()) => info!("connection to peer {} closed", target.server_id),
                            Err(e) => warn!("connection to peer {} lost: {}", target.server_id, e),
                        }
                    }
                    Err(e) => warn!(
                        "handshake with peer {} at {} failed: {}",
                        target.server_id, target.address, e
                    ),
                }
            }
            Err(e) => debug!(
                "connecting to peer {} at {} failed: {}",
                target.server_id, target.address, e
            ),
        }
        if shutdown.is_shutdown() {
            break;
        }

        let delay = backoff.next_delay();
        debug!(
            "reconnecting to peer {} in {:?}, attempt {}",
            target.server_id,
            delay,
            backoff.failures()
        );
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = time::sleep(delay) => {}
        }
    }
    debug!("dialer of peer {} stopped", target.server_id);
}
