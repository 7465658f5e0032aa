use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::buffer::BufferChain;
use crate::network::{ConnectionId, SocketClient};
use crate::protocol::{OpCode, Schema};
use crate::sync::ServerId;
use crate::{AppError, AppResult};

/// Where an authenticated peer connection stands. Dialing and the handshake happen before a
/// [`PeerHandle`] exists, see `ContentSyncService::establish`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerState {
    TypeRegistration,
    Synchronized,
    Disconnected,
}

/// A content type as a peer registered it.
#[derive(Debug, Clone)]
pub struct RegisteredType {
    pub content_type_id: i32,
    pub opcode: OpCode,
    pub schema: Arc<Schema>,
}

///
/// An authenticated connection to another server.
///
/// Holds the dispatch table built from the peer's type registrations: content frames from the
/// peer are decoded with the schema registered for their opcode.
#[derive(Debug)]
pub struct PeerHandle {
    server_id: ServerId,
    client: SocketClient,
    state: Mutex<PeerState>,
    types: RwLock<HashMap<OpCode, RegisteredType>>,
}

impl PeerHandle {
    pub fn new(server_id: ServerId, client: SocketClient) -> Self {
        PeerHandle {
            server_id,
            client,
            state: Mutex::new(PeerState::TypeRegistration),
            types: RwLock::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn client(&self) -> &SocketClient {
        &self.client
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: PeerState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("peer {} {:?} -> {:?}", self.server_id, *current, state);
            *current = state;
        }
    }

    /// Returns the registration it replaces, if any.
    pub fn register_type(&self, registered: RegisteredType) -> Option<RegisteredType> {
        self.types.write().insert(registered.opcode, registered)
    }

    pub fn registered_type(&self, opcode: OpCode) -> Option<RegisteredType> {
        self.types.read().get(&opcode).cloned()
    }

    pub fn registered_type_count(&self) -> usize {
        self.types.read().len()
    }

    pub fn registered_types(&self) -> Vec<RegisteredType> {
        self.types.read().values().cloned().collect()
    }
}

/// Live peer connections by server id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<ServerId, Arc<PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry {
            peers: DashMap::new(),
        }
    }

    /// Fails when a live connection to the same server is already registered. A closed one is
    /// replaced.
    pub fn insert(&self, peer: Arc<PeerHandle>) -> AppResult<()> {
        match self.peers.entry(peer.server_id()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().client().is_closed() {
                    return Err(AppError::ProtocolViolation(format!(
                        "server {} is already connected through connection {}",
                        peer.server_id(),
                        existing.get().client().id()
                    )));
                }
                existing.insert(peer);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(peer);
            }
        }
        Ok(())
    }

    pub fn get(&self, server_id: ServerId) -> Option<Arc<PeerHandle>> {
        self.peers.get(&server_id).map(|peer| peer.value().clone())
    }

    pub fn contains(&self, server_id: ServerId) -> bool {
        self.peers.contains_key(&server_id)
    }

    /// Remove and close the peer, if `connection_id` is still the connection registered for it.
    pub fn remove(
        &self,
        server_id: ServerId,
        connection_id: ConnectionId,
    ) -> Option<Arc<PeerHandle>> {
        let (_, peer) = self
            .peers
            .remove_if(&server_id, |_, peer| peer.client().id() == connection_id)?;
        peer.set_state(PeerState::Disconnected);
        peer.client().close();
        Some(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.peers.iter().map(|peer| *peer.key()).collect()
    }

    /// Queue `chain` on every peer connection. Returns how many accepted it.
    pub fn broadcast(&self, chain: &BufferChain) -> usize {
        let peers: Vec<Arc<PeerHandle>> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers
            .iter()
            .filter(|peer| match peer.client().send(chain) {
                Ok(()) => true,
                Err(e) => {
                    warn!("sending to peer {} failed: {}", peer.server_id(), e);
                    false
                }
            })
            .count()
    }
}
