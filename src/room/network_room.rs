use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::buffer::{BufferChain, BufferPool};
use crate::network::{ConnectionId, SocketClient};
use crate::protocol::{FrameBuilder, OpCode, RoomHeader, ROOM_LEAD};
use crate::room::RoomKey;
use crate::sync::{PeerRegistry, ServerId};
use crate::{AppError, AppResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoomState {
    Empty,
    Active,
}

/// How far one message got.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub local: usize,
    pub remote: usize,
    pub failed: usize,
}

///
/// One room: its local subscribers and the peer servers hosting it.
///
/// Messages are encoded once through [`NetworkRoom::start_send`] and the resulting chain is
/// shared by every send queue it is handed to.
#[derive(Debug)]
pub struct NetworkRoom {
    key: RoomKey,
    local: RwLock<HashMap<ConnectionId, SocketClient>>,
    /// peer servers hosting the room, with the peer connection that announced it
    remote: RwLock<HashMap<ServerId, ConnectionId>>,
    peers: Arc<PeerRegistry>,
}

impl NetworkRoom {
    pub fn new(key: RoomKey, peers: Arc<PeerRegistry>) -> Self {
        NetworkRoom {
            key,
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            peers,
        }
    }

    pub fn key(&self) -> RoomKey {
        self.key
    }

    /// Start a room frame for this room. The caller appends the message fields to
    /// `builder.writer()` and passes the finished chain to [`NetworkRoom::send`].
    pub fn start_send(&self, pool: &BufferPool, opcode: OpCode, origin: ServerId) -> FrameBuilder {
        FrameBuilder::room(
            pool,
            &RoomHeader {
                key: self.key,
                origin,
                opcode,
            },
        )
    }

    /// Deliver to every local subscriber except `exclude` and forward to every peer hosting
    /// the room. Only chains built for room delivery are accepted.
    pub fn send(
        &self,
        chain: &BufferChain,
        exclude: Option<ConnectionId>,
    ) -> AppResult<DeliveryReport> {
        if chain.first_byte() != Some(ROOM_LEAD) {
            error!(
                "{}: incorrectly attempted to send a writer to a network room, first byte {:?}",
                self.key,
                chain.first_byte()
            );
            return Err(AppError::ProtocolViolation(
                "incorrectly attempted to send a writer to a network room".into(),
            ));
        }
        let mut report = self.deliver_local(chain, exclude);

        let servers = self.remote_servers();
        for server_id in servers {
            let Some(peer) = self.peers.get(server_id) else {
                debug!("{}: peer {} is not connected", self.key, server_id);
                continue;
            };
            match peer.client().send(chain) {
                Ok(()) => report.remote += 1,
                Err(e) => {
                    warn!(
                        "{}: forwarding to peer {} failed: {}",
                        self.key, server_id, e
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Fan out to local subscribers only. Frames received from a peer take this path, they are
    /// never forwarded to other peers.
    pub fn deliver_local(&self, chain: &BufferChain, exclude: Option<ConnectionId>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let local = self.local.read();
        for (id, client) in local.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match client.send(chain) {
                Ok(()) => report.local += 1,
                Err(e) => {
                    debug!("{}: dropping message for connection {}: {}", self.key, id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Returns false when the connection had already joined.
    pub fn join(&self, client: SocketClient) -> bool {
        let mut local = self.local.write();
        if local.contains_key(&client.id()) {
            return false;
        }
        local.insert(client.id(), client);
        true
    }

    pub fn leave(&self, connection_id: ConnectionId) -> Option<SocketClient> {
        self.local.write().remove(&connection_id)
    }

    /// Returns false when the server was already listed through the same connection.
    pub fn add_remote(&self, server_id: ServerId, connection_id: ConnectionId) -> bool {
        self.remote.write().insert(server_id, connection_id) != Some(connection_id)
    }

    /// Only removes the entry announced through `connection_id`, a newer connection of the
    /// same server keeps its own.
    pub fn remove_remote(&self, server_id: ServerId, connection_id: ConnectionId) -> bool {
        let mut remote = self.remote.write();
        if remote.get(&server_id) == Some(&connection_id) {
            remote.remove(&server_id);
            true
        } else {
            false
        }
    }

    pub fn has_remote(&self, server_id: ServerId) -> bool {
        self.remote.read().contains_key(&server_id)
    }

    pub fn remote_connection(&self, server_id: ServerId) -> Option<ConnectionId> {
        self.remote.read().get(&server_id).copied()
    }

    pub fn remote_servers(&self) -> Vec<ServerId> {
        self.remote.read().keys().copied().collect()
    }

    pub fn local_count(&self) -> usize {
        self.local.read().len()
    }

    pub fn state(&self) -> RoomState {
        if self.is_empty() {
            RoomState::Empty
        } else {
            RoomState::Active
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.read().is_empty() && self.remote.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::network::{next_connection_id, Connection, SendQueue};
    use crate::protocol::{Frame, CONTROL_LEAD};
    use crate::room::RoomTypeId;
    use crate::sync::PeerHandle;

    fn socket() -> (SocketClient, Connection<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(4096);
        let (client, _handle) = SendQueue::spawn(local, next_connection_id(), "test", 16);
        (client, Connection::new(remote, 4096))
    }

    fn room_frame(room: &NetworkRoom, pool: &BufferPool, payload: &[u8]) -> BufferChain {
        let mut builder = room.start_send(pool, OpCode(40), 1);
        builder.writer().write_bytes(payload);
        builder.finish().unwrap()
    }

    #[rstest]
    #[case::empty_chain(&[])]
    #[case::zero(&[0x00, 1, 2])]
    #[case::control_frame(&[CONTROL_LEAD, 0, 0, 0, 1, 2])]
    #[case::marker(&[0xFF])]
    #[tokio::test]
    async fn test_send_rejects_chains_not_built_for_rooms(#[case] bytes: &[u8]) {
        let pool = BufferPool::new(8);
        let room = NetworkRoom::new(
            RoomKey::new(RoomTypeId(1), 1),
            Arc::new(PeerRegistry::new()),
        );
        let (client, _connection) = socket();
        room.join(client.clone());

        let chain = if bytes.is_empty() {
            BufferChain::empty()
        } else {
            BufferChain::copy_from_slice(&pool, bytes)
        };
        assert!(matches!(
            room.send(&chain, None),
            Err(AppError::ProtocolViolation(_))
        ));
        assert_eq!(client.queued(), 0);
    }

    #[tokio::test]
    async fn test_send_reaches_local_and_remote_but_not_excluded() {
        let pool = BufferPool::new(8);
        let peers = Arc::new(PeerRegistry::new());
        let room = NetworkRoom::new(RoomKey::new(RoomTypeId(2), 77), peers.clone());
        assert_eq!(room.state(), RoomState::Empty);

        let (sender, _sender_connection) = socket();
        let (subscriber, mut subscriber_connection) = socket();
        let (peer_client, mut peer_connection) = socket();
        let peer_connection_id = peer_client.id();
        peers.insert(Arc::new(PeerHandle::new(9, peer_client))).unwrap();

        assert!(room.join(sender.clone()));
        assert!(!room.join(sender.clone()));
        assert!(room.join(subscriber.clone()));
        assert!(room.add_remote(9, peer_connection_id));
        assert!(!room.add_remote(9, peer_connection_id));
        // known to host the room but not connected
        assert!(room.add_remote(10, 1000));
        assert_eq!(room.state(), RoomState::Active);

        let chain = room_frame(&room, &pool, b"hello room");
        let report = room.send(&chain, Some(sender.id())).unwrap();
        assert_eq!(
            report,
            DeliveryReport {
                local: 1,
                remote: 1,
                failed: 0
            }
        );

        for connection in [&mut subscriber_connection, &mut peer_connection] {
            match connection.read_frame().await.unwrap() {
                Some(Frame::Room { header, body, .. }) => {
                    assert_eq!(header.key, room.key());
                    assert_eq!(header.origin, 1);
                    assert_eq!(body.as_ref(), b"hello room");
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(sender.queued(), 0);
    }

    #[tokio::test]
    async fn test_deliver_local_skips_peers() {
        let pool = BufferPool::new(8);
        let peers = Arc::new(PeerRegistry::new());
        let room = NetworkRoom::new(RoomKey::new(RoomTypeId(2), 1), peers.clone());
        let (peer_client, _peer_connection) = socket();
        peers
            .insert(Arc::new(PeerHandle::new(4, peer_client.clone())))
            .unwrap();
        room.add_remote(4, peer_client.id());
        let (subscriber, _connection) = socket();
        room.join(subscriber);

        let chain = room_frame(&room, &pool, b"from a peer");
        let report = room.deliver_local(&chain, None);
        assert_eq!(report.local, 1);
        assert_eq!(report.remote, 0);
        assert_eq!(peer_client.queued(), 0);
    }

    #[tokio::test]
    async fn test_leave_and_closed_subscribers() {
        let pool = BufferPool::new(8);
        let room = NetworkRoom::new(
            RoomKey::new(RoomTypeId(3), 3),
            Arc::new(PeerRegistry::new()),
        );
        let (first, _c1) = socket();
        let (second, _c2) = socket();
        room.join(first.clone());
        room.join(second.clone());
        second.close();

        let chain = room_frame(&room, &pool, b"x");
        let report = room.send(&chain, None).unwrap();
        assert_eq!(report.local, 1);
        assert_eq!(report.failed, 1);

        assert!(room.leave(first.id()).is_some());
        assert!(room.leave(first.id()).is_none());
        assert!(room.leave(second.id()).is_some());
        assert!(room.is_empty());
    }

    #[test]
    fn test_remote_entry_belongs_to_its_connection() {
        let room = NetworkRoom::new(RoomKey::content(3), Arc::new(PeerRegistry::new()));
        assert!(room.add_remote(6, 100));
        // the server reconnected and announced the room again
        assert!(room.add_remote(6, 200));
        assert!(!room.remove_remote(6, 100));
        assert_eq!(room.remote_connection(6), Some(200));
        assert!(room.remove_remote(6, 200));
        assert!(!room.has_remote(6));
        assert!(room.is_empty());
    }
}
