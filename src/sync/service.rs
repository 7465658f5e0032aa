// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferChain, BufferPool};
use crate::network::{next_connection_id, Connection, SendQueue, SocketClient};
use crate::protocol::{
    ContentUpdate, ControlMessage, Frame, Handshake, HandshakeResponse, OpCode, ProtocolCodec,
    Record, RegistrationComplete, RoomJoin, RoomLeave, Schema, TypeRegistration,
};
use crate::room::{DeliveryReport, JoinOutcome, LeaveOutcome, NetworkRoomRegistry, RoomKey};
use crate::service::{NodeConfig, Shutdown};
use crate::sync::{
    handshake_payload, ContentApplier, PeerHandle, PeerRegistry, PeerState, RegisteredType,
    RemoteContent, ServerId, Signer,
};
use crate::{AppError, AppResult};

/// A change made on this server, to be replicated.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentChange {
    pub content_type_id: i32,
    pub update: ContentUpdate<Record>,
}

/// A content type hosted by this server.
#[derive(Debug, Clone)]
pub struct LocalContentType {
    pub id: i32,
    pub name: String,
    pub opcode: OpCode,
    pub schema: Arc<Schema>,
}

/// An authenticated peer connection that has not started exchanging registrations yet.
#[derive(Debug)]
pub struct PeerSession<R> {
    peer: Arc<PeerHandle>,
    connection: Connection<R>,
    writer_task: JoinHandle<AppResult<()>>,
}

impl<R> PeerSession<R> {
    pub fn peer(&self) -> &Arc<PeerHandle> {
        &self.peer
    }
}

///
/// Keeps the content of this server and its peers in sync.
///
/// Local changes are encoded once into the content room of their type and the room forwards
/// the chain to local subscribers and to every peer that registered the type. Changes coming
/// from peers are handed to the [`ContentApplier`] and then shown to local subscribers of the
/// same room, so subscribers cannot tell local and remote changes apart.
pub struct ContentSyncService {
    server_id: ServerId,
    cluster_name: String,
    handshake_timeout: Duration,
    max_package_size: usize,
    send_queue_capacity: usize,
    pool: BufferPool,
    rooms: Arc<NetworkRoomRegistry>,
    peers: Arc<PeerRegistry>,
    signer: Arc<dyn Signer>,
    applier: Arc<dyn ContentApplier>,
    local_types: HashMap<i32, LocalContentType>,
}

impl std::fmt::Debug for ContentSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentSyncService")
            .field("server_id", &self.server_id)
            .field("cluster_name", &self.cluster_name)
            .field("peers", &self.peers.len())
            .field("rooms", &self.rooms.room_count())
            .field("local_types", &self.local_types.len())
            .finish_non_exhaustive()
    }
}

impl ContentSyncService {
    pub fn new(
        config: &NodeConfig,
        pool: BufferPool,
        rooms: Arc<NetworkRoomRegistry>,
        peers: Arc<PeerRegistry>,
        signer: Arc<dyn Signer>,
        applier: Arc<dyn ContentApplier>,
    ) -> AppResult<Self> {
        let mut local_types = HashMap::with_capacity(config.content_types.len());
        for content_type in &config.content_types {
            local_types.insert(
                content_type.id,
                LocalContentType {
                    id: content_type.id,
                    name: content_type.name.clone(),
                    opcode: content_type.opcode()?,
                    schema: Arc::new(content_type.schema()?),
                },
            );
        }
        Ok(ContentSyncService {
            server_id: config.general.server_id,
            cluster_name: config.general.cluster_name.clone(),
            handshake_timeout: config.cluster.handshake_timeout(),
            max_package_size: config.network.max_package_size,
            send_queue_capacity: config.network.send_queue_capacity,
            pool,
            rooms,
            peers,
            signer,
            applier,
            local_types,
        })
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn rooms(&self) -> &Arc<NetworkRoomRegistry> {
        &self.rooms
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn max_package_size(&self) -> usize {
        self.max_package_size
    }

    pub fn send_queue_capacity(&self) -> usize {
        self.send_queue_capacity
    }

    pub fn local_type(&self, content_type_id: i32) -> Option<&LocalContentType> {
        self.local_types.get(&content_type_id)
    }

    /// Encode a local change once and deliver it through the content room of its type.
    pub fn publish_change(&self, change: &ContentChange) -> AppResult<DeliveryReport> {
        let content_type = self.local_types.get(&change.content_type_id).ok_or_else(|| {
            AppError::InvalidValue(format!(
                "content type {} is not hosted here",
                change.content_type_id
            ))
        })?;
        let key = RoomKey::content(change.content_type_id);
        let Some(room) = self.rooms.get(&key) else {
            trace!("nobody listens to {}, change dropped", key);
            return Ok(DeliveryReport::default());
        };
        let mut builder = room.start_send(&self.pool, content_type.opcode, self.server_id);
        change
            .update
            .encode(&content_type.schema, builder.writer())?;
        let chain = builder.finish()?;
        room.send(&chain, None)
    }

    /// Publish changes from the entity change source until it closes or shutdown.
    pub async fn run_publisher(
        self: Arc<Self>,
        mut changes: mpsc::Receiver<ContentChange>,
        mut shutdown: Shutdown,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                change = changes.recv() => {
                    let Some(change) = change else {
                        break;
                    };
                    if let Err(e) = self.publish_change(&change) {
                        error!(
                            "publishing {:?} of content type {} failed: {}",
                            change.update.action, change.content_type_id, e
                        );
                    }
                }
            }
        }
        debug!("content publisher stopped");
    }

    /// Join a room, telling the peers when this server starts hosting it.
    pub fn join_room(&self, key: RoomKey, client: &SocketClient) -> AppResult<JoinOutcome> {
        let outcome = self.rooms.join(key, client)?;
        if outcome.first_local && !key.is_content() {
            self.announce(&RoomJoin(key))?;
        }
        Ok(outcome)
    }

    pub fn leave_room(&self, key: RoomKey, client: &SocketClient) -> AppResult<LeaveOutcome> {
        let outcome = self.rooms.leave(key, client)?;
        if outcome.last_local && !key.is_content() {
            self.announce(&RoomLeave(key))?;
        }
        Ok(outcome)
    }

    /// Close a local client and remove it from every room it joined.
    pub fn teardown_client(&self, client: &SocketClient) {
        let Some(rooms) = client.close() else {
            return;
        };
        for key in self.rooms.remove_connection(client.id(), rooms) {
            if key.is_content() {
                continue;
            }
            if let Err(e) = self.announce(&RoomLeave(key)) {
                warn!("announcing that {} was left failed: {}", key, e);
            }
        }
    }

    fn announce<M: ProtocolCodec>(&self, message: &M) -> AppResult<usize> {
        let chain = message.to_frame(&self.pool)?;
        Ok(self.peers.broadcast(&chain))
    }

    /// Subscriptions and room traffic from a local socket client.
    pub fn handle_client_frame(&self, client: &SocketClient, frame: Frame) -> AppResult<()> {
        match frame {
            Frame::Control { opcode, mut body } => {
                match ControlMessage::decode(opcode, &mut body)? {
                    ControlMessage::Subscribe(subscribe) => {
                        self.join_room(subscribe.0, client)?;
                    }
                    ControlMessage::Unsubscribe(unsubscribe) => {
                        self.leave_room(unsubscribe.0, client)?;
                    }
                    _ => {
                        return Err(AppError::ProtocolViolation(format!(
                            "{} is not accepted from socket clients",
                            opcode
                        )))
                    }
                }
            }
            Frame::Room { header, raw, .. } => {
                if header.key.is_content() {
                    return Err(AppError::ProtocolViolation(format!(
                        "client {} wrote to {}, content rooms are written by servers only",
                        client.id(),
                        header.key
                    )));
                }
                let Some(room) = self.rooms.get(&header.key) else {
                    debug!("{} does not exist, message dropped", header.key);
                    return Ok(());
                };
                let chain = BufferChain::copy_from_slice(&self.pool, &raw);
                room.send(&chain, Some(client.id()))?;
            }
        }
        Ok(())
    }

    /// Handshake with a freshly connected peer, bounded by the handshake timeout.
    ///
    /// `expected` is the server id an outbound connection dialed. On success the peer is
    /// registered and ready for [`ContentSyncService::serve`].
    pub async fn establish<R, W>(
        &self,
        reader: R,
        writer: W,
        peer_addr: &str,
        expected: Option<ServerId>,
    ) -> AppResult<PeerSession<R>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (client, writer_task) = SendQueue::spawn(
            writer,
            next_connection_id(),
            peer_addr,
            self.send_queue_capacity,
        );
        let mut connection = Connection::new(reader, self.max_package_size);

        let handshake = time::timeout(
            self.handshake_timeout,
            self.handshake(&mut connection, &client, expected),
        )
        .await;
        let server_id = match handshake {
            Ok(Ok(server_id)) => server_id,
            Ok(Err(e)) => {
                warn!("handshake with {} failed: {}", peer_addr, e);
                client.close();
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "handshake with {} did not finish within {:?}",
                    peer_addr, self.handshake_timeout
                );
                client.close();
                return Err(AppError::HandshakeTimeout(peer_addr.to_string()));
            }
        };

        let peer = Arc::new(PeerHandle::new(server_id, client.clone()));
        if let Err(e) = self.peers.insert(peer.clone()) {
            warn!("rejecting connection from {}: {}", peer_addr, e);
            client.close();
            return Err(e);
        }
        info!(
            "peer {} at {} authenticated on connection {}",
            server_id,
            peer_addr,
            client.id()
        );
        Ok(PeerSession {
            peer,
            connection,
            writer_task,
        })
    }

    async fn handshake<R: AsyncRead + Unpin>(
        &self,
        connection: &mut Connection<R>,
        client: &SocketClient,
        expected: Option<ServerId>,
    ) -> AppResult<ServerId> {
        let payload = handshake_payload(self.server_id, &self.cluster_name);
        let handshake = Handshake {
            server_id: self.server_id,
            signature: self.signer.sign(&payload),
        };
        client.send(&handshake.to_frame(&self.pool)?)?;

        let mut peer_id = None;
        let mut accepted_as = None;
        while peer_id.is_none() || accepted_as.is_none() {
            let frame = connection
                .read_frame()
                .await?
                .ok_or(AppError::ConnectionClosed(client.id()))?;
            let Frame::Control { opcode, mut body } = frame else {
                return Err(AppError::ProtocolViolation(
                    "room frame received before authentication".into(),
                ));
            };
            match ControlMessage::decode(opcode, &mut body)? {
                ControlMessage::Handshake(handshake) if peer_id.is_none() => {
                    let server_id = self.verify_handshake(&handshake, expected)?;
                    let response = HandshakeResponse {
                        server_id: self.server_id as u32,
                    };
                    client.send(&response.to_frame(&self.pool)?)?;
                    peer_id = Some(server_id);
                }
                ControlMessage::HandshakeResponse(response) if accepted_as.is_none() => {
                    accepted_as = Some(response.server_id);
                }
                _ => {
                    return Err(AppError::ProtocolViolation(format!(
                        "{} received during handshake",
                        opcode
                    )))
                }
            }
        }

        let (Some(peer_id), Some(accepted_as)) = (peer_id, accepted_as) else {
            return Err(AppError::IllegalStateError("handshake incomplete".into()));
        };
        if accepted_as != peer_id as u32 {
            return Err(AppError::ProtocolViolation(format!(
                "server {} answered as server {}",
                peer_id, accepted_as
            )));
        }
        Ok(peer_id)
    }

    fn verify_handshake(
        &self,
        handshake: &Handshake,
        expected: Option<ServerId>,
    ) -> AppResult<ServerId> {
        let server_id = handshake.server_id;
        if server_id == self.server_id {
            return Err(AppError::ProtocolViolation(
                "connected to this server itself".into(),
            ));
        }
        let payload = handshake_payload(server_id, &self.cluster_name);
        if !self.signer.verify(&payload, &handshake.signature) {
            return Err(AppError::AuthenticationFailed(format!(
                "invalid signature from server {}",
                server_id
            )));
        }
        if let Some(expected) = expected {
            if expected != server_id {
                return Err(AppError::AuthenticationFailed(format!(
                    "dialed server {} but server {} answered",
                    expected, server_id
                )));
            }
        }
        Ok(server_id)
    }

    /// Register our content types with the peer, then process its frames until the
    /// connection ends or shutdown. The peer is dropped from every room afterwards.
    pub async fn serve<R: AsyncRead + Unpin>(
        &self,
        session: PeerSession<R>,
        shutdown: &mut Shutdown,
    ) -> AppResult<()> {
        let PeerSession {
            peer,
            mut connection,
            mut writer_task,
        } = session;

        let result = match self.send_registrations(&peer) {
            Ok(()) => {
                self.read_peer_frames(&peer, &mut connection, &mut writer_task, shutdown)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!("peer {} connection ended: {}", peer.server_id(), e);
        }
        self.drop_peer(&peer);
        result
    }

    /// Handshake and serve in one go, for inbound connections.
    pub async fn run_peer<R, W>(
        &self,
        reader: R,
        writer: W,
        peer_addr: &str,
        shutdown: &mut Shutdown,
    ) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            session = self.establish(reader, writer, peer_addr, None) => session?,
        };
        self.serve(session, shutdown).await
    }

    fn send_registrations(&self, peer: &PeerHandle) -> AppResult<()> {
        let client = peer.client();
        for content_type in self.local_types.values() {
            let registration = TypeRegistration {
                content_type_id: content_type.id,
                opcode_to_listen_for: content_type.opcode.as_u32(),
                field_info: content_type.schema.field_info(),
            };
            client.send(&registration.to_frame(&self.pool)?)?;
        }
        let complete = RegistrationComplete {
            type_count: self.local_types.len() as u32,
        };
        client.send(&complete.to_frame(&self.pool)?)?;

        // let the peer rediscover which rooms this server hosts
        for key in self.rooms.active_rooms() {
            if !key.is_content() {
                client.send(&RoomJoin(key).to_frame(&self.pool)?)?;
            }
        }
        Ok(())
    }

    async fn read_peer_frames<R: AsyncRead + Unpin>(
        &self,
        peer: &PeerHandle,
        connection: &mut Connection<R>,
        writer_task: &mut JoinHandle<AppResult<()>>,
        shutdown: &mut Shutdown,
    ) -> AppResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                written = &mut *writer_task => {
                    return match written {
                        Ok(Ok(())) => Err(AppError::ConnectionClosed(peer.client().id())),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(AppError::IllegalStateError(format!(
                            "writer task of peer {} failed: {}",
                            peer.server_id(),
                            e
                        ))),
                    };
                }
                frame = connection.read_frame() => {
                    let Some(frame) = frame? else {
                        debug!("peer {} closed the connection", peer.server_id());
                        return Ok(());
                    };
                    if let Err(e) = self.handle_peer_frame(peer, frame) {
                        if !e.is_frame_local() {
                            return Err(e);
                        }
                        warn!("peer {}: frame skipped, {}", peer.server_id(), e);
                    }
                }
            }
        }
    }

    /// Process one frame from an authenticated peer.
    pub fn handle_peer_frame(&self, peer: &PeerHandle, frame: Frame) -> AppResult<()> {
        match frame {
            Frame::Control { opcode, mut body } => {
                match ControlMessage::decode(opcode, &mut body)? {
                    ControlMessage::TypeRegistration(registration) => {
                        self.register_peer_type(peer, registration)
                    }
                    ControlMessage::RegistrationComplete(complete) => {
                        if complete.type_count as usize != peer.registered_type_count() {
                            warn!(
                                "peer {} announced {} content types but registered {}",
                                peer.server_id(),
                                complete.type_count,
                                peer.registered_type_count()
                            );
                        }
                        peer.set_state(PeerState::Synchronized);
                        info!(
                            "peer {} synchronized with {} content types",
                            peer.server_id(),
                            peer.registered_type_count()
                        );
                        Ok(())
                    }
                    ControlMessage::RoomJoin(join) => {
                        if join.0.is_content() {
                            return Err(AppError::ProtocolViolation(format!(
                                "peer {} joined {} without a type registration",
                                peer.server_id(),
                                join.0
                            )));
                        }
                        self.rooms.add_remote_peer(
                            join.0,
                            peer.server_id(),
                            peer.client().id(),
                        )?;
                        Ok(())
                    }
                    ControlMessage::RoomLeave(leave) => {
                        self.rooms.remove_remote_peer(
                            leave.0,
                            peer.server_id(),
                            peer.client().id(),
                        );
                        Ok(())
                    }
                    ControlMessage::RemoteTypeNotice(notice) => {
                        self.applier.on_type_notice(peer.server_id(), &notice);
                        Ok(())
                    }
                    _ => Err(AppError::ProtocolViolation(format!(
                        "{} from authenticated peer {}",
                        opcode,
                        peer.server_id()
                    ))),
                }
            }
            Frame::Room {
                header,
                mut body,
                raw,
            } => {
                if header.key.is_content() {
                    let registered = peer
                        .registered_type(header.opcode)
                        .ok_or(AppError::SchemaGap(header.opcode.0))?;
                    if RoomKey::content(registered.content_type_id) != header.key {
                        return Err(AppError::ProtocolViolation(format!(
                            "{} of peer {} sent to {}",
                            header.opcode,
                            peer.server_id(),
                            header.key
                        )));
                    }
                    let update = match ContentUpdate::<Record>::decode(&registered.schema, &mut body)
                    {
                        Ok(update) => update,
                        Err(e) => {
                            error!(
                                "dropping update {} from peer {}: {}",
                                header.opcode,
                                peer.server_id(),
                                e
                            );
                            return Ok(());
                        }
                    };
                    let content = RemoteContent {
                        origin: peer.server_id(),
                        content_type_id: registered.content_type_id,
                        update,
                    };
                    if let Err(e) = self.applier.apply_remote(content) {
                        error!(
                            "applying update {} from peer {} failed: {}",
                            header.opcode,
                            peer.server_id(),
                            e
                        );
                    }
                }
                if let Some(room) = self.rooms.get(&header.key) {
                    if room.local_count() > 0 {
                        let chain = BufferChain::copy_from_slice(&self.pool, &raw);
                        room.deliver_local(&chain, None);
                    }
                }
                Ok(())
            }
        }
    }

    fn register_peer_type(&self, peer: &PeerHandle, registration: TypeRegistration) -> AppResult<()> {
        let opcode = OpCode::from_u32(registration.opcode_to_listen_for)?;
        if !opcode.is_content() {
            return Err(AppError::ProtocolViolation(format!(
                "peer {} registered content type {} with control opcode {}",
                peer.server_id(),
                registration.content_type_id,
                opcode
            )));
        }
        let schema = Schema::from_field_info(&registration.field_info)?;
        let replaced = peer.register_type(RegisteredType {
            content_type_id: registration.content_type_id,
            opcode,
            schema: Arc::new(schema),
        });
        if let Some(previous) = replaced {
            if previous.content_type_id != registration.content_type_id {
                self.rooms.remove_remote_peer(
                    RoomKey::content(previous.content_type_id),
                    peer.server_id(),
                    peer.client().id(),
                );
            }
        }
        self.rooms.add_remote_peer(
            RoomKey::content(registration.content_type_id),
            peer.server_id(),
            peer.client().id(),
        )?;
        debug!(
            "peer {} registered content type {} as {}",
            peer.server_id(),
            registration.content_type_id,
            opcode
        );
        Ok(())
    }

    /// Forget a disconnected peer: out of the registry, out of every room it announced on this
    /// connection. A newer connection of the same server keeps its registry entry and rooms.
    pub fn drop_peer(&self, peer: &PeerHandle) {
        let connection_id = peer.client().id();
        if self.peers.remove(peer.server_id(), connection_id).is_none() {
            peer.set_state(PeerState::Disconnected);
            peer.client().close();
        }
        let rooms = self.rooms.forget_peer(peer.server_id(), connection_id);
        info!(
            "peer {} disconnected from connection {}, removed from {} rooms",
            peer.server_id(),
            connection_id,
            rooms
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::broadcast;

    use super::*;
    use crate::network::next_connection_id;
    use crate::protocol::{Action, WireValue};
    use crate::room::RoomTypeId;
    use crate::service::{
        BufferPoolConfig, ClusterConfig, ContentTypeConfig, GeneralConfig, NetworkConfig,
        RoomsConfig,
    };
    use crate::sync::{ChannelApplier, LoggingApplier, SharedSecretSigner};

    const ARTICLE: i32 = 10;

    fn config(server_id: ServerId) -> NodeConfig {
        NodeConfig {
            general: GeneralConfig {
                server_id,
                cluster_name: "test".into(),
            },
            network: NetworkConfig {
                ip: "127.0.0.1".into(),
                client_port: 0,
                peer_port: 0,
                max_connection: 16,
                max_package_size: 1 << 20,
                send_queue_capacity: 64,
            },
            buffer_pool: BufferPoolConfig { buffer_size: 64 },
            rooms: RoomsConfig { room_type_count: 4 },
            cluster: ClusterConfig {
                shared_secret: "secret".into(),
                handshake_timeout_ms: 200,
                reconnect_initial_backoff_ms: 10,
                reconnect_max_backoff_ms: 100,
                peers: vec![],
            },
            content_types: vec![ContentTypeConfig {
                id: ARTICLE,
                name: "article".into(),
                opcode: 40,
                fields: vec!["u32:id".into(), "cstr:title".into()],
            }],
        }
    }

    fn service(server_id: ServerId, applier: Arc<dyn ContentApplier>) -> Arc<ContentSyncService> {
        let config = config(server_id);
        let pool = BufferPool::new(config.buffer_pool.buffer_size);
        let peers = Arc::new(PeerRegistry::new());
        let rooms = Arc::new(NetworkRoomRegistry::new(
            config.rooms.room_type_count,
            peers.clone(),
        ));
        Arc::new(
            ContentSyncService::new(
                &config,
                pool,
                rooms,
                peers,
                Arc::new(SharedSecretSigner::new(&config.cluster.shared_secret).unwrap()),
                applier,
            )
            .unwrap(),
        )
    }

    fn socket() -> (SocketClient, Connection<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(4096);
        let (client, _handle) = SendQueue::spawn(local, next_connection_id(), "client", 16);
        (client, Connection::new(remote, 1 << 20))
    }

    type Halves = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

    fn wire() -> (Halves, Halves) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (split(a), split(b))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn article(title: &str) -> ContentChange {
        ContentChange {
            content_type_id: ARTICLE,
            update: ContentUpdate {
                action: Action::Created,
                locale_id: 7,
                user_id: 42,
                role_id: 3,
                content: Record::new()
                    .with("id", WireValue::UInt(1))
                    .with("title", title),
            },
        }
    }

    #[tokio::test]
    async fn test_invalid_signature_never_reaches_registration() {
        let server = service(1, Arc::new(LoggingApplier));
        let ((reader, writer), (mut fake_reader, mut fake_writer)) = wire();

        // the impostor signs with the wrong secret
        let forged = Handshake {
            server_id: 2,
            signature: SharedSecretSigner::new("wrong").unwrap().sign(&handshake_payload(2, "test")),
        };
        let pool = BufferPool::new(64);
        let bytes = forged.to_frame(&pool).unwrap().to_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut fake_writer, &bytes)
            .await
            .unwrap();

        let result = server.establish(reader, writer, "impostor", None).await;
        assert!(matches!(result, Err(AppError::AuthenticationFailed(_))));
        assert!(server.peers().is_empty());

        // whatever the server managed to write, it is not a type registration
        let mut connection = Connection::new(&mut fake_reader, 1 << 20);
        while let Ok(Some(frame)) = connection.read_frame().await {
            if let Frame::Control { opcode, .. } = frame {
                assert_ne!(opcode, OpCode::TYPE_REGISTRATION);
            }
        }
        drop(fake_writer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let server = service(1, Arc::new(LoggingApplier));
        let ((reader, writer), _silent) = wire();
        let result = server.establish(reader, writer, "silent", None).await;
        assert!(matches!(result, Err(AppError::HandshakeTimeout(_))));
        assert!(server.peers().is_empty());
    }

    #[tokio::test]
    async fn test_self_connection_is_rejected() {
        let first = service(1, Arc::new(LoggingApplier));
        let second = service(1, Arc::new(LoggingApplier));
        let ((ar, aw), (br, bw)) = wire();
        let (a, b) = tokio::join!(
            first.establish(ar, aw, "b", None),
            second.establish(br, bw, "a", None)
        );
        assert!(matches!(a, Err(AppError::ProtocolViolation(_))));
        assert!(b.is_err());
    }

    #[tokio::test]
    async fn test_updates_replicate_and_cleanup_on_disconnect() {
        let origin = service(1, Arc::new(LoggingApplier));
        let (applier, mut applied) = ChannelApplier::new();
        let replica = service(2, Arc::new(applier));

        // a local subscriber on each side, plus a chat room hosted by the replica
        let (origin_subscriber, mut origin_subscriber_connection) = socket();
        origin
            .join_room(RoomKey::content(ARTICLE), &origin_subscriber)
            .unwrap();
        let (replica_subscriber, mut replica_subscriber_connection) = socket();
        replica
            .join_room(RoomKey::content(ARTICLE), &replica_subscriber)
            .unwrap();
        let chat = RoomKey::new(RoomTypeId(1), 99);
        replica.join_room(chat, &replica_subscriber).unwrap();

        let ((ar, aw), (br, bw)) = wire();
        let (a, b) = tokio::join!(
            origin.establish(ar, aw, "replica", Some(2)),
            replica.establish(br, bw, "origin", None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let origin_peer = a.peer().clone();
        let replica_peer = b.peer().clone();

        let (notify, _) = broadcast::channel::<()>(1);
        let mut origin_shutdown = Shutdown::new(notify.subscribe());
        let mut replica_shutdown = Shutdown::new(notify.subscribe());
        let origin_task = {
            let origin = origin.clone();
            tokio::spawn(async move { origin.serve(a, &mut origin_shutdown).await })
        };
        let replica_task = {
            let replica = replica.clone();
            tokio::spawn(async move { replica.serve(b, &mut replica_shutdown).await })
        };

        wait_until(|| {
            origin_peer.state() == PeerState::Synchronized
                && replica_peer.state() == PeerState::Synchronized
                && origin.rooms().rooms_of_peer(2).contains(&chat)
        })
        .await;
        assert!(origin
            .rooms()
            .rooms_of_peer(2)
            .contains(&RoomKey::content(ARTICLE)));

        let report = origin.publish_change(&article("hello")).unwrap();
        assert_eq!(report.local, 1);
        assert_eq!(report.remote, 1);

        let received = applied.recv().await.unwrap();
        assert_eq!(received.origin, 1);
        assert_eq!(received.content_type_id, ARTICLE);
        assert_eq!(received.update, article("hello").update);

        for connection in [
            &mut origin_subscriber_connection,
            &mut replica_subscriber_connection,
        ] {
            match connection.read_frame().await.unwrap() {
                Some(Frame::Room { header, .. }) => {
                    assert_eq!(header.key, RoomKey::content(ARTICLE));
                    assert_eq!(header.origin, 1);
                    assert_eq!(header.opcode, OpCode(40));
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }

        // the replica goes away
        drop(notify);
        replica_task.await.unwrap().unwrap();
        origin_task.await.unwrap().ok();
        wait_until(|| origin.peers().is_empty()).await;
        assert!(origin.rooms().rooms_of_peer(2).is_empty());
        assert!(origin.rooms().get(&chat).is_none());

        let report = origin.publish_change(&article("after")).unwrap();
        assert_eq!(report.remote, 0);
        assert_eq!(report.local, 1);
    }

    #[tokio::test]
    async fn test_unregistered_opcode_is_a_schema_gap() {
        let server = service(1, Arc::new(LoggingApplier));
        let (client, _connection) = socket();
        let peer = PeerHandle::new(5, client);

        let room = crate::room::NetworkRoom::new(RoomKey::content(77), server.peers().clone());
        let mut builder = room.start_send(server.pool(), OpCode(50), 5);
        builder.writer().write_u8(1);
        let mut bytes = builder.finish().unwrap().to_bytes();
        let frame = Frame::parse(&mut bytes, 1 << 20).unwrap().unwrap();

        let error = server.handle_peer_frame(&peer, frame).unwrap_err();
        assert!(matches!(error, AppError::SchemaGap(50)));
        assert!(error.is_frame_local());
    }

    #[tokio::test]
    async fn test_peer_survives_frames_it_cannot_use() {
        let origin = service(1, Arc::new(LoggingApplier));
        let replica = service(2, Arc::new(LoggingApplier));
        let ((ar, aw), (br, bw)) = wire();
        let (a, b) = tokio::join!(
            origin.establish(ar, aw, "replica", Some(2)),
            replica.establish(br, bw, "origin", None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let origin_peer = a.peer().clone();
        let replica_peer = b.peer().clone();

        let (notify, _) = broadcast::channel::<()>(1);
        let mut origin_shutdown = Shutdown::new(notify.subscribe());
        let mut replica_shutdown = Shutdown::new(notify.subscribe());
        let origin_task = {
            let origin = origin.clone();
            tokio::spawn(async move { origin.serve(a, &mut origin_shutdown).await })
        };
        let replica_task = {
            let replica = replica.clone();
            tokio::spawn(async move { replica.serve(b, &mut replica_shutdown).await })
        };
        wait_until(|| origin_peer.state() == PeerState::Synchronized).await;

        // a room type the origin does not have, a control message it does not know, then a
        // room it does have
        let pool = replica.pool();
        let to_origin = replica_peer.client();
        let unconfigured = RoomKey::new(RoomTypeId(9), 1);
        to_origin
            .send(&RoomJoin(unconfigured).to_frame(pool).unwrap())
            .unwrap();
        let mut unknown = crate::protocol::FrameBuilder::control(pool, OpCode(10));
        unknown.writer().write_u32(7);
        to_origin.send(&unknown.finish().unwrap()).unwrap();
        let chat = RoomKey::new(RoomTypeId(1), 4);
        to_origin.send(&RoomJoin(chat).to_frame(pool).unwrap()).unwrap();

        wait_until(|| origin.rooms().rooms_of_peer(2).contains(&chat)).await;
        assert!(origin.peers().contains(2));
        assert!(!origin_task.is_finished());

        drop(notify);
        origin_task.await.unwrap().ok();
        replica_task.await.unwrap().ok();
    }

    fn control_frame<M: ProtocolCodec>(pool: &BufferPool, message: &M) -> Frame {
        let mut bytes = message.to_frame(pool).unwrap().to_bytes();
        Frame::parse(&mut bytes, 1 << 20).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_late_cleanup_of_old_connection_keeps_reconnected_peer() {
        let server = service(1, Arc::new(LoggingApplier));
        let registration = TypeRegistration {
            content_type_id: 20,
            opcode_to_listen_for: 45,
            field_info: vec!["u32:id".into()],
        };

        let (old_client, _old_connection) = socket();
        let old = Arc::new(PeerHandle::new(2, old_client.clone()));
        server.peers().insert(old.clone()).unwrap();
        server
            .handle_peer_frame(&old, control_frame(server.pool(), &registration))
            .unwrap();

        // server 2 reconnects and registers again before the old connection is cleaned up
        old_client.close();
        let (new_client, _new_connection) = socket();
        let new = Arc::new(PeerHandle::new(2, new_client));
        server.peers().insert(new.clone()).unwrap();
        server
            .handle_peer_frame(&new, control_frame(server.pool(), &registration))
            .unwrap();

        server.drop_peer(&old);
        assert!(Arc::ptr_eq(&server.peers().get(2).unwrap(), &new));
        assert_eq!(server.rooms().rooms_of_peer(2), vec![RoomKey::content(20)]);

        server.drop_peer(&new);
        assert!(server.peers().is_empty());
        assert!(server.rooms().rooms_of_peer(2).is_empty());
    }

    #[test]
    fn test_frames_from_newer_or_differently_configured_peers_are_frame_local() {
        let unknown = ControlMessage::decode(OpCode(10), &mut &[0u8; 4][..]).unwrap_err();
        assert!(matches!(unknown, AppError::UnknownOpcode(10)));
        assert!(unknown.is_frame_local());
        assert!(AppError::UnknownRoomType(9).is_frame_local());
        assert!(!AppError::ProtocolViolation("x".into()).is_frame_local());
    }

    #[tokio::test]
    async fn test_client_subscriptions() {
        let server = service(1, Arc::new(LoggingApplier));
        let (client, _connection) = socket();
        let key = RoomKey::new(RoomTypeId(2), 8);

        let mut bytes = crate::protocol::Subscribe(key)
            .to_frame(server.pool())
            .unwrap()
            .to_bytes();
        let frame = Frame::parse(&mut bytes, 1024).unwrap().unwrap();
        server.handle_client_frame(&client, frame).unwrap();
        assert_eq!(server.rooms().get(&key).unwrap().local_count(), 1);

        let mut bytes = RegistrationComplete { type_count: 0 }
            .to_frame(server.pool())
            .unwrap()
            .to_bytes();
        let frame = Frame::parse(&mut bytes, 1024).unwrap().unwrap();
        assert!(matches!(
            server.handle_client_frame(&client, frame),
            Err(AppError::ProtocolViolation(_))
        ));

        server.teardown_client(&client);
        assert!(server.rooms().get(&key).is_none());
        assert!(client.is_closed());
    }
}
