use std::sync::Arc;
use std::time::Duration;

use replicast::buffer::BufferPool;
use replicast::network::Connection;
use replicast::protocol::{Action, ContentUpdate, Frame, OpCode, ProtocolCodec, Record, Subscribe};
use replicast::room::RoomKey;
use replicast::service::{
    BufferPoolConfig, ClusterConfig, ContentTypeConfig, GeneralConfig, NetworkConfig, PeerAddress,
    RoomsConfig,
};
use replicast::sync::{ChannelApplier, ContentChange, LoggingApplier, PeerState};
use replicast::{Node, NodeConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const ARTICLE: i32 = 10;

fn node_config(server_id: i32, peers: Vec<PeerAddress>) -> NodeConfig {
    NodeConfig {
        general: GeneralConfig {
            server_id,
            cluster_name: "integration".into(),
        },
        network: NetworkConfig {
            ip: "127.0.0.1".into(),
            client_port: 0,
            peer_port: 0,
            max_connection: 32,
            max_package_size: 1 << 20,
            send_queue_capacity: 64,
        },
        buffer_pool: BufferPoolConfig { buffer_size: 128 },
        rooms: RoomsConfig { room_type_count: 4 },
        cluster: ClusterConfig {
            shared_secret: "integration secret".into(),
            handshake_timeout_ms: 2000,
            reconnect_initial_backoff_ms: 20,
            reconnect_max_backoff_ms: 200,
            peers,
        },
        content_types: vec![ContentTypeConfig {
            id: ARTICLE,
            name: "article".into(),
            opcode: 40,
            fields: vec!["u32:id".into(), "cstr:title".into(), "date:published".into()],
        }],
    }
}

async fn listeners() -> (TcpListener, TcpListener) {
    (
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_change_reaches_peer_applier_and_remote_subscriber() {
    let (replica_clients, replica_peers) = listeners().await;
    let replica_client_addr = replica_clients.local_addr().unwrap();
    let replica_peer_addr = replica_peers.local_addr().unwrap();
    let (applier, mut applied) = ChannelApplier::new();
    let mut replica = Node::new(node_config(2, vec![]), Arc::new(applier)).unwrap();
    let replica_service = replica.service().clone();
    let (stop_replica, replica_stopped) = oneshot::channel::<()>();
    let replica_task = tokio::spawn(async move {
        replica
            .run(replica_clients, replica_peers, async {
                let _ = replica_stopped.await;
            })
            .await
    });

    let (origin_clients, origin_peers) = listeners().await;
    let peers = vec![PeerAddress {
        server_id: 2,
        address: replica_peer_addr.to_string(),
    }];
    let mut origin = Node::new(node_config(1, peers), Arc::new(LoggingApplier)).unwrap();
    let origin_service = origin.service().clone();
    let changes = origin.change_sender();
    let (stop_origin, origin_stopped) = oneshot::channel::<()>();
    let origin_task = tokio::spawn(async move {
        origin
            .run(origin_clients, origin_peers, async {
                let _ = origin_stopped.await;
            })
            .await
    });

    // a socket client of the replica subscribes to articles
    let pool = BufferPool::new(64);
    let socket = TcpStream::connect(replica_client_addr).await.unwrap();
    let (reader, mut writer) = socket.into_split();
    let subscribe = Subscribe(RoomKey::content(ARTICLE)).to_frame(&pool).unwrap();
    writer.write_all(&subscribe.to_bytes()).await.unwrap();
    let mut subscriber = Connection::new(reader, 1 << 20);

    eventually(|| {
        origin_service
            .peers()
            .get(2)
            .map_or(false, |peer| peer.state() == PeerState::Synchronized)
            && replica_service
                .rooms()
                .get(&RoomKey::content(ARTICLE))
                .map_or(false, |room| room.local_count() == 1)
    })
    .await;

    let published = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
    let update = ContentUpdate {
        action: Action::Updated,
        locale_id: 7,
        user_id: 42,
        role_id: 3,
        content: Record::new()
            .with("id", 99u64)
            .with("title", "replicated")
            .with("published", published),
    };
    changes
        .send(ContentChange {
            content_type_id: ARTICLE,
            update: update.clone(),
        })
        .await
        .unwrap();

    let remote = tokio::time::timeout(Duration::from_secs(5), applied.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.origin, 1);
    assert_eq!(remote.content_type_id, ARTICLE);
    assert_eq!(remote.update, update);

    let frame = tokio::time::timeout(Duration::from_secs(5), subscriber.read_frame())
        .await
        .unwrap()
        .unwrap();
    match frame {
        Some(Frame::Room { header, .. }) => {
            assert_eq!(header.key, RoomKey::content(ARTICLE));
            assert_eq!(header.opcode, OpCode(40));
            assert_eq!(header.origin, 1);
        }
        other => panic!("unexpected frame {:?}", other),
    }

    // stopping the replica removes it from the origin
    stop_replica.send(()).unwrap();
    replica_task.await.unwrap().unwrap();
    eventually(|| !origin_service.peers().contains(2)).await;
    assert!(origin_service.rooms().rooms_of_peer(2).is_empty());

    stop_origin.send(()).unwrap();
    origin_task.await.unwrap().unwrap();
}
