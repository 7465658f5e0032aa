extern crate config as _;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{OpCode, Schema};
use crate::sync::ServerId;

use super::{AppError, AppResult};

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    pub server_id: ServerId,
    pub cluster_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub ip: String,
    /// port local socket clients connect to
    pub client_port: u16,
    /// port peer servers connect to
    pub peer_port: u16,
    pub max_connection: usize,
    pub max_package_size: usize,
    /// queued messages per connection before it is closed as a slow consumer
    pub send_queue_capacity: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct BufferPoolConfig {
    pub buffer_size: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct RoomsConfig {
    pub room_type_count: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct PeerAddress {
    pub server_id: ServerId,
    pub address: String,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    pub shared_secret: String,
    pub handshake_timeout_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    #[serde(default)]
    pub peers: Vec<PeerAddress>,
}

impl ClusterConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// A content type hosted by this server.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ContentTypeConfig {
    pub id: i32,
    pub name: String,
    pub opcode: u32,
    /// field descriptors, `<type>:<name>`
    pub fields: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub buffer_pool: BufferPoolConfig,
    pub rooms: RoomsConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub content_types: Vec<ContentTypeConfig>,
}

impl NodeConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NodeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let node_config: NodeConfig = config.try_deserialize()?;
        node_config.validate()?;
        Ok(node_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let non_zero = [
            ("network.max_connection", self.network.max_connection),
            ("network.max_package_size", self.network.max_package_size),
            ("network.send_queue_capacity", self.network.send_queue_capacity),
            ("buffer_pool.buffer_size", self.buffer_pool.buffer_size),
            ("rooms.room_type_count", self.rooms.room_type_count),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(AppError::InvalidValue(format!("{} must not be 0", name)));
            }
        }
        if self.rooms.room_type_count > u8::MAX as usize + 1 {
            return Err(AppError::InvalidValue(format!(
                "rooms.room_type_count {} exceeds 256",
                self.rooms.room_type_count
            )));
        }
        if self.cluster.handshake_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "cluster.handshake_timeout_ms must not be 0".into(),
            ));
        }
        if self.cluster.reconnect_initial_backoff_ms > self.cluster.reconnect_max_backoff_ms {
            return Err(AppError::InvalidValue(
                "cluster.reconnect_initial_backoff_ms is larger than the maximum".into(),
            ));
        }

        let mut peer_ids = HashSet::new();
        for peer in &self.cluster.peers {
            if peer.server_id == self.general.server_id {
                return Err(AppError::InvalidValue(format!(
                    "cluster peer {} is this server",
                    peer.address
                )));
            }
            if !peer_ids.insert(peer.server_id) {
                return Err(AppError::InvalidValue(format!(
                    "cluster peer {} is listed twice",
                    peer.server_id
                )));
            }
        }

        let mut ids = HashSet::new();
        let mut opcodes = HashSet::new();
        for content_type in &self.content_types {
            content_type.opcode()?;
            content_type.schema()?;
            if !ids.insert(content_type.id) {
                return Err(AppError::InvalidValue(format!(
                    "content type id {} is used twice",
                    content_type.id
                )));
            }
            if !opcodes.insert(content_type.opcode) {
                return Err(AppError::InvalidValue(format!(
                    "opcode {} is used by two content types",
                    content_type.opcode
                )));
            }
        }
        Ok(())
    }
}

impl ContentTypeConfig {
    pub fn opcode(&self) -> AppResult<OpCode> {
        let opcode = OpCode::from_u32(self.opcode)?;
        if !opcode.is_content() {
            return Err(AppError::InvalidValue(format!(
                "content type {} uses opcode {}, content opcodes start at {}",
                self.name,
                self.opcode,
                OpCode::CONTENT_BASE
            )));
        }
        Ok(opcode)
    }

    pub fn schema(&self) -> AppResult<Schema> {
        Schema::from_field_info(&self.fields)
    }
}
