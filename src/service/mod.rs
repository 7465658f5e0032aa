pub use app_error::{AppError, AppResult};
pub use config::{
    BufferPoolConfig, ClusterConfig, ContentTypeConfig, GeneralConfig, NetworkConfig, NodeConfig,
    PeerAddress, RoomsConfig,
};
pub use node::Node;
pub use server::{serve_client, ListenerKind, Server};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod node;
mod server;
mod shutdown;
mod tracing_config;
