pub mod buffer;
pub mod network;
pub mod protocol;
pub mod room;
pub mod service;
pub mod sync;

pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Node, NodeConfig, Shutdown,
};
