//! Socket plumbing shared by client and peer connections.
//!
//! - `Connection`: read side, turns the byte stream into frames
//! - `SendQueue`: write side, one task per socket writing queued buffer chains in order
//! - `SocketClient`: cloneable handle used by rooms and services to reach a socket

pub use connection::Connection;
pub use send_queue::{next_connection_id, ConnectionId, SendQueue, SocketClient};

mod connection;
mod send_queue;
