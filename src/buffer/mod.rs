//! Pooled buffers used for all socket I/O.
//!
//! - `BufferPool`: arena of fixed-size byte arrays with a free index stack
//! - `Writer`: encodes values into a chain of pooled buffers
//! - `BufferChain`: the shared, immutable result of a `Writer`, readable through `bytes::Buf`

pub use chain::{BufferChain, ChainReader};
pub use pool::{BufferHandle, BufferPool, PoolStats, PooledBuffer};
pub use writer::Writer;

mod chain;
mod pool;
mod writer;
