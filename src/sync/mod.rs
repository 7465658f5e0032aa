//! Cross-server content replication.
//!
//! Servers connect pairwise over the peer port. After a signed handshake each side registers
//! the content types it hosts, with their field schemas, and from then on streams
//! `ContentUpdate` messages through the content rooms. The lower server id dials the higher
//! one, see [`dialer`].

pub use applier::{ChannelApplier, ContentApplier, LoggingApplier, RemoteContent};
pub use peer_registry::{PeerHandle, PeerRegistry, PeerState, RegisteredType};
pub use service::{ContentChange, ContentSyncService, LocalContentType, PeerSession};
pub use signer::{handshake_payload, SharedSecretSigner, Signer};

mod applier;
pub mod dialer;
mod peer_registry;
mod service;
mod signer;

pub type ServerId = i32;
