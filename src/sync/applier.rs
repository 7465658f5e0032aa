use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::{ContentUpdate, Record, RemoteTypeNotice};
use crate::sync::ServerId;
use crate::{AppError, AppResult};

/// A content update received from a peer, decoded with the peer's registered schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteContent {
    pub origin: ServerId,
    pub content_type_id: i32,
    pub update: ContentUpdate<Record>,
}

///
/// Applies changes made on other servers to the local caches.
///
/// Called from the reader task of the peer connection, in the order the peer sent them.
pub trait ContentApplier: Send + Sync + 'static {
    fn apply_remote(&self, content: RemoteContent) -> AppResult<()>;

    fn on_type_notice(&self, origin: ServerId, notice: &RemoteTypeNotice) {
        debug!(
            "ignoring type notice {} from server {}",
            notice.type_name, origin
        );
    }
}

#[derive(Debug, Default)]
pub struct LoggingApplier;

impl ContentApplier for LoggingApplier {
    fn apply_remote(&self, content: RemoteContent) -> AppResult<()> {
        info!(
            "server {} {:?} content type {} (locale {}, user {}, role {}), {} fields",
            content.origin,
            content.update.action,
            content.content_type_id,
            content.update.locale_id,
            content.update.user_id,
            content.update.role_id,
            content.update.content.len()
        );
        Ok(())
    }
}

/// Hands remote changes to whoever owns the receiving end of the channel.
#[derive(Debug, Clone)]
pub struct ChannelApplier {
    sender: mpsc::UnboundedSender<RemoteContent>,
}

impl ChannelApplier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteContent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelApplier { sender }, receiver)
    }
}

impl ContentApplier for ChannelApplier {
    fn apply_remote(&self, content: RemoteContent) -> AppResult<()> {
        self.sender
            .send(content)
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }
}
