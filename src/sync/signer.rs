use std::fmt::Debug;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::sync::ServerId;
use crate::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies handshake payloads.
pub trait Signer: Debug + Send + Sync {
    fn sign(&self, payload: &[u8]) -> String;

    fn verify(&self, payload: &[u8], signature: &str) -> bool;
}

/// The bytes a server signs in its handshake: its id, big-endian, followed by the cluster name.
pub fn handshake_payload(server_id: ServerId, cluster_name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + cluster_name.len());
    payload.extend_from_slice(&server_id.to_be_bytes());
    payload.extend_from_slice(cluster_name.as_bytes());
    payload
}

///
/// HMAC-SHA256 over a secret shared by every server of the cluster, hex encoded.
#[derive(Clone)]
pub struct SharedSecretSigner {
    mac: HmacSha256,
}

impl Debug for SharedSecretSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretSigner").finish_non_exhaustive()
    }
}

impl SharedSecretSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> AppResult<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| AppError::InvalidValue(format!("shared secret: {}", e)))?;
        Ok(SharedSecretSigner { mac })
    }

    fn keyed(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac
    }
}

impl Signer for SharedSecretSigner {
    fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.keyed(payload).finalize().into_bytes())
    }

    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(given) = hex::decode(signature) else {
            return false;
        };
        // constant time, and a truncated tag is rejected
        self.keyed(payload).verify_slice(&given).is_ok()
    }
}
