//! Worlds
//!
//! A world is a signed, timestamped list of root nodes. The engine ships (or
//! is handed) one at construction and will only replace it with a world
//! carrying the same id, a timestamp no older than the current one, and a
//! valid signature from the current world's update key.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use ethermesh_crypto::{verify_signature, Identity, Signature};

use crate::error::{CoreError, CoreResult};

/// A root node: a globally known identity plus its stable endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub identity: Identity,
    pub endpoints: Vec<SocketAddr>,
}

/// A signed set of roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    pub id: u64,
    pub timestamp: u64,
    /// Ed25519 public key future updates must be signed with
    pub update_key: [u8; 32],
    pub roots: Vec<Root>,
    signature: Option<Signature>,
}

#[derive(Serialize)]
struct WorldBody<'a> {
    id: u64,
    timestamp: u64,
    update_key: &'a [u8; 32],
    roots: &'a [Root],
}

impl World {
    /// A world that trusts nothing; nodes with no roots never report ONLINE
    pub fn empty() -> Self {
        Self {
            id: 0,
            timestamp: 0,
            update_key: [0u8; 32],
            roots: Vec::new(),
            signature: None,
        }
    }

    /// Build and sign a world. The signer's key becomes the update key.
    pub fn sign(id: u64, timestamp: u64, roots: Vec<Root>, signer: &Identity) -> CoreResult<World> {
        let update_key = *signer.signing_public();
        let body = encode_body(id, timestamp, &update_key, &roots)?;
        let signature = signer.sign(&body)?;
        Ok(World {
            id,
            timestamp,
            update_key,
            roots,
            signature: Some(signature),
        })
    }

    /// Whether the self-signature under the update key is valid
    pub fn verify(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(body) = encode_body(self.id, self.timestamp, &self.update_key, &self.roots) else {
            return false;
        };
        verify_signature(&self.update_key, &body, signature).is_ok()
    }

    /// Whether this world may replace `current`: same id (or current is
    /// empty), monotonic timestamp, signed by the key current trusts.
    pub fn should_replace(&self, current: &World) -> bool {
        if !self.verify() {
            return false;
        }
        if current.roots.is_empty() && current.timestamp == 0 {
            return true;
        }
        if self.id != current.id || self.timestamp < current.timestamp {
            return false;
        }
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(body) = encode_body(self.id, self.timestamp, &self.update_key, &self.roots) else {
            return false;
        };
        verify_signature(&current.update_key, &body, signature).is_ok()
    }

    /// Serialize for storage or in-band distribution
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Internal(format!("world encode: {}", e)))
    }

    /// Parse a serialized world; signature is NOT checked here, callers go
    /// through `should_replace`.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<World> {
        bincode::deserialize(bytes)
            .map_err(|e| CoreError::BadParameter(format!("world decode: {}", e)))
    }
}

fn encode_body(
    id: u64,
    timestamp: u64,
    update_key: &[u8; 32],
    roots: &[Root],
) -> CoreResult<Vec<u8>> {
    bincode::serialize(&WorldBody {
        id,
        timestamp,
        update_key,
        roots,
    })
    .map_err(|e| CoreError::Internal(format!("world encode: {}", e)))
}
