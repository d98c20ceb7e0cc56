//! Heartbeat payload encryption.
//!
//! AES-256-GCM with a key derived from the cluster secret (sha256). The
//! cluster and node names travel both in clear, for early discrimination,
//! and inside the ciphertext, where they are authenticated.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::codec::b64;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid nonce length {0}")]
    InvalidNonce(usize),

    #[error("cluster name mismatch: {0}")]
    ClusterMismatch(String),

    #[error("node name mismatch: header {header}, sealed {sealed}")]
    NodeMismatch { header: String, sealed: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Outer {
    clustername: String,
    nodename: String,
    #[serde(with = "b64")]
    nonce: Vec<u8>,
    #[serde(with = "b64")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Inner {
    clustername: String,
    nodename: String,
    #[serde(with = "b64")]
    payload: Vec<u8>,
}

/// Seals and opens heartbeat payloads for one cluster
pub struct Envelope {
    cipher: Aes256Gcm,
    clustername: String,
    nodename: String,
}

impl Envelope {
    pub fn new(clustername: &str, nodename: &str, secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Self {
            cipher: Aes256Gcm::new(&key.into()),
            clustername: clustername.to_string(),
            nodename: nodename.to_string(),
        }
    }

    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let inner = serde_json::to_vec(&Inner {
            clustername: self.clustername.clone(),
            nodename: self.nodename.clone(),
            payload: payload.to_vec(),
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);
        let data = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), inner.as_slice())
            .map_err(|_| CryptoError::Encrypt)?;

        Ok(serde_json::to_vec(&Outer {
            clustername: self.clustername.clone(),
            nodename: self.nodename.clone(),
            nonce: nonce.to_vec(),
            data,
        })?)
    }

    /// Decrypt and verify a sealed message, returning `(nodename, payload)`
    pub fn open(&self, sealed: &[u8]) -> Result<(String, Vec<u8>), CryptoError> {
        let outer: Outer = serde_json::from_slice(sealed)?;
        if outer.clustername != self.clustername {
            return Err(CryptoError::ClusterMismatch(outer.clustername));
        }
        if outer.nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonce(outer.nonce.len()));
        }
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&outer.nonce), outer.data.as_slice())
            .map_err(|_| CryptoError::Decrypt)?;

        let inner: Inner = serde_json::from_slice(&plain)?;
        if inner.clustername != self.clustername {
            return Err(CryptoError::ClusterMismatch(inner.clustername));
        }
        if inner.nodename != outer.nodename {
            return Err(CryptoError::NodeMismatch {
                header: outer.nodename,
                sealed: inner.nodename,
            });
        }
        Ok((inner.nodename, inner.payload))
    }
}
