//! Orchestration loops: the one-shot Sender and the long-lived Receiver
//! daemon, both ported from `Ssm2`'s usage in
//! `examples/original_source/ssm/agents.py` (`run_sender` / `run_receiver`).

pub mod receiver;
pub mod sender;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::store::StoreError;
use crate::transport::TransportError;
use crate::trust::TrustError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("trust list error: {0}")]
    Trust(#[from] TrustError),
    #[error("lost connection")]
    LostConnection,
    #[error("cert and key don't match")]
    CertKeyMismatch,
}
