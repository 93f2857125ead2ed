//! The on-disk entry shape, common to both store backends.

use serde::{Deserialize, Serialize};

/// `{body, signer?, empa_id?, error?}` per spec.md §3/§4.2. The outbound
/// store only ever populates `body`; the incoming store populates
/// `body`/`signer`/`empa_id`; the reject store additionally sets `error`.
///
/// Encoded with `bincode` on disk — the real `dirq` wire format is not
/// specified by spec.md and is not reproduced byte-for-byte; see
/// DESIGN.md.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreRecord {
    pub body: Vec<u8>,
    pub signer: Option<String>,
    pub empa_id: Option<String>,
    pub error: Option<String>,
}

impl StoreRecord {
    pub fn body_only(body: Vec<u8>) -> Self {
        StoreRecord {
            body,
            ..Default::default()
        }
    }

    pub fn incoming(body: Vec<u8>, signer: String, empa_id: Option<String>) -> Self {
        StoreRecord {
            body,
            signer: Some(signer),
            empa_id,
            error: None,
        }
    }

    pub fn reject(body: Vec<u8>, signer: Option<String>, empa_id: Option<String>, error: String) -> Self {
        StoreRecord {
            body,
            signer,
            empa_id,
            error: Some(error),
        }
    }
}
