//! Wire frames for document sync
//!
//! Every frame is a postcard-encoded enum, so the leading varint is the
//! message type: `sync = 0`, `awareness = 1`, and between processes also
//! `ping = 2`, `pong = 3`. Sync payloads follow the same two-step shape:
//! step 1 advertises the sender's heads, step 2 answers with every change the
//! sender is missing, and updates carry incremental changes as they happen.

use serde::{Deserialize, Serialize};

use crate::document::{HeadHash, NotebookDocument};
use crate::error::{SyncError, SyncResult};

/// Document sync message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// The sender's current heads
    Step1 { heads: Vec<HeadHash> },
    /// Changes the recipient of a step 1 was missing
    Step2 { update: Vec<u8> },
    /// Incremental changes from a local transaction
    Update { update: Vec<u8> },
}

impl SyncMessage {
    pub fn step1(doc: &mut NotebookDocument) -> Self {
        SyncMessage::Step1 { heads: doc.heads() }
    }

    /// Answer a peer's step 1
    pub fn step2(doc: &mut NotebookDocument, peer_heads: &[HeadHash]) -> Self {
        SyncMessage::Step2 {
            update: doc.save_after(peer_heads),
        }
    }

    /// Bytes to merge, if this message carries any
    pub fn update(&self) -> Option<&[u8]> {
        match self {
            SyncMessage::Step1 { .. } => None,
            SyncMessage::Step2 { update } | SyncMessage::Update { update } => Some(update),
        }
    }
}

/// Frame exchanged with a client connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Sync(SyncMessage),
    /// Encoded awareness update, see [`crate::awareness`]
    Awareness(Vec<u8>),
}

/// Frame exchanged between server processes over pub/sub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFrame {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    Ping,
    Pong,
}

macro_rules! postcard_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn encode(&self) -> SyncResult<Vec<u8>> {
                Ok(postcard::to_allocvec(self)?)
            }

            pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
                postcard::from_bytes(bytes).map_err(|e| SyncError::MalformedFrame(e.to_string()))
            }
        }
    };
}

postcard_codec!(Frame);
postcard_codec!(PeerFrame);
