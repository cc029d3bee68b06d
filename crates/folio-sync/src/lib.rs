//! # Folio Sync
//!
//! The replicated notebook document and the frames used to keep replicas in
//! step.
//!
//! - [`NotebookDocument`]: an Automerge document holding the title, blocks,
//!   layout, dataframe registry and execution queue of one notebook
//! - [`Frame`] / [`PeerFrame`]: postcard-encoded messages exchanged with
//!   client connections and with other server processes
//! - [`Awareness`]: ephemeral presence state of connected clients
//!
//! All replicas of a notebook start from the same deterministic schema
//! change, so documents created independently by different processes merge
//! without conflicting root objects.

pub mod awareness;
pub mod document;
pub mod error;
mod json;
pub mod protocol;
pub mod queue;

pub use awareness::{Awareness, AwarenessChanges, ClientId};
pub use document::{Block, BlockGroup, HeadHash, NotebookDocument};
pub use error::{SyncError, SyncResult};
pub use protocol::{Frame, PeerFrame, SyncMessage};
pub use queue::{BatchStatus, BatchSnapshot, Execution, ItemRef, ItemSnapshot, RunAllSource};
