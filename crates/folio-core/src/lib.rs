//! # Folio Core
//!
//! Shared vocabulary for the folio collaborative notebook engine.
//!
//! Every other crate speaks in these types:
//!
//! - [`SessionKey`]: identifies one in-memory replicated document
//!   (a canonical document, or a published app bound to a viewer)
//! - [`Role`]: the access level of an authenticated user on a document
//! - [`BlockKind`]: the closed set of notebook block types
//! - [`ItemStatus`] / [`ItemMetadata`]: execution queue item state and
//!   the operation it requests
//!
//! Block kinds and item metadata are closed sum types. Matching on them is
//! exhaustive everywhere, so adding a variant is a compile-visible change.

pub mod block;
pub mod error;
pub mod execution;
pub mod ids;
pub mod role;

pub use block::BlockKind;
pub use error::{CoreError, CoreResult};
pub use execution::{CompletedOutcome, ItemMetadata, ItemStatus, MetadataTag};
pub use ids::{AppId, DocumentId, SessionKey, UserId, WorkspaceId};
pub use role::Role;
