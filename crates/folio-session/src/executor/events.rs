//! Attribution of block runs for usage logging

use folio_core::{BlockKind, CompletedOutcome, DocumentId, ItemMetadata};
use folio_sync::{BatchSnapshot, ItemSnapshot};
use tracing::{info, warn};

use crate::auth::{UserDirectory, UserProfile};

/// Who a block run is attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvents {
    /// The batch was started by a schedule
    Schedule {
        document_id: DocumentId,
        schedule_id: String,
    },
    /// The item was enqueued by a user, or by someone unknown
    User {
        document_id: DocumentId,
        user: UserProfile,
    },
}

impl ExecutionEvents {
    /// Attribute `item` of `batch`, falling back to an unknown user
    pub async fn resolve(
        document_id: &DocumentId,
        batch: &BatchSnapshot,
        item: &ItemSnapshot,
        users: &dyn UserDirectory,
    ) -> Self {
        if let Some(schedule_id) = &batch.schedule_id {
            return ExecutionEvents::Schedule {
                document_id: document_id.clone(),
                schedule_id: schedule_id.clone(),
            };
        }

        let user = match &item.user_id {
            Some(id) => match users.find(id).await {
                Ok(Some(profile)) => profile,
                Ok(None) => UserProfile::unknown(),
                Err(e) => {
                    warn!(user_id = %id, error = %e, "Failed to resolve user, attributing run to unknown");
                    UserProfile::unknown()
                }
            },
            None => UserProfile::unknown(),
        };
        ExecutionEvents::User {
            document_id: document_id.clone(),
            user,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        match self {
            ExecutionEvents::Schedule { document_id, .. } | ExecutionEvents::User { document_id, .. } => {
                document_id
            }
        }
    }

    fn actor(&self) -> String {
        match self {
            ExecutionEvents::Schedule { schedule_id, .. } => format!("schedule:{schedule_id}"),
            ExecutionEvents::User { user, .. } => format!("user:{}", user.id),
        }
    }

    pub fn block_started(&self, kind: BlockKind, metadata: &ItemMetadata) {
        info!(
            target: "folio::usage",
            document_id = %self.document_id(),
            actor = %self.actor(),
            block_kind = %kind,
            operation = ?metadata.tag(),
            "Block run started"
        );
    }

    pub fn block_finished(&self, kind: BlockKind, outcome: Option<CompletedOutcome>) {
        info!(
            target: "folio::usage",
            document_id = %self.document_id(),
            actor = %self.actor(),
            block_kind = %kind,
            outcome = outcome.map(CompletedOutcome::as_str).unwrap_or("none"),
            "Block run finished"
        );
    }
}
