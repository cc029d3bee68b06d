//! Identifiers for documents, apps, users, and in-memory sessions

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifier of a notebook document
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

/// Identifier of a published app snapshot of a document
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(pub String);

/// Identifier of an authenticated user
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Identifier of the workspace a document belongs to
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            /// Create from anything string-like
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $ty {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(DocumentId);
string_id!(AppId);
string_id!(UserId);
string_id!(WorkspaceId);

impl UserId {
    /// Synthetic identity used when the acting user cannot be resolved
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }
}

/// Key of one in-memory session
///
/// A canonical document has exactly one session. A published app has one
/// session for the shared published snapshot and one per viewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKey {
    /// The canonical, editable document
    Document(DocumentId),
    /// A published app view, optionally bound to one viewer
    App {
        document_id: DocumentId,
        app_id: AppId,
        viewer: Option<UserId>,
    },
}

impl SessionKey {
    /// Key for a canonical document
    pub fn document(document_id: impl Into<DocumentId>) -> Self {
        Self::Document(document_id.into())
    }

    /// Key for a published app, per viewer or for the shared snapshot
    pub fn app(
        document_id: impl Into<DocumentId>,
        app_id: impl Into<AppId>,
        viewer: Option<UserId>,
    ) -> Self {
        Self::App {
            document_id: document_id.into(),
            app_id: app_id.into(),
            viewer,
        }
    }

    /// The document this session replicates
    pub fn document_id(&self) -> &DocumentId {
        match self {
            Self::Document(id) => id,
            Self::App { document_id, .. } => document_id,
        }
    }

    /// Whether this key names a published app view
    pub fn is_app(&self) -> bool {
        matches!(self, Self::App { .. })
    }

    /// Cross-process channel name for this session
    pub fn channel(&self) -> String {
        format!("yjs:{self}")
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document(id) => write!(f, "{id}"),
            Self::App {
                document_id,
                app_id,
                viewer: Some(viewer),
            } => write!(f, "{document_id}-{app_id}-{viewer}"),
            Self::App {
                document_id,
                app_id,
                viewer: None,
            } => write!(f, "{document_id}-{app_id}-published"),
        }
    }
}
