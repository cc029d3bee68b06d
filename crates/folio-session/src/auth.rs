//! Role and user lookups the session layer depends on

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use folio_core::{DocumentId, Role, UserId};
use serde::{Deserialize, Serialize};

use crate::error::SessionResult;

/// Resolves a user's role on a document
#[async_trait]
pub trait RoleResolver: Send + Sync + 'static {
    /// `None` when the user has no access
    async fn role(&self, user: &UserId, document: &DocumentId) -> SessionResult<Option<Role>>;
}

/// Display information of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
}

impl UserProfile {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Stand-in for a user that cannot be resolved
    pub fn unknown() -> Self {
        Self {
            id: UserId::unknown(),
            name: "Unknown".to_string(),
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn find(&self, user: &UserId) -> SessionResult<Option<UserProfile>>;
}

/// Role table held in memory
///
/// A user granted on no document in particular gets that role everywhere.
#[derive(Debug, Default)]
pub struct StaticRoles {
    grants: RwLock<HashMap<(UserId, Option<DocumentId>), Role>>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user: impl Into<UserId>, document: impl Into<DocumentId>, role: Role) {
        if let Ok(mut grants) = self.grants.write() {
            grants.insert((user.into(), Some(document.into())), role);
        }
    }

    pub fn grant_all(&self, user: impl Into<UserId>, role: Role) {
        if let Ok(mut grants) = self.grants.write() {
            grants.insert((user.into(), None), role);
        }
    }

    pub fn revoke(&self, user: impl Into<UserId>, document: impl Into<DocumentId>) {
        if let Ok(mut grants) = self.grants.write() {
            grants.remove(&(user.into(), Some(document.into())));
        }
    }
}

#[async_trait]
impl RoleResolver for StaticRoles {
    async fn role(&self, user: &UserId, document: &DocumentId) -> SessionResult<Option<Role>> {
        let Ok(grants) = self.grants.read() else {
            return Ok(None);
        };
        let specific = grants.get(&(user.clone(), Some(document.clone())));
        Ok(specific.or_else(|| grants.get(&(user.clone(), None))).copied())
    }
}

#[derive(Debug, Default)]
pub struct StaticUsers {
    users: RwLock<HashMap<UserId, UserProfile>>,
}

impl StaticUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: UserProfile) {
        if let Ok(mut users) = self.users.write() {
            users.insert(profile.id.clone(), profile);
        }
    }
}

#[async_trait]
impl UserDirectory for StaticUsers {
    async fn find(&self, user: &UserId) -> SessionResult<Option<UserProfile>> {
        Ok(self
            .users
            .read()
            .ok()
            .and_then(|users| users.get(user).cloned()))
    }
}
