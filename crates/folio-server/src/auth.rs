//! Identity and access for incoming requests
//!
//! Authentication happens upstream; the proxy forwards the user id in
//! [`USER_HEADER`].

use async_trait::async_trait;
use axum::http::HeaderMap;
use folio_core::{DocumentId, Role, UserId};
use folio_session::{RoleResolver, SessionResult};

pub const USER_HEADER: &str = "x-folio-user";

/// User id forwarded by the proxy, if any
pub fn user_from_headers(headers: &HeaderMap) -> Option<UserId> {
    let value = headers.get(USER_HEADER)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| UserId::new(value))
}

/// The same role for every user on every document
#[derive(Debug, Clone, Copy)]
pub struct UniformRoles {
    role: Role,
}

impl UniformRoles {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

#[async_trait]
impl RoleResolver for UniformRoles {
    async fn role(&self, _user: &UserId, _document: &DocumentId) -> SessionResult<Option<Role>> {
        Ok(Some(self.role))
    }
}
