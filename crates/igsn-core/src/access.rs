//! Authorization seam. Identity comes from the caller; this crate only asks
//! whether a user holds a scope on an allocation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{IgsnError, Result};
use crate::types::RequestType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "igsn:create")]
    Create,
    #[serde(rename = "igsn:update")]
    Update,
    #[serde(rename = "igsn:transfer")]
    Transfer,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "igsn:create",
            Self::Update => "igsn:update",
            Self::Transfer => "igsn:transfer",
        }
    }

    /// Scope needed on the allocation to create a request of this type.
    pub fn required_for(request_type: RequestType) -> Self {
        match request_type {
            RequestType::Mint | RequestType::Reserve => Self::Create,
            RequestType::Update => Self::Update,
            RequestType::Transfer => Self::Transfer,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scopes granted on one resource (an allocation id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub resource_id: String,
    pub scopes: BTreeSet<Scope>,
}

/// The authenticated caller, as resolved by the outer layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_permission(
        mut self,
        resource_id: impl Into<String>,
        scopes: impl IntoIterator<Item = Scope>,
    ) -> Self {
        self.permissions.push(Permission {
            resource_id: resource_id.into(),
            scopes: scopes.into_iter().collect(),
        });
        self
    }
}

pub trait AccessPolicy: Send + Sync {
    fn has_permission(&self, user: &User, resource_id: &str, scope: Scope) -> bool;

    fn require(&self, user: &User, resource_id: &str, scope: Scope) -> Result<()> {
        if self.has_permission(user, resource_id, scope) {
            Ok(())
        } else {
            Err(IgsnError::Forbidden(format!(
                "user {} lacks {scope} on {resource_id}",
                user.id
            )))
        }
    }
}

/// Grants exactly what the user's permission list carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionListPolicy;

impl AccessPolicy for PermissionListPolicy {
    fn has_permission(&self, user: &User, resource_id: &str, scope: Scope) -> bool {
        user.permissions
            .iter()
            .any(|p| p.resource_id == resource_id && p.scopes.contains(&scope))
    }
}

/// Grants everything. For operator tooling running with full trust.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn has_permission(&self, _user: &User, _resource_id: &str, _scope: Scope) -> bool {
        true
    }
}
