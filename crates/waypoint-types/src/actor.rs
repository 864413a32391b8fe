//! Actors and interaction requirements.
//!
//! Identity and permission resolution live outside the engine. Callers hand
//! the engine an already-resolved [`Actor`]; interaction gates stamp their
//! step records with an [`InteractionRequirement`] that actors are matched
//! against.

use serde::{Deserialize, Serialize};

/// A resolved principal acting on an interaction gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub is_superuser: bool,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }
}

/// Who may act on an interaction step.
///
/// Every field that is set must match. Superusers match any requirement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractionRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

impl InteractionRequirement {
    /// True when no principal, group, or permission is declared.
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.group.is_none() && self.permissions.is_empty()
    }

    /// Whether `actor` may act on a step carrying this requirement.
    pub fn admits(&self, actor: &Actor) -> bool {
        if actor.is_superuser {
            return true;
        }
        if self.user.as_ref().is_some_and(|user| user != &actor.id) {
            return false;
        }
        if self
            .group
            .as_ref()
            .is_some_and(|group| !actor.groups.iter().any(|g| g == group))
        {
            return false;
        }
        self.permissions
            .iter()
            .all(|p| actor.permissions.iter().any(|held| held == p))
    }
}
