//! Callers of the controller: subscribed accounts and privileged actors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A subscribed user as seen by the command-dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable user identifier.
    pub user_id: String,
    /// Subscription tier name, a key of the tier policy table.
    pub tier: String,
}

impl Account {
    pub fn new(user_id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: tier.into(),
        }
    }
}

/// Privilege level of whoever initiates a control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    User,
    Operator,
    Admin,
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Privilege::User => write!(f, "user"),
            Privilege::Operator => write!(f, "operator"),
            Privilege::Admin => write!(f, "admin"),
        }
    }
}

/// Identity plus privilege of the initiator of a control action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub privilege: Privilege,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privilege: Privilege::User,
        }
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privilege: Privilege::Operator,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privilege: Privilege::Admin,
        }
    }

    /// Automated subsystems act with operator privilege.
    pub fn system() -> Self {
        Self::operator("system")
    }

    pub fn has(&self, required: Privilege) -> bool {
        self.privilege >= required
    }
}

/// Trading surface asking whether it may act for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    /// Fire requests driven by issued signals.
    Signal,
    /// Manual order entry.
    Manual,
}
