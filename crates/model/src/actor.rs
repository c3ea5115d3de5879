//! Who is acting: an authenticated identity or an anonymous guest.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{GuestId, UserId};

/// An authenticated identity as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub email: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            email: None,
        }
    }
}

/// The party performing an action.
///
/// Permission checks and likes both accept an `Actor`, so anonymous
/// visitors are handled explicitly rather than through a loose string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Actor {
    Authenticated(UserId),
    Anonymous(GuestId),
}

impl Actor {
    /// Picks the authenticated identity when present, the guest otherwise.
    pub fn from_parts(identity: Option<&Identity>, guest: GuestId) -> Self {
        match identity {
            Some(identity) => Self::Authenticated(identity.user_id),
            None => Self::Anonymous(guest),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Authenticated(id) => Some(*id),
            Self::Anonymous(_) => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated(id) => write!(f, "user:{}", id),
            Self::Anonymous(id) => write!(f, "guest:{}", id),
        }
    }
}
