//! Participant identity
//!
//! Participants are named by opaque strings handed out by the signaling
//! layer. A call binds two of them together: the local participant and the
//! remote peer.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Opaque participant identifier assigned by the signaling layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse an identifier received from an untrusted source
    ///
    /// # Errors
    ///
    /// Returns error if the identifier is empty or only whitespace
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("peer identifier cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The (self, peer) pair a call negotiates between
///
/// Fixed when the call is constructed and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallIdentity {
    /// Local participant
    pub self_id: PeerId,
    /// Remote participant
    pub peer_id: PeerId,
}

impl CallIdentity {
    /// Pair a local participant with a remote one
    pub fn new(self_id: impl Into<PeerId>, peer_id: impl Into<PeerId>) -> Self {
        Self {
            self_id: self_id.into(),
            peer_id: peer_id.into(),
        }
    }

    /// Identifier of the presentation surface created for this peer's media
    pub fn surface_id(&self) -> String {
        format!("x{}", self.peer_id)
    }
}

impl Display for CallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.self_id, self.peer_id)
    }
}
