//! Peer transport abstraction
//!
//! A transport session performs the actual SDP/ICE negotiation and media
//! transport for one call. The negotiation core only consumes it: it asks
//! for descriptions, applies them, attaches local tracks and reacts to the
//! events the session produces.
//!
//! Events are delivered over a channel handed out when the session is opened
//! rather than through callbacks, so each call can drain them on a single
//! task in arrival order.

use crate::media::{InboundTrackEvent, LocalStream, LocalTrack};
use crate::types::{ConnectionState, IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Public STUN server used when nothing else is configured
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// One STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` / `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Unauthenticated server entry
    pub fn new(urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }
}

/// Transport configuration
///
/// Serializes to the same shape as a browser `RTCConfiguration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new([DEFAULT_STUN_URL])],
        }
    }
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Session has been closed
    #[error("Transport closed")]
    Closed,

    /// Description could not be created or applied
    #[error("Description error: {0}")]
    Description(String),

    /// Remote candidate was rejected
    #[error("Candidate error: {0}")]
    Candidate(String),

    /// Local track could not be attached
    #[error("Track error: {0}")]
    Track(String),

    /// Session could not be created
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Event produced by a transport session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Local ICE candidate gathered; `None` once gathering completed
    IceCandidate(Option<IceCandidate>),
    /// Remote track started
    Track(InboundTrackEvent),
    /// Connectivity changed
    ConnectionStateChanged(ConnectionState),
}

/// One peer transport session
///
/// Every asynchronous operation may fail; once [`PeerTransport::close`] has
/// been called, pending and later operations fail with
/// [`TransportError::Closed`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a local offer
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create a local answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Add a remote candidate; `None` signals end-of-candidates
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>)
        -> Result<(), TransportError>;

    /// Attach a local track for sending as part of `stream`
    async fn add_track(&self, track: &LocalTrack, stream: &LocalStream)
        -> Result<(), TransportError>;

    /// Close the session; closing again is a no-op
    async fn close(&self) -> Result<(), TransportError>;

    /// Current connectivity state
    fn connection_state(&self) -> ConnectionState;
}

/// An opened transport session and the receiving end of its events
pub struct TransportSession {
    /// The session
    pub transport: Arc<dyn PeerTransport>,
    /// Events in the order the session produced them
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a fresh session configured with `config`
    async fn open(&self, config: &TransportConfig) -> Result<TransportSession, TransportError>;
}
