//! Call signaling protocol
//!
//! Defines the messages exchanged with the remote peer before media flows
//! (offers, answers and trickled ICE candidates) and the channel they are
//! emitted on. Delivery, reconnection and framing belong to the channel
//! implementation; this module only shapes payloads and hands them over.

use crate::identity::PeerId;
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Topic carrying session offers
pub const TOPIC_OFFER: &str = "offer";

/// Topic carrying session answers
pub const TOPIC_ANSWER: &str = "answer";

/// Topic carrying trickled ICE candidates
pub const TOPIC_ICE_CANDIDATE: &str = "icecandidate";

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Channel refused or failed to deliver the message
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Channel has been shut down
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Payload could not be encoded or decoded
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Topic is not one this protocol understands
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Outbound side of the signaling bus
///
/// Implement this for the concrete transport (websocket, socket.io, etc.).
/// Payloads are JSON text; the channel must not alter them.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send `payload` under `topic`
    async fn emit(&self, topic: &str, payload: String) -> Result<(), SignalingError>;
}

/// Offer or answer addressed from one participant to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationMessage {
    /// Sender
    pub from: PeerId,
    /// Recipient
    pub to: PeerId,
    /// The offer or answer
    pub desc: SessionDescription,
}

/// Trickled ICE candidate addressed from one participant to another
///
/// A `None` candidate marks end-of-candidates and is still delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateMessage {
    /// Sender
    pub from: PeerId,
    /// Recipient
    pub to: PeerId,
    /// Gathered candidate, or `null` once gathering finished
    pub candidate: Option<IceCandidate>,
}

impl IceCandidateMessage {
    /// Whether this message marks end-of-candidates
    #[must_use]
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_none()
    }
}

/// Inbound signaling payload decoded by topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    /// Remote offer
    Offer(NegotiationMessage),
    /// Remote answer
    Answer(NegotiationMessage),
    /// Remote ICE candidate
    IceCandidate(IceCandidateMessage),
}

impl InboundSignal {
    /// Decode a `(topic, payload)` pair received from the channel
    ///
    /// # Errors
    ///
    /// Returns error if the topic is unknown or the payload is not valid JSON
    /// for it
    pub fn decode(topic: &str, payload: &str) -> Result<Self, SignalingError> {
        match topic {
            TOPIC_OFFER => Ok(Self::Offer(serde_json::from_str(payload)?)),
            TOPIC_ANSWER => Ok(Self::Answer(serde_json::from_str(payload)?)),
            TOPIC_ICE_CANDIDATE => Ok(Self::IceCandidate(serde_json::from_str(payload)?)),
            other => Err(SignalingError::UnknownTopic(other.to_string())),
        }
    }

    /// Sender of the payload
    #[must_use]
    pub fn from(&self) -> &PeerId {
        match self {
            Self::Offer(m) | Self::Answer(m) => &m.from,
            Self::IceCandidate(m) => &m.from,
        }
    }

    /// Recipient of the payload
    #[must_use]
    pub fn to(&self) -> &PeerId {
        match self {
            Self::Offer(m) | Self::Answer(m) => &m.to,
            Self::IceCandidate(m) => &m.to,
        }
    }
}

/// Signaling handler
///
/// Serializes protocol messages and emits them on the wrapped channel.
/// Cheap to clone; every call holds one.
#[derive(Clone)]
pub struct SignalingHandler {
    channel: Arc<dyn SignalingChannel>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    /// Emit an offer
    ///
    /// # Errors
    ///
    /// Returns error if encoding or delivery fails
    #[tracing::instrument(skip(self, message), fields(from = %message.from, to = %message.to))]
    pub async fn send_offer(&self, message: &NegotiationMessage) -> Result<(), SignalingError> {
        self.emit_json(TOPIC_OFFER, message).await
    }

    /// Emit an answer
    ///
    /// # Errors
    ///
    /// Returns error if encoding or delivery fails
    #[tracing::instrument(skip(self, message), fields(from = %message.from, to = %message.to))]
    pub async fn send_answer(&self, message: &NegotiationMessage) -> Result<(), SignalingError> {
        self.emit_json(TOPIC_ANSWER, message).await
    }

    /// Emit a trickled ICE candidate (or end-of-candidates)
    ///
    /// # Errors
    ///
    /// Returns error if encoding or delivery fails
    #[tracing::instrument(
        skip(self, message),
        fields(from = %message.from, to = %message.to, end = message.is_end_of_candidates())
    )]
    pub async fn send_candidate(
        &self,
        message: &IceCandidateMessage,
    ) -> Result<(), SignalingError> {
        self.emit_json(TOPIC_ICE_CANDIDATE, message).await
    }

    async fn emit_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<(), SignalingError> {
        let payload = serde_json::to_string(message)?;
        tracing::debug!(topic, bytes = payload.len(), "Emitting signaling message");
        self.channel.emit(topic, payload).await.map_err(|e| {
            tracing::warn!(topic, error = %e, "Signaling emit failed");
            e
        })
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }
}

/// In-process signaling channel backed by a tokio mpsc queue
///
/// Every emitted `(topic, payload)` pair shows up on the receiver returned
/// by [`ChannelSignaling::new`], in emission order.
pub struct ChannelSignaling {
    sender: mpsc::UnboundedSender<(String, String)>,
}

impl ChannelSignaling {
    /// Create the channel and the receiving end of its queue
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, String)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SignalingChannel for ChannelSignaling {
    async fn emit(&self, topic: &str, payload: String) -> Result<(), SignalingError> {
        self.sender
            .send((topic.to_string(), payload))
            .map_err(|_| SignalingError::ChannelClosed)
    }
}
