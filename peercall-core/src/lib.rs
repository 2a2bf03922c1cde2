//! Peercall - offer/answer and ICE negotiation for point-to-point calls
//!
//! This library drives the setup of a direct media session between two
//! participants. It features:
//!
//! - **Directional calls**: [`IncomingCall`] answers a remote offer,
//!   [`OutgoingCall`] creates one and applies the answer
//! - **Trickle ICE**: local candidates are relayed as they are gathered,
//!   end-of-candidates included
//! - **Stream deduplication**: each remote stream is presented once, however
//!   many track events announce it
//! - **Automatic teardown**: presented streams disappear when their call
//!   leaves the connected state
//! - **Pluggable transport**: `webrtc-rs` by default, an in-memory double in
//!   [`testing`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (channel, _outbound) = ChannelSignaling::new();
//! let service = CallService::new(
//!     "alice",
//!     Arc::new(WebRtcTransportFactory::new()?),
//!     SignalingHandler::new(Arc::new(channel)),
//!     Arc::new(SurfaceBoard::new()),
//!     CallServiceConfig::default(),
//! );
//!
//! let local = LocalStream::new("camera")
//!     .with_track(LocalTrack::audio("mic"))
//!     .with_track(LocalTrack::video("cam"));
//! service.place_call(PeerId::new("bob"), Some(&local)).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Negotiation types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Signaling protocol and handlers
pub mod signaling;

/// Peer transport abstraction
pub mod transport;

/// `webrtc-rs` transport backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_transport;

/// Remote stream registry and presentation
pub mod media;

/// Incoming and outgoing call negotiation
pub mod call;

/// Call service orchestration
pub mod service;

/// In-memory transport and signaling doubles
pub mod testing;

// Re-export main types at crate root
pub use call::{
    Call, CallContext, CallCore, CallError, CallEvent, IncomingCall, Negotiate, OutgoingCall,
};
pub use identity::{CallIdentity, PeerId};
pub use media::{
    InboundTrackEvent, LocalStream, LocalTrack, MediaEvent, Presenter, RemoteStream, RemoteTrack,
    StreamEntry, StreamId, StreamKey, StreamRegistry, SurfaceBoard, SurfaceHandle,
};
pub use service::{CallService, CallServiceConfig, ServiceError};
pub use signaling::{
    ChannelSignaling, IceCandidateMessage, InboundSignal, NegotiationMessage, SignalingChannel,
    SignalingError, SignalingHandler,
};
pub use transport::{
    IceServer, PeerTransport, TransportConfig, TransportError, TransportEvent, TransportFactory,
    TransportSession,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_transport::{WebRtcPeerTransport, WebRtcTransportFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{Call, CallError, CallEvent, IncomingCall, Negotiate, OutgoingCall};
    pub use crate::identity::{CallIdentity, PeerId};
    pub use crate::media::{LocalStream, LocalTrack, Presenter, StreamRegistry, SurfaceBoard};
    pub use crate::service::{CallService, CallServiceConfig};
    pub use crate::signaling::{ChannelSignaling, NegotiationMessage, SignalingHandler};
    pub use crate::transport::{TransportConfig, TransportFactory};
    pub use crate::types::{CallId, ConnectionState, NegotiationState, SessionDescription};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_transport::WebRtcTransportFactory;
}
