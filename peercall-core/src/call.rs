//! Call negotiation
//!
//! A call binds one transport session to a (self, peer) identity pair and
//! drives the offer/answer handshake over it. The two halves of the
//! handshake are separate types sharing a [`CallCore`]:
//!
//! ```text
//!  IncomingCall:  PendingRemote ──accept(offer)──▶ HasLocal ──────────────────────▶ Closed
//!  OutgoingCall:  Idle ──offer()──▶ HasLocal ──accept(answer)──▶ HasRemote ──────▶ Closed
//! ```
//!
//! Every call spawns one task that drains its transport's events in order:
//!
//! - locally gathered ICE candidates are relayed to the peer under the
//!   `icecandidate` topic (end-of-candidates included)
//! - the first stream of each inbound track event is registered once in the
//!   shared [`StreamRegistry`] and presented
//! - once a stream is presented, any connection state other than
//!   `Connected` closes the transport and removes the call's surfaces
//!
//! Failed negotiation leaves the call where it was; the caller is expected to
//! [`close`](CallCore::close) and discard it.

use crate::identity::{CallIdentity, PeerId};
use crate::media::{InboundTrackEvent, LocalStream, Presenter, StreamRegistry, SurfaceHandle};
use crate::signaling::{IceCandidateMessage, NegotiationMessage, SignalingError, SignalingHandler};
use crate::transport::{
    PeerTransport, TransportConfig, TransportError, TransportEvent, TransportFactory,
};
use crate::types::{
    CallDirection, CallId, ConnectionState, IceCandidate, NegotiationState, SdpType,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A description could not be created or applied
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Operation attempted in the wrong negotiation state
    #[error("Invalid negotiation state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        /// State the operation requires
        expected: NegotiationState,
        /// State the call is in
        actual: NegotiationState,
    },

    /// The signaling channel did not take the message
    #[error("Signaling delivery failed: {0}")]
    SignalingDelivery(String),

    /// The call's transport is closed
    #[error("Transport is closed")]
    TransportClosed,

    /// The transport session could not be opened
    #[error("Transport error: {0}")]
    Transport(String),

    /// No call with the given peer
    #[error("Call not found: {0}")]
    CallNotFound(String),
}

impl CallError {
    /// Whether this is a negotiation failure (bad description or wrong order)
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::Negotiation(_) | Self::InvalidState { .. })
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => CallError::TransportClosed,
            TransportError::Backend(msg) => CallError::Transport(msg),
            other => CallError::Negotiation(other.to_string()),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::SignalingDelivery(err.to_string())
    }
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// A remote stream was registered and its surface attached
    StreamAttached {
        /// Call identifier
        call_id: CallId,
        /// Remote peer
        peer: PeerId,
        /// The attached surface
        surface: SurfaceHandle,
    },
    /// A surface was removed
    StreamDetached {
        /// Call identifier
        call_id: CallId,
        /// The removed surface
        surface: SurfaceHandle,
    },
    /// A local candidate was handed to the signaling channel
    CandidateRelayed {
        /// Call identifier
        call_id: CallId,
        /// Whether this was the end-of-candidates marker
        end_of_candidates: bool,
    },
    /// Relaying a candidate failed
    SignalingFailed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        error: String,
    },
    /// Transport connectivity changed
    ConnectionStateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: ConnectionState,
    },
    /// Transport closed
    CallClosed {
        /// Call identifier
        call_id: CallId,
    },
}

/// Collaborators every call needs
///
/// Built once per local participant and cloned into each call. All calls
/// built from clones of one context share its registry, presenter and event
/// stream.
#[derive(Clone)]
pub struct CallContext {
    factory: Arc<dyn TransportFactory>,
    signaling: SignalingHandler,
    registry: StreamRegistry,
    presenter: Arc<dyn Presenter>,
    transport_config: TransportConfig,
    event_sender: broadcast::Sender<CallEvent>,
}

impl CallContext {
    /// Create a context with the default transport configuration
    #[must_use]
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: SignalingHandler,
        registry: StreamRegistry,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        Self {
            factory,
            signaling,
            registry,
            presenter,
            transport_config: TransportConfig::default(),
            event_sender,
        }
    }

    /// Use `config` for transports opened from now on
    #[must_use]
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Shared stream registry
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Signaling handler
    #[must_use]
    pub fn signaling(&self) -> &SignalingHandler {
        &self.signaling
    }

    /// Presenter
    #[must_use]
    pub fn presenter(&self) -> &Arc<dyn Presenter> {
        &self.presenter
    }

    /// Transport configuration
    #[must_use]
    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport_config
    }

    /// Subscribe to events of every call built from this context
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }
}

/// State touched both by the call's methods and by its event task
struct Shared {
    id: CallId,
    identity: CallIdentity,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<NegotiationState>,
    closed: AtomicBool,
    signaling: SignalingHandler,
    registry: StreamRegistry,
    presenter: Arc<dyn Presenter>,
    event_sender: broadcast::Sender<CallEvent>,
}

impl Shared {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed; true only for the first caller
    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.lock() = NegotiationState::Closed;
        true
    }

    async fn close_transport(&self) {
        if !self.mark_closed() {
            return;
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(call_id = %self.id, error = %e, "Transport close reported an error");
        }
        tracing::debug!(call_id = %self.id, "Transport closed");
        self.emit(CallEvent::CallClosed { call_id: self.id });
    }

    /// Remove every stream this call registered, with its surface
    fn sweep_surfaces(&self) -> usize {
        let mut removed = 0;
        for entry in self.registry.remove_owned_by(self.id) {
            if self.presenter.detach(&entry.surface) {
                removed += 1;
                self.emit(CallEvent::StreamDetached {
                    call_id: self.id,
                    surface: entry.surface,
                });
            }
        }
        removed
    }

    async fn teardown(&self) {
        self.close_transport().await;
        let removed = self.sweep_surfaces();
        if removed > 0 {
            tracing::info!(call_id = %self.id, surfaces = removed, "Removed presentation surfaces");
        }
    }

    async fn relay_candidate(&self, candidate: Option<IceCandidate>) {
        tracing::debug!(
            "{}: Emitting ice candidate for {}",
            self.identity.self_id,
            self.identity.peer_id
        );
        let message = IceCandidateMessage {
            from: self.identity.self_id.clone(),
            to: self.identity.peer_id.clone(),
            candidate,
        };
        match self.signaling.send_candidate(&message).await {
            Ok(()) => self.emit(CallEvent::CandidateRelayed {
                call_id: self.id,
                end_of_candidates: message.is_end_of_candidates(),
            }),
            Err(e) => {
                tracing::warn!(call_id = %self.id, error = %e, "Failed to relay ICE candidate");
                self.emit(CallEvent::SignalingFailed {
                    call_id: self.id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Register the first stream of `event`; true if a surface was created
    fn register_inbound(&self, event: &InboundTrackEvent) -> bool {
        let Some(stream) = event.streams.first() else {
            tracing::debug!(call_id = %self.id, track_id = %event.track.id, "Track event without stream");
            return false;
        };
        if self.is_closed() {
            return false;
        }

        let Some(entry) = self.registry.register(
            self.id,
            &self.identity.peer_id,
            self.identity.surface_id(),
            stream,
        ) else {
            return false;
        };

        self.presenter.attach(&entry.surface);
        tracing::info!(
            call_id = %self.id,
            peer = %self.identity.peer_id,
            stream_id = %stream.id,
            kind = %entry.kind(),
            "Registered inbound stream"
        );
        self.emit(CallEvent::StreamAttached {
            call_id: self.id,
            peer: self.identity.peer_id.clone(),
            surface: entry.surface,
        });
        true
    }
}

async fn drive_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    // Set once this call presents a stream; from then on leaving `Connected`
    // tears the call down.
    let mut observing = false;

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                if shared.is_closed() {
                    tracing::trace!(call_id = %shared.id, "Dropping candidate gathered after close");
                } else {
                    shared.relay_candidate(candidate).await;
                }
            }
            TransportEvent::Track(track) => {
                if shared.register_inbound(&track) {
                    observing = true;
                }
            }
            TransportEvent::ConnectionStateChanged(state) => {
                tracing::debug!(call_id = %shared.id, state = ?state, "Connection state changed");
                shared.emit(CallEvent::ConnectionStateChanged {
                    call_id: shared.id,
                    state,
                });
                if observing && state != ConnectionState::Connected {
                    observing = false;
                    shared.teardown().await;
                }
            }
        }
    }
    tracing::trace!(call_id = %shared.id, "Transport event stream ended");
}

/// Remote candidates waiting for the remote description
#[derive(Default)]
struct HeldCandidates {
    queue: VecDeque<Option<IceCandidate>>,
    // Set while the queue is being applied; new arrivals go behind it
    draining: bool,
}

/// Negotiation entity shared by both call directions
pub struct CallCore {
    shared: Arc<Shared>,
    direction: CallDirection,
    held: Mutex<HeldCandidates>,
    task: JoinHandle<()>,
}

impl CallCore {
    async fn open(
        direction: CallDirection,
        identity: CallIdentity,
        ctx: &CallContext,
    ) -> Result<Self, CallError> {
        let session = ctx.factory.open(&ctx.transport_config).await?;
        let initial = match direction {
            CallDirection::Incoming => NegotiationState::PendingRemote,
            CallDirection::Outgoing => NegotiationState::Idle,
        };

        let shared = Arc::new(Shared {
            id: CallId::new(),
            identity,
            transport: session.transport,
            state: Mutex::new(initial),
            closed: AtomicBool::new(false),
            signaling: ctx.signaling.clone(),
            registry: ctx.registry.clone(),
            presenter: ctx.presenter.clone(),
            event_sender: ctx.event_sender.clone(),
        });
        let task = tokio::spawn(drive_events(shared.clone(), session.events));

        tracing::debug!(
            call_id = %shared.id,
            direction = ?direction,
            identity = %shared.identity,
            "Call created"
        );
        Ok(Self {
            shared,
            direction,
            held: Mutex::new(HeldCandidates::default()),
            task,
        })
    }

    /// Call identifier
    #[must_use]
    pub fn id(&self) -> CallId {
        self.shared.id
    }

    /// The (self, peer) pair
    #[must_use]
    pub fn identity(&self) -> &CallIdentity {
        &self.shared.identity
    }

    /// Local participant
    #[must_use]
    pub fn self_id(&self) -> &PeerId {
        &self.shared.identity.self_id
    }

    /// Remote participant
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.shared.identity.peer_id
    }

    /// Which half of the handshake this call plays
    #[must_use]
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Negotiation progress
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        *self.shared.state.lock()
    }

    /// Transport connectivity
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.transport.connection_state()
    }

    /// Whether the transport has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Attach every track of a local stream for sending
    ///
    /// Attaching the same stream twice is the caller's mistake; the
    /// transport decides what happens.
    ///
    /// # Errors
    ///
    /// Returns error if the call is closed or the transport rejects a track
    #[tracing::instrument(skip(self, stream), fields(call_id = %self.id(), stream_id = %stream.id))]
    pub async fn add_stream(&self, stream: &LocalStream) -> Result<(), CallError> {
        self.ensure_open()?;
        for track in &stream.tracks {
            self.shared.transport.add_track(track, stream).await?;
            tracing::debug!(track_id = %track.id, kind = %track.kind, "Attached local track");
        }
        Ok(())
    }

    /// Forward a candidate received from the peer into the transport
    ///
    /// `None` is the peer's end-of-candidates marker. Candidates that arrive
    /// before the peer's description has been applied are held and applied
    /// right after it, in arrival order; anything arriving while they are
    /// applied is queued behind them.
    ///
    /// # Errors
    ///
    /// Returns error if the call is closed or the transport rejects the
    /// candidate
    #[tracing::instrument(skip(self, candidate), fields(call_id = %self.id(), end = candidate.is_none()))]
    pub async fn add_remote_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        {
            let mut held = self.held.lock();
            if !self.has_remote_description() {
                tracing::debug!("Holding remote candidate until the remote description is applied");
                held.queue.push_back(candidate);
                return Ok(());
            }
            if held.draining {
                tracing::debug!("Queueing remote candidate behind held candidates");
                held.queue.push_back(candidate);
                return Ok(());
            }
        }
        self.shared.transport.add_ice_candidate(candidate).await?;
        tracing::trace!("Remote candidate applied");
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        match (self.direction, self.state()) {
            (CallDirection::Incoming, state) => state != NegotiationState::PendingRemote,
            (CallDirection::Outgoing, state) => state == NegotiationState::HasRemote,
        }
    }

    /// Advance past the remote description and apply held candidates
    async fn advance_with_remote(&self, to: NegotiationState) -> Result<(), CallError> {
        {
            let mut held = self.held.lock();
            self.advance(to)?;
            held.draining = true;
        }
        loop {
            let next = {
                let mut held = self.held.lock();
                match held.queue.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        held.draining = false;
                        break;
                    }
                }
            };
            if let Err(e) = self.shared.transport.add_ice_candidate(next).await {
                tracing::warn!(call_id = %self.id(), error = %e, "Held remote candidate rejected");
            }
        }
        Ok(())
    }

    /// Close the transport and remove this call's presentation surfaces
    ///
    /// Idempotent.
    #[tracing::instrument(skip(self), fields(call_id = %self.id()))]
    pub async fn close(&self) {
        if !self.is_closed() {
            tracing::info!(peer = %self.peer_id(), "Closing call");
        }
        self.shared.teardown().await;
    }

    fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.shared.transport
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::TransportClosed);
        }
        Ok(())
    }

    fn expect_state(&self, expected: NegotiationState) -> Result<(), CallError> {
        self.ensure_open()?;
        let actual = self.state();
        if actual != expected {
            tracing::warn!(
                call_id = %self.id(),
                expected = ?expected,
                actual = ?actual,
                "Negotiation step out of order"
            );
            return Err(CallError::InvalidState { expected, actual });
        }
        Ok(())
    }

    fn advance(&self, to: NegotiationState) -> Result<(), CallError> {
        let mut state = self.shared.state.lock();
        // close() may have raced the awaited transport operation
        if *state == NegotiationState::Closed {
            return Err(CallError::TransportClosed);
        }
        tracing::debug!(
            call_id = %self.shared.id,
            old_state = ?*state,
            new_state = ?to,
            "Negotiation state transition"
        );
        *state = to;
        Ok(())
    }

    fn negotiation_failure(&self, step: &str, err: TransportError) -> CallError {
        tracing::warn!(call_id = %self.id(), step, error = %err, "Negotiation step failed");
        CallError::from(err)
    }
}

impl Drop for CallCore {
    fn drop(&mut self) {
        self.task.abort();
        if self.shared.is_closed() {
            return;
        }
        self.shared.sweep_surfaces();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            handle.spawn(async move { shared.close_transport().await });
        }
    }
}

/// Remote half of a handshake, typed per direction
#[async_trait]
pub trait Negotiate: Send + Sync {
    /// What the peer sent
    type Remote: Send + 'static;
    /// What accepting it produces
    type Output: Send;

    /// Apply the peer's description
    async fn accept(&self, remote: Self::Remote) -> Result<Self::Output, CallError>;
}

/// Call whose offer came from the peer
pub struct IncomingCall {
    core: CallCore,
}

impl IncomingCall {
    /// Open a transport for an incoming call from `peer_id`
    ///
    /// # Errors
    ///
    /// Returns error if the transport session cannot be opened
    pub async fn new(
        self_id: impl Into<PeerId>,
        peer_id: impl Into<PeerId>,
        ctx: &CallContext,
    ) -> Result<Self, CallError> {
        let identity = CallIdentity::new(self_id, peer_id);
        let core = CallCore::open(CallDirection::Incoming, identity, ctx).await?;
        Ok(Self { core })
    }
}

impl Deref for IncomingCall {
    type Target = CallCore;

    fn deref(&self) -> &CallCore {
        &self.core
    }
}

#[async_trait]
impl Negotiate for IncomingCall {
    type Remote = NegotiationMessage;
    type Output = NegotiationMessage;

    /// Apply the peer's offer and produce the answer addressed back to it
    #[tracing::instrument(skip(self, offer), fields(call_id = %self.id(), from = %offer.from))]
    async fn accept(&self, offer: NegotiationMessage) -> Result<NegotiationMessage, CallError> {
        self.expect_state(NegotiationState::PendingRemote)?;
        if offer.desc.sdp_type != SdpType::Offer {
            return Err(CallError::Negotiation(format!(
                "expected an offer, got {}",
                offer.desc.sdp_type
            )));
        }
        if &offer.from != self.peer_id() {
            tracing::warn!(peer = %self.peer_id(), "Offer sender differs from call peer");
        }

        let transport = self.transport();
        transport
            .set_remote_description(offer.desc)
            .await
            .map_err(|e| self.negotiation_failure("set_remote_description", e))?;
        let answer = transport
            .create_answer()
            .await
            .map_err(|e| self.negotiation_failure("create_answer", e))?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| self.negotiation_failure("set_local_description", e))?;
        self.advance_with_remote(NegotiationState::HasLocal).await?;

        tracing::info!("Answer created");
        Ok(NegotiationMessage {
            to: offer.from,
            from: self.self_id().clone(),
            desc: answer,
        })
    }
}

/// Call placed by the local participant
pub struct OutgoingCall {
    core: CallCore,
}

impl OutgoingCall {
    /// Open a transport for a call to `peer_id`
    ///
    /// # Errors
    ///
    /// Returns error if the transport session cannot be opened
    pub async fn new(
        self_id: impl Into<PeerId>,
        peer_id: impl Into<PeerId>,
        ctx: &CallContext,
    ) -> Result<Self, CallError> {
        let identity = CallIdentity::new(self_id, peer_id);
        let core = CallCore::open(CallDirection::Outgoing, identity, ctx).await?;
        Ok(Self { core })
    }

    /// Create and apply the local offer
    ///
    /// May be called once, before the answer arrives.
    ///
    /// # Errors
    ///
    /// Returns error if an offer was already made, the call is closed, or
    /// the transport fails to produce or apply the offer
    #[tracing::instrument(skip(self), fields(call_id = %self.id(), to = %self.peer_id()))]
    pub async fn offer(&self) -> Result<NegotiationMessage, CallError> {
        self.expect_state(NegotiationState::Idle)?;

        let transport = self.transport();
        let offer = transport
            .create_offer()
            .await
            .map_err(|e| self.negotiation_failure("create_offer", e))?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| self.negotiation_failure("set_local_description", e))?;
        self.advance(NegotiationState::HasLocal)?;

        tracing::info!("Offer created");
        Ok(NegotiationMessage {
            to: self.peer_id().clone(),
            from: self.self_id().clone(),
            desc: offer,
        })
    }
}

impl Deref for OutgoingCall {
    type Target = CallCore;

    fn deref(&self) -> &CallCore {
        &self.core
    }
}

#[async_trait]
impl Negotiate for OutgoingCall {
    type Remote = NegotiationMessage;
    type Output = ();

    /// Apply the peer's answer, completing negotiation
    #[tracing::instrument(skip(self, answer), fields(call_id = %self.id(), from = %answer.from))]
    async fn accept(&self, answer: NegotiationMessage) -> Result<(), CallError> {
        self.expect_state(NegotiationState::HasLocal)?;
        if !answer.desc.is_answer() {
            return Err(CallError::Negotiation(format!(
                "expected an answer, got {}",
                answer.desc.sdp_type
            )));
        }

        self.transport()
            .set_remote_description(answer.desc)
            .await
            .map_err(|e| self.negotiation_failure("set_remote_description", e))?;
        self.advance_with_remote(NegotiationState::HasRemote).await?;

        tracing::info!("Answer applied");
        Ok(())
    }
}

/// Either half of the handshake
pub enum Call {
    /// Offer came from the peer
    Incoming(IncomingCall),
    /// Offer goes to the peer
    Outgoing(OutgoingCall),
}

impl Call {
    /// Shared call state
    #[must_use]
    pub fn core(&self) -> &CallCore {
        match self {
            Self::Incoming(call) => &call.core,
            Self::Outgoing(call) => &call.core,
        }
    }

    /// Outgoing half, if this is one
    #[must_use]
    pub fn as_outgoing(&self) -> Option<&OutgoingCall> {
        match self {
            Self::Outgoing(call) => Some(call),
            Self::Incoming(_) => None,
        }
    }

    /// Incoming half, if this is one
    #[must_use]
    pub fn as_incoming(&self) -> Option<&IncomingCall> {
        match self {
            Self::Incoming(call) => Some(call),
            Self::Outgoing(_) => None,
        }
    }

    /// Apply the peer's description to whichever half this is
    ///
    /// Incoming calls answer (returning the answer to send); outgoing calls
    /// complete negotiation and return `None`.
    ///
    /// # Errors
    ///
    /// Returns the variant's negotiation error
    pub async fn handle_remote(
        &self,
        message: NegotiationMessage,
    ) -> Result<Option<NegotiationMessage>, CallError> {
        match self {
            Self::Incoming(call) => call.accept(message).await.map(Some),
            Self::Outgoing(call) => call.accept(message).await.map(|()| None),
        }
    }
}

impl Deref for Call {
    type Target = CallCore;

    fn deref(&self) -> &CallCore {
        self.core()
    }
}

impl From<IncomingCall> for Call {
    fn from(call: IncomingCall) -> Self {
        Self::Incoming(call)
    }
}

impl From<OutgoingCall> for Call {
    fn from(call: OutgoingCall) -> Self {
        Self::Outgoing(call)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, RemoteStream, RemoteTrack, StreamId, StreamKey, SurfaceBoard};
    use crate::signaling::{ChannelSignaling, TOPIC_ICE_CANDIDATE};
    use crate::testing::{FailingChannel, GatedOp, MockTransportFactory};
    use crate::types::{MediaKind, SessionDescription};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Harness {
        ctx: CallContext,
        factory: Arc<MockTransportFactory>,
        board: Arc<SurfaceBoard>,
        emitted: mpsc::UnboundedReceiver<(String, String)>,
    }

    fn harness() -> Harness {
        let factory = Arc::new(MockTransportFactory::new());
        let board = Arc::new(SurfaceBoard::new());
        let (channel, emitted) = ChannelSignaling::new();
        let ctx = CallContext::new(
            factory.clone(),
            SignalingHandler::new(Arc::new(channel)),
            StreamRegistry::new(),
            board.clone(),
        );
        Harness {
            ctx,
            factory,
            board,
            emitted,
        }
    }

    fn av_stream(id: &str) -> RemoteStream {
        RemoteStream {
            id: StreamId::new(id),
            tracks: vec![
                RemoteTrack {
                    id: format!("{id}-audio"),
                    kind: MediaKind::Audio,
                },
                RemoteTrack {
                    id: format!("{id}-video"),
                    kind: MediaKind::Video,
                },
            ],
        }
    }

    fn track_event(stream: &RemoteStream, index: usize) -> InboundTrackEvent {
        InboundTrackEvent {
            track: stream.tracks[index].clone(),
            streams: vec![stream.clone()],
        }
    }

    async fn next_event<F>(rx: &mut broadcast::Receiver<CallEvent>, pred: F) -> CallEvent
    where
        F: Fn(&CallEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_incoming_accept_addresses_answer_to_offerer() {
        let h = harness();
        let call = IncomingCall::new("alice", "bob", &h.ctx).await.unwrap();
        assert_eq!(call.state(), NegotiationState::PendingRemote);

        let offer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
        };
        let answer = call.accept(offer.clone()).await.unwrap();

        assert_eq!(answer.to, PeerId::new("bob"));
        assert_eq!(answer.from, PeerId::new("alice"));
        assert_eq!(answer.desc.sdp_type, SdpType::Answer);
        assert_eq!(call.state(), NegotiationState::HasLocal);

        let transport = h.factory.last().unwrap();
        assert_eq!(transport.remote_description(), Some(offer.desc));
        assert_eq!(transport.local_description(), Some(answer.desc));
    }

    #[tokio::test]
    async fn test_incoming_accept_failure_stays_pending() {
        let h = harness();
        let call = IncomingCall::new("alice", "bob", &h.ctx).await.unwrap();

        let offer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::offer("garbage"),
        };
        let err = call.accept(offer).await.unwrap_err();

        assert!(err.is_negotiation());
        assert_eq!(call.state(), NegotiationState::PendingRemote);
        assert!(h.board.is_empty());
        call.close().await;
        assert!(call.is_closed());
    }

    #[tokio::test]
    async fn test_incoming_rejects_answer_payload() {
        let h = harness();
        let call = IncomingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let not_an_offer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::answer("v=0\r\n"),
        };
        assert!(matches!(
            call.accept(not_an_offer).await,
            Err(CallError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_outgoing_offer_then_accept_reaches_has_remote() {
        let h = harness();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        assert_eq!(call.state(), NegotiationState::Idle);

        let offer = call.offer().await.unwrap();
        assert_eq!(offer.to, PeerId::new("bob"));
        assert_eq!(offer.from, PeerId::new("alice"));
        assert!(offer.desc.is_offer());
        assert_eq!(call.state(), NegotiationState::HasLocal);

        let answer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::answer("v=0\r\n"),
        };
        call.accept(answer).await.unwrap();
        assert_eq!(call.state(), NegotiationState::HasRemote);
    }

    #[tokio::test]
    async fn test_outgoing_offer_twice_is_rejected() {
        let h = harness();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        call.offer().await.unwrap();

        let err = call.offer().await.unwrap_err();
        assert_eq!(
            err,
            CallError::InvalidState {
                expected: NegotiationState::Idle,
                actual: NegotiationState::HasLocal,
            }
        );
        assert!(err.is_negotiation());
    }

    #[tokio::test]
    async fn test_outgoing_accept_before_offer_is_rejected() {
        let h = harness();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let answer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::answer("v=0\r\n"),
        };
        assert!(matches!(
            call.accept(answer).await,
            Err(CallError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let h = harness();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        call.close().await;
        call.close().await;

        assert_eq!(call.state(), NegotiationState::Closed);
        assert_eq!(call.offer().await.unwrap_err(), CallError::TransportClosed);
        assert_eq!(
            call.add_remote_candidate(None).await.unwrap_err(),
            CallError::TransportClosed
        );
        assert_eq!(h.factory.last().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_null_candidate_is_emitted_once() {
        let mut h = harness();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let transport = h.factory.last().unwrap();

        transport.emit_candidate(None);

        let (topic, payload) = tokio::time::timeout(Duration::from_secs(2), h.emitted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, TOPIC_ICE_CANDIDATE);
        let message: IceCandidateMessage = serde_json::from_str(&payload).unwrap();
        assert_eq!(message.from, PeerId::new("alice"));
        assert_eq!(message.to, PeerId::new("bob"));
        assert!(message.candidate.is_none());
        assert!(payload.contains("\"candidate\":null"));

        call.close().await;
        drop(call);
        assert!(h.emitted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candidates_are_relayed_in_order() {
        let mut h = harness();
        let _call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let transport = h.factory.last().unwrap();

        transport.emit_candidate(Some(IceCandidate::new("candidate:1")));
        transport.emit_candidate(Some(IceCandidate::new("candidate:2")));
        transport.emit_candidate(None);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (_, payload) = tokio::time::timeout(Duration::from_secs(2), h.emitted.recv())
                .await
                .unwrap()
                .unwrap();
            let message: IceCandidateMessage = serde_json::from_str(&payload).unwrap();
            seen.push(message.candidate.map(|c| c.candidate));
        }
        assert_eq!(
            seen,
            vec![
                Some("candidate:1".to_string()),
                Some("candidate:2".to_string()),
                None
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_failure_is_reported_as_event() {
        let factory = Arc::new(MockTransportFactory::new());
        let ctx = CallContext::new(
            factory.clone(),
            SignalingHandler::new(Arc::new(FailingChannel)),
            StreamRegistry::new(),
            Arc::new(SurfaceBoard::new()),
        );
        let mut events = ctx.subscribe_events();
        let _call = OutgoingCall::new("alice", "bob", &ctx).await.unwrap();

        factory.last().unwrap().emit_candidate(None);

        let event = next_event(&mut events, |e| {
            matches!(e, CallEvent::SignalingFailed { .. })
        })
        .await;
        assert!(matches!(event, CallEvent::SignalingFailed { .. }));
    }

    #[tokio::test]
    async fn test_early_remote_candidates_are_held_until_answer() {
        let h = harness();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        call.offer().await.unwrap();
        let transport = h.factory.last().unwrap();

        call.add_remote_candidate(Some(IceCandidate::new("candidate:early")))
            .await
            .unwrap();
        assert!(transport.remote_candidates().is_empty());

        let answer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::answer("v=0\r\n"),
        };
        call.accept(answer).await.unwrap();
        call.add_remote_candidate(None).await.unwrap();

        assert_eq!(
            transport.remote_candidates(),
            vec![Some(IceCandidate::new("candidate:early")), None]
        );
    }

    #[tokio::test]
    async fn test_add_stream_attaches_tracks_without_registering() {
        let h = harness();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let local = LocalStream::new("local")
            .with_track(LocalTrack::audio("mic"))
            .with_track(LocalTrack::video("cam"));

        call.add_stream(&local).await.unwrap();

        let transport = h.factory.last().unwrap();
        assert_eq!(transport.attached_tracks().len(), 2);
        assert!(h.ctx.registry().is_empty());
        assert!(h.board.is_empty());
    }

    #[tokio::test]
    async fn test_redundant_track_events_register_one_stream() {
        let h = harness();
        let mut events = h.ctx.subscribe_events();
        let call = IncomingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let transport = h.factory.last().unwrap();
        let stream = av_stream("remote-1");

        transport.emit_track(track_event(&stream, 0));
        transport.emit_track(track_event(&stream, 1));
        transport.set_connection_state(ConnectionState::Connected);

        next_event(&mut events, |e| {
            matches!(e, CallEvent::ConnectionStateChanged { state: ConnectionState::Connected, .. })
        })
        .await;

        assert_eq!(h.ctx.registry().len(), 1);
        let entry = h
            .ctx
            .registry()
            .get(&StreamKey::new(call.id(), stream.id.clone()))
            .unwrap();
        assert_eq!(entry.owner(), call.id());
        assert_eq!(entry.kind(), MediaKind::Video);
        assert_eq!(entry.surface.id, "xbob");
        assert_eq!(h.board.len(), 1);
    }

    #[tokio::test]
    async fn test_leaving_connected_removes_surface_once() {
        let h = harness();
        let mut events = h.ctx.subscribe_events();
        let call = IncomingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let transport = h.factory.last().unwrap();
        let stream = av_stream("remote-1");

        transport.set_connection_state(ConnectionState::Connected);
        transport.emit_track(track_event(&stream, 0));
        next_event(&mut events, |e| matches!(e, CallEvent::StreamAttached { .. })).await;

        transport.set_connection_state(ConnectionState::Disconnected);
        transport.set_connection_state(ConnectionState::Closed);
        next_event(&mut events, |e| matches!(e, CallEvent::StreamDetached { .. })).await;
        next_event(&mut events, |e| {
            matches!(e, CallEvent::ConnectionStateChanged { state: ConnectionState::Closed, .. })
        })
        .await;

        assert!(call.is_closed());
        assert!(h.board.is_empty());
        assert!(h.ctx.registry().is_empty());
        assert_eq!(transport.close_count(), 1);

        call.close().await;
        assert_eq!(transport.close_count(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_removes_surfaces_synchronously() {
        let h = harness();
        let mut events = h.ctx.subscribe_events();
        let call = IncomingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let transport = h.factory.last().unwrap();

        transport.emit_track(track_event(&av_stream("remote-1"), 0));
        next_event(&mut events, |e| matches!(e, CallEvent::StreamAttached { .. })).await;
        assert_eq!(h.board.len(), 1);

        call.close().await;
        assert!(h.board.is_empty());
        assert!(h.ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn test_state_changes_without_streams_do_not_close() {
        let h = harness();
        let mut events = h.ctx.subscribe_events();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let transport = h.factory.last().unwrap();

        transport.set_connection_state(ConnectionState::Checking);
        next_event(&mut events, |e| {
            matches!(e, CallEvent::ConnectionStateChanged { state: ConnectionState::Checking, .. })
        })
        .await;

        assert!(!call.is_closed());
        assert_eq!(call.connection_state(), ConnectionState::Checking);
    }

    #[tokio::test]
    async fn test_call_enum_dispatches_by_variant() {
        let h = harness();
        let outgoing: Call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap().into();
        let incoming: Call = IncomingCall::new("bob", "alice", &h.ctx).await.unwrap().into();

        let offer = outgoing.as_outgoing().unwrap().offer().await.unwrap();
        let answer = incoming.handle_remote(offer).await.unwrap().unwrap();
        assert_eq!(incoming.direction(), CallDirection::Incoming);

        assert!(outgoing.handle_remote(answer).await.unwrap().is_none());
        assert_eq!(outgoing.state(), NegotiationState::HasRemote);
        assert!(outgoing.as_incoming().is_none());
    }

    #[tokio::test]
    async fn test_same_stream_id_on_two_calls_presents_both() {
        let h = harness();
        let mut events = h.ctx.subscribe_events();
        let bob = IncomingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let bob_transport = h.factory.last().unwrap();
        let carol = IncomingCall::new("alice", "carol", &h.ctx).await.unwrap();
        let carol_transport = h.factory.last().unwrap();
        let stream = av_stream("default");

        bob_transport.emit_track(track_event(&stream, 0));
        carol_transport.emit_track(track_event(&stream, 0));
        for _ in 0..2 {
            next_event(&mut events, |e| matches!(e, CallEvent::StreamAttached { .. })).await;
        }

        assert_eq!(h.ctx.registry().len(), 2);
        let mut surfaces: Vec<String> = h.board.surfaces().into_iter().map(|s| s.id).collect();
        surfaces.sort();
        assert_eq!(surfaces, vec!["xbob".to_string(), "xcarol".to_string()]);

        // Only bob's surface goes when bob's connection drops
        bob_transport.set_connection_state(ConnectionState::Disconnected);
        next_event(&mut events, |e| matches!(e, CallEvent::StreamDetached { .. })).await;
        assert!(bob.is_closed());
        assert!(!carol.is_closed());
        assert!(h.board.surface("xbob").is_none());
        assert_eq!(h.board.surface("xcarol").map(|s| s.owner), Some(carol.id()));
        assert!(h
            .ctx
            .registry()
            .contains(&StreamKey::new(carol.id(), "default")));
    }

    #[tokio::test]
    async fn test_close_during_offer_fails_with_transport_closed() {
        let h = harness();
        let call = Arc::new(OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap());
        let transport = h.factory.last().unwrap();
        transport.hold(GatedOp::SetLocalDescription);

        let pending = tokio::spawn({
            let call = call.clone();
            async move { call.offer().await }
        });
        tokio::time::timeout(Duration::from_secs(2), transport.blocked(GatedOp::SetLocalDescription))
            .await
            .unwrap();
        call.close().await;
        transport.release(GatedOp::SetLocalDescription);

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), CallError::TransportClosed);
        assert_eq!(call.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_close_during_incoming_accept_fails_with_transport_closed() {
        let h = harness();
        let call = Arc::new(IncomingCall::new("alice", "bob", &h.ctx).await.unwrap());
        let transport = h.factory.last().unwrap();
        transport.hold(GatedOp::SetRemoteDescription);

        let offer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::offer("v=0\r\n"),
        };
        let pending = tokio::spawn({
            let call = call.clone();
            async move { call.accept(offer).await }
        });
        tokio::time::timeout(Duration::from_secs(2), transport.blocked(GatedOp::SetRemoteDescription))
            .await
            .unwrap();
        call.close().await;
        transport.release(GatedOp::SetRemoteDescription);

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), CallError::TransportClosed);
        assert_eq!(call.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_close_during_outgoing_accept_fails_with_transport_closed() {
        let h = harness();
        let call = Arc::new(OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap());
        call.offer().await.unwrap();
        let transport = h.factory.last().unwrap();
        transport.hold(GatedOp::SetRemoteDescription);

        let answer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::answer("v=0\r\n"),
        };
        let pending = tokio::spawn({
            let call = call.clone();
            async move { call.accept(answer).await }
        });
        tokio::time::timeout(Duration::from_secs(2), transport.blocked(GatedOp::SetRemoteDescription))
            .await
            .unwrap();
        call.close().await;
        transport.release(GatedOp::SetRemoteDescription);

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), CallError::TransportClosed);
        assert_eq!(call.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_candidates_arriving_during_drain_queue_behind_held_ones() {
        let h = harness();
        let call = Arc::new(OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap());
        call.offer().await.unwrap();
        let transport = h.factory.last().unwrap();

        call.add_remote_candidate(Some(IceCandidate::new("candidate:1")))
            .await
            .unwrap();
        call.add_remote_candidate(Some(IceCandidate::new("candidate:2")))
            .await
            .unwrap();
        transport.hold(GatedOp::AddIceCandidate);

        let answer = NegotiationMessage {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            desc: SessionDescription::answer("v=0\r\n"),
        };
        let answering = tokio::spawn({
            let call = call.clone();
            async move { call.accept(answer).await }
        });
        tokio::time::timeout(Duration::from_secs(2), transport.blocked(GatedOp::AddIceCandidate))
            .await
            .unwrap();
        assert_eq!(
            transport.remote_candidates(),
            vec![Some(IceCandidate::new("candidate:1"))]
        );

        // End-of-candidates must not overtake candidate:2
        call.add_remote_candidate(None).await.unwrap();
        assert_eq!(transport.remote_candidates().len(), 1);

        transport.release(GatedOp::AddIceCandidate);
        tokio::time::timeout(Duration::from_secs(2), answering)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            transport.remote_candidates(),
            vec![
                Some(IceCandidate::new("candidate:1")),
                Some(IceCandidate::new("candidate:2")),
                None
            ]
        );

        call.add_remote_candidate(Some(IceCandidate::new("candidate:3")))
            .await
            .unwrap();
        assert_eq!(transport.remote_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_candidates_gathered_after_close_are_not_relayed() {
        let mut h = harness();
        let mut events = h.ctx.subscribe_events();
        let call = OutgoingCall::new("alice", "bob", &h.ctx).await.unwrap();
        let transport = h.factory.last().unwrap();

        call.close().await;
        transport.emit_candidate(Some(IceCandidate::new("candidate:late")));
        transport.emit_candidate(None);
        transport.set_connection_state(ConnectionState::Closed);
        next_event(&mut events, |e| {
            matches!(e, CallEvent::ConnectionStateChanged { state: ConnectionState::Closed, .. })
        })
        .await;

        assert!(h.emitted.try_recv().is_err());
    }
}
