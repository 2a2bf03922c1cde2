//! In-memory transport and signaling doubles
//!
//! [`MockTransportFactory`] opens [`MockPeerTransport`]s that follow the
//! offer/answer rules of a real peer connection closely enough to exercise
//! negotiation, and let tests inject the events a real session would
//! produce. Individual operations can be held open with
//! [`MockPeerTransport::hold`] to interleave them with `close` or with
//! other calls.

use crate::media::{InboundTrackEvent, LocalStream, LocalTrack};
use crate::signaling::{SignalingChannel, SignalingError};
use crate::transport::{
    PeerTransport, TransportConfig, TransportError, TransportEvent, TransportFactory,
    TransportSession,
};
use crate::types::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Transport operation a test can hold open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatedOp {
    /// `create_offer`
    CreateOffer,
    /// `set_local_description`
    SetLocalDescription,
    /// `set_remote_description`
    SetRemoteDescription,
    /// `add_ice_candidate`
    AddIceCandidate,
}

/// Held operations complete their effect, then wait for release before
/// returning.
#[derive(Default)]
struct Gate {
    held: Mutex<HashSet<GatedOp>>,
    parked: Mutex<HashMap<GatedOp, usize>>,
    released: Notify,
    arrived: Notify,
}

impl Gate {
    async fn pass(&self, op: GatedOp) {
        let mut parked = false;
        loop {
            let released = self.released.notified();
            let held = self.held.lock().contains(&op);
            if !held {
                break;
            }
            if !parked {
                parked = true;
                *self.parked.lock().entry(op).or_default() += 1;
                self.arrived.notify_waiters();
            }
            released.await;
        }
        if parked {
            if let Some(count) = self.parked.lock().get_mut(&op) {
                *count = count.saturating_sub(1);
            }
        }
    }

    async fn wait_parked(&self, op: GatedOp) {
        loop {
            let arrived = self.arrived.notified();
            let parked = self.parked.lock().get(&op).copied().unwrap_or(0);
            if parked > 0 {
                return;
            }
            arrived.await;
        }
    }
}

#[derive(Default)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<Option<IceCandidate>>,
    tracks: Vec<(LocalTrack, LocalStream)>,
    connection: Option<ConnectionState>,
    closed: bool,
}

/// Scriptable peer transport
pub struct MockPeerTransport {
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    close_count: AtomicUsize,
    config: TransportConfig,
    gate: Gate,
}

impl MockPeerTransport {
    fn new(config: TransportConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            events,
            close_count: AtomicUsize::new(0),
            config,
            gate: Gate::default(),
        }
    }

    /// Hold `op`: from now on it applies its effect and then waits for
    /// [`release`](Self::release) before returning
    pub fn hold(&self, op: GatedOp) {
        self.gate.held.lock().insert(op);
    }

    /// Let held `op` calls return, and stop holding new ones
    pub fn release(&self, op: GatedOp) {
        self.gate.held.lock().remove(&op);
        self.gate.released.notify_waiters();
    }

    /// Resolves once some `op` call is waiting for release
    pub async fn blocked(&self, op: GatedOp) {
        self.gate.wait_parked(op).await;
    }

    /// Configuration the transport was opened with
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Deliver a locally gathered candidate (`None` ends gathering)
    pub fn emit_candidate(&self, candidate: Option<IceCandidate>) {
        let _ = self.events.send(TransportEvent::IceCandidate(candidate));
    }

    /// Deliver an inbound track event
    pub fn emit_track(&self, event: InboundTrackEvent) {
        let _ = self.events.send(TransportEvent::Track(event));
    }

    /// Change connectivity and report it
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = Some(state);
        let _ = self
            .events
            .send(TransportEvent::ConnectionStateChanged(state));
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Remote candidates added so far, end-of-candidates included
    pub fn remote_candidates(&self) -> Vec<Option<IceCandidate>> {
        self.state.lock().candidates.clone()
    }

    /// Local tracks attached so far
    pub fn attached_tracks(&self) -> Vec<(LocalTrack, LocalStream)> {
        self.state.lock().tracks.clone()
    }

    /// How many times `close` actually closed the session
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Whether the session is closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(state: &MockState) -> Result<(), TransportError> {
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn check_sdp(desc: &SessionDescription) -> Result<(), TransportError> {
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::Description(format!(
                "malformed {} sdp",
                desc.sdp_type
            )));
        }
        Ok(())
    }

    fn render_sdp(kind: SdpType, state: &MockState) -> String {
        let mut sdp = format!("v=0\r\no=- 0 2 IN IP4 127.0.0.1\r\ns=-\r\na=mock:{kind}\r\n");
        for (track, stream) in &state.tracks {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\n", track.kind));
            sdp.push_str(&format!("a=msid:{} {}\r\n", stream.id, track.id));
        }
        sdp
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = {
            let state = self.state.lock();
            Self::check_open(&state)?;
            SessionDescription::offer(Self::render_sdp(SdpType::Offer, &state))
        };
        self.gate.pass(GatedOp::CreateOffer).await;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        match &state.remote {
            Some(remote) if remote.is_offer() => Ok(SessionDescription::answer(
                Self::render_sdp(SdpType::Answer, &state),
            )),
            _ => Err(TransportError::Description(
                "no remote offer to answer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            Self::check_sdp(&desc)?;
            state.local = Some(desc);
        }
        self.gate.pass(GatedOp::SetLocalDescription).await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            Self::check_sdp(&desc)?;
            if desc.is_answer()
                && !state.local.as_ref().is_some_and(SessionDescription::is_offer)
            {
                return Err(TransportError::Description(
                    "answer without a local offer".to_string(),
                ));
            }
            state.remote = Some(desc);
        }
        self.gate.pass(GatedOp::SetRemoteDescription).await;
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            if state.remote.is_none() {
                return Err(TransportError::Candidate(
                    "remote description not set".to_string(),
                ));
            }
            state.candidates.push(candidate);
        }
        self.gate.pass(GatedOp::AddIceCandidate).await;
        Ok(())
    }

    async fn add_track(
        &self,
        track: &LocalTrack,
        stream: &LocalStream,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.tracks.iter().any(|(t, _)| t.id == track.id) {
            return Err(TransportError::Track(format!(
                "track {} already attached",
                track.id
            )));
        }
        state.tracks.push((track.clone(), stream.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        let state = self.state.lock();
        match (state.closed, state.connection) {
            (_, Some(s)) => s,
            (true, None) => ConnectionState::Closed,
            (false, None) => ConnectionState::New,
        }
    }
}

/// Factory for [`MockPeerTransport`]s that remembers what it opened
#[derive(Default)]
pub struct MockTransportFactory {
    opened: Mutex<Vec<Arc<MockPeerTransport>>>,
}

impl MockTransportFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport opened so far, oldest first
    pub fn opened(&self) -> Vec<Arc<MockPeerTransport>> {
        self.opened.lock().clone()
    }

    /// Most recently opened transport
    pub fn last(&self) -> Option<Arc<MockPeerTransport>> {
        self.opened.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(&self, config: &TransportConfig) -> Result<TransportSession, TransportError> {
        let (sender, events) = mpsc::unbounded_channel();
        let transport = Arc::new(MockPeerTransport::new(config.clone(), sender));
        self.opened.lock().push(transport.clone());
        Ok(TransportSession {
            transport,
            events,
        })
    }
}

/// Signaling channel that rejects everything
pub struct FailingChannel;

#[async_trait]
impl SignalingChannel for FailingChannel {
    async fn emit(&self, topic: &str, _payload: String) -> Result<(), SignalingError> {
        Err(SignalingError::DeliveryFailed(format!(
            "{topic}: channel unavailable"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_enforces_offer_answer_order() {
        let factory = MockTransportFactory::new();
        let session = factory.open(&TransportConfig::default()).await.unwrap();
        let transport = session.transport;

        assert!(transport.create_answer().await.is_err());
        assert!(transport
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .is_err());

        let offer = transport.create_offer().await.unwrap();
        transport.set_local_description(offer).await.unwrap();
        transport
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        transport.add_ice_candidate(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_held_operation_applies_then_waits_for_release() {
        let factory = MockTransportFactory::new();
        let session = factory.open(&TransportConfig::default()).await.unwrap();
        let mock = factory.last().unwrap();
        mock.hold(GatedOp::SetLocalDescription);

        let transport = session.transport.clone();
        let pending = tokio::spawn(async move {
            let offer = transport.create_offer().await?;
            transport.set_local_description(offer).await
        });
        mock.blocked(GatedOp::SetLocalDescription).await;
        assert!(mock.local_description().is_some());
        assert!(!pending.is_finished());

        mock.release(GatedOp::SetLocalDescription);
        pending.await.unwrap().unwrap();

        // Released operations no longer wait
        let offer = session.transport.create_offer().await.unwrap();
        session.transport.set_local_description(offer).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_close_fails_later_operations() {
        let factory = MockTransportFactory::new();
        let session = factory.open(&TransportConfig::default()).await.unwrap();
        session.transport.close().await.unwrap();
        session.transport.close().await.unwrap();

        assert_eq!(
            session.transport.create_offer().await.unwrap_err(),
            TransportError::Closed
        );
        assert_eq!(factory.last().unwrap().close_count(), 1);
        assert_eq!(
            session.transport.connection_state(),
            ConnectionState::Closed
        );
    }
}
