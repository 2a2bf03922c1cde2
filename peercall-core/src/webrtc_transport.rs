//! Peer transport backed by `webrtc-rs`
//!
//! Each session wraps one [`RTCPeerConnection`]. Its callbacks only forward
//! into the session's event queue; everything else happens on the call's
//! own task.

use crate::media::{InboundTrackEvent, LocalStream, LocalTrack, RemoteStream, RemoteTrack, StreamId};
use crate::transport::{
    PeerTransport, TransportConfig, TransportError, TransportEvent, TransportFactory,
    TransportSession,
};
use crate::types::{ConnectionState, IceCandidate, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Opens [`WebRtcPeerTransport`] sessions
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    /// Build the media engine (default codecs and interceptors)
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Backend(format!("Failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                TransportError::Backend(format!("Failed to register interceptors: {e}"))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    #[tracing::instrument(skip(self, config), fields(ice_servers = config.ice_servers.len()))]
    async fn open(&self, config: &TransportConfig) -> Result<TransportSession, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| {
                    tracing::error!("Failed to create peer connection: {}", e);
                    TransportError::Backend(format!("Failed to create peer connection: {e}"))
                })?,
        );

        let (sender, events) = mpsc::unbounded_channel();
        install_handlers(&pc, sender);
        tracing::debug!("Created peer connection");

        Ok(TransportSession {
            transport: Arc::new(WebRtcPeerTransport {
                pc,
                local_tracks: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            events,
        })
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, sender: mpsc::UnboundedSender<TransportEvent>) {
    let events = sender.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = events.clone();
        Box::pin(async move {
            let candidate = match candidate.map(|c| c.to_json()).transpose() {
                Ok(candidate) => candidate.map(from_rtc_candidate),
                Err(e) => {
                    tracing::warn!("Dropping unserializable local candidate: {}", e);
                    return;
                }
            };
            let _ = events.send(TransportEvent::IceCandidate(candidate));
        })
    }));

    let events = sender.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::ConnectionStateChanged(connection_state(
                state,
            )));
        })
    }));

    let weak = Arc::downgrade(pc);
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = sender.clone();
        let pc = weak.clone();
        Box::pin(async move {
            let event = inbound_track_event(&track, &pc).await;
            let _ = events.send(TransportEvent::Track(event));
        })
    }));
}

async fn inbound_track_event(
    track: &Arc<TrackRemote>,
    pc: &Weak<RTCPeerConnection>,
) -> InboundTrackEvent {
    let stream_id = track.stream_id();
    let remote = RemoteTrack {
        id: track.id(),
        kind: media_kind(track.kind()),
    };
    if stream_id.is_empty() {
        return InboundTrackEvent {
            track: remote,
            streams: Vec::new(),
        };
    }

    // A stream is every track sharing its msid, not just the one that fired
    let mut tracks = vec![remote.clone()];
    if let Some(pc) = pc.upgrade() {
        for receiver in pc.get_receivers().await {
            for other in receiver.tracks().await {
                if other.stream_id() == stream_id && other.id() != remote.id {
                    tracks.push(RemoteTrack {
                        id: other.id(),
                        kind: media_kind(other.kind()),
                    });
                }
            }
        }
    }

    InboundTrackEvent {
        track: remote,
        streams: vec![RemoteStream {
            id: StreamId::new(stream_id),
            tracks,
        }],
    }
}

/// Peer connection session
pub struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    closed: AtomicBool,
}

impl WebRtcPeerTransport {
    /// Sample writer for an attached local track
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(track_id).cloned()
    }

    /// The wrapped peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| classify(e, TransportError::Description))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| classify(e, TransportError::Description))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| classify(e, TransportError::Description))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| classify(e, TransportError::Description))
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        // An empty init is the end-of-candidates marker
        let init = candidate.map(to_rtc_candidate).unwrap_or_default();
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| classify(e, TransportError::Candidate))
    }

    async fn add_track(
        &self,
        track: &LocalTrack,
        stream: &LocalStream,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let mime_type = match track.kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            track.id.clone(),
            stream.id.to_string(),
        ));

        let local: Arc<dyn TrackLocal + Send + Sync> = sample_track.clone();
        self.pc
            .add_track(local)
            .await
            .map_err(|e| classify(e, TransportError::Track))?;

        tracing::debug!(track_id = %track.id, codec = mime_type, "Added local track");
        self.local_tracks
            .lock()
            .insert(track.id.clone(), sample_track);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.local_tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.ice_connection_state())
    }
}

fn classify(err: webrtc::Error, wrap: fn(String) -> TransportError) -> TransportError {
    match err {
        webrtc::Error::ErrConnectionClosed => TransportError::Closed,
        other => wrap(other.to_string()),
    }
}

fn connection_state(state: RTCIceConnectionState) -> ConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => ConnectionState::New,
        RTCIceConnectionState::Checking => ConnectionState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            ConnectionState::Connected
        }
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
    }
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Video => MediaKind::Video,
        _ => MediaKind::Audio,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(TransportError::Description(
                "rollback is not supported".to_string(),
            ))
        }
    };
    parsed.map_err(|e| TransportError::Description(e.to_string()))
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Description(
                "description without a type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_completed_counts_as_connected() {
        assert_eq!(
            connection_state(RTCIceConnectionState::Completed),
            ConnectionState::Connected
        );
        assert_eq!(
            connection_state(RTCIceConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn test_rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            to_rtc_description(desc),
            Err(TransportError::Description(_))
        ));
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".to_string()),
        };
        assert_eq!(
            from_rtc_candidate(to_rtc_candidate(candidate.clone())),
            candidate
        );
    }

    #[tokio::test]
    async fn test_factory_opens_session() {
        let factory = WebRtcTransportFactory::new().unwrap();
        let session = factory.open(&TransportConfig::default()).await.unwrap();
        assert_eq!(session.transport.connection_state(), ConnectionState::New);
        session.transport.close().await.unwrap();
    }
}
