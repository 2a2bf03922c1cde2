//! Negotiation against real peer connections
//!
//! Both sides run in-process with no ICE servers configured, so only the
//! offer/answer exchange is exercised; connectivity is not awaited.

#![cfg(feature = "webrtc-backend")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use peercall_core::signaling::TOPIC_ICE_CANDIDATE;
use peercall_core::{
    CallContext, CallError, ChannelSignaling, IceCandidateMessage, IncomingCall, LocalStream,
    LocalTrack, Negotiate, NegotiationMessage, NegotiationState, OutgoingCall, PeerId,
    SessionDescription, SignalingHandler, StreamRegistry, SurfaceBoard, TransportConfig,
    WebRtcTransportFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn context() -> (CallContext, mpsc::UnboundedReceiver<(String, String)>) {
    let factory = WebRtcTransportFactory::new().expect("media engine");
    let (channel, outbound) = ChannelSignaling::new();
    let ctx = CallContext::new(
        Arc::new(factory),
        SignalingHandler::new(Arc::new(channel)),
        StreamRegistry::new(),
        Arc::new(SurfaceBoard::new()),
    )
    .with_transport_config(TransportConfig {
        ice_servers: Vec::new(),
    });
    (ctx, outbound)
}

#[tokio::test]
async fn test_offer_answer_between_peer_connections() {
    let (alice_ctx, _alice_out) = context();
    let (bob_ctx, _bob_out) = context();

    let alice = OutgoingCall::new("alice", "bob", &alice_ctx).await.unwrap();
    let bob = IncomingCall::new("bob", "alice", &bob_ctx).await.unwrap();

    let local = LocalStream::new("alice-cam").with_track(LocalTrack::audio("alice-mic"));
    alice.add_stream(&local).await.unwrap();

    let offer = alice.offer().await.unwrap();
    assert!(offer.desc.sdp.starts_with("v=0"));
    assert!(offer.desc.sdp.contains("m=audio"));

    let answer = bob.accept(offer).await.unwrap();
    assert_eq!(answer.to, PeerId::new("alice"));
    assert_eq!(answer.from, PeerId::new("bob"));
    assert!(answer.desc.is_answer());

    alice.accept(answer).await.unwrap();
    assert_eq!(alice.state(), NegotiationState::HasRemote);
    assert_eq!(bob.state(), NegotiationState::HasLocal);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_gathering_ends_with_null_candidate() {
    let (alice_ctx, mut alice_out) = context();
    let alice = OutgoingCall::new("alice", "bob", &alice_ctx).await.unwrap();
    let local = LocalStream::new("alice-cam").with_track(LocalTrack::audio("alice-mic"));
    alice.add_stream(&local).await.unwrap();
    alice.offer().await.unwrap();

    let end = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (topic, payload) = alice_out.recv().await.unwrap();
            assert_eq!(topic, TOPIC_ICE_CANDIDATE);
            let message: IceCandidateMessage = serde_json::from_str(&payload).unwrap();
            assert_eq!(message.to, PeerId::new("bob"));
            if message.is_end_of_candidates() {
                return message;
            }
        }
    })
    .await
    .expect("gathering never completed");
    assert!(end.candidate.is_none());

    alice.close().await;
}

#[tokio::test]
async fn test_malformed_offer_is_negotiation_error() {
    let (bob_ctx, _bob_out) = context();
    let bob = IncomingCall::new("bob", "alice", &bob_ctx).await.unwrap();

    let err = bob
        .accept(NegotiationMessage {
            from: PeerId::new("alice"),
            to: PeerId::new("bob"),
            desc: SessionDescription::offer("this is not sdp"),
        })
        .await
        .unwrap_err();

    assert!(err.is_negotiation(), "unexpected error {err:?}");
    assert_eq!(bob.state(), NegotiationState::PendingRemote);
    bob.close().await;
}

#[tokio::test]
async fn test_closed_call_rejects_offer() {
    let (alice_ctx, _alice_out) = context();
    let alice = OutgoingCall::new("alice", "bob", &alice_ctx).await.unwrap();
    alice.close().await;

    assert_eq!(alice.offer().await.unwrap_err(), CallError::TransportClosed);
    let local = LocalStream::new("late").with_track(LocalTrack::video("cam"));
    assert_eq!(
        alice.add_stream(&local).await.unwrap_err(),
        CallError::TransportClosed
    );
}
