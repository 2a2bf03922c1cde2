//! Call service orchestration
//!
//! A [`CallService`] is one local participant: it owns the shared stream
//! registry, keeps at most one call per remote peer and routes inbound
//! signaling messages to the right call.

use crate::call::{
    Call, CallContext, CallError, CallEvent, IncomingCall, Negotiate, OutgoingCall,
};
use crate::identity::PeerId;
use crate::media::{LocalStream, Presenter, StreamEntry, StreamRegistry};
use crate::signaling::{
    IceCandidateMessage, InboundSignal, NegotiationMessage, SignalingError, SignalingHandler,
};
use crate::transport::{TransportConfig, TransportFactory};
use crate::types::CallId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Too many calls in progress
    #[error("Call limit reached ({0} concurrent calls)")]
    CallLimitReached(usize),
}

/// Call service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallServiceConfig {
    /// Maximum concurrent calls
    pub max_concurrent_calls: usize,
    /// Configuration for every transport the service opens
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for CallServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            transport: TransportConfig::default(),
        }
    }
}

/// One local participant's calls
pub struct CallService {
    self_id: PeerId,
    ctx: CallContext,
    config: CallServiceConfig,
    calls: RwLock<HashMap<PeerId, Arc<Call>>>,
}

impl CallService {
    /// Create a service for `self_id`
    pub fn new(
        self_id: impl Into<PeerId>,
        factory: Arc<dyn TransportFactory>,
        signaling: SignalingHandler,
        presenter: Arc<dyn Presenter>,
        config: CallServiceConfig,
    ) -> Self {
        let ctx = CallContext::new(factory, signaling, StreamRegistry::new(), presenter)
            .with_transport_config(config.transport.clone());
        Self {
            self_id: self_id.into(),
            ctx,
            config,
            calls: RwLock::new(HashMap::new()),
        }
    }

    /// Local participant
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Service configuration
    pub fn config(&self) -> &CallServiceConfig {
        &self.config
    }

    /// Streams received by every call of this service
    pub fn registry(&self) -> &StreamRegistry {
        self.ctx.registry()
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.ctx.subscribe_events()
    }

    /// Number of calls that are still open
    pub async fn call_count(&self) -> usize {
        self.calls
            .read()
            .await
            .values()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Current open call with `peer`, if any
    ///
    /// Calls torn down by their transport are not returned.
    pub async fn call(&self, peer: &PeerId) -> Option<Arc<Call>> {
        self.calls
            .read()
            .await
            .get(peer)
            .filter(|call| !call.is_closed())
            .cloned()
    }

    /// Call `peer`, optionally sending `local`, and emit the offer
    ///
    /// # Errors
    ///
    /// Returns error if the call limit is reached, negotiation fails or the
    /// offer cannot be delivered
    #[tracing::instrument(skip(self, local), fields(from = %self.self_id))]
    pub async fn place_call(
        &self,
        peer: PeerId,
        local: Option<&LocalStream>,
    ) -> Result<CallId, ServiceError> {
        self.check_capacity(&peer).await?;

        let call = OutgoingCall::new(self.self_id.clone(), peer.clone(), &self.ctx).await?;
        let prepared = async {
            if let Some(stream) = local {
                call.add_stream(stream).await?;
            }
            call.offer().await
        }
        .await;
        let offer = match prepared {
            Ok(offer) => offer,
            Err(e) => {
                call.close().await;
                return Err(e.into());
            }
        };

        // Registered before the offer leaves so the answer always finds it
        let call_id = call.id();
        self.insert(peer.clone(), Call::Outgoing(call)).await;
        if let Err(e) = self.ctx.signaling().send_offer(&offer).await {
            self.discard(&peer, call_id).await;
            return Err(e.into());
        }
        tracing::info!(call_id = %call_id, "Call placed");
        Ok(call_id)
    }

    /// Answer an offer, optionally sending `local`, and emit the answer
    ///
    /// An offer from a peer that already has a call replaces that call.
    ///
    /// # Errors
    ///
    /// Returns error if the call limit is reached, negotiation fails or the
    /// answer cannot be delivered
    #[tracing::instrument(skip(self, offer, local), fields(from = %offer.from))]
    pub async fn handle_offer(
        &self,
        offer: NegotiationMessage,
        local: Option<&LocalStream>,
    ) -> Result<NegotiationMessage, ServiceError> {
        let peer = offer.from.clone();
        self.check_capacity(&peer).await?;

        let call = IncomingCall::new(self.self_id.clone(), peer.clone(), &self.ctx).await?;
        let prepared = async {
            if let Some(stream) = local {
                call.add_stream(stream).await?;
            }
            call.accept(offer).await
        }
        .await;
        let answer = match prepared {
            Ok(answer) => answer,
            Err(e) => {
                call.close().await;
                return Err(e.into());
            }
        };

        let call_id = call.id();
        self.insert(peer.clone(), Call::Incoming(call)).await;
        if let Err(e) = self.ctx.signaling().send_answer(&answer).await {
            self.discard(&peer, call_id).await;
            return Err(e.into());
        }
        tracing::info!(call_id = %call_id, "Offer answered");
        Ok(answer)
    }

    /// Apply the answer to the call placed to its sender
    ///
    /// # Errors
    ///
    /// Returns error if there is no call with the sender or the answer is
    /// out of order
    #[tracing::instrument(skip(self, answer), fields(from = %answer.from))]
    pub async fn handle_answer(&self, answer: NegotiationMessage) -> Result<(), ServiceError> {
        let call = self.require_call(&answer.from).await?;
        call.handle_remote(answer).await?;
        Ok(())
    }

    /// Forward a trickled candidate to the call with its sender
    ///
    /// # Errors
    ///
    /// Returns error if there is no call with the sender or the transport
    /// rejects the candidate
    #[tracing::instrument(skip(self, message), fields(from = %message.from))]
    pub async fn handle_candidate(&self, message: IceCandidateMessage) -> Result<(), ServiceError> {
        let call = self.require_call(&message.from).await?;
        call.add_remote_candidate(message.candidate).await?;
        Ok(())
    }

    /// Route one inbound `(topic, payload)` pair
    ///
    /// Messages addressed to someone else are ignored. Offers are answered
    /// without local media.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be decoded or handling it fails
    pub async fn dispatch(&self, topic: &str, payload: &str) -> Result<(), ServiceError> {
        let signal = InboundSignal::decode(topic, payload)?;
        if signal.to() != &self.self_id {
            tracing::debug!(topic, to = %signal.to(), "Ignoring message for another participant");
            return Ok(());
        }

        match signal {
            InboundSignal::Offer(offer) => self.handle_offer(offer, None).await.map(|_| ()),
            InboundSignal::Answer(answer) => self.handle_answer(answer).await,
            InboundSignal::IceCandidate(message) => self.handle_candidate(message).await,
        }
    }

    /// Dispatch messages from `inbound` until it closes
    ///
    /// Failures are logged and do not stop the loop.
    pub async fn serve(&self, mut inbound: mpsc::UnboundedReceiver<(String, String)>) {
        while let Some((topic, payload)) = inbound.recv().await {
            if let Err(e) = self.dispatch(&topic, &payload).await {
                tracing::warn!(self_id = %self.self_id, topic = %topic, error = %e, "Failed to handle signaling message");
            }
        }
        tracing::debug!(self_id = %self.self_id, "Signaling inbound closed");
    }

    /// Close and forget the call with `peer`
    ///
    /// # Errors
    ///
    /// Returns error if there is no call with `peer`
    #[tracing::instrument(skip(self))]
    pub async fn hang_up(&self, peer: &PeerId) -> Result<(), ServiceError> {
        let call = self
            .calls
            .write()
            .await
            .remove(peer)
            .ok_or_else(|| CallError::CallNotFound(peer.to_string()))?;
        call.close().await;
        Ok(())
    }

    /// Close every call and clear the stream registry
    ///
    /// Returns the entries that were still registered.
    #[tracing::instrument(skip(self), fields(self_id = %self.self_id))]
    pub async fn shutdown(&self) -> Vec<StreamEntry> {
        let calls: Vec<Arc<Call>> = self.calls.write().await.drain().map(|(_, c)| c).collect();
        tracing::info!(calls = calls.len(), "Shutting down call service");
        futures::future::join_all(calls.iter().map(|call| call.close())).await;

        let leftover = self.ctx.registry().clear();
        for entry in &leftover {
            self.ctx.presenter().detach(&entry.surface);
        }
        leftover
    }

    async fn check_capacity(&self, replacing: &PeerId) -> Result<(), ServiceError> {
        let calls = self.calls.read().await;
        let active = calls
            .iter()
            .filter(|(peer, call)| *peer != replacing && !call.is_closed())
            .count();
        if active >= self.config.max_concurrent_calls {
            tracing::warn!(
                active,
                max = self.config.max_concurrent_calls,
                "Maximum concurrent calls reached"
            );
            return Err(ServiceError::CallLimitReached(
                self.config.max_concurrent_calls,
            ));
        }
        Ok(())
    }

    async fn insert(&self, peer: PeerId, call: Call) {
        let previous = {
            let mut calls = self.calls.write().await;
            calls.retain(|_, existing| !existing.is_closed());
            calls.insert(peer, Arc::new(call))
        };
        if let Some(previous) = previous {
            tracing::debug!(call_id = %previous.id(), "Replacing existing call");
            previous.close().await;
        }
    }

    /// Remove and close the call with `peer` if it is still `call_id`
    async fn discard(&self, peer: &PeerId, call_id: CallId) {
        let removed = {
            let mut calls = self.calls.write().await;
            match calls.get(peer) {
                Some(call) if call.id() == call_id => calls.remove(peer),
                _ => None,
            }
        };
        if let Some(call) = removed {
            call.close().await;
        }
    }

    async fn require_call(&self, peer: &PeerId) -> Result<Arc<Call>, CallError> {
        self.call(peer)
            .await
            .ok_or_else(|| CallError::CallNotFound(peer.to_string()))
    }
}
