//! Media stream tracking
//!
//! Local streams are what a participant sends; remote streams are what the
//! transport reports through inbound track events. Each distinct remote
//! stream gets exactly one entry in the [`StreamRegistry`] and one
//! presentation surface, for as long as the call that received it stays
//! connected.
//!
//! # Architecture
//!
//! - [`StreamRegistry`] - process-scoped, shared by every call of a service;
//!   deduplicates remote streams per receiving call, so two calls whose
//!   peers pick the same stream id each keep their own entry
//! - [`Presenter`] - seam to whatever renders streams (a DOM, a terminal UI)
//! - [`SurfaceBoard`] - in-memory presenter that keeps the attached surfaces
//!   and broadcasts [`MediaEvent`]s

use crate::identity::PeerId;
use crate::types::{CallId, MediaKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Stream identity as reported by the transport (the `msid` stream id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    /// Create a stream identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote stream as received by one call
///
/// Stream ids are picked by the sending peer, so only the pair identifies a
/// stream within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    /// Call that received the stream
    pub owner: CallId,
    /// Stream id within that call
    pub stream_id: StreamId,
}

impl StreamKey {
    /// Key for `stream_id` received by `owner`
    pub fn new(owner: CallId, stream_id: impl Into<StreamId>) -> Self {
        Self {
            owner,
            stream_id: stream_id.into(),
        }
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.stream_id)
    }
}

/// Track captured locally and offered for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: MediaKind,
}

impl LocalTrack {
    /// Audio track
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Audio,
        }
    }

    /// Video track
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Video,
        }
    }
}

/// Group of local tracks sent together (camera + microphone)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    /// Stream identifier
    pub id: StreamId,
    /// Tracks in the stream
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Create an empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: StreamId::new(id),
            tracks: Vec::new(),
        }
    }

    /// Add a track
    #[must_use]
    pub fn with_track(mut self, track: LocalTrack) -> Self {
        self.tracks.push(track);
        self
    }
}

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: MediaKind,
}

/// Stream received from the remote peer, with all tracks known so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream identity
    pub id: StreamId,
    /// Tracks belonging to the stream
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }

    /// Surface kind needed to present this stream
    pub fn presentation_kind(&self) -> MediaKind {
        if self.has_video() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }
}

/// Inbound track event delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTrackEvent {
    /// The track that started
    pub track: RemoteTrack,
    /// Streams the track belongs to; the first one is presented
    pub streams: Vec<RemoteStream>,
}

/// Presentable surface bound to one remote stream
///
/// The `<audio>`/`<video>` element equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceHandle {
    /// Surface identifier (`"x" + peer id`)
    pub id: String,
    /// Call whose transport delivered the stream
    pub owner: CallId,
    /// Stream rendered by the surface
    pub stream_id: StreamId,
    /// Audio or video surface
    pub kind: MediaKind,
}

impl SurfaceHandle {
    /// Stream this surface renders
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.owner, self.stream_id.clone())
    }
}

/// Registry entry for one remote stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Surface presenting the stream
    pub surface: SurfaceHandle,
    /// Peer that sent it
    pub peer: PeerId,
    /// When the stream was first seen
    pub registered_at: DateTime<Utc>,
}

impl StreamEntry {
    /// Call that received the stream
    pub fn owner(&self) -> CallId {
        self.surface.owner
    }

    /// Stream id as sent by the peer
    pub fn stream_id(&self) -> &StreamId {
        &self.surface.stream_id
    }

    /// Registry key
    pub fn key(&self) -> StreamKey {
        self.surface.key()
    }

    /// Audio or video
    pub fn kind(&self) -> MediaKind {
        self.surface.kind
    }
}

/// Deduplicating registry of remote streams
///
/// One instance is shared by every call of a service. Entries are keyed by
/// [`StreamKey`]: the same stream id arriving on two calls is two streams.
/// Clones share the same entries. Registration and removal are serialized
/// by an internal mutex, since calls deliver transport events from their own
/// tasks.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    entries: Arc<Mutex<HashMap<StreamKey, StreamEntry>>>,
}

impl StreamRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stream` for `owner` unless `owner` already registered it
    ///
    /// Returns the new entry, or `None` when the stream was registered
    /// before (redundant track events for one stream are expected).
    pub fn register(
        &self,
        owner: CallId,
        peer: &PeerId,
        surface_id: String,
        stream: &RemoteStream,
    ) -> Option<StreamEntry> {
        let key = StreamKey::new(owner, stream.id.clone());
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            tracing::trace!(stream = %key, "Stream already registered");
            return None;
        }

        let entry = StreamEntry {
            surface: SurfaceHandle {
                id: surface_id,
                owner,
                stream_id: stream.id.clone(),
                kind: stream.presentation_kind(),
            },
            peer: peer.clone(),
            registered_at: Utc::now(),
        };
        entries.insert(key, entry.clone());
        Some(entry)
    }

    /// Remove one stream; `None` if it was already gone
    pub fn remove(&self, key: &StreamKey) -> Option<StreamEntry> {
        self.entries.lock().remove(key)
    }

    /// Remove every stream received by `owner`
    pub fn remove_owned_by(&self, owner: CallId) -> Vec<StreamEntry> {
        let mut entries = self.entries.lock();
        let keys: Vec<StreamKey> = entries
            .keys()
            .filter(|k| k.owner == owner)
            .cloned()
            .collect();
        keys.iter().filter_map(|k| entries.remove(k)).collect()
    }

    /// Whether `key` is registered
    pub fn contains(&self, key: &StreamKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Look up an entry
    pub fn get(&self, key: &StreamKey) -> Option<StreamEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Snapshot of all entries, oldest first
    pub fn entries(&self) -> Vec<StreamEntry> {
        let mut all: Vec<StreamEntry> = self.entries.lock().values().cloned().collect();
        all.sort_by_key(|e| e.registered_at);
        all
    }

    /// Number of registered streams
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry, returning what was removed
    pub fn clear(&self) -> Vec<StreamEntry> {
        self.entries.lock().drain().map(|(_, e)| e).collect()
    }
}

/// Renders remote streams
pub trait Presenter: Send + Sync {
    /// Create and show a surface
    fn attach(&self, surface: &SurfaceHandle);

    /// Remove a surface
    ///
    /// Returns `false` if the surface was not attached; removing twice is a
    /// no-op.
    fn detach(&self, surface: &SurfaceHandle) -> bool;
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Surface created for a remote stream
    SurfaceAttached {
        /// The surface
        surface: SurfaceHandle,
    },
    /// Surface removed
    SurfaceDetached {
        /// The surface
        surface: SurfaceHandle,
    },
}

/// In-memory presenter
///
/// Holds the attached surfaces keyed by stream, the way a document body
/// holds its media elements.
pub struct SurfaceBoard {
    surfaces: Mutex<HashMap<StreamKey, SurfaceHandle>>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl SurfaceBoard {
    /// Create an empty board
    #[must_use]
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            surfaces: Mutex::new(HashMap::new()),
            event_sender,
        }
    }

    /// Attached surfaces
    pub fn surfaces(&self) -> Vec<SurfaceHandle> {
        self.surfaces.lock().values().cloned().collect()
    }

    /// Whether a surface for `key` is attached
    pub fn contains(&self, key: &StreamKey) -> bool {
        self.surfaces.lock().contains_key(key)
    }

    /// Attached surface with identifier `id` (`"x" + peer id`)
    pub fn surface(&self, id: &str) -> Option<SurfaceHandle> {
        self.surfaces.lock().values().find(|s| s.id == id).cloned()
    }

    /// Number of attached surfaces
    pub fn len(&self) -> usize {
        self.surfaces.lock().len()
    }

    /// Whether no surface is attached
    pub fn is_empty(&self) -> bool {
        self.surfaces.lock().is_empty()
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for SurfaceBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter for SurfaceBoard {
    fn attach(&self, surface: &SurfaceHandle) {
        tracing::info!(
            surface_id = %surface.id,
            stream_id = %surface.stream_id,
            kind = %surface.kind,
            "Attaching surface"
        );
        self.surfaces.lock().insert(surface.key(), surface.clone());
        let _ = self.event_sender.send(MediaEvent::SurfaceAttached {
            surface: surface.clone(),
        });
    }

    fn detach(&self, surface: &SurfaceHandle) -> bool {
        let removed = self.surfaces.lock().remove(&surface.key());
        match removed {
            Some(surface) => {
                tracing::info!(surface_id = %surface.id, stream_id = %surface.stream_id, "Detached surface");
                let _ = self
                    .event_sender
                    .send(MediaEvent::SurfaceDetached { surface });
                true
            }
            None => false,
        }
    }
}
