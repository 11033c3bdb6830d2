//! Shared playout state
//!
//! The mix driver is the only writer. HTTP handlers read the latest status
//! snapshot and subscribe to the event broadcast for SSE.

use haze_common::events::{PlaybackState, PlaylistSummary, PlayoutEvent, PlayoutStatus};
use tokio::sync::{broadcast, RwLock};

/// Events buffered per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 100;

pub struct SharedState {
    /// Latest status snapshot, refreshed every mix tick
    pub status: RwLock<PlayoutStatus>,

    /// Playlists of the current set, refreshed on reload
    pub playlists: RwLock<Vec<PlaylistSummary>>,

    /// Event broadcaster for SSE events
    pub event_tx: broadcast::Sender<PlayoutEvent>,
}

impl SharedState {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            status: RwLock::new(PlayoutStatus::default()),
            playlists: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// Broadcast an event to all SSE listeners
    pub fn broadcast_event(&self, event: PlayoutEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayoutEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get_status(&self) -> PlayoutStatus {
        self.status.read().await.clone()
    }

    pub async fn set_status(&self, status: PlayoutStatus) {
        *self.status.write().await = status;
    }

    pub async fn get_playback_state(&self) -> PlaybackState {
        self.status.read().await.state
    }

    pub async fn get_playlists(&self) -> Vec<PlaylistSummary> {
        self.playlists.read().await.clone()
    }

    pub async fn set_playlists(&self, playlists: Vec<PlaylistSummary>) {
        *self.playlists.write().await = playlists;
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
