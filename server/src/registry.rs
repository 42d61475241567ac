//! Process-wide index of live meeting drivers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::meeting::{Meeting, MeetingError, MeetingHandle};

/// Queued removals of stopped meetings.
const REMOVAL_QUEUE: usize = 10;

pub struct Registry {
    meetings: RwLock<HashMap<i32, MeetingHandle>>,
    removals: mpsc::Sender<i32>,
    db_url: String,
}

impl Registry {
    /// Create the registry and start its removal worker.
    pub fn new(db_url: String) -> Arc<Self> {
        let (removals_tx, removals_rx) = mpsc::channel(REMOVAL_QUEUE);
        let registry = Arc::new(Self {
            meetings: RwLock::new(HashMap::new()),
            removals: removals_tx,
            db_url,
        });
        tokio::spawn(Self::remover(registry.clone(), removals_rx));
        registry
    }

    /// Return the live driver for a meeting, starting one if needed.
    ///
    /// Bringing a meeting up costs a database round-trip, which dwarfs the
    /// cost of serializing construction: the write lock is held while
    /// building, so two racing connects can never both open a handle.
    pub async fn ensure_and_get(&self, meeting_id: i32) -> Result<MeetingHandle, MeetingError> {
        if let Some(handle) = self.meetings.read().await.get(&meeting_id) {
            return Ok(handle.clone());
        }

        let mut meetings = self.meetings.write().await;
        if let Some(handle) = meetings.get(&meeting_id) {
            return Ok(handle.clone());
        }

        let (meeting, inbox, handle) =
            Meeting::new(meeting_id, &self.db_url, self.removals.clone()).await?;
        meetings.insert(meeting_id, handle.clone());
        tokio::spawn(meeting.run(inbox));
        tracing::info!(meeting = meeting_id, "started meeting");
        Ok(handle)
    }

    /// Handles of all live meetings, for status reporting.
    pub async fn live_meetings(&self) -> Vec<MeetingHandle> {
        self.meetings.read().await.values().cloned().collect()
    }

    /// Drain the removal channel. A missing key only means the meeting has
    /// already been removed.
    async fn remover(registry: Arc<Self>, mut removals: mpsc::Receiver<i32>) {
        while let Some(meeting_id) = removals.recv().await {
            let mut meetings = registry.meetings.write().await;
            if meetings.remove(&meeting_id).is_some() {
                tracing::info!(meeting = meeting_id, "removing meeting");
            }
        }
    }
}
