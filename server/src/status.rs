//! Diagnostic status endpoint.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::state::AppState;

/// One attendee as reported by `/__meetingstatus`.
#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub uid: i32,
    pub name: String,
    pub admin: bool,
    pub remote: String,
}

/// One live meeting as reported by `/__meetingstatus`. Both member lists
/// serialize as `[]` when empty, never as null.
#[derive(Debug, Clone, Serialize)]
pub struct MeetingStatus {
    pub id: i32,
    pub state: String,
    pub members: Vec<MemberStatus>,
    #[serde(rename = "disconnectedmembers")]
    pub disconnected_members: Vec<MemberStatus>,
}

#[derive(Debug, Serialize)]
struct RuntimeStatus {
    cpus: usize,
    version: &'static str,
    pid: u32,
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    upsince: DateTime<Utc>,
    timestamp: DateTime<Utc>,
    runtime: RuntimeStatus,
    meetings: Vec<MeetingStatus>,
}

/// GET /__meetingstatus
///
/// Snapshot of every live meeting, gathered by asking each driver over
/// its status channel.
pub async fn meeting_status(State(state): State<AppState>) -> Json<ServerStatus> {
    let mut meetings = Vec::new();
    for handle in state.registry.live_meetings().await {
        let (reply_tx, reply_rx) = oneshot::channel();
        // A driver that stopped between the snapshot and the query just
        // drops out of the report.
        if handle.status.send(reply_tx).await.is_err() {
            continue;
        }
        if let Ok(status) = reply_rx.await {
            meetings.push(status);
        }
    }

    Json(ServerStatus {
        upsince: state.started_at,
        timestamp: Utc::now(),
        runtime: RuntimeStatus {
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
        },
        meetings,
    })
}
