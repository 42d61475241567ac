//! Socket upgrade endpoint for meeting attendees.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use crate::meeting::MeetingHandle;
use crate::state::AppState;
use crate::ws::session::{self, Session};
use crate::ws::ClientAddr;

/// Largest inbound frame accepted from a client.
const MAX_INBOUND_BYTES: usize = 10_240;
/// Membership keys are 54 URL-safe characters.
const TOKEN_LENGTH: usize = 54;

/// GET /ws/meeting/{meetingid}/{token}/{firstmessage}
///
/// Anything that does not look exactly like a meeting URL, including a
/// meeting the registry refuses to bring up, is answered with a plain
/// 404. Once the upgrade happens, all further errors travel as socket
/// messages.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path((meeting_id, token, first_message)): Path<(String, String, String)>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<ClientAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(meeting_id) = meeting_id.parse::<i32>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(first_message) = first_message.parse::<i32>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !valid_token(&token) {
        return StatusCode::NOT_FOUND.into_response();
    }

    if !origin_allowed(&state.config.origin, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let meeting = match state.registry.ensure_and_get(meeting_id).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::debug!(meeting = meeting_id, error = %err, "refusing socket for meeting");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let remote = if state.config.behindproxy {
        let forwarder = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        format!("{} ({})", forwarder, peer.0)
    } else {
        peer.0.clone()
    };

    ws.max_message_size(MAX_INBOUND_BYTES)
        .on_upgrade(move |socket| serve_session(socket, meeting, token, first_message, remote))
}

/// Start the session workers and hand the session to the meeting driver,
/// which performs the membership check.
async fn serve_session(
    socket: WebSocket,
    meeting: MeetingHandle,
    token: String,
    first_message: i32,
    remote: String,
) {
    let (sink, stream) = socket.split();
    let (session, receivers) = Session::new(meeting.clone(), token, first_message, remote);

    tokio::spawn(session::run_writer(session.clone(), sink, receivers));
    tokio::spawn(session::run_reader(session.clone(), stream));

    let _ = meeting.register.send(session).await;
}

fn valid_token(token: &str) -> bool {
    token.len() == TOKEN_LENGTH
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn origin_allowed(configured: &str, headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|value| value.to_str().ok()) else {
        tracing::info!("allowing connection with empty origin");
        return true;
    };
    if configured == "*" {
        tracing::debug!(origin, "allowing origin, all origins are allowed");
        return true;
    }
    configured == origin
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_must_be_54_url_safe_characters() {
        let good = "a".repeat(26) + &"B".repeat(26) + "_-";
        assert_eq!(good.len(), 54);
        assert!(valid_token(&good));

        assert!(!valid_token(&"a".repeat(53)));
        assert!(!valid_token(&"a".repeat(55)));
        let with_space = "a".repeat(53) + " ";
        assert!(!valid_token(&with_space));
        let with_slash = "a".repeat(53) + "/";
        assert!(!valid_token(&with_slash));
    }

    #[test]
    fn origin_rules() {
        let mut headers = HeaderMap::new();
        assert!(origin_allowed("https://example.org", &headers), "no origin is allowed");

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://example.org"));
        assert!(origin_allowed("https://example.org", &headers));
        assert!(origin_allowed("*", &headers));
        assert!(!origin_allowed("https://other.example", &headers));
    }
}
