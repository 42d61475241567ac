//! Wire message shapes for the meeting socket.
//!
//! Everything on the wire is a JSON object. Outbound traffic is an
//! envelope `{"type": ..., "data": ...}` except errors, which are
//! `{"type":"error","msg": ...}`. Inbound traffic is decoded manually so
//! each malformed field can be answered with its own diagnostic.

use chrono::Local;
use serde::Serialize;
use serde_json::Value;

/// One entry of the chat log as seen on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: i32,
    pub time: String,
    pub date: String,
    pub from: i64,
    #[serde(rename = "fromname")]
    pub from_name: String,
    pub color: String,
    pub message: String,
}

/// One attendee as seen in `users`/`adduser`/`removeuser` payloads.
#[derive(Debug, Clone, Serialize)]
pub struct UserEntry {
    pub name: String,
    pub color: String,
    pub id: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserList {
    pub users: Vec<UserEntry>,
}

/// Lifecycle flags broadcast as the `status` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MeetingStateMsg {
    pub isopen: bool,
    pub isfinished: bool,
}

/// Snapshot of the active poll. `voted` is only filled in for admins.
#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub question: String,
    pub answers: Vec<String>,
    pub tally: [i32; 5],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voted: Option<Vec<i32>>,
}

/// Typed outbound envelope: `{"type": <kind>, "data": <payload>}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    #[serde(rename = "message")]
    Message(ChatMessage),
    #[serde(rename = "messages")]
    Messages(Vec<ChatMessage>),
    #[serde(rename = "adduser")]
    AddUser(UserEntry),
    #[serde(rename = "removeuser")]
    RemoveUser(UserEntry),
    #[serde(rename = "users")]
    Users(UserList),
    #[serde(rename = "status")]
    Status(MeetingStateMsg),
    #[serde(rename = "poll")]
    Poll(Option<PollStatus>),
    #[serde(rename = "disconnect")]
    Disconnect(ChatMessage),
}

/// The error envelope carries `msg` directly instead of a `data` object.
#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    #[serde(rename = "type")]
    kind: &'static str,
    pub msg: String,
}

/// Anything the server writes to a session socket.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Event(Event),
    Error(WireError),
}

impl Outbound {
    pub fn error(msg: impl Into<String>) -> Self {
        Outbound::Error(WireError {
            kind: "error",
            msg: msg.into(),
        })
    }

    /// Synthetic final message written right before the server closes a
    /// session: a system chat record carrying the reason.
    pub fn disconnect(reason: &str) -> Self {
        let now = Local::now();
        Outbound::Event(Event::Disconnect(ChatMessage {
            id: -1,
            time: now.format("%H:%M:%S").to_string(),
            date: now.format("%Y-%m-%d").to_string(),
            from: -1,
            from_name: String::new(),
            color: String::new(),
            message: reason.to_string(),
        }))
    }
}

/// A decoded client command, not yet permission-checked.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message {
        message: String,
    },
    Vote {
        question: String,
        vote: i32,
    },
    Open,
    Finish,
    NewPoll {
        question: String,
        answers: Vec<String>,
        minutes: i64,
    },
    AbortPoll,
    Kick {
        user: i32,
        canrejoin: bool,
    },
}

/// Why an inbound message produced no command.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Logged server-side, nothing sent back.
    Ignored(String),
    /// Answered with an `error` envelope.
    Rejected(&'static str),
}

/// Decode one inbound JSON object into a command.
///
/// `Ok(None)` means the message was valid but carries nothing to forward
/// (an empty chat line). Malformed `message`/`vote` payloads are only
/// logged; malformed admin commands are reported back to the sender.
pub fn decode(value: &Value) -> Result<Option<Inbound>, DecodeError> {
    let Some(root) = value.as_object() else {
        return Err(DecodeError::Ignored(format!(
            "unable to get map from json object {value}"
        )));
    };
    let Some(kind) = root.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::Ignored(format!(
            "unable to get type from json object {value}"
        )));
    };

    match kind {
        "message" => {
            let Some(message) = root.get("message").and_then(Value::as_str) else {
                return Err(DecodeError::Ignored(
                    "malformatted json in message".to_string(),
                ));
            };
            let message = message.trim();
            if message.is_empty() {
                return Ok(None);
            }
            Ok(Some(Inbound::Message {
                message: message.to_string(),
            }))
        }
        "vote" => {
            let Some(question) = root.get("question").and_then(Value::as_str) else {
                return Err(DecodeError::Ignored("malformatted json in vote".to_string()));
            };
            let Some(vote) = root.get("vote").and_then(Value::as_f64) else {
                return Err(DecodeError::Ignored(
                    "malformatted vote json in vote".to_string(),
                ));
            };
            Ok(Some(Inbound::Vote {
                question: question.to_string(),
                vote: vote as i32,
            }))
        }
        "open" => Ok(Some(Inbound::Open)),
        "finish" => Ok(Some(Inbound::Finish)),
        "newpoll" => decode_new_poll(root).map(Some),
        "abortpoll" => Ok(Some(Inbound::AbortPoll)),
        "kick" => decode_kick(root).map(Some),
        other => Err(DecodeError::Ignored(format!("unknown message type {other}"))),
    }
}

fn decode_new_poll(root: &serde_json::Map<String, Value>) -> Result<Inbound, DecodeError> {
    let Some(question) = root.get("question").and_then(Value::as_str) else {
        return Err(DecodeError::Rejected("Invalid or no question"));
    };
    let Some(minutes) = root.get("minutes").and_then(Value::as_f64) else {
        return Err(DecodeError::Rejected("Invalid or no minutes"));
    };
    let Some(raw_answers) = root.get("answers").and_then(Value::as_array) else {
        return Err(DecodeError::Rejected("Invalid or no answers"));
    };
    if raw_answers.len() > 5 {
        return Err(DecodeError::Rejected("Too many answers"));
    }
    let mut answers = Vec::with_capacity(raw_answers.len());
    for answer in raw_answers {
        let Some(answer) = answer.as_str() else {
            return Err(DecodeError::Rejected("Invalid or unparsable answer"));
        };
        answers.push(answer.to_string());
    }
    Ok(Inbound::NewPoll {
        question: question.to_string(),
        answers,
        minutes: minutes as i64,
    })
}

fn decode_kick(root: &serde_json::Map<String, Value>) -> Result<Inbound, DecodeError> {
    let Some(user) = root.get("user").and_then(Value::as_f64) else {
        return Err(DecodeError::Rejected("Invalid user in json"));
    };
    let Some(canrejoin) = root.get("canrejoin").and_then(Value::as_bool) else {
        return Err(DecodeError::Rejected("Invalid canrejoin in json"));
    };
    Ok(Inbound::Kick {
        user: user as i32,
        canrejoin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_message_envelope_shape() {
        let event = Outbound::Event(Event::Message(ChatMessage {
            id: 7,
            time: "10:30:00".to_string(),
            date: "2026-08-02".to_string(),
            from: 12,
            from_name: "Ada".to_string(),
            color: "3".to_string(),
            message: "hi".to_string(),
        }));
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "message",
                "data": {
                    "id": 7, "time": "10:30:00", "date": "2026-08-02",
                    "from": 12, "fromname": "Ada", "color": "3", "message": "hi"
                }
            })
        );
    }

    #[test]
    fn error_envelope_has_no_data_object() {
        let encoded = serde_json::to_value(Outbound::error("Permission denied")).unwrap();
        assert_eq!(encoded, json!({"type": "error", "msg": "Permission denied"}));
    }

    #[test]
    fn disconnect_is_a_synthetic_system_message() {
        let Outbound::Event(Event::Disconnect(msg)) = Outbound::disconnect("bye") else {
            panic!("expected disconnect event");
        };
        assert_eq!(msg.id, -1);
        assert_eq!(msg.from, -1);
        assert!(msg.from_name.is_empty());
        assert_eq!(msg.message, "bye");
    }

    #[test]
    fn poll_status_hides_voters_from_non_admins() {
        let user_view = serde_json::to_value(Event::Poll(Some(PollStatus {
            question: "Q".to_string(),
            answers: vec!["a".to_string()],
            tally: [1, 0, 0, 0, 0],
            voted: None,
        })))
        .unwrap();
        assert!(user_view["data"].get("voted").is_none());

        let admin_view = serde_json::to_value(Event::Poll(Some(PollStatus {
            question: "Q".to_string(),
            answers: vec!["a".to_string()],
            tally: [1, 0, 0, 0, 0],
            voted: Some(vec![4]),
        })))
        .unwrap();
        assert_eq!(admin_view["data"]["voted"], json!([4]));
    }

    #[test]
    fn empty_user_list_serializes_as_empty_array() {
        let encoded = serde_json::to_value(Event::Users(UserList { users: vec![] })).unwrap();
        assert_eq!(encoded, json!({"type": "users", "data": {"users": []}}));
    }

    #[test]
    fn chat_text_is_trimmed() {
        let decoded = decode(&json!({"type": "message", "message": " hi "})).unwrap();
        assert_eq!(
            decoded,
            Some(Inbound::Message {
                message: "hi".to_string()
            })
        );
    }

    #[test]
    fn whitespace_only_chat_is_dropped() {
        assert_eq!(
            decode(&json!({"type": "message", "message": "   "})),
            Ok(None)
        );
    }

    #[test]
    fn malformed_chat_is_ignored_silently() {
        assert!(matches!(
            decode(&json!({"type": "message", "message": 3})),
            Err(DecodeError::Ignored(_))
        ));
        assert!(matches!(
            decode(&json!({"type": "vote", "question": "Q", "vote": "zero"})),
            Err(DecodeError::Ignored(_))
        ));
    }

    #[test]
    fn five_answers_accepted_six_rejected() {
        let five: Vec<&str> = vec!["a", "b", "c", "d", "e"];
        let decoded = decode(&json!({
            "type": "newpoll", "question": "Q", "minutes": 5, "answers": five
        }))
        .unwrap();
        assert!(
            matches!(decoded, Some(Inbound::NewPoll { ref answers, .. }) if answers.len() == 5)
        );

        let six: Vec<&str> = vec!["a", "b", "c", "d", "e", "f"];
        assert_eq!(
            decode(&json!({
                "type": "newpoll", "question": "Q", "minutes": 5, "answers": six
            })),
            Err(DecodeError::Rejected("Too many answers"))
        );
    }

    #[test]
    fn new_poll_field_diagnostics() {
        assert_eq!(
            decode(&json!({"type": "newpoll", "minutes": 5, "answers": ["a"]})),
            Err(DecodeError::Rejected("Invalid or no question"))
        );
        assert_eq!(
            decode(&json!({"type": "newpoll", "question": "Q", "answers": ["a"]})),
            Err(DecodeError::Rejected("Invalid or no minutes"))
        );
        assert_eq!(
            decode(&json!({"type": "newpoll", "question": "Q", "minutes": 5})),
            Err(DecodeError::Rejected("Invalid or no answers"))
        );
        assert_eq!(
            decode(&json!({"type": "newpoll", "question": "Q", "minutes": 5, "answers": ["a", 2]})),
            Err(DecodeError::Rejected("Invalid or unparsable answer"))
        );
    }

    #[test]
    fn kick_field_diagnostics() {
        assert_eq!(
            decode(&json!({"type": "kick", "canrejoin": true})),
            Err(DecodeError::Rejected("Invalid user in json"))
        );
        assert_eq!(
            decode(&json!({"type": "kick", "user": 3})),
            Err(DecodeError::Rejected("Invalid canrejoin in json"))
        );
        assert_eq!(
            decode(&json!({"type": "kick", "user": 3, "canrejoin": false})).unwrap(),
            Some(Inbound::Kick {
                user: 3,
                canrejoin: false
            })
        );
    }

    #[test]
    fn unknown_type_is_ignored() {
        assert!(matches!(
            decode(&json!({"type": "dance"})),
            Err(DecodeError::Ignored(_))
        ));
        assert!(matches!(decode(&json!(42)), Err(DecodeError::Ignored(_))));
    }
}
