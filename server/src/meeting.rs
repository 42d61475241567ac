//! The per-meeting coordination core.
//!
//! Each live meeting is owned by exactly one driver task. Every mutation
//! of meeting state, whether a registration, a chat line or a lifecycle
//! change, arrives over a channel and is processed one at a time to
//! completion, so no field here needs a lock. Sessions talk to the driver through a
//! [`MeetingHandle`]; the driver talks back by pushing onto each session's
//! bounded outbound queue, never blocking on a slow recipient.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::colors::ColorAssigner;
use crate::db;
use crate::poll::Poll;
use crate::status::{MeetingStatus, MemberStatus};
use crate::ws::protocol::{ChatMessage, Event, MeetingStateMsg, Outbound, PollStatus, UserEntry, UserList};
use crate::ws::session::{Identity, Session};

/// Buffered actions per meeting; a full queue blocks the sending session's
/// reader, which is the intended throttle for abusive clients.
pub const ACTION_QUEUE: usize = 10;

const MEMBERSHIP_LOOKUP: &str = r#"SELECT user_id, mk.id,
fullname,
EXISTS (SELECT 1 FROM membership_meeting_meetingadmins a WHERE a.meeting_id=$1 AND a.member_id=m.user_id) AS isadmin,
allowrejoin,
proxyname
FROM membership_member m
INNER JOIN membership_membermeetingkey mk ON m.user_id=mk.member_id
WHERE mk.meeting_id=$1 AND mk.key=$2"#;

const REPLAY_QUERY: &str = r#"SELECT ml.id,
t,
mk.id,
COALESCE(fullname, ''),
message
FROM membership_meetingmessagelog ml
LEFT JOIN membership_member ON membership_member.user_id=ml.sender_id
LEFT JOIN membership_membermeetingkey mk ON mk.member_id=ml.sender_id AND mk.meeting_id=$2
WHERE ml.id > $1 AND ml.meeting_id=$2
ORDER BY ml.id"#;

/// Meeting lifecycle. `Closed` is terminal: a meeting found closed on disk
/// is never instantiated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingState {
    Pending,
    Open,
    Finished,
    Closed,
}

impl MeetingState {
    fn from_db(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Open),
            2 => Some(Self::Finished),
            3 => Some(Self::Closed),
            _ => None,
        }
    }

    fn as_db(self) -> i32 {
        match self {
            Self::Pending => 0,
            Self::Open => 1,
            Self::Finished => 2,
            Self::Closed => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Finished => "finished",
            Self::Closed => "closed",
        }
    }

    fn as_wire(self) -> MeetingStateMsg {
        MeetingStateMsg {
            isopen: self == Self::Open,
            isfinished: self == Self::Finished,
        }
    }
}

/// Why a meeting could not be brought up.
#[derive(Debug, Error)]
pub enum MeetingError {
    #[error("meeting not found")]
    NotFound,
    #[error("cannot reopen a closed meeting")]
    Closed,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// An action submitted by a session, already decoded and gated.
pub enum UserAction {
    Message {
        session: Arc<Session>,
        message: String,
    },
    Vote {
        session: Arc<Session>,
        question: String,
        vote: i32,
    },
    OpenFinish {
        session: Arc<Session>,
        open: bool,
    },
    NewPoll {
        session: Arc<Session>,
        question: String,
        answers: Vec<String>,
        minutes: i64,
    },
    AbortPoll {
        session: Arc<Session>,
    },
    KickUser {
        session: Arc<Session>,
        target: i32,
        canrejoin: bool,
    },
}

/// Cloneable sender side of a meeting driver.
#[derive(Clone)]
pub struct MeetingHandle {
    pub actions: mpsc::Sender<UserAction>,
    pub register: mpsc::Sender<Arc<Session>>,
    pub unregister: mpsc::Sender<Arc<Session>>,
    pub status: mpsc::Sender<oneshot::Sender<MeetingStatus>>,
}

/// Receiver halves consumed by the driver task.
pub struct MeetingInbox {
    actions: mpsc::Receiver<UserAction>,
    register: mpsc::Receiver<Arc<Session>>,
    unregister: mpsc::Receiver<Arc<Session>>,
    polltimer: mpsc::Receiver<u64>,
    status: mpsc::Receiver<oneshot::Sender<MeetingStatus>>,
    stop: mpsc::Receiver<()>,
}

/// Per-member state owned by the driver. The session only ever sees the
/// immutable [`Identity`] subset.
struct MemberInfo {
    keyid: i32,
    authid: i32,
    name: String,
    admin: bool,
    connected: bool,
    #[allow(dead_code)]
    rejoined: bool,
    #[allow(dead_code)]
    allowrejoin: bool,
    proxyname: Option<String>,
    color: String,
}

struct Attendee {
    session: Arc<Session>,
    info: MemberInfo,
}

pub struct Meeting {
    id: i32,
    state: MeetingState,
    users: HashMap<String, Attendee>,
    active_poll: Option<Poll>,
    /// Bumped for every poll so stale timer deliveries can be recognized.
    poll_serial: u64,
    db: PgPool,
    colors: ColorAssigner,
    polltimer_tx: mpsc::Sender<u64>,
    stop_tx: mpsc::Sender<()>,
    removals: mpsc::Sender<i32>,
}

impl Meeting {
    /// Open a database handle for the meeting and check that it may be
    /// instantiated at all. The pool is lazy: a bad URL or unreachable
    /// server surfaces on the state query, and the handler turns any
    /// failure here into a plain 404.
    pub async fn new(
        id: i32,
        db_url: &str,
        removals: mpsc::Sender<i32>,
    ) -> Result<(Meeting, MeetingInbox, MeetingHandle), MeetingError> {
        let db = db::pool_for(db_url)?;

        let state = match sqlx::query_scalar::<_, i32>("SELECT state FROM membership_meeting WHERE id=$1")
            .bind(id)
            .fetch_optional(&db)
            .await
        {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::warn!(meeting = id, "could not find meeting");
                db.close().await;
                return Err(MeetingError::NotFound);
            }
            Err(err) => {
                tracing::error!(meeting = id, error = %err, "could not read meeting state");
                db.close().await;
                return Err(MeetingError::Db(err));
            }
        };
        let Some(state) = MeetingState::from_db(state) else {
            tracing::error!(meeting = id, state, "unrecognized meeting state in database");
            db.close().await;
            return Err(MeetingError::NotFound);
        };
        if state == MeetingState::Closed {
            tracing::warn!(meeting = id, "attempt to reopen a closed meeting");
            db.close().await;
            return Err(MeetingError::Closed);
        }

        let (actions_tx, actions_rx) = mpsc::channel(ACTION_QUEUE);
        let (register_tx, register_rx) = mpsc::channel(1);
        let (unregister_tx, unregister_rx) = mpsc::channel(1);
        let (polltimer_tx, polltimer_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let handle = MeetingHandle {
            actions: actions_tx,
            register: register_tx,
            unregister: unregister_tx,
            status: status_tx,
        };
        let inbox = MeetingInbox {
            actions: actions_rx,
            register: register_rx,
            unregister: unregister_rx,
            polltimer: polltimer_rx,
            status: status_rx,
            stop: stop_rx,
        };
        let meeting = Meeting {
            id,
            state,
            users: HashMap::new(),
            active_poll: None,
            poll_serial: 0,
            db,
            colors: ColorAssigner::new(),
            polltimer_tx,
            stop_tx,
            removals,
        };
        Ok((meeting, inbox, handle))
    }

    /// The driver: processes exactly one arrival at a time until stopped.
    pub async fn run(mut self, mut inbox: MeetingInbox) {
        loop {
            tokio::select! {
                Some(action) = inbox.actions.recv() => self.handle_action(action).await,
                Some(session) = inbox.register.recv() => self.register(session).await,
                Some(reply) = inbox.status.recv() => self.report_status(reply),
                Some(session) = inbox.unregister.recv() => self.unregister(session).await,
                Some(serial) = inbox.polltimer.recv() => self.poll_timer_fired(serial).await,
                _ = inbox.stop.recv() => break,
                else => break,
            }
        }

        // The meeting owns its db handle: turn out the lights on the way out,
        // then ask the registry to forget us.
        self.db.close().await;
        let _ = self.removals.send(self.id).await;
        tracing::info!(meeting = self.id, "meeting driver stopped");
    }

    async fn handle_action(&mut self, action: UserAction) {
        match action {
            UserAction::Message { session, message } => {
                self.store_and_broadcast(&message, Some(&session)).await
            }
            UserAction::Vote {
                session,
                question,
                vote,
            } => self.cast_vote(&session, &question, vote).await,
            UserAction::OpenFinish { session, open } => self.open_or_finish(&session, open).await,
            UserAction::NewPoll {
                session,
                question,
                answers,
                minutes,
            } => self.new_poll(&session, question, answers, minutes).await,
            UserAction::AbortPoll { session } => self.abort_poll(&session).await,
            UserAction::KickUser {
                session,
                target,
                canrejoin,
            } => self.kick_user(&session, target, canrejoin).await,
        }
    }

    // --- Attendee registration and unregistration ---

    async fn register(&mut self, session: Arc<Session>) {
        let row = sqlx::query_as::<_, (i32, i32, String, bool, bool, Option<String>)>(MEMBERSHIP_LOOKUP)
            .bind(self.id)
            .bind(session.token())
            .fetch_optional(&self.db)
            .await;

        let (authid, keyid, name, admin, allowrejoin, proxyname) = match row {
            Ok(Some(row)) => row,
            Ok(None) => {
                session.push_disconnect("You are not allowed to enter this meeting");
                return;
            }
            Err(err) => {
                tracing::error!(meeting = self.id, error = %err, "failed to check member record in db");
                session.push_disconnect("Connection error");
                return;
            }
        };

        // The session is not attached yet, so its identity can be installed
        // from here. It is immutable from now on.
        session.set_identity(Identity {
            authid,
            keyid,
            name: name.clone(),
            admin,
        });

        if !admin {
            // Admins may always join; everybody else depends on the state.
            if self.state == MeetingState::Finished {
                session.push_disconnect("This meeting is already finished and can no longer be joined.");
                return;
            }
            if self.state == MeetingState::Open && !allowrejoin {
                session.push_disconnect("This meeting is already in progress and can no longer be joined.");
                return;
            }
        }

        let mut info = MemberInfo {
            keyid,
            authid,
            name: name.clone(),
            admin,
            connected: true,
            rejoined: false,
            allowrejoin: true,
            proxyname: proxyname.clone(),
            color: String::new(),
        };

        let mut restr = "";
        if let Some(prev) = self.users.get(session.token()) {
            // Same key again: keep the color, flag the rejoin, and push the
            // old session out if it is still attached.
            info.rejoined = true;
            restr = "re-";
            info.color = prev.info.color.clone();
            if prev.info.connected {
                prev.session.push_disconnect(
                    "You have connected from a different session. This session is disconnected.",
                );
            }
        } else {
            info.color = self.colors.get(keyid);
        }

        let entry = UserEntry {
            name: info.name.clone(),
            color: info.color.clone(),
            id: info.keyid,
        };
        self.users.insert(
            session.token().to_string(),
            Attendee {
                session: session.clone(),
                info,
            },
        );

        tracing::info!(meeting = self.id, member = %name, "member {restr}joined meeting");

        // Once in, the default is that an accidental disconnect may rejoin.
        if let Err(err) = sqlx::query(
            "UPDATE membership_membermeetingkey SET allowrejoin=true WHERE meeting_id=$1 AND key=$2 AND NOT allowrejoin",
        )
        .bind(self.id)
        .bind(session.token())
        .execute(&self.db)
        .await
        {
            // Not a vital update, carry on.
            tracing::warn!(meeting = self.id, error = %err, "failed to set member to allow re-login");
        }

        // Initial information about the meeting for the newcomer, and the
        // newcomer for everyone else.
        self.broadcast(true, true, Outbound::Event(Event::AddUser(entry)), Some(&session));
        self.send_user_list_to(&session);
        self.send_meeting_state_to(&session);
        self.send_poll_status_to(&session, admin);
        self.send_initial_messages_to(&session).await;

        let announcement = match &proxyname {
            Some(proxy) => {
                format!("Member {name} {restr}joined the meeting (through proxy {proxy})")
            }
            None => format!("Member {name} {restr}joined the meeting"),
        };
        self.store_and_broadcast(&announcement, None).await;
    }

    async fn unregister(&mut self, session: Arc<Session>) {
        let entry = match self.users.get_mut(session.token()) {
            Some(attendee) => {
                // The map may already hold a replacement session for this
                // token; only the session actually going away flips the flag.
                if Arc::ptr_eq(&attendee.session, &session) {
                    attendee.info.connected = false;
                }
                UserEntry {
                    name: attendee.info.name.clone(),
                    color: attendee.info.color.clone(),
                    id: attendee.info.keyid,
                }
            }
            None => {
                // Rejected before it ever made the map.
                let identity = session.identity();
                UserEntry {
                    name: identity.map(|i| i.name.clone()).unwrap_or_default(),
                    color: String::new(),
                    id: identity.map(|i| i.keyid).unwrap_or(0),
                }
            }
        };

        self.broadcast(
            true,
            true,
            Outbound::Event(Event::RemoveUser(entry.clone())),
            Some(&session),
        );

        if !entry.name.is_empty() {
            self.store_and_broadcast(&format!("Member {} left the meeting", entry.name), None)
                .await;
            tracing::info!(meeting = self.id, member = %entry.name, "member left meeting");
        }

        // A finished meeting shuts down once the last attendee is gone.
        if self.state == MeetingState::Finished
            && !self.users.values().any(|a| a.info.connected)
        {
            tracing::info!(meeting = self.id, "last member left a finished meeting, switching to closed");
            if let Err(err) = sqlx::query("UPDATE membership_meeting SET state=$1 WHERE id=$2 AND state != $1")
                .bind(MeetingState::Closed.as_db())
                .bind(self.id)
                .execute(&self.db)
                .await
            {
                // Shut the live meeting down regardless.
                tracing::error!(meeting = self.id, error = %err, "failed to set meeting state to closed");
            }
            let _ = self.stop_tx.try_send(());
        }
    }

    async fn send_initial_messages_to(&mut self, to: &Arc<Session>) {
        let rows: Result<Vec<(i32, DateTime<Utc>, Option<i32>, String, String)>, sqlx::Error> =
            sqlx::query_as(REPLAY_QUERY)
                .bind(to.first_message())
                .bind(self.id)
                .fetch_all(&self.db)
                .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(meeting = self.id, error = %err, "failed to query old messages");
                return;
            }
        };

        let mut data = Vec::with_capacity(rows.len());
        for (id, t, sender_key, from_name, message) in rows {
            data.push(ChatMessage {
                id,
                time: t.format("%H:%M:%S").to_string(),
                date: t.format("%Y-%m-%d").to_string(),
                from: sender_key.map(i64::from).unwrap_or(-1),
                from_name,
                color: self.colors.get_with_null(sender_key),
                message,
            });
        }
        to.send(Outbound::Event(Event::Messages(data)));
    }

    // --- Sending and broadcasting infrastructure ---

    /// Push a value onto every connected session allowed by the admin/user
    /// mask, skipping `exclude`. Never blocks: a full queue drops the value
    /// for that recipient with a log line.
    fn broadcast(
        &self,
        to_admins: bool,
        to_users: bool,
        message: Outbound,
        exclude: Option<&Arc<Session>>,
    ) {
        for attendee in self.users.values() {
            if let Some(excluded) = exclude {
                if Arc::ptr_eq(&attendee.session, excluded) {
                    continue;
                }
            }
            if !attendee.info.connected {
                continue;
            }
            if attendee.info.admin && !to_admins {
                continue;
            }
            if !attendee.info.admin && !to_users {
                continue;
            }
            attendee.session.send(message.clone());
        }
    }

    /// Store a message in the log and re-broadcast it to everyone. `from`
    /// names the sender; `None` marks a system message.
    async fn store_and_broadcast(&mut self, message: &str, from: Option<&Arc<Session>>) {
        if message.is_empty() {
            tracing::warn!(meeting = self.id, "can't send empty message");
            return;
        }

        let sender = from.map(|s| self.sender_details(s));
        let (from_id, from_name, color) = match sender {
            Some((authid, name, color)) => (Some(authid), name, color),
            None => (None, String::new(), String::new()),
        };

        let inserted: Result<(i32, DateTime<Utc>), sqlx::Error> = sqlx::query_as(
            "INSERT INTO membership_meetingmessagelog(meeting_id, t, sender_id, message) VALUES ($1, CURRENT_TIMESTAMP, $2, $3) RETURNING id, t",
        )
        .bind(self.id)
        .bind(from_id)
        .bind(message)
        .fetch_one(&self.db)
        .await;

        let (id, t) = match inserted {
            Ok(row) => row,
            Err(err) => {
                tracing::error!(meeting = self.id, error = %err, "could not insert into message log");
                return;
            }
        };

        let msg = ChatMessage {
            id,
            time: t.format("%H:%M:%S").to_string(),
            date: t.format("%Y-%m-%d").to_string(),
            from: from_id.map(i64::from).unwrap_or(-1),
            from_name,
            color,
            message: message.to_string(),
        };
        self.broadcast(true, true, Outbound::Event(Event::Message(msg)), None);
    }

    fn sender_details(&self, session: &Arc<Session>) -> (i32, String, String) {
        if let Some(attendee) = self.users.get(session.token()) {
            (
                attendee.info.authid,
                attendee.info.name.clone(),
                attendee.info.color.clone(),
            )
        } else if let Some(identity) = session.identity() {
            (identity.authid, identity.name.clone(), String::new())
        } else {
            (-1, String::new(), String::new())
        }
    }

    fn member_name(&self, session: &Arc<Session>) -> String {
        self.sender_details(session).1
    }

    fn send_user_list_to(&self, to: &Arc<Session>) {
        let users = self
            .users
            .values()
            .filter(|a| a.info.connected)
            .map(|a| UserEntry {
                name: a.info.name.clone(),
                color: a.info.color.clone(),
                id: a.info.keyid,
            })
            .collect();
        to.send(Outbound::Event(Event::Users(UserList { users })));
    }

    fn send_meeting_state_to(&self, to: &Arc<Session>) {
        to.send(Outbound::Event(Event::Status(self.state.as_wire())));
    }

    fn broadcast_meeting_state(&self) {
        self.broadcast(
            true,
            true,
            Outbound::Event(Event::Status(self.state.as_wire())),
            None,
        );
    }

    // --- Meeting administration ---

    async fn open_or_finish(&mut self, session: &Arc<Session>, do_open: bool) {
        if do_open {
            if self.state == MeetingState::Open {
                session.send(Outbound::error("Meeting is already open"));
                return;
            }
            if self.state == MeetingState::Finished {
                let name = self.member_name(session);
                self.store_and_broadcast(&format!("This meeting is being re-opened by {name}"), None)
                    .await;
            }
            self.state = MeetingState::Open;
            self.store_and_broadcast("This meeting is now open", None).await;
            self.store_and_broadcast(
                "Anything sent from now on will be part of the permanent record",
                None,
            )
            .await;
        } else {
            if self.state == MeetingState::Finished {
                session.send(Outbound::error("Meeting is already finished"));
                return;
            }
            self.state = MeetingState::Finished;
            self.store_and_broadcast("This meeting is now finished", None).await;
        }

        if let Err(err) = sqlx::query("UPDATE membership_meeting SET state=$1 WHERE id=$2")
            .bind(self.state.as_db())
            .bind(self.id)
            .execute(&self.db)
            .await
        {
            session.send(Outbound::error("Failed to update state in database"));
            tracing::error!(meeting = self.id, error = %err, "failed to update meeting state in database");
            return;
        }
        self.broadcast_meeting_state();
    }

    // --- Polls ---

    fn poll_status(&self, admin: bool) -> Option<PollStatus> {
        self.active_poll.as_ref().map(|poll| PollStatus {
            question: poll.question().to_string(),
            answers: poll.answers().to_vec(),
            tally: poll.tally(),
            voted: admin.then(|| poll.voted()),
        })
    }

    fn send_poll_status_to(&self, to: &Arc<Session>, admin: bool) {
        to.send(Outbound::Event(Event::Poll(self.poll_status(admin))));
    }

    /// Admins and plain users get distinct poll views, so this is two
    /// masked broadcasts rather than one.
    fn broadcast_poll_status(&self) {
        self.broadcast(
            true,
            false,
            Outbound::Event(Event::Poll(self.poll_status(true))),
            None,
        );
        self.broadcast(
            false,
            true,
            Outbound::Event(Event::Poll(self.poll_status(false))),
            None,
        );
    }

    async fn new_poll(
        &mut self,
        session: &Arc<Session>,
        question: String,
        answers: Vec<String>,
        minutes: i64,
    ) {
        if self.active_poll.is_some() {
            session.send(Outbound::error("There is already an active poll"));
            return;
        }

        self.active_poll = Some(Poll::new(question.clone(), answers));
        self.poll_serial += 1;

        self.broadcast_poll_status();
        self.store_and_broadcast(&format!("A new poll has been posted for {question}"), None)
            .await;

        // One-shot close timer. The armed timer always delivers; the driver
        // filters stale serials when it arrives.
        let serial = self.poll_serial;
        let timer_tx = self.polltimer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(minutes.max(0) as u64 * 60)).await;
            let _ = timer_tx.send(serial).await;
        });
    }

    async fn cast_vote(&mut self, session: &Arc<Session>, question: &str, vote: i32) {
        let Some(poll) = self.active_poll.as_ref() else {
            session.send(Outbound::error("There is no active poll"));
            return;
        };
        if question != poll.question() {
            session.send(Outbound::error("Vote for the wrong question received"));
            return;
        }
        if vote < 0 || vote as usize >= poll.answers().len() {
            session.send(Outbound::error("Invalid vote"));
            return;
        }
        let answer = poll.answers()[vote as usize].clone();

        let (keyid, voter) = match self.users.get(session.token()) {
            Some(attendee) => (attendee.info.keyid, attendee.info.name.clone()),
            None => match session.identity() {
                Some(identity) => (identity.keyid, identity.name.clone()),
                None => return,
            },
        };

        let Some(poll) = self.active_poll.as_mut() else {
            return;
        };
        let changed = poll.cast_vote(keyid, vote as usize);
        let all_voted = poll.vote_count() == self.users.len();

        let announcement = if changed {
            format!("{voter} changed their vote to {answer}")
        } else {
            format!("{voter} voted {answer}")
        };
        self.store_and_broadcast(&announcement, None).await;

        // The count includes every key that ever registered, connected or
        // not, so a mid-poll departure can keep this from ever triggering.
        if all_voted {
            self.close_poll("All attendees have voted, poll has completed.")
                .await;
        } else {
            self.broadcast_poll_status();
        }
    }

    async fn close_poll(&mut self, message: &str) {
        let Some(poll) = self.active_poll.take() else {
            return;
        };

        self.store_and_broadcast(message, None).await;
        let tally = poll.tally();
        for (i, answer) in poll.answers().iter().enumerate() {
            self.store_and_broadcast(&answer_result_line(answer, tally[i]), None)
                .await;
        }
        self.broadcast_poll_status();
    }

    async fn abort_poll(&mut self, session: &Arc<Session>) {
        if self.active_poll.is_none() {
            session.send(Outbound::error("There is no active poll"));
            return;
        }

        self.active_poll = None;
        self.store_and_broadcast("The current poll has been aborted", None).await;
        self.broadcast_poll_status();
    }

    async fn poll_timer_fired(&mut self, serial: u64) {
        // An aborted or replaced poll leaves its timer running; ignore the
        // delivery unless it is still the active poll's.
        if self.active_poll.is_some() && serial == self.poll_serial {
            self.close_poll("Poll has completed").await;
        }
    }

    // --- User administration ---

    async fn kick_user(&mut self, session: &Arc<Session>, target_keyid: i32, canrejoin: bool) {
        let Some(token) = self
            .users
            .iter()
            .find(|(_, a)| a.info.keyid == target_keyid)
            .map(|(token, _)| token.clone())
        else {
            session.send(Outbound::error("User to kick not found"));
            return;
        };

        let Some(attendee) = self.users.get_mut(&token) else {
            return;
        };
        attendee.info.allowrejoin = canrejoin;
        attendee
            .session
            .push_disconnect("You have been forcibly disconnected from this meeting");
        let target_session = attendee.session.clone();
        let target = UserEntry {
            name: attendee.info.name.clone(),
            color: attendee.info.color.clone(),
            id: attendee.info.keyid,
        };

        let actor = self.member_name(session);
        self.store_and_broadcast(
            &format!("User {} has been disconnected by {}", target.name, actor),
            None,
        )
        .await;
        self.broadcast(
            true,
            true,
            Outbound::Event(Event::RemoveUser(target)),
            Some(&target_session),
        );

        // Blocking rejoins must stick in the db as well.
        if !canrejoin {
            if let Err(err) = sqlx::query(
                "UPDATE membership_membermeetingkey SET allowrejoin=false WHERE meeting_id=$1 AND key=$2 AND allowrejoin",
            )
            .bind(self.id)
            .bind(&token)
            .execute(&self.db)
            .await
            {
                tracing::warn!(meeting = self.id, error = %err, "failed to set member to block re-login");
            }
        }
    }

    // --- Status reporting ---

    fn report_status(&self, reply: oneshot::Sender<MeetingStatus>) {
        let mut members = Vec::new();
        let mut disconnected = Vec::new();
        for attendee in self.users.values() {
            let member = MemberStatus {
                uid: attendee.info.authid,
                name: attendee.info.name.clone(),
                admin: attendee.info.admin,
                remote: attendee.session.remote().to_string(),
            };
            if attendee.info.connected {
                members.push(member);
            } else {
                disconnected.push(member);
            }
        }
        let _ = reply.send(MeetingStatus {
            id: self.id,
            state: self.state.name().to_string(),
            members,
            disconnected_members: disconnected,
        });
    }
}

/// One line of the closing tally, with correct pluralization.
fn answer_result_line(answer: &str, votes: i32) -> String {
    let plural = if votes == 1 { "" } else { "s" };
    format!("Answer \"{answer}\": {votes} vote{plural}")
}
