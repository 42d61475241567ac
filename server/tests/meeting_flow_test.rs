//! End-to-end meeting flows over a real socket against a live Postgres.
//!
//! These need a scratch database with the membership tables (created below
//! if missing) and are ignored by default:
//!
//!     TEST_DATABASE_URL=postgres://localhost/meetingtest \
//!         cargo test -p meeting-server -- --ignored

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use meeting_server::config::Config;
use meeting_server::routes;
use meeting_server::state::AppState;
use meeting_server::ws::ClientAddr;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("requires reachable Postgres; set TEST_DATABASE_URL")
}

/// 54-character key for a seeded member, padded with zeroes.
fn make_token(meeting_id: i32, n: u32) -> String {
    format!("{:0>54}", format!("{meeting_id}x{n}"))
}

async fn setup_pool() -> PgPool {
    let pool = PgPool::connect(&database_url())
        .await
        .expect("connect to TEST_DATABASE_URL");
    for ddl in [
        "CREATE TABLE IF NOT EXISTS membership_meeting (id int PRIMARY KEY, state int NOT NULL)",
        "CREATE TABLE IF NOT EXISTS membership_member (user_id int PRIMARY KEY, fullname text NOT NULL)",
        "CREATE TABLE IF NOT EXISTS membership_meeting_meetingadmins (meeting_id int NOT NULL, member_id int NOT NULL)",
        "CREATE TABLE IF NOT EXISTS membership_membermeetingkey (id int PRIMARY KEY, meeting_id int NOT NULL, member_id int NOT NULL, key text NOT NULL, allowrejoin boolean NOT NULL DEFAULT true, proxyname text)",
        "CREATE TABLE IF NOT EXISTS membership_meetingmessagelog (id serial PRIMARY KEY, meeting_id int NOT NULL, t timestamptz NOT NULL, sender_id int, message text NOT NULL)",
    ] {
        sqlx::query(ddl).execute(&pool).await.unwrap();
    }
    pool
}

async fn seed_meeting(pool: &PgPool, meeting_id: i32, state: i32) {
    sqlx::query(
        "INSERT INTO membership_meeting(id, state) VALUES ($1, $2)
         ON CONFLICT (id) DO UPDATE SET state = excluded.state",
    )
    .bind(meeting_id)
    .bind(state)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query("DELETE FROM membership_meetingmessagelog WHERE meeting_id=$1")
        .bind(meeting_id)
        .execute(pool)
        .await
        .unwrap();
}

/// Seed one member with a meeting key. Member and key ids are derived from
/// the meeting id so tests do not collide on a shared database.
async fn seed_member(
    pool: &PgPool,
    meeting_id: i32,
    n: u32,
    name: &str,
    admin: bool,
) -> (i32, String) {
    let member_id = meeting_id * 100 + n as i32;
    let token = make_token(meeting_id, n);
    sqlx::query("INSERT INTO membership_member(user_id, fullname) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING")
        .bind(member_id)
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO membership_membermeetingkey(id, meeting_id, member_id, key, allowrejoin, proxyname)
         VALUES ($1, $2, $3, $4, true, NULL)
         ON CONFLICT (id) DO UPDATE SET allowrejoin = true",
    )
    .bind(member_id)
    .bind(meeting_id)
    .bind(member_id)
    .bind(&token)
    .execute(pool)
    .await
    .unwrap();
    if admin {
        sqlx::query("INSERT INTO membership_meeting_meetingadmins(meeting_id, member_id) VALUES ($1, $2)")
            .bind(meeting_id)
            .bind(member_id)
            .execute(pool)
            .await
            .unwrap();
    }
    (member_id, token)
}

async fn start_test_server() -> SocketAddr {
    let config = Arc::new(Config {
        origin: "*".to_string(),
        dburl: database_url(),
        ..Config::default()
    });
    let state = AppState::new(config);
    let app = routes::build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ClientAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, meeting_id: i32, token: &str, first: i32) -> (WsSink, WsStream) {
    let url = format!("ws://{addr}/ws/meeting/{meeting_id}/{token}/{first}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("websocket connect");
    ws.split()
}

/// Read frames until one of the given envelope type arrives.
async fn next_event(stream: &mut WsStream, kind: &str) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind} event"))
            .expect("stream ended")
            .expect("read error");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

/// Read frames until a chat message with exactly this text arrives.
async fn next_chat(stream: &mut WsStream, text: &str) -> Value {
    loop {
        let value = next_event(stream, "message").await;
        if value["data"]["message"] == text {
            return value;
        }
    }
}

async fn send_json(sink: &mut WsSink, value: Value) {
    sink.send(Message::Text(value.to_string().into()))
        .await
        .expect("websocket send");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL/live Postgres"]
async fn chat_reaches_both_attendees_and_the_log() {
    let pool = setup_pool().await;
    let meeting_id = 4201;
    seed_meeting(&pool, meeting_id, 0).await;
    let (ada_id, ada_token) = seed_member(&pool, meeting_id, 1, "Ada", false).await;
    let (_, grace_token) = seed_member(&pool, meeting_id, 2, "Grace", false).await;

    let addr = start_test_server().await;
    let (mut ada_tx, mut ada_rx) = connect(addr, meeting_id, &ada_token, 0).await;
    next_event(&mut ada_rx, "users").await;
    let (_grace_tx, mut grace_rx) = connect(addr, meeting_id, &grace_token, 0).await;
    next_event(&mut grace_rx, "users").await;

    send_json(&mut ada_tx, json!({"type": "message", "message": " hi "})).await;

    let ada_copy = next_chat(&mut ada_rx, "hi").await;
    let grace_copy = next_chat(&mut grace_rx, "hi").await;

    assert_eq!(ada_copy["data"]["from"], json!(ada_id));
    assert!(ada_copy["data"]["id"].as_i64().unwrap() > 0);
    assert_eq!(ada_copy["data"]["id"], grace_copy["data"]["id"]);
    assert_eq!(ada_copy["data"]["fromname"], json!("Ada"));

    let logged: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM membership_meetingmessagelog WHERE meeting_id=$1 AND message='hi'",
    )
    .bind(meeting_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(logged, 1);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL/live Postgres"]
async fn second_connection_replaces_the_first() {
    let pool = setup_pool().await;
    let meeting_id = 4202;
    seed_meeting(&pool, meeting_id, 0).await;
    let (_, ada_token) = seed_member(&pool, meeting_id, 1, "Ada", false).await;

    let addr = start_test_server().await;
    let (_first_tx, mut first_rx) = connect(addr, meeting_id, &ada_token, 0).await;
    let first_users = next_event(&mut first_rx, "users").await;
    let first_color = first_users["data"]["users"][0]["color"].clone();

    let (_second_tx, mut second_rx) = connect(addr, meeting_id, &ada_token, 0).await;

    // The old session is told why it is going away.
    let goodbye = next_event(&mut first_rx, "disconnect").await;
    assert!(goodbye["data"]["message"]
        .as_str()
        .unwrap()
        .contains("connected from a different session"));

    // The replacement keeps the color and appears exactly once.
    let second_users = next_event(&mut second_rx, "users").await;
    let entries = second_users["data"]["users"].as_array().unwrap();
    let adas: Vec<_> = entries.iter().filter(|u| u["name"] == "Ada").collect();
    assert_eq!(adas.len(), 1);
    assert_eq!(adas[0]["color"], first_color);

    next_chat(&mut second_rx, "Member Ada re-joined the meeting").await;
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL/live Postgres"]
async fn poll_completes_when_everyone_voted() {
    let pool = setup_pool().await;
    let meeting_id = 4203;
    seed_meeting(&pool, meeting_id, 0).await;
    let (_, chair_token) = seed_member(&pool, meeting_id, 1, "Chair", true).await;
    let (_, ada_token) = seed_member(&pool, meeting_id, 2, "Ada", false).await;

    let addr = start_test_server().await;
    let (mut chair_tx, mut chair_rx) = connect(addr, meeting_id, &chair_token, 0).await;
    next_event(&mut chair_rx, "users").await;
    let (mut ada_tx, mut ada_rx) = connect(addr, meeting_id, &ada_token, 0).await;
    next_event(&mut ada_rx, "users").await;

    send_json(
        &mut chair_tx,
        json!({"type": "newpoll", "question": "Q", "minutes": 5, "answers": ["a", "b"]}),
    )
    .await;

    // Admins see the voter list, plain attendees do not.
    let chair_poll = loop {
        let value = next_event(&mut chair_rx, "poll").await;
        if !value["data"].is_null() {
            break value;
        }
    };
    assert_eq!(chair_poll["data"]["voted"], json!([]));
    let ada_poll = loop {
        let value = next_event(&mut ada_rx, "poll").await;
        if !value["data"].is_null() {
            break value;
        }
    };
    assert!(ada_poll["data"].get("voted").is_none());

    send_json(&mut chair_tx, json!({"type": "vote", "question": "Q", "vote": 0})).await;
    next_chat(&mut ada_rx, "Chair voted a").await;
    send_json(&mut ada_tx, json!({"type": "vote", "question": "Q", "vote": 0})).await;

    next_chat(&mut ada_rx, "All attendees have voted, poll has completed.").await;
    next_chat(&mut ada_rx, "Answer \"a\": 2 votes").await;
    next_chat(&mut ada_rx, "Answer \"b\": 0 votes").await;

    // After completion the poll broadcast carries null again.
    loop {
        let value = next_event(&mut ada_rx, "poll").await;
        if value["data"].is_null() {
            break;
        }
    }
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL/live Postgres"]
async fn finished_meeting_closes_when_the_last_attendee_leaves() {
    let pool = setup_pool().await;
    let meeting_id = 4204;
    seed_meeting(&pool, meeting_id, 1).await;
    let (_, chair_token) = seed_member(&pool, meeting_id, 1, "Chair", true).await;

    let addr = start_test_server().await;
    let (mut chair_tx, mut chair_rx) = connect(addr, meeting_id, &chair_token, 0).await;
    next_event(&mut chair_rx, "users").await;

    send_json(&mut chair_tx, json!({"type": "finish"})).await;
    next_chat(&mut chair_rx, "This meeting is now finished").await;

    // Last attendee leaves; the driver persists Closed and stops.
    chair_tx.send(Message::Close(None)).await.unwrap();
    drop(chair_tx);
    drop(chair_rx);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let state: i32 = sqlx::query_scalar("SELECT state FROM membership_meeting WHERE id=$1")
        .bind(meeting_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(state, 3);

    let body: Value = reqwest::get(format!("http://{addr}/__meetingstatus"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = body["meetings"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m["id"] == meeting_id);
    assert!(!listed, "closed meeting must leave the registry");
}
