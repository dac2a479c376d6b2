use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use burnchat::{
    AppState, Config, Rooms,
    events::BroadcastChannels,
    ids::IdGenerator,
    store::{KvStore, MemoryStore},
};
use serde_json::{Value, json};
use tower::ServiceExt;

#[derive(Default)]
struct Numbered {
    rooms: AtomicUsize,
    tokens: AtomicUsize,
}

impl IdGenerator for Numbered {
    fn room_id(&self) -> String {
        format!("room{}", self.rooms.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn token(&self) -> String {
        format!("token{}", self.tokens.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

fn service(env: &[(&str, &str)]) -> Router {
    service_over(Arc::new(MemoryStore::new()), Arc::new(Numbered::default()), env)
}

/// One server process; several of these may share a store.
fn service_over(store: Arc<dyn KvStore>, ids: Arc<Numbered>, env: &[(&str, &str)]) -> Router {
    let env: Vec<(String, String)> = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let config = Config::from_lookup(|key| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())).unwrap();

    let rooms = Rooms::new(store, Arc::new(BroadcastChannels::new(config.event_buffer)), ids, config.policy);
    burnchat::app(AppState { rooms }, &config)
}

async fn send(app: &Router, method: Method, uri: &str, cookie: Option<&str>, body: Option<Value>) -> Response {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        req = req.header(header::COOKIE, cookie);
    }

    let req = match body {
        Some(body) => req
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    app.clone().oneshot(req).await.unwrap()
}

async fn json_body(res: Response) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn session_cookie(res: &Response) -> Option<String> {
    res.headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .filter(|pair| pair.starts_with("burnchat.sid="))
        .map(str::to_owned)
}

fn location(res: &Response) -> &str {
    res.headers().get(header::LOCATION).unwrap().to_str().unwrap()
}

async fn create(app: &Router) -> String {
    let res = send(app, Method::POST, "/room/create", None, None).await;
    assert_eq!(res.status(), StatusCode::OK);
    json_body(res).await["roomId"].as_str().unwrap().to_owned()
}

async fn enter(app: &Router, room_id: &str) -> String {
    let res = send(app, Method::GET, &format!("/room/{room_id}"), None, None).await;
    assert_eq!(res.status(), StatusCode::OK);
    session_cookie(&res).expect("admission sets the session cookie")
}

#[tokio::test]
async fn room_admits_three_then_turns_people_away() {
    let app = service(&[]);
    let room_id = create(&app).await;

    let first = enter(&app, &room_id).await;
    enter(&app, &room_id).await;
    enter(&app, &room_id).await;

    let res = send(&app, Method::GET, &format!("/room/{room_id}"), None, None).await;
    assert!(res.status().is_redirection());
    assert_eq!(location(&res), "/?error=room-full");

    // a returning participant still gets in
    let res = send(&app, Method::GET, &format!("/room/{room_id}"), Some(&first), None).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_room_redirects_home() {
    let app = service(&[]);

    let res = send(&app, Method::GET, "/room/doesnotexist", None, None).await;
    assert!(res.status().is_redirection());
    assert_eq!(location(&res), "/?error=room-not-found");

    let res = send(&app, Method::GET, "/?error=room-not-found", None, None).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn messages_are_shared_but_tokens_are_not() {
    let app = service(&[]);
    let room_id = create(&app).await;
    let alice = enter(&app, &room_id).await;
    let bob = enter(&app, &room_id).await;

    let uri = format!("/messages?roomId={room_id}");
    let res = send(&app, Method::POST, &uri, Some(&alice), Some(json!({ "sender": "alice", "text": "hello" }))).await;
    assert_eq!(res.status(), StatusCode::OK);
    let res = send(&app, Method::POST, &uri, Some(&bob), Some(json!({ "sender": "bob", "text": "hi" }))).await;
    assert_eq!(res.status(), StatusCode::OK);

    let seen_by_bob = json_body(send(&app, Method::GET, &uri, Some(&bob), None).await).await;
    let messages = seen_by_bob["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["sender"], "alice");
    assert_eq!(messages[0]["roomId"], json!(room_id));
    assert!(messages[0].get("token").is_none());
    assert_eq!(messages[1]["token"], "token2");
}

#[tokio::test]
async fn oversized_message_is_unprocessable() {
    let app = service(&[]);
    let room_id = create(&app).await;
    let alice = enter(&app, &room_id).await;

    let res = send(
        &app,
        Method::POST,
        &format!("/messages?roomId={room_id}"),
        Some(&alice),
        Some(json!({ "sender": "alice", "text": "x".repeat(101) })),
    )
    .await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn room_scoped_routes_require_an_admitted_session() {
    let app = service(&[]);
    let room_id = create(&app).await;
    let alice = enter(&app, &room_id).await;
    let other_room = create(&app).await;

    for (uri, cookie) in [
        (format!("/messages?roomId={room_id}"), None),
        ("/messages".to_owned(), Some(alice.as_str())),
        (format!("/messages?roomId={other_room}"), Some(alice.as_str())),
        (format!("/room/ttl?roomId={other_room}"), Some(alice.as_str())),
    ] {
        let res = send(&app, Method::GET, &uri, cookie, None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(json_body(res).await, json!({ "error": "Unauthorized" }));
    }
}

#[tokio::test]
async fn destroy_is_idempotent_and_locks_everyone_out() {
    let app = service(&[]);
    let room_id = create(&app).await;
    let alice = enter(&app, &room_id).await;
    let bob = enter(&app, &room_id).await;

    let uri = format!("/room?roomId={room_id}");
    assert_eq!(send(&app, Method::DELETE, &uri, Some(&alice), None).await.status(), StatusCode::OK);
    assert_eq!(send(&app, Method::DELETE, &uri, Some(&alice), None).await.status(), StatusCode::OK);

    let res = send(&app, Method::GET, &format!("/messages?roomId={room_id}"), Some(&bob), None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = send(&app, Method::GET, &format!("/room/{room_id}"), Some(&bob), None).await;
    assert_eq!(location(&res), "/?error=room-not-found");
}

#[tokio::test]
async fn destroy_without_a_session_is_unauthorized() {
    let app = service(&[]);
    let room_id = create(&app).await;

    let res = send(&app, Method::DELETE, &format!("/room?roomId={room_id}"), None, None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(start_paused = true)]
async fn ttl_counts_down_until_the_room_is_gone() {
    let app = service(&[("ROOM_TTL", "5")]);
    let room_id = create(&app).await;
    let alice = enter(&app, &room_id).await;
    let uri = format!("/room/ttl?roomId={room_id}");

    let ttl = json_body(send(&app, Method::GET, &uri, Some(&alice), None).await).await;
    assert_eq!(ttl, json!({ "ttl": 5 }));

    tokio::time::advance(Duration::from_secs(2)).await;
    let ttl = json_body(send(&app, Method::GET, &uri, Some(&alice), None).await).await;
    assert_eq!(ttl, json!({ "ttl": 3 }));

    tokio::time::advance(Duration::from_secs(4)).await;
    let res = send(&app, Method::GET, &uri, Some(&alice), None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admission_holds_across_servers_sharing_a_store() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let ids = Arc::new(Numbered::default());
    let a = service_over(store.clone(), ids.clone(), &[]);
    let b = service_over(store, ids, &[]);

    let room_id = create(&a).await;
    let alice = enter(&a, &room_id).await;
    let uri = format!("/messages?roomId={room_id}");

    let res = send(&b, Method::POST, &uri, Some(&alice), Some(json!({ "sender": "alice", "text": "via b" }))).await;
    assert_eq!(res.status(), StatusCode::OK);

    let seen_on_a = json_body(send(&a, Method::GET, &uri, Some(&alice), None).await).await;
    assert_eq!(seen_on_a["messages"][0]["text"], "via b");
    assert_eq!(seen_on_a["messages"][0]["token"], "token1");

    // re-entering through the other server keeps the same seat
    let res = send(&b, Method::GET, &format!("/room/{room_id}"), Some(&alice), None).await;
    assert_eq!(res.status(), StatusCode::OK);
    enter(&b, &room_id).await;
    enter(&a, &room_id).await;

    let res = send(&b, Method::GET, &format!("/room/{room_id}"), None, None).await;
    assert_eq!(location(&res), "/?error=room-full");
}

#[tokio::test]
async fn event_stream_requires_an_admitted_session() {
    let app = service(&[]);
    let room_id = create(&app).await;

    let res = send(&app, Method::GET, &format!("/room/events?roomId={room_id}"), None, None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(res).await, json!({ "error": "Unauthorized" }));
}

#[tokio::test]
async fn landing_page_states_the_configured_lifetime() {
    let app = service(&[("ROOM_TTL", "90"), ("MAX_PARTICIPANTS", "5")]);

    let res = send(&app, Method::GET, "/", None, None).await;
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let page = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(page.contains("90 seconds"));
    assert!(page.contains("up to 5 people"));
}
