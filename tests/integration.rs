use chat_service::api::{build_router, AppState};
use chat_service::config::Config;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;

async fn spawn_server(identity_url: String) -> (SocketAddr, JoinHandle<()>, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        identity_url,
        redis_url: None,
        logging_enabled: false,
    };
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, tmp)
}

/// Minimal stand-in for the user service's GraphQL endpoint.
fn spawn_identity(users: &[(&str, &str)]) -> SocketAddr {
    let map: HashMap<String, Value> = users
        .iter()
        .map(|(id, name)| {
            (
                id.to_string(),
                json!({
                    "id": id,
                    "username": name,
                    "email": format!("{}@example.com", name),
                    "displayName": name,
                    "createdAt": "2024-01-01T00:00:00.000Z",
                    "updatedAt": "2024-01-01T00:00:00.000Z",
                }),
            )
        })
        .collect();
    let app = axum::Router::new().route(
        "/graphql",
        axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
            let map = map.clone();
            async move {
                let id = body["variables"]["id"].as_str().unwrap_or_default();
                match map.get(id) {
                    Some(user) => axum::Json(json!({ "data": { "user": user } })),
                    None => axum::Json(json!({
                        "data": { "user": null },
                        "errors": [{ "message": format!("User with ID {} not found", id) }],
                    })),
                }
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    addr
}

#[tokio::test]
async fn chat_lifecycle_and_detail() {
    let identity = spawn_identity(&[("u1", "alice"), ("u2", "bob")]);
    let (addr, server, _tmp) = spawn_server(format!("http://{}/graphql", identity)).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/api/health", addr))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    // duplicates collapse, creator stays first
    let resp = client
        .post(format!("http://{}/api/chats", addr))
        .json(&json!({"name": "Team", "creatorId": "u1", "participants": ["u2", "u1", "u2"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let chat: Value = resp.json().await.unwrap();
    assert!(chat["id"].as_str().is_some());
    assert_eq!(chat["participants"], json!(["u1", "u2"]));
    let chat_id = chat["id"].as_str().unwrap().to_string();

    // empty name rejected
    let resp = client
        .post(format!("http://{}/api/chats", addr))
        .json(&json!({"name": "", "creatorId": "u1", "participants": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .json(&json!({"userId": "u2", "content": "hello"}))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("http://{}/api/chats/{}", addr, chat_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let detail: Value = resp.json().await.unwrap();
    assert_eq!(detail["name"], "Team");
    let participants = detail["participantUsers"].as_array().unwrap();
    assert_eq!(participants.len(), 2);
    assert_eq!(participants[0]["user"]["username"], "alice");
    assert_eq!(participants[1]["user"]["username"], "bob");
    let messages = detail["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "hello");
    assert_eq!(messages[0]["user"]["username"], "bob");

    // unknown chat
    let resp = client
        .get(format!(
            "http://{}/api/chats/00000000-0000-0000-0000-000000000000",
            addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // listings
    let resp = client
        .get(format!("http://{}/api/chats", addr))
        .send()
        .await
        .unwrap();
    let all: Value = resp.json().await.unwrap();
    assert_eq!(all.as_array().unwrap().len(), 1);
    let resp = client
        .get(format!("http://{}/api/users/u2/chats", addr))
        .send()
        .await
        .unwrap();
    let mine: Value = resp.json().await.unwrap();
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["id"].as_str().unwrap(), chat_id);
    let resp = client
        .get(format!("http://{}/api/users/nobody/chats", addr))
        .send()
        .await
        .unwrap();
    let none: Value = resp.json().await.unwrap();
    assert!(none.as_array().unwrap().is_empty());

    server.abort();
}

#[tokio::test]
async fn joining_is_idempotent_under_races() {
    let identity = spawn_identity(&[]);
    let (addr, server, _tmp) = spawn_server(format!("http://{}/graphql", identity)).await;
    let client = reqwest::Client::new();

    let chat: Value = client
        .post(format!("http://{}/api/chats", addr))
        .json(&json!({"name": "Team", "creatorId": "u1", "participants": ["u2"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["id"].as_str().unwrap().to_string();

    // two racing joins for the same new user
    let join = |c: reqwest::Client, addr: SocketAddr, chat_id: String| async move {
        c.post(format!("http://{}/api/chats/{}/join", addr, chat_id))
            .json(&json!({"userId": "u3"}))
            .send()
            .await
            .unwrap()
    };
    let (a, b) = tokio::join!(
        join(client.clone(), addr, chat_id.clone()),
        join(client.clone(), addr, chat_id.clone()),
    );
    assert!(a.status().is_success());
    assert!(b.status().is_success());

    // and once more, sequentially
    let resp = client
        .post(format!("http://{}/api/chats/{}/join", addr, chat_id))
        .json(&json!({"userId": "u3"}))
        .send()
        .await
        .unwrap();
    let after: Value = resp.json().await.unwrap();
    assert_eq!(after["participants"], json!(["u1", "u2", "u3"]));

    // joining an unknown chat is a 404
    let resp = client
        .post(format!(
            "http://{}/api/chats/00000000-0000-0000-0000-000000000000/join",
            addr
        ))
        .json(&json!({"userId": "u3"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.abort();
}

#[tokio::test]
async fn message_submission_and_history() {
    let identity = spawn_identity(&[]);
    let (addr, server, _tmp) = spawn_server(format!("http://{}/graphql", identity)).await;
    let client = reqwest::Client::new();

    let chat: Value = client
        .post(format!("http://{}/api/chats", addr))
        .json(&json!({"name": "Team", "creatorId": "u1", "participants": ["u2"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["id"].as_str().unwrap().to_string();

    for i in 0..5 {
        let resp = client
            .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
            .json(&json!({"userId": "u1", "content": format!("m{}", i)}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }

    // ascending order, stable for same-second submissions
    let history: Value = client
        .get(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let contents: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

    // pagination windows stitch back together
    let page: Value = client
        .get(format!(
            "http://{}/api/chats/{}/messages?limit=2&offset=3",
            addr, chat_id
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let page: Vec<&str> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(page, vec!["m3", "m4"]);

    // bad pagination
    let resp = client
        .get(format!(
            "http://{}/api/chats/{}/messages?limit=-1",
            addr, chat_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // empty content
    let resp = client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .json(&json!({"userId": "u1", "content": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // sender outside the participant list
    let resp = client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .json(&json!({"userId": "intruder", "content": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // unknown chat
    let resp = client
        .post(format!(
            "http://{}/api/chats/00000000-0000-0000-0000-000000000000/messages",
            addr
        ))
        .json(&json!({"userId": "u1", "content": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.abort();
}

#[tokio::test]
async fn detail_survives_identity_outage() {
    // nothing listens on the identity endpoint
    let (addr, server, _tmp) = spawn_server("http://127.0.0.1:9/graphql".to_string()).await;
    let client = reqwest::Client::new();

    let chat: Value = client
        .post(format!("http://{}/api/chats", addr))
        .json(&json!({"name": "Team", "creatorId": "u1", "participants": ["u2"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["id"].as_str().unwrap().to_string();
    client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .json(&json!({"userId": "u1", "content": "still here"}))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("http://{}/api/chats/{}", addr, chat_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let detail: Value = resp.json().await.unwrap();
    assert_eq!(detail["messages"][0]["content"], "still here");
    // identity fields degrade to null instead of failing the call
    for participant in detail["participantUsers"].as_array().unwrap() {
        assert!(participant["user"].is_null());
    }
    assert!(detail["messages"][0]["user"].is_null());

    server.abort();
}

#[tokio::test]
async fn partially_unknown_participants_degrade_per_user() {
    let identity = spawn_identity(&[("u1", "alice")]);
    let (addr, server, _tmp) = spawn_server(format!("http://{}/graphql", identity)).await;
    let client = reqwest::Client::new();

    let chat: Value = client
        .post(format!("http://{}/api/chats", addr))
        .json(&json!({"name": "Team", "creatorId": "u1", "participants": ["ghost"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["id"].as_str().unwrap();

    let detail: Value = client
        .get(format!("http://{}/api/chats/{}", addr, chat_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let participants = detail["participantUsers"].as_array().unwrap();
    assert_eq!(participants[0]["user"]["username"], "alice");
    assert!(participants[1]["user"].is_null());

    server.abort();
}
