mod common;

use futures_util::{SinkExt, StreamExt};
use labterm::advice::SuggestionKind;
use labterm::http_server::ServerMessage;
use labterm::terminal::SessionMode;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn send(ws: &mut Socket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_message(ws: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn nmap_typo_over_websocket_gets_syntax_help() {
    let addr = common::spawn_server().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

    send(
        &mut ws,
        serde_json::json!({"type": "open", "student_id": "alice", "course_name": "cs101"}),
    )
    .await;
    let session_id = match next_message(&mut ws).await {
        ServerMessage::Opened { session_id, mode } => {
            assert_eq!(mode, SessionMode::Sandboxed);
            session_id
        }
        other => panic!("expected opened, got {other:?}"),
    };

    // Let the pass armed by the first prompt go by.
    tokio::time::sleep(Duration::from_millis(300)).await;
    send(&mut ws, serde_json::json!({"type": "input", "data": "nmap -djf 127.0.0.1\r"})).await;

    let mut output = String::new();
    let suggestion = loop {
        match next_message(&mut ws).await {
            ServerMessage::Output { data } => output.push_str(&data),
            ServerMessage::Suggestion { suggestion } => break suggestion,
            other => panic!("unexpected message {other:?}"),
        }
    };
    assert!(output.contains("Container ready: hax-cs101-alice"), "{output:?}");
    assert!(output.contains("QUITTING!"), "{output:?}");
    assert_eq!(suggestion.kind, SuggestionKind::ErrorHelp);
    assert_eq!(suggestion.title, "Nmap syntax error");

    let base = format!("http://{addr}");
    let client = reqwest::Client::new();
    let sessions: serde_json::Value = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions[0]["id"], session_id.as_str());
    assert_eq!(sessions[0]["student_id"], "alice");
    assert_eq!(sessions[0]["sandbox"], "cs101-alice");

    let sandboxes: serde_json::Value = client
        .get(format!("{base}/api/sandboxes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sandboxes["backend"], "fake");
    assert_eq!(sandboxes["resolved"][0]["name"], "hax-cs101-alice");

    send(&mut ws, serde_json::json!({"type": "close"})).await;
    loop {
        if let ServerMessage::Closed { session_id: closed } = next_message(&mut ws).await {
            assert_eq!(closed, session_id);
            break;
        }
    }
}

#[tokio::test]
async fn operator_endpoints_respond() {
    let addr = common::spawn_server().await;
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    let status: serde_json::Value = client
        .get(format!("{base}/api/advice/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["strategy"], "heuristic");
    assert!(status["provider"].is_null());

    let deleted = client
        .delete(format!("{base}/api/sessions/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status().as_u16(), 204);

    let reset = client
        .post(format!("{base}/api/sandboxes/cs101-alice/reset"))
        .send()
        .await
        .unwrap();
    assert_eq!(reset.status().as_u16(), 200);
    let body: serde_json::Value = reset.json().await.unwrap();
    assert_eq!(body["closed_sessions"], 0);
}

#[tokio::test]
async fn malformed_messages_get_an_error_reply() {
    let addr = common::spawn_server().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws.send(Message::Text("{\"type\":\"launch\"}".to_string())).await.unwrap();
    match next_message(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.contains("invalid message"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
}
