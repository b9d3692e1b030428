//! End-to-end delivery tests against a running server instance.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use courier_core::{AckMode, Frame, FrameType};
use courier_server::{
    route, Authenticator, InsecureAuth, JwtAuth, Server, ServerConfig, ServerHandle,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(
    ack_mode: AckMode,
    auth: Arc<dyn Authenticator>,
) -> (Arc<Server>, ServerHandle) {
    let config = ServerConfig {
        port: 0,
        ack_mode,
        ack_timeout: Duration::from_secs(3),
        ..Default::default()
    };
    let server = Server::new(config, auth);
    server.add_routes(vec![route("chat.echo", |_server, conn, frame| async move {
        conn.write_frame(&Frame::data(frame.form_id.clone(), frame.data.clone()))
            .await?;
        Ok(())
    })]);
    let handle = Arc::clone(&server)
        .start()
        .await
        .expect("server failed to start");
    (server, handle)
}

async fn connect(port: u16, uid: &str) -> WsClient {
    let (ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws?userId={uid}"))
        .await
        .expect("websocket connect failed");
    ws
}

async fn send_frame(ws: &mut WsClient, frame: &Frame) {
    let text = serde_json::to_string(frame).unwrap();
    ws.send(Message::text(text)).await.expect("send failed");
}

async fn recv_frame(ws: &mut WsClient) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("read failed");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn assert_closed(ws: &mut WsClient) {
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
            Some(Ok(_)) => {}
        }
    }
}

fn data_frame(id: &str, method: &str, payload: serde_json::Value) -> Frame {
    Frame {
        id: id.into(),
        method: method.into(),
        form_id: "f1".into(),
        data: payload,
        ..Frame::default()
    }
}

#[tokio::test]
async fn echoes_data_frame() {
    let (_server, handle) = start_server(AckMode::Disabled, Arc::new(InsecureAuth)).await;
    let mut ws = connect(handle.port, "u1").await;

    send_frame(
        &mut ws,
        &data_frame("m1", "chat.echo", serde_json::json!({"text": "hello"})),
    )
    .await;

    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply.frame_type, FrameType::Data);
    assert_eq!(reply.form_id, "f1");
    assert_eq!(reply.data["text"], "hello");
}

#[tokio::test]
async fn answers_ping_frames() {
    let (_server, handle) = start_server(AckMode::Disabled, Arc::new(InsecureAuth)).await;
    let mut ws = connect(handle.port, "u1").await;

    send_frame(&mut ws, &Frame::ping()).await;

    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply.frame_type, FrameType::Ping);
}

#[tokio::test]
async fn unknown_method_replies_and_keeps_connection_open() {
    let (_server, handle) = start_server(AckMode::Disabled, Arc::new(InsecureAuth)).await;
    let mut ws = connect(handle.port, "u1").await;

    send_frame(
        &mut ws,
        &data_frame("m1", "no.such.method", serde_json::Value::Null),
    )
    .await;

    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply.frame_type, FrameType::Data);
    assert!(reply.data.as_str().unwrap().contains("no.such.method"));

    // Still alive and routing.
    send_frame(
        &mut ws,
        &data_frame("m2", "chat.echo", serde_json::json!("still here")),
    )
    .await;
    let echoed = recv_frame(&mut ws).await;
    assert_eq!(echoed.data, serde_json::json!("still here"));
}

#[tokio::test]
async fn malformed_frame_is_dropped_without_closing() {
    let (_server, handle) = start_server(AckMode::Disabled, Arc::new(InsecureAuth)).await;
    let mut ws = connect(handle.port, "u1").await;

    ws.send(Message::text("this is not json")).await.unwrap();

    send_frame(
        &mut ws,
        &data_frame("m1", "chat.echo", serde_json::json!("survived")),
    )
    .await;
    let echoed = recv_frame(&mut ws).await;
    assert_eq!(echoed.data, serde_json::json!("survived"));
}

#[tokio::test]
async fn single_tier_acks_before_delivery() {
    let (_server, handle) = start_server(AckMode::Single, Arc::new(InsecureAuth)).await;
    let mut ws = connect(handle.port, "u1").await;

    send_frame(
        &mut ws,
        &data_frame("m1", "chat.echo", serde_json::json!("payload")),
    )
    .await;

    let ack = recv_frame(&mut ws).await;
    assert_eq!(ack.frame_type, FrameType::Ack);
    assert_eq!(ack.id, "m1");
    assert_eq!(ack.ack_seq, 1);

    let echoed = recv_frame(&mut ws).await;
    assert_eq!(echoed.frame_type, FrameType::Data);
    assert_eq!(echoed.data, serde_json::json!("payload"));
}

#[tokio::test]
async fn rigorous_tier_delivers_after_confirmation() {
    let (_server, handle) = start_server(AckMode::Rigorous, Arc::new(InsecureAuth)).await;
    let mut ws = connect(handle.port, "u1").await;

    send_frame(
        &mut ws,
        &data_frame("m1", "chat.echo", serde_json::json!("guarded")),
    )
    .await;

    let request = recv_frame(&mut ws).await;
    assert_eq!(request.frame_type, FrameType::Ack);
    assert_eq!(request.id, "m1");
    assert_eq!(request.ack_seq, 1);

    // Confirm with a strictly greater sequence.
    send_frame(&mut ws, &Frame::ack("m1", 2)).await;

    let echoed = recv_frame(&mut ws).await;
    assert_eq!(echoed.frame_type, FrameType::Data);
    assert_eq!(echoed.data, serde_json::json!("guarded"));

    // Exactly one delivery, no trailing frames.
    assert!(timeout(Duration::from_millis(300), ws.next()).await.is_err());
}

#[tokio::test]
async fn noack_frames_bypass_the_pending_queue() {
    let (_server, handle) = start_server(AckMode::Rigorous, Arc::new(InsecureAuth)).await;
    let mut ws = connect(handle.port, "u1").await;

    let mut frame = data_frame("m1", "chat.echo", serde_json::json!("fast lane"));
    frame.frame_type = FrameType::NoAck;
    send_frame(&mut ws, &frame).await;

    // Delivered straight away: the first reply is the echo, not an Ack.
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply.frame_type, FrameType::Data);
    assert_eq!(reply.data, serde_json::json!("fast lane"));
}

#[tokio::test]
async fn reconnect_evicts_previous_connection() {
    let (server, handle) = start_server(AckMode::Disabled, Arc::new(InsecureAuth)).await;
    let mut first = connect(handle.port, "u1").await;
    let mut second = connect(handle.port, "u1").await;

    // The old transport is closed server-side.
    assert_closed(&mut first).await;

    // The registry now points at the new connection.
    send_frame(
        &mut second,
        &data_frame("m1", "chat.echo", serde_json::json!("fresh")),
    )
    .await;
    let echoed = recv_frame(&mut second).await;
    assert_eq!(echoed.data, serde_json::json!("fresh"));
    assert_eq!(server.connection_count(), 1);

    let url = format!("http://127.0.0.1:{}/health", handle.port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
}

// ── Bearer-token authentication over the subprotocol header ──

#[derive(Serialize)]
struct Claims {
    uid: String,
    exp: usize,
}

fn token(secret: &str, uid: &str) -> String {
    let exp = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600) as usize;
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims {
            uid: uid.into(),
            exp,
        },
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

async fn connect_with_token(port: u16, token: &str) -> WsClient {
    let mut request = format!("ws://127.0.0.1:{port}/ws")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", token.parse().unwrap());
    let (ws, _resp) = connect_async(request).await.expect("connect failed");
    ws
}

#[tokio::test]
async fn jwt_accepts_valid_subprotocol_token() {
    let (server, handle) =
        start_server(AckMode::Disabled, Arc::new(JwtAuth::new("it-secret"))).await;
    let mut ws = connect_with_token(handle.port, &token("it-secret", "u7")).await;

    send_frame(
        &mut ws,
        &data_frame("m1", "chat.echo", serde_json::json!("authed")),
    )
    .await;
    let echoed = recv_frame(&mut ws).await;
    assert_eq!(echoed.data, serde_json::json!("authed"));

    // Identity came from the token claim.
    assert!(server.connection_for("u7").is_some());
}

#[tokio::test]
async fn jwt_rejects_invalid_token_with_err_frame() {
    let (server, handle) =
        start_server(AckMode::Disabled, Arc::new(JwtAuth::new("it-secret"))).await;
    let mut ws = connect_with_token(handle.port, "garbage-token").await;

    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply.frame_type, FrameType::Err);
    assert_closed(&mut ws).await;
    assert_eq!(server.connection_count(), 0);
}
