//! WebSocket connection handler
//!
//! Handles individual client connections: handshake and identity
//! resolution, then one reader pump and one writer pump per connection.
//! Whichever pump finishes first, the connection ends unregistered and
//! with its transport closed.

use chrono::Local;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::collaborators::{resolve_profile, AuthResolver, Services};
use crate::error::AppError;
use crate::hub::Hub;
use crate::message::{decode, ChatFrame, InboundFrame, OutboundFrame, TypingFrame, TypingKind};
use crate::types::{ClientId, ANONYMOUS};

/// Server-side timestamp format stamped on chat frames
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, resolves the caller's identity, registers
/// with the hub and runs both pumps until the connection ends.
pub async fn handle_connection(
    stream: TcpStream,
    hub: Hub,
    services: Services,
    client_queue: usize,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake, capturing the bearer token on the way
    let mut token = None;
    let capture_token = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        token = extract_token(req);
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_token).await?;
    let (ws_sender, ws_receiver) = ws_stream.split();

    let identity = resolve_identity(services.auth.as_ref(), token.as_deref()).await;
    let client_id = ClientId::new();
    info!("Client {} connected from {} as '{}'", client_id, peer_addr, identity);

    let (client, outbound) = Client::new(client_id, identity.clone(), client_queue);
    if let Err(e) = hub.register(client).await {
        error!("Failed to register client {}: {}", client_id, e);
        return Err(e);
    }

    let mut write_task = tokio::spawn(write_pump(client_id, ws_sender, outbound));
    let mut read_task = tokio::spawn(read_pump(
        client_id,
        identity,
        ws_receiver,
        hub.clone(),
        services,
    ));

    tokio::select! {
        _ = &mut read_task => {
            // The reader unregistered itself; the writer drains and closes
            debug!("Read task completed for {}", client_id);
            let _ = write_task.await;
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", client_id);
            read_task.abort();
        }
    }

    // Unregister is idempotent, so this covers every exit path
    let _ = hub.unregister(client_id).await;

    info!("Client {} disconnected", client_id);

    Ok(())
}

/// Bearer token from the percent-decoded `token` query parameter, else the
/// `Authorization: Bearer` header
pub fn extract_token(req: &Request) -> Option<String> {
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    token_from_parts(req.uri().query(), authorization)
}

fn token_from_parts(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, value)| *key == "token" && !value.is_empty())
            .and_then(|(_, value)| urlencoding::decode(value).ok())
            .map(|value| value.into_owned())
    });

    from_query.or_else(|| {
        authorization
            .and_then(|header| header.strip_prefix("Bearer "))
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

/// Resolve the connection identity
///
/// A missing or rejected token does not refuse the connection; it proceeds
/// as "Anonymous".
pub async fn resolve_identity(auth: &dyn AuthResolver, token: Option<&str>) -> String {
    let Some(token) = token else {
        return ANONYMOUS.to_string();
    };
    match auth.resolve(token).await {
        Ok(identity) if !identity.is_empty() => identity,
        Ok(_) => ANONYMOUS.to_string(),
        Err(e) => {
            debug!("Falling back to anonymous identity: {}", e);
            ANONYMOUS.to_string()
        }
    }
}

/// Reader pump: transport → hub
///
/// Ends on a transport error, a close frame, end of stream, or when the hub
/// is gone. Always unregisters the client on the way out.
pub async fn read_pump<R>(
    client_id: ClientId,
    identity: String,
    mut transport: R,
    hub: Hub,
    services: Services,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    // Name this connection is currently shown typing under, if any
    let mut typing_as: Option<String> = None;

    while let Some(msg_result) = transport.next().await {
        let result = match &msg_result {
            Ok(Message::Text(text)) => {
                handle_frame(text.as_bytes(), &identity, &mut typing_as, &hub, &services).await
            }
            Ok(Message::Binary(data)) => {
                handle_frame(&data[..], &identity, &mut typing_as, &hub, &services).await
            }
            Ok(Message::Close(_)) => {
                debug!("Client {} sent close frame", client_id);
                break;
            }
            Ok(_) => {
                // Ping/pong are answered by tungstenite
                continue;
            }
            Err(e) => {
                warn!("WebSocket error for {}: {}", client_id, e);
                break;
            }
        };

        match result {
            Ok(()) => {}
            Err(AppError::Json(e)) => {
                warn!("Invalid frame from {}: {}", client_id, e);
            }
            Err(AppError::EmptyContent) => {
                debug!("Empty message content from {}, skipping", client_id);
            }
            Err(e) => {
                debug!("Hub unavailable, ending read task for {}: {}", client_id, e);
                break;
            }
        }
    }

    // A connection that drops mid-message must not leave a stale indicator
    if let Some(name) = typing_as.take() {
        hub.set_typing(&name, false).await;
        let _ = hub.broadcast_typing(TypingFrame::stop(name)).await;
    }

    let _ = hub.unregister(client_id).await;
    debug!("Read task ended for {}", client_id);
}

async fn handle_frame(
    bytes: &[u8],
    identity: &str,
    typing_as: &mut Option<String>,
    hub: &Hub,
    services: &Services,
) -> Result<(), AppError> {
    match decode(bytes)? {
        InboundFrame::Typing(frame) => {
            handle_typing(frame.kind, identity, typing_as, hub, services).await
        }
        InboundFrame::Chat(frame) => handle_chat(frame, identity, typing_as, hub, services).await,
    }
}

/// Typing frames are attributed to the connection, whatever username they carry
async fn handle_typing(
    kind: TypingKind,
    identity: &str,
    typing_as: &mut Option<String>,
    hub: &Hub,
    services: &Services,
) -> Result<(), AppError> {
    let profile = resolve_profile(services.profiles.as_ref(), identity).await;
    let frame = TypingFrame::new(profile.display_name, kind);

    *typing_as = frame.is_typing.then(|| frame.username.clone());
    hub.set_typing(&frame.username, frame.is_typing).await;
    hub.broadcast_typing(frame).await
}

async fn handle_chat(
    inbound: ChatFrame,
    identity: &str,
    typing_as: &mut Option<String>,
    hub: &Hub,
    services: &Services,
) -> Result<(), AppError> {
    let profile = resolve_profile(services.profiles.as_ref(), identity).await;
    let now = Local::now();
    let frame = ChatFrame {
        username: profile.display_name,
        content: inbound.content,
        timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
        avatar: profile.avatar,
    };

    // No client may keep showing "typing" for someone who just sent a message
    *typing_as = None;
    hub.set_typing(&frame.username, false).await;
    hub.broadcast_typing(TypingFrame::stop(frame.username.clone()))
        .await?;

    if let Err(e) = services.store.append(identity, &frame.content).await {
        warn!("Failed to persist message from '{}': {}", identity, e);
    }
    if let Err(e) = services.activity.touch(identity, now).await {
        warn!("Failed to update last activity for '{}': {}", identity, e);
    }

    hub.broadcast(frame).await
}

/// Writer pump: outbound queue → transport
///
/// The only writer of the transport. A closed queue means the hub dropped
/// this client, so a close frame is sent; a write error ends the pump.
pub async fn write_pump<W>(
    client_id: ClientId,
    mut transport: W,
    mut outbound: mpsc::Receiver<OutboundFrame>,
) where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    loop {
        let Some(frame) = outbound.recv().await else {
            debug!("Outbound queue closed for {}", client_id);
            let _ = transport.send(Message::Close(None)).await;
            break;
        };

        if let Err(e) = transport.send(Message::Text(frame.to_string())).await {
            debug!("WebSocket send to {} failed: {}", client_id, e);
            break;
        }
    }

    let _ = transport.close().await;
    debug!("Write task ended for {}", client_id);
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::http;

    use super::*;
    use crate::collaborators::{Directory, MessageStore};

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _identity: &str, _content: &str) -> Result<u64, AppError> {
            Err(AppError::Persistence("disk full".to_string()))
        }
    }

    async fn setup() -> (Hub, Services, Arc<Directory>) {
        let directory = Arc::new(Directory::new());
        directory.add_user("alice", "", "/alice.png").await;
        directory.issue_token("t1", "alice").await;
        let services = Services::from_directory(directory.clone());
        let (hub, hub_loop) = Hub::new(16, services.profiles.clone());
        tokio::spawn(hub_loop.run());
        (hub, services, directory)
    }

    async fn register(hub: &Hub, identity: &str) -> (ClientId, mpsc::Receiver<OutboundFrame>) {
        let (client, rx) = Client::new(ClientId::new(), identity, 16);
        let id = client.id;
        hub.register(client).await.unwrap();
        (id, rx)
    }

    fn text(json: &str) -> Result<Message, WsError> {
        Ok(Message::Text(json.to_string()))
    }

    fn parse(frame: &OutboundFrame) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(
            token_from_parts(Some("a=1&token=abc"), None),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_token_from_query_is_percent_decoded() {
        assert_eq!(
            token_from_parts(Some("token=a%2Bb%2Fc%3D%3D"), None),
            Some("a+b/c==".to_string())
        );
        // Invalid UTF-8 after decoding is treated as no token
        assert_eq!(token_from_parts(Some("token=%FF"), None), None);
    }

    #[test]
    fn test_token_from_header_and_precedence() {
        assert_eq!(
            token_from_parts(None, Some("Bearer xyz")),
            Some("xyz".to_string())
        );
        assert_eq!(
            token_from_parts(Some("token=abc"), Some("Bearer xyz")),
            Some("abc".to_string())
        );
        assert_eq!(token_from_parts(Some("token="), Some("Basic xyz")), None);
        assert_eq!(token_from_parts(None, None), None);
    }

    #[test]
    fn test_extract_token_from_request() {
        let req = http::Request::builder()
            .uri("/ws")
            .header("Authorization", "Bearer t1")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&req), Some("t1".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_identity_falls_back_to_anonymous() {
        let directory = Directory::new();
        directory.issue_token("t1", "alice").await;

        assert_eq!(resolve_identity(&directory, Some("t1")).await, "alice");
        assert_eq!(resolve_identity(&directory, Some("bad")).await, ANONYMOUS);
        assert_eq!(resolve_identity(&directory, None).await, ANONYMOUS);
    }

    #[tokio::test]
    async fn test_chat_clears_typing_then_broadcasts() {
        let (hub, services, directory) = setup().await;
        let (_bob, mut bob_rx) = register(&hub, ANONYMOUS).await;
        let (alice_id, _alice_rx) = register(&hub, "alice").await;

        let transport = stream::iter(vec![
            text(r#"{"type":"typing_start","username":"mallory","is_typing":true}"#),
            text(r#"{"username":"mallory","content":"hi","timestamp":"1999-01-01 00:00:00"}"#),
        ]);
        read_pump(alice_id, "alice".to_string(), transport, hub.clone(), services).await;

        let start = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(start["type"], "typing_start");
        assert_eq!(start["username"], "alice");

        let stop = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(stop["type"], "typing_stop");
        assert_eq!(stop["username"], "alice");
        assert_eq!(stop["is_typing"], false);

        let chat = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(chat["username"], "alice");
        assert_eq!(chat["content"], "hi");
        assert_eq!(chat["avatar"], "/alice.png");
        assert_ne!(chat["timestamp"], "1999-01-01 00:00:00");
        assert_eq!(chat["timestamp"].as_str().unwrap().len(), 19);

        assert!(hub.typing_users().await.is_empty());
        let stored = directory.recent(10).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].username, "alice");
        assert!(directory.last_active("alice").await.is_some());

        // Reader unregistered itself when the transport ended
        assert_eq!(hub.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_and_empty_frames_are_dropped() {
        let (hub, services, directory) = setup().await;
        let (_bob, mut bob_rx) = register(&hub, ANONYMOUS).await;

        let transport = stream::iter(vec![
            text("not json"),
            text(r#"{"content":""}"#),
            Ok(Message::Ping(vec![1])),
            text(r#"{"content":"ok"}"#),
        ]);
        read_pump(ClientId::new(), ANONYMOUS.to_string(), transport, hub, services).await;

        let stop = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(stop["type"], "typing_stop");
        let chat = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(chat["content"], "ok");
        assert_eq!(chat["username"], ANONYMOUS);
        assert!(bob_rx.try_recv().is_err());

        assert_eq!(directory.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_chat_with_null_username_is_delivered() {
        let (hub, services, directory) = setup().await;
        let (_bob, mut bob_rx) = register(&hub, ANONYMOUS).await;

        let transport = stream::iter(vec![text(
            r#"{"username":null,"content":"hello","timestamp":null,"avatar":null}"#,
        )]);
        read_pump(ClientId::new(), ANONYMOUS.to_string(), transport, hub, services).await;

        let _stop = bob_rx.recv().await.unwrap();
        let chat = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(chat["username"], ANONYMOUS);
        assert_eq!(chat["content"], "hello");
        assert_eq!(directory.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_typing_clears_indicator() {
        let (hub, services, _directory) = setup().await;
        let (_bob, mut bob_rx) = register(&hub, ANONYMOUS).await;
        let (alice_id, _alice_rx) = register(&hub, "alice").await;

        let transport = stream::iter(vec![text(r#"{"type":"typing_start","username":null}"#)]);
        read_pump(alice_id, "alice".to_string(), transport, hub.clone(), services).await;

        let start = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(start["type"], "typing_start");
        let stop = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(stop["type"], "typing_stop");
        assert_eq!(stop["username"], "alice");
        assert!(hub.typing_users().await.is_empty());
        assert_eq!(hub.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_after_stop_sends_nothing_extra() {
        let (hub, services, _directory) = setup().await;
        let (_bob, mut bob_rx) = register(&hub, ANONYMOUS).await;

        let transport = stream::iter(vec![
            text(r#"{"type":"typing_start"}"#),
            text(r#"{"type":"typing_stop"}"#),
        ]);
        read_pump(ClientId::new(), "alice".to_string(), transport, hub, services).await;

        assert_eq!(parse(&bob_rx.recv().await.unwrap())["type"], "typing_start");
        assert_eq!(parse(&bob_rx.recv().await.unwrap())["type"], "typing_stop");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_persistence_failure_still_broadcasts() {
        let (hub, mut services, _directory) = setup().await;
        services.store = Arc::new(FailingStore);
        let (_bob, mut bob_rx) = register(&hub, ANONYMOUS).await;

        let transport = stream::iter(vec![text(r#"{"content":"still here"}"#)]);
        read_pump(ClientId::new(), "alice".to_string(), transport, hub, services).await;

        let _stop = bob_rx.recv().await.unwrap();
        let chat = parse(&bob_rx.recv().await.unwrap());
        assert_eq!(chat["content"], "still here");
    }

    #[tokio::test]
    async fn test_reader_stops_on_transport_error() {
        let (hub, services, _directory) = setup().await;
        let (alice_id, mut alice_rx) = register(&hub, "alice").await;

        let transport = stream::iter(vec![
            Err(WsError::ConnectionClosed),
            text(r#"{"content":"never seen"}"#),
        ]);
        read_pump(alice_id, "alice".to_string(), transport, hub.clone(), services).await;

        assert_eq!(hub.online_count().await, 0);
        assert!(alice_rx.recv().await.is_none());
    }

    type BoxSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

    fn recording_sink(log: Arc<Mutex<Vec<Message>>>) -> BoxSink {
        Box::pin(futures_util::sink::unfold(log, |log, msg: Message| async move {
            log.lock().unwrap().push(msg);
            Ok::<_, WsError>(log)
        }))
    }

    #[tokio::test]
    async fn test_writer_drains_then_sends_close() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel::<OutboundFrame>(4);
        tx.send(Arc::from("one")).await.unwrap();
        tx.send(Arc::from("two")).await.unwrap();
        drop(tx);

        write_pump(ClientId::new(), recording_sink(log.clone()), rx).await;

        let sent = log.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                Message::Text("one".to_string()),
                Message::Text("two".to_string()),
                Message::Close(None),
            ]
        );
    }

    #[tokio::test]
    async fn test_writer_stops_on_write_error() {
        let attempts = Arc::new(Mutex::new(0usize));
        let counter = attempts.clone();
        let failing: BoxSink = Box::pin(futures_util::sink::unfold(
            counter,
            |counter, _msg: Message| async move {
                *counter.lock().unwrap() += 1;
                Err::<Arc<Mutex<usize>>, _>(WsError::ConnectionClosed)
            },
        ));
        let (tx, rx) = mpsc::channel::<OutboundFrame>(4);
        tx.send(Arc::from("one")).await.unwrap();
        tx.send(Arc::from("two")).await.unwrap();

        // Returns even though the queue is still open
        timeout(Duration::from_secs(1), write_pump(ClientId::new(), failing, rx))
            .await
            .unwrap();
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    async fn next_frame<S>(ws: &mut S) -> Value
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let msg = timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_alice_chats_anonymous_bob_receives() {
        let (hub, services, _directory) = setup().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_hub = hub.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    server_hub.clone(),
                    services.clone(),
                    16,
                ));
            }
        });

        let (mut bob, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        let (mut alice, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/ws?token=t1", addr))
                .await
                .unwrap();

        for _ in 0..200 {
            if hub.online_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.online_count().await, 2);

        alice
            .send(Message::Text(r#"{"type":"typing_start"}"#.into()))
            .await
            .unwrap();
        alice
            .send(Message::Text(r#"{"content":"hi"}"#.into()))
            .await
            .unwrap();

        let start = next_frame(&mut bob).await;
        assert_eq!(start["type"], "typing_start");
        assert_eq!(start["username"], "alice");

        let stop = next_frame(&mut bob).await;
        assert_eq!(stop["type"], "typing_stop");
        assert_eq!(stop["username"], "alice");

        let chat = next_frame(&mut bob).await;
        assert_eq!(chat["username"], "alice");
        assert_eq!(chat["content"], "hi");
        assert!(!chat["timestamp"].as_str().unwrap().is_empty());

        let mut online: Vec<String> = hub
            .online_users()
            .await
            .into_iter()
            .map(|u| u.username)
            .collect();
        online.sort();
        assert_eq!(online, vec!["Anonymous".to_string(), "alice".to_string()]);

        alice.close(None).await.unwrap();
        for _ in 0..200 {
            if hub.online_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.online_count().await, 1);
    }
}
