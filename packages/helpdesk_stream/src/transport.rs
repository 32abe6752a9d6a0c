//! WebSocket pub/sub transport.
//!
//! The server speaks the cable protocol: the client subscribes a channel by
//! sending `{"command":"subscribe","identifier":"<json>"}`; the server answers
//! with `welcome` / `ping` / `confirm_subscription` control frames and wraps
//! every broadcast as `{"identifier":..., "message":{"event":..., "data":...}}`.
//! [`Connection::next_frame`] unwraps broadcasts and swallows control frames,
//! so callers only ever see event envelopes (or unrecognised raw text).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::{debug, info};

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// How long [`Connection::subscribe`] waits for the server's answer.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One logical channel: name plus the credentials the server checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDescriptor {
    pub channel: String,
    pub pubsub_token: String,
    pub account_id: u64,
    pub user_id: u64,
}

impl ChannelDescriptor {
    pub const DEFAULT_CHANNEL: &'static str = "RoomChannel";

    /// The JSON-encoded identifier string the cable protocol expects.
    pub fn identifier(&self) -> String {
        // Serializing a struct of strings and integers cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub struct Connection {
    sink: WsSink,
    stream: SplitStream<WsStream>,
    identifier: Option<String>,
    confirmed: bool,
    /// Broadcasts that arrived ahead of the confirmation.
    backlog: VecDeque<String>,
}

/// Open a WebSocket connection. Nothing is subscribed yet.
pub async fn connect(url: &str) -> Result<Connection, TransportError> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(TransportError::Connect)?;
    info!(url, "websocket connected");
    let (sink, stream) = ws.split();
    Ok(Connection {
        sink: Arc::new(Mutex::new(sink)),
        stream,
        identifier: None,
        confirmed: false,
        backlog: VecDeque::new(),
    })
}

impl Connection {
    /// Subscribe and wait up to [`SUBSCRIBE_TIMEOUT`] for the server to
    /// confirm or reject.
    pub async fn subscribe(&mut self, channel: &ChannelDescriptor) -> Result<(), TransportError> {
        self.subscribe_within(channel, SUBSCRIBE_TIMEOUT).await
    }

    pub async fn subscribe_within(
        &mut self,
        channel: &ChannelDescriptor,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let identifier = channel.identifier();
        let command = json!({ "command": "subscribe", "identifier": identifier });
        send_text(&self.sink, command.to_string()).await?;
        debug!(channel = %channel.channel, account_id = channel.account_id, "subscribe sent");
        self.identifier = Some(identifier);
        self.confirmed = false;

        tokio::time::timeout(timeout, self.await_confirmation())
            .await
            .map_err(|_| TransportError::SubscribeTimeout {
                channel: channel.channel.clone(),
                waited: timeout,
            })?
    }

    async fn await_confirmation(&mut self) -> Result<(), TransportError> {
        while !self.confirmed {
            match self.read_frame().await {
                Some(Ok(frame)) => self.backlog.push_back(frame),
                Some(Err(err)) => return Err(err),
                None => return Err(TransportError::Closed { reason: None }),
            }
        }
        Ok(())
    }

    /// Next event envelope as raw JSON text. `None` when the stream ended.
    pub async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        if let Some(frame) = self.backlog.pop_front() {
            return Some(Ok(frame));
        }
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(TransportError::Receive(err))),
            };
            match message {
                Message::Text(text) => {
                    if let Some(frame) = self.unwrap_frame(text.as_str()) {
                        return Some(frame);
                    }
                }
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                    return Some(Err(TransportError::Closed { reason }));
                }
                // Pings are answered by tungstenite; binary frames carry nothing for us
                _ => {}
            }
        }
    }

    /// Lazy stream of frames until disconnect.
    pub fn listen(&mut self) -> impl Stream<Item = Result<String, TransportError>> + '_ {
        futures_util::stream::unfold(self, |conn| async move {
            let item = conn.next_frame().await?;
            Some((item, conn))
        })
    }

    /// `None` for control frames that should be skipped.
    fn unwrap_frame(&mut self, text: &str) -> Option<Result<String, TransportError>> {
        let Ok(Value::Object(mut envelope)) = serde_json::from_str::<Value>(text) else {
            // Not ours to judge; the router drops what it cannot decode
            return Some(Ok(text.to_string()));
        };

        match envelope.get("type").and_then(Value::as_str) {
            Some("welcome") | Some("ping") => return None,
            Some("confirm_subscription") => {
                info!("subscription confirmed");
                self.confirmed = true;
                return None;
            }
            Some("reject_subscription") => {
                return Some(Err(TransportError::SubscriptionRejected {
                    channel: self.identifier.clone().unwrap_or_default(),
                }));
            }
            Some("disconnect") => {
                let reason = envelope
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Some(Err(TransportError::Closed { reason }));
            }
            _ => {}
        }

        match envelope.remove("message") {
            Some(message @ Value::Object(_)) => Some(Ok(message.to_string())),
            Some(_) => None,
            None => Some(Ok(text.to_string())),
        }
    }

    /// Send a presence heartbeat every `interval` until the handle is dropped.
    pub fn start_presence<F>(&self, interval: Duration, on_error: F) -> Result<PresenceHandle, TransportError>
    where
        F: Fn(TransportError) + Send + 'static,
    {
        let identifier = self.identifier.clone().ok_or(TransportError::NotSubscribed)?;
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            let data = json!({ "action": "update_presence" }).to_string();
            let beat = json!({ "command": "message", "identifier": identifier, "data": data })
                .to_string();
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = send_text(&sink, beat.clone()).await {
                    on_error(err);
                    break;
                }
            }
        });
        Ok(PresenceHandle { task })
    }

    /// Best-effort close handshake.
    pub async fn close(self) {
        let _ = self.sink.lock().await.close().await;
    }
}

async fn send_text(sink: &WsSink, text: String) -> Result<(), TransportError> {
    sink.lock()
        .await
        .send(Message::Text(text.into()))
        .await
        .map_err(TransportError::Send)
}

/// Stops the heartbeat task when dropped.
pub struct PresenceHandle {
    task: JoinHandle<()>,
}

impl PresenceHandle {
    pub fn stop(self) {}
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        routing::get,
    };
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    fn channel() -> ChannelDescriptor {
        ChannelDescriptor {
            channel: ChannelDescriptor::DEFAULT_CHANNEL.to_string(),
            pubsub_token: "tok".to_string(),
            account_id: 1,
            user_id: 2,
        }
    }

    /// Cable-like server: confirms the subscription, broadcasts `frames`,
    /// forwards everything the client sends to `seen`, then idles.
    async fn spawn_cable(frames: Vec<String>) -> (String, mpsc::UnboundedReceiver<String>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/cable",
            get(move |ws: WebSocketUpgrade| {
                let frames = frames.clone();
                let seen_tx = seen_tx.clone();
                async move { ws.on_upgrade(move |socket| serve(socket, frames, seen_tx)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://127.0.0.1:{port}/cable"), seen_rx)
    }

    async fn serve(mut socket: WebSocket, frames: Vec<String>, seen: mpsc::UnboundedSender<String>) {
        let _ = socket
            .send(AxumMessage::Text(r#"{"type":"welcome"}"#.into()))
            .await;
        // Wait for the subscribe command
        if let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
            let _ = seen.send(text.as_str().to_string());
        }
        let _ = socket
            .send(AxumMessage::Text(r#"{"type":"confirm_subscription"}"#.into()))
            .await;
        let _ = socket
            .send(AxumMessage::Text(r#"{"type":"ping","message":1}"#.into()))
            .await;
        for frame in frames {
            let _ = socket.send(AxumMessage::Text(frame.into())).await;
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if let AxumMessage::Text(text) = msg {
                let _ = seen.send(text.as_str().to_string());
            }
        }
    }

    #[tokio::test]
    async fn subscribes_and_unwraps_broadcasts() {
        let broadcast =
            r#"{"identifier":"x","message":{"event":"message.created","data":{"id":1}}}"#;
        let (url, mut seen) = spawn_cable(vec![broadcast.to_string(), "garbage".to_string()]).await;

        let mut conn = connect(&url).await.unwrap();
        conn.subscribe(&channel()).await.unwrap();

        let subscribe: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(subscribe["command"], "subscribe");
        let identifier: Value =
            serde_json::from_str(subscribe["identifier"].as_str().unwrap()).unwrap();
        assert_eq!(identifier["channel"], "RoomChannel");
        assert_eq!(identifier["pubsub_token"], "tok");
        assert_eq!(identifier["account_id"], 1);
        assert_eq!(identifier["user_id"], 2);

        let mut frames = std::pin::pin!(conn.listen());
        let first: Value =
            serde_json::from_str(&frames.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["event"], "message.created");
        assert_eq!(first["data"]["id"], 1);
        // Unrecognised text is passed through for the router to drop
        assert_eq!(frames.next().await.unwrap().unwrap(), "garbage");
    }

    #[tokio::test]
    async fn presence_heartbeat_is_sent_periodically() {
        let (url, mut seen) = spawn_cable(Vec::new()).await;
        let mut conn = connect(&url).await.unwrap();
        conn.subscribe(&channel()).await.unwrap();
        let _subscribe = seen.recv().await.unwrap();

        let handle = conn
            .start_presence(Duration::from_millis(50), |_| {})
            .unwrap();
        let beat: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(beat["command"], "message");
        assert!(beat["data"].as_str().unwrap().contains("update_presence"));
        handle.stop();
    }

    /// Answers the subscribe command with `reply`, if any, then idles.
    async fn spawn_answering(reply: Option<&'static str>) -> String {
        let app = Router::new().route(
            "/cable",
            get(move |ws: WebSocketUpgrade| async move {
                ws.on_upgrade(move |mut socket: WebSocket| async move {
                    let _subscribe = socket.recv().await;
                    let _ = socket
                        .send(AxumMessage::Text(r#"{"type":"ping","message":1}"#.into()))
                        .await;
                    if let Some(reply) = reply {
                        let _ = socket.send(AxumMessage::Text(reply.into())).await;
                    }
                    while let Some(Ok(_)) = socket.recv().await {}
                })
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://127.0.0.1:{port}/cable")
    }

    #[tokio::test]
    async fn rejected_subscription_is_an_error() {
        let url = spawn_answering(Some(r#"{"type":"reject_subscription"}"#)).await;
        let mut conn = connect(&url).await.unwrap();
        let err = conn.subscribe(&channel()).await.unwrap_err();
        assert!(matches!(err, TransportError::SubscriptionRejected { .. }), "{err}");
    }

    #[tokio::test]
    async fn unanswered_subscription_times_out() {
        let url = spawn_answering(None).await;
        let mut conn = connect(&url).await.unwrap();
        let err = conn
            .subscribe_within(&channel(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SubscribeTimeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn broadcast_ahead_of_confirmation_is_kept() {
        let url = spawn_answering(Some(
            r#"{"identifier":"x","message":{"event":"message.created","data":{"id":9}}}"#,
        ))
        .await;
        // The server never confirms; the broadcast must still not be lost
        let mut conn = connect(&url).await.unwrap();
        let _ = conn.subscribe_within(&channel(), Duration::from_millis(100)).await;
        let frame: Value = serde_json::from_str(&conn.next_frame().await.unwrap().unwrap()).unwrap();
        assert_eq!(frame["data"]["id"], 9);
    }

    #[tokio::test]
    async fn presence_requires_subscription() {
        let (url, _seen) = spawn_cable(Vec::new()).await;
        let conn = connect(&url).await.unwrap();
        assert!(matches!(
            conn.start_presence(Duration::from_secs(1), |_| {}),
            Err(TransportError::NotSubscribed)
        ));
    }

    #[tokio::test]
    async fn connect_refused_is_reported() {
        let err = match connect("ws://127.0.0.1:1/cable").await {
            Err(err) => err,
            Ok(_) => panic!("nothing listens on port 1"),
        };
        assert!(err.is_refused(), "{err}");
    }
}
