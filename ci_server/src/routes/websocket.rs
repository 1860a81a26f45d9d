//! WebSocket observer endpoint.
//!
//! Every connection is subscribed to the global topic. Clients opt into a
//! build's live status and log events by sending
//! `{"action":"subscribe-build","build_id":"..."}` and leave with
//! `unsubscribe-build`. All subscriptions are released when the socket
//! closes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::context::AppContext;
use crate::events::{CiBuildEvent, EventBus, SubscriptionHandle, Topic};
use crate::models::build::BuildId;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientMessage {
    SubscribeBuild { build_id: BuildId },
    UnsubscribeBuild { build_id: BuildId },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Reply {
    Subscribed { build_id: BuildId },
    Unsubscribed { build_id: BuildId },
    Error { message: String },
}

/// One observer's set of topic subscriptions, merged into a single stream.
pub struct ObserverSession {
    bus: EventBus,
    merged: mpsc::UnboundedSender<CiBuildEvent>,
    handles: HashMap<Topic, SubscriptionHandle>,
}

impl ObserverSession {
    pub fn new(bus: EventBus) -> (Self, mpsc::UnboundedReceiver<CiBuildEvent>) {
        let (merged, events) = mpsc::unbounded_channel();
        let session = Self {
            bus,
            merged,
            handles: HashMap::new(),
        };
        (session, events)
    }

    /// Idempotent: a second subscribe to the same topic is a no-op.
    pub fn subscribe(&mut self, topic: Topic) {
        if self.handles.contains_key(&topic) {
            return;
        }
        let mut subscription = self.bus.subscribe(topic);
        self.handles.insert(topic, subscription.handle);

        let merged = self.merged.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.receiver.recv().await {
                if merged.send(event).is_err() {
                    break;
                }
            }
        });
    }

    pub fn unsubscribe(&mut self, topic: Topic) {
        if let Some(handle) = self.handles.remove(&topic) {
            self.bus.unsubscribe(&handle);
        }
    }

    pub fn topics(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        for handle in self.handles.values() {
            self.bus.unsubscribe(handle);
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<Arc<AppContext>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<AppContext>) {
    let (mut session, mut events) = ObserverSession::new(ctx.bus.clone());
    session.subscribe(Topic::Global);
    let mut closing = ctx.closing();
    tracing::info!("Observer connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = apply_client_message(&mut session, text.as_str());
                    if send_json(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("Observer socket error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
            Some(event) = events.recv() => {
                if send_json(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            _ = server_closing(&mut closing) => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    let topics = session.topics();
    drop(session);
    tracing::info!(
        topics,
        remaining_observers = ctx.bus.subscriber_count(Topic::Global),
        "Observer disconnected"
    );
}

/// Resolves once the context flips its closing flag. The borrowed value
/// is released here so the socket task stays `Send`.
async fn server_closing(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}

fn apply_client_message(session: &mut ObserverSession, text: &str) -> Reply {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::SubscribeBuild { build_id }) => {
            session.subscribe(Topic::Build(build_id));
            tracing::debug!(%build_id, "Observer subscribed to build");
            Reply::Subscribed { build_id }
        }
        Ok(ClientMessage::UnsubscribeBuild { build_id }) => {
            session.unsubscribe(Topic::Build(build_id));
            tracing::debug!(%build_id, "Observer unsubscribed from build");
            Reply::Unsubscribed { build_id }
        }
        Err(e) => Reply::Error {
            message: format!("unrecognized message: {e}"),
        },
    }
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    match serde_json::to_string(value) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!("Failed to encode observer message: {e}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CiBuildEvent;

    #[test]
    fn parses_client_actions() {
        let id = uuid::Uuid::new_v4();
        let msg: ClientMessage = serde_json::from_value(serde_json::json!({
            "action": "subscribe-build",
            "build_id": id,
        }))
        .unwrap();
        assert_eq!(msg, ClientMessage::SubscribeBuild { build_id: id });
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"shout"}"#).is_err());
    }

    #[tokio::test]
    async fn session_merges_topics_and_releases_on_drop() {
        let bus = EventBus::new();
        let build_id = uuid::Uuid::new_v4();
        let (mut session, mut events) = ObserverSession::new(bus.clone());
        session.subscribe(Topic::Global);
        assert_eq!(
            apply_client_message(
                &mut session,
                &format!(r#"{{"action":"subscribe-build","build_id":"{build_id}"}}"#)
            )
            .type_name(),
            "subscribed"
        );
        assert_eq!(bus.subscriber_count(Topic::Build(build_id)), 1);

        bus.publish(
            Topic::Build(build_id),
            CiBuildEvent::log_appended(build_id, "[INFO] hi\n"),
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.build_id(), build_id);

        drop(session);
        assert_eq!(bus.subscriber_count(Topic::Global), 0);
        assert_eq!(bus.subscriber_count(Topic::Build(build_id)), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_build_events() {
        let bus = EventBus::new();
        let build_id = uuid::Uuid::new_v4();
        let (mut session, _events) = ObserverSession::new(bus.clone());
        session.subscribe(Topic::Build(build_id));
        session.subscribe(Topic::Build(build_id));
        assert_eq!(bus.subscriber_count(Topic::Build(build_id)), 1);

        let reply = apply_client_message(
            &mut session,
            &format!(r#"{{"action":"unsubscribe-build","build_id":"{build_id}"}}"#),
        );
        assert_eq!(reply.type_name(), "unsubscribed");
        assert_eq!(bus.subscriber_count(Topic::Build(build_id)), 0);
    }

    #[allow(dead_code)]
    fn socket_task_is_send(socket: WebSocket, ctx: Arc<AppContext>) {
        fn require_send<T: Send>(_: &T) {}
        require_send(&handle_socket(socket, ctx));
    }

    #[tokio::test]
    async fn closing_signal_resolves_after_close_observers() {
        let ctx = AppContext::in_memory(crate::config::CiConfig::default());
        let mut closing = ctx.closing();

        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), server_closing(&mut closing))
                .await;
        assert!(pending.is_err());

        ctx.close_observers();
        tokio::time::timeout(std::time::Duration::from_secs(1), server_closing(&mut closing))
            .await
            .unwrap();
    }

    impl Reply {
        fn type_name(&self) -> &'static str {
            match self {
                Reply::Subscribed { .. } => "subscribed",
                Reply::Unsubscribed { .. } => "unsubscribed",
                Reply::Error { .. } => "error",
            }
        }
    }
}
