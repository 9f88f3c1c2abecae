//! Fan-out of execution events to live subscribers.
//!
//! Publishing is strictly non-blocking: each subscriber owns a bounded
//! buffer, and a subscriber that lets its buffer fill up is cut loose rather
//! than ever stalling the producer or its peers. Delivery order to one
//! subscriber matches publish order; there is no ordering across subscribers.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use oscar_lib::ExecutionStatus;

/// Outbound buffer size per subscriber.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// A progress point for one execution.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ProgressEvent {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub percent: f64,
    pub rate: f64,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
}

/// Server-to-subscriber envelope, JSON-encoded as `{type, data}`.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        subscription_id: String,
    },
    ExecutionLog {
        execution_id: String,
        log_line: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionProgress(ProgressEvent),
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
    },
}

/// Subscriber-to-server control message.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeExecution { execution_id: String },
    UnsubscribeExecution,
    Ping,
}

/// What a subscriber wants to see.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum SubscriptionFilter {
    /// Every execution
    All,
    /// One execution id
    Execution(String),
    /// Nothing until a subscribe message arrives
    Idle,
}

impl SubscriptionFilter {
    fn matches(&self, execution_id: &str) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Execution(id) => id == execution_id,
            SubscriptionFilter::Idle => false,
        }
    }
}

struct Subscriber {
    user: String,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<ServerEvent>,
    closed: CancellationToken,
}

/// The receiving half handed to the transport layer.
pub struct SubscriberHandle {
    pub id: String,
    pub rx: mpsc::Receiver<ServerEvent>,
    /// Raised when the broadcaster cuts this subscriber loose
    pub closed: CancellationToken,
}

/// Owns the subscriber set. Publishes take the read lock and iterate;
/// membership changes take the write lock.
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    /// Latest known progress per execution, replayed on subscribe
    latest: RwLock<HashMap<String, ProgressEvent>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and deliver its `connected` event.
    pub fn subscribe(&self, user: &str, filter: SubscriptionFilter) -> SubscriberHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let closed = CancellationToken::new();

        let _ = tx.try_send(ServerEvent::Connected {
            subscription_id: id.clone(),
        });
        if let SubscriptionFilter::Execution(execution_id) = &filter {
            if let Some(progress) = self.latest.read().unwrap().get(execution_id) {
                let _ = tx.try_send(ServerEvent::ExecutionProgress(progress.clone()));
            }
        }

        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.insert(
            id.clone(),
            Subscriber {
                user: user.to_string(),
                filter,
                tx,
                closed: closed.clone(),
            },
        );
        oscar_metrics::SUBSCRIBER_COUNT.set(subscribers.len() as i64);
        debug!(subscription_id = %id, %user, "subscriber registered");

        SubscriberHandle { id, rx, closed }
    }

    /// Drop a subscriber. Its buffer closes and subsequent publishes no
    /// longer see it.
    pub fn unsubscribe(&self, id: &str) {
        let mut subscribers = self.subscribers.write().unwrap();
        if let Some(subscriber) = subscribers.remove(id) {
            subscriber.closed.cancel();
            oscar_metrics::SUBSCRIBER_COUNT.set(subscribers.len() as i64);
            debug!(subscription_id = %id, "subscriber removed");
        }
    }

    /// Handle one control message from a subscriber.
    pub fn handle_client_message(&self, id: &str, message: ClientMessage) {
        match message {
            ClientMessage::SubscribeExecution { execution_id } => {
                let latest = self.latest.read().unwrap().get(&execution_id).cloned();
                let mut subscribers = self.subscribers.write().unwrap();
                if let Some(subscriber) = subscribers.get_mut(id) {
                    // Replace the filter and replay the latest known state.
                    subscriber.filter = SubscriptionFilter::Execution(execution_id);
                    if let Some(progress) = latest {
                        let _ = subscriber
                            .tx
                            .try_send(ServerEvent::ExecutionProgress(progress));
                    }
                }
            }
            ClientMessage::UnsubscribeExecution => {
                let mut subscribers = self.subscribers.write().unwrap();
                if let Some(subscriber) = subscribers.get_mut(id) {
                    subscriber.filter = SubscriptionFilter::Idle;
                }
            }
            ClientMessage::Ping => {
                let subscribers = self.subscribers.read().unwrap();
                if let Some(subscriber) = subscribers.get(id) {
                    let _ = subscriber.tx.try_send(ServerEvent::Pong {
                        timestamp: Utc::now().timestamp(),
                    });
                }
            }
        }
    }

    /// Publish one captured log line for an execution.
    pub fn publish_log(&self, execution_id: &str, log_line: &str) {
        oscar_metrics::EVENTS_PUBLISHED_COUNT
            .with_label_values(&["execution_log"])
            .inc();
        self.publish(
            execution_id,
            ServerEvent::ExecutionLog {
                execution_id: execution_id.to_string(),
                log_line: log_line.to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Publish a progress update and remember it as the latest known state.
    pub fn publish_progress(&self, progress: ProgressEvent) {
        oscar_metrics::EVENTS_PUBLISHED_COUNT
            .with_label_values(&["execution_progress"])
            .inc();
        let execution_id = progress.execution_id.clone();
        let terminal = progress.status.is_terminal();
        if terminal {
            self.latest.write().unwrap().remove(&execution_id);
        } else {
            self.latest
                .write()
                .unwrap()
                .insert(execution_id.clone(), progress.clone());
        }
        self.publish(&execution_id, ServerEvent::ExecutionProgress(progress));
    }

    /// Deliver to every matching subscriber without ever blocking. Lagging
    /// or departed subscribers are reaped after the sweep.
    fn publish(&self, execution_id: &str, event: ServerEvent) {
        let mut dead: Vec<String> = Vec::new();
        {
            let subscribers = self.subscribers.read().unwrap();
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.filter.matches(execution_id) {
                    continue;
                }
                if subscriber.closed.is_cancelled() {
                    dead.push(id.clone());
                    continue;
                }
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            subscription_id = %id,
                            user = %subscriber.user,
                            "subscriber buffer full, dropping subscriber"
                        );
                        oscar_metrics::SUBSCRIBERS_DROPPED_COUNT.inc();
                        subscriber.closed.cancel();
                        dead.push(id.clone());
                    }
                    Err(TrySendError::Closed(_)) => {
                        dead.push(id.clone());
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().unwrap();
            for id in dead {
                if let Some(subscriber) = subscribers.remove(&id) {
                    subscriber.closed.cancel();
                }
            }
            oscar_metrics::SUBSCRIBER_COUNT.set(subscribers.len() as i64);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(execution_id: &str, percent: f64) -> ProgressEvent {
        ProgressEvent {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Running,
            percent,
            rate: 0.0,
            stage: "executing DDL".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivery_order_matches_publish_order() {
        let broadcaster = EventBroadcaster::new();
        let mut handle =
            broadcaster.subscribe("alice", SubscriptionFilter::Execution("exec-1".to_string()));
        assert!(matches!(
            handle.rx.recv().await,
            Some(ServerEvent::Connected { .. })
        ));

        for i in 0..5 {
            broadcaster.publish_log("exec-1", &format!("line {i}"));
        }
        for i in 0..5 {
            match handle.rx.recv().await {
                Some(ServerEvent::ExecutionLog { log_line, .. }) => {
                    assert_eq!(log_line, format!("line {i}"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn filter_limits_delivery_to_one_execution() {
        let broadcaster = EventBroadcaster::new();
        let mut handle =
            broadcaster.subscribe("alice", SubscriptionFilter::Execution("exec-1".to_string()));
        let _ = handle.rx.recv().await; // connected

        broadcaster.publish_log("exec-2", "other");
        broadcaster.publish_log("exec-1", "mine");
        match handle.rx.recv().await {
            Some(ServerEvent::ExecutionLog { log_line, .. }) => assert_eq!(log_line, "mine"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped_without_blocking_others() {
        let broadcaster = EventBroadcaster::new();
        let slow = broadcaster.subscribe("slow", SubscriptionFilter::All);
        let mut healthy = broadcaster.subscribe("healthy", SubscriptionFilter::All);
        let _ = healthy.rx.recv().await; // connected

        // The slow subscriber never drains; its `connected` event already
        // holds one slot, so this run over the buffer evicts it.
        for i in 0..SUBSCRIBER_BUFFER {
            broadcaster.publish_log("exec-1", &format!("line {i}"));
        }
        assert!(slow.closed.is_cancelled());
        assert_eq!(broadcaster.subscriber_count(), 1);

        // The healthy subscriber saw everything, in order.
        for i in 0..SUBSCRIBER_BUFFER {
            match healthy.rx.recv().await {
                Some(ServerEvent::ExecutionLog { log_line, .. }) => {
                    assert_eq!(log_line, format!("line {i}"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn subscribe_replays_the_latest_progress() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish_progress(progress("exec-1", 40.0));

        let mut handle = broadcaster.subscribe("alice", SubscriptionFilter::Idle);
        let _ = handle.rx.recv().await; // connected
        broadcaster.handle_client_message(
            &handle.id,
            ClientMessage::SubscribeExecution {
                execution_id: "exec-1".to_string(),
            },
        );
        match handle.rx.recv().await {
            Some(ServerEvent::ExecutionProgress(event)) => assert_eq!(event.percent, 40.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_progress_clears_the_replay_state() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish_progress(progress("exec-1", 40.0));
        let mut terminal = progress("exec-1", 100.0);
        terminal.status = ExecutionStatus::Completed;
        broadcaster.publish_progress(terminal);

        let mut handle =
            broadcaster.subscribe("alice", SubscriptionFilter::Execution("exec-1".to_string()));
        match handle.rx.recv().await {
            Some(ServerEvent::Connected { .. }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(handle.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let broadcaster = EventBroadcaster::new();
        let mut handle = broadcaster.subscribe("alice", SubscriptionFilter::Idle);
        let _ = handle.rx.recv().await; // connected
        broadcaster.handle_client_message(&handle.id, ClientMessage::Ping);
        assert!(matches!(
            handle.rx.recv().await,
            Some(ServerEvent::Pong { .. })
        ));
    }

    #[test]
    fn envelopes_use_the_type_data_wire_shape() {
        let event = ServerEvent::Connected {
            subscription_id: "sub-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["data"]["subscription_id"], "sub-1");

        let message: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe_execution","data":{"execution_id":"exec-1"}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            ClientMessage::SubscribeExecution {
                execution_id: "exec-1".to_string()
            }
        );
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);
    }
}
