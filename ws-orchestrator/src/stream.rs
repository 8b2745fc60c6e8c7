//! Fan-out of workspace status events to live subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: a
//! subscriber whose queue is full is disconnected with an overflow error
//! while everyone else keeps receiving. Subscriptions start from "now";
//! there is no history replay.

use crate::error::OrchestratorError;
use crate::workspace::StatusEvent;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StatusEvent>,
    overflowed: Arc<AtomicBool>,
}

type SubscriberMap = HashMap<String, Vec<Subscriber>>;

/// Hub distributing status events to per-workspace subscribers.
#[derive(Clone)]
pub struct StatusHub {
    inner: Arc<Mutex<SubscriberMap>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Subscribe to status events for one workspace, starting from now.
    ///
    /// The returned stream ends when the workspace reaches a terminal phase
    /// (hub closes it) and unsubscribes itself on drop.
    pub fn subscribe(&self, workspace_id: &str) -> StatusStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(workspace_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                tx,
                overflowed: overflowed.clone(),
            });

        StatusStream {
            rx,
            overflowed,
            overflow_reported: false,
            hub: self.inner.clone(),
            workspace_id: workspace_id.to_string(),
            id,
        }
    }

    /// Deliver an event to every current subscriber of its workspace.
    ///
    /// Returns the number of subscribers that received the event. A
    /// subscriber with a full buffer is dropped on the spot; its stream
    /// reports the overflow after draining what it already has.
    pub fn publish(&self, event: &StatusEvent) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let Some(subs) = inner.get_mut(&event.workspace_id) else {
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    workspace_id = %event.workspace_id,
                    subscriber = sub.id,
                    "status subscriber overflowed, disconnecting"
                );
                sub.overflowed.store(true, Ordering::Release);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if subs.is_empty() {
            inner.remove(&event.workspace_id);
        }

        delivered
    }

    /// End all subscriptions for a workspace. Subscribers still drain
    /// events already buffered, then their streams terminate.
    pub fn close(&self, workspace_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(workspace_id);
    }

    /// A stream that is already finished. Used when subscribing to a
    /// workspace that has reached a terminal phase.
    pub fn ended(&self) -> StatusStream {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);

        StatusStream {
            rx,
            overflowed: Arc::new(AtomicBool::new(false)),
            overflow_reported: false,
            hub: self.inner.clone(),
            workspace_id: String::new(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn subscriber_count(&self, workspace_id: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(workspace_id).map_or(0, Vec::len)
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Ordered stream of status events for one workspace.
pub struct StatusStream {
    rx: mpsc::Receiver<StatusEvent>,
    overflowed: Arc<AtomicBool>,
    overflow_reported: bool,
    hub: Arc<Mutex<SubscriberMap>>,
    workspace_id: String,
    id: u64,
}

impl StatusStream {
    /// Receive the next event.
    ///
    /// `Ok(None)` means the stream ended normally (workspace terminal or
    /// hub shut down). A disconnect due to a full buffer surfaces as
    /// `Err(SubscriberOverflow)` once buffered events are drained.
    pub async fn recv(&mut self) -> Result<Option<StatusEvent>, OrchestratorError> {
        match self.rx.recv().await {
            Some(event) => Ok(Some(event)),
            None => {
                if self.take_overflow() {
                    Err(OrchestratorError::SubscriberOverflow)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn take_overflow(&mut self) -> bool {
        if self.overflow_reported {
            return false;
        }
        if self.overflowed.load(Ordering::Acquire) {
            self.overflow_reported = true;
            return true;
        }
        false
    }
}

impl Stream for StatusStream {
    type Item = Result<StatusEvent, OrchestratorError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                if this.take_overflow() {
                    Poll::Ready(Some(Err(OrchestratorError::SubscriberOverflow)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StatusStream {
    fn drop(&mut self) {
        let mut inner = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = inner.get_mut(&self.workspace_id) {
            subs.retain(|sub| sub.id != self.id);
            if subs.is_empty() {
                inner.remove(&self.workspace_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::LifecyclePhase;

    fn event(id: &str, phase: LifecyclePhase) -> StatusEvent {
        StatusEvent::new(id, phase, None)
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let hub = StatusHub::default();
        let mut stream = hub.subscribe("ws-1");

        hub.publish(&event("ws-1", LifecyclePhase::Starting));
        hub.publish(&event("ws-1", LifecyclePhase::Running));

        let first = stream.recv().await.unwrap().unwrap();
        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.phase, LifecyclePhase::Starting);
        assert_eq!(second.phase, LifecyclePhase::Running);
    }

    #[tokio::test]
    async fn events_are_scoped_to_workspace() {
        let hub = StatusHub::default();
        let mut stream = hub.subscribe("ws-1");

        assert_eq!(hub.publish(&event("ws-2", LifecyclePhase::Running)), 0);
        assert_eq!(hub.publish(&event("ws-1", LifecyclePhase::Running)), 1);

        let got = stream.recv().await.unwrap().unwrap();
        assert_eq!(got.workspace_id, "ws-1");
    }

    #[tokio::test]
    async fn overflow_disconnects_only_the_slow_subscriber() {
        let hub = StatusHub::new(2);
        let mut slow = hub.subscribe("ws-1");
        let mut fast = hub.subscribe("ws-1");

        // Fill the slow subscriber's buffer, then one more to overflow it.
        hub.publish(&event("ws-1", LifecyclePhase::Starting));
        hub.publish(&event("ws-1", LifecyclePhase::Running));
        drain_one(&mut fast).await;
        drain_one(&mut fast).await;
        hub.publish(&event("ws-1", LifecyclePhase::Stopping));

        assert_eq!(hub.subscriber_count("ws-1"), 1);

        // The fast subscriber still gets the event.
        let got = drain_one(&mut fast).await;
        assert_eq!(got.phase, LifecyclePhase::Stopping);

        // The slow one drains its buffer, then reports overflow.
        assert!(slow.recv().await.unwrap().is_some());
        assert!(slow.recv().await.unwrap().is_some());
        assert!(matches!(
            slow.recv().await,
            Err(OrchestratorError::SubscriberOverflow)
        ));
    }

    #[tokio::test]
    async fn close_ends_stream_after_draining() {
        let hub = StatusHub::default();
        let mut stream = hub.subscribe("ws-1");

        hub.publish(&event("ws-1", LifecyclePhase::Stopped));
        hub.close("ws-1");

        assert!(stream.recv().await.unwrap().is_some());
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drop_releases_subscription() {
        let hub = StatusHub::default();
        let stream = hub.subscribe("ws-1");
        assert_eq!(hub.subscriber_count("ws-1"), 1);

        drop(stream);
        assert_eq!(hub.subscriber_count("ws-1"), 0);
    }

    async fn drain_one(stream: &mut StatusStream) -> StatusEvent {
        stream.recv().await.unwrap().expect("stream ended early")
    }
}
