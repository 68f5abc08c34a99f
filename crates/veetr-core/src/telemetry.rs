//! Broadcast + history store for telemetry frames.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::wire::Telemetry;

/// Live-listener buffer depth.
const LIVE_CAPACITY: usize = 1024;

/// A telemetry frame stamped with its arrival time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryFrame {
    /// Arrival time (Unix epoch milliseconds).
    pub received_at: i64,
    /// Raw frame fields.
    pub telemetry: Telemetry,
}

impl TelemetryFrame {
    /// Stamp a frame with the current time.
    #[must_use]
    pub fn now(telemetry: Telemetry) -> Self {
        Self {
            received_at: now_millis(),
            telemetry,
        }
    }
}

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Telemetry store with broadcast and bounded history.
///
/// A display layer attaching late receives the recent frames first, then
/// live updates. The session clears the store when the link goes away.
pub struct TelemetryStore {
    history: RwLock<VecDeque<TelemetryFrame>>,
    capacity: usize,
    sender: broadcast::Sender<TelemetryFrame>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TelemetryStore {
    /// Create a store keeping at most `capacity` frames of history.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            sender,
        }
    }

    /// Push a frame to both live listeners and history.
    pub fn push(&self, frame: TelemetryFrame) {
        let _ = self.sender.send(frame.clone()); // live listeners

        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(frame);
    }

    /// Most recent frame.
    #[must_use]
    pub fn latest(&self) -> Option<TelemetryFrame> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Snapshot of the history, oldest first.
    #[must_use]
    pub fn get_history(&self) -> Vec<TelemetryFrame> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Drop all history.
    pub fn clear(&self) {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.sender.subscribe()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, TelemetryFrame> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn frame(sog: f64) -> TelemetryFrame {
        let serde_json::Value::Object(fields) = json!({ "SOG": sog }) else {
            unreachable!()
        };
        TelemetryFrame::now(Telemetry::new(fields))
    }

    #[test]
    fn test_history_is_bounded() {
        let store = TelemetryStore::new(3);
        for i in 0..5 {
            store.push(frame(f64::from(i)));
        }
        let history = store.get_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].telemetry.get("SOG"), Some(&json!(2.0)));
        assert_eq!(
            store.latest().unwrap().telemetry.get("SOG"),
            Some(&json!(4.0))
        );
    }

    #[test]
    fn test_clear() {
        let store = TelemetryStore::default();
        store.push(frame(1.0));
        store.clear();
        assert!(store.latest().is_none());
        assert!(store.get_history().is_empty());
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = TelemetryStore::new(8);
        store.push(frame(1.0));

        let mut stream = store.history_plus_stream();
        store.push(frame(2.0));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.telemetry.get("SOG"), Some(&json!(1.0)));
        assert_eq!(second.telemetry.get("SOG"), Some(&json!(2.0)));
    }
}
