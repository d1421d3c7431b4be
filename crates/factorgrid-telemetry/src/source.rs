//! Telemetry sources.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::event::TelemetryEvent;

/// Something the feed can poll for new events.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Events that arrived since the last poll. Never blocks waiting for
    /// new ones.
    async fn poll(&self) -> anyhow::Result<Vec<TelemetryEvent>>;
}

/// Producer half of a channel-backed source.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelSink {
    /// Queue an event without waiting. Fails when the queue is full or
    /// the feed has gone away.
    pub fn push(&self, event: TelemetryEvent) -> anyhow::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| anyhow::anyhow!("telemetry queue rejected event: {e}"))
    }
}

/// Events pushed over an in-process bounded channel.
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<TelemetryEvent>>,
}

impl ChannelSource {
    /// A source and its sink with room for `capacity` queued events.
    pub fn channel(capacity: usize) -> (ChannelSink, ChannelSource) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelSink { tx }, ChannelSource { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl TelemetrySource for ChannelSource {
    async fn poll(&self) -> anyhow::Result<Vec<TelemetryEvent>> {
        let mut rx = self.rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        Ok(events)
    }
}
