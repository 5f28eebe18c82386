use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastEvent {
    Progress,
    Completed,
}

pub trait Broadcaster: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, event: BroadcastEvent, data: &serde_json::Value) -> anyhow::Result<()>;
}

/// Publishes on an in-process `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    name: String,
    tx: broadcast::Sender<(BroadcastEvent, serde_json::Value)>,
}

impl ChannelBroadcaster {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(BroadcastEvent, serde_json::Value)> {
        self.tx.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, event: BroadcastEvent, data: &serde_json::Value) -> anyhow::Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send((event, data.clone()));
        Ok(())
    }
}
