//! Topic-based delivery of pushed config and blacklist documents.

use sqlfarm_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type ReloadHandler = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// A document pushed for `topic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

impl ReloadMessage {
    pub fn new(topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ReloadHub {
    topics: Arc<RwLock<HashMap<String, Vec<(String, ReloadHandler)>>>>,
}

impl ReloadHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`. A subscriber registering again for
    /// the same topic replaces its earlier handler.
    pub fn subscribe<F>(&self, topic: &str, subscriber: &str, handler: F)
    where
        F: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let handlers = topics.entry(topic.to_string()).or_default();
        handlers.retain(|(id, _)| id != subscriber);
        handlers.push((subscriber.to_string(), Arc::new(handler)));
        debug!(topic, subscriber, "reload subscription added");
    }

    /// Drops every subscription held by `subscriber`.
    pub fn unsubscribe(&self, subscriber: &str) -> usize {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for handlers in topics.values_mut() {
            let before = handlers.len();
            handlers.retain(|(id, _)| id != subscriber);
            removed += before - handlers.len();
        }
        topics.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    pub fn subscribers(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Hands `data` to every handler of `topic`. All handlers run; the first
    /// failure is returned. Returns how many handlers ran.
    pub fn publish(&self, topic: &str, data: &[u8]) -> Result<usize> {
        let handlers: Vec<ReloadHandler> = self
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        let mut first_error = None;
        for handler in &handlers {
            if let Err(err) = handler(data) {
                warn!(topic, error = %err, "reload handler failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(handlers.len()),
        }
    }
}

/// Drives `hub` from a channel until every sender is dropped. Must be called
/// from within a tokio runtime.
pub fn spawn_reload_listener(hub: ReloadHub, mut rx: mpsc::Receiver<ReloadMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match hub.publish(&message.topic, &message.data) {
                Ok(delivered) => debug!(topic = %message.topic, delivered, "reload delivered"),
                Err(err) => warn!(topic = %message.topic, error = %err, "reload rejected"),
            }
        }
        info!("reload listener stopped");
    })
}
