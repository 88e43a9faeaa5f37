//! Per-project console fan-out.
//!
//! Each project gets at most one broadcast channel. The supervisor publishes
//! output lines; any number of WebSocket subscribers receive them in order.
//! Every subscriber has its own bounded buffer: a slow subscriber loses its
//! oldest lines (reported as [`ConsoleEvent::Skipped`]) and the publisher
//! never waits.
//!
//! Buffer sizes are rounded up to a power of two, as broadcast channels do
//! internally; [`effective_capacity`] gives the size actually used.
//!
//! Channels are created by [`ConsoleBus::subscribe`] and only destroyed by
//! [`ConsoleBus::close`]. Publishing to a project with no channel is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Largest per-subscriber buffer a bus will allocate.
pub const MAX_CAPACITY: usize = 1 << 20;

/// Buffer size used for a requested `capacity`: at least 1, at most
/// [`MAX_CAPACITY`], rounded up to the next power of two.
pub fn effective_capacity(capacity: usize) -> usize {
    capacity.clamp(1, MAX_CAPACITY).next_power_of_two()
}

/// Result of [`ConsoleBus::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Queued for this many subscribers.
    Delivered(usize),
    /// The channel exists but nobody is listening; the line is discarded.
    NoSubscribers,
    /// No channel for the project.
    ChannelAbsent,
}

/// One item read from a [`ConsoleSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Line(String),
    /// This many lines were dropped because the subscriber fell behind.
    Skipped(u64),
}

#[derive(Clone)]
pub struct ConsoleBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl ConsoleBus {
    /// `capacity` is the per-subscriber buffer, normalised by
    /// [`effective_capacity`].
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: effective_capacity(capacity),
        }
    }

    /// Lines each subscriber can fall behind before losing the oldest.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deliver `line` to every current subscriber of `project_id`.
    pub async fn publish(&self, project_id: &str, line: impl Into<String>) -> PublishOutcome {
        let channels = self.channels.read().await;
        let Some(tx) = channels.get(project_id) else {
            return PublishOutcome::ChannelAbsent;
        };
        match tx.send(line.into()) {
            Ok(n) => PublishOutcome::Delivered(n),
            Err(_) => PublishOutcome::NoSubscribers,
        }
    }

    /// Subscribe to `project_id`, creating its channel if needed. The
    /// subscription sees every line published after this call returns.
    pub async fn subscribe(&self, project_id: &str) -> ConsoleSubscription {
        if let Some(tx) = self.channels.read().await.get(project_id) {
            return ConsoleSubscription::new(project_id, tx.subscribe());
        }
        let mut channels = self.channels.write().await;
        let tx = channels.entry(project_id.to_string()).or_insert_with(|| {
            info!("Console channel for {project_id} opened");
            broadcast::channel(self.capacity).0
        });
        ConsoleSubscription::new(project_id, tx.subscribe())
    }

    /// Remove the channel for `project_id`. Subscribers drain what they
    /// already hold and then end. Returns whether a channel existed.
    pub async fn close(&self, project_id: &str) -> bool {
        let removed = self.channels.write().await.remove(project_id);
        match removed {
            Some(tx) => {
                info!(
                    "Console channel for {project_id} closed ({} subscribers)",
                    tx.receiver_count()
                );
                true
            }
            None => {
                debug!("No console channel for {project_id} to close");
                false
            }
        }
    }

    pub async fn is_open(&self, project_id: &str) -> bool {
        self.channels.read().await.contains_key(project_id)
    }

    /// Live subscriber count, or `None` when the channel does not exist.
    pub async fn subscriber_count(&self, project_id: &str) -> Option<usize> {
        self.channels
            .read()
            .await
            .get(project_id)
            .map(broadcast::Sender::receiver_count)
    }
}

/// A live view of one project's console.
pub struct ConsoleSubscription {
    project_id: String,
    rx: broadcast::Receiver<String>,
}

impl ConsoleSubscription {
    fn new(project_id: &str, rx: broadcast::Receiver<String>) -> Self {
        Self {
            project_id: project_id.to_string(),
            rx,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Next event, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<ConsoleEvent> {
        match self.rx.recv().await {
            Ok(line) => Some(ConsoleEvent::Line(line)),
            Err(RecvError::Lagged(n)) => Some(ConsoleEvent::Skipped(n)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Next line, passing over lag notices.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            match self.recv().await? {
                ConsoleEvent::Line(line) => return Some(line),
                ConsoleEvent::Skipped(_) => {}
            }
        }
    }
}
