//! # Diagnostic Log Hub
//!
//! Owns the [`LogRing`] and the set of registered observers behind a single
//! mutex, so appending a line, fanning it out and registering an observer
//! (with its history replay) never interleave. A newly registered observer
//! therefore sees every line exactly once: either in its `LogRing` replay or
//! as a later `Log` message.
//!
//! Delivery never blocks. Observers whose channel is closed are dropped from
//! the registry on the next delivery attempt.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::protocol::{ClientHandle, Delivery, Message};
use super::ring::{LogMessage, LogRing};
use crate::status::StatusIndicator;

/// Observers currently attached to the hub, in registration order.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Vec<ClientHandle>,
}

impl ClientRegistry {
    pub fn register(&mut self, client: ClientHandle) {
        self.clients.push(client);
    }

    /// Removes `client`; returns whether it was registered.
    pub fn unregister(&mut self, client: &ClientHandle) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| c != client);
        self.clients.len() != before
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, client: &ClientHandle) -> bool {
        self.clients.contains(client)
    }

    /// Sends `text` to every observer, newest registration first, pruning
    /// observers whose channel has closed. Returns the number pruned.
    fn broadcast(&mut self, text: &str) -> usize {
        let mut pruned = 0;
        for i in (0..self.clients.len()).rev() {
            let message = Message::Log { text: text.to_string() };
            match self.clients[i].send(message) {
                Delivery::Sent => {}
                Delivery::Dropped => {
                    debug!(client = self.clients[i].id(), "Observer queue full, line dropped");
                }
                Delivery::Closed => {
                    let client = self.clients.remove(i);
                    debug!(client = client.id(), "Observer gone, unregistered");
                    pruned += 1;
                }
            }
        }
        pruned
    }
}

#[derive(Debug, Default)]
struct HubState {
    ring: LogRing,
    registry: ClientRegistry,
}

/// Shared diagnostic log. Cloning yields another handle to the same hub.
#[derive(Debug, Clone)]
pub struct LogHub {
    state: Arc<Mutex<HubState>>,
    status: Arc<StatusIndicator>,
}

impl LogHub {
    pub fn new(status: Arc<StatusIndicator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a diagnostic line, updates the status indicator and mirrors
    /// the line to every observer.
    pub fn log_text(&self, text: impl Into<String>) {
        let text = text.into();
        info!(target: "diagnostics", "{}", text);

        let mut state = self.lock();
        state.ring.push(LogMessage::now(text.clone()));
        self.status.update(&text);
        state.registry.broadcast(&text);
    }

    /// Dispatches an observer control message.
    ///
    /// `RegisterClient` adds the sender and replies with a `LogRing`
    /// snapshot. `UnregisterClient` removes it. Other kinds are ignored.
    pub fn handle_message(&self, message: Message) {
        match message {
            Message::RegisterClient { reply_to } => self.register(reply_to),
            Message::UnregisterClient { reply_to } => self.unregister(&reply_to),
            other => debug!(?other, "Ignoring message with no handler"),
        }
    }

    fn register(&self, client: ClientHandle) {
        let mut state = self.lock();
        let entries = state.ring.snapshot();
        if client.send(Message::LogRing { entries }) != Delivery::Sent {
            debug!(client = client.id(), "Could not deliver log history to new observer");
        }
        debug!(client = client.id(), "Observer registered");
        state.registry.register(client);
    }

    fn unregister(&self, client: &ClientHandle) {
        if self.lock().registry.unregister(client) {
            debug!(client = client.id(), "Observer unregistered");
        }
    }

    /// Copy of the current history, oldest first.
    pub fn snapshot(&self) -> Vec<LogMessage> {
        self.lock().ring.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.lock().registry.len()
    }

    pub fn is_registered(&self, client: &ClientHandle) -> bool {
        self.lock().registry.contains(client)
    }

    pub fn status(&self) -> &Arc<StatusIndicator> {
        &self.status
    }
}
