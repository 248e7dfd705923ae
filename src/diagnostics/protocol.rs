//! # Observer Protocol
//!
//! Message kinds exchanged between the agent and attached observers.
//!
//! | Kind | Direction | Payload |
//! |------|-----------|---------|
//! | `RegisterClient` | observer → agent | reply channel |
//! | `UnregisterClient` | observer → agent | reply channel |
//! | `Log` | agent → observer | one diagnostic line |
//! | `LogRing` | agent → observer | full history snapshot |
//!
//! In-process observers talk [`Message`] directly. Socket observers use the
//! JSON-lines form in [`WireFrame`], one object per line.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::ring::LogMessage;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Messages understood by the agent and its observers.
#[derive(Debug, Clone)]
pub enum Message {
    RegisterClient { reply_to: ClientHandle },
    UnregisterClient { reply_to: ClientHandle },
    Log { text: String },
    LogRing { entries: Vec<LogMessage> },
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; this message was dropped but the observer is alive.
    Dropped,
    /// Receiver is gone.
    Closed,
}

/// Sending half of an observer's channel.
///
/// Handles compare equal by identity, so a clone of the handle used to
/// register also unregisters.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    sender: mpsc::Sender<Message>,
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

impl ClientHandle {
    /// Creates a bounded observer channel.
    ///
    /// # Examples
    ///
    /// ```
    /// use location_tracker::diagnostics::protocol::{ClientHandle, Delivery, Message};
    ///
    /// let (handle, mut rx) = ClientHandle::channel(8);
    /// assert_eq!(handle.send(Message::Log { text: "hi".into() }), Delivery::Sent);
    /// assert!(rx.try_recv().is_ok());
    /// ```
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, sender }, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Non-blocking delivery.
    pub fn send(&self, message: Message) -> Delivery {
        match self.sender.try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Socket form of [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    RegisterClient,
    UnregisterClient,
    Log { text: String },
    LogRing { entries: Vec<LogMessage> },
}

impl WireFrame {
    /// Converts an inbound frame into a control message for `reply_to`.
    ///
    /// Agent-to-observer kinds are passed through unchanged so the handler's
    /// default arm sees them.
    pub fn into_message(self, reply_to: ClientHandle) -> Message {
        match self {
            Self::RegisterClient => Message::RegisterClient { reply_to },
            Self::UnregisterClient => Message::UnregisterClient { reply_to },
            Self::Log { text } => Message::Log { text },
            Self::LogRing { entries } => Message::LogRing { entries },
        }
    }

    /// Outbound frame for an agent message. Control messages have no
    /// outbound form.
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Log { text } => Some(Self::Log { text }),
            Message::LogRing { entries } => Some(Self::LogRing { entries }),
            Message::RegisterClient { .. } | Message::UnregisterClient { .. } => None,
        }
    }
}
