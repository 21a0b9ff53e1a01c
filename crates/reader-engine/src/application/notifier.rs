//! Observer notifications.
//!
//! The [`Notifier`] is an explicitly injected collaborator: every component
//! that reports something to the outside world is handed a clone of it at
//! construction time.  Notifications fan out over a
//! [`tokio::sync::broadcast`] channel, so any number of observers (a UI, a
//! payment-gateway bridge, a test) can subscribe.  Publishing never blocks
//! and never fails when nobody is listening.

use reader_core::{CardData, TransactionStatus};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default number of notifications a slow observer may fall behind by.
pub const DEFAULT_CAPACITY: usize = 64;

/// Something observers may want to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConnectionChanged { connected: bool, serial: String },
    TransactionStatusChanged {
        status: TransactionStatus,
        message: String,
    },
    CardDataReceived(CardData),
    DisplayMessage(String),
    LogMessage(String),
}

/// Cloneable handle for publishing [`Notification`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new observer.  It receives notifications published from
    /// now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("notification dropped: no observers");
        }
    }

    /// Writes `text` to the log and forwards it to observers.
    pub fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{text}");
        self.publish(Notification::LogMessage(text));
    }

    pub fn connection_changed(&self, connected: bool, serial: impl Into<String>) {
        self.publish(Notification::ConnectionChanged {
            connected,
            serial: serial.into(),
        });
    }

    /// Publishes a status change; an empty `message` falls back to the
    /// status's own description.
    pub fn status_changed(&self, status: TransactionStatus, message: &str) {
        let message = if message.is_empty() {
            status.description().to_string()
        } else {
            message.to_string()
        };
        self.publish(Notification::TransactionStatusChanged { status, message });
    }

    pub fn card_data(&self, card: CardData) {
        self.publish(Notification::CardDataReceived(card));
    }

    pub fn display(&self, text: impl Into<String>) {
        self.publish(Notification::DisplayMessage(text.into()));
    }
}
