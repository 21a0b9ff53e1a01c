//! The device transport capability.
//!
//! A transport owns exactly one reader handle.  It discovers readers, opens
//! and closes the handle, writes host command frames, and pushes every
//! inbound message onto an [`EventSink`] for the dispatcher.
//!
//! Two scheduling models sit behind this one trait:
//!
//! - **push** – a vendor runtime calls back into the transport, which
//!   forwards the message onto the sink from the callback thread.
//! - **pull** – a background read loop polls the device with a short
//!   timeout, reassembles HID reports, and forwards complete messages.
//!
//! Either way the dispatcher sees the same stream of [`DeviceMessage`]s.

use std::fmt;

use reader_core::protocol::codec::ProtocolError;
use reader_core::{AmountEncoding, ConnectionState, DeviceMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel end a transport pushes inbound device messages into.
pub type EventSink = mpsc::UnboundedSender<DeviceMessage>;

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No attached reader matched the request.
    #[error("no card reader found")]
    DeviceNotFound,

    /// The reader was found but could not be opened.
    #[error("failed to open card reader: {0}")]
    ConnectionFailed(String),

    /// An operation needed an open reader and there was none.
    #[error("card reader is not connected")]
    NotConnected,

    /// Reading from or writing to the reader failed.
    #[error("card reader I/O error: {0}")]
    Io(String),

    /// A frame could not be packetised.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The backend is not available in this build.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Opaque identifier of an attached reader: the HID path for raw HID
/// backends, the serial number or address for SDK-style backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What discovery reports about one reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub product: String,
}

impl DeviceInfo {
    /// `true` if `id` names this reader by id or by serial number.
    pub fn matches(&self, id: &DeviceId) -> bool {
        self.id == *id || (!self.serial_number.is_empty() && self.serial_number == id.0)
    }
}

/// Capability every reader backend implements.
///
/// Methods are synchronous and return quickly: writes are single HID reports
/// or SDK calls, and inbound traffic arrives on the subscribed sink rather
/// than as a return value.  Implementations serialise `connect`,
/// `disconnect`, and `send_frame` internally.
pub trait DeviceTransport: Send + Sync {
    /// Lists attached readers.
    ///
    /// While a reader is connected this returns that reader's info instead of
    /// re-enumerating.  No attached reader is an empty list, not an error.
    fn scan(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Opens `device`, or the first matching reader when `None`.
    ///
    /// Idempotent: when already connected, returns the current reader
    /// without reopening it.  Emits `ConnectionState(Connected)` on the sink.
    fn connect(&self, device: Option<&DeviceId>) -> Result<DeviceInfo, TransportError>;

    /// Releases the reader, stopping any background read loop first.
    ///
    /// A no-op when already disconnected.  Emits
    /// `ConnectionState(Disconnected)` when a reader was actually released.
    fn disconnect(&self) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Writes one encoded host command.
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Routes inbound messages to `sink`, replacing any previous subscriber.
    fn subscribe(&self, sink: EventSink);

    /// Stops routing inbound messages.
    fn unsubscribe(&self);

    /// How this backend expects the transaction amount.
    fn amount_encoding(&self) -> AmountEncoding;

    /// The connected reader, if any.
    fn current_device(&self) -> Option<DeviceInfo>;
}
