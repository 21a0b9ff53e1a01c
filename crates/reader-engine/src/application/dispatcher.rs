//! EventDispatcher: the single entry point for everything the reader sends.
//!
//! Transports push [`DeviceMessage`]s onto an unbounded channel; the
//! dispatcher's pump task drains that channel and calls
//! [`EventDispatcher::dispatch`] once per message, in arrival order.
//! `dispatch` is synchronous and never waits on another event, so a slow or
//! broken message can never stall the ones behind it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use reader_core::{ConnectionState, DeviceMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::application::coordinator::TransactionCoordinator;
use crate::application::lock;
use crate::application::notifier::Notifier;
use crate::application::transport::DeviceTransport;

/// Classifies inbound device messages and routes them.
pub struct EventDispatcher {
    coordinator: Arc<TransactionCoordinator>,
    transport: Arc<dyn DeviceTransport>,
    notifier: Notifier,
    /// Serial of the last connected reader, reported again on disconnect.
    last_serial: Mutex<String>,
}

impl EventDispatcher {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        transport: Arc<dyn DeviceTransport>,
        notifier: Notifier,
    ) -> Self {
        Self {
            coordinator,
            transport,
            notifier,
            last_serial: Mutex::new(String::new()),
        }
    }

    /// Handles one message.
    pub fn dispatch(&self, msg: DeviceMessage) {
        debug!(category = msg.category(), "dispatching device message");

        match msg {
            DeviceMessage::ConnectionState(state) => self.on_connection_state(state),
            DeviceMessage::TransactionStatus { status, message } => {
                self.coordinator.on_device_status(status, &message)
            }
            DeviceMessage::CardData(frame) | DeviceMessage::AuthorizationRequest(frame) => {
                self.coordinator.on_card_data(&frame)
            }
            DeviceMessage::DisplayMessage(text) => {
                debug!("reader display: {text:?}");
                self.notifier.display(text);
            }
            DeviceMessage::OperationStatus { command, result } => {
                self.coordinator.on_operation_status(command, result)
            }
            DeviceMessage::DeviceEvent { event, data } => {
                debug!("reader event {event:?} ({} bytes)", data.len());
            }
            DeviceMessage::Other { code, payload } => {
                warn!(
                    "ignoring unrecognised message type 0x{code:02X}: {}",
                    hex::encode_upper(&payload)
                );
            }
        }
    }

    /// Drains `rx` until every sender is gone.
    ///
    /// A panic while handling one message is logged and the pump moves on to
    /// the next message.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DeviceMessage>) {
        while let Some(msg) = rx.recv().await {
            let category = msg.category();
            if panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(msg))).is_err() {
                error!("handler for {category} message panicked; continuing");
            }
        }
        debug!("device event channel closed; dispatcher stopped");
    }

    fn on_connection_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                let serial = self
                    .transport
                    .current_device()
                    .map(|d| d.serial_number)
                    .unwrap_or_default();
                info!("reader connected ({serial})");
                *lock(&self.last_serial) = serial.clone();
                self.notifier.connection_changed(true, serial);
            }
            ConnectionState::Disconnected => {
                let serial = lock(&self.last_serial).clone();
                info!("reader disconnected ({serial})");
                self.coordinator.on_disconnected();
                self.notifier.connection_changed(false, serial);
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                debug!("reader connection state {state:?}");
            }
        }
    }
}
