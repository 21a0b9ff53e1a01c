//! CardReaderService: the facade collaborators use.
//!
//! The service is the composition boundary.  It owns one transport, builds the
//! coordinator, dispatcher, and notifier around it, and spawns the dispatcher
//! pump.  Nothing in the engine is reached through a global.
//!
//! ```text
//! CardReaderService
//!  ├─ Arc<dyn DeviceTransport>  ── pushes DeviceMessage ──┐
//!  ├─ Arc<TransactionCoordinator>                          │ mpsc
//!  ├─ Notifier (broadcast)                                 ▼
//!  └─ pump task ── EventDispatcher::dispatch(msg) ── coordinator / notifier
//! ```
//!
//! Must be created inside a Tokio runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reader_core::{Amount, PaymentMethods, TransactionRequest, TransactionStatus};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

use crate::application::coordinator::{
    CancelReason, CoordinatorOptions, TransactionCoordinator, TransactionOutcome,
};
use crate::application::dispatcher::EventDispatcher;
use crate::application::lock;
use crate::application::notifier::{Notification, Notifier};
use crate::application::transport::{DeviceId, DeviceInfo, DeviceTransport, TransportError};

/// Defaults applied by [`CardReaderService::start_transaction`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub methods: PaymentMethods,
    pub beep_on_completion: bool,
    /// Capacity of the observer broadcast channel.
    pub notification_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            methods: PaymentMethods::all(),
            beep_on_completion: true,
            notification_capacity: crate::application::notifier::DEFAULT_CAPACITY,
        }
    }
}

/// One card reader and everything needed to run transactions on it.
pub struct CardReaderService {
    transport: Arc<dyn DeviceTransport>,
    coordinator: Arc<TransactionCoordinator>,
    notifier: Notifier,
    options: ServiceOptions,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CardReaderService {
    /// Wires the engine around `transport` and starts the dispatcher pump.
    pub fn new(transport: Arc<dyn DeviceTransport>, options: ServiceOptions) -> Self {
        let notifier = Notifier::new(options.notification_capacity);
        let (sink, rx) = mpsc::unbounded_channel();

        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&transport),
            sink.clone(),
            notifier.clone(),
            CoordinatorOptions {
                beep_on_completion: options.beep_on_completion,
            },
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&coordinator),
            Arc::clone(&transport),
            notifier.clone(),
        ));

        transport.subscribe(sink);
        let pump = tokio::spawn(dispatcher.run(rx));

        Self {
            transport,
            coordinator,
            notifier,
            options,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Registers an observer for connection, status, card-data, display,
    /// and log notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Lists attached readers.  Never re-enumerates while connected.
    pub fn scan_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let devices = self.transport.scan()?;
        self.notifier
            .log(format!("scan found {} reader(s)", devices.len()));
        Ok(devices)
    }

    /// Connects to `device`, or to the first matching reader.
    pub fn connect(&self, device: Option<&DeviceId>) -> Result<DeviceInfo, TransportError> {
        match self.transport.connect(device) {
            Ok(info) => {
                self.notifier.log(format!(
                    "connected to {} ({})",
                    info.id, info.serial_number
                ));
                Ok(info)
            }
            Err(e) => {
                self.notifier.log(format!("connect failed: {e}"));
                Err(e)
            }
        }
    }

    /// Cancels any live transaction, then releases the reader.
    ///
    /// Safe to call repeatedly; the second call is a no-op.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        if !self.transport.is_connected() {
            // A reader lost behind our back may still hold an open handle.
            return self.transport.disconnect();
        }
        self.coordinator.cancel(CancelReason::Disconnected);
        self.transport.disconnect()?;
        self.notifier.log("reader disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Starts a transaction with the configured payment methods and waits
    /// for its outcome.
    pub async fn start_transaction(&self, amount: Amount, timeout: Duration) -> TransactionOutcome {
        let request = TransactionRequest::new(amount, timeout).with_methods(self.options.methods);
        self.start(request).await
    }

    /// Starts a fully specified transaction and waits for its outcome.
    pub async fn start(&self, request: TransactionRequest) -> TransactionOutcome {
        let outcome = self.coordinator.start_transaction(request).await;
        if let Err(e) = &outcome {
            self.notifier.log(format!("transaction ended without card data: {e}"));
        }
        outcome
    }

    /// Cancels the live transaction.  Returns `false` when there was none.
    pub fn cancel_transaction(&self) -> bool {
        self.coordinator.cancel_transaction()
    }

    /// Status of the live transaction, or of the last one to finish.
    pub fn status(&self) -> TransactionStatus {
        self.coordinator.status()
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// Disconnects and stops the dispatcher pump.
    pub fn shutdown(&self) -> Result<(), TransportError> {
        let result = self.disconnect();
        self.transport.unsubscribe();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        info!("card reader service stopped");
        result
    }
}

impl Drop for CardReaderService {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}
