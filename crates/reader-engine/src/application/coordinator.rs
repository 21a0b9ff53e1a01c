//! TransactionCoordinator: owns the lifecycle of the single live transaction.
//!
//! # How a transaction resolves (for beginners)
//!
//! [`TransactionCoordinator::start_transaction`] sends a start frame and then
//! *suspends* until one of several independent things happens:
//!
//! 1. valid card data arrives (success),
//! 2. the reader reports a terminal status such as `TimedOut` or
//!    `TransactionFailed`,
//! 3. the local wall-clock timeout elapses,
//! 4. somebody calls [`TransactionCoordinator::cancel_transaction`], a new
//!    transaction supersedes this one, or the reader disconnects.
//!
//! Several of these can race.  The live transaction holds a
//! [`tokio::sync::oneshot::Sender`]; every completion path first *takes* the
//! transaction out of the coordinator's mutex and sends while still holding
//! the lock.  Whoever takes it delivers the outcome; everyone later finds the
//! slot empty and does nothing.  The waiter therefore sees exactly one
//! outcome.
//!
//! # Cancel acknowledgements
//!
//! Readers answer a cancel frame with a `HostCancelled` status.  Because the
//! status stream carries no transaction id, an acknowledgement for a
//! superseded transaction could otherwise cancel its successor.  The
//! coordinator counts cancels it has sent and swallows that many cancel
//! statuses, but only within [`CANCEL_ACK_WINDOW`] of the last cancel and
//! only until the reader reports anything else.  A transaction that did not
//! supersede another starts with no expected acknowledgements, so a reader
//! that never acked an earlier cancel cannot hide a genuine one.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reader_core::protocol::messages::{HostCommandCode, OperationResult};
use reader_core::{
    encode_command, extract_card_data, CardData, DeviceTransactionStatus, HostCommand,
    TerminalResolution, Transaction, TransactionId, TransactionRequest, TransactionStatus,
    Transition,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::lock;
use crate::application::notifier::Notifier;
use crate::application::transport::{DeviceTransport, EventSink, TransportError};

/// How long after a cancel frame a cancel status counts as its acknowledgement.
pub const CANCEL_ACK_WINDOW: Duration = Duration::from_secs(2);

/// Why a transaction was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// [`TransactionCoordinator::cancel_transaction`] was called.
    Local,
    /// The reader cancelled (button press, or its own host-cancel path).
    Host,
    /// A newer transaction was started while this one was pending.
    Superseded,
    /// The reader went away.
    Disconnected,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CancelReason::Local => "cancelled by host",
            CancelReason::Host => "cancelled on reader",
            CancelReason::Superseded => "superseded by a new transaction",
            CancelReason::Disconnected => "reader disconnected",
        };
        f.write_str(text)
    }
}

/// Typed failure outcome of a transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("card reader is not connected")]
    NotConnected,

    #[error("payment method not supported: {0}")]
    UnsupportedPaymentMethod(String),

    #[error("transaction timed out")]
    Timeout,

    #[error("transaction cancelled: {0}")]
    Cancelled(CancelReason),

    /// The reader reported a failure.
    #[error("reader reported {status}: {message}")]
    DeviceError {
        status: TransactionStatus,
        message: String,
    },

    /// The card was declined before any card data was produced.
    #[error("transaction declined")]
    Declined,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TransactionError {
    /// The terminal status an observer sees for this outcome.
    pub fn status(&self) -> TransactionStatus {
        match self {
            TransactionError::Timeout => TransactionStatus::TimedOut,
            TransactionError::Cancelled(_) => TransactionStatus::Cancelled,
            TransactionError::DeviceError { status, .. } => *status,
            TransactionError::Declined => TransactionStatus::Declined,
            TransactionError::UnsupportedPaymentMethod(_) => TransactionStatus::NotAccepted,
            TransactionError::NotConnected | TransactionError::Transport(_) => {
                TransactionStatus::Failed
            }
        }
    }
}

/// What a transaction caller eventually receives.
pub type TransactionOutcome = Result<CardData, TransactionError>;

/// Tunables for the coordinator.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptions {
    /// Beep once after a successful card read.
    pub beep_on_completion: bool,
}

struct ActiveTransaction {
    transaction: Transaction,
    waiter: oneshot::Sender<TransactionOutcome>,
}

#[derive(Default)]
struct CoordinatorState {
    active: Option<ActiveTransaction>,
    last_status: TransactionStatus,
    pending_cancel_acks: usize,
    cancel_ack_deadline: Option<Instant>,
}

impl CoordinatorState {
    /// Consumes one expected acknowledgement if `now` is inside the window.
    fn take_cancel_ack(&mut self, now: Instant) -> bool {
        let in_window = self.cancel_ack_deadline.is_some_and(|d| now < d);
        if self.pending_cancel_acks > 0 && in_window {
            self.pending_cancel_acks -= 1;
            return true;
        }
        self.clear_cancel_acks();
        false
    }

    fn clear_cancel_acks(&mut self) {
        self.pending_cancel_acks = 0;
        self.cancel_ack_deadline = None;
    }
}

/// Owns the single live transaction for one reader.
pub struct TransactionCoordinator {
    transport: Arc<dyn DeviceTransport>,
    sink: EventSink,
    notifier: Notifier,
    options: CoordinatorOptions,
    state: Mutex<CoordinatorState>,
}

impl TransactionCoordinator {
    /// Creates a coordinator.
    ///
    /// `sink` is the dispatcher's inbound channel; the coordinator
    /// re-subscribes it to the transport before every transaction start.
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        sink: EventSink,
        notifier: Notifier,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            transport,
            sink,
            notifier,
            options,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Status of the live transaction, or of the last one to finish.
    pub fn status(&self) -> TransactionStatus {
        lock(&self.state).last_status
    }

    pub fn active_transaction(&self) -> Option<TransactionId> {
        lock(&self.state)
            .active
            .as_ref()
            .map(|a| a.transaction.id)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    // ── Caller-facing operations ──────────────────────────────────────────────

    /// Starts a transaction and waits for its outcome.
    ///
    /// A transaction that is already pending is cancelled first with
    /// [`CancelReason::Superseded`].
    ///
    /// # Errors
    ///
    /// Every failure is a [`TransactionError`]; nothing panics or hangs past
    /// `request.timeout`.
    pub async fn start_transaction(&self, request: TransactionRequest) -> TransactionOutcome {
        if !self.transport.is_connected() {
            warn!("start transaction refused: reader not connected");
            return Err(TransactionError::NotConnected);
        }
        if request.methods.is_empty() {
            return Err(TransactionError::UnsupportedPaymentMethod(
                "no payment method enabled".to_string(),
            ));
        }

        let superseded = self.finish_active(
            TransactionStatus::Cancelled,
            Err(TransactionError::Cancelled(CancelReason::Superseded)),
        );
        if let Some(previous) = superseded {
            info!(%previous, "superseding pending transaction");
            self.send_cancel_frame();
        }

        // Stale subscriptions can silently drop the authorization event.
        self.transport.unsubscribe();
        self.transport.subscribe(self.sink.clone());

        let mut transaction = Transaction::new(request.clone());
        transaction.advance(TransactionStatus::WaitingForCard);
        let id = transaction.id;
        let (waiter, mut rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            state.active = Some(ActiveTransaction {
                transaction,
                waiter,
            });
            state.last_status = TransactionStatus::WaitingForCard;
            if superseded.is_none() {
                state.clear_cancel_acks();
            }
        }
        self.notifier
            .status_changed(TransactionStatus::WaitingForCard, "");

        info!(
            %id,
            amount = %request.amount,
            timeout_secs = request.timeout.as_secs(),
            methods = request.methods.bits(),
            "starting transaction"
        );

        let frame = encode_command(&HostCommand::StartTransaction {
            amount: request.amount,
            timeout_secs: request.device_timeout_secs(),
            methods: request.methods,
            encoding: self.transport.amount_encoding(),
        });
        if let Err(e) = self.transport.send_frame(&frame) {
            error!(%id, "start transaction frame not delivered: {e}");
            if self.take_if(id).is_some() {
                lock(&self.state).last_status = TransactionStatus::Failed;
                self.notifier.status_changed(TransactionStatus::Failed, "");
                return Err(TransactionError::Transport(e));
            }
        }

        match tokio::time::timeout(request.timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransactionError::Cancelled(CancelReason::Local)),
            Err(_) => {
                if self.finish_if(id, TransactionStatus::TimedOut, Err(TransactionError::Timeout)) {
                    warn!(%id, "no outcome within {:?}; timing out locally", request.timeout);
                    self.send_cancel_frame();
                }
                // Either our timeout or whichever completion path won the race.
                rx.try_recv()
                    .unwrap_or(Err(TransactionError::Cancelled(CancelReason::Local)))
            }
        }
    }

    /// Cancels the live transaction, if any.
    ///
    /// Returns `false`, sends nothing, and changes nothing when no
    /// transaction is active.  A cancel frame that cannot be delivered is
    /// logged, not raised.
    pub fn cancel_transaction(&self) -> bool {
        self.cancel(CancelReason::Local)
    }

    /// Cancels the live transaction with an explicit reason.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        match self.finish_active(
            TransactionStatus::Cancelled,
            Err(TransactionError::Cancelled(reason)),
        ) {
            Some(id) => {
                info!(%id, "transaction cancelled: {reason}");
                self.send_cancel_frame();
                true
            }
            None => {
                debug!("cancel requested with no active transaction");
                false
            }
        }
    }

    // ── Dispatcher-facing handlers ────────────────────────────────────────────

    /// Applies a status reported by the reader.
    pub fn on_device_status(&self, status: DeviceTransactionStatus, message: &str) {
        let is_cancel = matches!(
            status,
            DeviceTransactionStatus::HostCancelled | DeviceTransactionStatus::TransactionCancelled
        );

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if is_cancel {
            if state.take_cancel_ack(Instant::now()) {
                debug!("reader acknowledged an earlier cancel ({status:?})");
                return;
            }
        } else {
            state.clear_cancel_acks();
        }

        let Some(mapped) = status.to_status() else {
            drop(guard);
            if let DeviceTransactionStatus::Unknown(code) = status {
                warn!("unknown reader status code 0x{code:02X}: {message:?}");
            } else {
                debug!("informational reader status {status:?}");
            }
            return;
        };

        if state.active.is_none() {
            drop(guard);
            debug!("reader status {status:?} with no active transaction");
            self.notifier.status_changed(mapped, message);
            return;
        }
        let Some(active) = state.active.as_mut() else {
            return;
        };

        let id = active.transaction.id;
        let transition = active.transaction.advance(mapped);
        match transition {
            Transition::Applied => debug!(%id, "status -> {mapped}"),
            Transition::Unexpected { from } => {
                debug!(%id, "unexpected transition {from} -> {mapped}; applying")
            }
            Transition::Ignored { terminal } => {
                debug!(%id, "status {mapped} ignored; already {terminal}")
            }
        }
        let resolution = status.terminal_resolution();
        if resolution.is_some() {
            active.transaction.settle(mapped);
        }
        state.last_status = active.transaction.status();

        if let Some(resolution) = resolution {
            let outcome = Err(failure_for(resolution, mapped, message));
            if let Some(active) = state.active.take() {
                if active.waiter.send(outcome).is_err() {
                    debug!(%id, "transaction caller already gone");
                }
            }
            info!(%id, "transaction ended by reader: {status:?}");
        }
        drop(guard);

        if resolution.is_some() || !matches!(transition, Transition::Ignored { .. }) {
            self.notifier.status_changed(mapped, message);
        }
    }

    /// Decodes a card-data or authorization-request frame.
    ///
    /// Valid card data completes the live transaction.  An invalid frame is
    /// logged and never resolves anything.
    pub fn on_card_data(&self, frame: &[u8]) {
        debug!(len = frame.len(), frame = %hex::encode_upper(frame), "card frame");

        let mut card = extract_card_data(frame);
        if card.device_serial_number.is_empty() {
            if let Some(device) = self.transport.current_device() {
                card.device_serial_number = device.serial_number;
            }
        }

        if !card.is_valid() {
            self.notifier.log(format!(
                "card frame of {} bytes had no usable KSN or encrypted data; ignored",
                frame.len()
            ));
            return;
        }

        self.notifier.card_data(card.clone());

        let finished = {
            let mut state = lock(&self.state);
            match state.active.take() {
                Some(mut active) => {
                    active.transaction.settle(TransactionStatus::Completed);
                    state.last_status = TransactionStatus::Completed;
                    let id = active.transaction.id;
                    if active.waiter.send(Ok(card)).is_err() {
                        debug!(%id, "transaction caller already gone");
                    }
                    Some(id)
                }
                None => None,
            }
        };

        match finished {
            Some(id) => {
                info!(%id, "card data received; transaction completed");
                self.notifier
                    .status_changed(TransactionStatus::Completed, "");
                if self.options.beep_on_completion {
                    self.send_cosmetic(HostCommand::Beep { count: 1 });
                }
            }
            None => info!("card data arrived with no active transaction; observers notified only"),
        }
    }

    /// Handles the reader's answer to a host command.
    pub fn on_operation_status(&self, command: u8, result: OperationResult) {
        if result.is_ok() {
            debug!("command 0x{command:02X} accepted");
            return;
        }
        if command != HostCommandCode::StartTransaction as u8 {
            warn!("reader answered {result:?} to command 0x{command:02X}");
            return;
        }

        let error = match result {
            OperationResult::Rejected => TransactionError::UnsupportedPaymentMethod(
                "reader rejected the start request".to_string(),
            ),
            other => TransactionError::DeviceError {
                status: TransactionStatus::Failed,
                message: format!("start request failed ({other:?})"),
            },
        };
        let status = error.status();
        if let Some(id) = self.finish_active(status, Err(error)) {
            warn!(%id, "reader refused to start the transaction: {result:?}");
        }
    }

    /// Resolves the live transaction after the reader went away.
    pub fn on_disconnected(&self) {
        lock(&self.state).clear_cancel_acks();
        if let Some(id) = self.finish_active(
            TransactionStatus::Cancelled,
            Err(TransactionError::Cancelled(CancelReason::Disconnected)),
        ) {
            warn!(%id, "reader disconnected mid-transaction");
        }
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    /// Takes the live transaction, if any, and delivers `outcome` to it.
    fn finish_active(
        &self,
        status: TransactionStatus,
        outcome: TransactionOutcome,
    ) -> Option<TransactionId> {
        let id = {
            let mut state = lock(&self.state);
            let mut active = state.active.take()?;
            active.transaction.settle(status);
            state.last_status = active.transaction.status();
            let id = active.transaction.id;
            if active.waiter.send(outcome).is_err() {
                debug!(%id, "transaction caller already gone");
            }
            id
        };
        self.notifier.status_changed(status, "");
        Some(id)
    }

    /// Like [`Self::finish_active`] but only if `id` is still the live one.
    fn finish_if(&self, id: TransactionId, status: TransactionStatus, outcome: TransactionOutcome) -> bool {
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let Some(active) = state.active.as_mut() else {
                return false;
            };
            if active.transaction.id != id {
                return false;
            }
            active.transaction.settle(status);
            state.last_status = active.transaction.status();
            if let Some(active) = state.active.take() {
                if active.waiter.send(outcome).is_err() {
                    debug!(%id, "transaction caller already gone");
                }
            }
        }
        self.notifier.status_changed(status, "");
        true
    }

    fn take_if(&self, id: TransactionId) -> Option<ActiveTransaction> {
        let mut state = lock(&self.state);
        if state.active.as_ref().map(|a| a.transaction.id) == Some(id) {
            state.active.take()
        } else {
            None
        }
    }

    /// Best-effort cancel frame; the reader's acknowledgement is expected.
    fn send_cancel_frame(&self) {
        {
            let mut state = lock(&self.state);
            state.pending_cancel_acks += 1;
            state.cancel_ack_deadline = Some(Instant::now() + CANCEL_ACK_WINDOW);
        }
        let frame = encode_command(&HostCommand::CancelTransaction);
        if let Err(e) = self.transport.send_frame(&frame) {
            warn!("cancel frame not delivered: {e}");
            let mut state = lock(&self.state);
            state.pending_cancel_acks = state.pending_cancel_acks.saturating_sub(1);
        }
    }

    /// Fire-and-forget command with no bearing on the transaction.
    fn send_cosmetic(&self, command: HostCommand) {
        if let Err(e) = self.transport.send_frame(&encode_command(&command)) {
            warn!("{:?} not delivered: {e}", command.code());
        }
    }
}

fn failure_for(
    resolution: TerminalResolution,
    status: TransactionStatus,
    message: &str,
) -> TransactionError {
    let message = if message.is_empty() {
        status.description().to_string()
    } else {
        message.to_string()
    };
    match resolution {
        TerminalResolution::TimedOut => TransactionError::Timeout,
        TerminalResolution::HostCancelled => TransactionError::Cancelled(CancelReason::Host),
        TerminalResolution::Failed => TransactionError::DeviceError {
            status: TransactionStatus::Failed,
            message,
        },
        TerminalResolution::NotAccepted => TransactionError::DeviceError {
            status: TransactionStatus::NotAccepted,
            message,
        },
        TerminalResolution::Declined => TransactionError::Declined,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reader_core::protocol::card_data::tags;
    use reader_core::protocol::tlv::encode_tlv;
    use reader_core::{decode_command, Amount, AmountEncoding, ConnectionState, DeviceMessage};
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::transport::DeviceInfo;

    /// Records every frame; never pushes anything back.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        subscribes: Mutex<usize>,
        disconnected: bool,
        fail_send: bool,
    }

    impl RecordingTransport {
        fn commands(&self) -> Vec<HostCommand> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|f| decode_command(f).unwrap())
                .collect()
        }
    }

    impl DeviceTransport for RecordingTransport {
        fn scan(&self) -> Result<Vec<DeviceInfo>, TransportError> {
            Ok(Vec::new())
        }
        fn connect(&self, _: Option<&crate::application::transport::DeviceId>) -> Result<DeviceInfo, TransportError> {
            Err(TransportError::DeviceNotFound)
        }
        fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn connection_state(&self) -> ConnectionState {
            if self.disconnected {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Connected
            }
        }
        fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
            if self.fail_send {
                return Err(TransportError::Io("pipe closed".to_string()));
            }
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
        fn subscribe(&self, _: EventSink) {
            *self.subscribes.lock().unwrap() += 1;
        }
        fn unsubscribe(&self) {}
        fn amount_encoding(&self) -> AmountEncoding {
            AmountEncoding::DecimalString
        }
        fn current_device(&self) -> Option<DeviceInfo> {
            None
        }
    }

    fn coordinator(transport: Arc<RecordingTransport>) -> Arc<TransactionCoordinator> {
        let (sink, _rx) = mpsc::unbounded_channel::<DeviceMessage>();
        Arc::new(TransactionCoordinator::new(
            transport,
            sink,
            Notifier::default(),
            CoordinatorOptions::default(),
        ))
    }

    fn request(secs: u64) -> TransactionRequest {
        TransactionRequest::new(Amount::from_minor_units(100).unwrap(), Duration::from_secs(secs))
    }

    fn valid_frame() -> Vec<u8> {
        let mut f = encode_tlv(tags::KSN, &[0x01, 0x02, 0x03]);
        f.extend(encode_tlv(tags::ENCRYPTED_DATA, &[0xAA, 0xBB]));
        f
    }

    #[tokio::test]
    async fn test_not_connected_is_rejected_without_sending() {
        // Arrange
        let transport = Arc::new(RecordingTransport {
            disconnected: true,
            ..Default::default()
        });
        let coord = coordinator(Arc::clone(&transport));

        // Act
        let result = coord.start_transaction(request(5)).await;

        // Assert
        assert!(matches!(result, Err(TransactionError::NotConnected)));
        assert!(transport.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timeout_resolves_once_and_sends_cancel() {
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));

        let result = coord.start_transaction(request(30)).await;

        assert!(matches!(result, Err(TransactionError::Timeout)));
        assert_eq!(coord.status(), TransactionStatus::TimedOut);
        assert!(!coord.is_active());
        let commands = transport.commands();
        assert!(matches!(commands[0], HostCommand::StartTransaction { .. }));
        assert_eq!(commands[1], HostCommand::CancelTransaction);
        assert_eq!(*transport.subscribes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_card_data_completes_pending_transaction() {
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));
        let c = Arc::clone(&coord);
        let pending = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;

        coord.on_card_data(&valid_frame());

        let card = pending.await.unwrap().unwrap();
        assert!(card.is_valid());
        assert_eq!(card.ksn, "010203");
        assert_eq!(coord.status(), TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_status_after_card_data_is_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));
        let c = Arc::clone(&coord);
        let pending = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;

        coord.on_card_data(&valid_frame());
        coord.on_device_status(DeviceTransactionStatus::TransactionFailed, "");

        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_start_maps_to_unsupported_payment_method() {
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));
        let c = Arc::clone(&coord);
        let pending = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;

        coord.on_operation_status(HostCommandCode::StartTransaction as u8, OperationResult::Rejected);

        assert!(matches!(
            pending.await.unwrap(),
            Err(TransactionError::UnsupportedPaymentMethod(_))
        ));
    }

    #[tokio::test]
    async fn test_send_failure_surfaces_transport_error() {
        let transport = Arc::new(RecordingTransport {
            fail_send: true,
            ..Default::default()
        });
        let coord = coordinator(Arc::clone(&transport));

        let result = coord.start_transaction(request(30)).await;

        assert!(matches!(result, Err(TransactionError::Transport(TransportError::Io(_)))));
        assert!(!coord.is_active());
        assert_eq!(coord.status(), TransactionStatus::Failed);
    }

    #[test]
    fn test_cancel_acknowledgement_is_swallowed() {
        // Arrange: a cancel was sent, so one HostCancelled is expected
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(transport);
        coord.send_cancel_frame();

        // Act
        coord.on_device_status(DeviceTransactionStatus::HostCancelled, "");

        // Assert
        assert_eq!(lock(&coord.state).pending_cancel_acks, 0);
        assert_eq!(coord.status(), TransactionStatus::Idle);
    }

    #[tokio::test]
    async fn test_unacknowledged_cancel_does_not_hide_next_host_cancel() {
        // Arrange: the reader never acknowledges the first cancel
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));
        let c = Arc::clone(&coord);
        let first = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;
        assert!(coord.cancel_transaction());
        assert!(matches!(
            first.await.unwrap(),
            Err(TransactionError::Cancelled(CancelReason::Local))
        ));

        let c = Arc::clone(&coord);
        let second = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;

        // Act
        coord.on_device_status(DeviceTransactionStatus::HostCancelled, "");

        // Assert
        let outcome = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("resolved without waiting for the local timeout")
            .unwrap();
        assert!(matches!(
            outcome,
            Err(TransactionError::Cancelled(CancelReason::Host))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_acknowledgement_expires_after_window() {
        // Arrange: a superseding start expects one acknowledgement
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));
        let c = Arc::clone(&coord);
        let _first = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;
        let c = Arc::clone(&coord);
        let second = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;
        assert_eq!(lock(&coord.state).pending_cancel_acks, 1);

        // Act: the reader cancels long after the acknowledgement was due
        tokio::time::advance(CANCEL_ACK_WINDOW + Duration::from_millis(1)).await;
        coord.on_device_status(DeviceTransactionStatus::HostCancelled, "");

        // Assert
        assert!(matches!(
            second.await.unwrap(),
            Err(TransactionError::Cancelled(CancelReason::Host))
        ));
    }

    #[tokio::test]
    async fn test_supersede_acknowledgement_is_swallowed() {
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));
        let c = Arc::clone(&coord);
        let first = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;
        let c = Arc::clone(&coord);
        let second = tokio::spawn(async move { c.start_transaction(request(30)).await });
        tokio::task::yield_now().await;

        coord.on_device_status(DeviceTransactionStatus::HostCancelled, "");

        assert!(matches!(
            first.await.unwrap(),
            Err(TransactionError::Cancelled(CancelReason::Superseded))
        ));
        assert!(coord.is_active());
        coord.on_card_data(&valid_frame());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_completion_without_card_data_ends_as_timeout() {
        // Arrange
        let transport = Arc::new(RecordingTransport::default());
        let coord = coordinator(Arc::clone(&transport));
        let c = Arc::clone(&coord);
        let pending = tokio::spawn(async move { c.start_transaction(request(5)).await });
        tokio::task::yield_now().await;

        // Act: the reader claims completion but never sends card data
        coord.on_device_status(DeviceTransactionStatus::TransactionCompleted, "");
        assert!(coord.is_active());
        let outcome = pending.await.unwrap();

        // Assert
        assert!(matches!(outcome, Err(TransactionError::Timeout)));
        assert_eq!(coord.status(), TransactionStatus::TimedOut);
    }
}
