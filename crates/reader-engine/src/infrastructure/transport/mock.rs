//! Simulated card reader with the push model of a vendor SDK.
//!
//! # Why a simulated reader?
//!
//! A real reader needs a USB port, a test card, and a human to tap it.  The
//! `MockTransport` replaces all of that with an in-memory device that:
//!
//! - records every frame the host sends, so tests can assert on exactly what
//!   went over the wire;
//! - answers a start-transaction frame with a queued script of messages
//!   (status updates, a card-data frame, ...);
//! - answers a cancel frame for a running transaction with a `HostCancelled`
//!   status, as real firmware does;
//! - delivers every message *synchronously* from inside `send_frame` or
//!   [`MockTransport::inject`], just like a vendor runtime invoking a
//!   callback on its own thread.
//!
//! # Usage in tests
//!
//! ```ignore
//! let mock = Arc::new(MockTransport::with_device(MockTransport::reader_info("B4B1234")));
//! mock.queue_start_response(vec![
//!     DeviceMessage::status(DeviceTransactionStatus::CardInserted),
//!     DeviceMessage::AuthorizationRequest(frame),
//! ]);
//! let service = CardReaderService::new(mock.clone(), ServiceOptions::default());
//! service.connect(None)?;
//! let card = service.start_transaction(amount, Duration::from_secs(30)).await?;
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;

use reader_core::{
    decode_command, AmountEncoding, ConnectionState, DeviceMessage, DeviceTransactionStatus,
    HostCommand,
};
use reader_core::protocol::messages::OperationResult;
use tracing::debug;

use crate::application::lock;
use crate::application::transport::{
    DeviceId, DeviceInfo, DeviceTransport, EventSink, TransportError,
};

/// Vendor id reported by simulated readers.
pub const MOCK_VENDOR_ID: u16 = 0x0801;
/// Product id reported by simulated readers.
pub const MOCK_PRODUCT_ID: u16 = 0x2020;

#[derive(Default)]
struct MockState {
    attached: Vec<DeviceInfo>,
    connected: Option<DeviceInfo>,
    sink: Option<EventSink>,
    sent: Vec<Vec<u8>>,
    start_responses: VecDeque<Vec<DeviceMessage>>,
    running: bool,
    subscribe_calls: usize,
    open_calls: usize,
    fail_connect: bool,
    fail_send: bool,
}

/// In-memory push-model reader.
pub struct MockTransport {
    state: Mutex<MockState>,
    encoding: AmountEncoding,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport with no reader attached.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            encoding: AmountEncoding::DecimalString,
        }
    }

    /// A transport with one attached reader.
    pub fn with_device(info: DeviceInfo) -> Self {
        let mock = Self::new();
        lock(&mock.state).attached.push(info);
        mock
    }

    /// Device info for a simulated reader with the given serial number.
    pub fn reader_info(serial: &str) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId(format!("sim:{serial}")),
            vendor_id: MOCK_VENDOR_ID,
            product_id: MOCK_PRODUCT_ID,
            serial_number: serial.to_string(),
            product: "Simulated card reader".to_string(),
        }
    }

    pub fn with_amount_encoding(mut self, encoding: AmountEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Queues the messages the reader pushes in reply to the next
    /// start-transaction frame.
    pub fn queue_start_response(&self, messages: Vec<DeviceMessage>) {
        lock(&self.state).start_responses.push_back(messages);
    }

    /// Pushes `msg` as if the reader produced it.
    ///
    /// A `ConnectionState(Disconnected)` message also marks the reader as
    /// gone, which is how a vendor runtime reports an unplug.
    pub fn inject(&self, msg: DeviceMessage) {
        let sink = {
            let mut state = lock(&self.state);
            if msg == DeviceMessage::ConnectionState(ConnectionState::Disconnected) {
                state.connected = None;
                state.running = false;
            }
            state.sink.clone()
        };
        push(sink.as_ref(), vec![msg]);
    }

    /// Simulates the reader being unplugged.
    pub fn unplug(&self) {
        {
            let mut state = lock(&self.state);
            if let Some(info) = state.connected.as_ref() {
                let id = info.id.clone();
                state.attached.retain(|d| d.id != id);
            }
        }
        self.inject(DeviceMessage::ConnectionState(ConnectionState::Disconnected));
    }

    /// Every frame sent so far, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent.clone()
    }

    /// Every frame sent so far, decoded.  Undecodable frames are skipped.
    pub fn sent_commands(&self) -> Vec<HostCommand> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|f| decode_command(f).ok())
            .collect()
    }

    pub fn subscribe_count(&self) -> usize {
        lock(&self.state).subscribe_calls
    }

    /// How many times the reader handle was actually opened.
    pub fn open_count(&self) -> usize {
        lock(&self.state).open_calls
    }

    pub fn set_fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        lock(&self.state).fail_send = fail;
    }
}

impl DeviceTransport for MockTransport {
    fn scan(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let state = lock(&self.state);
        Ok(match state.connected.as_ref() {
            Some(info) => vec![info.clone()],
            None => state.attached.clone(),
        })
    }

    fn connect(&self, device: Option<&DeviceId>) -> Result<DeviceInfo, TransportError> {
        let (info, sink) = {
            let mut state = lock(&self.state);
            if let Some(info) = state.connected.as_ref() {
                return Ok(info.clone());
            }
            let info = match device {
                Some(id) => state.attached.iter().find(|d| d.matches(id)),
                None => state.attached.first(),
            }
            .cloned()
            .ok_or(TransportError::DeviceNotFound)?;
            if state.fail_connect {
                return Err(TransportError::ConnectionFailed(format!(
                    "{} refused to open",
                    info.id
                )));
            }
            state.open_calls += 1;
            state.connected = Some(info.clone());
            (info, state.sink.clone())
        };
        push(
            sink.as_ref(),
            vec![DeviceMessage::ConnectionState(ConnectionState::Connected)],
        );
        Ok(info)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let sink = {
            let mut state = lock(&self.state);
            if state.connected.take().is_none() {
                return Ok(());
            }
            state.running = false;
            state.sink.clone()
        };
        push(
            sink.as_ref(),
            vec![DeviceMessage::ConnectionState(ConnectionState::Disconnected)],
        );
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if lock(&self.state).connected.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let (sink, replies) = {
            let mut state = lock(&self.state);
            if state.connected.is_none() {
                return Err(TransportError::NotConnected);
            }
            if state.fail_send {
                return Err(TransportError::Io("simulated write failure".to_string()));
            }
            state.sent.push(frame.to_vec());

            let replies = match decode_command(frame) {
                Ok(HostCommand::StartTransaction { .. }) => {
                    state.running = true;
                    state.start_responses.pop_front().unwrap_or_default()
                }
                Ok(HostCommand::CancelTransaction) if state.running => {
                    state.running = false;
                    vec![DeviceMessage::status(DeviceTransactionStatus::HostCancelled)]
                }
                Ok(HostCommand::CancelTransaction) => Vec::new(),
                Ok(cmd @ (HostCommand::Beep { .. } | HostCommand::SetLed { .. })) => {
                    vec![DeviceMessage::OperationStatus {
                        command: cmd.code() as u8,
                        result: OperationResult::Ok,
                    }]
                }
                Err(e) => {
                    debug!("simulated reader ignoring undecodable frame: {e}");
                    Vec::new()
                }
            };
            (state.sink.clone(), replies)
        };
        push(sink.as_ref(), replies);
        Ok(())
    }

    fn subscribe(&self, sink: EventSink) {
        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        state.sink = Some(sink);
    }

    fn unsubscribe(&self) {
        lock(&self.state).sink = None;
    }

    fn amount_encoding(&self) -> AmountEncoding {
        self.encoding
    }

    fn current_device(&self) -> Option<DeviceInfo> {
        lock(&self.state).connected.clone()
    }
}

fn push(sink: Option<&EventSink>, messages: Vec<DeviceMessage>) {
    let Some(sink) = sink else {
        if !messages.is_empty() {
            debug!("simulated reader has no subscriber; {} message(s) dropped", messages.len());
        }
        return;
    };
    for msg in messages {
        if sink.send(msg).is_err() {
            debug!("simulated reader subscriber closed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reader_core::{Amount, PaymentMethods};
    use tokio::sync::mpsc;

    fn start_frame() -> Vec<u8> {
        reader_core::encode_command(&HostCommand::StartTransaction {
            amount: Amount::from_minor_units(100).unwrap(),
            timeout_secs: 30,
            methods: PaymentMethods::all(),
            encoding: AmountEncoding::DecimalString,
        })
    }

    #[test]
    fn test_scan_without_reader_is_empty() {
        let mock = MockTransport::new();
        assert!(mock.scan().unwrap().is_empty());
        assert!(matches!(mock.connect(None), Err(TransportError::DeviceNotFound)));
    }

    #[test]
    fn test_connect_is_idempotent() {
        // Arrange
        let mock = MockTransport::with_device(MockTransport::reader_info("B4B1234"));

        // Act
        let first = mock.connect(None).unwrap();
        let second = mock.connect(None).unwrap();

        // Assert
        assert_eq!(first, second);
        assert_eq!(mock.open_count(), 1);
    }

    #[test]
    fn test_scan_while_connected_returns_current_reader() {
        let mock = MockTransport::with_device(MockTransport::reader_info("A"));
        lock(&mock.state).attached.push(MockTransport::reader_info("B"));
        mock.connect(Some(&DeviceId("B".to_string()))).unwrap();

        let devices = mock.scan().unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial_number, "B");
    }

    #[test]
    fn test_start_frame_replays_queued_script() {
        let mock = MockTransport::with_device(MockTransport::reader_info("X"));
        let (sink, mut rx) = mpsc::unbounded_channel();
        mock.subscribe(sink);
        mock.connect(None).unwrap();
        mock.queue_start_response(vec![DeviceMessage::status(DeviceTransactionStatus::CardSwiped)]);

        mock.send_frame(&start_frame()).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceMessage::ConnectionState(ConnectionState::Connected)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceMessage::status(DeviceTransactionStatus::CardSwiped)
        );
    }

    #[test]
    fn test_cancel_is_acknowledged_only_while_running() {
        let mock = MockTransport::with_device(MockTransport::reader_info("X"));
        mock.connect(None).unwrap();
        let (sink, mut rx) = mpsc::unbounded_channel();
        mock.subscribe(sink);
        let cancel = reader_core::encode_command(&HostCommand::CancelTransaction);

        mock.send_frame(&cancel).unwrap();
        assert!(rx.try_recv().is_err());

        mock.send_frame(&start_frame()).unwrap();
        mock.send_frame(&cancel).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceMessage::status(DeviceTransactionStatus::HostCancelled)
        );
    }

    #[test]
    fn test_send_requires_connection() {
        let mock = MockTransport::with_device(MockTransport::reader_info("X"));
        assert!(matches!(mock.send_frame(&[0x11]), Err(TransportError::NotConnected)));
    }
}
