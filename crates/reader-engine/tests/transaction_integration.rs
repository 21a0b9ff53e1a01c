//! End-to-end transaction tests through the public service API.
//!
//! Every test wires a [`CardReaderService`] around the simulated push-model
//! reader, so the full path is exercised: coordinator → transport → scripted
//! reader replies → dispatcher pump → coordinator → caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

use reader_core::protocol::card_data::tags;
use reader_core::protocol::tlv::encode_tlv;
use reader_core::{
    Amount, AmountEncoding, ConnectionState, DeviceMessage, DeviceTransactionStatus, HostCommand,
    PaymentMethods, TransactionStatus,
};
use reader_engine::application::coordinator::{CancelReason, TransactionError};
use reader_engine::application::notifier::Notification;
use reader_engine::application::service::{CardReaderService, ServiceOptions};
use reader_engine::application::transport::DeviceTransport;
use reader_engine::infrastructure::transport::MockTransport;

const KSN: &[u8] = &[0x95, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x2A, 0x00, 0x07];
const EMV_DATA: &[u8] = &[0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6];

// ── Helpers ───────────────────────────────────────────────────────────────────

fn one_dollar() -> Amount {
    "1.00".parse().unwrap()
}

fn valid_frame() -> Vec<u8> {
    let mut inner = Vec::new();
    inner.extend(encode_tlv(tags::KSN, KSN));
    inner.extend(encode_tlv(tags::CARD_TYPE, &[0x03]));
    inner.extend(encode_tlv(tags::ENCRYPTED_DATA, EMV_DATA));
    encode_tlv(&[0xFA], &encode_tlv(&[0xF8], &inner))
}

fn card_type_only_frame() -> Vec<u8> {
    encode_tlv(&[0xFA], &encode_tlv(tags::CARD_TYPE, &[0x02]))
}

fn quiet_options() -> ServiceOptions {
    ServiceOptions {
        beep_on_completion: false,
        ..ServiceOptions::default()
    }
}

/// A connected service over a simulated reader with serial `B4B1234`.
fn connected_service(options: ServiceOptions) -> (Arc<MockTransport>, Arc<CardReaderService>) {
    let mock = Arc::new(MockTransport::with_device(MockTransport::reader_info("B4B1234")));
    let service = Arc::new(CardReaderService::new(mock.clone(), options));
    assert_ok!(service.connect(None));
    (mock, service)
}

/// Yields until the coordinator has a live transaction.
async fn wait_until_active(service: &CardReaderService) {
    for _ in 0..1000 {
        if service.coordinator().is_active() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("transaction never became active");
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

// ── Discovery and connection ──────────────────────────────────────────────────

#[tokio::test]
async fn test_scan_with_no_reader_returns_empty_list() {
    // Arrange
    let service = CardReaderService::new(Arc::new(MockTransport::new()), quiet_options());

    // Act
    let devices = assert_ok!(service.scan_devices());

    // Assert
    assert!(devices.is_empty());
    assert!(!service.is_connected());
}

#[tokio::test]
async fn test_connect_without_reader_fails_with_device_not_found() {
    let service = CardReaderService::new(Arc::new(MockTransport::new()), quiet_options());

    let err = assert_err!(service.connect(None));

    assert!(err.to_string().contains("no card reader"));
}

#[tokio::test]
async fn test_connect_notifies_observers_with_serial() {
    // Arrange
    let mock = Arc::new(MockTransport::with_device(MockTransport::reader_info("B4B1234")));
    let service = CardReaderService::new(mock.clone(), quiet_options());
    let mut rx = service.subscribe();

    // Act
    service.connect(None).unwrap();
    let note = loop {
        match rx.recv().await.unwrap() {
            n @ Notification::ConnectionChanged { .. } => break n,
            _ => continue,
        }
    };

    // Assert
    assert_eq!(
        note,
        Notification::ConnectionChanged {
            connected: true,
            serial: "B4B1234".into()
        }
    );
}

#[tokio::test]
async fn test_start_without_connection_is_not_connected() {
    let service = CardReaderService::new(
        Arc::new(MockTransport::with_device(MockTransport::reader_info("X"))),
        quiet_options(),
    );

    let outcome = service
        .start_transaction(one_dollar(), Duration::from_secs(30))
        .await;

    assert!(matches!(outcome, Err(TransactionError::NotConnected)));
}

// ── Transaction scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_valid_card_frame_completes_transaction() {
    // Arrange
    let (mock, service) = connected_service(quiet_options());
    mock.queue_start_response(vec![
        DeviceMessage::status(DeviceTransactionStatus::CardDetected),
        DeviceMessage::status(DeviceTransactionStatus::TransactionInProgress),
        DeviceMessage::AuthorizationRequest(valid_frame()),
    ]);

    // Act
    let card = tokio::time::timeout(
        Duration::from_secs(1),
        service.start_transaction(one_dollar(), Duration::from_secs(30)),
    )
    .await
    .expect("resolved within 1s")
    .expect("valid card data");

    // Assert
    assert!(card.is_valid());
    assert_eq!(card.ksn, "950003000000012A0007");
    assert_eq!(card.encrypted_data, "A1B2C3D4E5F6");
    assert_eq!(card.card_type, "03");
    // The frame carried no serial; the connected reader's is used.
    assert_eq!(card.device_serial_number, "B4B1234");
    assert_eq!(service.status(), TransactionStatus::Completed);
    assert!(!service.coordinator().is_active());
}

#[tokio::test]
async fn test_start_frame_carries_amount_and_methods() {
    let mock = Arc::new(
        MockTransport::with_device(MockTransport::reader_info("B4B1234"))
            .with_amount_encoding(AmountEncoding::MinorUnitsBcd),
    );
    let service = CardReaderService::new(mock.clone(), quiet_options());
    service.connect(None).unwrap();
    mock.queue_start_response(vec![DeviceMessage::CardData(valid_frame())]);

    service
        .start_transaction(one_dollar(), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(
        mock.sent_commands()[0],
        HostCommand::StartTransaction {
            amount: one_dollar(),
            timeout_secs: 30,
            methods: PaymentMethods::all(),
            encoding: AmountEncoding::MinorUnitsBcd,
        }
    );
}

#[tokio::test]
async fn test_device_timeout_status_resolves_as_timeout() {
    // Arrange
    let (mock, service) = connected_service(quiet_options());
    mock.queue_start_response(vec![
        DeviceMessage::status(DeviceTransactionStatus::TimedOut),
        // Must be ignored: the transaction already ended.
        DeviceMessage::AuthorizationRequest(valid_frame()),
    ]);

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        service.start_transaction(one_dollar(), Duration::from_secs(30)),
    )
    .await
    .expect("not hung");

    // Assert
    assert!(matches!(outcome, Err(TransactionError::Timeout)));
    assert_eq!(service.status(), TransactionStatus::TimedOut);
}

#[tokio::test]
async fn test_card_type_only_frame_does_not_complete_transaction() {
    // Arrange
    let (mock, service) = connected_service(quiet_options());
    let mut rx = service.subscribe();
    mock.queue_start_response(vec![DeviceMessage::AuthorizationRequest(card_type_only_frame())]);

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        service.start_transaction(one_dollar(), Duration::from_secs(30)),
    )
    .await;

    // Assert
    assert!(outcome.is_err(), "an invalid frame must not resolve the transaction");
    let notes = drain(&mut rx);
    assert!(!notes
        .iter()
        .any(|n| matches!(n, Notification::CardDataReceived(_))));
    assert!(notes
        .iter()
        .any(|n| matches!(n, Notification::LogMessage(t) if t.contains("no usable KSN"))));
}

#[tokio::test(start_paused = true)]
async fn test_local_timeout_resolves_exactly_once() {
    // Arrange: the reader never answers.
    let (mock, service) = connected_service(quiet_options());
    let mut rx = service.subscribe();

    // Act
    let outcome = service
        .start_transaction(one_dollar(), Duration::from_secs(5))
        .await;
    tokio::task::yield_now().await;

    // Assert
    assert!(matches!(outcome, Err(TransactionError::Timeout)));
    let timeouts = drain(&mut rx)
        .into_iter()
        .filter(|n| {
            matches!(
                n,
                Notification::TransactionStatusChanged {
                    status: TransactionStatus::TimedOut,
                    ..
                }
            )
        })
        .count();
    assert_eq!(timeouts, 1);
    assert_eq!(
        mock.sent_commands().last(),
        Some(&HostCommand::CancelTransaction)
    );
}

#[tokio::test]
async fn test_cancel_with_no_active_transaction_is_a_no_op() {
    // Arrange
    let (mock, service) = connected_service(quiet_options());
    let before = service.status();

    // Act
    let cancelled = service.cancel_transaction();

    // Assert
    assert!(!cancelled);
    assert_eq!(service.status(), before);
    assert!(mock.sent_frames().is_empty());
}

#[tokio::test]
async fn test_explicit_cancel_resolves_waiter_as_cancelled() {
    let (_mock, service) = connected_service(quiet_options());
    let waiter = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .start_transaction(one_dollar(), Duration::from_secs(30))
                .await
        })
    };
    wait_until_active(&service).await;

    assert!(service.cancel_transaction());
    let outcome = waiter.await.unwrap();

    assert!(matches!(
        outcome,
        Err(TransactionError::Cancelled(CancelReason::Local))
    ));
    assert_eq!(service.status(), TransactionStatus::Cancelled);
}

#[tokio::test]
async fn test_second_start_supersedes_first() {
    // Arrange: first start gets no replies, second gets a card.
    let (mock, service) = connected_service(quiet_options());
    mock.queue_start_response(Vec::new());
    mock.queue_start_response(vec![DeviceMessage::AuthorizationRequest(valid_frame())]);

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .start_transaction(one_dollar(), Duration::from_secs(30))
                .await
        })
    };
    wait_until_active(&service).await;

    // Act
    let second = tokio::time::timeout(
        Duration::from_secs(1),
        service.start_transaction("2.50".parse().unwrap(), Duration::from_secs(30)),
    )
    .await
    .expect("second transaction resolved");

    // Assert
    assert!(matches!(
        first.await.unwrap(),
        Err(TransactionError::Cancelled(CancelReason::Superseded))
    ));
    assert!(second.unwrap().is_valid());
    let kinds: Vec<_> = mock.sent_commands().iter().map(HostCommand::code).collect();
    assert_eq!(kinds.len(), 3, "start, cancel, start: {kinds:?}");
    assert_eq!(mock.sent_commands()[1], HostCommand::CancelTransaction);
}

#[tokio::test]
async fn test_host_cancel_from_reader_resolves_as_cancelled() {
    let (mock, service) = connected_service(quiet_options());
    mock.queue_start_response(vec![DeviceMessage::TransactionStatus {
        status: DeviceTransactionStatus::HostCancelled,
        message: "Cancel pressed".into(),
    }]);

    let outcome = service
        .start_transaction(one_dollar(), Duration::from_secs(30))
        .await;

    assert!(matches!(
        outcome,
        Err(TransactionError::Cancelled(CancelReason::Host))
    ));
}

#[tokio::test]
async fn test_decline_without_card_data_is_a_failure() {
    let (mock, service) = connected_service(quiet_options());
    mock.queue_start_response(vec![DeviceMessage::status(
        DeviceTransactionStatus::TransactionDeclined,
    )]);

    let outcome = service
        .start_transaction(one_dollar(), Duration::from_secs(30))
        .await;

    assert!(matches!(outcome, Err(TransactionError::Declined)));
    assert_eq!(service.status(), TransactionStatus::Declined);
}

#[tokio::test]
async fn test_completion_beep_is_sent_when_enabled() {
    let (mock, service) = connected_service(ServiceOptions::default());
    mock.queue_start_response(vec![DeviceMessage::CardData(valid_frame())]);

    service
        .start_transaction(one_dollar(), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(
        mock.sent_commands().last(),
        Some(&HostCommand::Beep { count: 1 })
    );
}

#[tokio::test]
async fn test_every_start_resubscribes_the_dispatcher() {
    let (mock, service) = connected_service(quiet_options());
    let before = mock.subscribe_count();
    mock.queue_start_response(vec![DeviceMessage::CardData(valid_frame())]);

    service
        .start_transaction(one_dollar(), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(mock.subscribe_count(), before + 1);
}

// ── Disconnection ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_cancels_active_transaction_first() {
    // Arrange
    let (mock, service) = connected_service(quiet_options());
    let waiter = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .start_transaction(one_dollar(), Duration::from_secs(30))
                .await
        })
    };
    wait_until_active(&service).await;

    // Act
    assert_ok!(service.disconnect());

    // Assert
    assert!(matches!(
        waiter.await.unwrap(),
        Err(TransactionError::Cancelled(CancelReason::Disconnected))
    ));
    assert_eq!(
        mock.sent_commands().last(),
        Some(&HostCommand::CancelTransaction)
    );
    assert!(!service.is_connected());
}

#[tokio::test]
async fn test_disconnect_twice_is_a_no_op_the_second_time() {
    let (mock, service) = connected_service(quiet_options());

    assert_ok!(service.disconnect());
    let frames_after_first = mock.sent_frames().len();
    assert_ok!(service.disconnect());

    assert_eq!(mock.sent_frames().len(), frames_after_first);
    assert_eq!(mock.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unplug_mid_transaction_resolves_as_cancelled() {
    let (mock, service) = connected_service(quiet_options());
    let waiter = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .start_transaction(one_dollar(), Duration::from_secs(30))
                .await
        })
    };
    wait_until_active(&service).await;

    mock.unplug();
    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("not left pending")
        .unwrap();

    assert!(matches!(
        outcome,
        Err(TransactionError::Cancelled(CancelReason::Disconnected))
    ));
    assert!(!service.is_connected());
    assert!(assert_ok!(service.scan_devices()).is_empty());
}

// ── Dispatcher robustness ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_messages_do_not_stop_dispatch() {
    // Arrange
    let (mock, service) = connected_service(quiet_options());
    let mut rx = service.subscribe();

    // Act
    mock.inject(DeviceMessage::Other {
        code: 0x7E,
        payload: vec![0xDE, 0xAD],
    });
    mock.inject(DeviceMessage::status(DeviceTransactionStatus::Unknown(0x99)));
    mock.inject(DeviceMessage::DisplayMessage("PRESENT CARD".into()));

    // Assert
    let note = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Notification::DisplayMessage(text) = rx.recv().await.unwrap() {
                break text;
            }
        }
    })
    .await
    .expect("display message delivered");
    assert_eq!(note, "PRESENT CARD");
}
