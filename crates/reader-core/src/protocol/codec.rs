//! Binary codec for reader messages and host commands.
//!
//! Wire format, after HID reassembly:
//! ```text
//! device → host:  [type:1][payload:N]
//! host → device:  [command:1][payload:N]
//! ```
//! The start-transaction payload is itself a BER-TLV list; see
//! [`crate::protocol::messages::start_tags`].

use thiserror::Error;

use crate::domain::amount::Amount;
use crate::domain::transaction::{ConnectionState, DeviceTransactionStatus, PaymentMethods};
use crate::protocol::messages::{
    start_tags, AmountEncoding, DeviceEventKind, DeviceMessage, DeviceMessageType, HostCommand,
    HostCommandCode, OperationResult, TRANSACTION_TYPE_PURCHASE,
};
use crate::protocol::tlv::{decode_tlv, encode_tlv, TlvError};

/// Errors that can occur while encoding or decoding messages and reports.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The command byte is not a recognised host command.
    #[error("unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    /// The payload could not be parsed (field value out of range, missing tag, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A TLV payload failed to decode.
    #[error("TLV payload: {0}")]
    Tlv(#[from] TlvError),

    /// The first byte of a HID report is not a known packet type.
    #[error("unknown packet type: 0x{0:02X}")]
    UnknownPacketType(u8),

    /// A middle or tail packet arrived with no message in progress.
    #[error("continuation packet 0x{0:02X} without a head packet")]
    UnexpectedContinuation(u8),

    /// A continuation packet skipped or repeated a sequence number.
    #[error("packet sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u16, got: u16 },

    /// More payload arrived than the head packet declared.
    #[error("message overflow: head declared {declared} bytes, received {received}")]
    LengthOverflow { declared: usize, received: usize },

    /// The configured HID report size is outside the supported range.
    #[error("unsupported report size {0}")]
    InvalidReportSize(usize),
}

// ── Device messages ───────────────────────────────────────────────────────────

/// Encodes a [`DeviceMessage`].
///
/// Used by simulated transports and tests; a real reader produces these bytes
/// itself.
pub fn encode_device_message(msg: &DeviceMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        DeviceMessage::ConnectionState(state) => {
            buf.push(DeviceMessageType::ConnectionState as u8);
            buf.push(*state as u8);
        }
        DeviceMessage::TransactionStatus { status, message } => {
            buf.push(DeviceMessageType::TransactionStatus as u8);
            buf.push(status.code());
            buf.extend_from_slice(message.as_bytes());
        }
        DeviceMessage::CardData(frame) => {
            buf.push(DeviceMessageType::CardData as u8);
            buf.extend_from_slice(frame);
        }
        DeviceMessage::AuthorizationRequest(frame) => {
            buf.push(DeviceMessageType::AuthorizationRequest as u8);
            buf.extend_from_slice(frame);
        }
        DeviceMessage::DisplayMessage(text) => {
            buf.push(DeviceMessageType::DisplayMessage as u8);
            buf.extend_from_slice(text.as_bytes());
        }
        DeviceMessage::OperationStatus { command, result } => {
            buf.push(DeviceMessageType::OperationStatus as u8);
            buf.push(*command);
            buf.push(result.code());
        }
        DeviceMessage::DeviceEvent { event, data } => {
            buf.push(DeviceMessageType::DeviceEvent as u8);
            buf.push(event.code());
            buf.extend_from_slice(data);
        }
        DeviceMessage::Other { code, payload } => {
            buf.push(*code);
            buf.extend_from_slice(payload);
        }
    }
    buf
}

/// Decodes one reassembled device message.
///
/// Unknown message types decode to [`DeviceMessage::Other`] rather than an
/// error so the dispatcher can log and skip them.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the message is empty or a known message type
/// has a truncated or out-of-range payload.
pub fn decode_device_message(bytes: &[u8]) -> Result<DeviceMessage, ProtocolError> {
    require_len(bytes, 1)?;
    let payload = &bytes[1..];

    let msg_type = match DeviceMessageType::try_from(bytes[0]) {
        Ok(t) => t,
        Err(code) => {
            return Ok(DeviceMessage::Other {
                code,
                payload: payload.to_vec(),
            })
        }
    };

    match msg_type {
        DeviceMessageType::ConnectionState => {
            require_len(payload, 1)?;
            let state = ConnectionState::try_from(payload[0]).map_err(|_| {
                ProtocolError::MalformedPayload(format!(
                    "unknown connection state 0x{:02X}",
                    payload[0]
                ))
            })?;
            Ok(DeviceMessage::ConnectionState(state))
        }
        DeviceMessageType::TransactionStatus => {
            require_len(payload, 1)?;
            Ok(DeviceMessage::TransactionStatus {
                status: DeviceTransactionStatus::from_code(payload[0]),
                message: text(&payload[1..]),
            })
        }
        DeviceMessageType::CardData => Ok(DeviceMessage::CardData(payload.to_vec())),
        DeviceMessageType::AuthorizationRequest => {
            Ok(DeviceMessage::AuthorizationRequest(payload.to_vec()))
        }
        DeviceMessageType::DisplayMessage => Ok(DeviceMessage::DisplayMessage(text(payload))),
        DeviceMessageType::OperationStatus => {
            require_len(payload, 2)?;
            Ok(DeviceMessage::OperationStatus {
                command: payload[0],
                result: OperationResult::from_code(payload[1]),
            })
        }
        DeviceMessageType::DeviceEvent => {
            require_len(payload, 1)?;
            Ok(DeviceMessage::DeviceEvent {
                event: DeviceEventKind::from_code(payload[0]),
                data: payload[1..].to_vec(),
            })
        }
    }
}

// ── Host commands ─────────────────────────────────────────────────────────────

/// Encodes a [`HostCommand`].
pub fn encode_command(cmd: &HostCommand) -> Vec<u8> {
    let mut buf = vec![cmd.code() as u8];
    match cmd {
        HostCommand::StartTransaction {
            amount,
            timeout_secs,
            methods,
            encoding,
        } => {
            buf.extend(encode_tlv(start_tags::TIMEOUT, &[(*timeout_secs).max(1)]));
            buf.extend(encode_tlv(start_tags::PAYMENT_METHODS, &[methods.bits()]));
            buf.extend(encode_tlv(
                start_tags::TRANSACTION_TYPE,
                &[TRANSACTION_TYPE_PURCHASE],
            ));
            match encoding {
                AmountEncoding::MinorUnitsBcd => {
                    buf.extend(encode_tlv(start_tags::AMOUNT_BCD, &amount.to_bcd_n12()));
                }
                AmountEncoding::DecimalString => {
                    buf.extend(encode_tlv(
                        start_tags::AMOUNT_STRING,
                        amount.to_decimal_string().as_bytes(),
                    ));
                }
            }
        }
        HostCommand::CancelTransaction => {}
        HostCommand::Beep { count } => buf.push(*count),
        HostCommand::SetLed { index, on } => {
            buf.push(*index);
            buf.push(u8::from(*on));
        }
    }
    buf
}

/// Decodes a host command.
///
/// The reader firmware does this on its side; the host uses it to verify what
/// a transport actually sent.
///
/// # Errors
///
/// Returns [`ProtocolError`] for an unknown command byte, a truncated payload,
/// or a start-transaction payload missing its timeout or amount tag.
pub fn decode_command(bytes: &[u8]) -> Result<HostCommand, ProtocolError> {
    require_len(bytes, 1)?;
    let code = HostCommandCode::try_from(bytes[0]).map_err(ProtocolError::UnknownCommand)?;
    let payload = &bytes[1..];

    match code {
        HostCommandCode::StartTransaction => decode_start_transaction(payload),
        HostCommandCode::CancelTransaction => Ok(HostCommand::CancelTransaction),
        HostCommandCode::Beep => {
            require_len(payload, 1)?;
            Ok(HostCommand::Beep { count: payload[0] })
        }
        HostCommandCode::SetLed => {
            require_len(payload, 2)?;
            Ok(HostCommand::SetLed {
                index: payload[0],
                on: payload[1] != 0,
            })
        }
    }
}

fn decode_start_transaction(payload: &[u8]) -> Result<HostCommand, ProtocolError> {
    let map = decode_tlv(payload)?;

    let timeout_secs = match map.get(start_tags::TIMEOUT) {
        Some([secs]) => *secs,
        _ => {
            return Err(ProtocolError::MalformedPayload(
                "start transaction: missing or oversized timeout".to_string(),
            ))
        }
    };

    let methods = match map.get(start_tags::PAYMENT_METHODS) {
        Some([bits]) => PaymentMethods::from_bits(*bits),
        _ => PaymentMethods::all(),
    };

    let (amount, encoding) = if let Some(bcd) = map.get(start_tags::AMOUNT_BCD) {
        let amount = Amount::from_bcd_n12(bcd)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
        (amount, AmountEncoding::MinorUnitsBcd)
    } else if let Some(ascii) = map.get(start_tags::AMOUNT_STRING) {
        let amount = std::str::from_utf8(ascii)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?
            .parse::<Amount>()
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
        (amount, AmountEncoding::DecimalString)
    } else {
        return Err(ProtocolError::MalformedPayload(
            "start transaction: missing amount".to_string(),
        ));
    };

    Ok(HostCommand::StartTransaction {
        amount,
        timeout_secs,
        methods,
        encoding,
    })
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::InsufficientData {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Decodes device text, dropping trailing NUL padding.
fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn test_start_transaction_decimal_string_layout() {
        // Arrange
        let cmd = HostCommand::StartTransaction {
            amount: amount("1.00"),
            timeout_secs: 30,
            methods: PaymentMethods::all(),
            encoding: AmountEncoding::DecimalString,
        };

        // Act
        let bytes = encode_command(&cmd);

        // Assert
        let expected: Vec<u8> = vec![
            0x10, // command
            0xDF, 0xDF, 0x20, 0x01, 0x1E, // timeout 30 s
            0xDF, 0xDF, 0x30, 0x01, 0x07, // all methods
            0x9C, 0x01, 0x00, // purchase
            0xDF, 0xDF, 0x31, 0x04, b'1', b'.', b'0', b'0',
        ];
        assert_eq!(bytes, expected);
        assert_eq!(decode_command(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_start_transaction_bcd_amount() {
        let cmd = HostCommand::StartTransaction {
            amount: amount("12.34"),
            timeout_secs: 60,
            methods: PaymentMethods::from_bits(0x04),
            encoding: AmountEncoding::MinorUnitsBcd,
        };

        let bytes = encode_command(&cmd);

        assert!(bytes
            .windows(9)
            .any(|w| w == [0x9F, 0x02, 0x06, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34]));
        assert_eq!(decode_command(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_start_transaction_without_amount_is_rejected() {
        let mut bytes = vec![0x10];
        bytes.extend(encode_tlv(start_tags::TIMEOUT, &[30]));

        let result = decode_command(&bytes);

        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_small_commands_layout() {
        assert_eq!(encode_command(&HostCommand::CancelTransaction), vec![0x11]);
        assert_eq!(encode_command(&HostCommand::Beep { count: 2 }), vec![0x12, 0x02]);
        assert_eq!(
            encode_command(&HostCommand::SetLed { index: 1, on: true }),
            vec![0x13, 0x01, 0x01]
        );
        assert_eq!(decode_command(&[0x13, 0x00, 0x00]).unwrap(), HostCommand::SetLed {
            index: 0,
            on: false
        });
    }

    #[test]
    fn test_unknown_command_is_an_error() {
        assert_eq!(decode_command(&[0x7E]), Err(ProtocolError::UnknownCommand(0x7E)));
        assert_eq!(
            decode_command(&[]),
            Err(ProtocolError::InsufficientData {
                needed: 1,
                available: 0
            })
        );
    }

    #[test]
    fn test_decode_status_with_message() {
        let bytes = [0x02, 0x07, b'T', b'i', b'm', b'e', b'o', b'u', b't', 0x00, 0x00];

        let msg = decode_device_message(&bytes).unwrap();

        assert_eq!(
            msg,
            DeviceMessage::TransactionStatus {
                status: DeviceTransactionStatus::TimedOut,
                message: "Timeout".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_unknown_status_code_is_preserved() {
        let msg = decode_device_message(&[0x02, 0x5A]).unwrap();
        assert_eq!(msg, DeviceMessage::status(DeviceTransactionStatus::Unknown(0x5A)));
    }

    #[test]
    fn test_decode_card_data_keeps_frame() {
        let frame = encode_tlv(&[0xDF, 0xDF, 0x56], &[0x01, 0x02]);
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(&frame);

        let msg = decode_device_message(&bytes).unwrap();

        assert_eq!(msg, DeviceMessage::CardData(frame));
    }

    #[test]
    fn test_decode_unknown_type_yields_other() {
        let msg = decode_device_message(&[0x42, 0xAA, 0xBB]).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::Other {
                code: 0x42,
                payload: vec![0xAA, 0xBB]
            }
        );
    }

    #[test]
    fn test_decode_truncated_messages() {
        assert!(matches!(
            decode_device_message(&[0x06, 0x10]),
            Err(ProtocolError::InsufficientData { needed: 2, .. })
        ));
        assert!(matches!(
            decode_device_message(&[0x01, 0x09]),
            Err(ProtocolError::MalformedPayload(_))
        ));
        assert!(decode_device_message(&[]).is_err());
    }

    #[test]
    fn test_device_message_encode_decode() {
        let messages = vec![
            DeviceMessage::ConnectionState(ConnectionState::Connected),
            DeviceMessage::DisplayMessage("PRESENT CARD".to_string()),
            DeviceMessage::OperationStatus {
                command: 0x10,
                result: OperationResult::Busy,
            },
            DeviceMessage::DeviceEvent {
                event: DeviceEventKind::ContactlessTap,
                data: vec![0x01],
            },
            DeviceMessage::AuthorizationRequest(vec![0xF9, 0x00]),
        ];

        for msg in messages {
            let bytes = encode_device_message(&msg);
            assert_eq!(decode_device_message(&bytes).unwrap(), msg);
        }
    }
}
