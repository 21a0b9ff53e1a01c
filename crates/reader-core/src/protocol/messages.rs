//! Typed messages exchanged between the host and the card reader.
//!
//! After HID reassembly every device message is `[type:1][payload:N]` and
//! every host command is `[command:1][payload:N]`.  See [`crate::protocol::codec`]
//! for the byte-level encoding.

use serde::{Deserialize, Serialize};

use crate::domain::amount::Amount;
use crate::domain::transaction::{ConnectionState, DeviceTransactionStatus, PaymentMethods};

// ── Message type codes ────────────────────────────────────────────────────────

/// Device → host message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceMessageType {
    ConnectionState = 0x01,
    TransactionStatus = 0x02,
    CardData = 0x03,
    AuthorizationRequest = 0x04,
    DisplayMessage = 0x05,
    OperationStatus = 0x06,
    DeviceEvent = 0x07,
}

impl TryFrom<u8> for DeviceMessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DeviceMessageType::ConnectionState),
            0x02 => Ok(DeviceMessageType::TransactionStatus),
            0x03 => Ok(DeviceMessageType::CardData),
            0x04 => Ok(DeviceMessageType::AuthorizationRequest),
            0x05 => Ok(DeviceMessageType::DisplayMessage),
            0x06 => Ok(DeviceMessageType::OperationStatus),
            0x07 => Ok(DeviceMessageType::DeviceEvent),
            other => Err(other),
        }
    }
}

/// Host → device command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HostCommandCode {
    StartTransaction = 0x10,
    CancelTransaction = 0x11,
    Beep = 0x12,
    SetLed = 0x13,
}

impl TryFrom<u8> for HostCommandCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(HostCommandCode::StartTransaction),
            0x11 => Ok(HostCommandCode::CancelTransaction),
            0x12 => Ok(HostCommandCode::Beep),
            0x13 => Ok(HostCommandCode::SetLed),
            other => Err(other),
        }
    }
}

/// TLV tags used in the start-transaction payload.
pub mod start_tags {
    /// Device-side timeout in seconds (1 byte).
    pub const TIMEOUT: &[u8] = &[0xDF, 0xDF, 0x20];
    /// Accepted payment-method bitmask (1 byte).
    pub const PAYMENT_METHODS: &[u8] = &[0xDF, 0xDF, 0x30];
    /// EMV transaction type; `0x00` is a purchase.
    pub const TRANSACTION_TYPE: &[u8] = &[0x9C];
    /// EMV amount authorised, `n12` BCD.
    pub const AMOUNT_BCD: &[u8] = &[0x9F, 0x02];
    /// Amount as an ASCII decimal string.
    pub const AMOUNT_STRING: &[u8] = &[0xDF, 0xDF, 0x31];
}

/// EMV transaction type for a purchase.
pub const TRANSACTION_TYPE_PURCHASE: u8 = 0x00;

// ── Supporting enums ──────────────────────────────────────────────────────────

/// How a backend wants the amount on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AmountEncoding {
    /// `"1.00"` under tag `DFDF31`.
    #[default]
    DecimalString,
    /// 12 BCD digits of minor units under tag `9F02`.
    MinorUnitsBcd,
}

/// Result byte of an operation-status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Ok,
    Rejected,
    Busy,
    Failure,
    Unknown(u8),
}

impl OperationResult {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => OperationResult::Ok,
            0x01 => OperationResult::Rejected,
            0x02 => OperationResult::Busy,
            0xFF => OperationResult::Failure,
            other => OperationResult::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            OperationResult::Ok => 0x00,
            OperationResult::Rejected => 0x01,
            OperationResult::Busy => 0x02,
            OperationResult::Failure => 0xFF,
            OperationResult::Unknown(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == OperationResult::Ok
    }
}

/// Physical event reported by the reader outside the status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEventKind {
    CardInserted,
    CardRemoved,
    CardSwiped,
    ContactlessTap,
    Button,
    Unknown(u8),
}

impl DeviceEventKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => DeviceEventKind::CardInserted,
            0x02 => DeviceEventKind::CardRemoved,
            0x03 => DeviceEventKind::CardSwiped,
            0x04 => DeviceEventKind::ContactlessTap,
            0x05 => DeviceEventKind::Button,
            other => DeviceEventKind::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceEventKind::CardInserted => 0x01,
            DeviceEventKind::CardRemoved => 0x02,
            DeviceEventKind::CardSwiped => 0x03,
            DeviceEventKind::ContactlessTap => 0x04,
            DeviceEventKind::Button => 0x05,
            DeviceEventKind::Unknown(code) => code,
        }
    }
}

// ── Device messages ───────────────────────────────────────────────────────────

/// A reassembled message from the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    ConnectionState(ConnectionState),
    TransactionStatus {
        status: DeviceTransactionStatus,
        message: String,
    },
    /// Magstripe card-data TLV frame.
    CardData(Vec<u8>),
    /// EMV authorization-request (ARQC) TLV frame.
    AuthorizationRequest(Vec<u8>),
    DisplayMessage(String),
    OperationStatus {
        command: u8,
        result: OperationResult,
    },
    DeviceEvent {
        event: DeviceEventKind,
        data: Vec<u8>,
    },
    /// Unrecognised message type; carried through for logging.
    Other { code: u8, payload: Vec<u8> },
}

impl DeviceMessage {
    /// Short category name for logs.
    pub fn category(&self) -> &'static str {
        match self {
            DeviceMessage::ConnectionState(_) => "connection-state",
            DeviceMessage::TransactionStatus { .. } => "transaction-status",
            DeviceMessage::CardData(_) => "card-data",
            DeviceMessage::AuthorizationRequest(_) => "authorization-request",
            DeviceMessage::DisplayMessage(_) => "display-message",
            DeviceMessage::OperationStatus { .. } => "operation-status",
            DeviceMessage::DeviceEvent { .. } => "device-event",
            DeviceMessage::Other { .. } => "other",
        }
    }

    /// Builds a status message without text.
    pub fn status(status: DeviceTransactionStatus) -> Self {
        DeviceMessage::TransactionStatus {
            status,
            message: String::new(),
        }
    }
}

// ── Host commands ─────────────────────────────────────────────────────────────

/// A command sent to the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    StartTransaction {
        amount: Amount,
        timeout_secs: u8,
        methods: PaymentMethods,
        encoding: AmountEncoding,
    },
    CancelTransaction,
    Beep { count: u8 },
    SetLed { index: u8, on: bool },
}

impl HostCommand {
    pub fn code(&self) -> HostCommandCode {
        match self {
            HostCommand::StartTransaction { .. } => HostCommandCode::StartTransaction,
            HostCommand::CancelTransaction => HostCommandCode::CancelTransaction,
            HostCommand::Beep { .. } => HostCommandCode::Beep,
            HostCommand::SetLed { .. } => HostCommandCode::SetLed,
        }
    }
}
