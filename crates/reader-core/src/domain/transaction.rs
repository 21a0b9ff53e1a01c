//! Transaction domain types: statuses, the per-transaction state machine,
//! payment methods, and the connection state.
//!
//! # State machine
//!
//! ```text
//! Idle → WaitingForCard → {CardDetected | CardInserted | CardSwiped | CardCollision}
//!      → InProgress → {Completed | Approved → Completed | Declined | Failed
//!                      | TimedOut | Cancelled | NotAccepted}
//! ```
//!
//! The reader is authoritative: a status it reports out of the expected order
//! is still applied (and logged by the caller), with one exception.  Once a
//! terminal status has been reached it is sticky and later statuses are
//! ignored.
//!
//! A terminal status from the reader is not the same as an outcome, though.
//! A reader may report `Completed` before it has sent any card data; if the
//! caller then times out, [`Transaction::settle`] records what the caller
//! actually received.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::amount::Amount;

// ── Connection state ──────────────────────────────────────────────────────────

/// Connection lifecycle of the reader as tracked by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0x00,
    Connecting = 0x01,
    Connected = 0x02,
    Disconnecting = 0x03,
}

impl TryFrom<u8> for ConnectionState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ConnectionState::Disconnected),
            0x01 => Ok(ConnectionState::Connecting),
            0x02 => Ok(ConnectionState::Connected),
            0x03 => Ok(ConnectionState::Disconnecting),
            _ => Err(()),
        }
    }
}

// ── Engine-level transaction status ───────────────────────────────────────────

/// Status of the single live transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[default]
    Idle,
    WaitingForCard,
    CardDetected,
    CardInserted,
    CardSwiped,
    CardRemoved,
    CardCollision,
    InProgress,
    Completed,
    Approved,
    Declined,
    Failed,
    TimedOut,
    Cancelled,
    NotAccepted,
    TryAnotherInterface,
}

impl TransactionStatus {
    /// Terminal statuses end the transaction.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Declined
                | TransactionStatus::Failed
                | TransactionStatus::TimedOut
                | TransactionStatus::Cancelled
                | TransactionStatus::NotAccepted
        )
    }

    /// Human-readable message suitable for a customer-facing display.
    pub fn description(self) -> &'static str {
        match self {
            TransactionStatus::Idle => "Ready",
            TransactionStatus::WaitingForCard => "Please insert, tap, or swipe your card",
            TransactionStatus::CardDetected => "Card detected",
            TransactionStatus::CardInserted => "Card inserted, please do not remove",
            TransactionStatus::CardSwiped => "Card swiped",
            TransactionStatus::CardRemoved => "Card removed",
            TransactionStatus::CardCollision => "More than one card detected, present one card",
            TransactionStatus::InProgress => "Processing",
            TransactionStatus::Completed => "Transaction complete",
            TransactionStatus::Approved => "Approved",
            TransactionStatus::Declined => "Declined",
            TransactionStatus::Failed => "Transaction failed",
            TransactionStatus::TimedOut => "Transaction timed out",
            TransactionStatus::Cancelled => "Transaction cancelled",
            TransactionStatus::NotAccepted => "Card not accepted",
            TransactionStatus::TryAnotherInterface => "Please try another way to pay",
        }
    }

    /// Whether `next` is a transition the state machine expects from `self`.
    pub fn expects(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, TimedOut | Cancelled | Failed | NotAccepted) {
            return true;
        }
        match self {
            Idle => next == WaitingForCard,
            WaitingForCard | TryAnotherInterface | CardRemoved => matches!(
                next,
                CardDetected | CardInserted | CardSwiped | CardCollision | CardRemoved
                    | InProgress | TryAnotherInterface | WaitingForCard
            ),
            CardDetected | CardInserted | CardSwiped | CardCollision => matches!(
                next,
                CardDetected | CardInserted | CardSwiped | CardCollision | CardRemoved
                    | InProgress | TryAnotherInterface | Completed | Declined
            ),
            InProgress => matches!(
                next,
                Approved | Completed | Declined | CardRemoved | TryAnotherInterface | InProgress
            ),
            Approved => matches!(next, Completed | CardRemoved),
            Completed | Declined | Failed | TimedOut | Cancelled | NotAccepted => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Device-reported status codes ──────────────────────────────────────────────

/// Status codes exactly as the reader reports them.
///
/// Several of these collapse onto one [`TransactionStatus`]; the distinction
/// is kept so logs show what the device actually said.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceTransactionStatus {
    NoStatus,
    NoTransaction,
    CardSwiped,
    CardInserted,
    CardRemoved,
    CardDetected,
    CardCollision,
    TimedOut,
    HostCancelled,
    TransactionCancelled,
    TransactionInProgress,
    TransactionError,
    TransactionApproved,
    TransactionDeclined,
    TransactionCompleted,
    TransactionFailed,
    TransactionNotAccepted,
    SignatureCaptureRequested,
    TechnicalFallback,
    QuickChipDeferred,
    DataEntered,
    TryAnotherInterface,
    Unknown(u8),
}

/// How a terminal device status must resolve a pending transaction that has
/// not yet produced card data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalResolution {
    TimedOut,
    HostCancelled,
    Failed,
    NotAccepted,
    Declined,
}

impl DeviceTransactionStatus {
    pub fn from_code(code: u8) -> Self {
        use DeviceTransactionStatus::*;
        match code {
            0x00 => NoStatus,
            0x01 => NoTransaction,
            0x02 => CardSwiped,
            0x03 => CardInserted,
            0x04 => CardRemoved,
            0x05 => CardDetected,
            0x06 => CardCollision,
            0x07 => TimedOut,
            0x08 => HostCancelled,
            0x09 => TransactionCancelled,
            0x0A => TransactionInProgress,
            0x0B => TransactionError,
            0x0C => TransactionApproved,
            0x0D => TransactionDeclined,
            0x0E => TransactionCompleted,
            0x0F => TransactionFailed,
            0x10 => TransactionNotAccepted,
            0x11 => SignatureCaptureRequested,
            0x12 => TechnicalFallback,
            0x13 => QuickChipDeferred,
            0x14 => DataEntered,
            0x15 => TryAnotherInterface,
            other => Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        use DeviceTransactionStatus::*;
        match self {
            NoStatus => 0x00,
            NoTransaction => 0x01,
            CardSwiped => 0x02,
            CardInserted => 0x03,
            CardRemoved => 0x04,
            CardDetected => 0x05,
            CardCollision => 0x06,
            TimedOut => 0x07,
            HostCancelled => 0x08,
            TransactionCancelled => 0x09,
            TransactionInProgress => 0x0A,
            TransactionError => 0x0B,
            TransactionApproved => 0x0C,
            TransactionDeclined => 0x0D,
            TransactionCompleted => 0x0E,
            TransactionFailed => 0x0F,
            TransactionNotAccepted => 0x10,
            SignatureCaptureRequested => 0x11,
            TechnicalFallback => 0x12,
            QuickChipDeferred => 0x13,
            DataEntered => 0x14,
            TryAnotherInterface => 0x15,
            Unknown(code) => code,
        }
    }

    /// Maps the device status onto the engine state machine.
    ///
    /// `None` means the status carries no state change (informational or
    /// unknown codes).
    pub fn to_status(self) -> Option<TransactionStatus> {
        use DeviceTransactionStatus as D;
        use TransactionStatus as T;
        match self {
            D::NoStatus | D::NoTransaction | D::Unknown(_) => None,
            D::CardSwiped => Some(T::CardSwiped),
            D::CardInserted => Some(T::CardInserted),
            D::CardRemoved => Some(T::CardRemoved),
            D::CardDetected => Some(T::CardDetected),
            D::CardCollision => Some(T::CardCollision),
            D::TimedOut => Some(T::TimedOut),
            D::HostCancelled | D::TransactionCancelled => Some(T::Cancelled),
            D::TransactionInProgress
            | D::SignatureCaptureRequested
            | D::QuickChipDeferred
            | D::DataEntered => Some(T::InProgress),
            D::TransactionError | D::TransactionFailed => Some(T::Failed),
            D::TransactionApproved => Some(T::Approved),
            D::TransactionDeclined => Some(T::Declined),
            D::TransactionCompleted => Some(T::Completed),
            D::TransactionNotAccepted => Some(T::NotAccepted),
            D::TechnicalFallback | D::TryAnotherInterface => Some(T::TryAnotherInterface),
        }
    }

    /// Statuses that must resolve a pending waiter immediately, because no
    /// card data will follow them.
    pub fn terminal_resolution(self) -> Option<TerminalResolution> {
        use DeviceTransactionStatus as D;
        match self {
            D::TimedOut => Some(TerminalResolution::TimedOut),
            D::HostCancelled | D::TransactionCancelled => Some(TerminalResolution::HostCancelled),
            D::TransactionError | D::TransactionFailed => Some(TerminalResolution::Failed),
            D::TransactionNotAccepted => Some(TerminalResolution::NotAccepted),
            D::TransactionDeclined => Some(TerminalResolution::Declined),
            _ => None,
        }
    }
}

// ── Payment methods ───────────────────────────────────────────────────────────

/// One way of presenting a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Swipe,
    Contact,
    Contactless,
}

impl PaymentMethod {
    fn bit(self) -> u8 {
        match self {
            PaymentMethod::Swipe => 0x01,
            PaymentMethod::Contact => 0x02,
            PaymentMethod::Contactless => 0x04,
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "swipe" | "msr" => Ok(PaymentMethod::Swipe),
            "contact" | "chip" => Ok(PaymentMethod::Contact),
            "contactless" | "tap" | "nfc" => Ok(PaymentMethod::Contactless),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

/// Set of accepted payment methods, sent to the reader as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentMethods(u8);

impl PaymentMethods {
    pub const NONE: PaymentMethods = PaymentMethods(0);

    /// Swipe, contact, and contactless.
    pub fn all() -> Self {
        PaymentMethods(0x07)
    }

    pub fn from_bits(bits: u8) -> Self {
        PaymentMethods(bits & 0x07)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, method: PaymentMethod) -> bool {
        self.0 & method.bit() != 0
    }

    pub fn with(self, method: PaymentMethod) -> Self {
        PaymentMethods(self.0 | method.bit())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for PaymentMethods {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<PaymentMethod> for PaymentMethods {
    fn from_iter<I: IntoIterator<Item = PaymentMethod>>(iter: I) -> Self {
        iter.into_iter().fold(PaymentMethods::NONE, PaymentMethods::with)
    }
}

// ── Transaction ───────────────────────────────────────────────────────────────

/// Unique identifier of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub amount: Amount,
    /// Local wall-clock timeout, independent of any device-side timeout.
    pub timeout: Duration,
    pub methods: PaymentMethods,
}

impl TransactionRequest {
    /// A request accepting every payment method.
    pub fn new(amount: Amount, timeout: Duration) -> Self {
        Self {
            amount,
            timeout,
            methods: PaymentMethods::all(),
        }
    }

    pub fn with_methods(mut self, methods: PaymentMethods) -> Self {
        self.methods = methods;
        self
    }

    /// Device-side timeout in whole seconds, clamped to `1..=255`.
    pub fn device_timeout_secs(&self) -> u8 {
        self.timeout.as_secs().clamp(1, u8::MAX as u64) as u8
    }
}

/// Outcome of applying a status to a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Applied, and the state machine expected it.
    Applied,
    /// Applied, but out of the expected order.
    Unexpected { from: TransactionStatus },
    /// Not applied: the transaction already reached a terminal status.
    Ignored { terminal: TransactionStatus },
}

/// One live transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub request: TransactionRequest,
    status: TransactionStatus,
    started_at: Instant,
}

impl Transaction {
    /// Creates a transaction in [`TransactionStatus::Idle`].
    pub fn new(request: TransactionRequest) -> Self {
        Self {
            id: TransactionId::new(),
            request,
            status: TransactionStatus::Idle,
            started_at: Instant::now(),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies `next`, honouring the sticky-terminal rule.
    pub fn advance(&mut self, next: TransactionStatus) -> Transition {
        let from = self.status;
        if from.is_terminal() {
            return Transition::Ignored { terminal: from };
        }
        self.status = next;
        if from.expects(next) {
            Transition::Applied
        } else {
            Transition::Unexpected { from }
        }
    }

    /// Records the outcome delivered to the caller, replacing any terminal
    /// status the reader reported earlier.
    pub fn settle(&mut self, outcome: TransactionStatus) {
        self.status = outcome;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
