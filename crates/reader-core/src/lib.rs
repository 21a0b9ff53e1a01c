//! # reader-core
//!
//! Shared library for the card-present transaction engine containing the
//! BER-TLV decoder, the card-data extractor, the device message codec, HID
//! report framing, and the transaction domain types.
//!
//! This crate has zero dependencies on OS APIs, USB stacks, or async runtimes.
//!
//! # Architecture overview (for beginners)
//!
//! A kiosk talks to an EMV / magstripe card reader over USB.  The reader
//! reports what is happening (card inserted, transaction timed out, ...) and,
//! once the cardholder has tapped, dipped, or swiped, hands back a binary
//! frame containing *encrypted* cardholder data.  The kiosk never sees the
//! card number in the clear: it forwards the encrypted blob plus the key
//! serial number (KSN) to a payment gateway, which can decrypt it.
//!
//! This crate (`reader-core`) is the pure, testable foundation:
//!
//! - **`protocol`** – How bytes travel between kiosk and reader.  The
//!   `tlv` module decodes BER-TLV frames, `card_data` turns decoded tags into
//!   a [`CardData`] record, `codec` converts typed messages to and from
//!   bytes, and `packet` splits messages into fixed-size HID reports and
//!   reassembles them.
//!
//! - **`domain`** – Transaction statuses, the connection state, payment
//!   methods, and the [`Amount`] value type.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `reader_core::CardData` instead of `reader_core::protocol::card_data::CardData`.
pub use domain::amount::{Amount, AmountError};
pub use domain::transaction::{
    ConnectionState, DeviceTransactionStatus, PaymentMethod, PaymentMethods, TerminalResolution,
    Transaction, TransactionId, TransactionRequest, TransactionStatus, Transition,
};
pub use protocol::card_data::{extract_card_data, CardData, CardKind, GatewayPayload, PayloadError};
pub use protocol::codec::{
    decode_command, decode_device_message, encode_command, encode_device_message, ProtocolError,
};
pub use protocol::messages::{AmountEncoding, DeviceMessage, HostCommand};
pub use protocol::tlv::{decode_tlv, TlvError, TlvMap};
