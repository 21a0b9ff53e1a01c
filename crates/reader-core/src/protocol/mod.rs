//! Protocol module containing the TLV decoder, card-data extractor, message
//! types, the binary codec, and HID report framing.

pub mod card_data;
pub mod codec;
pub mod messages;
pub mod packet;
pub mod tlv;

pub use card_data::{extract_card_data, CardData, GatewayPayload};
pub use codec::{decode_command, decode_device_message, encode_command, encode_device_message, ProtocolError};
pub use messages::*;
pub use packet::{encode_reports, ReportAssembler};
pub use tlv::{decode_nodes, decode_tlv, encode_tlv, TlvError, TlvMap, TlvNode};
