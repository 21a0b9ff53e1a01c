//! Card-data extraction and the payment-gateway hand-off payload.
//!
//! The reader wraps encrypted cardholder data in vendor-specific TLV tags.
//! [`extract_card_data`] decodes a frame, picks out the four tags the gateway
//! needs, and returns a [`CardData`] record.  A frame that cannot be decoded
//! yields an *invalid* record rather than an error, because a parse failure
//! must never be mistaken for usable card data and must never abort event
//! processing.
//!
//! # Validity
//!
//! A record is valid **iff** both the KSN and the encrypted data are
//! non-empty.  The device serial number and card type are informational.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::tlv::{decode_tlv, TlvError, TlvMap};

/// Vendor tag identifiers for the fields the gateway consumes.
pub mod tags {
    /// Key serial number of the encryption key used for the data blob.
    pub const KSN: &[u8] = &[0xDF, 0xDF, 0x56];
    /// Encrypted track / EMV data.
    pub const ENCRYPTED_DATA: &[u8] = &[0xDF, 0xDF, 0x59];
    /// Card type / brand code.
    pub const CARD_TYPE: &[u8] = &[0xDF, 0xDF, 0x52];
    /// Reader (IFD) serial number.
    pub const DEVICE_SERIAL_NUMBER: &[u8] = &[0xDF, 0xDF, 0x25];
}

/// Error raised when a gateway payload cannot be used.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// A field the gateway requires is empty.
    #[error("gateway payload unusable: {field} is empty")]
    MissingField { field: &'static str },

    /// JSON (de)serialization failed.
    #[error("gateway payload JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the card was presented, derived from the card-type code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardKind {
    Swipe,
    Contact,
    Contactless,
    /// Code not known to this crate; carried through verbatim.
    Unknown(String),
}

/// Decoded result of a card-data or authorization-request frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardData {
    /// Key serial number, upper-case hex.
    pub ksn: String,
    /// Reader serial number as reported in the frame (ASCII when printable,
    /// hex otherwise).
    pub device_serial_number: String,
    /// Encrypted track / EMV data blob, upper-case hex.
    pub encrypted_data: String,
    /// Card type / brand code, upper-case hex.  Unknown codes pass through.
    pub card_type: String,
    /// Original frame, kept for diagnostics only.
    #[serde(skip)]
    pub raw_frame: Vec<u8>,
}

impl CardData {
    /// Builds a record from an already decoded tag map.
    pub fn from_tlv(map: &TlvMap, raw_frame: &[u8]) -> Self {
        Self {
            ksn: map.get_hex(tags::KSN).unwrap_or_default(),
            device_serial_number: map
                .get(tags::DEVICE_SERIAL_NUMBER)
                .map(render_serial)
                .unwrap_or_default(),
            encrypted_data: map.get_hex(tags::ENCRYPTED_DATA).unwrap_or_default(),
            card_type: map.get_hex(tags::CARD_TYPE).unwrap_or_default(),
            raw_frame: raw_frame.to_vec(),
        }
    }

    /// `true` iff both the KSN and the encrypted data are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.ksn.is_empty() && !self.encrypted_data.is_empty()
    }

    /// Classifies the card-type code.
    pub fn card_kind(&self) -> CardKind {
        match self.card_type.as_str() {
            "01" => CardKind::Swipe,
            "02" => CardKind::Contact,
            "03" => CardKind::Contactless,
            other => CardKind::Unknown(other.to_string()),
        }
    }

    /// Builds the JSON-shaped object handed to the payment gateway.
    pub fn to_gateway_payload(&self) -> GatewayPayload {
        GatewayPayload {
            transaction_output: TransactionOutput {
                ksn: self.ksn.clone(),
                device_serial_number: self.device_serial_number.clone(),
                emv_sred_data: self.encrypted_data.clone(),
                card_type: self.card_type.clone(),
            },
        }
    }
}

/// Top-level gateway payload: `{"TransactionOutput": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayload {
    #[serde(rename = "TransactionOutput")]
    pub transaction_output: TransactionOutput,
}

/// Field set consumed by the payment gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    #[serde(rename = "KSN", default)]
    pub ksn: String,
    #[serde(rename = "DeviceSerialNumber", default)]
    pub device_serial_number: String,
    #[serde(rename = "EMVSREDData", default)]
    pub emv_sred_data: String,
    #[serde(rename = "CardType", default)]
    pub card_type: String,
}

impl GatewayPayload {
    /// Rejects the payload when KSN or EMVSREDData is empty.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::MissingField`] naming the first empty field.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let out = &self.transaction_output;
        if out.ksn.is_empty() {
            return Err(PayloadError::MissingField { field: "KSN" });
        }
        if out.emv_sred_data.is_empty() {
            return Err(PayloadError::MissingField {
                field: "EMVSREDData",
            });
        }
        Ok(())
    }

    /// Serializes to the compact JSON string sent to the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a payload and validates it.
    ///
    /// Empty strings and missing fields are tolerated by the parser; the
    /// payload is then rejected by [`GatewayPayload::validate`] if KSN or
    /// EMVSREDData is empty.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] on malformed JSON or an unusable payload.
    pub fn from_json(json: &str) -> Result<Self, PayloadError> {
        let payload: GatewayPayload = serde_json::from_str(json)?;
        payload.validate()?;
        Ok(payload)
    }
}

// ── Extraction ────────────────────────────────────────────────────────────────

/// Decodes `frame` and extracts card data, propagating decode errors.
///
/// # Errors
///
/// Returns [`TlvError`] if the frame contains no decodable TLV node.
pub fn try_extract_card_data(frame: &[u8]) -> Result<CardData, TlvError> {
    let map = decode_tlv(frame)?;
    let card = CardData::from_tlv(&map, frame);
    debug!(
        "extracted card data: {} tags, ksn={}B, data={}B, card_type={:?}, valid={}",
        map.len(),
        card.ksn.len() / 2,
        card.encrypted_data.len() / 2,
        card.card_type,
        card.is_valid()
    );
    Ok(card)
}

/// Decodes `frame` and extracts card data.
///
/// Decode failures are logged and produce an invalid record that still carries
/// the raw frame.
pub fn extract_card_data(frame: &[u8]) -> CardData {
    try_extract_card_data(frame).unwrap_or_else(|e| {
        warn!("card frame could not be decoded ({e}); treating as no card data");
        CardData {
            raw_frame: frame.to_vec(),
            ..CardData::default()
        }
    })
}

/// Renders a serial-number value as text when it is printable ASCII.
fn render_serial(value: &[u8]) -> String {
    let trimmed: &[u8] = match value.iter().rposition(|&b| b != 0) {
        Some(last) => &value[..=last],
        None => &[],
    };
    if !trimmed.is_empty() && trimmed.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(trimmed).into_owned()
    } else {
        hex::encode_upper(value)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tlv::encode_tlv;

    fn frame(parts: &[(&[u8], &[u8])]) -> Vec<u8> {
        parts.iter().flat_map(|(t, v)| encode_tlv(t, v)).collect()
    }

    #[test]
    fn test_all_fields_present_is_valid() {
        // Arrange
        let bytes = frame(&[
            (tags::DEVICE_SERIAL_NUMBER, &b"B4B1234"[..]),
            (tags::KSN, &[0x95, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01][..]),
            (tags::ENCRYPTED_DATA, &[0xDE, 0xAD, 0xBE, 0xEF][..]),
            (tags::CARD_TYPE, &[0x03][..]),
        ]);

        // Act
        let card = extract_card_data(&bytes);

        // Assert
        assert!(card.is_valid());
        assert_eq!(card.ksn, "95000300000001");
        assert_eq!(card.encrypted_data, "DEADBEEF");
        assert_eq!(card.card_type, "03");
        assert_eq!(card.device_serial_number, "B4B1234");
        assert_eq!(card.card_kind(), CardKind::Contactless);
        assert_eq!(card.raw_frame, bytes);
    }

    #[test]
    fn test_missing_ksn_is_invalid() {
        let bytes = frame(&[(tags::ENCRYPTED_DATA, &[0x01][..]), (tags::CARD_TYPE, &[0x01][..])]);
        assert!(!extract_card_data(&bytes).is_valid());
    }

    #[test]
    fn test_missing_encrypted_data_is_invalid() {
        let bytes = frame(&[(tags::KSN, &[0x01][..]), (tags::DEVICE_SERIAL_NUMBER, &b"X"[..])]);
        assert!(!extract_card_data(&bytes).is_valid());
    }

    #[test]
    fn test_empty_values_are_invalid() {
        let bytes = frame(&[(tags::KSN, &b""[..]), (tags::ENCRYPTED_DATA, &b""[..])]);
        let card = extract_card_data(&bytes);
        assert!(!card.is_valid());
        assert!(card.ksn.is_empty());
    }

    #[test]
    fn test_card_type_only_frame_is_invalid() {
        let bytes = frame(&[(tags::CARD_TYPE, &[0x02][..])]);
        let card = extract_card_data(&bytes);
        assert!(!card.is_valid());
        assert_eq!(card.card_type, "02");
    }

    #[test]
    fn test_undecodable_frame_downgrades_to_invalid_record() {
        let card = extract_card_data(&[0xDF]);
        assert!(!card.is_valid());
        assert_eq!(card.raw_frame, vec![0xDF]);
    }

    #[test]
    fn test_unknown_card_type_passes_through() {
        let card = CardData {
            card_type: "7E".to_string(),
            ..CardData::default()
        };
        assert_eq!(card.card_kind(), CardKind::Unknown("7E".to_string()));
    }

    #[test]
    fn test_binary_serial_is_rendered_as_hex() {
        assert_eq!(render_serial(&[0x01, 0xFF]), "01FF");
        assert_eq!(render_serial(b"ABC\0\0"), "ABC");
    }

    #[test]
    fn test_gateway_payload_json_shape() {
        // Arrange
        let card = CardData {
            ksn: "AA".into(),
            device_serial_number: "SN1".into(),
            encrypted_data: "BB".into(),
            card_type: "01".into(),
            raw_frame: vec![1, 2, 3],
        };

        // Act
        let json = card.to_gateway_payload().to_json().unwrap();

        // Assert
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "TransactionOutput": {
                    "KSN": "AA",
                    "DeviceSerialNumber": "SN1",
                    "EMVSREDData": "BB",
                    "CardType": "01"
                }
            })
        );
    }

    #[test]
    fn test_gateway_payload_tolerates_empty_optional_fields() {
        let json = r#"{"TransactionOutput":{"KSN":"AA","DeviceSerialNumber":"","EMVSREDData":"BB","CardType":""}}"#;
        let payload = GatewayPayload::from_json(json).unwrap();
        assert_eq!(payload.transaction_output.card_type, "");
    }

    #[test]
    fn test_gateway_payload_rejects_empty_ksn() {
        let json = r#"{"TransactionOutput":{"KSN":"","EMVSREDData":"BB"}}"#;
        let err = GatewayPayload::from_json(json).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField { field: "KSN" }));
    }

    #[test]
    fn test_gateway_payload_rejects_empty_emv_sred_data() {
        let payload = CardData {
            ksn: "AA".into(),
            ..CardData::default()
        }
        .to_gateway_payload();
        assert!(matches!(
            payload.validate(),
            Err(PayloadError::MissingField { field: "EMVSREDData" })
        ));
    }
}
