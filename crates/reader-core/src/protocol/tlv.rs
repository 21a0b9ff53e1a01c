//! BER-TLV decoding and encoding for reader frames.
//!
//! Wire format of one node:
//! ```text
//! [tag:1..n][length:1..5][value:length]
//! ```
//!
//! # How BER-TLV works (for beginners)
//!
//! Every data element is a *tag* (what it is), a *length* (how many bytes
//! follow), and a *value*.  Tags and lengths are themselves variable-length:
//!
//! - **Tag**: if the low 5 bits of the first byte are all set (`0x1F`), the
//!   tag continues into the next byte, and keeps continuing while the high
//!   bit (`0x80`) of each continuation byte is set.  `DF DF 59` is a
//!   three-byte tag; `9C` is a one-byte tag.
//! - **Length**: a byte below `0x80` is the length itself.  Otherwise the
//!   low 7 bits say how many big-endian length bytes follow (`82 01 2C` is
//!   300).
//! - **Constructed flag**: bit 6 (`0x20`) of the first tag byte marks a
//!   *constructed* node whose value is a sequence of further TLV nodes.
//!
//! # Reader-specific constructed-tag behaviour
//!
//! The reader firmware's own parser does not skip over a constructed node's
//! declared length.  It records the constructed tag with an empty value and
//! keeps decoding *inside* it, so nested tags show up as siblings in the flat
//! result.  This decoder does exactly the same.  Skipping by length (as a
//! textbook parser would) hides every tag inside the `FA`/`F9`/`70`
//! containers, which is where the encrypted card data lives.
//!
//! # Envelope
//!
//! Frames may start with a 2-byte big-endian length that is not a tag.  It is
//! stripped when it matches the rest of the buffer (optionally followed by
//! zero padding); otherwise the buffer is decoded as-is.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

/// Bit 6 of the first tag byte: set for constructed nodes.
pub const CONSTRUCTED_BIT: u8 = 0x20;

/// Low 5 bits of the first tag byte: all set for multi-byte tags.
const MULTI_BYTE_TAG_MASK: u8 = 0x1F;

/// Largest supported count of long-form length bytes.
const MAX_LENGTH_BYTES: usize = 4;

/// Errors produced when a buffer holds no usable TLV data.
///
/// Truncated trailing nodes are *not* errors: they are dropped and decoding
/// stops cleanly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    /// The input buffer was empty.
    #[error("empty TLV buffer")]
    Empty,

    /// The buffer was non-empty but not a single complete node could be read.
    #[error("no complete TLV node in {length}-byte buffer")]
    NoTags { length: usize },
}

/// One decoded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    /// Raw tag bytes (1 or more).
    pub tag: Vec<u8>,
    /// `true` when bit 6 of the first tag byte is set.
    pub constructed: bool,
    /// Value bytes; always empty for constructed nodes.
    pub value: Vec<u8>,
}

impl TlvNode {
    /// Tag rendered as upper-case hex (e.g. `"DFDF59"`).
    pub fn tag_hex(&self) -> String {
        hex::encode_upper(&self.tag)
    }
}

/// Flat tag → value mapping produced by [`decode_tlv`].
///
/// When a tag occurs more than once the first occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvMap {
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl TlvMap {
    /// Returns the value stored for `tag`, if present.
    pub fn get(&self, tag: &[u8]) -> Option<&[u8]> {
        self.entries.get(tag).map(Vec::as_slice)
    }

    /// Returns the value for `tag` as upper-case hex, if present.
    pub fn get_hex(&self, tag: &[u8]) -> Option<String> {
        self.get(tag).map(hex::encode_upper)
    }

    pub fn contains(&self, tag: &[u8]) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all `(tag, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(t, v)| (t.as_slice(), v.as_slice()))
    }

    fn insert_first(&mut self, node: TlvNode) {
        self.entries.entry(node.tag).or_insert(node.value);
    }
}

impl FromIterator<TlvNode> for TlvMap {
    fn from_iter<I: IntoIterator<Item = TlvNode>>(iter: I) -> Self {
        let mut map = TlvMap::default();
        for node in iter {
            map.insert_first(node);
        }
        map
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes `bytes` into a flat tag → value map.
///
/// # Errors
///
/// Returns [`TlvError::Empty`] for an empty buffer and [`TlvError::NoTags`]
/// when no complete node could be read.
///
/// # Examples
///
/// ```rust
/// use reader_core::protocol::tlv::decode_tlv;
///
/// // FA (constructed) wrapping DFDF59 = AB CD
/// let frame = [0xFA, 0x06, 0xDF, 0xDF, 0x59, 0x02, 0xAB, 0xCD];
/// let map = decode_tlv(&frame).unwrap();
/// assert_eq!(map.get(&[0xDF, 0xDF, 0x59]), Some(&[0xAB, 0xCD][..]));
/// assert_eq!(map.get(&[0xFA]), Some(&[][..]));
/// ```
pub fn decode_tlv(bytes: &[u8]) -> Result<TlvMap, TlvError> {
    if bytes.is_empty() {
        return Err(TlvError::Empty);
    }
    let nodes = decode_nodes(bytes);
    if nodes.is_empty() {
        return Err(TlvError::NoTags {
            length: bytes.len(),
        });
    }
    Ok(nodes.into_iter().collect())
}

/// Decodes `bytes` into an ordered list of nodes, constructed placeholders
/// included.
///
/// Never fails: decoding stops at the first node that cannot be completed.
pub fn decode_nodes(bytes: &[u8]) -> Vec<TlvNode> {
    let body = strip_length_prefix(bytes);
    let mut nodes = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        // 0x00 may appear as inter-node padding.
        if body[pos] == 0x00 {
            pos += 1;
            continue;
        }

        let Some((tag, after_tag)) = read_tag(body, pos) else {
            debug!("TLV: truncated tag at offset {pos}; dropping tail");
            break;
        };
        let Some((len, after_len)) = read_length(body, after_tag) else {
            debug!("TLV: unreadable length for tag {} at offset {after_tag}", hex::encode_upper(&tag));
            break;
        };

        if tag[0] & CONSTRUCTED_BIT != 0 {
            // Descend: the next node starts where this one's value would.
            nodes.push(TlvNode {
                tag,
                constructed: true,
                value: Vec::new(),
            });
            pos = after_len;
        } else {
            let end = match after_len.checked_add(len) {
                Some(end) if end <= body.len() => end,
                _ => {
                    debug!(
                        "TLV: tag {} declares {len} bytes but only {} remain; dropping tail",
                        hex::encode_upper(&tag),
                        body.len() - after_len
                    );
                    break;
                }
            };
            nodes.push(TlvNode {
                tag,
                constructed: false,
                value: body[after_len..end].to_vec(),
            });
            pos = end;
        }
    }

    nodes
}

/// Removes the optional 2-byte big-endian length envelope.
///
/// The envelope is recognised only when its value equals the number of bytes
/// that follow it, or when everything past the declared length is zero
/// padding.
pub fn strip_length_prefix(bytes: &[u8]) -> &[u8] {
    if bytes.len() < 2 {
        return bytes;
    }
    let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let rest = &bytes[2..];
    if declared == 0 || declared > rest.len() {
        return bytes;
    }
    if declared == rest.len() || rest[declared..].iter().all(|&b| b == 0x00) {
        &rest[..declared]
    } else {
        bytes
    }
}

/// Encodes one primitive or constructed node with the minimal length form.
///
/// For a constructed tag pass the already-encoded children as `value`.
pub fn encode_tlv(tag: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tag.len() + 5 + value.len());
    buf.extend_from_slice(tag);
    write_length(&mut buf, value.len());
    buf.extend_from_slice(value);
    buf
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Reads a tag starting at `pos`; returns the tag bytes and the next offset.
fn read_tag(buf: &[u8], pos: usize) -> Option<(Vec<u8>, usize)> {
    let first = *buf.get(pos)?;
    let mut tag = vec![first];
    let mut i = pos + 1;

    if first & MULTI_BYTE_TAG_MASK == MULTI_BYTE_TAG_MASK {
        loop {
            let b = *buf.get(i)?;
            tag.push(b);
            i += 1;
            if b & 0x80 == 0 {
                break;
            }
        }
    }
    Some((tag, i))
}

/// Reads a short- or long-form length at `pos`; returns it and the next offset.
fn read_length(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *buf.get(pos)?;
    if first & 0x80 == 0 {
        return Some((first as usize, pos + 1));
    }

    let count = (first & 0x7F) as usize;
    // 0x80 (indefinite form) is not used by the reader.
    if count == 0 || count > MAX_LENGTH_BYTES {
        return None;
    }
    let bytes = buf.get(pos + 1..pos + 1 + count)?;
    let len = bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Some((len, pos + 1 + count))
}

fn write_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
        return;
    }
    let be = (len as u32).to_be_bytes();
    let skip = be.iter().take_while(|&&b| b == 0).count();
    buf.push(0x80 | (be.len() - skip) as u8);
    buf.extend_from_slice(&be[skip..]);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
