//! Splitting messages into fixed-size HID reports and reassembling them.
//!
//! A USB HID reader moves data in reports of a fixed size (64 bytes by
//! default).  Messages longer than one report are sent as a *head* packet
//! carrying the total length, zero or more *middle* packets, and usually a
//! *tail* packet carrying the remainder.
//!
//! ```text
//! single  [0x00][len:1][payload][zero padding]
//! head    [0x01][total:4 BE][payload ...]
//! middle  [0x02][seq:2 BE][payload ...]
//! tail    [0x03][seq:2 BE][len:1][payload][zero padding]
//! cancel  [0x04]
//! ```
//!
//! Sequence numbers start at 1 after a head packet.  A message is complete as
//! soon as the collected payload reaches the declared total, which may happen
//! on a middle packet.

use tracing::{debug, warn};

use crate::protocol::codec::ProtocolError;

/// Default HID report size in bytes.
pub const DEFAULT_REPORT_SIZE: usize = 64;
/// Smallest supported report size.
pub const MIN_REPORT_SIZE: usize = 8;
/// Largest supported report size.
pub const MAX_REPORT_SIZE: usize = 256;

/// Packet-type byte at the start of every report.
pub mod packet_type {
    pub const SINGLE: u8 = 0x00;
    pub const HEAD: u8 = 0x01;
    pub const MIDDLE: u8 = 0x02;
    pub const TAIL: u8 = 0x03;
    pub const CANCEL: u8 = 0x04;
}

const SINGLE_HEADER: usize = 2;
const HEAD_HEADER: usize = 5;
const MIDDLE_HEADER: usize = 3;
const TAIL_HEADER: usize = 4;

/// Checks `report_size` against the supported range.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidReportSize`] outside
/// `MIN_REPORT_SIZE..=MAX_REPORT_SIZE`.
pub fn validate_report_size(report_size: usize) -> Result<(), ProtocolError> {
    if (MIN_REPORT_SIZE..=MAX_REPORT_SIZE).contains(&report_size) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidReportSize(report_size))
    }
}

/// Splits `message` into zero-padded reports of exactly `report_size` bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidReportSize`] for an unsupported report
/// size, or [`ProtocolError::MalformedPayload`] for a message whose length
/// does not fit the 4-byte total field.
pub fn encode_reports(message: &[u8], report_size: usize) -> Result<Vec<Vec<u8>>, ProtocolError> {
    validate_report_size(report_size)?;

    if message.len() <= report_size - SINGLE_HEADER {
        let mut report = vec![0u8; report_size];
        report[0] = packet_type::SINGLE;
        report[1] = message.len() as u8;
        report[SINGLE_HEADER..SINGLE_HEADER + message.len()].copy_from_slice(message);
        return Ok(vec![report]);
    }

    let total = u32::try_from(message.len()).map_err(|_| {
        ProtocolError::MalformedPayload(format!("message of {} bytes is too long", message.len()))
    })?;

    let mut reports = Vec::new();

    let head_cap = report_size - HEAD_HEADER;
    let mut report = vec![0u8; report_size];
    report[0] = packet_type::HEAD;
    report[1..HEAD_HEADER].copy_from_slice(&total.to_be_bytes());
    report[HEAD_HEADER..].copy_from_slice(&message[..head_cap]);
    reports.push(report);

    let middle_cap = report_size - MIDDLE_HEADER;
    let tail_cap = report_size - TAIL_HEADER;
    let mut rest = &message[head_cap..];
    let mut seq: u16 = 1;

    while !rest.is_empty() {
        let mut report = vec![0u8; report_size];
        report[1..3].copy_from_slice(&seq.to_be_bytes());
        if rest.len() <= tail_cap {
            report[0] = packet_type::TAIL;
            report[3] = rest.len() as u8;
            report[TAIL_HEADER..TAIL_HEADER + rest.len()].copy_from_slice(rest);
            rest = &[];
        } else {
            let take = rest.len().min(middle_cap);
            report[0] = packet_type::MIDDLE;
            report[MIDDLE_HEADER..MIDDLE_HEADER + take].copy_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        reports.push(report);
        seq = seq.wrapping_add(1);
    }

    Ok(reports)
}

// ── Reassembly ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Partial {
    total: usize,
    next_seq: u16,
    buf: Vec<u8>,
}

impl Partial {
    fn remaining(&self) -> usize {
        self.total - self.buf.len()
    }
}

/// Reassembles messages from inbound HID reports.
///
/// Any framing error discards the partial message; the next head or single
/// packet starts afresh.
#[derive(Debug, Default)]
pub struct ReportAssembler {
    partial: Option<Partial>,
}

impl ReportAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while a multi-report message is being collected.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Drops any partial message.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feeds one report.  Returns the message when it is complete.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for an unknown packet type, a sequence gap, a
    /// continuation with no head, an overflow of the declared total, or a
    /// truncated header.  The partial message is discarded in every case.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let result = self.push_inner(report);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn push_inner(&mut self, report: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let Some(&kind) = report.first() else {
            return Err(ProtocolError::InsufficientData {
                needed: 1,
                available: 0,
            });
        };

        match kind {
            packet_type::SINGLE => {
                require(report, SINGLE_HEADER)?;
                let len = report[1] as usize;
                if len > report.len() - SINGLE_HEADER {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "single packet declares {len} bytes in a {}-byte report",
                        report.len()
                    )));
                }
                if self.partial.take().is_some() {
                    warn!("single packet interrupted a multi-report message; partial dropped");
                }
                Ok(Some(report[SINGLE_HEADER..SINGLE_HEADER + len].to_vec()))
            }
            packet_type::HEAD => {
                require(report, HEAD_HEADER)?;
                let total = u32::from_be_bytes([report[1], report[2], report[3], report[4]]) as usize;
                if total == 0 {
                    return Err(ProtocolError::MalformedPayload(
                        "head packet declares an empty message".to_string(),
                    ));
                }
                if self.partial.take().is_some() {
                    warn!("head packet interrupted a multi-report message; partial dropped");
                }
                let body = &report[HEAD_HEADER..];
                let take = body.len().min(total);
                let partial = Partial {
                    total,
                    next_seq: 1,
                    buf: body[..take].to_vec(),
                };
                Ok(self.finish_or_keep(partial))
            }
            packet_type::MIDDLE => {
                require(report, MIDDLE_HEADER)?;
                let mut partial = self.continuation(kind, report)?;
                let body = &report[MIDDLE_HEADER..];
                let take = body.len().min(partial.remaining());
                partial.buf.extend_from_slice(&body[..take]);
                Ok(self.finish_or_keep(partial))
            }
            packet_type::TAIL => {
                require(report, TAIL_HEADER)?;
                let mut partial = self.continuation(kind, report)?;
                let len = report[3] as usize;
                if len > report.len() - TAIL_HEADER {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "tail packet declares {len} bytes in a {}-byte report",
                        report.len()
                    )));
                }
                let received = partial.buf.len() + len;
                if received > partial.total {
                    return Err(ProtocolError::LengthOverflow {
                        declared: partial.total,
                        received,
                    });
                }
                partial
                    .buf
                    .extend_from_slice(&report[TAIL_HEADER..TAIL_HEADER + len]);
                if partial.buf.len() < partial.total {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "tail packet ended message at {} of {} bytes",
                        partial.buf.len(),
                        partial.total
                    )));
                }
                Ok(Some(partial.buf))
            }
            packet_type::CANCEL => {
                if self.partial.take().is_some() {
                    debug!("reader cancelled a multi-report message");
                }
                Ok(None)
            }
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }

    /// Takes the partial message and checks the continuation's sequence number.
    fn continuation(&mut self, kind: u8, report: &[u8]) -> Result<Partial, ProtocolError> {
        let mut partial = self
            .partial
            .take()
            .ok_or(ProtocolError::UnexpectedContinuation(kind))?;
        let seq = u16::from_be_bytes([report[1], report[2]]);
        if seq != partial.next_seq {
            return Err(ProtocolError::SequenceGap {
                expected: partial.next_seq,
                got: seq,
            });
        }
        partial.next_seq = partial.next_seq.wrapping_add(1);
        Ok(partial)
    }

    fn finish_or_keep(&mut self, partial: Partial) -> Option<Vec<u8>> {
        if partial.remaining() == 0 {
            Some(partial.buf)
        } else {
            self.partial = Some(partial);
            None
        }
    }
}

fn require(report: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if report.len() < needed {
        Err(ProtocolError::InsufficientData {
            needed,
            available: report.len(),
        })
    } else {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
