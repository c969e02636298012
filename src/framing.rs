//! Record framing for security tokens.
//!
//! Every token exchanged during the handshake and every protected message is one record: a
//! 5-byte header followed by a body. When the first header byte is `0x80` (a legacy
//! SSLv2-style hello) the body length is byte 1 minus the 3 header bytes that do not belong to
//! the record; otherwise it is the big-endian `u16` at bytes 3 and 4. The token passed to the
//! mechanism is the whole record, header included.

use crate::observability::log_token;
use crate::transport::Transport;
use std::collections::TryReserveError;
use std::io;

/// Length of the record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest body a standard header can announce.
pub const MAX_RECORD_BODY_LEN: usize = u16::MAX as usize;

const LEGACY_HELLO: u8 = 0x80;
const LEGACY_CONSUMED: u8 = 3;
const PROTOCOL_VERSION: [u8; 2] = [0x03, 0x01];

/// Part of a record being transferred when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPart {
    /// The 5-byte header.
    Header,
    /// The body announced by the header.
    Body,
}

impl std::fmt::Display for RecordPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordPart::Header => f.write_str("header"),
            RecordPart::Body => f.write_str("body"),
        }
    }
}

/// Errors moving a record over the transport.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FramingError {
    /// The peer closed the stream before the record was complete.
    #[error("connection closed while reading the token {part} ({received} bytes received)")]
    ConnectionClosed {
        /// Part being read.
        part: RecordPart,
        /// Bytes of the record received before the stream closed.
        received: usize,
    },

    /// The transport failed while reading.
    #[error("error reading the token {part}: {source}")]
    Read {
        /// Part being read.
        part: RecordPart,
        /// Bytes of the record received before the failure.
        received: usize,
        /// Transport error.
        source: io::Error,
    },

    /// The transport failed while writing.
    #[error("error sending token: {0}")]
    Write(#[source] io::Error),

    /// The transport accepted only part of the record.
    #[error("sent {written} bytes instead of {expected}")]
    ShortWrite {
        /// Bytes accepted.
        written: usize,
        /// Record length.
        expected: usize,
    },

    /// A legacy header announced a length shorter than the bytes already consumed.
    #[error("malformed legacy record header (length byte {0:#04x})")]
    MalformedHeader(u8),

    /// The record buffer could not be allocated.
    #[error("could not allocate the token buffer: {0}")]
    Allocation(#[from] TryReserveError),

    /// A record body does not fit in a standard header.
    #[error("record body of {0} bytes does not fit in a record header")]
    RecordTooLarge(usize),
}

impl FramingError {
    /// Returns `true` if the failure happened before any byte of the record arrived.
    pub fn nothing_received(&self) -> bool {
        matches!(
            self,
            FramingError::ConnectionClosed { received: 0, .. }
                | FramingError::Read { received: 0, .. }
        )
    }
}

/// Returns the body length announced by a record header.
pub fn body_len(header: &[u8; RECORD_HEADER_LEN]) -> Result<usize, FramingError> {
    if header[0] == LEGACY_HELLO {
        let announced = header[1];
        if announced < LEGACY_CONSUMED {
            return Err(FramingError::MalformedHeader(announced));
        }
        Ok(usize::from(announced - LEGACY_CONSUMED))
    } else {
        Ok(usize::from(u16::from_be_bytes([header[3], header[4]])))
    }
}

/// Builds a standard record around `body`.
pub fn encode_record(content_type: u8, body: &[u8]) -> Result<Vec<u8>, FramingError> {
    let len = u16::try_from(body.len()).map_err(|_| FramingError::RecordTooLarge(body.len()))?;
    let mut record = Vec::new();
    record.try_reserve_exact(RECORD_HEADER_LEN + body.len())?;
    record.push(content_type);
    record.extend_from_slice(&PROTOCOL_VERSION);
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(body);
    Ok(record)
}

/// Reads one complete record, header included.
pub fn read_token<T: Transport + ?Sized>(transport: &mut T) -> Result<Vec<u8>, FramingError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    fill(transport, &mut header, RecordPart::Header, 0)?;

    let len = body_len(&header)?;
    let mut token = Vec::new();
    token.try_reserve_exact(RECORD_HEADER_LEN + len)?;
    token.extend_from_slice(&header);
    token.resize(RECORD_HEADER_LEN + len, 0);
    fill(
        transport,
        &mut token[RECORD_HEADER_LEN..],
        RecordPart::Body,
        RECORD_HEADER_LEN,
    )?;

    log_token!(received, token.len());
    Ok(token)
}

/// Writes one record in a single transport call.
pub fn write_token<T: Transport + ?Sized>(
    transport: &mut T,
    token: &[u8],
) -> Result<(), FramingError> {
    log_token!(sent, token.len());
    let written = transport.send(token).map_err(FramingError::Write)?;
    if written != token.len() {
        return Err(FramingError::ShortWrite {
            written,
            expected: token.len(),
        });
    }
    Ok(())
}

fn fill<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    part: RecordPart,
    already: usize,
) -> Result<(), FramingError> {
    let mut filled = 0;
    while filled < buf.len() {
        match transport.recv(&mut buf[filled..]) {
            Ok(0) => {
                return Err(FramingError::ConnectionClosed {
                    part,
                    received: already + filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(FramingError::Read {
                    part,
                    received: already + filled,
                    source,
                })
            }
        }
    }
    Ok(())
}
