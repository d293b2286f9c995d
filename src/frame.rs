// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Wire framing.
//!
//! ```text
//! SYNC(1) | TYPE(2, BE) | LEN(2, BE) | PAYLOAD(LEN) | CRC32(4, BE)
//! ```
//!
//! The CRC covers the payload only. A reader that loses alignment scans
//! forward byte-by-byte for the next `SYNC`.

use std::io;
use std::time::Duration;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;
use tracing::{trace, warn};
use crate::protocol::{PacketType, SYNC};
use crate::serial::{read_up_to, SerialPort};

/// Type and length fields
pub const HEADER_LEN: usize = 4;

/// CRC-32 trailer
pub const CHECKSUM_LEN: usize = 4;

/// Largest frame the length field can describe
pub const MAX_FRAME_LEN: usize = 1 + HEADER_LEN + u16::MAX as usize + CHECKSUM_LEN;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit the 16-bit length field")]
    PayloadTooLarge(usize),
}

/// A frame that passed the checksum and carries a known packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

/// Result of one attempt to pull a frame off the line.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Nothing arrived before the timeout
    Empty,
    /// Something arrived but failed validation; nothing in it may be trusted
    Corrupted,
    Frame(Frame),
}

pub fn checksum(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

pub fn encode(packet_type: PacketType, payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let mut buf = BytesMut::with_capacity(1 + HEADER_LEN + payload.len() + CHECKSUM_LEN);
    buf.put_u8(SYNC);
    buf.put_u16(packet_type.into());
    buf.put_u16(len);
    buf.put_slice(payload);
    buf.put_u32(checksum(payload));
    Ok(buf.freeze())
}

/// Read one frame, waiting at most `timeout` for each part of it.
///
/// Silence before or inside the header is `Empty`; a frame cut off after the
/// header is `Corrupted`. Only a failing link is an `Err`.
pub fn decode<P: SerialPort + ?Sized>(port: &mut P, timeout: Duration) -> io::Result<DecodeOutcome> {
    match scan_for_sync(port, timeout)? {
        Scan::Found => {}
        Scan::Silent => return Ok(DecodeOutcome::Empty),
        Scan::Noise => return Ok(DecodeOutcome::Corrupted),
    }

    let mut header = [0u8; HEADER_LEN];
    if read_up_to(port, &mut header, timeout)? < HEADER_LEN {
        return Ok(DecodeOutcome::Empty);
    }
    let mut fields = &header[..];
    let raw_type = fields.get_u16();
    let len = fields.get_u16() as usize;

    let mut body = vec![0u8; len + CHECKSUM_LEN];
    let got = read_up_to(port, &mut body, timeout)?;
    if got < body.len() {
        warn!(packet_type = raw_type, expected = body.len(), got, "truncated frame");
        return Ok(DecodeOutcome::Corrupted);
    }

    let received = (&body[len..]).get_u32();
    body.truncate(len);
    let computed = checksum(&body);
    if computed != received {
        warn!(
            packet_type = raw_type,
            received = format_args!("{:08X}", received),
            computed = format_args!("{:08X}", computed),
            "checksum mismatch"
        );
        return Ok(DecodeOutcome::Corrupted);
    }

    match PacketType::try_from(raw_type) {
        Ok(packet_type) => {
            trace!(?packet_type, len, "frame decoded");
            Ok(DecodeOutcome::Frame(Frame { packet_type, payload: body }))
        }
        Err(_) => {
            warn!(packet_type = raw_type, "unknown packet type");
            Ok(DecodeOutcome::Corrupted)
        }
    }
}

enum Scan {
    Found,
    Silent,
    Noise,
}

fn scan_for_sync<P: SerialPort + ?Sized>(port: &mut P, timeout: Duration) -> io::Result<Scan> {
    let mut skipped = 0usize;
    let mut byte = [0u8; 1];

    loop {
        if read_up_to(port, &mut byte, timeout)? == 0 {
            if skipped > 0 {
                trace!(skipped, "line went quiet while resynchronizing");
            }
            return Ok(Scan::Silent);
        }
        if byte[0] == SYNC {
            if skipped > 0 {
                warn!(skipped, "resynchronized after discarding bytes");
            }
            return Ok(Scan::Found);
        }
        skipped += 1;
        // A line that never goes quiet and never carries a frame is noise
        if skipped >= MAX_FRAME_LEN {
            warn!(skipped, "no sync byte found");
            return Ok(Scan::Noise);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
