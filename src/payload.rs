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

//! Typed packets and their payload encoding.
//!
//! Params travel as a JSON object, Data as a JSON string holding the base64
//! of the chunk, and every control packet carries an empty payload.

use std::io;
use std::time::Duration;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use thiserror::Error;
use tracing::{trace, warn};
use crate::frame::{self, DecodeOutcome, FrameError};
use crate::protocol::{ConnectionParams, PacketType, ParamsError};
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum PayloadDecodeError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid connection parameters: {0}")]
    InvalidParams(#[from] ParamsError),

    #[error("{packet_type:?} packet carries {len} unexpected payload bytes")]
    UnexpectedPayload { packet_type: PacketType, len: usize },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Packets
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Handshake,
    Params(ConnectionParams),
    Data(Vec<u8>),
    Eof,
    Ack,
    Nak,
    Reset,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Handshake => PacketType::Handshake,
            Packet::Params(_) => PacketType::Params,
            Packet::Data(_) => PacketType::Data,
            Packet::Eof => PacketType::Eof,
            Packet::Ack => PacketType::Ack,
            Packet::Nak => PacketType::Nak,
            Packet::Reset => PacketType::Reset,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Packet::Params(params) => serde_json::to_vec(params),
            Packet::Data(chunk) => serde_json::to_vec(&BASE64.encode(chunk)),
            _ => Ok(Vec::new()),
        }
    }

    pub fn decode(packet_type: PacketType, payload: &[u8]) -> Result<Self, PayloadDecodeError> {
        match packet_type {
            PacketType::Params => {
                let params: ConnectionParams = serde_json::from_slice(payload)?;
                params.validate()?;
                Ok(Packet::Params(params))
            }
            PacketType::Data => {
                let text: String = serde_json::from_slice(payload)?;
                Ok(Packet::Data(BASE64.decode(text)?))
            }
            control => {
                if !payload.is_empty() {
                    return Err(PayloadDecodeError::UnexpectedPayload {
                        packet_type: control,
                        len: payload.len(),
                    });
                }
                Ok(match control {
                    PacketType::Handshake => Packet::Handshake,
                    PacketType::Eof => Packet::Eof,
                    PacketType::Ack => Packet::Ack,
                    PacketType::Nak => Packet::Nak,
                    _ => Packet::Reset,
                })
            }
        }
    }

    /// Complete wire frame for this packet, ready to write
    pub fn to_frame(&self) -> Result<Bytes, EncodeError> {
        let payload = self.encode_payload()?;
        Ok(frame::encode(self.packet_type(), &payload)?)
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Result of one attempt to read a packet; payload errors count as corruption.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    Empty,
    Corrupted,
    Packet(Packet),
}

pub fn read_packet<P: SerialPort + ?Sized>(port: &mut P, timeout: Duration) -> io::Result<ReadOutcome> {
    let frame = match frame::decode(port, timeout)? {
        DecodeOutcome::Empty => return Ok(ReadOutcome::Empty),
        DecodeOutcome::Corrupted => return Ok(ReadOutcome::Corrupted),
        DecodeOutcome::Frame(frame) => frame,
    };

    match Packet::decode(frame.packet_type, &frame.payload) {
        Ok(packet) => {
            trace!(packet_type = ?frame.packet_type, "packet received");
            Ok(ReadOutcome::Packet(packet))
        }
        Err(e) => {
            warn!(packet_type = ?frame.packet_type, error = %e, "undecodable payload");
            Ok(ReadOutcome::Corrupted)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
