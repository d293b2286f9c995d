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

//! Serlink protocol constants and negotiated connection parameters

use std::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Start of heading - precedes every frame on the wire
pub const SYNC: u8 = 0x01;

/// Largest chunk whose Data payload (a quoted base64 string) still fits the
/// 16-bit frame length field
pub const MAX_CHUNK_SIZE: u32 = ((u16::MAX as u32 - 2) / 4) * 3;

// ============================================================================
// Packet Types
// ============================================================================

/// Frame type tag, carried big-endian in the two bytes after `SYNC`.
///
/// Value 5 is reserved and decodes as unknown.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    /// Sender opens a session, receiver echoes it back
    Handshake = 0,
    /// One chunk of file content
    Data = 1,
    /// Sender signals the last chunk has been acknowledged
    Eof = 2,
    /// Receiver accepted the last packet
    Ack = 3,
    /// Receiver rejected the last packet, retransmit
    Nak = 4,
    /// Sender proposes connection parameters
    Params = 6,
    /// Abandon any session in progress and discard the partial file
    Reset = 7,
}

// ============================================================================
// Connection Parameters
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    #[error("read timeout must be a finite, non-negative number of seconds (got {0})")]
    ReadTimeout(f64),
    #[error("max retries must be at least 1")]
    MaxRetries,
    #[error("chunk size must be between 1 and {max} bytes (got {0})", max = MAX_CHUNK_SIZE)]
    ChunkSize(u32),
}

/// Session configuration proposed by the sender and adopted by the receiver.
///
/// Travels as a JSON object in the payload of a `Params` packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionParams {
    /// Seconds to wait for a frame before treating the line as silent
    pub read_timeout: f64,
    /// Attempts per step before the step fails
    pub max_retries: u32,
    /// Bytes of file content per Data packet
    pub chunk_size: u32,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            read_timeout: 2.0,
            max_retries: 5,
            chunk_size: 64,
        }
    }
}

impl ConnectionParams {
    pub fn new(read_timeout: f64, max_retries: u32, chunk_size: u32) -> Result<Self, ParamsError> {
        let params = ConnectionParams { read_timeout, max_retries, chunk_size };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        Duration::try_from_secs_f64(self.read_timeout)
            .map_err(|_| ParamsError::ReadTimeout(self.read_timeout))?;
        if self.max_retries == 0 {
            return Err(ParamsError::MaxRetries);
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ParamsError::ChunkSize(self.chunk_size));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.read_timeout).unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_packet_type_wire_values() {
        assert_eq!(u16::from(PacketType::Handshake), 0);
        assert_eq!(u16::from(PacketType::Params), 6);
        assert_eq!(PacketType::try_from(4u16).ok(), Some(PacketType::Nak));
        assert!(PacketType::try_from(5u16).is_err());
        assert!(PacketType::try_from(0xFFFFu16).is_err());
    }

    #[test]
    fn test_max_chunk_fits_length_field() {
        let encoded = 4 * (MAX_CHUNK_SIZE as usize).div_ceil(3) + 2;
        assert!(encoded <= u16::MAX as usize);
        let one_more = 4 * (MAX_CHUNK_SIZE as usize + 1).div_ceil(3) + 2;
        assert!(one_more > u16::MAX as usize);
    }

    #[test]
    fn test_default_params_are_valid() {
        let params = ConnectionParams::default();
        assert_eq!(params.validate(), Ok(()));
        assert_eq!(params.timeout(), Duration::from_secs(2));
    }

    #[rstest]
    #[case::negative_timeout(-1.0, 5, 64, ParamsError::ReadTimeout(-1.0))]
    #[case::infinite_timeout(f64::INFINITY, 5, 64, ParamsError::ReadTimeout(f64::INFINITY))]
    #[case::zero_retries(2.0, 0, 64, ParamsError::MaxRetries)]
    #[case::zero_chunk(2.0, 5, 0, ParamsError::ChunkSize(0))]
    #[case::oversized_chunk(2.0, 5, MAX_CHUNK_SIZE + 1, ParamsError::ChunkSize(MAX_CHUNK_SIZE + 1))]
    fn test_invalid_params(
        #[case] read_timeout: f64,
        #[case] max_retries: u32,
        #[case] chunk_size: u32,
        #[case] expected: ParamsError,
    ) {
        assert_eq!(ConnectionParams::new(read_timeout, max_retries, chunk_size), Err(expected));
    }

    #[test]
    fn test_zero_timeout_is_allowed() {
        let params = ConnectionParams::new(0.0, 1, 1).expect("zero timeout is valid");
        assert_eq!(params.timeout(), Duration::ZERO);
    }
}
