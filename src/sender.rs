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

use std::fmt;
use std::marker::PhantomData;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::payload::{read_packet, EncodeError, Packet, ReadOutcome};
use crate::protocol::{ConnectionParams, PacketType};
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

/// Sender step that ran out of retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    Negotiation,
    Data,
    Eof,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Handshake => write!(f, "handshake"),
            Stage::Negotiation => write!(f, "parameter negotiation"),
            Stage::Data => write!(f, "data chunk"),
            Stage::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("link failure: {0}")]
    Link(#[from] io::Error),

    #[error("cannot read source file: {0}")]
    Source(#[source] io::Error),

    #[error("{stage} failed after {attempts} attempts")]
    ProtocolExhausted { stage: Stage, attempts: u32 },

    #[error("failed to encode packet: {0}")]
    Encode(#[from] EncodeError),

    #[error("interrupted")]
    Interrupted,

    #[error("Transfer complete")]
    TransferComplete,
}

impl SenderError {
    /// Failures that call for closing the link and starting over
    pub fn restarts_link(&self) -> bool {
        matches!(
            self,
            SenderError::Link(_) | SenderError::ProtocolExhausted { stage: Stage::Handshake, .. }
        )
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Pause before reopening the link
    pub backoff: Duration,
    /// Connection attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            backoff: Duration::from_secs(2),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderConfig {
    pub params: ConnectionParams,
    /// Pause between handshake attempts
    pub retry_delay: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            params: ConnectionParams::default(),
            retry_delay: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Bytes acknowledged so far, for display only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub sent: u64,
    pub total: u64,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.sent as f64 * 100.0 / self.total as f64
        }
    }
}

// ============================================================================
// States
// ============================================================================

pub struct ResetLink;
pub struct Handshake;
pub struct Negotiate;
pub struct SendData;
pub struct SendEof;

// ============================================================================
// FSM Structure
// ============================================================================

/// A chunk read from the source, framed once and resent as-is until acked
struct PendingChunk {
    frame: Bytes,
    len: usize,
}

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    source: File,
    params: ConnectionParams,
    retry_delay: Duration,
    pending: Option<PendingChunk>,
    attempts: u32,
    progress: Progress,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError>;

    /// Abandon the transfer on user request
    fn interrupt(self: Box<Self>) -> SenderError;
}

enum Reply {
    Accepted,
    Rejected,
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            source: self.source,
            params: self.params,
            retry_delay: self.retry_delay,
            pending: self.pending,
            attempts: 0,
            progress: self.progress,
        })
    }

    /// Send one frame and wait for the reply; anything but `expected` is a
    /// failed attempt.
    fn exchange(&mut self, frame: &[u8], expected: PacketType) -> Result<Reply, SenderError> {
        self.serial.write_all(frame)?;

        match read_packet(&mut *self.serial, self.params.timeout())? {
            ReadOutcome::Packet(packet) if packet.packet_type() == expected => Ok(Reply::Accepted),
            ReadOutcome::Packet(Packet::Nak) => {
                debug!(?expected, "receiver sent NAK");
                Ok(Reply::Rejected)
            }
            ReadOutcome::Packet(packet) => {
                debug!(?expected, got = ?packet.packet_type(), "unexpected reply");
                Ok(Reply::Rejected)
            }
            ReadOutcome::Corrupted => {
                self.serial.discard_buffered_input()?;
                debug!(?expected, "corrupted reply");
                Ok(Reply::Rejected)
            }
            ReadOutcome::Empty => {
                debug!(?expected, "no reply before timeout");
                Ok(Reply::Rejected)
            }
        }
    }

    /// Tell the receiver to drop its session; nothing waits for the answer
    fn abandon(&mut self) {
        let sent = Packet::Reset
            .to_frame()
            .map_err(SenderError::from)
            .and_then(|frame| self.serial.write_all(&frame).map_err(SenderError::from));
        if let Err(e) = sent {
            debug!(error = %e, "could not send reset");
        }
    }
}

impl<S: Send + 'static> SenderFsm<S>
where
    SenderFsm<S>: SenderState,
{
    fn retry_or_fail(mut self, stage: Stage) -> Result<Box<dyn SenderState>, SenderError> {
        self.attempts += 1;
        if self.attempts >= self.params.max_retries {
            warn!(%stage, attempts = self.attempts, "retries exhausted");
            if matches!(stage, Stage::Data | Stage::Eof) {
                self.abandon();
            }
            return Err(SenderError::ProtocolExhausted { stage, attempts: self.attempts });
        }

        debug!(%stage, attempt = self.attempts + 1, max = self.params.max_retries, "retrying");
        if stage == Stage::Handshake && !self.retry_delay.is_zero() {
            std::thread::sleep(self.retry_delay);
        }
        Ok(Box::new(self))
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<ResetLink> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;
        info!("resetting receiver session");
        // One attempt; a receiver with no session answers Ack all the same
        let frame = Packet::Reset.to_frame()?;
        if let Reply::Rejected = fsm.exchange(&frame, PacketType::Ack)? {
            debug!("reset not acknowledged, continuing with handshake");
        }
        Ok(fsm.transition::<Handshake>())
    }

    fn interrupt(self: Box<Self>) -> SenderError {
        SenderError::Interrupted
    }
}

impl SenderState for SenderFsm<Handshake> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;
        if fsm.attempts == 0 {
            fsm.serial.discard_buffered_input()?;
            info!("starting handshake");
        }

        let frame = Packet::Handshake.to_frame()?;
        match fsm.exchange(&frame, PacketType::Handshake)? {
            Reply::Accepted => {
                info!("handshake complete, receiver is ready");
                Ok(fsm.transition::<Negotiate>())
            }
            Reply::Rejected => fsm.retry_or_fail(Stage::Handshake),
        }
    }

    fn interrupt(self: Box<Self>) -> SenderError {
        SenderError::Interrupted
    }
}

impl SenderState for SenderFsm<Negotiate> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;
        let frame = Packet::Params(fsm.params).to_frame()?;

        match fsm.exchange(&frame, PacketType::Ack)? {
            Reply::Accepted => {
                info!(
                    read_timeout = fsm.params.read_timeout,
                    max_retries = fsm.params.max_retries,
                    chunk_size = fsm.params.chunk_size,
                    "parameters accepted"
                );
                Ok(fsm.transition::<SendData>())
            }
            Reply::Rejected => fsm.retry_or_fail(Stage::Negotiation),
        }
    }

    fn interrupt(self: Box<Self>) -> SenderError {
        let mut fsm = *self;
        fsm.abandon();
        SenderError::Interrupted
    }
}

impl SenderState for SenderFsm<SendData> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let chunk = match fsm.pending.take() {
            Some(chunk) => chunk,
            None => {
                let data = read_chunk(&mut fsm.source, fsm.params.chunk_size as usize)
                    .map_err(SenderError::Source)?;
                if data.is_empty() {
                    info!(bytes = fsm.progress.sent, "file sent, signalling end of file");
                    return Ok(fsm.transition::<SendEof>());
                }
                let len = data.len();
                PendingChunk { frame: Packet::Data(data).to_frame()?, len }
            }
        };

        match fsm.exchange(&chunk.frame, PacketType::Ack)? {
            Reply::Accepted => {
                fsm.progress.sent += chunk.len as u64;
                fsm.attempts = 0;
                debug!(
                    sent = fsm.progress.sent,
                    total = fsm.progress.total,
                    percent = format_args!("{:.2}", fsm.progress.percent()),
                    "chunk acknowledged"
                );
                Ok(Box::new(fsm))
            }
            Reply::Rejected => {
                fsm.pending = Some(chunk);
                fsm.retry_or_fail(Stage::Data)
            }
        }
    }

    fn interrupt(self: Box<Self>) -> SenderError {
        let mut fsm = *self;
        fsm.abandon();
        SenderError::Interrupted
    }
}

impl SenderState for SenderFsm<SendEof> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;
        let frame = Packet::Eof.to_frame()?;

        match fsm.exchange(&frame, PacketType::Ack)? {
            Reply::Accepted => {
                info!(bytes = fsm.progress.sent, "transfer complete");
                Err(SenderError::TransferComplete)
            }
            Reply::Rejected => fsm.retry_or_fail(Stage::Eof),
        }
    }

    fn interrupt(self: Box<Self>) -> SenderError {
        let mut fsm = *self;
        fsm.abandon();
        SenderError::Interrupted
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<Handshake> {
    fn open(serial: Box<dyn SerialPort>, path: &Path, config: &SenderConfig) -> Result<Self, SenderError> {
        let source = File::open(path).map_err(SenderError::Source)?;
        let total = source.metadata().map_err(SenderError::Source)?.len();

        Ok(SenderFsm {
            state: PhantomData::<Handshake>,
            serial,
            source,
            params: config.params,
            retry_delay: config.retry_delay,
            pending: None,
            attempts: 0,
            progress: Progress { sent: 0, total },
        })
    }

    pub fn new(serial: Box<dyn SerialPort>, path: &Path, config: &SenderConfig) -> Result<Box<dyn SenderState>, SenderError> {
        Ok(Box::new(Self::open(serial, path, config)?))
    }

    /// Start by resetting the receiver, for use after a failed attempt
    pub fn after_failure(serial: Box<dyn SerialPort>, path: &Path, config: &SenderConfig) -> Result<Box<dyn SenderState>, SenderError> {
        Ok(Self::open(serial, path, config)?.transition::<ResetLink>())
    }
}

/// Step one connection attempt to completion.
pub fn drive(mut fsm: Box<dyn SenderState>, shutdown: &AtomicBool) -> Result<(), SenderError> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Err(fsm.interrupt());
        }
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(SenderError::TransferComplete) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Send `path`, reopening the link through `connect` and restarting from the
/// handshake whenever the link fails.
pub fn run_sender<F>(mut connect: F, path: &Path, config: &SenderConfig, shutdown: &AtomicBool) -> Result<(), SenderError>
where
    F: FnMut() -> io::Result<Box<dyn SerialPort>>,
{
    let path: PathBuf = path.to_path_buf();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = connect().map_err(SenderError::Link).and_then(|serial| {
            let fsm = if attempt == 1 {
                SenderFsm::new(serial, &path, config)?
            } else {
                SenderFsm::after_failure(serial, &path, config)?
            };
            drive(fsm, shutdown)
        });

        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) if e.restarts_link() => e,
            Err(e) => return Err(e),
        };

        warn!(attempt, error = %err, "connection attempt failed");
        if config.reconnect.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(err);
        }
        if shutdown.load(Ordering::SeqCst) {
            return Err(SenderError::Interrupted);
        }
        info!(backoff_ms = config.reconnect.backoff.as_millis() as u64, "reconnecting");
        std::thread::sleep(config.reconnect.backoff);
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read up to `n` bytes, short only at end of file
fn read_chunk<R: Read>(source: &mut R, n: usize) -> io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(n);
    source.take(n as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}

// ============================================================================
// Tests
// ============================================================================
