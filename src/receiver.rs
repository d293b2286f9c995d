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

//! Receiving side of the link.
//!
//! Every step reads at most one packet and answers it with exactly one
//! control packet. Data packets carry no sequence number, so a chunk whose
//! Ack is lost on the way back is retransmitted by the sender and appended a
//! second time.

use std::marker::PhantomData;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use crate::payload::{read_packet, EncodeError, Packet, ReadOutcome};
use crate::protocol::ConnectionParams;
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("link failure (in state: {state}): {source}")]
    Link {
        state: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode reply: {0}")]
    Encode(#[from] EncodeError),
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitingHandshake;
pub struct Negotiating;
pub struct Transferring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingHandshake,
    Negotiating,
    Transferring,
}

// ============================================================================
// Session
// ============================================================================

/// Per-transfer state; torn down on Eof, inactivity, or Reset.
pub struct Session {
    params: ConnectionParams,
    sink: Option<File>,
    consecutive_timeouts: u32,
    bytes_received: u64,
}

impl Session {
    fn new(params: ConnectionParams) -> Self {
        Session {
            params,
            sink: None,
            consecutive_timeouts: 0,
            bytes_received: 0,
        }
    }

    #[cfg(test)]
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    #[cfg(test)]
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    #[cfg(test)]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    output_path: PathBuf,
    defaults: ConnectionParams,
    inactivity_budget: u32,
    session: Session,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError>;

    fn phase(&self) -> Phase;

    fn session(&self) -> &Session;

    /// Close any open output file, keeping what was written
    fn shutdown(self: Box<Self>);
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            output_path: self.output_path,
            defaults: self.defaults,
            inactivity_budget: self.inactivity_budget,
            session: self.session,
        })
    }

    fn link_error(&self, e: io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Link { state, source: e }
    }

    fn receive(&mut self) -> Result<ReadOutcome, ReceiverError> {
        let timeout = self.session.params.timeout();
        let outcome = read_packet(&mut *self.serial, timeout).map_err(|e| self.link_error(e))?;
        if outcome != ReadOutcome::Empty {
            self.session.consecutive_timeouts = 0;
        }
        Ok(outcome)
    }

    fn reply(&mut self, packet: Packet) -> Result<(), ReceiverError> {
        let frame = packet.to_frame()?;
        self.serial.write_all(&frame).map_err(|e| self.link_error(e))?;
        trace!(packet_type = ?packet.packet_type(), "reply sent");
        Ok(())
    }

    fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.session.sink.is_none() {
            self.session.sink = Some(File::create(&self.output_path)?);
            info!(path = %self.output_path.display(), "receiving into output file");
        }
        if let Some(ref mut sink) = self.session.sink {
            sink.write_all(chunk)?;
        }
        self.session.bytes_received += chunk.len() as u64;
        Ok(())
    }

    /// Close the sink, keeping the file
    fn finish(&mut self) -> io::Result<()> {
        if self.session.sink.is_none() {
            // Zero-length transfer never opened a sink
            self.session.sink = Some(File::create(&self.output_path)?);
        }
        // Held until flushed, so discard() still removes the file on failure
        if let Some(sink) = self.session.sink.as_mut() {
            sink.flush()?;
        }
        self.session.sink = None;
        Ok(())
    }

    /// Drop the sink and remove the partial file
    fn discard(&mut self) {
        if self.session.sink.take().is_some() {
            match fs::remove_file(&self.output_path) {
                Ok(()) => info!(path = %self.output_path.display(), "discarded partial file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.output_path.display(), error = %e, "failed to remove partial file"),
            }
        }
    }

    fn end_session(&mut self) {
        self.session = Session::new(self.defaults);
    }

    fn close(mut self) {
        if let Some(mut sink) = self.session.sink.take() {
            match sink.flush() {
                Ok(()) => info!(
                    path = %self.output_path.display(),
                    bytes = self.session.bytes_received,
                    "closed partial output file"
                ),
                Err(e) => error!(path = %self.output_path.display(), error = %e, "failed to flush output file"),
            }
        }
    }
}

impl<S: Send + 'static> ReceiverFsm<S>
where
    ReceiverFsm<S>: ReceiverState,
{
    /// Rows of the transition table that apply in every state.
    fn unhandled(mut self, outcome: ReadOutcome) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        match outcome {
            ReadOutcome::Empty => {
                self.session.consecutive_timeouts += 1;
                trace!(ticks = self.session.consecutive_timeouts, "no frame before timeout");
                if self.session.consecutive_timeouts < self.inactivity_budget {
                    return Ok(Box::new(self));
                }
                if self.phase() != Phase::AwaitingHandshake {
                    warn!(
                        ticks = self.session.consecutive_timeouts,
                        phase = ?self.phase(),
                        "sender went silent, abandoning session"
                    );
                }
                self.discard();
                self.end_session();
                Ok(self.transition::<AwaitingHandshake>())
            }
            ReadOutcome::Corrupted => {
                self.serial.discard_buffered_input().map_err(|e| self.link_error(e))?;
                self.reply(Packet::Nak)?;
                debug!(phase = ?self.phase(), "corrupted frame, sent NAK");
                Ok(Box::new(self))
            }
            ReadOutcome::Packet(Packet::Reset) => {
                info!(phase = ?self.phase(), "reset requested");
                self.discard();
                self.end_session();
                self.reply(Packet::Ack)?;
                Ok(self.transition::<AwaitingHandshake>())
            }
            ReadOutcome::Packet(packet) => {
                debug!(phase = ?self.phase(), packet_type = ?packet.packet_type(), "unexpected packet, sent NAK");
                self.reply(Packet::Nak)?;
                Ok(Box::new(self))
            }
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<AwaitingHandshake> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        match fsm.receive()? {
            ReadOutcome::Packet(Packet::Handshake) => {
                info!("handshake received");
                fsm.reply(Packet::Handshake)?;
                Ok(fsm.transition::<Negotiating>())
            }
            other => fsm.unhandled(other),
        }
    }

    fn phase(&self) -> Phase {
        Phase::AwaitingHandshake
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn shutdown(self: Box<Self>) {
        self.close()
    }
}

impl ReceiverState for ReceiverFsm<Negotiating> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        match fsm.receive()? {
            ReadOutcome::Packet(Packet::Params(params)) => {
                info!(
                    read_timeout = params.read_timeout,
                    max_retries = params.max_retries,
                    chunk_size = params.chunk_size,
                    "connection parameters applied"
                );
                fsm.session.params = params;
                fsm.reply(Packet::Ack)?;
                Ok(fsm.transition::<Transferring>())
            }
            ReadOutcome::Packet(Packet::Handshake) => {
                debug!("repeated handshake, echoing again");
                fsm.reply(Packet::Handshake)?;
                Ok(Box::new(fsm))
            }
            other => fsm.unhandled(other),
        }
    }

    fn phase(&self) -> Phase {
        Phase::Negotiating
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn shutdown(self: Box<Self>) {
        self.close()
    }
}

impl ReceiverState for ReceiverFsm<Transferring> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        match fsm.receive()? {
            ReadOutcome::Packet(Packet::Data(chunk)) => {
                if let Err(e) = fsm.append(&chunk) {
                    error!(path = %fsm.output_path.display(), error = %e, "cannot write output file");
                    fsm.discard();
                    fsm.end_session();
                    fsm.reply(Packet::Nak)?;
                    return Ok(fsm.transition::<AwaitingHandshake>());
                }
                debug!(len = chunk.len(), total = fsm.session.bytes_received, "chunk received");
                fsm.reply(Packet::Ack)?;
                Ok(Box::new(fsm))
            }
            ReadOutcome::Packet(Packet::Eof) => {
                let bytes = fsm.session.bytes_received;
                let reply = match fsm.finish() {
                    Ok(()) => {
                        info!(path = %fsm.output_path.display(), bytes, "file received");
                        Packet::Ack
                    }
                    Err(e) => {
                        error!(path = %fsm.output_path.display(), error = %e, "cannot finish output file");
                        fsm.discard();
                        Packet::Nak
                    }
                };
                fsm.end_session();
                fsm.reply(reply)?;
                Ok(fsm.transition::<AwaitingHandshake>())
            }
            other => fsm.unhandled(other),
        }
    }

    fn phase(&self) -> Phase {
        Phase::Transferring
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn shutdown(self: Box<Self>) {
        self.close()
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<AwaitingHandshake> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        output_path: PathBuf,
        defaults: ConnectionParams,
        inactivity_budget: u32,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<AwaitingHandshake>,
            serial,
            output_path,
            defaults,
            inactivity_budget: inactivity_budget.max(1),
            session: Session::new(defaults),
        })
    }
}

/// Step the receiver until `shutdown` is raised or the link fails.
pub fn run_receiver(mut fsm: Box<dyn ReceiverState>, shutdown: &AtomicBool) -> Result<(), ReceiverError> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!(phase = ?fsm.phase(), bytes = fsm.session().bytes_received(), "receiver shutting down");
            fsm.shutdown();
            return Ok(());
        }
        fsm = fsm.step()?;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{script, MockSerialPort};

    fn frame(packet: Packet) -> Vec<u8> {
        packet.to_frame().unwrap().to_vec()
    }

    fn output_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("serlink_rx_{}.bin", name));
        std::fs::remove_file(&path).ok();
        path
    }

    fn receiver(responses: Vec<Option<u8>>, expected_writes: Vec<u8>, path: &PathBuf, budget: u32) -> Box<dyn ReceiverState> {
        crate::init_test_logging();
        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        ReceiverFsm::new(mock_serial, path.clone(), ConnectionParams::default(), budget)
    }

    fn step_n(mut fsm: Box<dyn ReceiverState>, n: usize) -> Box<dyn ReceiverState> {
        for _ in 0..n {
            fsm = fsm.step().expect("step should succeed");
        }
        fsm
    }

    fn negotiated() -> Vec<Option<Vec<u8>>> {
        vec![
            Some(frame(Packet::Handshake)),
            Some(frame(Packet::Params(ConnectionParams::default()))),
        ]
    }

    #[test]
    fn test_receiver_full_transfer() {
        let path = output_path("full_transfer");
        let chunks: [&[u8]; 3] = [b"first ", b"second ", b"third"];

        let mut runs = negotiated();
        for chunk in chunks {
            runs.push(Some(frame(Packet::Data(chunk.to_vec()))));
        }
        runs.push(Some(frame(Packet::Eof)));

        let mut expected_writes = frame(Packet::Handshake);
        for _ in 0..5 {
            expected_writes.extend(frame(Packet::Ack));
        }

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 6);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
        assert!(!fsm.session().has_sink());

        let content = std::fs::read(&path).expect("Should read file");
        assert_eq!(content, b"first second third");

        drop(fsm);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_data_before_handshake_is_refused() {
        let path = output_path("data_before_handshake");
        let responses = script([Some(frame(Packet::Data(b"early".to_vec())))]);

        let fsm = step_n(receiver(responses, frame(Packet::Nak), &path, 10), 1);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
        assert!(!path.exists());
    }

    #[test]
    fn test_repeated_handshake_is_echoed() {
        let path = output_path("repeated_handshake");
        let responses = script([Some(frame(Packet::Handshake)), Some(frame(Packet::Handshake))]);
        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Handshake));

        let fsm = step_n(receiver(responses, expected_writes, &path, 10), 2);
        assert_eq!(fsm.phase(), Phase::Negotiating);
    }

    #[test]
    fn test_params_are_applied() {
        let path = output_path("params_applied");
        let params = ConnectionParams::new(0.5, 9, 16).unwrap();
        let responses = script([Some(frame(Packet::Handshake)), Some(frame(Packet::Params(params)))]);
        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));

        let fsm = step_n(receiver(responses, expected_writes, &path, 10), 2);
        assert_eq!(fsm.phase(), Phase::Transferring);
        assert_eq!(fsm.session().params(), &params);
    }

    #[test]
    fn test_invalid_params_are_nakked() {
        let path = output_path("invalid_params");
        let bad = crate::frame::encode(
            crate::protocol::PacketType::Params,
            br#"{"read_timeout":2.0,"max_retries":0,"chunk_size":64}"#,
        )
        .unwrap()
        .to_vec();
        let responses = script([Some(frame(Packet::Handshake)), Some(bad)]);
        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Nak));

        let fsm = step_n(receiver(responses, expected_writes, &path, 10), 2);
        assert_eq!(fsm.phase(), Phase::Negotiating);
        assert_eq!(fsm.session().params(), &ConnectionParams::default());
    }

    #[test]
    fn test_corrupted_frame_is_nakked_without_state_change() {
        let path = output_path("corrupted_frame");
        let mut bad = frame(Packet::Data(b"abcd".to_vec()));
        bad[7] ^= 0x04;

        let mut runs = negotiated();
        runs.push(Some(bad));
        runs.push(Some(frame(Packet::Data(b"abcd".to_vec()))));

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Nak));
        expected_writes.extend(frame(Packet::Ack));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 3);
        assert_eq!(fsm.phase(), Phase::Transferring);
        assert!(!fsm.session().has_sink());

        let fsm = step_n(fsm, 1);
        assert_eq!(fsm.session().bytes_received(), 4);
        drop(fsm);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_inactivity_discards_partial_file() {
        let path = output_path("inactivity");
        let mut runs = negotiated();
        runs.push(Some(frame(Packet::Data(b"partial".to_vec()))));
        runs.extend([None, None, None]);

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Ack));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 3), 3);
        assert!(fsm.session().has_sink());
        assert!(path.exists());

        let fsm = step_n(fsm, 2);
        assert_eq!(fsm.phase(), Phase::Transferring);
        assert_eq!(fsm.session().consecutive_timeouts(), 2);

        let fsm = step_n(fsm, 1);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
        assert_eq!(fsm.session().consecutive_timeouts(), 0);
        assert!(!fsm.session().has_sink());
        assert!(!path.exists());
    }

    #[test]
    fn test_any_frame_resets_inactivity_counter() {
        let path = output_path("inactivity_reset");
        let mut runs = negotiated();
        runs.extend([None, None]);
        runs.push(Some(vec![0x01, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]));
        runs.push(None);

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Nak));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 3), 4);
        assert_eq!(fsm.session().consecutive_timeouts(), 2);

        let fsm = step_n(fsm, 1);
        assert_eq!(fsm.session().consecutive_timeouts(), 0);
        assert_eq!(fsm.phase(), Phase::Transferring);

        let fsm = step_n(fsm, 1);
        assert_eq!(fsm.session().consecutive_timeouts(), 1);
        assert_eq!(fsm.phase(), Phase::Transferring);
    }

    #[test]
    fn test_valid_frame_resets_inactivity_counter() {
        let path = output_path("inactivity_valid_frame");
        let mut runs = negotiated();
        runs.extend([None, None]);
        runs.push(Some(frame(Packet::Data(b"more".to_vec()))));
        runs.extend([None, None]);

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Ack));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 3), 4);
        assert_eq!(fsm.session().consecutive_timeouts(), 2);

        let fsm = step_n(fsm, 1);
        assert_eq!(fsm.session().consecutive_timeouts(), 0);
        assert_eq!(fsm.session().bytes_received(), 4);

        // Two more silent reads stay under the budget of three
        let fsm = step_n(fsm, 2);
        assert_eq!(fsm.phase(), Phase::Transferring);
        assert_eq!(fsm.session().consecutive_timeouts(), 2);
        assert!(path.exists());

        drop(fsm);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reset_discards_session_and_is_idempotent() {
        let path = output_path("reset");
        let tuned = ConnectionParams::new(0.25, 3, 8).unwrap();
        let runs = vec![
            Some(frame(Packet::Handshake)),
            Some(frame(Packet::Params(tuned))),
            Some(frame(Packet::Data(b"half a fi".to_vec()))),
            Some(frame(Packet::Reset)),
            Some(frame(Packet::Reset)),
        ];

        let mut expected_writes = frame(Packet::Handshake);
        for _ in 0..4 {
            expected_writes.extend(frame(Packet::Ack));
        }

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 3);
        assert!(path.exists());

        let fsm = step_n(fsm, 1);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
        assert!(!path.exists());
        assert_eq!(fsm.session().params(), &ConnectionParams::default());

        let fsm = step_n(fsm, 1);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
    }

    #[test]
    fn test_empty_file_is_created_on_eof() {
        let path = output_path("empty_file");
        let mut runs = negotiated();
        runs.push(Some(frame(Packet::Eof)));

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Ack));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 3);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
        assert_eq!(std::fs::read(&path).unwrap(), b"");

        drop(fsm);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unwritable_output_is_nakked() {
        let path = std::env::temp_dir().join("serlink_missing_dir").join("out.bin");
        let mut runs = negotiated();
        runs.push(Some(frame(Packet::Data(b"nowhere".to_vec()))));

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Nak));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 3);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
    }

    #[test]
    fn test_receiver_reassembles_chunked_file() {
        let path = output_path("abcdefg");
        let params = ConnectionParams::new(2.0, 3, 4).unwrap();
        let runs = vec![
            Some(frame(Packet::Handshake)),
            Some(frame(Packet::Params(params))),
            Some(frame(Packet::Data(b"ABCD".to_vec()))),
            Some(frame(Packet::Data(b"EFG".to_vec()))),
            Some(frame(Packet::Eof)),
        ];

        let mut expected_writes = frame(Packet::Handshake);
        for _ in 0..4 {
            expected_writes.extend(frame(Packet::Ack));
        }

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 5);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
        assert!(!fsm.session().has_sink());
        assert_eq!(fsm.session().params(), &ConnectionParams::default());
        assert_eq!(std::fs::read(&path).unwrap(), b"ABCDEFG");

        drop(fsm);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unfinishable_output_is_nakked() {
        let path = std::env::temp_dir().join("serlink_missing_dir_eof").join("out.bin");
        let mut runs = negotiated();
        runs.push(Some(frame(Packet::Eof)));

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Nak));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 3);
        assert_eq!(fsm.phase(), Phase::AwaitingHandshake);
        assert!(!fsm.session().has_sink());
        assert!(!path.exists());
    }

    #[test]
    fn test_shutdown_keeps_partial_file() {
        let path = output_path("shutdown");
        let mut runs = negotiated();
        runs.push(Some(frame(Packet::Data(b"kept".to_vec()))));

        let mut expected_writes = frame(Packet::Handshake);
        expected_writes.extend(frame(Packet::Ack));
        expected_writes.extend(frame(Packet::Ack));

        let fsm = step_n(receiver(script(runs), expected_writes, &path, 10), 3);
        let shutdown = AtomicBool::new(true);
        run_receiver(fsm, &shutdown).expect("shutdown is orderly");

        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_link_failure_ends_the_loop() {
        let path = output_path("link_failure");
        crate::init_test_logging();
        let mock_serial = Box::new(MockSerialPort::new(vec![], vec![]).disconnect_when_drained());
        let fsm = ReceiverFsm::new(mock_serial, path, ConnectionParams::default(), 10);

        let shutdown = AtomicBool::new(false);
        match run_receiver(fsm, &shutdown) {
            Err(ReceiverError::Link { state, source }) => {
                assert_eq!(state, "AwaitingHandshake");
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected link failure, got {:?}", other.err()),
        }
    }
}
