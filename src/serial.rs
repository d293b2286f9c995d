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

use std::io;
use std::time::{Duration, Instant};
use serialport::{SerialPort as SerialPortTrait, ClearBuffer, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte stream operations the protocol needs from the link.
///
/// `read_timeout` reports silence as an `io::ErrorKind::TimedOut` error; any
/// other error is a link failure.
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn discard_buffered_input(&mut self) -> io::Result<()>;
}

/// Fill as much of `buf` as arrives before `timeout` elapses.
///
/// Returns the number of bytes read, which is short when the line goes quiet.
/// Only genuine link errors are returned as `Err`.
pub fn read_up_to<P: SerialPort + ?Sized>(port: &mut P, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match port.read_timeout(&mut buf[filled..], remaining) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port.set_timeout(timeout).map_err(io::Error::from)?;
        self.port.read(buf)
    }

    fn discard_buffered_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Once the script runs out: time out forever, or fail like an unplugged device
    disconnect_when_drained: bool,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            disconnect_when_drained: false,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    pub fn disconnect_when_drained(mut self) -> Self {
        self.disconnect_when_drained = true;
        self
    }
}

/// Turn a list of byte runs into a mock read script, with a timeout marker
/// wherever a run is `None`.
#[cfg(test)]
pub fn script<I>(runs: I) -> Vec<Option<u8>>
where
    I: IntoIterator<Item = Option<Vec<u8>>>,
{
    let mut responses = Vec::new();
    for run in runs {
        match run {
            Some(bytes) => responses.extend(bytes.into_iter().map(Some)),
            None => responses.push(None),
        }
    }
    responses
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        // Out of responses = timeout, or a dead link
        if self.read_pos >= self.read_buffer.len() {
            if self.disconnect_when_drained {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Mock disconnect"));
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout"));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout"));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }

    fn discard_buffered_input(&mut self) -> io::Result<()> {
        // Scripted input has no "already buffered" portion to throw away
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

/// One end of an in-memory link; bytes written here are read by its peer.
#[cfg(test)]
pub struct LoopbackPort {
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
}

#[cfg(test)]
pub fn loopback_pair() -> (LoopbackPort, LoopbackPort) {
    let (a_tx, b_rx) = std::sync::mpsc::channel();
    let (b_tx, a_rx) = std::sync::mpsc::channel();
    (LoopbackPort { tx: a_tx, rx: a_rx }, LoopbackPort { tx: b_tx, rx: b_rx })
}

#[cfg(test)]
impl SerialPort for LoopbackPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        for &byte in buf {
            self.tx
                .send(byte)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Peer closed"))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        let Some((first, rest)) = buf.split_first_mut() else {
            return Ok(0);
        };
        *first = match self.rx.recv_timeout(timeout) {
            Ok(byte) => byte,
            Err(RecvTimeoutError::Timeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Loopback timeout"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Peer closed"));
            }
        };

        let mut bytes_read = 1;
        for slot in rest {
            match self.rx.try_recv() {
                Ok(byte) => {
                    *slot = byte;
                    bytes_read += 1;
                }
                Err(_) => break,
            }
        }
        Ok(bytes_read)
    }

    fn discard_buffered_input(&mut self) -> io::Result<()> {
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
