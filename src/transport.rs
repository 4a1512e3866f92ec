// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, Read, Write},
    net::TcpStream,
    sync::{Arc, Condvar, Mutex},
};
use thiserror::Error;
use tpm2_protocol::constant::TPM_MAX_COMMAND_SIZE;
use tracing::debug;

pub const TPM_HEADER_SIZE: usize = 10;

/// Microsoft TPM 2.0 simulator command-port and platform-port requests.
pub const TPM_SIGNAL_POWER_ON: u32 = 1;
pub const TPM_SEND_COMMAND: u32 = 8;
pub const TPM_SIGNAL_NV_ON: u32 = 11;
pub const TPM_SESSION_END: u32 = 20;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("response larger than {TPM_MAX_COMMAND_SIZE} bytes")]
    ResponseOverflow,
    #[error("response shorter than the TPM header")]
    ResponseUnderflow,
    #[error("simulator returned acknowledgement {0:#x}")]
    Simulator(u32),
}

/// A channel capable of sending and receiving complete TPM commands.
pub trait Transport: Send + std::fmt::Debug {
    /// Sends a complete command buffer to the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` on I/O failure.
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TransportError>;

    /// Receives a complete response buffer from the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` on I/O failure or if the response is malformed.
    fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Releases the channel. Called once, after the last command.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` if the peer could not be notified.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Reads one TPM response, using the size field of the header for framing.
fn read_framed<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; TPM_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if size < header.len() {
        return Err(TransportError::ResponseUnderflow);
    }
    if size > TPM_MAX_COMMAND_SIZE {
        return Err(TransportError::ResponseOverflow);
    }

    let mut resp_buf = header.to_vec();
    resp_buf.resize(size, 0);
    reader.read_exact(&mut resp_buf[header.len()..])?;
    Ok(resp_buf)
}

/// A transport over a TPM character device such as `/dev/tpmrm0`.
#[derive(Debug)]
pub struct FileTransport(pub File);

impl Transport for FileTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TransportError> {
        self.0.write_all(command_bytes)?;
        self.0.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        read_framed(&mut self.0)
    }
}

/// A transport to a Microsoft TPM 2.0 simulator. The command channel listens
/// on `port` and the platform channel on `port + 1`.
#[derive(Debug)]
pub struct SimulatorTransport {
    command: TcpStream,
    platform: TcpStream,
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, TransportError> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

fn expect_ack<R: Read>(reader: &mut R) -> Result<(), TransportError> {
    match read_u32(reader)? {
        0 => Ok(()),
        ack => Err(TransportError::Simulator(ack)),
    }
}

impl SimulatorTransport {
    /// Connects to a simulator and powers it on.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` if either port refuses the connection or the
    /// platform signals are not acknowledged.
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let platform_port = port.checked_add(1).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no room for the platform port")
        })?;
        let command = TcpStream::connect((host, port))?;
        let mut platform = TcpStream::connect((host, platform_port))?;
        debug!(host, port, platform_port, "simulator connected");

        for signal in [TPM_SIGNAL_POWER_ON, TPM_SIGNAL_NV_ON] {
            platform.write_all(&signal.to_be_bytes())?;
            platform.flush()?;
            expect_ack(&mut platform)?;
        }

        Ok(Self { command, platform })
    }
}

impl Transport for SimulatorTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(command_bytes.len()).map_err(|_| TransportError::ResponseOverflow)?;
        let mut frame = Vec::with_capacity(command_bytes.len() + 9);
        frame.extend_from_slice(&TPM_SEND_COMMAND.to_be_bytes());
        frame.push(0);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(command_bytes);
        self.command.write_all(&frame)?;
        self.command.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let size = read_u32(&mut self.command)? as usize;
        if size < TPM_HEADER_SIZE {
            return Err(TransportError::ResponseUnderflow);
        }
        if size > TPM_MAX_COMMAND_SIZE {
            return Err(TransportError::ResponseOverflow);
        }
        let mut resp_buf = vec![0u8; size];
        self.command.read_exact(&mut resp_buf)?;
        expect_ack(&mut self.command)?;
        Ok(resp_buf)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let end = TPM_SESSION_END.to_be_bytes();
        let command = self.command.write_all(&end);
        let platform = self.platform.write_all(&end);
        command?;
        platform?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    buffer: VecDeque<u8>,
    writer_dropped: bool,
}

#[derive(Debug, Default)]
struct EndpointGuard {
    state: Mutex<EndpointState>,
    cvar: Condvar,
}

/// One direction of an in-memory pipe.
#[derive(Debug, Clone)]
struct Endpoint(Arc<EndpointGuard>);

fn poisoned() -> io::Error {
    io::Error::other("pipe lock poisoned")
}

impl Endpoint {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.0.state.lock().map_err(|_| poisoned())?;
        while !state.writer_dropped && state.buffer.is_empty() {
            state = self.0.cvar.wait(state).map_err(|_| poisoned())?;
        }
        let n = buf.len().min(state.buffer.len());
        for (dst, byte) in buf.iter_mut().zip(state.buffer.drain(..n)) {
            *dst = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.state.lock().map_err(|_| poisoned())?;
        if state.writer_dropped {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe peer dropped",
            ));
        }
        state.buffer.extend(buf);
        self.0.cvar.notify_all();
        Ok(buf.len())
    }

    fn hang_up(&self) {
        if let Ok(mut state) = self.0.state.lock() {
            state.writer_dropped = true;
            self.0.cvar.notify_all();
        }
    }
}

/// An in-memory, bidirectional pipe transport for the mock TPM.
#[derive(Debug)]
pub struct PipeTransport {
    rx: Endpoint,
    tx: Endpoint,
}

impl PipeTransport {
    /// Creates two connected ends of a pipe.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a = Endpoint(Arc::default());
        let b = Endpoint(Arc::default());
        (
            PipeTransport {
                rx: a.clone(),
                tx: b.clone(),
            },
            PipeTransport { rx: b, tx: a },
        )
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.tx.hang_up();
        self.rx.hang_up();
    }
}

impl Read for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

impl Write for PipeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for PipeTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TransportError> {
        self.write_all(command_bytes)?;
        self.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        read_framed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_pipe_framing() {
        let (mut client, mut server) = PipeTransport::pair();
        let response = [0x80, 0x01, 0, 0, 0, 12, 0, 0, 0, 0, 0xde, 0xad];
        server.write_all(&response).unwrap();
        assert_eq!(client.receive().unwrap(), response.to_vec());
    }

    #[rstest]
    #[case(&[0x80, 0x01, 0, 0, 0, 4, 0, 0, 0, 0])]
    fn test_pipe_rejects_short_size(#[case] header: &[u8]) {
        let (mut client, mut server) = PipeTransport::pair();
        server.write_all(header).unwrap();
        assert!(matches!(
            client.receive(),
            Err(TransportError::ResponseUnderflow)
        ));
    }

    #[rstest]
    fn test_pipe_hang_up() {
        let (mut client, server) = PipeTransport::pair();
        drop(server);
        assert!(matches!(client.receive(), Err(TransportError::Io(_))));
        assert!(client.send(&[0]).is_err());
    }
}
