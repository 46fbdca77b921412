//! Asynchronous RS-485 transport built on Tokio and `tokio-serial`.
//!
//! The BMS pushes fixed-length long frames (record body plus a command echo
//! and CRC-16 trailer) onto a shared bus. Between long frames the bus also
//! carries 11-byte command envelopes, either our own TX echoed back by the
//! transceiver or another master polling its slaves; those are picked off
//! as [`CommandEcho`] side frames.

use crate::protocol::{frame_type, validate_body, MIN_RESPONSE_SIZE, SERIAL_FRAME_LENGTH};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

/// Errors of the serial transport layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A framing or validation error from the protocol layer.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::Error),
    /// An I/O error from the serial port.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
    /// A Tokio timeout elapsed during an I/O operation.
    #[error("Tokio timeout elapsed: {0}")]
    TokioElapsed(#[from] tokio::time::error::Elapsed),
    /// The bus stayed silent for the whole idle-poll budget.
    #[error("no data on the bus after {polls} idle polls")]
    NoData { polls: u32 },
}

type Result<T> = std::result::Result<T, Error>;

/// Poll interval while waiting for the bus to produce data.
const IDLE_POLL: Duration = Duration::from_millis(10);
/// Consecutive empty polls before a read attempt is abandoned.
const MAX_IDLE_POLLS: u32 = 20;
/// Length of a command envelope on the bus: address, 8 command bytes, CRC.
const ECHO_FRAME_LENGTH: usize = 11;

/// Byte-level access to the bus, a seam for tests.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Number of bytes the driver has buffered for us.
    fn bytes_to_read(&mut self) -> Result<u32>;
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
}

impl Transport for tokio_serial::SerialStream {
    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(tokio_serial::SerialPort::bytes_to_read(self)?)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(AsyncReadExt::read(self, buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(AsyncWriteExt::write_all(self, buf).await?)
    }
}

/// Open a serial port with the 8N1 settings the BMS expects.
pub fn open(port: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
    Ok(tokio_serial::new(port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?)
}

/// An 11-byte command envelope observed on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEcho {
    pub bytes: Vec<u8>,
    /// Whether the envelope's CRC-16 checked out.
    pub crc_ok: bool,
}

/// Reads long frames and command echoes from a [`Transport`].
#[derive(Debug)]
pub struct FrameReader<T> {
    transport: T,
    io_timeout: Duration,
    frame_length: usize,
}

impl<T: Transport> FrameReader<T> {
    pub fn new(transport: T, io_timeout: Duration, frame_length: usize) -> Self {
        Self {
            transport,
            io_timeout,
            frame_length,
        }
    }

    pub fn with_defaults(transport: T) -> Self {
        Self::new(transport, Duration::from_millis(500), SERIAL_FRAME_LENGTH)
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Write a command envelope to the bus.
    pub async fn send(&mut self, tx_buffer: &[u8]) -> Result<()> {
        log::trace!("write bytes: {tx_buffer:02X?}");
        tokio::time::timeout(self.io_timeout, self.transport.write_all(tx_buffer)).await??;
        Ok(())
    }

    async fn fill(&mut self, buf: &mut Vec<u8>, idle: &mut u32) -> Result<()> {
        let pending = self.transport.bytes_to_read()?;
        if pending == 0 {
            *idle += 1;
            if *idle >= MAX_IDLE_POLLS {
                return Err(Error::NoData { polls: *idle });
            }
            tokio::time::sleep(IDLE_POLL).await;
            return Ok(());
        }
        *idle = 0;
        let mut chunk = vec![0; pending as usize];
        let received =
            tokio::time::timeout(self.io_timeout, self.transport.read(&mut chunk)).await??;
        log::trace!("received {received} bytes: {:02X?}", &chunk[..received]);
        buf.extend_from_slice(&chunk[..received]);
        Ok(())
    }

    /// Read the next validated long frame.
    ///
    /// Command envelopes encountered before the frame header are appended to
    /// `echoes`. Returns the full frame including its trailer; both the body
    /// checksum and the trailer CRC have been verified.
    pub async fn read_frame(&mut self, echoes: &mut Vec<CommandEcho>) -> Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.frame_length);
        let mut idle = 0;
        loop {
            self.fill(&mut buf, &mut idle).await?;

            // peel off echoes and noise ahead of the frame header
            loop {
                if buf.len() < 2 {
                    break;
                }
                if buf[0] == 0x55 && buf[1] == 0xAA {
                    break;
                }
                if buf[1] == 0x10 {
                    // command envelope; wait for all 11 bytes
                    if buf.len() < ECHO_FRAME_LENGTH {
                        break;
                    }
                    let bytes: Vec<u8> = buf.drain(..ECHO_FRAME_LENGTH).collect();
                    let crc_ok = crate::crc::validate_crc16(&bytes).is_ok();
                    log::debug!("command echo (crc_ok={crc_ok}): {bytes:02X?}");
                    echoes.push(CommandEcho { bytes, crc_ok });
                } else {
                    log::trace!("dropping noise byte {:02X}", buf[0]);
                    buf.remove(0);
                }
            }

            if buf.len() < self.frame_length || !(buf[0] == 0x55 && buf[1] == 0xAA) {
                continue;
            }

            let frame: Vec<u8> = buf.drain(..self.frame_length).collect();
            validate_body(&frame)?;
            // trailer CRC covers only the command-echo zone after the body
            crate::crc::validate_crc16(&frame[MIN_RESPONSE_SIZE..])?;
            log::debug!("frame type {} from the bus", frame_type(&frame));
            return Ok(frame);
        }
    }

    /// Read until the expected acknowledgement appears on the bus.
    ///
    /// The transceiver echoes our own TX first, so the ack is searched as a
    /// subslice rather than compared at a fixed position. Returns `false`
    /// when the idle budget runs out with data that does not contain it.
    pub async fn read_exact_match(&mut self, expected: &[u8]) -> Result<bool> {
        let mut buf: Vec<u8> = Vec::new();
        let mut idle = 0;
        loop {
            match self.fill(&mut buf, &mut idle).await {
                Ok(()) => {}
                Err(Error::NoData { .. }) if !buf.is_empty() => {
                    log::warn!("expected ack {expected:02X?}, got {buf:02X?}");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
            if buf
                .windows(expected.len().max(1))
                .any(|w| w == expected)
            {
                return Ok(true);
            }
        }
    }
}

/// Scripted in-memory transport for deterministic tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    pub(crate) struct MockTransport {
        inbound: VecDeque<Vec<u8>>,
        pending: Vec<u8>,
        pub(crate) written: Vec<Vec<u8>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Queue one chunk the transport will deliver, in order.
        pub(crate) fn feed(&mut self, chunk: &[u8]) {
            self.inbound.push_back(chunk.to_vec());
        }
    }

    impl Transport for MockTransport {
        fn bytes_to_read(&mut self) -> Result<u32> {
            if self.pending.is_empty() {
                if let Some(chunk) = self.inbound.pop_front() {
                    self.pending = chunk;
                }
            }
            Ok(self.pending.len() as u32)
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.written.push(buf.to_vec());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;
    use crate::protocol::tests::{from_hex, SAMPLE_FRAME_HEX};
    use crate::protocol::FRAME_TYPE_SAMPLE;

    fn reader(transport: MockTransport) -> FrameReader<MockTransport> {
        FrameReader::with_defaults(transport)
    }

    #[tokio::test(start_paused = true)]
    async fn reads_a_long_frame() {
        let frame = from_hex(SAMPLE_FRAME_HEX);
        let mut transport = MockTransport::new();
        // delivered in driver-sized slices
        for chunk in frame.chunks(64) {
            transport.feed(chunk);
        }
        let mut echoes = Vec::new();
        let got = reader(transport).read_frame(&mut echoes).await.unwrap();
        assert_eq!(got, frame);
        assert_eq!(frame_type(&got), FRAME_TYPE_SAMPLE);
        assert!(echoes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn collects_command_echoes() {
        let frame = from_hex(SAMPLE_FRAME_HEX);
        let echo = from_hex("02 10 16 20 00 01 02 00 00 C2 01");
        let mut transport = MockTransport::new();
        let mut wire = echo.clone();
        wire.extend_from_slice(&frame);
        transport.feed(&wire);

        let mut echoes = Vec::new();
        let got = reader(transport).read_frame(&mut echoes).await.unwrap();
        assert_eq!(got, frame);
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].bytes, echo);
    }

    #[tokio::test(start_paused = true)]
    async fn flags_bad_echo_crc() {
        let frame = from_hex(SAMPLE_FRAME_HEX);
        let mut echo = from_hex("02 10 16 20 00 01 02 00 00 C2 01");
        *echo.last_mut().unwrap() ^= 0xFF;
        let mut transport = MockTransport::new();
        transport.feed(&echo);
        transport.feed(&frame);

        let mut echoes = Vec::new();
        reader(transport).read_frame(&mut echoes).await.unwrap();
        assert_eq!(echoes.len(), 1);
        assert!(!echoes[0].crc_ok);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_leading_noise() {
        let frame = from_hex(SAMPLE_FRAME_HEX);
        let mut transport = MockTransport::new();
        transport.feed(&[0x00, 0xFF, 0x13]);
        transport.feed(&frame);

        let mut echoes = Vec::new();
        let got = reader(transport).read_frame(&mut echoes).await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_corrupted_frame() {
        let mut frame = from_hex(SAMPLE_FRAME_HEX);
        frame[100] ^= 0x01;
        let mut transport = MockTransport::new();
        transport.feed(&frame);

        let mut echoes = Vec::new();
        let err = reader(transport).read_frame(&mut echoes).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(crate::Error::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_bus_aborts() {
        let mut echoes = Vec::new();
        let err = reader(MockTransport::new())
            .read_frame(&mut echoes)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoData { polls: 20 }));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_found_behind_tx_echo() {
        let envelope = from_hex("01 10 10 70 00 02 04 00 00 00 01 F8 8B");
        let ack = from_hex("01 10 10 70 00 02 44 D3");
        let mut transport = MockTransport::new();
        // the transceiver loops our own TX back before the BMS answers
        transport.feed(&envelope);
        transport.feed(&ack);

        let mut r = reader(transport);
        assert!(r.read_exact_match(&ack).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_mismatch_reports_false() {
        let ack = from_hex("01 10 10 70 00 02 44 D3");
        let mut transport = MockTransport::new();
        transport.feed(&[0x01, 0x02, 0x03]);

        let mut r = reader(transport);
        assert!(!r.read_exact_match(&ack).await.unwrap());
    }
}
