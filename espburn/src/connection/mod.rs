//! Establish a connection with a target device
//!
//! The [Connection] struct owns the serial port, frames requests with SLIP,
//! and decodes the ROM loader's responses. It is the serial implementation
//! of [Transport].

use std::{
    io::{BufWriter, Write},
    iter::zip,
    thread::sleep,
    time::Duration,
};

use log::debug;
use serialport::{FlowControl, SerialPort};
use slip_codec::SlipDecoder;

use self::{
    encoder::SlipEncoder,
    reset::{reset_sequence, ResetBeforeOperation, ResetStrategy},
};
use crate::{
    command::{Command, CommandType},
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    flasher::{CommandResponse, Transport},
};

pub mod reset;

/// Type alias for the serial port the connection talks through
pub type Port = Box<dyn SerialPort>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
/// The ROM answers one SYNC with eight identical replies
const EXTRA_SYNC_REPLIES: usize = 7;
/// Replies for other commands skipped before giving up
const MAX_STALE_RESPONSES: usize = 100;

/// Direction byte of a response packet
const RESPONSE_DIRECTION: u8 = 0x01;
/// Direction, opcode, size and value
const RESPONSE_HEADER_LEN: usize = 8;

/// A decoded response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub return_op: u8,
    pub value: u32,
    pub data: Vec<u8>,
    /// Non-zero when the loader failed to execute the command
    pub status: u8,
    pub error: u8,
}

impl ResponsePacket {
    /// Decode an unframed response packet
    ///
    /// Layout: direction, opcode, size (u16), value (u32), then `size` bytes
    /// of payload ending in the status bytes. The ROM loader appends four
    /// status bytes; the two-byte form is used by flasher stubs and only
    /// accepted for the payload sizes they produce.
    pub fn parse(packet: &[u8]) -> Result<Self, Error> {
        if packet.len() < RESPONSE_HEADER_LEN {
            return Err(Error::InvalidResponse {
                expected: RESPONSE_HEADER_LEN,
                got: packet.len(),
            });
        }
        if packet[0] != RESPONSE_DIRECTION {
            return Err(Error::Connection(ConnectionError::FramingError));
        }

        let size = u16::from_le_bytes([packet[2], packet[3]]) as usize;
        let value = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let body = &packet[RESPONSE_HEADER_LEN..];
        if body.len() < size {
            return Err(Error::InvalidResponse {
                expected: RESPONSE_HEADER_LEN + size,
                got: packet.len(),
            });
        }
        let body = &body[..size];

        let status_len = if size == 2 || size == 18 { 2 } else { 4 };
        if size < status_len {
            return Err(Error::InvalidResponse {
                expected: RESPONSE_HEADER_LEN + status_len,
                got: packet.len(),
            });
        }
        let status_at = size - status_len;

        Ok(ResponsePacket {
            return_op: packet[1],
            value,
            data: body[..status_at].to_vec(),
            status: body[status_at],
            error: body[status_at + 1],
        })
    }
}

/// An established connection with a target device
pub struct Connection {
    serial: Port,
    decoder: SlipDecoder,
    before_operation: ResetBeforeOperation,
}

impl Connection {
    /// Open `port` at `baud`
    pub fn open(
        port: &str,
        baud: u32,
        before_operation: ResetBeforeOperation,
    ) -> Result<Self, Error> {
        debug!("Opening {port} at {baud} baud");
        let serial = serialport::new(port, baud)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(Error::from)?;

        Ok(Connection::new(serial, before_operation))
    }

    pub fn new(serial: Port, before_operation: ResetBeforeOperation) -> Self {
        Connection {
            serial,
            decoder: SlipDecoder::new(),
            before_operation,
        }
    }

    /// Reset the target into its loader (unless disabled) and synchronize
    ///
    /// Each sync request waits up to `sync_timeout` for its reply.
    pub fn begin(&mut self, sync_timeout: Duration) -> Result<(), Error> {
        let strategies = reset_sequence(self.before_operation);

        if strategies.is_empty() {
            return self.connect_attempt(None, sync_timeout);
        }

        for (_, reset_strategy) in zip(0..MAX_CONNECT_ATTEMPTS, strategies.iter().cycle()) {
            match self.connect_attempt(Some(reset_strategy as &dyn ResetStrategy), sync_timeout) {
                Ok(_) => return Ok(()),
                Err(e) => debug!("Failed to reset, error {:#?}, retrying", e),
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    fn connect_attempt(
        &mut self,
        reset_strategy: Option<&dyn ResetStrategy>,
        sync_timeout: Duration,
    ) -> Result<(), Error> {
        if let Some(strategy) = reset_strategy {
            strategy.reset(&mut self.serial)?;
            // discard the boot log
            self.serial.clear(serialport::ClearBuffer::Input)?;
        }

        for _ in 0..MAX_SYNC_ATTEMPTS {
            self.flush()?;

            if self.sync(sync_timeout).is_ok() {
                return Ok(());
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Try to sync with the device for a given timeout
    pub(crate) fn sync(&mut self, timeout: Duration) -> Result<(), Error> {
        self.with_timeout(timeout, |connection| {
            connection.command(Command::Sync)?;
            connection.flush()?;

            sleep(Duration::from_millis(10));

            // drain the remaining replies, a missing one is not an error
            for _ in 0..EXTRA_SYNC_REPLIES {
                match connection.read_response() {
                    Ok(response) if response.return_op == CommandType::Sync as u8 => {
                        if response.status != 0 {
                            connection.flush().ok();
                            return Err(Error::RomError(RomError::new(
                                CommandType::Sync,
                                RomErrorKind::from(response.error),
                            )));
                        }
                    }
                    Ok(_) => {
                        return Err(Error::RomError(RomError::new(
                            CommandType::Sync,
                            RomErrorKind::InvalidMessage,
                        )))
                    }
                    Err(_) => break,
                }
            }

            Ok(())
        })
    }

    /// Run a command with a timeout defined by the command type
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = {
            let old_timeout = self.serial.timeout();
            self.serial.set_timeout(timeout)?;
            old_timeout
        };

        let result = f(self);

        self.serial.set_timeout(old_timeout)?;

        result
    }

    /// Read the response from a serial port
    pub fn read_response(&mut self) -> Result<ResponsePacket, Error> {
        let packet = self.read()?;
        ResponsePacket::parse(&packet)
    }

    /// Write a command to the serial port
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {}", command.command_type());
        let serial = &mut self.serial;

        serial.clear(serialport::ClearBuffer::Input)?;
        let mut writer = BufWriter::new(serial);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    /// Write a command and read its response
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        for _ in 0..MAX_STALE_RESPONSES {
            match self.read_response().for_command(ty)? {
                response if response.return_op == ty as u8 => {
                    return if response.status != 0 {
                        let _error = self.flush();
                        Err(Error::RomError(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(CommandResponse {
                            value: response.value,
                            data: response.data,
                        })
                    };
                }
                response => {
                    debug!("Skipping stale response to {:#04x}", response.return_op);
                    continue;
                }
            }
        }
        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    fn read(&mut self) -> Result<Vec<u8>, Error> {
        let mut packet = Vec::with_capacity(1024);
        self.decoder.decode(&mut self.serial, &mut packet)?;
        Ok(packet)
    }

    /// Flush the serial port
    pub fn flush(&mut self) -> Result<(), Error> {
        self.serial.flush()?;
        Ok(())
    }
}

impl Transport for Connection {
    fn exchange(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        match command {
            Command::Sync => {
                self.begin(timeout)?;
                Ok(CommandResponse::default())
            }
            command => self.with_timeout(timeout, |connection| connection.command(command)),
        }
    }
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }

}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rom_response_with_payload() {
        // READ_REG reply: value 0x4361606f, four status bytes
        let packet = [0x01, 0x0A, 0x04, 0x00, 0x6f, 0x60, 0x61, 0x43, 0, 0, 0, 0];
        let response = ResponsePacket::parse(&packet).unwrap();

        assert_eq!(response.return_op, 0x0A);
        assert_eq!(response.value, 0x4361_606f);
        assert!(response.data.is_empty());
        assert_eq!(response.status, 0);
    }

    #[test]
    fn rom_failure_carries_error_code() {
        let packet = [0x01, 0x03, 0x04, 0x00, 0, 0, 0, 0, 0x01, 0xC1, 0, 0];
        let response = ResponsePacket::parse(&packet).unwrap();

        assert_eq!(response.status, 1);
        assert_eq!(RomErrorKind::from(response.error), RomErrorKind::BadDataChecksum);
    }

    #[test]
    fn data_precedes_status_bytes() {
        let mut packet = vec![0x01, 0x0E, 20, 0x00, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xE9, 0x03, 0x02, 0x20]);
        packet.extend_from_slice(&[0xAA; 12]);
        packet.extend_from_slice(&[0, 0, 0, 0]);

        let response = ResponsePacket::parse(&packet).unwrap();
        assert_eq!(response.data.len(), 16);
        assert_eq!(&response.data[..4], &[0xE9, 0x03, 0x02, 0x20]);
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert!(matches!(
            ResponsePacket::parse(&[0x01, 0x08]),
            Err(Error::InvalidResponse { .. })
        ));
        // declared size exceeds the packet
        assert!(matches!(
            ResponsePacket::parse(&[0x01, 0x08, 0x10, 0x00, 0, 0, 0, 0, 0, 0]),
            Err(Error::InvalidResponse { .. })
        ));
        // request direction
        assert!(ResponsePacket::parse(&[0x00, 0x08, 0x04, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn framed_request_decodes_to_the_same_packet() {
        let mut framed = Vec::new();
        {
            let mut encoder = SlipEncoder::new(&mut framed).unwrap();
            Command::ReadReg {
                address: 0x4000_10C0,
            }
            .write(&mut encoder)
            .unwrap();
            encoder.finish().unwrap();
        }

        let mut decoded = Vec::new();
        SlipDecoder::new()
            .decode(&mut Cursor::new(framed), &mut decoded)
            .unwrap();

        let mut plain = Vec::new();
        Command::ReadReg {
            address: 0x4000_10C0,
        }
        .write(&mut plain)
        .unwrap();
        assert_eq!(decoded, plain);
    }
}
