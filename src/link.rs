//! Framed command/response link to the reader.
//!
//! Every request is `[len, address, command, payload.., crc_lo, crc_hi]` and every
//! response is `[len, address, command, status, payload.., crc_lo, crc_hi]`, where
//! `len` counts the bytes following it and the CRC is CRC-16/MCRF4XX over all
//! preceding bytes. The same framing runs over TCP or a serial line.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bincode::Options;
use crc16::{State, MCRF4XX};
use log::{debug, info};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Deserialize;
use serial::core::prelude::*;

use crate::error::{Error, Result};
use crate::reader::{TagRead, TagReadBack, TagReader, TagWrite};

const IO_TIMEOUT: Duration = Duration::from_millis(1000);
const BROADCAST_ADDRESS: u8 = 0xFF;
/// Tags the read buffer is sized for up front.
const READ_BUFFER_TAGS: usize = 256;
/// `xpc (u32), antenna (u8), rssi (i8)` following each EPC. Not part of the
/// stock RU5102 inventory reply; the reader side must append it.
const TRAILER_LEN: usize = 6;

#[derive(Copy, Clone, PartialEq, Debug, IntoPrimitive)]
#[repr(u8)]
enum CommandType {
    Inventory = 0x01,
    ReadData = 0x02,
    WriteData = 0x03,
    ReaderInformation = 0x21,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0x00,
    InventoryComplete = 0x01,
    InventoryTimeout = 0x02,
    MoreData = 0x03,
    MemoryFull = 0x04,
    AntennaError = 0xF8,
    CommandFailed = 0xF9,
    PoorCommunication = 0xFA,
    NoTags = 0xFB,
    TagError = 0xFC,
    WrongLength = 0xFD,
    IllegalCommand = 0xFE,
    ParameterError = 0xFF,
}

impl ResponseStatus {
    fn is_inventory_ok(self) -> bool {
        match self {
            ResponseStatus::Success
            | ResponseStatus::InventoryComplete
            | ResponseStatus::InventoryTimeout
            | ResponseStatus::MoreData
            | ResponseStatus::MemoryFull
            | ResponseStatus::NoTags => true,
            _ => false,
        }
    }
}

#[derive(PartialEq, Debug)]
struct Command {
    address: u8,
    command: CommandType,
    data: Vec<u8>,
}

impl Command {
    fn to_bytes(&self) -> Vec<u8> {
        let pkt_len = (self.data.len() + 4) as u8;
        let mut pkt: Vec<u8> = Vec::with_capacity(self.data.len() + 5);
        pkt.push(pkt_len);
        pkt.push(self.address);
        pkt.push(self.command.into());
        pkt.extend_from_slice(&self.data);
        let crc = crc(&pkt);
        pkt.push((crc & 0xFF) as u8);
        pkt.push(((crc >> 8) & 0xFF) as u8);
        pkt
    }
}

#[derive(PartialEq, Debug)]
struct Response {
    address: u8,
    command: u8,
    status: ResponseStatus,
    data: Vec<u8>,
}

impl Response {
    fn from_bytes(bytes: &[u8]) -> Result<Response> {
        if bytes.len() < 6 || bytes[0] as usize != bytes.len() - 1 {
            return Err(Error::Protocol(format!("bad frame length: {:?}", bytes)));
        }
        let body = bytes.len() - 2;
        let expected = crc(&bytes[..body]);
        let received = u16::from(bytes[body]) | (u16::from(bytes[body + 1]) << 8);
        if expected != received {
            return Err(Error::Protocol(format!(
                "checksum mismatch: expected 0x{:04X}, received 0x{:04X}",
                expected, received
            )));
        }
        let status = ResponseStatus::try_from(bytes[3])
            .map_err(|_| Error::Protocol(format!("unknown status 0x{:02X}", bytes[3])))?;
        Ok(Response {
            address: bytes[1],
            command: bytes[2],
            status,
            data: bytes[4..body].to_vec(),
        })
    }
}

fn crc(data: &[u8]) -> u16 {
    State::<MCRF4XX>::calculate(data)
}

#[derive(Deserialize)]
struct TagTrailer {
    xpc: u32,
    antenna: u8,
    rssi: i8,
}

impl TagTrailer {
    fn decode(bytes: &[u8]) -> Result<TagTrailer> {
        let trailer = bincode::DefaultOptions::new()
            .with_big_endian()
            .with_fixint_encoding()
            .deserialize(bytes)?;
        Ok(trailer)
    }
}

/// Byte stream the link runs over.
pub trait Transport: Read + Write {
    fn close(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Transport for serial::SystemPort {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub struct ReaderInformation {
    pub version: (u8, u8),
    pub reader_type: u8,
}

pub struct LinkReader<T: Transport> {
    port: T,
    address: u8,
    queue: VecDeque<TagRead>,
    inventory_active: bool,
    buffer_allocated: bool,
    round_pending: bool,
    read_index: u64,
}

impl LinkReader<TcpStream> {
    pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<LinkReader<TcpStream>> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(IO_TIMEOUT))?;
                    stream.set_write_timeout(Some(IO_TIMEOUT))?;
                    stream.set_nodelay(true)?;
                    return Ok(LinkReader::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::Program(format!("{} did not resolve to any address", host)),
        })
    }
}

impl LinkReader<serial::SystemPort> {
    pub fn open_serial(path: &str) -> Result<LinkReader<serial::SystemPort>> {
        let mut port = serial::open(path)?;
        port.reconfigure(&|settings| {
            settings.set_baud_rate(serial::Baud57600)?;
            settings.set_char_size(serial::Bits8);
            settings.set_parity(serial::ParityNone);
            settings.set_stop_bits(serial::Stop1);
            settings.set_flow_control(serial::FlowNone);
            Ok(())
        })
        .map_err(|e| format!("Failed to configure serial port: {}", e))?;

        port.set_timeout(IO_TIMEOUT)
            .map_err(|e| format!("Failed to set serial port timeout: {}", e))?;
        Ok(LinkReader::new(port))
    }
}

impl<T: Transport> LinkReader<T> {
    pub fn new(port: T) -> LinkReader<T> {
        LinkReader {
            port,
            address: BROADCAST_ADDRESS,
            queue: VecDeque::new(),
            inventory_active: false,
            buffer_allocated: false,
            round_pending: true,
            read_index: 0,
        }
    }

    fn send_receive(&mut self, cmd: &[u8]) -> Result<Vec<u8>> {
        debug!("link tx {:02X?}", cmd);
        self.port.write_all(cmd)?;
        self.port.flush()?;
        self.receive()
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let mut len = [0u8; 1];
        self.port.read_exact(&mut len)?;
        let len = len[0];
        let mut response: Vec<u8> = Vec::with_capacity(len as usize + 1);
        response.push(len);
        Read::by_ref(&mut self.port).take(u64::from(len)).read_to_end(&mut response)?;
        debug!("link rx {:02X?}", response);
        Ok(response)
    }

    fn execute(&mut self, command: CommandType, data: Vec<u8>) -> Result<Response> {
        let cmd = Command { address: self.address, command, data }.to_bytes();
        let bytes = self.send_receive(&cmd)?;
        let response = Response::from_bytes(&bytes)?;
        if response.command != u8::from(command) {
            return Err(Error::Protocol(format!(
                "response to command 0x{:02X} while waiting for {:?}",
                response.command, command
            )));
        }
        Ok(response)
    }

    pub fn reader_information(&mut self) -> Result<ReaderInformation> {
        let response = self.execute(CommandType::ReaderInformation, Vec::new())?;
        if response.status != ResponseStatus::Success {
            return Err(response.status.into());
        }
        self.address = response.address;
        let d = &response.data;
        if d.len() < 3 {
            return Err(Error::Protocol(format!("short reader information: {:?}", d)));
        }
        Ok(ReaderInformation {
            version: (d[0], d[1]),
            reader_type: d[2],
        })
    }

    fn inventory_round(&mut self) -> Result<()> {
        let mut response = self.execute(CommandType::Inventory, Vec::new())?;
        loop {
            if !response.status.is_inventory_ok() {
                return Err(response.status.into());
            }
            if response.status != ResponseStatus::NoTags {
                self.parse_inventory(&response.data)?;
            }
            if response.status != ResponseStatus::MoreData {
                return Ok(());
            }
            let bytes = self.receive()?;
            response = Response::from_bytes(&bytes)?;
        }
    }

    fn parse_inventory(&mut self, data: &[u8]) -> Result<()> {
        let (count, mut rest) = match data.split_first() {
            Some((count, rest)) => (*count, rest),
            None => return Ok(()),
        };
        for _ in 0..count {
            let (epc_len, tail) = rest
                .split_first()
                .ok_or_else(|| Error::Protocol("truncated inventory record".to_string()))?;
            let epc_len = *epc_len as usize;
            if tail.len() < epc_len + TRAILER_LEN {
                return Err(Error::Protocol("truncated inventory record".to_string()));
            }
            let trailer = TagTrailer::decode(&tail[epc_len..epc_len + TRAILER_LEN])?;
            self.read_index += 1;
            self.queue.push_back(TagRead {
                epc: tail[..epc_len].to_vec(),
                antenna_id: u16::from(trailer.antenna),
                peak_rssi: i16::from(trailer.rssi),
                xpc: trailer.xpc,
                read_index: self.read_index,
            });
            rest = &tail[epc_len + TRAILER_LEN..];
        }
        Ok(())
    }

    /// Word pointer for a byte offset; the link addresses at most 256 words.
    fn word_pointer(byte_offset: u16) -> Result<u8> {
        let word = byte_offset / 2;
        if word > 0xFF {
            return Err(Error::Program(format!(
                "byte offset 0x{:04X} is beyond the addressable words",
                byte_offset
            )));
        }
        Ok(word as u8)
    }

    fn epc_words(epc: &[u8]) -> Result<u8> {
        if epc.len() % 2 != 0 || epc.len() > 2 * 255 {
            return Err(Error::Program(format!("EPC of {} bytes is not addressable", epc.len())));
        }
        Ok((epc.len() / 2) as u8)
    }
}

impl<T: Transport> TagReader for LinkReader<T> {
    fn start_inventory(&mut self) -> Result<()> {
        let info = self.reader_information()?;
        info!(
            "reader v{}.{} type 0x{:02X} at address 0x{:02X}",
            info.version.0, info.version.1, info.reader_type, self.address
        );
        self.inventory_active = true;
        self.round_pending = true;
        Ok(())
    }

    fn allocate_read_buffer(&mut self) -> Result<()> {
        self.queue
            .try_reserve(READ_BUFFER_TAGS)
            .map_err(|e| Error::Program(format!("could not allocate read buffer: {}", e)))?;
        self.buffer_allocated = true;
        Ok(())
    }

    fn poll_next_read(&mut self) -> Result<Option<TagRead>> {
        if !self.inventory_active || !self.buffer_allocated {
            return Ok(None);
        }
        if self.queue.is_empty() {
            if !self.round_pending {
                self.round_pending = true;
                return Ok(None);
            }
            self.round_pending = false;
            self.inventory_round()?;
        }
        match self.queue.pop_front() {
            Some(read) => Ok(Some(read)),
            None => {
                self.round_pending = true;
                Ok(None)
            }
        }
    }

    fn stop_inventory(&mut self) -> Result<()> {
        if !self.inventory_active {
            return Err(Error::Program("inventory is not running".to_string()));
        }
        self.inventory_active = false;
        self.queue.clear();
        Ok(())
    }

    fn release_read_buffer(&mut self) {
        self.buffer_allocated = false;
        self.queue = VecDeque::new();
    }

    fn write_tag_field(&mut self, epc: &[u8], write: &TagWrite) -> Result<()> {
        if write.data.is_empty() || write.data.len() % 2 != 0 || write.data.len() > 2 * 255 {
            return Err(Error::Program(format!(
                "{}: write of {} bytes is not whole words",
                write.label,
                write.data.len()
            )));
        }
        let word_pointer = Self::word_pointer(write.byte_offset)?;
        let mut data = Vec::with_capacity(epc.len() + write.data.len() + 9);
        data.push((write.data.len() / 2) as u8);
        data.push(Self::epc_words(epc)?);
        data.extend_from_slice(epc);
        data.push(write.memory_bank.into());
        data.push(word_pointer);
        data.extend_from_slice(&write.data);
        data.extend_from_slice(&write.access_password.to_be_bytes());

        let response = self.execute(CommandType::WriteData, data)?;
        if response.status != ResponseStatus::Success {
            return Err(response.status.into());
        }
        Ok(())
    }

    fn read_tag_field(&mut self, epc: &[u8], read: &TagReadBack) -> Result<Vec<u8>> {
        let words = (usize::from(read.byte_count) + 1) / 2;
        if words == 0 || words > 255 {
            return Err(Error::Program(format!("cannot read {} bytes", read.byte_count)));
        }
        let word_pointer = Self::word_pointer(read.byte_offset)?;
        let mut data = Vec::with_capacity(epc.len() + 8);
        data.push(Self::epc_words(epc)?);
        data.extend_from_slice(epc);
        data.push(read.memory_bank.into());
        data.push(word_pointer);
        data.push(words as u8);
        data.extend_from_slice(&read.access_password.to_be_bytes());

        let response = self.execute(CommandType::ReadData, data)?;
        if response.status != ResponseStatus::Success {
            return Err(response.status.into());
        }
        let mut bytes = response.data;
        if bytes.len() < usize::from(read.byte_count) {
            return Err(Error::Protocol(format!(
                "read returned {} of {} bytes",
                bytes.len(),
                read.byte_count
            )));
        }
        bytes.truncate(usize::from(read.byte_count));
        Ok(bytes)
    }

    fn disconnect(&mut self) -> Result<()> {
        self.port.flush()?;
        self.port.close()?;
        Ok(())
    }
}
