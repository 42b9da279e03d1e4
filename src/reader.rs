//! The reader seam: what a polling session needs from an RFID reader.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One tag report as delivered by the reader.
#[derive(Clone, PartialEq, Debug)]
pub struct TagRead {
    pub epc: Vec<u8>,
    pub antenna_id: u16,
    /// Peak RSSI in dBm.
    pub peak_rssi: i16,
    pub xpc: u32,
    pub read_index: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MemoryBank {
    Reserved = 0x00,
    Epc = 0x01,
    Tid = 0x02,
    User = 0x03,
}

/// A write of `data` into tag memory, issued once per session.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TagWrite {
    pub label: String,
    pub memory_bank: MemoryBank,
    pub byte_offset: u16,
    #[serde(default)]
    pub access_password: u32,
    pub data: Vec<u8>,
}

impl TagWrite {
    /// A single big-endian word written to user memory with a zero password.
    pub fn user_word(label: &str, byte_offset: u16, word: u16) -> TagWrite {
        TagWrite {
            label: label.to_string(),
            memory_bank: MemoryBank::User,
            byte_offset,
            access_password: 0,
            data: word.to_be_bytes().to_vec(),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TagReadBack {
    pub memory_bank: MemoryBank,
    pub byte_offset: u16,
    pub byte_count: u16,
    #[serde(default)]
    pub access_password: u32,
}

/// Operations a connected reader offers to a polling session.
///
/// Connecting is not part of the trait; the session is handed a connector
/// and owns the reader from then on.
pub trait TagReader {
    fn start_inventory(&mut self) -> Result<()>;

    fn allocate_read_buffer(&mut self) -> Result<()>;

    /// Next buffered tag report, or `None` once the reader has nothing more to
    /// hand out for now.
    fn poll_next_read(&mut self) -> Result<Option<TagRead>>;

    fn stop_inventory(&mut self) -> Result<()>;

    fn release_read_buffer(&mut self);

    fn write_tag_field(&mut self, epc: &[u8], write: &TagWrite) -> Result<()>;

    fn read_tag_field(&mut self, epc: &[u8], read: &TagReadBack) -> Result<Vec<u8>>;

    fn disconnect(&mut self) -> Result<()>;
}

macro_rules! forward_tag_reader {
    () => {
        fn start_inventory(&mut self) -> Result<()> {
            (**self).start_inventory()
        }

        fn allocate_read_buffer(&mut self) -> Result<()> {
            (**self).allocate_read_buffer()
        }

        fn poll_next_read(&mut self) -> Result<Option<TagRead>> {
            (**self).poll_next_read()
        }

        fn stop_inventory(&mut self) -> Result<()> {
            (**self).stop_inventory()
        }

        fn release_read_buffer(&mut self) {
            (**self).release_read_buffer()
        }

        fn write_tag_field(&mut self, epc: &[u8], write: &TagWrite) -> Result<()> {
            (**self).write_tag_field(epc, write)
        }

        fn read_tag_field(&mut self, epc: &[u8], read: &TagReadBack) -> Result<Vec<u8>> {
            (**self).read_tag_field(epc, read)
        }

        fn disconnect(&mut self) -> Result<()> {
            (**self).disconnect()
        }
    };
}

impl<'a, R: TagReader + ?Sized> TagReader for &'a mut R {
    forward_tag_reader!();
}

impl<R: TagReader + ?Sized> TagReader for Box<R> {
    forward_tag_reader!();
}
