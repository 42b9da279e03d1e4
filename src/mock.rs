//! Scripted reader for tests and `--simulate` runs.

use std::collections::{HashSet, VecDeque};

use crate::epc;
use crate::error::{Error, Result};
use crate::reader::{TagRead, TagReadBack, TagReader, TagWrite};

/// Reader operation a [`MockReader`] can be told to fail.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MockOp {
    StartInventory,
    AllocateReadBuffer,
    Poll,
    StopInventory,
    Write,
    Read,
    Disconnect,
}

#[derive(Clone, PartialEq, Debug)]
pub enum MockCall {
    StartInventory,
    AllocateReadBuffer,
    StopInventory,
    ReleaseReadBuffer,
    Write { epc: Vec<u8>, write: TagWrite },
    Read { epc: Vec<u8>, read: TagReadBack },
    Disconnect,
}

/// Hands out reads in batches: each batch is one drain, after which the
/// reader reports nothing until the next poll starts a new drain.
#[derive(Default)]
pub struct MockReader {
    batches: VecDeque<Vec<TagRead>>,
    current: VecDeque<TagRead>,
    in_drain: bool,
    failing: HashSet<MockOp>,
    read_back_data: Vec<u8>,
    calls: Vec<MockCall>,
    read_index: u64,
    polls: u64,
}

impl MockReader {
    pub fn new() -> MockReader {
        MockReader::default()
    }

    /// Seeded reader used by `--simulate`: the target tag with a drifting
    /// sensor word and a neighbour tag, separated by quiet drains.
    pub fn demo(target: &str) -> Result<MockReader> {
        let target = epc::decode(target)?;
        let neighbour = epc::decode("300833B2DDD9014000000000")?;
        let mut reader = MockReader::new();
        for i in 0..120u32 {
            let raw = (160 + (i % 40)) & 0x3FF;
            let flags = if i % 17 == 16 { 0x0C00 } else { 0 };
            let xpc = (flags | raw) << 16;
            let mut batch = vec![(target.clone(), 1, -48 - (i % 7) as i16, xpc)];
            if i % 3 == 0 {
                batch.push((neighbour.clone(), 2, -66, 0));
            }
            reader.push_batch(batch);
            reader.push_batch(Vec::new());
        }
        Ok(reader)
    }

    pub fn push_batch<I>(&mut self, reads: I)
    where
        I: IntoIterator<Item = (Vec<u8>, u16, i16, u32)>,
    {
        let mut batch = Vec::new();
        for (epc, antenna_id, peak_rssi, xpc) in reads {
            self.read_index += 1;
            batch.push(TagRead {
                epc,
                antenna_id,
                peak_rssi,
                xpc,
                read_index: self.read_index,
            });
        }
        self.batches.push_back(batch);
    }

    pub fn push_read(&mut self, epc: Vec<u8>, xpc: u32) {
        self.push_batch(vec![(epc, 1, -55, xpc)]);
    }

    pub fn fail_on(&mut self, op: MockOp) {
        self.failing.insert(op);
    }

    pub fn set_read_back_data(&mut self, data: Vec<u8>) {
        self.read_back_data = data;
    }

    pub fn calls(&self) -> &[MockCall] {
        &self.calls
    }

    pub fn writes(&self) -> Vec<&TagWrite> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Write { write, .. } => Some(write),
                _ => None,
            })
            .collect()
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn pending_batches(&self) -> usize {
        self.batches.len()
    }

    fn check(&self, op: MockOp) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(Error::Program(format!("simulated {:?} failure", op)));
        }
        Ok(())
    }
}

impl TagReader for MockReader {
    fn start_inventory(&mut self) -> Result<()> {
        self.calls.push(MockCall::StartInventory);
        self.check(MockOp::StartInventory)
    }

    fn allocate_read_buffer(&mut self) -> Result<()> {
        self.calls.push(MockCall::AllocateReadBuffer);
        self.check(MockOp::AllocateReadBuffer)
    }

    fn poll_next_read(&mut self) -> Result<Option<TagRead>> {
        self.polls += 1;
        self.check(MockOp::Poll)?;
        if self.current.is_empty() && !self.in_drain {
            if let Some(batch) = self.batches.pop_front() {
                self.current = batch.into();
            }
        }
        match self.current.pop_front() {
            Some(read) => {
                self.in_drain = true;
                Ok(Some(read))
            }
            None => {
                self.in_drain = false;
                Ok(None)
            }
        }
    }

    fn stop_inventory(&mut self) -> Result<()> {
        self.calls.push(MockCall::StopInventory);
        self.check(MockOp::StopInventory)
    }

    fn release_read_buffer(&mut self) {
        self.calls.push(MockCall::ReleaseReadBuffer);
    }

    fn write_tag_field(&mut self, epc: &[u8], write: &TagWrite) -> Result<()> {
        self.calls.push(MockCall::Write {
            epc: epc.to_vec(),
            write: write.clone(),
        });
        self.check(MockOp::Write)
    }

    fn read_tag_field(&mut self, epc: &[u8], read: &TagReadBack) -> Result<Vec<u8>> {
        self.calls.push(MockCall::Read {
            epc: epc.to_vec(),
            read: read.clone(),
        });
        self.check(MockOp::Read)?;
        let mut data = self.read_back_data.clone();
        data.resize(usize::from(read.byte_count), 0);
        Ok(data)
    }

    fn disconnect(&mut self) -> Result<()> {
        self.calls.push(MockCall::Disconnect);
        self.check(MockOp::Disconnect)
    }
}
