//! A bounded inventory session: connect, poll, filter, decode, log, disconnect.

use std::thread;
use std::time::Duration;

use failure::Fail;
use log::{debug, error, info, warn};

use crate::clock::SessionClock;
use crate::config::SessionConfig;
use crate::epc::{self, EPC_HEX_CAPACITY};
use crate::error::{Error, Result};
use crate::reader::{TagRead, TagReader};
use crate::sensor;
use crate::sink::{ObservationSink, SensorObservation};

/// Log target of confirmed tag writes; the binary tags these lines `[OK]`.
pub const OK_TARGET: &str = "xpclog::ok";

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionState {
    Idle,
    Connected,
    Inventorying,
    Stopped,
    Disconnected,
    Failed,
}

/// Fatal session failures, one per point where the run can abort.
#[derive(Debug, Fail)]
pub enum SessionError {
    #[fail(display = "could not connect to reader: {}", _0)]
    Connect(#[cause] Error),
    #[fail(display = "could not start inventory: {}", _0)]
    InventoryStart(#[cause] Error),
    #[fail(display = "could not allocate read buffer: {}", _0)]
    Allocation(#[cause] Error),
    #[fail(display = "disconnect failed: {}", _0)]
    Disconnect(#[cause] Error),
}

impl SessionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Connect(_) => 1,
            SessionError::InventoryStart(_) => 2,
            SessionError::Allocation(_) => 3,
            SessionError::Disconnect(_) => 4,
        }
    }
}

#[derive(Clone, Default, PartialEq, Debug)]
pub struct SessionReport {
    pub observations: u64,
    pub total_reads: u64,
    pub writes_ok: u32,
    pub writes_failed: u32,
    pub stop_warning: bool,
}

/// Lets the tag write sequence run once per session.
#[derive(Default, Debug)]
struct WriteOnceGuard {
    done: bool,
}

impl WriteOnceGuard {
    /// True the first time only.
    fn claim(&mut self) -> bool {
        !std::mem::replace(&mut self.done, true)
    }
}

/// Owns a connected reader and undoes whatever is still open when dropped:
/// stop inventory, release the read buffer, disconnect.
struct ReaderLease<R: TagReader> {
    reader: R,
    inventory: bool,
    buffer: bool,
    connected: bool,
}

impl<R: TagReader> ReaderLease<R> {
    fn new(reader: R) -> ReaderLease<R> {
        ReaderLease {
            reader,
            inventory: false,
            buffer: false,
            connected: true,
        }
    }

    fn stop_inventory(&mut self) -> Result<()> {
        self.inventory = false;
        self.reader.stop_inventory()
    }

    fn release_read_buffer(&mut self) {
        if self.buffer {
            self.buffer = false;
            self.reader.release_read_buffer();
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.reader.disconnect()
    }
}

impl<R: TagReader> Drop for ReaderLease<R> {
    fn drop(&mut self) {
        if self.inventory {
            if let Err(e) = self.stop_inventory() {
                warn!("stop inventory during cleanup: {}", e);
            }
        }
        self.release_read_buffer();
        if self.connected {
            if let Err(e) = self.disconnect() {
                warn!("disconnect during cleanup: {}", e);
            }
        }
    }
}

pub struct PollingSession<S: ObservationSink> {
    config: SessionConfig,
    sink: S,
    state: SessionState,
    sequence: u64,
    write_guard: WriteOnceGuard,
    report: SessionReport,
}

impl<S: ObservationSink> PollingSession<S> {
    pub fn new(config: SessionConfig, sink: S) -> PollingSession<S> {
        PollingSession {
            config,
            sink,
            state: SessionState::Idle,
            sequence: 0,
            write_guard: WriteOnceGuard::default(),
            report: SessionReport::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn enter(&mut self, state: SessionState) {
        debug!("session {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs the whole session against the reader produced by `connect`.
    ///
    /// The reader is released on every path. Failures before polling starts
    /// abort the run; failures while polling are logged and the run goes on.
    pub fn run<R, C>(&mut self, connect: C) -> std::result::Result<SessionReport, SessionError>
    where
        R: TagReader,
        C: FnOnce(&SessionConfig) -> Result<R>,
    {
        let reader = match connect(&self.config) {
            Ok(reader) => reader,
            Err(e) => {
                self.enter(SessionState::Failed);
                return Err(SessionError::Connect(e));
            }
        };
        let mut lease = ReaderLease::new(reader);
        self.enter(SessionState::Connected);
        info!("connected to {}", self.config.endpoint);

        if let Err(e) = lease.reader.start_inventory() {
            self.enter(SessionState::Failed);
            return Err(SessionError::InventoryStart(e));
        }
        lease.inventory = true;

        if let Err(e) = lease.reader.allocate_read_buffer() {
            self.enter(SessionState::Failed);
            return Err(SessionError::Allocation(e));
        }
        lease.buffer = true;

        self.enter(SessionState::Inventorying);
        info!("inventory started, present a tag to the antenna");
        self.poll_loop(&mut lease.reader);

        if let Err(e) = lease.stop_inventory() {
            warn!("stop inventory: {}", e);
            self.report.stop_warning = true;
        }
        self.enter(SessionState::Stopped);

        lease.release_read_buffer();
        if let Err(e) = lease.disconnect() {
            self.enter(SessionState::Failed);
            return Err(SessionError::Disconnect(e));
        }
        self.enter(SessionState::Disconnected);
        info!("disconnected, total tags seen: {}", self.report.total_reads);
        Ok(self.report.clone())
    }

    fn poll_loop<R: TagReader>(&mut self, reader: &mut R) {
        let clock = SessionClock::start();
        let duration_ms = self.config.session_duration_ms;

        while clock.elapsed_ms() < duration_ms {
            let mut drained = 0u64;
            loop {
                match reader.poll_next_read() {
                    Ok(Some(read)) => {
                        drained += 1;
                        self.handle_read(reader, &clock, read);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("drain ended: {}", e);
                        break;
                    }
                }
                if clock.elapsed_ms() >= duration_ms {
                    break;
                }
            }

            if drained == 0 {
                let remaining = duration_ms.saturating_sub(clock.elapsed_ms());
                let pause = self.config.idle_sleep_ms.min(remaining);
                if pause > 0 {
                    thread::sleep(Duration::from_millis(pause));
                }
            } else {
                debug!("drained {} reads", drained);
            }
        }
    }

    fn handle_read<R: TagReader>(&mut self, reader: &mut R, clock: &SessionClock, read: TagRead) {
        self.report.total_reads += 1;
        let epc_hex = epc::encode(&read.epc, EPC_HEX_CAPACITY);
        if !self.config.matches(&epc_hex) {
            return;
        }

        if self.config.has_tag_ops() && self.write_guard.claim() {
            self.run_tag_ops(reader, &read.epc);
        }

        self.sequence += 1;
        let observation = SensorObservation {
            timestamp_ms: clock.now_ms(),
            epc_hex,
            sensor: sensor::decode(read.xpc),
            antenna_id: read.antenna_id,
            peak_rssi: read.peak_rssi,
            sequence: self.sequence,
        };
        self.report.observations += 1;
        if let Err(e) = self.sink.emit(&observation) {
            error!("could not log read #{}: {}", observation.sequence, e);
        }
    }

    fn run_tag_ops<R: TagReader>(&mut self, reader: &mut R, epc: &[u8]) {
        for write in &self.config.writes {
            match reader.write_tag_field(epc, write) {
                Ok(()) => {
                    self.report.writes_ok += 1;
                    info!(
                        target: OK_TARGET,
                        "{} ({}) written at 0x{:04X}",
                        write.label,
                        epc::encode_all(&write.data),
                        write.byte_offset
                    );
                }
                Err(e) => {
                    self.report.writes_failed += 1;
                    error!("write {} failed: {}", write.label, e);
                }
            }
        }

        if let Some(read_back) = &self.config.read_back {
            match reader.read_tag_field(epc, read_back) {
                Ok(data) => info!(
                    "read {:?} at 0x{:04X}: {}",
                    read_back.memory_bank,
                    read_back.byte_offset,
                    epc::encode_all(&data)
                ),
                Err(e) => warn!("read back failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CsvLayout;
    use crate::mock::{MockCall, MockOp, MockReader};
    use crate::reader::{MemoryBank, TagReadBack};
    use crate::sink::CsvSink;
    use std::fs;
    use std::time::Instant;

    const TARGET: &str = "E280B1200000000000001234";

    fn target_config(duration_ms: u64) -> SessionConfig {
        SessionConfig::target("reader", TARGET, duration_ms)
            .unwrap()
            .with_idle_sleep_ms(5)
    }

    fn target_epc() -> Vec<u8> {
        epc::decode(TARGET).unwrap()
    }

    fn other_epc() -> Vec<u8> {
        epc::decode("300833B2DDD9014000000000").unwrap()
    }

    #[test]
    fn test_write_once_guard() {
        let mut guard = WriteOnceGuard::default();
        assert!(guard.claim());
        assert!(!guard.claim());
        assert!(!guard.claim());
    }

    #[test]
    fn test_end_to_end_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taglog.csv");
        let config = SessionConfig::target("reader", TARGET, 2000)
            .unwrap()
            .with_output(&path);

        let mut reader = MockReader::new();
        reader.push_batch(vec![
            (target_epc(), 1, -50, 0x0000_0000),
            (other_epc(), 1, -60, 0),
            (target_epc(), 1, -51, 0x0201_0000),
        ]);
        reader.push_read(other_epc(), 0);
        reader.push_read(target_epc(), 0x0C80_0000);

        let sink = CsvSink::open(&config.output, config.layout).unwrap().quiet();
        let mut session = PollingSession::new(config, sink);
        let report = session.run(|_| Ok(&mut reader)).unwrap();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(report.observations, 3);
        assert_eq!(report.total_reads, 5);
        assert_eq!(report.writes_ok, 2);
        assert_eq!(reader.writes().len(), 2);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,epc,xpc_w2,error,C_sense,antenna,rssi,contador");
        for (i, line) in lines[1..].iter().enumerate() {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields[1], TARGET);
            assert_eq!(fields[7], (i + 1).to_string());
        }
        assert!(lines[1].contains(",0x0000,1,-19.20,"));
        assert!(lines[2].contains(",0x0201,1,-95.85,"));
        assert!(lines[3].contains(",0x0C80,0,0.00,"));
    }

    #[test]
    fn test_sequence_numbers() {
        let mut reader = MockReader::new();
        for i in 0..10u32 {
            reader.push_read(target_epc(), i << 16);
            if i % 2 == 0 {
                reader.push_read(other_epc(), 0);
            }
        }
        let mut observed: Vec<SensorObservation> = Vec::new();
        PollingSession::new(target_config(300), &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();

        let sequences: Vec<u64> = observed.iter().map(|o| o.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());
        assert!(observed.iter().all(|o| o.epc_hex == TARGET));
    }

    #[test]
    fn test_writes_run_once() {
        let mut reader = MockReader::new();
        for _ in 0..5 {
            reader.push_read(target_epc(), 0);
            reader.push_batch(Vec::new());
        }
        let mut observed: Vec<SensorObservation> = Vec::new();
        PollingSession::new(target_config(300), &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();

        assert_eq!(observed.len(), 5);
        let writes = reader.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].label, "SYSTEM CONFIG WORD");
        assert_eq!(writes[0].byte_offset, 0x0120);
        assert_eq!(writes[1].label, "SENSOR CONTROL WORD");
        assert_eq!(writes[1].byte_offset, 0x0123);
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let mut reader = MockReader::new();
        reader.fail_on(MockOp::Write);
        reader.push_read(target_epc(), 0);
        reader.push_read(target_epc(), 0);
        let mut observed: Vec<SensorObservation> = Vec::new();
        let report = PollingSession::new(target_config(200), &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();

        assert_eq!(report.writes_failed, 2);
        assert_eq!(report.writes_ok, 0);
        // attempted once even though it failed
        assert_eq!(reader.writes().len(), 2);
        assert_eq!(observed.len(), 2);
    }

    #[test]
    fn test_read_back_after_writes() {
        let mut reader = MockReader::new();
        reader.set_read_back_data(vec![0xBE, 0xEF, 0x00, 0x01]);
        reader.push_read(target_epc(), 0);
        let read_back = TagReadBack {
            memory_bank: MemoryBank::User,
            byte_offset: 0x0124,
            byte_count: 4,
            access_password: 0,
        };
        let config = target_config(150).with_read_back(read_back.clone());
        let mut observed: Vec<SensorObservation> = Vec::new();
        PollingSession::new(config, &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();

        let ops: Vec<&MockCall> = reader
            .calls()
            .iter()
            .filter(|c| match c {
                MockCall::Write { .. } | MockCall::Read { .. } => true,
                _ => false,
            })
            .collect();
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[2],
            &MockCall::Read {
                epc: target_epc(),
                read: read_back
            }
        );
    }

    #[test]
    fn test_prefix_mode_skips_writes() {
        let mut reader = MockReader::new();
        reader.push_batch(vec![
            (target_epc(), 1, -50, 0),
            (other_epc(), 2, -60, 0),
            (epc::decode("E280B120FFFF").unwrap(), 3, -70, 0),
        ]);
        let config = SessionConfig::prefix_filter("reader", "E280B120", 150)
            .unwrap()
            .with_writes(SessionConfig::default_writes())
            .with_idle_sleep_ms(5);
        assert_eq!(config.layout, CsvLayout::Plain);
        let mut observed: Vec<SensorObservation> = Vec::new();
        let report = PollingSession::new(config, &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();

        assert_eq!(report.total_reads, 3);
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[1].epc_hex, "E280B120FFFF");
        assert!(reader.writes().is_empty());
    }

    #[test]
    fn test_duration_bound() {
        let mut reader = MockReader::new();
        for _ in 0..2000 {
            reader.push_read(other_epc(), 0);
        }
        let mut observed: Vec<SensorObservation> = Vec::new();
        let config = target_config(200).with_idle_sleep_ms(50);
        let started = Instant::now();
        PollingSession::new(config, &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();
        let elapsed = started.elapsed().as_millis();
        assert!(elapsed >= 200);
        assert!(elapsed < 200 + 50 + 200, "took {} ms", elapsed);
    }

    #[test]
    fn test_idle_sleep_between_empty_drains() {
        let mut reader = MockReader::new();
        let mut observed: Vec<SensorObservation> = Vec::new();
        let config = target_config(200).with_idle_sleep_ms(50);
        PollingSession::new(config, &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();
        // one poll per empty drain, roughly 200 / 50 of them
        assert!(reader.polls() >= 3 && reader.polls() <= 6, "{} polls", reader.polls());
    }

    #[test]
    fn test_connect_failure() {
        let mut observed: Vec<SensorObservation> = Vec::new();
        let mut session = PollingSession::new(target_config(100), &mut observed);
        let err = session
            .run(|_| -> Result<MockReader> { Err(Error::Program("unreachable".to_string())) })
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_inventory_start_failure_disconnects() {
        let mut reader = MockReader::new();
        reader.fail_on(MockOp::StartInventory);
        let mut observed: Vec<SensorObservation> = Vec::new();
        let mut session = PollingSession::new(target_config(100), &mut observed);
        let err = session.run(|_| Ok(&mut reader)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(session.state(), SessionState::Failed);
        drop(session);
        assert_eq!(reader.calls(), &[MockCall::StartInventory, MockCall::Disconnect]);
    }

    #[test]
    fn test_allocation_failure_stops_and_disconnects() {
        let mut reader = MockReader::new();
        reader.fail_on(MockOp::AllocateReadBuffer);
        let mut observed: Vec<SensorObservation> = Vec::new();
        let err = PollingSession::new(target_config(100), &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(
            reader.calls(),
            &[
                MockCall::StartInventory,
                MockCall::AllocateReadBuffer,
                MockCall::StopInventory,
                MockCall::Disconnect
            ]
        );
    }

    #[test]
    fn test_stop_failure_is_warning() {
        let mut reader = MockReader::new();
        reader.fail_on(MockOp::StopInventory);
        let mut observed: Vec<SensorObservation> = Vec::new();
        let mut session = PollingSession::new(target_config(50), &mut observed);
        let report = session.run(|_| Ok(&mut reader)).unwrap();
        assert!(report.stop_warning);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_disconnect_failure() {
        let mut reader = MockReader::new();
        reader.fail_on(MockOp::Disconnect);
        reader.push_read(target_epc(), 0);
        let mut observed: Vec<SensorObservation> = Vec::new();
        let mut session = PollingSession::new(target_config(100), &mut observed);
        let err = session.run(|_| Ok(&mut reader)).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(session.state(), SessionState::Failed);
        drop(session);
        // already-logged data survives
        assert_eq!(observed.len(), 1);
        let tail: Vec<&MockCall> = reader.calls().iter().rev().take(3).collect();
        assert_eq!(
            tail,
            vec![
                &MockCall::Disconnect,
                &MockCall::ReleaseReadBuffer,
                &MockCall::StopInventory
            ]
        );
        // the lease did not disconnect a second time
        let disconnects = reader
            .calls()
            .iter()
            .filter(|c| **c == MockCall::Disconnect)
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_poll_error_ends_drain() {
        let mut reader = MockReader::new();
        reader.fail_on(MockOp::Poll);
        let mut observed: Vec<SensorObservation> = Vec::new();
        let report = PollingSession::new(target_config(60), &mut observed)
            .run(|_| Ok(&mut reader))
            .unwrap();
        assert_eq!(report.total_reads, 0);
        assert!(reader.polls() > 0);
    }
}
