//! Inventory logging for UHF RFID sensor tags.
//!
//! A [`PollingSession`] drives a [`TagReader`] for a fixed time, keeps the reads
//! that match the configured EPC prefix or target, decodes the sensor word from
//! each read's XPC and hands the result to an [`ObservationSink`].

pub mod clock;
pub mod config;
pub mod epc;
pub mod error;
pub mod link;
pub mod mock;
pub mod reader;
pub mod sensor;
pub mod session;
pub mod sink;

pub use crate::config::{ConfigOverrides, CsvLayout, Endpoint, SessionConfig};
pub use crate::error::{Error, Result};
pub use crate::link::LinkReader;
pub use crate::mock::MockReader;
pub use crate::reader::{MemoryBank, TagRead, TagReadBack, TagReader, TagWrite};
pub use crate::sensor::{ErrorFlag, SensorWord};
pub use crate::session::{PollingSession, SessionError, SessionReport, SessionState};
pub use crate::sink::{CsvSink, ObservationSink, SensorObservation};
