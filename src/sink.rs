//! Where observations go: a console line and an append-only CSV row.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::config::CsvLayout;
use crate::error::Result;
use crate::sensor::SensorWord;

#[derive(Clone, PartialEq, Debug)]
pub struct SensorObservation {
    pub timestamp_ms: u64,
    pub epc_hex: String,
    pub sensor: SensorWord,
    pub antenna_id: u16,
    pub peak_rssi: i16,
    pub sequence: u64,
}

impl SensorObservation {
    pub fn console_line(&self, layout: CsvLayout) -> String {
        match layout {
            CsvLayout::Sensor => format!(
                "{} | EPC: {} | xpc_w2: 0x{:04X} | error: {} | C_sense: {:.2} | Antenna: {} | RSSI: {} dBm | Count: {}",
                self.timestamp_ms,
                self.epc_hex,
                self.sensor.status_word,
                self.sensor.error_flag.as_char(),
                self.sensor.sensor_value,
                self.antenna_id,
                self.peak_rssi,
                self.sequence
            ),
            CsvLayout::Plain => format!(
                "{} | EPC: {} | Antenna: {} | RSSI: {} dBm",
                self.timestamp_ms, self.epc_hex, self.antenna_id, self.peak_rssi
            ),
        }
    }

    pub fn csv_row(&self, layout: CsvLayout) -> String {
        match layout {
            CsvLayout::Sensor => format!(
                "{},{},0x{:04X},{},{:.2},{},{},{}",
                self.timestamp_ms,
                self.epc_hex,
                self.sensor.status_word,
                self.sensor.error_flag.as_char(),
                self.sensor.sensor_value,
                self.antenna_id,
                self.peak_rssi,
                self.sequence
            ),
            CsvLayout::Plain => format!(
                "{},{},{},{}",
                self.timestamp_ms, self.epc_hex, self.antenna_id, self.peak_rssi
            ),
        }
    }
}

pub fn csv_header(layout: CsvLayout) -> &'static str {
    match layout {
        CsvLayout::Sensor => "timestamp,epc,xpc_w2,error,C_sense,antenna,rssi,contador",
        CsvLayout::Plain => "timestamp,epc,antenna,rssi",
    }
}

pub trait ObservationSink {
    fn emit(&mut self, observation: &SensorObservation) -> Result<()>;
}

impl<'a, S: ObservationSink + ?Sized> ObservationSink for &'a mut S {
    fn emit(&mut self, observation: &SensorObservation) -> Result<()> {
        (**self).emit(observation)
    }
}

impl ObservationSink for Vec<SensorObservation> {
    fn emit(&mut self, observation: &SensorObservation) -> Result<()> {
        self.push(observation.clone());
        Ok(())
    }
}

/// Prints each observation and appends it to a CSV stream, flushing every row.
pub struct CsvSink<W: Write> {
    out: W,
    layout: CsvLayout,
    echo: bool,
}

impl CsvSink<std::fs::File> {
    /// Opens `path` for appending; the header is written only into an empty file.
    pub fn open<P: AsRef<Path>>(path: P, layout: CsvLayout) -> Result<CsvSink<std::fs::File>> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        let empty = file.metadata()?.len() == 0;
        CsvSink::new(file, layout, empty)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(mut out: W, layout: CsvLayout, write_header: bool) -> Result<CsvSink<W>> {
        if write_header {
            writeln!(out, "{}", csv_header(layout))?;
            out.flush()?;
        }
        Ok(CsvSink { out, layout, echo: true })
    }

    /// Stop echoing observations to stdout.
    pub fn quiet(mut self) -> CsvSink<W> {
        self.echo = false;
        self
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write> ObservationSink for CsvSink<W> {
    fn emit(&mut self, observation: &SensorObservation) -> Result<()> {
        if self.echo {
            println!("{}", observation.console_line(self.layout));
        }
        writeln!(self.out, "{}", observation.csv_row(self.layout))?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor;
    use std::fs;

    fn observation(sequence: u64) -> SensorObservation {
        SensorObservation {
            timestamp_ms: 1_700_000_000_123,
            epc_hex: "E280B1200000000000001234".to_string(),
            sensor: sensor::decode(0x0201_0000),
            antenna_id: 1,
            peak_rssi: -52,
            sequence,
        }
    }

    #[test]
    fn test_rows() {
        let obs = observation(7);
        assert_eq!(
            obs.csv_row(CsvLayout::Sensor),
            "1700000000123,E280B1200000000000001234,0x0201,1,-95.85,1,-52,7"
        );
        assert_eq!(
            obs.csv_row(CsvLayout::Plain),
            "1700000000123,E280B1200000000000001234,1,-52"
        );
        assert_eq!(
            obs.console_line(CsvLayout::Plain),
            "1700000000123 | EPC: E280B1200000000000001234 | Antenna: 1 | RSSI: -52 dBm"
        );
        assert!(obs.console_line(CsvLayout::Sensor).ends_with("| Count: 7"));
    }

    #[test]
    fn test_writer_sink() {
        let mut sink = CsvSink::new(Vec::new(), CsvLayout::Plain, true).unwrap().quiet();
        sink.emit(&observation(1)).unwrap();
        let text = String::from_utf8(sink.get_ref().clone()).unwrap();
        assert_eq!(
            text,
            "timestamp,epc,antenna,rssi\n1700000000123,E280B1200000000000001234,1,-52\n"
        );
    }

    #[test]
    fn test_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taglog.csv");
        {
            let mut sink = CsvSink::open(&path, CsvLayout::Sensor).unwrap().quiet();
            sink.emit(&observation(1)).unwrap();
        }
        {
            let mut sink = CsvSink::open(&path, CsvLayout::Sensor).unwrap().quiet();
            sink.emit(&observation(1)).unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], csv_header(CsvLayout::Sensor));
    }
}
