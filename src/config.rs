//! Session configuration, built once from the command line.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::epc;
use crate::error::{Error, Result};
use crate::reader::{TagReadBack, TagWrite};

/// LLRP port the reader listens on.
pub const READER_PORT: u16 = 5084;
pub const CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_DURATION_SECS: u64 = 10;
/// Pause after a drain that produced nothing.
pub const IDLE_SLEEP_MS: u64 = 50;
pub const DEFAULT_PREFIX: &str = "E280B120";
pub const SENSOR_LOG: &str = "taglog.csv";
pub const PREFIX_LOG: &str = "tags_prefix.csv";

#[derive(Clone, PartialEq, Debug)]
pub enum Endpoint {
    Tcp(String),
    Serial(String),
}

impl Endpoint {
    /// `/dev/...` and `COMn` name a serial line, anything else a network host.
    pub fn parse(host: &str) -> Endpoint {
        let upper = host.to_ascii_uppercase();
        let is_com = upper.starts_with("COM")
            && upper.len() > 3
            && upper[3..].chars().all(|c| c.is_ascii_digit());
        if host.starts_with("/dev/") || is_com {
            Endpoint::Serial(host.to_string())
        } else {
            Endpoint::Tcp(host.to_string())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(host) => write!(f, "{}:{}", host, READER_PORT),
            Endpoint::Serial(path) => write!(f, "{}", path),
        }
    }
}

/// Columns of the CSV log.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CsvLayout {
    /// `timestamp,epc,xpc_w2,error,C_sense,antenna,rssi,contador`
    Sensor,
    /// `timestamp,epc,antenna,rssi`
    Plain,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub session_duration_ms: u64,
    pub epc_prefix_filter: Option<String>,
    pub epc_exact_target: Option<String>,
    pub writes: Vec<TagWrite>,
    pub read_back: Option<TagReadBack>,
    pub idle_sleep_ms: u64,
    pub output: PathBuf,
    pub layout: CsvLayout,
}

impl SessionConfig {
    /// Decode-and-configure mode: one sensor tag, written once, every read decoded.
    pub fn target(host: &str, target_epc: &str, duration_ms: u64) -> Result<SessionConfig> {
        let target = epc::normalize_epc(target_epc)?;
        if target.is_empty() {
            return Err(Error::Config("target EPC is empty".to_string()));
        }
        Ok(SessionConfig {
            epc_exact_target: Some(target),
            writes: SessionConfig::default_writes(),
            output: PathBuf::from(SENSOR_LOG),
            layout: CsvLayout::Sensor,
            ..SessionConfig::base(host, duration_ms)
        })
    }

    /// Filter-only mode: every tag whose EPC starts with `prefix` is logged.
    pub fn prefix_filter(host: &str, prefix: &str, duration_ms: u64) -> Result<SessionConfig> {
        Ok(SessionConfig {
            epc_prefix_filter: Some(epc::normalize_epc(prefix)?),
            output: PathBuf::from(PREFIX_LOG),
            layout: CsvLayout::Plain,
            ..SessionConfig::base(host, duration_ms)
        })
    }

    fn base(host: &str, duration_ms: u64) -> SessionConfig {
        SessionConfig {
            endpoint: Endpoint::parse(host),
            port: READER_PORT,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            session_duration_ms: duration_ms,
            epc_prefix_filter: None,
            epc_exact_target: None,
            writes: Vec::new(),
            read_back: None,
            idle_sleep_ms: IDLE_SLEEP_MS,
            output: PathBuf::new(),
            layout: CsvLayout::Plain,
        }
    }

    /// System configuration word, then sensor control word, into user memory.
    pub fn default_writes() -> Vec<TagWrite> {
        vec![
            TagWrite::user_word("SYSTEM CONFIG WORD", 0x0120, 0x1390),
            TagWrite::user_word("SENSOR CONTROL WORD", 0x0123, 0x2000),
        ]
    }

    /// Seconds from the command line; missing, non-numeric or zero means the default.
    pub fn duration_ms_from_arg(arg: Option<&str>) -> u64 {
        let secs = match arg.map(|a| a.trim().parse::<u64>()) {
            Some(Ok(secs)) if secs > 0 => secs,
            _ => DEFAULT_DURATION_SECS,
        };
        secs.saturating_mul(1000)
    }

    pub fn with_output<P: Into<PathBuf>>(mut self, output: P) -> SessionConfig {
        self.output = output.into();
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Result<SessionConfig> {
        self.epc_prefix_filter = Some(epc::normalize_epc(prefix)?);
        Ok(self)
    }

    pub fn with_writes(mut self, writes: Vec<TagWrite>) -> SessionConfig {
        self.writes = writes;
        self
    }

    pub fn with_read_back(mut self, read_back: TagReadBack) -> SessionConfig {
        self.read_back = Some(read_back);
        self
    }

    pub fn with_idle_sleep_ms(mut self, idle_sleep_ms: u64) -> SessionConfig {
        self.idle_sleep_ms = idle_sleep_ms;
        self
    }

    pub fn apply_overrides(mut self, overrides: ConfigOverrides) -> Result<SessionConfig> {
        if let Some(writes) = overrides.writes {
            self.writes = writes;
        }
        if let Some(read_back) = overrides.read_back {
            self.read_back = Some(read_back);
        }
        if let Some(prefix) = overrides.prefix {
            self = self.with_prefix(&prefix)?;
        }
        if let Some(ms) = overrides.idle_sleep_ms {
            self.idle_sleep_ms = ms;
        }
        Ok(self)
    }

    /// Whether a hex EPC passes the configured prefix and target.
    pub fn matches(&self, epc_hex: &str) -> bool {
        if let Some(prefix) = &self.epc_prefix_filter {
            if !epc_hex.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(target) = &self.epc_exact_target {
            if epc_hex != target {
                return false;
            }
        }
        true
    }

    /// Writes and read-back only ever go to an explicit target.
    pub fn has_tag_ops(&self) -> bool {
        self.epc_exact_target.is_some() && (!self.writes.is_empty() || self.read_back.is_some())
    }
}

/// Optional JSON file adjusting a session built from the command line.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub writes: Option<Vec<TagWrite>>,
    pub read_back: Option<TagReadBack>,
    pub prefix: Option<String>,
    pub idle_sleep_ms: Option<u64>,
}

impl ConfigOverrides {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ConfigOverrides> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryBank;
    use std::io::Write;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::parse("192.168.1.50"), Endpoint::Tcp("192.168.1.50".to_string()));
        assert_eq!(Endpoint::parse("/dev/ttyUSB0"), Endpoint::Serial("/dev/ttyUSB0".to_string()));
        assert_eq!(Endpoint::parse("COM3"), Endpoint::Serial("COM3".to_string()));
        assert_eq!(Endpoint::parse("compact-reader"), Endpoint::Tcp("compact-reader".to_string()));
        assert_eq!(Endpoint::parse("10.0.0.2").to_string(), "10.0.0.2:5084");
    }

    #[test]
    fn test_duration_arg() {
        assert_eq!(SessionConfig::duration_ms_from_arg(None), 10_000);
        assert_eq!(SessionConfig::duration_ms_from_arg(Some("0")), 10_000);
        assert_eq!(SessionConfig::duration_ms_from_arg(Some("abc")), 10_000);
        assert_eq!(SessionConfig::duration_ms_from_arg(Some("25")), 25_000);
    }

    #[test]
    fn test_target_config() {
        let config = SessionConfig::target("reader", "e280 b120 0000 0000 0000 1234", 2000).unwrap();
        assert_eq!(config.epc_exact_target.as_deref(), Some("E280B1200000000000001234"));
        assert_eq!(config.port, 5084);
        assert_eq!(config.connect_timeout_ms, 5000);
        assert_eq!(config.layout, CsvLayout::Sensor);
        assert_eq!(config.output, PathBuf::from("taglog.csv"));
        assert_eq!(config.writes.len(), 2);
        assert_eq!(config.writes[1].data, vec![0x20, 0x00]);
        assert!(config.has_tag_ops());
        assert!(SessionConfig::target("reader", "  ", 2000).is_err());
    }

    #[test]
    fn test_matches() {
        let config = SessionConfig::prefix_filter("reader", DEFAULT_PREFIX, 1000).unwrap();
        assert!(config.matches("E280B1200000000000001234"));
        assert!(!config.matches("300833B2DDD9014000000000"));
        assert!(!config.has_tag_ops());

        let config = SessionConfig::target("reader", "E280B1200000000000001234", 1000).unwrap();
        assert!(config.matches("E280B1200000000000001234"));
        assert!(!config.matches("E280B1200000000000001235"));
        assert!(!config.matches("E280B120"));

        let config = config.with_prefix("3008").unwrap();
        assert!(!config.matches("E280B1200000000000001234"));
    }

    #[test]
    fn test_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "writes": [{{"label": "cal", "memory_bank": "user", "byte_offset": 290, "data": [0, 1]}}],
                "read_back": {{"memory_bank": "user", "byte_offset": 292, "byte_count": 4}},
                "idle_sleep_ms": 10
            }}"#
        )
        .unwrap();

        let overrides = ConfigOverrides::load(file.path()).unwrap();
        let config = SessionConfig::target("reader", "AABB", 1000)
            .unwrap()
            .apply_overrides(overrides)
            .unwrap();
        assert_eq!(config.writes.len(), 1);
        assert_eq!(config.writes[0].byte_offset, 290);
        assert_eq!(config.read_back.as_ref().unwrap().memory_bank, MemoryBank::User);
        assert_eq!(config.idle_sleep_ms, 10);
    }

    #[test]
    fn test_overrides_rejects_unknown() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sleep": 1}}"#).unwrap();
        match ConfigOverrides::load(file.path()) {
            Err(Error::Config(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
