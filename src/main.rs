use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use log::{error, info, Level, LevelFilter};

use xpclog::config::DEFAULT_PREFIX;
use xpclog::session::OK_TARGET;
use xpclog::{
    ConfigOverrides, CsvSink, Endpoint, LinkReader, MockReader, PollingSession, SessionConfig,
    TagReader,
};

/// Log UHF RFID tag reads for a fixed time, decoding the XPC sensor word.
#[derive(Parser, Debug)]
#[command(name = "xpclog")]
#[command(version, about, long_about = None)]
struct Args {
    /// Reader host name or IP (port 5084), or a serial device such as /dev/ttyUSB0.
    reader_host: String,

    /// EPC of the sensor tag to configure and decode. Without it every tag
    /// matching --prefix is logged.
    target_epc: Option<String>,

    /// Session length in seconds; missing, zero or non-numeric means 10.
    duration_seconds: Option<String>,

    /// EPC prefix filter (default E280B120 when no target is given).
    #[arg(long)]
    prefix: Option<String>,

    /// CSV file to append to.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Do not write the configuration words to the target tag.
    #[arg(long)]
    no_write: bool,

    /// JSON file with writes, read-back, prefix or idle sleep overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use a built-in simulated reader instead of real hardware.
    #[arg(long)]
    simulate: bool,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

/// Bracketed tag printed in front of a log line.
fn level_tag(level: Level, target: &str) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info if target == OK_TARGET => "OK",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}",
                level_tag(record.level(), record.target()),
                record.args()
            )
        })
        .init();
}

fn build_config(args: &Args) -> xpclog::Result<SessionConfig> {
    let duration_ms = SessionConfig::duration_ms_from_arg(args.duration_seconds.as_deref());
    let mut config = match &args.target_epc {
        Some(target) => {
            let config = SessionConfig::target(&args.reader_host, target, duration_ms)?;
            match &args.prefix {
                Some(prefix) => config.with_prefix(prefix)?,
                None => config,
            }
        }
        None => SessionConfig::prefix_filter(
            &args.reader_host,
            args.prefix.as_deref().unwrap_or(DEFAULT_PREFIX),
            duration_ms,
        )?,
    };
    if let Some(path) = &args.config {
        config = config.apply_overrides(ConfigOverrides::load(path)?)?;
    }
    if args.no_write {
        config = config.with_writes(Vec::new());
    }
    if let Some(output) = &args.output {
        config = config.with_output(output);
    }
    Ok(config)
}

fn connect(config: &SessionConfig) -> xpclog::Result<Box<dyn TagReader>> {
    info!("connecting to {}...", config.endpoint);
    let reader: Box<dyn TagReader> = match &config.endpoint {
        Endpoint::Tcp(host) => Box::new(LinkReader::connect_tcp(
            host,
            config.port,
            Duration::from_millis(config.connect_timeout_ms),
        )?),
        Endpoint::Serial(path) => Box::new(LinkReader::open_serial(path)?),
    };
    Ok(reader)
}

fn simulate(config: &SessionConfig) -> xpclog::Result<MockReader> {
    info!("simulating a reader at {}", config.endpoint);
    let target = config
        .epc_exact_target
        .as_deref()
        .unwrap_or("E280B1200000000000001234");
    MockReader::demo(target)
}

/// Usage errors exit with 1; `--help` and `--version` exit cleanly.
fn usage_exit_code(e: &clap::Error) -> i32 {
    if e.use_stderr() {
        1
    } else {
        0
    }
}

fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return usage_exit_code(&e);
        }
    };
    init_logging(args.verbose);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    let sink = match CsvSink::open(&config.output, config.layout) {
        Ok(sink) => sink,
        Err(e) => {
            error!("cannot open {}: {}", config.output.display(), e);
            return 1;
        }
    };
    info!(
        "logging to {} for {} s",
        config.output.display(),
        config.session_duration_ms / 1000
    );

    let mut session = PollingSession::new(config, sink);
    let result = if args.simulate {
        session.run(simulate)
    } else {
        session.run(connect)
    };
    match result {
        Ok(report) => {
            info!(
                "{} observations logged, {} writes ok, {} failed",
                report.observations, report.writes_ok, report.writes_failed
            );
            0
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

fn main() {
    process::exit(run());
}
