use clap::{ArgAction, Parser};
use log::{Level, LevelFilter, Metadata, Record};
use std::{path::PathBuf, time::SystemTime};

mod commands;

#[derive(Parser)]
#[command(
    name = "evmqtt",
    version = env!("CARGO_PKG_VERSION"),
    about = "Linux input event to MQTT gateway"
)]
pub struct App {
    /// Increase message verbosity
    #[arg(long, short, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only report errors
    #[arg(long, short, conflicts_with = "verbose")]
    quiet: bool,

    /// Configuration file
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// List available input devices and exit
    #[arg(long = "list-devices")]
    list_devices: bool,

    /// Monitor all discovered input devices, regardless of the configuration
    #[arg(long = "auto-discover")]
    auto_discover: bool,
}

fn main() {
    let args = App::parse();

    log::set_logger(&CLI_LOGGER).unwrap();

    let level = if args.quiet {
        LevelFilter::Error
    } else {
        match args.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    log::set_max_level(level);

    if args.list_devices {
        commands::list::list();
    } else {
        commands::run::run(&args);
    }
}

static CLI_LOGGER: CliLogger = CliLogger;

struct CliLogger;

impl log::Log for CliLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{} {}: {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                match record.level() {
                    Level::Trace => "trace",
                    Level::Debug => "debug",
                    Level::Info => "info",
                    Level::Warn => "warn",
                    Level::Error => "error",
                },
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
