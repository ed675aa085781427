//! Process-wide logging sink behind the [`log`] facade.
//!
//! The crate itself logs through the usual `log` macros, so any subscriber
//! works. This module provides the built-in one: console and/or file output
//! with a level filter and an optional profiling prefix (thread id plus a
//! monotonic millisecond timestamp). Level, sinks and profiling are meant to
//! be set once, before [`Pipeline::prepare`](crate::Pipeline::prepare).
//!
//! ```
//! conflux::logger::init();
//! conflux::logger::set_log_level(log::LevelFilter::Info);
//! ```

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::Result;

/// The level the logger starts with after [`init`].
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Error;

struct Sink {
    console: bool,
    file: Option<File>,
}

struct PipelineLogger {
    sink: Mutex<Sink>,
    profiling: AtomicBool,
}

static LOGGER: OnceCell<&'static PipelineLogger> = OnceCell::new();

impl Log for PipelineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = format!("[{:>7}]", record.level());
        if self.profiling.load(Ordering::Relaxed) {
            let now = coarsetime::Clock::now_since_epoch().as_millis();
            line.push_str(&format!(" [{:?}] [{}]", std::thread::current().id(), now));
        }
        line.push_str(&format!(
            ": {}:{} {}",
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        ));

        let mut sink = self.sink.lock();
        if sink.console {
            println!("{line}");
        }
        if let Some(file) = sink.file.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        let mut sink = self.sink.lock();
        if let Some(file) = sink.file.as_mut() {
            let _ = file.flush();
        }
    }
}

fn instance() -> &'static PipelineLogger {
    LOGGER.get_or_init(|| {
        Box::leak(Box::new(PipelineLogger {
            sink: Mutex::new(Sink {
                console: true,
                file: None,
            }),
            profiling: AtomicBool::new(false),
        }))
    })
}

/// Install the built-in logger as the global [`log`] subscriber.
///
/// Idempotent; if another subscriber is already installed this is a no-op
/// and the existing one keeps receiving the crate's records.
pub fn init() {
    let logger = instance();
    if log::set_logger(logger).is_ok() {
        log::set_max_level(DEFAULT_LEVEL);
    }
}

/// Set the level filter. `LevelFilter::Off` disables all output.
pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}

pub fn log_level() -> LevelFilter {
    log::max_level()
}

/// Additionally dump every record to `path`. With `file_only` the console
/// output is suppressed.
pub fn dump_to_file(path: impl AsRef<Path>, file_only: bool) -> Result<()> {
    let file = File::create(path)?;
    let mut sink = instance().sink.lock();
    sink.file = Some(file);
    sink.console = !file_only;
    Ok(())
}

/// Prefix every record with the emitting thread id and a millisecond
/// timestamp.
pub fn enable_profiling() {
    instance().profiling.store(true, Ordering::Relaxed);
}

pub fn disable_profiling() {
    instance().profiling.store(false, Ordering::Relaxed);
}
