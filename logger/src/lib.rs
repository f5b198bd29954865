//! Process-wide event log for the emulator.
//!
//! The sink is initialized once per process via [`init_logger`]; every crate
//! in the workspace then reports coarse events through [`log`]. Each line is
//! prefixed with the time elapsed since the sink was created, so traces line
//! up with emulated runtime rather than wall-clock time.

use std::{
    fs::File,
    io::{self, Write},
    sync::Mutex,
    time::Instant,
};

use chrono::Utc;
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<Logger> = OnceCell::new();

/// Where log lines end up: the console, or a file in the temp directory.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum LogKind {
    /// Log to stdout, the default choice.
    Stdout,

    /// Log to /tmp/satsuma-<timestamp>.log
    File,
}

struct Sink {
    out: Box<dyn Write + Send>,
    start_instant: Instant,
}

impl Sink {
    fn new(kind: LogKind) -> Self {
        let start_instant = Instant::now();
        let out: Box<dyn Write + Send> = match kind {
            LogKind::Stdout => Box::new(io::stdout()),
            LogKind::File => {
                let filename = format!("satsuma-{}.log", Utc::now().timestamp());
                let path = std::env::temp_dir().join(filename);
                Box::new(File::create(path).unwrap())
            }
        };

        Self { out, start_instant }
    }

    fn log<T>(&mut self, data: T)
    where
        T: std::fmt::Display,
    {
        let now = self.start_instant.elapsed();
        let seconds = now.as_secs();
        let hours = seconds / 3600;
        let minutes = (seconds / 60) % 60;
        let seconds = seconds % 60;
        let milliseconds = now.subsec_millis();

        writeln!(
            self.out,
            "[{hours:02}:{minutes:02}:{seconds:02}.{milliseconds:03}] {data}"
        )
        .unwrap();
    }
}

struct Logger {
    sink: Mutex<Sink>,
}

impl Logger {
    fn new(kind: LogKind) -> Self {
        Self {
            sink: Mutex::new(Sink::new(kind)),
        }
    }

    fn log<T>(&self, data: T)
    where
        T: std::fmt::Display,
    {
        if let Ok(ref mut sink) = self.sink.lock() {
            sink.log(data);
        }
    }
}

/// Installs the global sink. Later calls are ignored, the first kind wins.
pub fn init_logger(kind: LogKind) {
    LOGGER.set(Logger::new(kind)).ok();
}

/// Writes one line to the global sink. A no-op until [`init_logger`] runs.
pub fn log<T>(data: T)
where
    T: std::fmt::Display,
{
    LOGGER.get().map_or((), |logger| logger.log(data));
}
