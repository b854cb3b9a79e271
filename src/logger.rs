//! Severity-filtered log sink with a pluggable target.
//!
//! The crate itself only emits through the [`log`] facade; this module is a
//! small ready-made backend for programs that do not want to pull in a
//! full-featured logger. Install it once at startup:
//!
//! ```no_run
//! use log::LevelFilter;
//!
//! devio::logger::Sink::new()
//!     .mask(LevelFilter::Debug)
//!     .target_path("/dev/stderr")
//!     .unwrap()
//!     .install()
//!     .unwrap();
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

enum Target {
    Stderr,
    File(Mutex<File>),
}

/// A `log::Log` implementation writing one line per record to stderr or a
/// file, filtered by a severity mask.
pub struct Sink {
    mask: LevelFilter,
    target: Target,
}

impl Sink {
    pub fn new() -> Sink {
        Sink {
            mask: LevelFilter::Info,
            target: Target::Stderr,
        }
    }

    /// Most verbose severity that still gets written.
    pub fn mask(mut self, mask: LevelFilter) -> Sink {
        self.mask = mask;
        self
    }

    /// Redirects output to `path`, appending.
    pub fn target_path(mut self, path: &str) -> io::Result<Sink> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.target = Target::File(Mutex::new(file));
        Ok(self)
    }

    /// Registers the sink as the process-wide logger.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let mask = self.mask;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(mask);
        Ok(())
    }

    fn write_line(&self, record: &Record<'_>) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "{}.{:03} {:5} {}: {}\n",
            ts.as_secs(),
            ts.subsec_millis(),
            record.level(),
            record.target(),
            record.args()
        );
        match &self.target {
            Target::Stderr => {
                let _ = io::stderr().write_all(line.as_bytes());
            }
            Target::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
        }
    }
}

impl Default for Sink {
    fn default() -> Sink {
        Sink::new()
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match self.target {
            Target::Stderr => "stderr",
            Target::File(..) => "file",
        };
        f.debug_struct("Sink")
            .field("mask", &self.mask)
            .field("target", &target)
            .finish()
    }
}

impl Log for Sink {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.mask
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.write_line(record);
        }
    }

    fn flush(&self) {
        match &self.target {
            Target::Stderr => {
                let _ = io::stderr().flush();
            }
            Target::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.flush();
                }
            }
        }
    }
}
