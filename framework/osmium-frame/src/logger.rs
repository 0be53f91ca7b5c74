//! A `log` backend writing to the serial line.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};

use crate::arch::x86::device::serial;
use crate::config::DEFAULT_LOG_LEVEL;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                serial::send(b'\r');
            }
            serial::send(byte);
        }
        Ok(())
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= DEFAULT_LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            SerialWriter,
            "[{:>5}] {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

pub(crate) fn init() {
    serial::init();
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .expect("logger already installed");
}
