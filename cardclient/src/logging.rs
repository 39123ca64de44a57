//! Logging setup and trace helpers.
//!
//! The engine itself only uses the `log` facade. Hosts that do not bring a
//! logger can call [`init_logging`] to get console output through
//! `tracing-subscriber`.

use std::fmt::Write as _;
use std::io;

use chrono::Local;
use log::{log_enabled, trace, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Bytes per hexdump line.
const HEXDUMP_WIDTH: usize = 16;

/// Install a console subscriber and bridge `log` records into it.
///
/// `RUST_LOG` overrides the default level (`info`, or `debug` when
/// `verbose`).
pub fn init_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(io::stdout)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_timer(LocalTimeTimer),
    );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;

    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(())
}

/// Timestamps in local time.
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Trace-log `data` as hex plus printable ASCII, 16 bytes per line.
pub fn hexdump(prefix: &str, data: &[u8]) {
    if !log_enabled!(Level::Trace) {
        return;
    }
    for line in hexdump_lines(data) {
        trace!("{}: {}", prefix, line);
    }
}

fn hexdump_lines(data: &[u8]) -> Vec<String> {
    data.chunks(HEXDUMP_WIDTH)
        .map(|chunk| {
            let mut line = String::with_capacity(HEXDUMP_WIDTH * 4);
            for i in 0..HEXDUMP_WIDTH {
                match chunk.get(i) {
                    Some(b) => {
                        let _ = write!(line, "{:02X} ", b);
                    }
                    None => line.push_str("   "),
                }
            }
            line.extend(chunk.iter().map(|&b| {
                if (b' '..=b'~').contains(&b) {
                    b as char
                } else {
                    '.'
                }
            }));
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_lines() {
        let data: Vec<u8> = (0x41..0x41 + 18).collect();
        let lines = hexdump_lines(&data);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("41 42 43 "));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert_eq!(lines[1], format!("51 52 {}QR", " ".repeat(3 * 14)));
    }

    #[test]
    fn test_hexdump_non_printable() {
        let lines = hexdump_lines(&[0x00, 0x7f, b'a']);
        assert!(lines[0].ends_with("..a"));
    }

    #[test]
    fn test_hexdump_empty() {
        assert!(hexdump_lines(&[]).is_empty());
    }
}
