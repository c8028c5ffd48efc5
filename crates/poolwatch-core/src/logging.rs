//! Logging bootstrap for the helper daemon and the CLI.
//!
//! `RUST_LOG` wins when set. Otherwise the filter is `POOLWATCH_LOG_LEVEL`,
//! falling back to the level the binary passes in. Records are written as one
//! JSON object per line unless `POOLWATCH_LOG_FORMAT=plain`.

use env_logger::{Builder, Env};
use log::Record;
use serde_json::json;
use std::io::{self, Write};
use std::sync::OnceLock;

const FORMAT_ENV: &str = "POOLWATCH_LOG_FORMAT";
const LEVEL_ENV: &str = "POOLWATCH_LOG_LEVEL";

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("plain") || v.eq_ignore_ascii_case("text") => {
                LogFormat::Plain
            }
            _ => LogFormat::Json,
        }
    }
}

/// Install the global logger once; later calls do nothing.
pub fn init(default_level: &str) {
    INSTALLED.get_or_init(|| install(default_level));
}

fn install(default_level: &str) {
    let level = std::env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let format = LogFormat::parse(std::env::var(FORMAT_ENV).ok().as_deref());

    let mut builder = Builder::from_env(Env::default().default_filter_or(level));
    builder.format(move |buf, record| {
        let ts = buf.timestamp();
        write_record(buf, format, &ts.to_string(), record)
    });
    if let Err(err) = builder.try_init() {
        eprintln!("logger already installed: {err}");
    }
}

fn write_record(
    out: &mut dyn Write,
    format: LogFormat,
    ts: &str,
    record: &Record<'_>,
) -> io::Result<()> {
    let level = record.level().as_str().to_ascii_lowercase();
    match format {
        LogFormat::Json => {
            let line = json!({
                "timestamp": ts,
                "level": level,
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(out, "{line}")
        }
        LogFormat::Plain => writeln!(out, "{ts} {level:<5} {}: {}", record.target(), record.args()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn render(format: LogFormat) -> String {
        let mut out = Vec::new();
        let pool = "tank";
        write_record(
            &mut out,
            format,
            "2026-10-18T00:00:00Z",
            &Record::builder()
                .level(Level::Warn)
                .target("poolwatch::test")
                .args(format_args!("pool {pool} degraded"))
                .build(),
        )
        .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("PLAIN")), LogFormat::Plain);
        assert_eq!(LogFormat::parse(Some("xml")), LogFormat::Json);
    }

    #[test]
    fn json_records_are_single_lines() {
        let line = render(LogFormat::Json);
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["level"], "warn");
        assert_eq!(value["message"], "pool tank degraded");
        assert_eq!(line.lines().count(), 1);
    }

    #[test]
    fn plain_records_name_the_target() {
        assert_eq!(
            render(LogFormat::Plain),
            "2026-10-18T00:00:00Z warn  poolwatch::test: pool tank degraded\n"
        );
    }
}
