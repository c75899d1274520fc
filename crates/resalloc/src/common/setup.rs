use std::io::Write;

use env_logger::DEFAULT_FILTER_ENV;
use env_logger::fmt::style::{AnsiColor, Style};
use log::LevelFilter;

/// Initializes logging to stderr. `RUST_LOG` overrides the level chosen by `debug`.
///
/// Worker processes share stderr with the process that allocated them, so their lines are
/// prefixed with `worker`.
pub fn setup_logging(debug: bool, worker: Option<&str>) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let debug = debug
        || std::env::var(DEFAULT_FILTER_ENV).is_ok_and(|filter| filter.contains("debug"));
    let prefix = worker.map(|name| format!("[{name}] ")).unwrap_or_default();

    // <time> <level> [<worker>] <message>
    builder.format(move |buf, record| {
        let level_style = buf.default_level_style(record.level()).bold();
        let dim = Style::new()
            .fg_color(Some(AnsiColor::BrightBlack.into()))
            .dimmed();
        let timestamp = if debug {
            buf.timestamp_millis()
        } else {
            buf.timestamp_seconds()
        };
        writeln!(
            buf,
            "{dim}{timestamp}{dim:#} {level_style}{}{level_style:#} {dim}{prefix}{dim:#}{}",
            record.level(),
            record.args()
        )
    });

    builder.parse_default_env();
    builder.init();
}
