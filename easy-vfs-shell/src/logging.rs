use std::fmt;

use log::{Level, LevelFilter, Log};

struct NaiveLogger;

impl Log for NaiveLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        print_color(
            format_args!(
                "[{} {}:{}] {}\n",
                record.level(),
                record.file().unwrap_or("??.rs"),
                record.line().unwrap_or(0),
                record.args()
            ),
            color_code_for_level(&record.level()),
        );
    }

    fn flush(&self) {}
}

fn color_code_for_level(lvl: &Level) -> u8 {
    match lvl {
        Level::Error => 31,
        Level::Warn => 93,
        Level::Info => 34,
        Level::Debug => 32,
        Level::Trace => 90,
    }
}

// stderr, so command output on stdout stays clean
fn print_color(args: fmt::Arguments, color_code: u8) {
    eprint!("\u{1b}[{}m{}\u{1b}[0m", color_code, args);
}

fn level_filter(name: Option<&str>) -> LevelFilter {
    match name {
        Some("error") | Some("ERROR") => LevelFilter::Error,
        Some("warn") | Some("WARN") => LevelFilter::Warn,
        Some("info") | Some("INFO") => LevelFilter::Info,
        Some("debug") | Some("DEBUG") => LevelFilter::Debug,
        Some("trace") | Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Install the logger; `level` wins over the `LOG` environment variable
pub fn init(level: Option<&str>) {
    static LOGGER: NaiveLogger = NaiveLogger;
    let env = std::env::var("LOG").ok();
    // a second init (tests) keeps the first logger
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_filter(level.or(env.as_deref())));
    }
}
