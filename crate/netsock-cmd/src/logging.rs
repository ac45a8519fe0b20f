use env_logger::Builder;
use std::io::Write;

/// Initialize logging with app-wide defaults.
///
/// Level defaults to WARN, INFO with one -v and DEBUG with two or
/// more, for netsock modules. RUST_LOG overrides this.
///
/// Output format can be made systemd-friendly by setting
/// RUST_LOG_FORMAT to SYSTEMD.
pub fn init(verbosity: u8) {
    let mut builder = env_logger::Builder::new();

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("SYSTEMD") {
        enable_systemd_log_format(&mut builder);
    }

    builder.filter_level(log::LevelFilter::Warn);
    let level = verbosity_level(verbosity);
    for module in ["netsock", "netsock_network"] {
        builder.filter_module(module, level);
    }

    builder.parse_default_env();
    builder.init();
}

fn verbosity_level(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

/// Prefix each line with its syslog priority, for journald.
///
/// No timestamp; journald records its own.
fn enable_systemd_log_format(builder: &mut Builder) {
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "<{}>{}: {}",
            syslog_priority(record.level()),
            record.target(),
            record.args()
        )
    });
}

/// RFC 5424 severity of a log level.
fn syslog_priority(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 3,
        log::Level::Warn => 4,
        log::Level::Info => 5,
        log::Level::Debug | log::Level::Trace => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity() {
        assert_eq!(log::LevelFilter::Warn, verbosity_level(0));
        assert_eq!(log::LevelFilter::Info, verbosity_level(1));
        assert_eq!(log::LevelFilter::Debug, verbosity_level(2));
        assert_eq!(log::LevelFilter::Debug, verbosity_level(5));
    }

    #[test]
    fn syslog_priorities() {
        assert_eq!(3, syslog_priority(log::Level::Error));
        assert_eq!(4, syslog_priority(log::Level::Warn));
        assert_eq!(5, syslog_priority(log::Level::Info));
        assert_eq!(7, syslog_priority(log::Level::Debug));
        assert_eq!(7, syslog_priority(log::Level::Trace));
    }
}
