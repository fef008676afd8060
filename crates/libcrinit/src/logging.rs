//! Log setup for the init process.
//!
//! All components log through the `log` facade; this wires up the `fern`
//! dispatcher once at startup. The `DEBUG` global option raises the level
//! filter to `Trace`. Recoverable errors are logged with the source file and
//! line so post-mortem reading of a boot log can locate the failing spot.
//!
//! The `USE_SYSLOG` option only selects the downstream sink; an external log
//! forwarder picks the stream up, so the dispatcher always chains stdout.

pub fn setup_logging(debug: bool) -> Result<(), String> {
    let level = if debug {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            let level = record.level();
            let colored_level = match level {
                log::Level::Error => format!("\x1b[31m{}\x1b[0m", level),
                log::Level::Warn => format!("\x1b[33m{}\x1b[0m", level),
                log::Level::Info => format!("\x1b[32m{}\x1b[0m", level),
                log::Level::Debug => format!("\x1b[34m{}\x1b[0m", level),
                log::Level::Trace => format!("\x1b[36m{}\x1b[0m", level),
            };
            out.finish(format_args!(
                "{}[{}:{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.file().unwrap_or(record.target()),
                record.line().unwrap_or(0),
                colored_level,
                message
            ));
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .map_err(|e| format!("Error while setting up logger: {e}"))
}
