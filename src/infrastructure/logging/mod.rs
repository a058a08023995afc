use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::sync::Mutex;

static LOGGER_INITIALIZED: Mutex<bool> = Mutex::new(false);

/// Initialize console logging.
///
/// Idempotent: repeated calls (tests, multiple starts) are no-ops, and a
/// logger already installed by the host application wins.
pub fn init_logging() {
    {
        let mut initialized = LOGGER_INITIALIZED.lock().unwrap();
        if *initialized {
            return;
        }
        *initialized = true;
    }

    let mut builder = Builder::new();

    // In tests, capture logs via the test harness
    if cfg!(test) {
        builder.is_test(true);
    }

    // Set log level from env or default to DEBUG for our crate, WARN for others
    if let Ok(rust_log) = env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    } else {
        builder.filter_module("beacon", LevelFilter::Debug);
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {} {}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    builder.target(env_logger::Target::Stderr);

    if builder.try_init().is_err() {
        // Host application already installed a logger
        return;
    }

    log::info!("beacon v{} initialized", env!("CARGO_PKG_VERSION"));
}
