pub use log::{trace, debug, info, warn, error, log_enabled, Level, LevelFilter};

pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        .format_timestamp_millis()
        .parse_default_env()
        .try_init()?;

    Ok(())
}

/// Logger setup for unit and integration tests, safe to call from every test.
pub fn initialize_for_tests() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(LevelFilter::Debug)
        .try_init();
}
