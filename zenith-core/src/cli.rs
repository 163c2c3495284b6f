use clap::{Args, ValueEnum};
use log::LevelFilter;

/// Log level options for command-line argument.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Arguments shared by every Zenith binary, meant to be `#[command(flatten)]`ed
/// into the application's own parser.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Set the log verbosity level
    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

impl CommonArgs {
    #[inline]
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn default_log_level_is_info() {
        let args = TestArgs::parse_from(["test"]);
        assert_eq!(args.common.log_level, LogLevel::Info);
        assert_eq!(args.common.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn parses_short_flag() {
        let args = TestArgs::parse_from(["test", "-l", "trace"]);
        assert_eq!(args.common.level_filter(), LevelFilter::Trace);
    }
}
