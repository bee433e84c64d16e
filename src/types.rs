/// Direction in which the feed is enumerated. Decided once before a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumerationOrder {
    /// Feed-native order (newest first).
    #[default]
    NewestFirst,
    /// Fully reversed (oldest first).
    OldestFirst,
}

impl EnumerationOrder {
    pub fn is_reversed(self) -> bool {
        self == EnumerationOrder::OldestFirst
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
