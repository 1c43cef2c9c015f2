//! Error classification for best-effort synchronization
//!
//! Nothing in the sync path is allowed to fail the host application, so
//! channel and codec failures are categorized and logged instead of
//! propagated. Fallible setup APIs return `anyhow::Result`.

use std::fmt;

/// Categorized error types for logging swallowed failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Shared channel is offline or refused the call
    Unavailable,

    /// Write rejected because the channel ran out of space
    QuotaExceeded,

    /// Snapshot could not be encoded or decoded
    Serialization,

    /// Backing storage (SQLite, filesystem) failed
    Storage,

    /// Invalid settings
    Configuration,

    /// Unknown errors
    Unknown,
}

impl ErrorCategory {
    /// Whether the next successful flush is enough to recover.
    ///
    /// Every category except configuration heals once the channel accepts
    /// a write again; configuration errors need the settings fixed.
    pub fn heals_on_next_flush(&self) -> bool {
        !matches!(self, ErrorCategory::Configuration)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::QuotaExceeded => "quota_exceeded",
            ErrorCategory::Serialization => "serialization",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorize an error
pub fn categorize_error(error: &anyhow::Error) -> ErrorCategory {
    if error.chain().any(|cause| cause.is::<serde_json::Error>()) {
        return ErrorCategory::Serialization;
    }
    if error.chain().any(|cause| cause.is::<rusqlite::Error>()) {
        return ErrorCategory::Storage;
    }

    let error_str = format!("{:#}", error).to_lowercase();

    if error_str.contains("quota") {
        ErrorCategory::QuotaExceeded
    } else if error_str.contains("unavailable") || error_str.contains("closed") {
        ErrorCategory::Unavailable
    } else if error_str.contains("json")
        || error_str.contains("deserialize")
        || error_str.contains("serialize")
    {
        ErrorCategory::Serialization
    } else if error_str.contains("config") || error_str.contains("invalid") {
        ErrorCategory::Configuration
    } else if error_str.contains("database")
        || error_str.contains("sqlite")
        || error_str.contains("i/o")
        || error_str.contains("io error")
    {
        ErrorCategory::Storage
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let quota = anyhow::anyhow!("channel quota exceeded: 12 > 8 bytes");
        assert_eq!(categorize_error(&quota), ErrorCategory::QuotaExceeded);

        let offline = anyhow::anyhow!("shared channel unavailable");
        assert_eq!(categorize_error(&offline), ErrorCategory::Unavailable);

        let config = anyhow::anyhow!("invalid key prefix");
        assert_eq!(categorize_error(&config), ErrorCategory::Configuration);

        let other = anyhow::anyhow!("something odd");
        assert_eq!(categorize_error(&other), ErrorCategory::Unknown);
    }

    #[test]
    fn test_categorizes_by_source_type() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = anyhow::Error::new(json_err).context("decoding snapshot");
        assert_eq!(categorize_error(&err), ErrorCategory::Serialization);
    }

    #[test]
    fn test_heals_on_next_flush() {
        assert!(ErrorCategory::QuotaExceeded.heals_on_next_flush());
        assert!(ErrorCategory::Unavailable.heals_on_next_flush());
        assert!(!ErrorCategory::Configuration.heals_on_next_flush());
    }
}
