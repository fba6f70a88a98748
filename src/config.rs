use serde::Deserialize;

use crate::error::SyncError;

/// Strategy the resolver (`crate::resolver`) applies when a pull delivers a record whose
/// `_localId` has an in-flight local update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    TryShallowMerge,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::TryShallowMerge
    }
}

/// Strategy applied when an `update` call reports that the remote record no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingRemoteRecordStrategy {
    Ignore,
    DeleteLocalRecord,
    InsertRemoteRecord,
}

impl Default for MissingRemoteRecordStrategy {
    fn default() -> Self {
        MissingRemoteRecordStrategy::InsertRemoteRecord
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    None,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    fn rank(self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
            LogLevel::None => 4,
        }
    }

    /// Whether a call site logging at `self` should fire given `min_log_level` as the
    /// configured floor; `LogLevel::None` as the floor suppresses every level.
    pub fn passes(self, min_log_level: LogLevel) -> bool {
        self.rank() >= min_log_level.rank()
    }
}

/// Recognized engine options. There is no dynamic key extension, so `Config::from_value`
/// rejects unknown keys rather than ignoring them.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Milliseconds between periodic ticks. `0` disables the periodic scheduler entirely;
    /// the host must then drive sync exclusively via `request_sync_once`.
    pub sync_interval_ms: u64,
    pub min_log_level: LogLevel,
    pub missing_remote_record_during_update_strategy: MissingRemoteRecordStrategy,
    pub conflict_resolution_strategy: ConflictStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_interval_ms: 2000,
            min_log_level: LogLevel::Info,
            missing_remote_record_during_update_strategy: MissingRemoteRecordStrategy::default(),
            conflict_resolution_strategy: ConflictStrategy::default(),
        }
    }
}

impl Config {
    /// Parse a host-supplied options object. Present but unrecognized keys are a construction
    /// time error rather than being silently ignored.
    pub fn from_value(value: serde_json::Value) -> Result<Self, SyncError> {
        serde_json::from_value(value)
            .map_err(|e| SyncError::Config(format!("invalid configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.sync_interval_ms, 2000);
        assert_eq!(
            cfg.missing_remote_record_during_update_strategy,
            MissingRemoteRecordStrategy::InsertRemoteRecord
        );
        assert_eq!(cfg.conflict_resolution_strategy, ConflictStrategy::TryShallowMerge);
    }

    #[test]
    fn unknown_key_is_a_construction_error() {
        let v = serde_json::json!({ "syncIntervalMs": 500, "bogusOption": true });
        // field names are snake_case on the Rust side; the point under test is that an
        // unrecognized key is rejected, not accepted and discarded.
        let v2 = serde_json::json!({ "sync_interval_ms": 500, "bogus_option": true });
        assert!(Config::from_value(v).is_err());
        assert!(Config::from_value(v2).is_err());
    }

    #[test]
    fn known_keys_parse() {
        let v = serde_json::json!({ "sync_interval_ms": 500 });
        let cfg = Config::from_value(v).unwrap();
        assert_eq!(cfg.sync_interval_ms, 500);
    }

    #[test]
    fn log_level_passes_gates_by_severity() {
        assert!(LogLevel::Warn.passes(LogLevel::Info));
        assert!(!LogLevel::Debug.passes(LogLevel::Warn));
        assert!(!LogLevel::Error.passes(LogLevel::None));
        assert!(LogLevel::Info.passes(LogLevel::Info));
    }
}
