//! Transaction isolation levels and access modes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolation level applied to every transaction started by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
    ReadCommitted,
}

impl IsolationLevel {
    /// Resolve a free-text isolation level.
    ///
    /// Matching ignores case and the separators ' ', '_' and '-'. Unknown or empty
    /// input falls back to [`IsolationLevel::Serializable`].
    pub fn parse_lenient(value: &str) -> Self {
        let normalized: String = value
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match normalized.as_str() {
            "repeatableread" => Self::RepeatableRead,
            "readcommitted" => Self::ReadCommitted,
            _ => Self::Serializable,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Serializable => "SERIALIZABLE",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::ReadCommitted => "READ COMMITTED",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Whether a transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadOnly => "READ ONLY",
            Self::ReadWrite => "READ WRITE",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// First statement of every transaction.
pub fn set_transaction_sql(level: IsolationLevel, mode: AccessMode) -> String {
    format!(
        "SET TRANSACTION ISOLATION LEVEL {} {}",
        level.as_sql(),
        mode.as_sql()
    )
}
