//! Write transaction models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a write transaction.
///
/// # Lifecycle
///
/// ```text
/// Pending ──ack──▶ Writing ──▶ Success
///    │                 │
///    └─────────────────┴──────▶ Failure   (plugin error or timeout)
/// ```
///
/// `Success` and `Failure` are terminal: once reached, no further update applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Created, not yet acknowledged by the plugin
    Pending,
    /// Acknowledged by the plugin, executing
    Writing,
    /// Completed successfully. Terminal.
    #[serde(alias = "done")]
    Success,
    /// Failed or timed out. Terminal.
    #[serde(alias = "error")]
    Failure,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Failure)
    }

    /// Position in the lifecycle; transitions never move to a lower rank.
    fn rank(self) -> u8 {
        match self {
            TransactionStatus::Pending => 0,
            TransactionStatus::Writing => 1,
            TransactionStatus::Success | TransactionStatus::Failure => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Writing => "writing",
            TransactionStatus::Success => "success",
            TransactionStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// A tracked write transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Gateway-generated identifier
    pub id: String,
    /// Target device
    pub device: String,
    /// Owning plugin
    pub plugin: String,
    /// Identifier the plugin assigned when acknowledging the write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_transaction: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Failure context (plugin error message or timeout description)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Acknowledgement a plugin returns for an accepted write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Plugin-side transaction identifier
    pub transaction: String,
}

/// A status transition pushed by a plugin on the transaction status stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl TransactionUpdate {
    pub fn new(status: TransactionStatus) -> Self {
        Self {
            status,
            context: None,
        }
    }

    pub fn failed(context: impl Into<String>) -> Self {
        Self {
            status: TransactionStatus::Failure,
            context: Some(context.into()),
        }
    }
}
