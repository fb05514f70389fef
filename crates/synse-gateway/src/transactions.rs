//! Transaction tracker for asynchronous writes
//!
//! Entries are created in `pending` by the dispatcher and moved forward by
//! status updates from the owning plugin. A transaction that gets no update
//! within the configured deadline after creation is failed by the tracker
//! itself. Terminal entries are kept for a TTL, then swept.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use synse_core::{GatewayError, GatewayResult, Transaction, TransactionStatus, TransactionUpdate};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransactionConfig;

struct Tracked {
    transaction: Transaction,
    created: Instant,
    /// When a terminal status was reached
    finished: Option<Instant>,
}

impl Tracked {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.finished.is_some_and(|at| at.elapsed() > ttl)
    }

    fn is_overdue(&self, timeout: Duration) -> bool {
        !self.transaction.status.is_terminal() && self.created.elapsed() > timeout
    }

    fn apply(&mut self, status: TransactionStatus, context: Option<String>) {
        self.transaction.status = status;
        if context.is_some() {
            self.transaction.context = context;
        }
        self.transaction.updated_at = Utc::now();
        if status.is_terminal() {
            self.finished = Some(Instant::now());
        }
    }

    fn time_out(&mut self, timeout: Duration) {
        self.apply(
            TransactionStatus::Failure,
            Some(format!("no status update within {}s", timeout.as_secs())),
        );
    }
}

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Transactions failed because their deadline passed
    pub timed_out: Vec<String>,
    /// Terminal transactions removed after their TTL
    pub removed: Vec<String>,
}

/// TTL-bounded store of write transactions
pub struct TransactionTracker {
    transactions: RwLock<HashMap<String, Tracked>>,
    ttl: Duration,
    timeout: Duration,
}

impl TransactionTracker {
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            ttl,
            timeout,
        }
    }

    pub fn from_config(config: &TransactionConfig) -> Self {
        Self::new(config.ttl(), config.timeout())
    }

    /// Start tracking a write to `device_id` owned by `plugin_id`
    pub fn create(&self, device_id: &str, plugin_id: &str) -> Transaction {
        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            device: device_id.to_string(),
            plugin: plugin_id.to_string(),
            plugin_transaction: None,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
            context: None,
        };

        self.transactions.write().insert(
            transaction.id.clone(),
            Tracked {
                transaction: transaction.clone(),
                created: Instant::now(),
                finished: None,
            },
        );

        debug!(
            transaction_id = %transaction.id,
            device_id = %device_id,
            plugin_id = %plugin_id,
            "Transaction created"
        );
        transaction
    }

    /// Apply a status update.
    ///
    /// Updates to a terminal transaction, and updates that would move the
    /// status backwards, are ignored. The returned transaction reflects the
    /// state after the call either way.
    pub fn update(&self, id: &str, update: TransactionUpdate) -> GatewayResult<Transaction> {
        let mut transactions = self.transactions.write();
        let tracked = transactions
            .get_mut(id)
            .ok_or_else(|| not_found(id))?;

        if tracked.is_overdue(self.timeout) {
            tracked.time_out(self.timeout);
        }

        let current = tracked.transaction.status;
        if !current.can_transition_to(update.status) {
            warn!(
                transaction_id = %id,
                current = %current,
                rejected = %update.status,
                "Ignoring transaction update"
            );
            return Ok(tracked.transaction.clone());
        }

        tracked.apply(update.status, update.context);
        if update.status.is_terminal() {
            info!(transaction_id = %id, status = %update.status, "Transaction finished");
        }
        Ok(tracked.transaction.clone())
    }

    /// Record the identifier the plugin assigned to the write
    pub fn set_plugin_transaction(&self, id: &str, plugin_transaction: &str) -> GatewayResult<()> {
        let mut transactions = self.transactions.write();
        let tracked = transactions.get_mut(id).ok_or_else(|| not_found(id))?;
        tracked.transaction.plugin_transaction = Some(plugin_transaction.to_string());
        Ok(())
    }

    /// Moment after which the tracker stops waiting for status updates
    pub fn deadline(&self, id: &str) -> GatewayResult<Instant> {
        let transactions = self.transactions.read();
        let tracked = transactions.get(id).ok_or_else(|| not_found(id))?;
        Ok(tracked.created + self.timeout)
    }

    /// Current state of a transaction; an overdue one is failed first
    pub fn get(&self, id: &str) -> GatewayResult<Transaction> {
        {
            let transactions = self.transactions.read();
            let tracked = transactions.get(id).ok_or_else(|| not_found(id))?;
            if tracked.is_expired(self.ttl) {
                return Err(not_found(id));
            }
            if !tracked.is_overdue(self.timeout) {
                return Ok(tracked.transaction.clone());
            }
        }

        let mut transactions = self.transactions.write();
        let tracked = transactions.get_mut(id).ok_or_else(|| not_found(id))?;
        if tracked.is_overdue(self.timeout) {
            tracked.time_out(self.timeout);
            warn!(transaction_id = %id, "Transaction timed out");
        }
        Ok(tracked.transaction.clone())
    }

    /// Ids of all live transactions, sorted
    pub fn ids(&self) -> Vec<String> {
        let transactions = self.transactions.read();
        let mut ids: Vec<String> = transactions
            .iter()
            .filter(|(_, tracked)| !tracked.is_expired(self.ttl))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Fail overdue transactions and drop terminal ones past their TTL
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut transactions = self.transactions.write();

        for (id, tracked) in transactions.iter_mut() {
            if tracked.is_overdue(self.timeout) {
                tracked.time_out(self.timeout);
                report.timed_out.push(id.clone());
            }
        }

        transactions.retain(|id, tracked| {
            let keep = !tracked.is_expired(self.ttl);
            if !keep {
                report.removed.push(id.clone());
            }
            keep
        });

        report.timed_out.sort();
        report.removed.sort();
        if !report.timed_out.is_empty() || !report.removed.is_empty() {
            debug!(
                timed_out = report.timed_out.len(),
                removed = report.removed.len(),
                remaining = transactions.len(),
                "Transaction sweep"
            );
        }
        report
    }

    pub fn len(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.read().is_empty()
    }
}

fn not_found(id: &str) -> GatewayError {
    GatewayError::NotFound(format!("Transaction not found: {}", id))
}
