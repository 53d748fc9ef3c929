//! Timeout registry: admits operations against their timeout budget and
//! tracks them until completion or forced cancellation.
//!
//! Admission never fails. Expired records are cancelled and removed by
//! [`TimeoutRegistry::sweep`], which runs lazily on every admission and on
//! the background sweep tick. Whoever awaits a record's cancellation token
//! abandons its work when that happens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use gateway_core::{CorrelationId, TimeoutBudget, TimeoutTable};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle for one admitted operation. Only the registry maps it to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OperationToken(u64);

#[derive(Debug)]
struct InFlightRecord {
    correlation_id: CorrelationId,
    operation: String,
    started: Instant,
    deadline: Instant,
    cancel: CancellationToken,
}

/// What the caller gets back from [`TimeoutRegistry::admit`].
#[derive(Debug, Clone)]
pub struct Admission {
    pub token: OperationToken,
    pub deadline: Instant,
    pub budget: TimeoutBudget,
    /// Fires when the record is cancelled or swept.
    pub cancel: CancellationToken,
}

/// Read-only view of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InFlightSnapshot {
    pub token: OperationToken,
    pub correlation_id: CorrelationId,
    pub operation: String,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct TimeoutRegistry {
    table: TimeoutTable,
    records: DashMap<OperationToken, InFlightRecord>,
    next_token: AtomicU64,
    swept_total: AtomicU64,
}

impl TimeoutRegistry {
    #[must_use]
    pub fn new(table: TimeoutTable) -> Self {
        Self {
            table,
            records: DashMap::new(),
            next_token: AtomicU64::new(1),
            swept_total: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn table(&self) -> &TimeoutTable {
        &self.table
    }

    /// Effective budget for `operation`, clamped to the ceiling.
    #[must_use]
    pub fn budget(&self, operation: &str, requested: Option<Duration>) -> TimeoutBudget {
        self.table.budget_with_request(operation, requested)
    }

    /// Registers an in-flight operation and returns its deadline.
    pub fn admit(
        &self,
        correlation_id: CorrelationId,
        operation: &str,
        requested: Option<Duration>,
    ) -> Admission {
        let now = Instant::now();
        self.sweep(now);

        let budget = self.budget(operation, requested);
        if budget.clamped {
            debug!(
                operation,
                configured_ms = millis(budget.configured),
                ceiling_ms = self.table.ceiling_ms,
                "timeout clamped to ceiling"
            );
        }
        let token = OperationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let deadline = now + budget.duration;
        let cancel = CancellationToken::new();
        self.records.insert(
            token,
            InFlightRecord {
                correlation_id,
                operation: operation.to_string(),
                started: now,
                deadline,
                cancel: cancel.clone(),
            },
        );
        metrics::gauge!("gateway_in_flight_operations").increment(1.0);

        Admission {
            token,
            deadline,
            budget,
            cancel,
        }
    }

    /// Removes the record. Returns `false` (and does nothing) if it was
    /// already completed, cancelled or swept.
    pub fn complete(&self, token: OperationToken) -> bool {
        let removed = self.records.remove(&token).is_some();
        if removed {
            metrics::gauge!("gateway_in_flight_operations").decrement(1.0);
        }
        removed
    }

    /// Fires the record's cancellation token and removes it. A no-op for
    /// tokens no longer in flight.
    pub fn cancel(&self, token: OperationToken) -> bool {
        match self.records.remove(&token) {
            Some((_, record)) => {
                record.cancel.cancel();
                metrics::gauge!("gateway_in_flight_operations").decrement(1.0);
                debug!(operation = %record.operation, correlation_id = %record.correlation_id, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels and removes every record whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut swept = 0usize;
        self.records.retain(|_, record| {
            if record.deadline > now {
                return true;
            }
            record.cancel.cancel();
            warn!(
                operation = %record.operation,
                correlation_id = %record.correlation_id,
                elapsed_ms = millis(now.duration_since(record.started)),
                "in-flight operation passed its deadline, cancelled"
            );
            swept += 1;
            false
        });
        if swept > 0 {
            let count = swept as u64;
            self.swept_total.fetch_add(count, Ordering::Relaxed);
            metrics::counter!("gateway_timeouts_swept_total").increment(count);
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!("gateway_in_flight_operations").decrement(swept as f64);
        }
        swept
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_in_flight(&self, token: OperationToken) -> bool {
        self.records.contains_key(&token)
    }

    /// Total records removed by sweeps since start.
    #[must_use]
    pub fn swept_total(&self) -> u64 {
        self.swept_total.load(Ordering::Relaxed)
    }

    /// Snapshot of every in-flight operation, oldest first.
    #[must_use]
    pub fn in_flight(&self) -> Vec<InFlightSnapshot> {
        let now = Instant::now();
        let mut list: Vec<(Instant, InFlightSnapshot)> = self
            .records
            .iter()
            .map(|entry| {
                let record = entry.value();
                (
                    record.started,
                    InFlightSnapshot {
                        token: *entry.key(),
                        correlation_id: record.correlation_id,
                        operation: record.operation.clone(),
                        elapsed_ms: millis(now.duration_since(record.started)),
                        remaining_ms: millis(record.deadline.saturating_duration_since(now)),
                    },
                )
            })
            .collect();
        list.sort_by_key(|(started, snapshot)| (*started, snapshot.token.0));
        list.into_iter().map(|(_, snapshot)| snapshot).collect()
    }
}
