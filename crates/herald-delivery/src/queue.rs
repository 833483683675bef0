//! Bounded in-memory queue store.
//!
//! The store owns every live record. A record is in exactly one place:
//!
//! - `pending`: FIFO of records eligible for the next batch
//! - `delayed`: records waiting out a retry backoff, ordered by
//!   `next_attempt_at`
//! - `in_flight`: records claimed by the current batch, in batch order
//! - `history`: terminal records kept for status queries until cleanup
//!
//! The capacity bound covers the first three. The store itself is plain
//! synchronous data; callers share it behind a `tokio::sync::Mutex`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use herald_core::{
    error::{HeraldError, Result},
    models::{NotificationId, NotificationRecord, NotificationStatus, Priority},
};
use serde::{Deserialize, Serialize};

/// How a settled record was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Outcome was applied.
    Applied,
    /// Record had been cancelled while in flight; outcome was discarded.
    Discarded,
}

/// Composition of the live queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBreakdown {
    /// Waiting records per priority.
    pub by_priority: BTreeMap<Priority, usize>,
    /// Waiting records per kind.
    pub by_kind: BTreeMap<String, usize>,
}

/// In-memory store of notification records.
#[derive(Debug)]
pub struct QueueStore {
    capacity: usize,
    pending: VecDeque<NotificationRecord>,
    delayed: BTreeMap<(DateTime<Utc>, u64), NotificationRecord>,
    delayed_seq: u64,
    in_flight: Vec<NotificationRecord>,
    history: HashMap<NotificationId, NotificationRecord>,
}

impl QueueStore {
    /// Creates an empty store holding at most `capacity` live records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: VecDeque::new(),
            delayed: BTreeMap::new(),
            delayed_seq: 0,
            in_flight: Vec::new(),
            history: HashMap::new(),
        }
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live (non-terminal) records.
    pub fn len(&self) -> usize {
        self.pending.len() + self.delayed.len() + self.in_flight.len()
    }

    /// Whether no live record exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records eligible for the next batch.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Records waiting out a retry delay.
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Records claimed by the current batch.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Terminal records retained for queries.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Whether a batch could make progress at `now`.
    pub fn has_work(&self, now: DateTime<Utc>) -> bool {
        !self.pending.is_empty() || self.delayed.keys().next().is_some_and(|(at, _)| *at <= now)
    }

    /// Appends a record to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` when the store is full.
    pub fn push(&mut self, record: NotificationRecord) -> Result<NotificationId> {
        self.ensure_room(1)?;
        let id = record.id;
        self.pending.push_back(record);
        Ok(id)
    }

    /// Appends all records or none of them.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the whole set does not fit.
    pub fn push_many(&mut self, records: Vec<NotificationRecord>) -> Result<Vec<NotificationId>> {
        self.ensure_room(records.len())?;
        let ids = records.iter().map(|record| record.id).collect();
        self.pending.extend(records);
        Ok(ids)
    }

    fn ensure_room(&self, additional: usize) -> Result<()> {
        if self.len().saturating_add(additional) > self.capacity {
            return Err(HeraldError::CapacityExceeded { capacity: self.capacity });
        }
        Ok(())
    }

    /// Moves every delayed record due at `now` to the tail, earliest first.
    pub fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let mut record = entry.remove();
            record.metadata.next_attempt_at = None;
            self.pending.push_back(record);
            promoted += 1;
        }
        promoted
    }

    /// Claims up to `limit` records from the head for one batch.
    ///
    /// Due retries are promoted first. Records scheduled after `now` are
    /// handed over still `pending` so the processor can put them back
    /// unchanged; all others become `processing`.
    pub fn take_batch(&mut self, limit: usize, now: DateTime<Utc>) -> Vec<NotificationRecord> {
        self.promote_due(now);

        let mut batch = Vec::with_capacity(limit.min(self.pending.len()));
        while batch.len() < limit {
            let Some(mut record) = self.pending.pop_front() else {
                break;
            };
            if record.status != NotificationStatus::Pending {
                tracing::warn!(
                    notification_id = %record.id,
                    status = %record.status,
                    "non-pending record found in queue, moving to history"
                );
                self.history.insert(record.id, record);
                continue;
            }
            if !record.is_scheduled_after(now) {
                record.status = NotificationStatus::Processing;
            }
            self.in_flight.push(record.clone());
            batch.push(record);
        }
        batch
    }

    /// Whether an in-flight record was cancelled.
    pub fn is_cancelled(&self, id: NotificationId) -> bool {
        self.in_flight
            .iter()
            .any(|record| record.id == id && record.status == NotificationStatus::Cancelled)
    }

    /// Puts an in-flight record back at the tail without any change.
    pub fn requeue(&mut self, id: NotificationId) -> Settlement {
        let Some(mut record) = self.take_in_flight(id) else {
            return Settlement::Discarded;
        };
        if record.status == NotificationStatus::Cancelled {
            self.history.insert(record.id, record);
            return Settlement::Discarded;
        }
        if record.status == NotificationStatus::Processing {
            record.status = NotificationStatus::Pending;
        }
        self.pending.push_back(record);
        Settlement::Applied
    }

    /// Puts in-flight records back at the head, keeping their order.
    ///
    /// Used when a batch stops early; no retry penalty is applied.
    pub fn return_to_front(&mut self, ids: &[NotificationId]) -> usize {
        let mut restored = 0;
        for id in ids.iter().rev() {
            let Some(mut record) = self.take_in_flight(*id) else {
                continue;
            };
            if record.status == NotificationStatus::Cancelled {
                self.history.insert(record.id, record);
                continue;
            }
            record.status = NotificationStatus::Pending;
            self.pending.push_front(record);
            restored += 1;
        }
        restored
    }

    /// Returns everything still in flight to the head of the queue.
    pub fn recover_in_flight(&mut self) -> usize {
        let ids = self.in_flight.iter().map(|record| record.id).collect::<Vec<_>>();
        self.return_to_front(&ids)
    }

    /// Applies the outcome of a delivery attempt.
    ///
    /// `record` carries the new status: `pending` with a `next_attempt_at`
    /// parks it for retry, a terminal status moves it to history. If the
    /// record was cancelled while in flight the outcome is discarded.
    pub fn settle(&mut self, record: NotificationRecord) -> Settlement {
        let Some(current) = self.take_in_flight(record.id) else {
            return Settlement::Discarded;
        };
        if current.status == NotificationStatus::Cancelled {
            self.history.insert(current.id, current);
            return Settlement::Discarded;
        }

        match (record.status, record.metadata.next_attempt_at) {
            (NotificationStatus::Pending, Some(at)) => {
                self.delayed_seq += 1;
                self.delayed.insert((at, self.delayed_seq), record);
            },
            (NotificationStatus::Pending, None) => self.pending.push_back(record),
            _ => {
                self.history.insert(record.id, record);
            },
        }
        Settlement::Applied
    }

    fn take_in_flight(&mut self, id: NotificationId) -> Option<NotificationRecord> {
        let index = self.in_flight.iter().position(|record| record.id == id)?;
        Some(self.in_flight.remove(index))
    }

    /// Cancels a non-terminal record.
    ///
    /// Waiting records move straight to history. In-flight records are only
    /// marked; the batch discards their outcome when it settles. Returns the
    /// cancelled snapshot, or `None` if the record is unknown or terminal.
    pub fn cancel(&mut self, id: NotificationId, now: DateTime<Utc>) -> Option<NotificationRecord> {
        if let Some(record) = self.in_flight.iter_mut().find(|record| record.id == id) {
            mark_cancelled(record, now).ok()?;
            return Some(record.clone());
        }

        let mut record = if let Some(index) = self.pending.iter().position(|r| r.id == id) {
            self.pending.remove(index)?
        } else {
            let key = *self.delayed.iter().find(|(_, record)| record.id == id)?.0;
            self.delayed.remove(&key)?
        };

        if mark_cancelled(&mut record, now).is_err() {
            // Terminal records never sit in the live queue; keep it anyway.
            self.history.insert(record.id, record);
            return None;
        }
        self.history.insert(record.id, record.clone());
        Some(record)
    }

    /// Snapshot of a record wherever it lives.
    pub fn find(&self, id: NotificationId) -> Option<NotificationRecord> {
        self.pending
            .iter()
            .chain(self.in_flight.iter())
            .chain(self.delayed.values())
            .find(|record| record.id == id)
            .or_else(|| self.history.get(&id))
            .cloned()
    }

    /// Drops terminal records completed more than `max_age` before `now`.
    pub fn cleanup(&mut self, now: DateTime<Utc>, max_age: chrono::Duration) -> usize {
        let cutoff = now - max_age;
        let before = self.history.len();
        self.history.retain(|_, record| {
            record.metadata.completed_at.unwrap_or(record.metadata.created_at) >= cutoff
        });
        before - self.history.len()
    }

    /// Counts waiting records by priority and kind. O(n).
    pub fn breakdown(&self) -> QueueBreakdown {
        let mut breakdown = QueueBreakdown::default();
        for record in self.pending.iter().chain(self.delayed.values()) {
            *breakdown.by_priority.entry(record.priority).or_default() += 1;
            *breakdown.by_kind.entry(record.kind.clone()).or_default() += 1;
        }
        breakdown
    }
}

fn mark_cancelled(record: &mut NotificationRecord, now: DateTime<Utc>) -> Result<()> {
    record.transition(NotificationStatus::Cancelled)?;
    record.metadata.completed_at = Some(now);
    record.metadata.next_attempt_at = None;
    Ok(())
}
