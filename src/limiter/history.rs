//! Bounded request history ledger.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::RequestRecord;

/// Default number of records kept.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1_000;

/// FIFO of recent requests. Once full, every push drops the oldest record.
#[derive(Debug)]
pub struct RequestHistory {
    records: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a record and run `inspect` over the resulting history while
    /// still holding the lock.
    pub fn push_and_inspect<R>(&self, record: RequestRecord, inspect: impl FnOnce(&VecDeque<RequestRecord>) -> R) -> R {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        inspect(&records)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every record, oldest first.
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Replace the contents, keeping only the newest `capacity` records.
    pub fn restore(&self, restored: Vec<RequestRecord>) {
        let skip = restored.len().saturating_sub(self.capacity);
        let mut records = self.records.lock();
        records.clear();
        records.extend(restored.into_iter().skip(skip));
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
