use std::collections::VecDeque;

/// Bounded memory of recently processed push transaction ids.
///
/// The homeserver retries a transaction until it is acknowledged, so a
/// transaction id seen here has already produced its side effects.
#[derive(Debug, Clone)]
pub struct TransactionHistory {
    capacity: usize,
    ids: VecDeque<String>,
}

impl TransactionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ids: VecDeque::with_capacity(capacity),
        }
    }

    pub fn contains(&self, txn_id: &str) -> bool {
        self.ids.iter().any(|id| id == txn_id)
    }

    /// Records a processed id, evicting the oldest one when full.
    pub fn record(&mut self, txn_id: impl Into<String>) {
        let txn_id = txn_id.into();
        if self.contains(&txn_id) {
            return;
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(txn_id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
