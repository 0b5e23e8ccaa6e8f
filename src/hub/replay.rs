//! Bounded per-execution ring buffer of recent records.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::model::EventRecord;

/// Keeps the most recent `capacity` records, oldest first.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    records: VecDeque<Arc<EventRecord>>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a record, evicting and returning the oldest one when full.
    pub fn push(&mut self, record: Arc<EventRecord>) -> Option<Arc<EventRecord>> {
        if self.capacity == 0 {
            return Some(record);
        }
        let evicted = if self.records.len() >= self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventRecord>> {
        self.records.iter()
    }

    pub fn snapshot(&self) -> Vec<Arc<EventRecord>> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::Utc;

    fn record(seq: u64) -> Arc<EventRecord> {
        Arc::new(EventRecord {
            id: EventId::new(),
            timestamp: Utc::now(),
            sequence: Some(seq),
            source: Source::System,
            entry_type: "tick".to_string(),
            category: Category::System,
            summary: format!("tick {seq}"),
            details: serde_json::Value::Null,
            duration_ms: None,
            correlation: Correlation::default(),
        })
    }

    #[test]
    fn keeps_most_recent_capacity_records_oldest_first() {
        let mut buf = ReplayBuffer::new(5);
        for seq in 1..=8 {
            buf.push(record(seq));
            assert!(buf.len() <= 5);
        }
        let seqs: Vec<u64> = buf.iter().filter_map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn push_reports_evicted_record() {
        let mut buf = ReplayBuffer::new(1);
        assert!(buf.push(record(1)).is_none());
        let evicted = buf.push(record(2)).expect("first record evicted");
        assert_eq!(evicted.sequence, Some(1));
    }

    #[test]
    fn zero_capacity_buffers_nothing() {
        let mut buf = ReplayBuffer::new(0);
        buf.push(record(1));
        assert!(buf.is_empty());
    }
}
