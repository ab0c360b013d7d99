use chrono::DateTime;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    store::{keys, Store},
};

/// Longest message accepted into an entry.
pub const MAX_LOG_MESSAGE_BYTES: usize = 512;
pub const MAX_LOG_FILENAME_BYTES: usize = 128;
/// Upper bound on one encoded entry in the store. Must stay below the
/// smallest backend string slot.
pub const MAX_STORED_ENTRY_BYTES: usize = 1_536;

/// Device state captured with every queued log line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStatusStamp {
    pub wifi_rssi_level: i32,
    pub wifi_status: String,
    pub refresh_rate: u32,
    pub time_since_last_sleep: u64,
    pub current_fw_version: String,
    pub special_function: String,
    pub battery_voltage: f32,
    pub wakeup_reason: String,
    pub free_heap_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogEntry {
    pub log_id: u32,
    pub creation_timestamp: u64,
    pub created_at: Option<String>,
    pub log_message: String,
    pub device_status_stamp: DeviceStatusStamp,
    pub filename_current: String,
    pub filename_new: String,
    pub retry_attempt: u32,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, stamp: DeviceStatusStamp, timestamp: u64) -> Self {
        let created_at = i64::try_from(timestamp)
            .ok()
            .filter(|ts| *ts > 0)
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.to_rfc3339());
        Self {
            log_id: 0,
            creation_timestamp: timestamp,
            created_at,
            log_message: clipped(message.into(), MAX_LOG_MESSAGE_BYTES),
            device_status_stamp: stamp,
            ..Self::default()
        }
    }

    pub fn with_filenames(mut self, current: &str, new: &str) -> Self {
        self.filename_current = clipped(current.to_string(), MAX_LOG_FILENAME_BYTES);
        self.filename_new = clipped(new.to_string(), MAX_LOG_FILENAME_BYTES);
        self
    }

    pub fn with_retry_attempt(mut self, attempt: u32) -> Self {
        self.retry_attempt = attempt;
        self
    }

    /// Halves the longest free-text field. False once all of them are empty.
    fn shrink(&mut self) -> bool {
        let longest = [
            &mut self.log_message,
            &mut self.filename_current,
            &mut self.filename_new,
        ]
        .into_iter()
        .max_by_key(|text| text.len());
        match longest {
            Some(text) if !text.is_empty() => {
                let half = text.len() / 2;
                *text = clipped(std::mem::take(text), half);
                true
            }
            _ => false,
        }
    }
}

/// Truncates to at most `max` bytes on a char boundary.
fn clipped(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

fn encode(entry: &LogEntry) -> Result<String, StoreError> {
    serde_json::to_string(entry).map_err(|err| StoreError::Corrupt {
        key: keys::LOG_ID.to_string(),
        reason: err.to_string(),
    })
}

/// Result of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDrain {
    /// Offline or nothing queued.
    Idle,
    Submitted(usize),
    /// Submit failed; entries stay queued.
    Kept(usize),
}

#[derive(Debug, Serialize)]
struct LogBatch<'a> {
    logs: &'a [LogEntry],
}

/// Bounded log queue kept in the store.
///
/// Slots `0..capacity/2` keep the first entries accepted since the last
/// successful submit; the remaining slots form a ring of the newest entries,
/// indexed by `log_head`. Overflow overwrites the oldest ring entry, so the
/// newest `capacity/2` entries always survive.
#[derive(Debug, Clone, Copy)]
pub struct LogQueue {
    capacity: usize,
}

impl LogQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity: capacity + capacity % 2,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn pinned(&self) -> usize {
        self.capacity / 2
    }

    fn ring(&self) -> usize {
        self.capacity - self.pinned()
    }

    /// Hands out the next sequence id and persists the counter.
    pub fn next_id(&self, store: &mut dyn Store) -> Result<u32, StoreError> {
        let id = store.u32_or(keys::LOG_ID, 1)?;
        store.put_u32(keys::LOG_ID, id.wrapping_add(1).max(1))?;
        Ok(id)
    }

    /// Assigns a sequence id and stores the entry.
    pub fn push(&self, store: &mut dyn Store, mut entry: LogEntry) -> Result<u32, StoreError> {
        entry.log_id = self.next_id(store)?;
        let mut raw = encode(&entry)?;
        while raw.len() > MAX_STORED_ENTRY_BYTES && entry.shrink() {
            raw = encode(&entry)?;
        }

        for slot in 0..self.pinned() {
            let key = keys::log_slot(slot);
            if !store.contains(&key)? {
                store.put_str(&key, &raw)?;
                return Ok(entry.log_id);
            }
        }

        let head = store.u32_or(keys::LOG_HEAD, 0)?;
        let slot = self.pinned() + head as usize % self.ring();
        store.put_str(&keys::log_slot(slot), &raw)?;
        store.put_u32(keys::LOG_HEAD, head.wrapping_add(1))?;
        Ok(entry.log_id)
    }

    /// Entries oldest first. Unreadable slots are skipped.
    pub fn entries(&self, store: &dyn Store) -> Result<Vec<LogEntry>, StoreError> {
        let mut order: Vec<usize> = (0..self.pinned()).collect();

        let head = store.u32_or(keys::LOG_HEAD, 0)? as usize;
        let ring = self.ring();
        if head <= ring {
            order.extend((0..head).map(|i| self.pinned() + i));
        } else {
            order.extend((0..ring).map(|i| self.pinned() + (head + i) % ring));
        }

        let mut entries = Vec::with_capacity(self.capacity);
        for slot in order {
            let key = keys::log_slot(slot);
            let Some(raw) = store.get_str(&key)? else {
                continue;
            };
            match serde_json::from_str::<LogEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!("dropping unreadable log slot {key}: {err}"),
            }
        }
        Ok(entries)
    }

    pub fn len(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let mut count = 0;
        for slot in 0..self.capacity {
            if store.contains(&keys::log_slot(slot))? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self, store: &dyn Store) -> Result<bool, StoreError> {
        Ok(self.len(store)? == 0)
    }

    /// Removes every entry. The sequence id keeps counting.
    pub fn clear(&self, store: &mut dyn Store) -> Result<(), StoreError> {
        for slot in 0..self.capacity {
            store.remove(&keys::log_slot(slot))?;
        }
        store.remove(keys::LOG_HEAD)?;
        Ok(())
    }

    pub fn batch_body(entries: &[LogEntry]) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&LogBatch { logs: entries })
    }

    /// Submits every queued entry in one batch. The queue is cleared only when
    /// `submit` reports success.
    pub fn drain_if_connected(
        &self,
        store: &mut dyn Store,
        connected: bool,
        submit: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<LogDrain, StoreError> {
        if !connected {
            return Ok(LogDrain::Idle);
        }
        let entries = self.entries(store)?;
        if entries.is_empty() {
            return Ok(LogDrain::Idle);
        }

        let body = match Self::batch_body(&entries) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to serialize {} log entries: {err}", entries.len());
                return Ok(LogDrain::Kept(entries.len()));
            }
        };

        if !submit(&body) {
            return Ok(LogDrain::Kept(entries.len()));
        }

        self.clear(store)?;
        info!("submitted {} log entries", entries.len());
        Ok(LogDrain::Submitted(entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(message, DeviceStatusStamp::default(), 1_700_000_000)
    }

    fn messages(queue: &LogQueue, store: &MemoryStore) -> Vec<String> {
        queue
            .entries(store)
            .unwrap()
            .into_iter()
            .map(|entry| entry.log_message)
            .collect()
    }

    #[test]
    fn ids_are_monotonic_and_persisted() {
        let queue = LogQueue::new(4);
        let mut store = MemoryStore::new();
        assert_eq!(queue.push(&mut store, entry("a")).unwrap(), 1);
        assert_eq!(queue.push(&mut store, entry("b")).unwrap(), 2);

        queue.clear(&mut store).unwrap();
        assert_eq!(queue.push(&mut store, entry("c")).unwrap(), 3);
        assert_eq!(store.get_u32(keys::LOG_ID).unwrap(), Some(4));
    }

    #[test]
    fn never_exceeds_capacity_and_keeps_newest_half() {
        let queue = LogQueue::new(10);
        let mut store = MemoryStore::new();

        for i in 0..37 {
            queue.push(&mut store, entry(&format!("m{i}"))).unwrap();
            let len = queue.len(&store).unwrap();
            assert!(len <= 10);

            let kept = messages(&queue, &store);
            let newest = (i + 1).min(5);
            for j in (i + 1 - newest)..=i {
                assert!(kept.contains(&format!("m{j}")), "m{j} evicted after m{i}");
            }
        }

        assert_eq!(
            messages(&queue, &store),
            vec!["m0", "m1", "m2", "m3", "m4", "m32", "m33", "m34", "m35", "m36"]
        );
    }

    #[test]
    fn overflow_evicts_oldest_ring_entry_first() {
        let queue = LogQueue::new(4);
        let mut store = MemoryStore::new();
        for name in ["a", "b", "c", "d", "e"] {
            queue.push(&mut store, entry(name)).unwrap();
        }
        assert_eq!(messages(&queue, &store), vec!["a", "b", "d", "e"]);
    }

    #[test]
    fn drain_clears_only_on_success() {
        let queue = LogQueue::new(4);
        let mut store = MemoryStore::new();
        queue.push(&mut store, entry("boot")).unwrap();

        assert_eq!(
            queue.drain_if_connected(&mut store, false, &mut |_| true).unwrap(),
            LogDrain::Idle
        );
        assert_eq!(
            queue.drain_if_connected(&mut store, true, &mut |_| false).unwrap(),
            LogDrain::Kept(1)
        );
        assert_eq!(queue.len(&store).unwrap(), 1);

        let mut sent = Vec::new();
        let drained = queue
            .drain_if_connected(&mut store, true, &mut |body| {
                sent.extend_from_slice(body);
                true
            })
            .unwrap();
        assert_eq!(drained, LogDrain::Submitted(1));
        assert!(queue.is_empty(&store).unwrap());

        let json: serde_json::Value = serde_json::from_slice(&sent).unwrap();
        assert_eq!(json["logs"][0]["log_message"], "boot");
        assert_eq!(json["logs"][0]["log_id"], 1);
        assert_eq!(json["logs"][0]["created_at"], "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn oversized_text_is_clipped_on_char_boundaries() {
        let long = "é".repeat(2_000);
        let entry = LogEntry::new(long.clone(), DeviceStatusStamp::default(), 0)
            .with_filenames(&long, "next.bmp");

        assert!(entry.log_message.len() <= MAX_LOG_MESSAGE_BYTES);
        assert!(entry.log_message.chars().all(|c| c == 'é'));
        assert!(entry.filename_current.len() <= MAX_LOG_FILENAME_BYTES);
        assert_eq!(entry.filename_new, "next.bmp");
    }

    #[test]
    fn stored_entries_fit_the_slot_limit() {
        let queue = LogQueue::new(4);
        let mut store = MemoryStore::new();
        // control characters expand sixfold when escaped
        let noisy = "\u{1}".repeat(4_000);
        let entry = LogEntry::new(noisy.clone(), DeviceStatusStamp::default(), 1_700_000_000)
            .with_filenames(&noisy, &noisy);
        queue.push(&mut store, entry).unwrap();

        let raw = store.get_str(&keys::log_slot(0)).unwrap().unwrap();
        assert!(raw.len() <= MAX_STORED_ENTRY_BYTES, "{} bytes stored", raw.len());
        assert_eq!(queue.entries(&store).unwrap().len(), 1);
    }

    #[test]
    fn empty_queue_does_not_submit() {
        let queue = LogQueue::new(4);
        let mut store = MemoryStore::new();
        let mut calls = 0;
        let drained = queue
            .drain_if_connected(&mut store, true, &mut |_| {
                calls += 1;
                true
            })
            .unwrap();
        assert_eq!(drained, LogDrain::Idle);
        assert_eq!(calls, 0);
    }
}
