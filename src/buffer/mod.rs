//! Durable event buffer: an append-only, sequence-keyed store on sled.
//!
//! Keys are 8-byte big-endian sequence numbers, so sled's ordered iteration
//! is insertion order. Exactly one process may hold the store open; a second
//! opener fails once the acquisition deadline passes. Events survive process
//! restart, and the sequence counter resumes from the highest stored key.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sled::{Batch, Db, Tree};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::Event;

const EVENTS_TREE: &str = "events";

/// How long `open` retries acquiring the store lock before giving up.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors from the durable buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("could not open buffer at {path} within {timeout:?}: {source}")]
    LockTimeout {
        path: String,
        timeout: Duration,
        #[source]
        source: sled::Error,
    },
}

/// Sequence-keyed durable event store.
pub struct Buffer {
    db: Db,
    events: Tree,
    seq: AtomicU64,
    /// Serializes `put_batch` bodies so sequences commit in contiguous
    /// ascending ranges even under concurrent callers.
    write_lock: Mutex<()>,
    max_bytes: u64,
    max_age: Duration,
}

impl Buffer {
    /// Opens (or creates) the buffer at `path`, creating parent directories.
    ///
    /// sled fails fast when another process holds the store lock, so the open
    /// is retried until a 5 second deadline. The in-memory sequence counter
    /// is restored from the highest stored key.
    pub fn open(path: &Path, max_bytes: u64, max_age: Duration) -> Result<Self, BufferError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let deadline = Instant::now() + OPEN_TIMEOUT;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(source) => {
                    if Instant::now() >= deadline {
                        return Err(BufferError::LockTimeout {
                            path: path.display().to_string(),
                            timeout: OPEN_TIMEOUT,
                            source,
                        });
                    }
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        };

        let events = db.open_tree(EVENTS_TREE)?;

        let last_seq = match events.last()? {
            Some((key, _)) => decode_seq(&key),
            None => 0,
        };

        Ok(Self {
            db,
            events,
            seq: AtomicU64::new(last_seq),
            write_lock: Mutex::new(()),
            max_bytes,
            max_age,
        })
    }

    /// Appends all events in one atomic write, assigning each a fresh
    /// sequence in order.
    ///
    /// An event that fails to serialize is skipped with a warning; the rest
    /// of the batch still commits. Its sequence number is consumed, so the
    /// stored range may have gaps but is always ascending.
    pub fn put_batch(&self, events: &[Event]) -> Result<(), BufferError> {
        if events.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().expect("buffer write lock poisoned");

        let mut batch = Batch::default();
        for event in events {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut stored = event.clone();
            stored.event_seq = seq;
            match serde_json::to_vec(&stored) {
                Ok(data) => batch.insert(&encode_seq(seq)[..], data),
                Err(e) => warn!(seq, error = %e, "skipping unserializable event"),
            }
        }

        self.events.apply_batch(batch)?;
        Ok(())
    }

    /// Returns up to `limit` events in ascending sequence order.
    ///
    /// Read-only. Entries that no longer decode are skipped and do not count
    /// toward the limit.
    pub fn peek(&self, limit: usize) -> Result<Vec<Event>, BufferError> {
        let mut events = Vec::new();
        for entry in self.events.iter() {
            if events.len() >= limit {
                break;
            }
            let (_, value) = entry?;
            match serde_json::from_slice::<Event>(&value) {
                Ok(ev) => events.push(ev),
                Err(e) => debug!(error = %e, "skipping undecodable buffer entry"),
            }
        }
        Ok(events)
    }

    /// Removes every entry with sequence `<= up_to_seq`. Idempotent; an
    /// already-empty range is not an error.
    pub fn delete(&self, up_to_seq: u64) -> Result<(), BufferError> {
        let end = encode_seq(up_to_seq);
        let mut batch = Batch::default();
        for entry in self.events.range(..=&end[..]) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        self.events.apply_batch(batch)?;
        Ok(())
    }

    /// Number of buffered events.
    pub fn count(&self) -> usize {
        self.events.len()
    }

    /// Removes entries whose timestamp is older than the retention window.
    /// Returns the number of removed entries.
    pub fn prune(&self) -> Result<usize, BufferError> {
        if self.max_age.is_zero() {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(self.max_age.as_secs() as i64);
        self.prune_at(cutoff)
    }

    /// Two-phase prune against a fixed cutoff: a read-only scan collects
    /// candidate keys into owned copies, then a single atomic batch removes
    /// them. Entries whose timestamp fails to parse are kept; entries that
    /// fail to decode at all are removed.
    pub fn prune_at(&self, cutoff: DateTime<Utc>) -> Result<usize, BufferError> {
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        for entry in self.events.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<Event>(&value) {
                Ok(ev) => {
                    if let Ok(ts) = DateTime::parse_from_rfc3339(&ev.ts) {
                        if ts.with_timezone(&Utc) < cutoff {
                            doomed.push(key.to_vec());
                        }
                    }
                }
                Err(_) => doomed.push(key.to_vec()),
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }

        debug!(count = doomed.len(), "pruning aged buffer entries");
        let mut batch = Batch::default();
        for key in &doomed {
            batch.remove(key.as_slice());
        }
        self.events.apply_batch(batch)?;
        Ok(doomed.len())
    }

    /// On-disk size of the store.
    pub fn size_bytes(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Configured size bound. Reported, not enforced; `prune` by age is the
    /// shrink path.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), BufferError> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn insert_raw(&self, seq: u64, value: &[u8]) {
        self.events
            .insert(&encode_seq(seq)[..], value)
            .expect("raw insert");
        self.seq.fetch_max(seq, Ordering::SeqCst);
    }
}

fn encode_seq(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn decode_seq(key: &[u8]) -> u64 {
    match <[u8; 8]>::try_from(key) {
        Ok(bytes) => u64::from_be_bytes(bytes),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX_BYTES: u64 = 10 * 1024 * 1024;
    const MAX_AGE: Duration = Duration::from_secs(3600);

    fn event(ts: &str, client_ip: &str, qname: &str) -> Event {
        Event {
            ts: ts.to_string(),
            client_ip: client_ip.to_string(),
            qname: qname.to_string(),
            qtype: 1,
            ..Default::default()
        }
    }

    fn now_rfc3339() -> String {
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    }

    #[test]
    fn test_open_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();
        assert_eq!(buf.count(), 0);
        assert!(buf.peek(10).unwrap().is_empty());
        buf.flush().unwrap();
    }

    #[test]
    fn test_put_batch_assigns_ascending_sequences() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        let ts = now_rfc3339();
        buf.put_batch(&[
            event(&ts, "10.0.0.1", "a.com"),
            event(&ts, "10.0.0.2", "b.com"),
            event(&ts, "10.0.0.3", "c.com"),
        ])
        .unwrap();

        assert_eq!(buf.count(), 3);

        let peeked = buf.peek(10).unwrap();
        assert_eq!(peeked.len(), 3);
        assert_eq!(peeked[0].event_seq, 1);
        assert_eq!(peeked[1].event_seq, 2);
        assert_eq!(peeked[2].event_seq, 3);
        assert_eq!(peeked[0].qname, "a.com");
        assert_eq!(peeked[2].qname, "c.com");
    }

    #[test]
    fn test_peek_respects_limit() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        let ts = now_rfc3339();
        let events: Vec<Event> = (0..10)
            .map(|i| event(&ts, "10.0.0.1", &format!("host{i}.com")))
            .collect();
        buf.put_batch(&events).unwrap();

        assert_eq!(buf.peek(5).unwrap().len(), 5);
        assert_eq!(buf.peek(100).unwrap().len(), 10);
    }

    #[test]
    fn test_peek_skips_corrupt_entries() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        let ts = now_rfc3339();
        buf.put_batch(&[event(&ts, "10.0.0.1", "a.com")]).unwrap();
        buf.insert_raw(99, b"not json");
        buf.put_batch(&[event(&ts, "10.0.0.2", "b.com")]).unwrap();

        let peeked = buf.peek(10).unwrap();
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].qname, "a.com");
        assert_eq!(peeked[1].qname, "b.com");
        // The corrupt entry still occupies a key.
        assert_eq!(buf.count(), 3);
    }

    #[test]
    fn test_delete_up_to_sequence() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        let ts = now_rfc3339();
        buf.put_batch(&[
            event(&ts, "10.0.0.1", "a.com"),
            event(&ts, "10.0.0.2", "b.com"),
            event(&ts, "10.0.0.3", "c.com"),
        ])
        .unwrap();

        buf.delete(2).unwrap();
        assert_eq!(buf.count(), 1);

        let remaining = buf.peek(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].qname, "c.com");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        let ts = now_rfc3339();
        buf.put_batch(&[event(&ts, "10.0.0.1", "a.com"), event(&ts, "10.0.0.2", "b.com")])
            .unwrap();

        buf.delete(1).unwrap();
        buf.delete(1).unwrap();
        assert_eq!(buf.count(), 1);

        // A range with no keys at all is fine too.
        buf.delete(0).unwrap();
        assert_eq!(buf.count(), 1);
    }

    #[test]
    fn test_persistence_and_sequence_resume_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("buffer.db");
        let ts = now_rfc3339();

        {
            let buf = Buffer::open(&path, MAX_BYTES, MAX_AGE).unwrap();
            buf.put_batch(&[
                event(&ts, "10.0.0.1", "a.com"),
                event(&ts, "10.0.0.2", "b.com"),
            ])
            .unwrap();
            buf.flush().unwrap();
        }

        let buf = Buffer::open(&path, MAX_BYTES, MAX_AGE).unwrap();
        assert_eq!(buf.count(), 2);

        let before = buf.peek(10).unwrap();
        assert_eq!(before[0].qname, "a.com");
        assert_eq!(before[1].event_seq, 2);

        // New writes continue from the persisted maximum.
        buf.put_batch(&[event(&ts, "10.0.0.3", "c.com")]).unwrap();
        let after = buf.peek(10).unwrap();
        assert_eq!(after[2].event_seq, 3);
    }

    #[test]
    fn test_prune_removes_only_entries_before_cutoff() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        buf.put_batch(&[
            event("2024-01-01T00:00:00Z", "10.0.0.1", "old.com"),
            event("2024-06-01T00:00:00Z", "10.0.0.2", "mid.com"),
            event("2024-12-01T00:00:00Z", "10.0.0.3", "new.com"),
        ])
        .unwrap();

        let cutoff = "2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let removed = buf.prune_at(cutoff).unwrap();
        assert_eq!(removed, 1);

        let remaining = buf.peek(10).unwrap();
        assert_eq!(remaining.len(), 2);
        // The entry exactly at the cutoff survives; only strictly-older go.
        assert_eq!(remaining[0].qname, "mid.com");
        assert_eq!(remaining[1].qname, "new.com");
    }

    #[test]
    fn test_prune_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        buf.put_batch(&[
            event("2024-01-01T00:00:00Z", "10.0.0.1", "old.com"),
            event("2024-12-01T00:00:00Z", "10.0.0.2", "new.com"),
        ])
        .unwrap();

        let cutoff = "2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(buf.prune_at(cutoff).unwrap(), 1);
        assert_eq!(buf.prune_at(cutoff).unwrap(), 0);
        assert_eq!(buf.count(), 1);
    }

    #[test]
    fn test_prune_keeps_unparseable_timestamps() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        buf.put_batch(&[event("not-a-timestamp", "10.0.0.1", "odd.com")])
            .unwrap();

        let cutoff = Utc::now();
        assert_eq!(buf.prune_at(cutoff).unwrap(), 0);
        assert_eq!(buf.count(), 1);
    }

    #[test]
    fn test_prune_removes_undecodable_records() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        buf.insert_raw(1, b"garbage");
        assert_eq!(buf.prune_at(Utc::now()).unwrap(), 1);
        assert_eq!(buf.count(), 0);
    }

    #[test]
    fn test_prune_disabled_when_max_age_zero() {
        let tmp = TempDir::new().unwrap();
        let buf =
            Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, Duration::ZERO).unwrap();

        buf.put_batch(&[event("2000-01-01T00:00:00Z", "10.0.0.1", "ancient.com")])
            .unwrap();
        assert_eq!(buf.prune().unwrap(), 0);
        assert_eq!(buf.count(), 1);
    }

    #[test]
    fn test_size_bytes_reports_on_disk_footprint() {
        let tmp = TempDir::new().unwrap();
        let buf = Buffer::open(&tmp.path().join("buffer.db"), MAX_BYTES, MAX_AGE).unwrap();

        let ts = now_rfc3339();
        let events: Vec<Event> = (0..100)
            .map(|i| event(&ts, "192.168.1.100", &format!("host{i}.example.com")))
            .collect();
        buf.put_batch(&events).unwrap();
        buf.flush().unwrap();

        assert!(buf.size_bytes() > 0);
        assert_eq!(buf.max_bytes(), MAX_BYTES);
    }
}
