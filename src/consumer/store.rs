//! Consumer state persistence
//!
//! Durables survive restarts through this capability; ephemerals ride the
//! memory implementation. Writes are per-transition (`update_delivered`,
//! `update_acks`) so a replica or a restarted leader can resume exactly
//! where the last committed transition left off.

use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::consumer::config::{AckPolicy, ConsumerConfig};
use crate::consumer::state::ConsumerCursor;
use crate::stream::store::StoreError;

pub trait ConsumerStore: Send + Sync {
    fn update_config(&self, cfg: &ConsumerConfig) -> Result<(), StoreError>;
    /// Full-state write. Entries with a zero delivery sequence are invalid
    /// and refused.
    fn update(&self, cursor: &ConsumerCursor) -> Result<(), StoreError>;
    fn update_delivered(&self, dseq: u64, sseq: u64, dc: u64, ts_ns: i64)
        -> Result<(), StoreError>;
    fn update_acks(&self, dseq: u64, sseq: u64) -> Result<(), StoreError>;
    fn state(&self) -> Result<ConsumerCursor, StoreError>;
    fn has_state(&self) -> bool;
    fn set_starting(&self, sseq: u64) -> Result<(), StoreError>;
    fn delete(&self) -> Result<(), StoreError>;
    fn stop(&self) -> Result<(), StoreError>;
}

fn refuse_zero_dseq(cursor: &ConsumerCursor) -> Result<(), StoreError> {
    if cursor.pending.values().any(|p| p.deliver_seq == 0) {
        warn!("Refusing to persist pending entry with zero delivery sequence");
        return Err(StoreError::Io(
            "pending entry with zero delivery sequence".to_string(),
        ));
    }
    Ok(())
}

// ==========================================
// MEMORY STORE
// ==========================================

#[derive(Default)]
struct MemoryConsumerInner {
    cursor: ConsumerCursor,
    cfg: Option<ConsumerConfig>,
    dirty: bool,
    closed: bool,
}

#[derive(Default)]
pub struct MemoryConsumerStore {
    inner: Mutex<MemoryConsumerInner>,
}

impl MemoryConsumerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumerStore for MemoryConsumerStore {
    fn update_config(&self, cfg: &ConsumerConfig) -> Result<(), StoreError> {
        self.inner.lock().cfg = Some(cfg.clone());
        Ok(())
    }

    fn update(&self, cursor: &ConsumerCursor) -> Result<(), StoreError> {
        refuse_zero_dseq(cursor)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.cursor = cursor.clone();
        inner.dirty = true;
        Ok(())
    }

    fn update_delivered(
        &self,
        dseq: u64,
        sseq: u64,
        dc: u64,
        ts_ns: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let ack = inner
            .cfg
            .as_ref()
            .map(|c| c.ack_policy)
            .unwrap_or(AckPolicy::Explicit);
        inner.cursor.apply_delivered(dseq, sseq, dc, ts_ns, ack);
        inner.dirty = true;
        Ok(())
    }

    fn update_acks(&self, dseq: u64, sseq: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.cursor.apply_ack(dseq, sseq);
        inner.dirty = true;
        Ok(())
    }

    fn state(&self) -> Result<ConsumerCursor, StoreError> {
        Ok(self.inner.lock().cursor.clone())
    }

    fn has_state(&self) -> bool {
        self.inner.lock().dirty
    }

    fn set_starting(&self, sseq: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.cursor = ConsumerCursor::starting_at(sseq);
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.cursor = ConsumerCursor::default();
        inner.dirty = false;
        inner.closed = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), StoreError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

// ==========================================
// FILE STORE
// ==========================================

/// JSON snapshot on every transition, written tmp-then-rename so a crash
/// never leaves a torn state file behind.
pub struct FileConsumerStore {
    path: PathBuf,
    inner: Mutex<MemoryConsumerInner>,
}

impl FileConsumerStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut inner = MemoryConsumerInner::default();
        if path.exists() {
            let raw = fs::read(&path).map_err(|e| StoreError::Io(e.to_string()))?;
            match serde_json::from_slice::<ConsumerCursor>(&raw) {
                Ok(cursor) => {
                    inner.cursor = cursor;
                    inner.dirty = true;
                }
                Err(e) => {
                    error!("Consumer state file {:?} unreadable, starting clean: {}", path, e);
                }
            }
        } else if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn write_snapshot(&self, cursor: &ConsumerCursor) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(cursor).map_err(|e| StoreError::Io(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))
    }
}

impl ConsumerStore for FileConsumerStore {
    fn update_config(&self, cfg: &ConsumerConfig) -> Result<(), StoreError> {
        self.inner.lock().cfg = Some(cfg.clone());
        Ok(())
    }

    fn update(&self, cursor: &ConsumerCursor) -> Result<(), StoreError> {
        refuse_zero_dseq(cursor)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.cursor = cursor.clone();
        inner.dirty = true;
        self.write_snapshot(&inner.cursor)
    }

    fn update_delivered(
        &self,
        dseq: u64,
        sseq: u64,
        dc: u64,
        ts_ns: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let ack = inner
            .cfg
            .as_ref()
            .map(|c| c.ack_policy)
            .unwrap_or(AckPolicy::Explicit);
        inner.cursor.apply_delivered(dseq, sseq, dc, ts_ns, ack);
        inner.dirty = true;
        self.write_snapshot(&inner.cursor)
    }

    fn update_acks(&self, dseq: u64, sseq: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.cursor.apply_ack(dseq, sseq);
        inner.dirty = true;
        self.write_snapshot(&inner.cursor)
    }

    fn state(&self) -> Result<ConsumerCursor, StoreError> {
        Ok(self.inner.lock().cursor.clone())
    }

    fn has_state(&self) -> bool {
        self.inner.lock().dirty
    }

    fn set_starting(&self, sseq: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.cursor = ConsumerCursor::starting_at(sseq);
        self.write_snapshot(&inner.cursor)
    }

    fn delete(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.dirty = false;
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), StoreError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}
