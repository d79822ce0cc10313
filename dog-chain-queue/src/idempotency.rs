//! Deduplication of repeated submissions.
//!
//! A key maps to at most one job id. The index itself is not atomic across
//! `reserve` + `bind`; the engine runs that sequence inside its own critical
//! section.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{JobId, QueueResult};

#[derive(Default)]
pub struct IdempotencyIndex {
    keys: RwLock<HashMap<String, JobId>>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job currently bound to `key`, if any
    pub fn reserve(&self, key: &str) -> Option<JobId> {
        self.keys.read().get(key).cloned()
    }

    pub fn bind(&self, key: impl Into<String>, id: JobId) {
        self.keys.write().insert(key.into(), id);
    }

    pub fn release(&self, key: &str) -> Option<JobId> {
        self.keys.write().remove(key)
    }

    /// Release `key` only while it still points at `id`
    pub fn release_if_bound(&self, key: &str, id: &JobId) -> bool {
        let mut keys = self.keys.write();
        if keys.get(key) == Some(id) {
            keys.remove(key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Derive a key from the job type and a key-sorted serialization of the payload.
///
/// The result is the lowercase hex SHA-256 of `"{job_type}:{canonical_json}"`,
/// so two payloads that differ only in object key order share a key.
pub fn derive_idempotency_key(job_type: &str, payload: &Value) -> QueueResult<String> {
    let canonical = canonical_json(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compact JSON with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> QueueResult<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> QueueResult<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(value, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
