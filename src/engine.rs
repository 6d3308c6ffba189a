//! Data engine
//!
//! Holds the three value families (scalar strings, field maps, ordered
//! sets) plus the expiry index. [`Store`] is the unlocked state with every
//! operation on it; [`Engine`] wraps it in a single engine-wide exclusion so
//! each operation is atomic from the caller's perspective, and hands out the
//! guard directly when a caller needs several steps under one acquisition
//! (the dispatch path holds it across apply + log enqueue + broadcast).
//!
//! Key names are shared across families: the same name may simultaneously
//! hold a scalar, a field map, and an ordered set. `DEL`, `EXISTS`,
//! `EXPIRE`, `TTL` and expiry sampling act on whichever families hold the
//! name.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use rand::Rng;

use crate::zset::ZSetRecord;

/// Scalar value plus expiry (negative = never)
#[derive(Debug, Clone)]
pub struct ScalarRecord {
    pub value: Vec<u8>,
    pub expire_at_ms: i64,
}

/// Field map plus expiry (negative = never)
#[derive(Debug, Clone)]
pub struct HashRecord {
    pub fields: HashMap<Vec<u8>, Vec<u8>>,
    pub expire_at_ms: i64,
}

impl Default for HashRecord {
    fn default() -> Self {
        HashRecord {
            fields: HashMap::new(),
            expire_at_ms: -1,
        }
    }
}

/// Stable copy of one scalar record
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarSnapshot {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expire_at_ms: i64,
}

/// Stable copy of one field-map record
#[derive(Debug, Clone, PartialEq)]
pub struct HashSnapshot {
    pub key: Vec<u8>,
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
    pub expire_at_ms: i64,
}

/// Stable copy of one ordered-set record, always materialized in total order
#[derive(Debug, Clone, PartialEq)]
pub struct ZSetSnapshot {
    pub key: Vec<u8>,
    pub items: Vec<(f64, Vec<u8>)>,
    pub expire_at_ms: i64,
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The unlocked engine state
#[derive(Default)]
pub struct Store {
    strings: HashMap<Vec<u8>, ScalarRecord>,
    hashes: HashMap<Vec<u8>, HashRecord>,
    zsets: HashMap<Vec<u8>, ZSetRecord>,
    /// key → expire_at_ms for every key with a finite expiry, any family
    expire_index: HashMap<Vec<u8>, i64>,
}

impl Store {
    // =========================================================================
    // Scalar operations
    // =========================================================================

    /// Overwrite the scalar record. A supplied TTL becomes `now + ttl_ms`;
    /// without one any prior expiry is cleared.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>, ttl_ms: Option<i64>) {
        let expire_at = match ttl_ms {
            Some(ttl) => now_ms() + ttl,
            None => -1,
        };
        self.set_with_expire_at(key, value, expire_at);
    }

    /// Overwrite the scalar record with an absolute expiry (snapshot loads)
    pub fn set_with_expire_at(&mut self, key: Vec<u8>, value: Vec<u8>, expire_at_ms: i64) {
        if expire_at_ms >= 0 {
            self.expire_index.insert(key.clone(), expire_at_ms);
        } else {
            self.expire_index.remove(&key);
        }
        self.strings.insert(key, ScalarRecord { value, expire_at_ms });
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.cleanup_if_expired_scalar(key, now_ms());
        self.strings.get(key).map(|r| r.value.clone())
    }

    // =========================================================================
    // Cross-family operations
    // =========================================================================

    /// Remove every record under each key name; returns the number of key
    /// names that held at least one record.
    pub fn del(&mut self, keys: &[Vec<u8>]) -> i64 {
        let now = now_ms();
        let mut removed = 0;
        for key in keys {
            self.cleanup_if_expired_any(key, now);
            let mut any = false;
            any |= self.strings.remove(key.as_slice()).is_some();
            any |= self.hashes.remove(key.as_slice()).is_some();
            any |= self.zsets.remove(key.as_slice()).is_some();
            if any {
                self.expire_index.remove(key.as_slice());
                removed += 1;
            }
        }
        removed
    }

    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.cleanup_if_expired_any(key, now_ms());
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.zsets.contains_key(key)
    }

    /// Set (or, with negative seconds, clear) the expiry of whichever
    /// families hold the key. Returns false when no record exists.
    pub fn expire(&mut self, key: &[u8], seconds: i64) -> bool {
        let now = now_ms();
        self.cleanup_if_expired_any(key, now);
        let expire_at = if seconds < 0 {
            -1
        } else {
            now + seconds.saturating_mul(1000)
        };

        let mut found = false;
        if let Some(rec) = self.strings.get_mut(key) {
            rec.expire_at_ms = expire_at;
            found = true;
        }
        if let Some(rec) = self.hashes.get_mut(key) {
            rec.expire_at_ms = expire_at;
            found = true;
        }
        if let Some(rec) = self.zsets.get_mut(key) {
            rec.expire_at_ms = expire_at;
            found = true;
        }
        if !found {
            return false;
        }
        if expire_at >= 0 {
            self.expire_index.insert(key.to_vec(), expire_at);
        } else {
            self.expire_index.remove(key);
        }
        true
    }

    /// Seconds until expiry rounded down; -1 when persistent, -2 when absent
    pub fn ttl(&mut self, key: &[u8]) -> i64 {
        let now = now_ms();
        self.cleanup_if_expired_any(key, now);
        let expire_at = if let Some(rec) = self.strings.get(key) {
            rec.expire_at_ms
        } else if let Some(rec) = self.hashes.get(key) {
            rec.expire_at_ms
        } else if let Some(rec) = self.zsets.get(key) {
            rec.expire_at_ms
        } else {
            return -2;
        };
        if expire_at < 0 {
            return -1;
        }
        let ms_left = expire_at - now;
        if ms_left <= 0 {
            // expired between the cleanup above and this read
            return -2;
        }
        ms_left / 1000
    }

    /// All live key names across families, sorted and de-duplicated
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let now = now_ms();
        let mut out = Vec::with_capacity(self.strings.len() + self.hashes.len() + self.zsets.len());
        for (key, rec) in &self.strings {
            if !expired(rec.expire_at_ms, now) {
                out.push(key.clone());
            }
        }
        for (key, rec) in &self.hashes {
            if !expired(rec.expire_at_ms, now) {
                out.push(key.clone());
            }
        }
        for (key, rec) in &self.zsets {
            if !expired(rec.expire_at_ms, now) {
                out.push(key.clone());
            }
        }
        out.sort();
        out.dedup();
        out
    }

    // =========================================================================
    // Field-map operations
    // =========================================================================

    /// Returns 1 when the field is new within the key, 0 on overwrite
    pub fn hset(&mut self, key: Vec<u8>, field: Vec<u8>, value: Vec<u8>) -> i64 {
        self.cleanup_if_expired_hash(&key, now_ms());
        let rec = self.hashes.entry(key).or_default();
        match rec.fields.insert(field, value) {
            None => 1,
            Some(_) => 0,
        }
    }

    pub fn hget(&mut self, key: &[u8], field: &[u8]) -> Option<Vec<u8>> {
        self.cleanup_if_expired_hash(key, now_ms());
        self.hashes.get(key)?.fields.get(field).cloned()
    }

    /// Returns the count removed; deletes the record once its last field goes
    pub fn hdel(&mut self, key: &[u8], fields: &[Vec<u8>]) -> i64 {
        self.cleanup_if_expired_hash(key, now_ms());
        let Some(rec) = self.hashes.get_mut(key) else {
            return 0;
        };
        let mut removed = 0;
        for field in fields {
            if rec.fields.remove(field.as_slice()).is_some() {
                removed += 1;
            }
        }
        if rec.fields.is_empty() {
            self.hashes.remove(key);
            self.drop_index_if_unreferenced(key);
        }
        removed
    }

    pub fn hexists(&mut self, key: &[u8], field: &[u8]) -> bool {
        self.cleanup_if_expired_hash(key, now_ms());
        self.hashes
            .get(key)
            .map(|rec| rec.fields.contains_key(field))
            .unwrap_or(false)
    }

    /// Flattened field/value sequence, order unspecified
    pub fn hgetall_flat(&mut self, key: &[u8]) -> Vec<Vec<u8>> {
        self.cleanup_if_expired_hash(key, now_ms());
        let Some(rec) = self.hashes.get(key) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(rec.fields.len() * 2);
        for (field, value) in &rec.fields {
            out.push(field.clone());
            out.push(value.clone());
        }
        out
    }

    pub fn hlen(&mut self, key: &[u8]) -> i64 {
        self.cleanup_if_expired_hash(key, now_ms());
        self.hashes.get(key).map(|rec| rec.fields.len() as i64).unwrap_or(0)
    }

    /// Absolute expiry on an existing field-map record (snapshot loads)
    pub fn set_hash_expire_at(&mut self, key: &[u8], expire_at_ms: i64) -> bool {
        let Some(rec) = self.hashes.get_mut(key) else {
            return false;
        };
        rec.expire_at_ms = expire_at_ms;
        if expire_at_ms >= 0 {
            self.expire_index.insert(key.to_vec(), expire_at_ms);
        } else {
            self.expire_index.remove(key);
        }
        true
    }

    // =========================================================================
    // Ordered-set operations
    // =========================================================================

    /// Returns 1 when the member is new, 0 when its score was updated
    pub fn zadd(&mut self, key: Vec<u8>, score: f64, member: Vec<u8>) -> i64 {
        self.cleanup_if_expired_zset(&key, now_ms());
        let rec = self.zsets.entry(key).or_default();
        rec.add(score, &member) as i64
    }

    /// Returns the count removed; deletes the record once it empties
    pub fn zrem(&mut self, key: &[u8], members: &[Vec<u8>]) -> i64 {
        self.cleanup_if_expired_zset(key, now_ms());
        let Some(rec) = self.zsets.get_mut(key) else {
            return 0;
        };
        let mut removed = 0;
        for member in members {
            if rec.remove(member) {
                removed += 1;
            }
        }
        if rec.is_empty() {
            self.zsets.remove(key);
            self.drop_index_if_unreferenced(key);
        }
        removed
    }

    pub fn zrange(&mut self, key: &[u8], start: i64, stop: i64) -> Vec<Vec<u8>> {
        self.cleanup_if_expired_zset(key, now_ms());
        self.zsets
            .get(key)
            .map(|rec| rec.range(start, stop))
            .unwrap_or_default()
    }

    pub fn zscore(&mut self, key: &[u8], member: &[u8]) -> Option<f64> {
        self.cleanup_if_expired_zset(key, now_ms());
        self.zsets.get(key)?.score(member)
    }

    /// Absolute expiry on an existing ordered-set record (snapshot loads)
    pub fn set_zset_expire_at(&mut self, key: &[u8], expire_at_ms: i64) -> bool {
        let Some(rec) = self.zsets.get_mut(key) else {
            return false;
        };
        rec.expire_at_ms = expire_at_ms;
        if expire_at_ms >= 0 {
            self.expire_index.insert(key.to_vec(), expire_at_ms);
        } else {
            self.expire_index.remove(key);
        }
        true
    }

    /// Whether the ordered set under `key` has migrated to the skiplist
    pub fn zset_is_indexed(&self, key: &[u8]) -> bool {
        self.zsets.get(key).map(|rec| rec.is_indexed()).unwrap_or(false)
    }

    // =========================================================================
    // Expiry sampling
    // =========================================================================

    /// Examine up to `max_steps` expiry-index entries starting from a random
    /// position, wrapping once, and evict every expired key found. No entry
    /// is examined twice within one call. Returns the number evicted.
    pub fn expire_scan_step(&mut self, max_steps: usize) -> usize {
        let n = self.expire_index.len();
        if max_steps == 0 || n == 0 {
            return 0;
        }
        let steps = max_steps.min(n);
        let start = rand::thread_rng().gen_range(0..n);

        let mut candidates: Vec<(Vec<u8>, i64)> = Vec::with_capacity(steps);
        for (key, &when) in self.expire_index.iter().skip(start).take(steps) {
            candidates.push((key.clone(), when));
        }
        if candidates.len() < steps {
            let rest = steps - candidates.len();
            for (key, &when) in self.expire_index.iter().take(rest) {
                candidates.push((key.clone(), when));
            }
        }

        let now = now_ms();
        let mut removed = 0;
        for (key, when) in candidates {
            if when >= 0 && now >= when {
                self.strings.remove(&key);
                self.hashes.remove(&key);
                self.zsets.remove(&key);
                self.expire_index.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Number of keys with a finite expiry
    pub fn expire_index_len(&self) -> usize {
        self.expire_index.len()
    }

    /// Whether the expiry index holds an entry for `key`
    pub fn expire_index_contains(&self, key: &[u8]) -> bool {
        self.expire_index.contains_key(key)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn snapshot_scalars(&self) -> Vec<ScalarSnapshot> {
        self.strings
            .iter()
            .map(|(key, rec)| ScalarSnapshot {
                key: key.clone(),
                value: rec.value.clone(),
                expire_at_ms: rec.expire_at_ms,
            })
            .collect()
    }

    pub fn snapshot_hashes(&self) -> Vec<HashSnapshot> {
        self.hashes
            .iter()
            .map(|(key, rec)| HashSnapshot {
                key: key.clone(),
                fields: rec.fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
                expire_at_ms: rec.expire_at_ms,
            })
            .collect()
    }

    /// Ordered sets materialized in total order regardless of storage mode
    pub fn snapshot_zsets(&self) -> Vec<ZSetSnapshot> {
        self.zsets
            .iter()
            .map(|(key, rec)| ZSetSnapshot {
                key: key.clone(),
                items: rec.to_vec(),
                expire_at_ms: rec.expire_at_ms,
            })
            .collect()
    }

    /// Drop every record and index entry (replica bootstrap)
    pub fn clear_all(&mut self) {
        self.strings.clear();
        self.hashes.clear();
        self.zsets.clear();
        self.expire_index.clear();
    }

    /// Hash over all records and expiries in canonical order, for equality
    /// checks in tests and replica verification.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();

        let mut scalars = self.snapshot_scalars();
        scalars.sort_by(|a, b| a.key.cmp(&b.key));
        for rec in scalars {
            rec.key.hash(&mut hasher);
            rec.value.hash(&mut hasher);
            rec.expire_at_ms.hash(&mut hasher);
        }

        let mut hashes = self.snapshot_hashes();
        hashes.sort_by(|a, b| a.key.cmp(&b.key));
        for mut rec in hashes {
            rec.fields.sort();
            rec.key.hash(&mut hasher);
            rec.fields.hash(&mut hasher);
            rec.expire_at_ms.hash(&mut hasher);
        }

        let mut zsets = self.snapshot_zsets();
        zsets.sort_by(|a, b| a.key.cmp(&b.key));
        for rec in zsets {
            rec.key.hash(&mut hasher);
            for (score, member) in rec.items {
                score.to_bits().hash(&mut hasher);
                member.hash(&mut hasher);
            }
            rec.expire_at_ms.hash(&mut hasher);
        }

        hasher.finish()
    }

    // =========================================================================
    // Lazy expiry
    // =========================================================================

    fn cleanup_if_expired_scalar(&mut self, key: &[u8], now: i64) {
        if let Some(rec) = self.strings.get(key) {
            if expired(rec.expire_at_ms, now) {
                self.strings.remove(key);
                self.drop_index_if_unreferenced(key);
            }
        }
    }

    fn cleanup_if_expired_hash(&mut self, key: &[u8], now: i64) {
        if let Some(rec) = self.hashes.get(key) {
            if expired(rec.expire_at_ms, now) {
                self.hashes.remove(key);
                self.drop_index_if_unreferenced(key);
            }
        }
    }

    fn cleanup_if_expired_zset(&mut self, key: &[u8], now: i64) {
        if let Some(rec) = self.zsets.get(key) {
            if expired(rec.expire_at_ms, now) {
                self.zsets.remove(key);
                self.drop_index_if_unreferenced(key);
            }
        }
    }

    fn cleanup_if_expired_any(&mut self, key: &[u8], now: i64) {
        self.cleanup_if_expired_scalar(key, now);
        self.cleanup_if_expired_hash(key, now);
        self.cleanup_if_expired_zset(key, now);
    }

    /// The index is keyed by name; only drop the entry once no family holds
    /// a record under that name.
    fn drop_index_if_unreferenced(&mut self, key: &[u8]) {
        if !self.strings.contains_key(key)
            && !self.hashes.contains_key(key)
            && !self.zsets.contains_key(key)
        {
            self.expire_index.remove(key);
        }
    }
}

fn expired(expire_at_ms: i64, now: i64) -> bool {
    expire_at_ms >= 0 && now >= expire_at_ms
}

/// The engine: the store behind its engine-wide exclusion.
///
/// Constructed once at startup and passed by reference to the reactor, the
/// log, and the replication client.
#[derive(Default)]
pub struct Engine {
    inner: Mutex<Store>,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            inner: Mutex::new(Store::default()),
        }
    }

    /// Acquire the engine-wide exclusion. Callers must not suspend while
    /// holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock()
    }

    // Convenience delegates for single-operation callers

    pub fn set(&self, key: &[u8], value: &[u8], ttl_ms: Option<i64>) {
        self.lock().set(key.to_vec(), value.to_vec(), ttl_ms);
    }

    pub fn set_with_expire_at(&self, key: &[u8], value: &[u8], expire_at_ms: i64) {
        self.lock().set_with_expire_at(key.to_vec(), value.to_vec(), expire_at_ms);
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock().get(key)
    }

    pub fn del(&self, keys: &[Vec<u8>]) -> i64 {
        self.lock().del(keys)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.lock().exists(key)
    }

    pub fn expire(&self, key: &[u8], seconds: i64) -> bool {
        self.lock().expire(key, seconds)
    }

    pub fn ttl(&self, key: &[u8]) -> i64 {
        self.lock().ttl(key)
    }

    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> i64 {
        self.lock().hset(key.to_vec(), field.to_vec(), value.to_vec())
    }

    pub fn set_hash_expire_at(&self, key: &[u8], expire_at_ms: i64) -> bool {
        self.lock().set_hash_expire_at(key, expire_at_ms)
    }

    pub fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> i64 {
        self.lock().zadd(key.to_vec(), score, member.to_vec())
    }

    pub fn set_zset_expire_at(&self, key: &[u8], expire_at_ms: i64) -> bool {
        self.lock().set_zset_expire_at(key, expire_at_ms)
    }

    pub fn expire_scan_step(&self, max_steps: usize) -> usize {
        self.lock().expire_scan_step(max_steps)
    }

    pub fn snapshot_scalars(&self) -> Vec<ScalarSnapshot> {
        self.lock().snapshot_scalars()
    }

    pub fn snapshot_hashes(&self) -> Vec<HashSnapshot> {
        self.lock().snapshot_hashes()
    }

    pub fn snapshot_zsets(&self) -> Vec<ZSetSnapshot> {
        self.lock().snapshot_zsets()
    }

    pub fn clear_all(&self) {
        self.lock().clear_all()
    }

    pub fn fingerprint(&self) -> u64 {
        self.lock().fingerprint()
    }
}
