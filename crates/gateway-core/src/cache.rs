//! Response / Tool-Result Cache
//!
//! Key/value store with a single-flight guarantee: at most one
//! concurrent computation per key. Used for whole-response caching
//! (provider id + normalized prompt) and for idempotent tool-result
//! caching (tool name + normalized arguments).
//!
//! Failure semantics: a failed computation is propagated to every
//! waiter for that key and nothing is cached, so the next caller
//! retries immediately (no negative caching).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{GatewayError, Result};

/// Deterministic key for a tool invocation: tool name plus arguments
/// canonicalized through a sorted map, so identical logical calls hash
/// identically regardless of argument order.
pub fn tool_key(tool: &str, arguments: &HashMap<String, Value>) -> u64 {
    let canonical: BTreeMap<&String, &Value> = arguments.iter().collect();
    let body = serde_json::to_string(&canonical).unwrap_or_default();
    seahash::hash(format!("tool:{tool}:{body}").as_bytes())
}

/// Deterministic key for a whole-response cache entry: model id plus
/// the whitespace-collapsed, lowercased prompt.
pub fn response_key(model_id: &str, prompt: &str) -> u64 {
    let normalized = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    seahash::hash(format!("resp:{model_id}:{normalized}").as_bytes())
}

type FlightResult = std::result::Result<Value, String>;

enum Slot {
    Ready {
        value: Value,
        expires_at: Instant,
        last_access: Instant,
    },
    InFlight(broadcast::Sender<FlightResult>),
}

/// Cache hit/miss counters
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Single-flight TTL cache
///
/// The slot map is guarded by a std mutex: no lock is ever held across
/// an await, and clearing an abandoned flight must work from `Drop`,
/// where an async lock cannot be taken.
pub struct ResponseCache {
    slots: Mutex<HashMap<u64, Slot>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Clears a leader's `InFlight` slot if its future is dropped before
/// completing. Removing the slot drops the map's sender clone, closing
/// the channel so waiters observe the cancellation and the next caller
/// for the key becomes leader.
struct FlightGuard<'a> {
    slots: &'a Mutex<HashMap<u64, Slot>>,
    key: u64,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(Slot::InFlight(_)) = slots.get(&self.key) {
            slots.remove(&self.key);
        }
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached value for `key`, or run `compute` to produce
    /// it. Concurrent callers for the same key subscribe to the one
    /// in-flight computation instead of duplicating work.
    pub async fn get_or_compute<F, Fut>(&self, key: u64, ttl: Duration, compute: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        // Decide under the lock, await after it: holding the guard
        // lexically across `rx.recv().await` (even behind an explicit
        // `drop`) makes this future non-`Send`.
        enum Action {
            Wait(broadcast::Receiver<FlightResult>),
            Lead(broadcast::Sender<FlightResult>),
        }

        let action = {
            let mut slots = self.lock_slots();
            match slots.get_mut(&key) {
                Some(Slot::Ready {
                    value,
                    expires_at,
                    last_access,
                }) if *expires_at > Instant::now() => {
                    *last_access = Instant::now();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value.clone());
                }
                Some(Slot::InFlight(tx)) => Action::Wait(tx.subscribe()),
                _ => {
                    // Absent or expired: this caller becomes the leader
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let (tx, _rx) = broadcast::channel(1);
                    slots.insert(key, Slot::InFlight(tx.clone()));
                    Action::Lead(tx)
                }
            }
        };

        let tx = match action {
            Action::Wait(mut rx) => {
                return match rx.recv().await {
                    Ok(Ok(value)) => {
                        // Counted only once the shared flight pays off
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Ok(value)
                    }
                    Ok(Err(msg)) => Err(GatewayError::Other(msg)),
                    // Leader dropped without sending (cancelled)
                    Err(_) => Err(GatewayError::Other("computation cancelled".into())),
                };
            }
            Action::Lead(tx) => tx,
        };

        let mut guard = FlightGuard {
            slots: &self.slots,
            key,
            armed: true,
        };
        let outcome = compute().await;
        guard.armed = false;

        let mut slots = self.lock_slots();
        match &outcome {
            Ok(value) => {
                slots.insert(
                    key,
                    Slot::Ready {
                        value: value.clone(),
                        expires_at: Instant::now() + ttl,
                        last_access: Instant::now(),
                    },
                );
                Self::evict_lru(&mut slots, self.max_entries);
                let _ = tx.send(Ok(value.clone()));
            }
            Err(err) => {
                // No negative caching: forget the key entirely
                slots.remove(&key);
                let _ = tx.send(Err(err.to_string()));
            }
        }
        drop(slots);

        outcome
    }

    /// Snapshot of hit/miss counters
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock_slots().len(),
        }
    }

    fn evict_lru(slots: &mut HashMap<u64, Slot>, max_entries: usize) {
        while slots.len() > max_entries {
            let lru = slots
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready { last_access, .. } => Some((*k, *last_access)),
                    Slot::InFlight(_) => None,
                })
                .min_by_key(|(_, t)| *t)
                .map(|(k, _)| k);
            match lru {
                Some(k) => {
                    slots.remove(&k);
                }
                // Nothing evictable (all in flight)
                None => break,
            }
        }
    }
}
