//! Deterministic in-process merge engine used by tests and examples.
//!
//! This is not a production CRDT. It is a last-writer-wins map-of-maps whose
//! updates are serialized op batches, built so that the persistence core can
//! be exercised end to end: updates commute, merging is deduplication, and
//! the full-state encoding is canonical (equal states encode to equal bytes,
//! which makes replay-equivalence assertions possible).

use crate::crdt::{LiveDoc, MergeEngine, Origin, UpdateCallback, UpdateSubscription};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One keyed write. `value: None` is a tombstone. Ties break on `actor`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Op {
    map: String,
    key: String,
    clock: u64,
    actor: u64,
    value: Option<String>,
}

impl Op {
    fn beats(&self, other: &Op) -> bool {
        (self.clock, self.actor) > (other.clock, other.actor)
    }
}

#[derive(Default)]
struct DocState {
    /// Winning op per `(map, key)`, tombstones included so deletions survive
    /// merges and full-state exchanges.
    entries: BTreeMap<(String, String), Op>,
    clock: u64,
}

impl DocState {
    /// Fold a batch of ops in. Returns the set of maps that changed.
    fn apply(&mut self, ops: &[Op]) -> Vec<String> {
        let mut touched = Vec::new();
        for op in ops {
            self.clock = self.clock.max(op.clock);
            let slot = (op.map.clone(), op.key.clone());
            let wins = match self.entries.get(&slot) {
                Some(current) => op.beats(current),
                None => true,
            };
            if wins {
                self.entries.insert(slot, op.clone());
                if !touched.contains(&op.map) {
                    touched.push(op.map.clone());
                }
            }
        }
        touched
    }

    fn winning_ops(&self) -> Vec<Op> {
        self.entries.values().cloned().collect()
    }
}

fn encode_ops(ops: &[Op]) -> Result<Vec<u8>> {
    bincode::serialize(ops).context("failed to encode update batch")
}

fn decode_ops(bytes: &[u8]) -> Result<Vec<Op>> {
    bincode::deserialize(bytes).context("failed to decode update batch")
}

/// Engine handing out [`TestDoc`] instances with unique actor ids.
pub struct TestEngine {
    next_actor: AtomicU64,
}

impl TestEngine {
    pub fn new() -> Self {
        Self {
            next_actor: AtomicU64::new(1),
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeEngine for TestEngine {
    fn new_document(&self) -> Arc<dyn LiveDoc> {
        let actor = self.next_actor.fetch_add(1, Ordering::Relaxed);
        Arc::new(TestDoc::new(actor))
    }

    fn merge_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>> {
        let mut merged = Vec::new();
        for update in updates {
            merged.extend(decode_ops(update)?);
        }
        merged.sort();
        merged.dedup();
        encode_ops(&merged)
    }
}

type MapObserver = (String, Arc<dyn Fn() + Send + Sync>);

/// A last-writer-wins map-of-maps document.
pub struct TestDoc {
    actor: u64,
    state: Mutex<DocState>,
    callbacks: Arc<Mutex<Vec<(u64, UpdateCallback)>>>,
    map_observers: Arc<Mutex<Vec<(u64, MapObserver)>>>,
    next_handle: AtomicU64,
}

impl TestDoc {
    pub fn new(actor: u64) -> Self {
        Self {
            actor,
            state: Mutex::new(DocState::default()),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            map_observers: Arc::new(Mutex::new(Vec::new())),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Apply ops under the state lock, then notify observers outside it.
    fn commit(&self, ops: Vec<Op>, origin: Origin) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let touched = {
            let mut state = self.state.lock().expect("doc state poisoned");
            state.apply(&ops)
        };
        let bytes = encode_ops(&ops)?;
        let callbacks: Vec<UpdateCallback> = {
            let guard = self.callbacks.lock().expect("callbacks poisoned");
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in callbacks {
            cb(&bytes, origin);
        }
        let observers: Vec<Arc<dyn Fn() + Send + Sync>> = {
            let guard = self.map_observers.lock().expect("observers poisoned");
            guard
                .iter()
                .filter(|(_, (map, _))| touched.iter().any(|t| t == map))
                .map(|(_, (_, cb))| Arc::clone(cb))
                .collect()
        };
        for cb in observers {
            cb();
        }
        Ok(())
    }

    fn next_clock(&self) -> u64 {
        let state = self.state.lock().expect("doc state poisoned");
        state.clock + 1
    }
}

impl LiveDoc for TestDoc {
    fn encode_full_state(&self) -> Vec<u8> {
        let state = self.state.lock().expect("doc state poisoned");
        // BTreeMap iteration keeps this canonical.
        encode_ops(&state.winning_ops()).unwrap_or_default()
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<()> {
        let ops = decode_ops(update)?;
        self.commit(ops, origin)
    }

    fn on_update(&self, callback: UpdateCallback) -> UpdateSubscription {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .expect("callbacks poisoned")
            .push((handle, callback));
        let callbacks = Arc::clone(&self.callbacks);
        UpdateSubscription::new(move || {
            callbacks
                .lock()
                .expect("callbacks poisoned")
                .retain(|(id, _)| *id != handle);
        })
    }

    fn observe_map(&self, map: &str, callback: Arc<dyn Fn() + Send + Sync>) -> UpdateSubscription {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.map_observers
            .lock()
            .expect("observers poisoned")
            .push((handle, (map.to_string(), callback)));
        let observers = Arc::clone(&self.map_observers);
        UpdateSubscription::new(move || {
            observers
                .lock()
                .expect("observers poisoned")
                .retain(|(id, _)| *id != handle);
        })
    }

    fn map_get(&self, map: &str, key: &str) -> Option<String> {
        let state = self.state.lock().expect("doc state poisoned");
        state
            .entries
            .get(&(map.to_string(), key.to_string()))
            .and_then(|op| op.value.clone())
    }

    fn map_set(&self, map: &str, key: &str, value: &str, origin: Origin) -> Result<()> {
        let op = Op {
            map: map.to_string(),
            key: key.to_string(),
            clock: self.next_clock(),
            actor: self.actor,
            value: Some(value.to_string()),
        };
        self.commit(vec![op], origin)
    }

    fn replace_with(&self, full_state: &[u8], origin: Origin) -> Result<()> {
        let target = decode_ops(full_state)?;
        let ops = {
            let state = self.state.lock().expect("doc state poisoned");
            let mut clock = state.clock;
            let mut ops = Vec::new();
            // Tombstone everything the target does not carry, then restate the
            // target's values with fresh clocks so the whole replacement wins
            // over any concurrent edit as one unit.
            for ((map, key), current) in &state.entries {
                let in_target = target.iter().any(|op| &op.map == map && &op.key == key);
                if !in_target && current.value.is_some() {
                    clock += 1;
                    ops.push(Op {
                        map: map.clone(),
                        key: key.clone(),
                        clock,
                        actor: self.actor,
                        value: None,
                    });
                }
            }
            for op in &target {
                clock += 1;
                ops.push(Op {
                    map: op.map.clone(),
                    key: op.key.clone(),
                    clock,
                    actor: self.actor,
                    value: op.value.clone(),
                });
            }
            ops
        };
        self.commit(ops, origin)
    }
}
