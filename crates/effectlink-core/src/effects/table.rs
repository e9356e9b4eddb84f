//! The active-effects table.
//!
//! Maps `(effect group, target)` keys to the timed effect currently holding
//! them.  A single mutex guards the whole map, so "check every key, then claim
//! every key" happens in one critical section and a removal is visible to
//! every check that starts after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::Target;

/// One exclusivity key: an effect group plus a target, or the whole group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EffectKey {
    pub group: String,
    /// `None` is the global key, held by effects with no targets.
    pub target: Option<String>,
}

impl EffectKey {
    pub fn global(group: &str) -> Self {
        Self {
            group: group.to_string(),
            target: None,
        }
    }

    pub fn for_target(group: &str, target: &Target) -> Self {
        Self {
            group: group.to_string(),
            target: Some(target.key()),
        }
    }

    /// Keys an effect holds while running: one per target, or the global key.
    pub fn claimed_by(group: &str, targets: &[Target]) -> Vec<Self> {
        if targets.is_empty() {
            vec![Self::global(group)]
        } else {
            targets.iter().map(|t| Self::for_target(group, t)).collect()
        }
    }

    /// Keys that block an effect: the global key plus one per target.
    pub fn blocking(group: &str, targets: &[Target]) -> Vec<Self> {
        std::iter::once(Self::global(group))
            .chain(targets.iter().map(|t| Self::for_target(group, t)))
            .collect()
    }
}

/// Table entry shared with the owning timed effect.
#[derive(Debug, Default)]
pub struct EffectSlot {
    complete: AtomicBool,
}

impl EffectSlot {
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Marks the slot complete; returns `true` only for the first caller.
    pub(crate) fn mark_complete(&self) -> bool {
        !self.complete.swap(true, Ordering::SeqCst)
    }
}

/// Shared map of running effects.
#[derive(Debug, Default)]
pub struct ActiveEffects {
    entries: Mutex<HashMap<EffectKey, Arc<EffectSlot>>>,
}

impl ActiveEffects {
    pub fn new() -> Self {
        Self::default()
    }

    /// In one critical section: if `check` is non-empty and any of those keys
    /// is held by a non-complete effect, claims nothing and returns `false`;
    /// otherwise inserts `slot` under every key in `claim` and returns `true`.
    ///
    /// A key still held by a live effect is never overwritten.
    pub fn try_claim(&self, check: &[EffectKey], claim: &[EffectKey], slot: &Arc<EffectSlot>) -> bool {
        let mut entries = self.entries.lock();
        if check.iter().any(|key| is_live(&entries, key)) {
            return false;
        }
        for key in claim {
            if !is_live(&entries, key) {
                entries.insert(key.clone(), Arc::clone(slot));
            }
        }
        true
    }

    /// Removes the entries under `keys` that still belong to `slot`.
    pub fn release(&self, keys: &[EffectKey], slot: &Arc<EffectSlot>) {
        let mut entries = self.entries.lock();
        for key in keys {
            if entries.get(key).is_some_and(|held| Arc::ptr_eq(held, slot)) {
                entries.remove(key);
            }
        }
    }

    /// Returns `true` if any of `keys` is held by a non-complete effect.
    pub fn any_live(&self, keys: &[EffectKey]) -> bool {
        let entries = self.entries.lock();
        keys.iter().any(|key| is_live(&entries, key))
    }

    /// Number of keys currently held by non-complete effects.
    pub fn live_len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| !slot.is_complete())
            .count()
    }
}

fn is_live(entries: &HashMap<EffectKey, Arc<EffectSlot>>, key: &EffectKey) -> bool {
    entries.get(key).is_some_and(|slot| !slot.is_complete())
}
