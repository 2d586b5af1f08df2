// WG Tunnel Manager - Tunnel Registry
// Per-name operation flag, generation counter and last observed state

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::AbortHandle;
use wg_tunnel_common::{Error, Result};

#[derive(Debug, Default)]
struct SlotState {
    /// Set while an `OperationGuard` is alive
    busy: bool,
    active: Option<bool>,
    /// Bumped when an activation or deactivation starts
    generation: u64,
    /// Confirming probe scheduled by the last transition
    reprobe: Option<AbortHandle>,
}

#[derive(Default)]
struct TunnelSlot {
    state: Mutex<SlotState>,
}

impl TunnelSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What a probe result did to the recorded state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First value, or different from the previous one
    Changed { previous: Option<bool> },
    Unchanged,
    /// A transition is in flight; the result was dropped
    Discarded,
    /// A transition started after the probe was issued
    Stale,
}

impl Observation {
    pub fn changed(&self) -> bool {
        matches!(self, Observation::Changed { .. })
    }
}

/// Tracks every tunnel the daemon has touched
#[derive(Default)]
pub struct TunnelRegistry {
    slots: Mutex<HashMap<String, Arc<TunnelSlot>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<TunnelSlot>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot(&self, name: &str) -> Arc<TunnelSlot> {
        self.slots().entry(name.to_string()).or_default().clone()
    }

    fn existing(&self, name: &str) -> Option<Arc<TunnelSlot>> {
        self.slots().get(name).cloned()
    }

    /// Start an exclusive operation on `name`.
    ///
    /// Fails with `Busy` if one is already running. Otherwise the generation
    /// advances and any pending confirming probe is cancelled.
    pub fn begin(&self, name: &str) -> Result<OperationGuard> {
        let slot = self.slot(name);
        let generation = {
            let mut state = slot.state();
            if state.busy {
                return Err(Error::Busy(name.to_string()));
            }
            state.busy = true;
            state.generation += 1;
            if let Some(reprobe) = state.reprobe.take() {
                reprobe.abort();
            }
            state.generation
        };

        Ok(OperationGuard { generation, slot })
    }

    /// Whether an operation holds `name` right now
    pub fn is_busy(&self, name: &str) -> bool {
        self.existing(name).is_some_and(|slot| slot.state().busy)
    }

    pub fn known_state(&self, name: &str) -> Option<bool> {
        self.existing(name).and_then(|slot| slot.state().active)
    }

    pub fn generation(&self, name: &str) -> u64 {
        self.existing(name).map_or(0, |slot| slot.state().generation)
    }

    /// Record a probe result issued at `generation`.
    pub fn observe(&self, name: &str, generation: u64, active: bool) -> Observation {
        let slot = self.slot(name);
        let mut state = slot.state();
        if state.busy {
            return Observation::Discarded;
        }
        if state.generation != generation {
            return Observation::Stale;
        }
        let previous = state.active;
        if previous == Some(active) {
            return Observation::Unchanged;
        }
        state.active = Some(active);
        Observation::Changed { previous }
    }

    /// Attach the confirming probe for `generation`; dropped if a newer
    /// transition already started.
    pub fn set_reprobe(&self, name: &str, generation: u64, handle: AbortHandle) {
        let Some(slot) = self.existing(name) else {
            handle.abort();
            return;
        };
        let mut state = slot.state();
        if state.generation == generation {
            if let Some(previous) = state.reprobe.replace(handle) {
                previous.abort();
            }
        } else {
            handle.abort();
        }
    }

    /// Drop all knowledge of `name`. Caller must hold its guard.
    pub fn forget(&self, name: &str, guard: OperationGuard) {
        {
            let mut state = guard.slot.state();
            state.active = None;
            if let Some(reprobe) = state.reprobe.take() {
                reprobe.abort();
            }
        }
        let mut slots = self.slots();
        if slots
            .get(name)
            .is_some_and(|slot| Arc::ptr_eq(slot, &guard.slot))
        {
            slots.remove(name);
        }
        drop(slots);
        drop(guard);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots().len()
    }
}

/// Exclusive access to one tunnel; released on drop.
pub struct OperationGuard {
    generation: u64,
    slot: Arc<TunnelSlot>,
}

impl OperationGuard {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn known_state(&self) -> Option<bool> {
        self.slot.state().active
    }

    /// Record a state while holding the lock. Returns whether it changed.
    pub fn set_active(&self, active: bool) -> bool {
        let mut state = self.slot.state();
        let changed = state.active != Some(active);
        state.active = Some(active);
        changed
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.slot.state().busy = false;
    }
}
