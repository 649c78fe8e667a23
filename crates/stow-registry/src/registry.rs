use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use stow_types::{Entity, EntityRef, Oid, Tid};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};

/// Outcome of [`ObjectRegistry::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub oid: Oid,
    /// `true` when the OID was allocated by this call.
    pub is_new: bool,
}

/// Registry occupancy counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryStats {
    /// OIDs with a registry slot, resident or not.
    pub known: usize,
    /// OIDs whose object is still alive in memory.
    pub resident: usize,
    /// Next OID that `resolve` would hand out.
    pub next_oid: Oid,
}

struct Slot {
    entity: Weak<Entity>,
    tid: Tid,
}

impl Slot {
    fn live(&self) -> Option<EntityRef> {
        self.entity.upgrade()
    }
}

struct RegistryState {
    by_oid: HashMap<Oid, Slot>,
    /// Keyed by `Arc::as_ptr` address. Entries may outlive their object; a
    /// hit is only trusted after the slot's weak handle upgrades to the same
    /// allocation.
    by_ptr: HashMap<usize, Oid>,
    next_oid: Oid,
}

/// Bidirectional map between live objects and OIDs.
///
/// Slots hold weak handles: once the application drops its last handle to
/// an object, the OID stays known but [`lookup`](Self::lookup) returns
/// `None` and the caller reloads it from storage. All state sits behind one
/// mutex because OIDs must be unique across every channel.
pub struct ObjectRegistry {
    state: Mutex<RegistryState>,
}

fn address(entity: &EntityRef) -> usize {
    Arc::as_ptr(entity) as usize
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                by_oid: HashMap::new(),
                by_ptr: HashMap::new(),
                next_oid: Oid::FIRST,
            }),
        }
    }

    /// Return the OID of `entity`, allocating one on first sight.
    ///
    /// `tid` is the type id the caller computed for the object's layout; an
    /// object already registered under another TID is a consistency error.
    pub fn resolve(&self, entity: &EntityRef, tid: Tid) -> RegistryResult<Resolution> {
        let mut guard = self.state.lock().expect("registry lock poisoned");
        let state = &mut *guard;
        let key = address(entity);

        if let Some(&oid) = state.by_ptr.get(&key) {
            match state.by_oid.get(&oid) {
                Some(slot) if slot.live().is_some_and(|live| Arc::ptr_eq(&live, entity)) => {
                    if slot.tid != tid {
                        return Err(RegistryError::TidMismatch {
                            oid,
                            registered: slot.tid,
                            declared: tid,
                        });
                    }
                    return Ok(Resolution { oid, is_new: false });
                }
                _ => {
                    // The address was reused by a new allocation.
                    state.by_ptr.remove(&key);
                }
            }
        }

        let oid = state.next_oid;
        state.next_oid = oid.next().ok_or(RegistryError::OidExhausted)?;
        state.by_oid.insert(
            oid,
            Slot {
                entity: Arc::downgrade(entity),
                tid,
            },
        );
        state.by_ptr.insert(key, oid);
        Ok(Resolution { oid, is_new: true })
    }

    /// OID of `entity` if it is registered, without allocating.
    pub fn peek(&self, entity: &EntityRef) -> Option<Oid> {
        let state = self.state.lock().expect("registry lock poisoned");
        let oid = *state.by_ptr.get(&address(entity))?;
        let live = state.by_oid.get(&oid)?.live()?;
        Arc::ptr_eq(&live, entity).then_some(oid)
    }

    /// The live object bound to `oid`, or `None` if it is not resident.
    pub fn lookup(&self, oid: Oid) -> Option<EntityRef> {
        let state = self.state.lock().expect("registry lock poisoned");
        state.by_oid.get(&oid).and_then(Slot::live)
    }

    /// TID registered for `oid`, resident or not.
    pub fn tid_of(&self, oid: Oid) -> Option<Tid> {
        let state = self.state.lock().expect("registry lock poisoned");
        state.by_oid.get(&oid).map(|slot| slot.tid)
    }

    /// Bind a freshly materialized object to the OID of its record.
    ///
    /// Fails if the OID is bound to a different live object, if the object
    /// is already bound to another OID, or if the TIDs disagree.
    pub fn bind(&self, oid: Oid, tid: Tid, entity: &EntityRef) -> RegistryResult<()> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        Self::bind_locked(&mut state, oid, tid, entity, false).map(|_| ())
    }

    /// Like [`bind`](Self::bind), but when another thread already
    /// materialized `oid` with the same TID, return that object instead of
    /// failing.
    pub fn bind_or_existing(&self, oid: Oid, tid: Tid, entity: &EntityRef) -> RegistryResult<EntityRef> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        Self::bind_locked(&mut state, oid, tid, entity, true)
    }

    fn bind_locked(
        state: &mut RegistryState,
        oid: Oid,
        tid: Tid,
        entity: &EntityRef,
        accept_existing: bool,
    ) -> RegistryResult<EntityRef> {
        if oid.is_reserved() {
            return Err(RegistryError::ReservedOid { oid });
        }

        let key = address(entity);
        if let Some(&bound) = state.by_ptr.get(&key) {
            if bound != oid {
                let alive = state
                    .by_oid
                    .get(&bound)
                    .and_then(Slot::live)
                    .is_some_and(|live| Arc::ptr_eq(&live, entity));
                if alive {
                    return Err(RegistryError::EntityRebound {
                        bound,
                        requested: oid,
                    });
                }
                state.by_ptr.remove(&key);
            }
        }

        if let Some(slot) = state.by_oid.get(&oid) {
            if let Some(live) = slot.live() {
                if slot.tid != tid {
                    return Err(RegistryError::TidMismatch {
                        oid,
                        registered: slot.tid,
                        declared: tid,
                    });
                }
                if Arc::ptr_eq(&live, entity) || accept_existing {
                    return Ok(live);
                }
                return Err(RegistryError::OidRebound { oid });
            }
        }

        if let Some(stale) = state.by_oid.insert(
            oid,
            Slot {
                entity: Arc::downgrade(entity),
                tid,
            },
        ) {
            debug!(%oid, old_tid = %stale.tid, new_tid = %tid, "rebinding non-resident oid");
            state.by_ptr.retain(|_, bound| *bound != oid);
        }
        state.by_ptr.insert(key, oid);
        if oid >= state.next_oid {
            state.next_oid = oid.next().ok_or(RegistryError::OidExhausted)?;
        }
        Ok(Arc::clone(entity))
    }

    /// Make sure future allocations start above `highest`.
    ///
    /// Called after a cold start with the largest OID found on disk.
    pub fn ensure_oid_floor(&self, highest: Oid) -> RegistryResult<()> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if highest >= state.next_oid {
            state.next_oid = highest.next().ok_or(RegistryError::OidExhausted)?;
            debug!(next_oid = %state.next_oid, "raised oid allocation floor");
        }
        Ok(())
    }

    /// Drop the slot for a deleted object.
    pub fn forget(&self, oid: Oid) -> bool {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let removed = state.by_oid.remove(&oid).is_some();
        if removed {
            state.by_ptr.retain(|_, bound| *bound != oid);
        }
        removed
    }

    /// Remove slots whose object is no longer alive. Returns how many were
    /// removed.
    pub fn prune(&self) -> usize {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let before = state.by_oid.len();
        state.by_oid.retain(|_, slot| slot.entity.strong_count() > 0);
        let RegistryState { by_oid, by_ptr, .. } = &mut *state;
        by_ptr.retain(|_, oid| by_oid.contains_key(oid));
        let removed = before - by_oid.len();
        if removed > 0 {
            debug!(removed, remaining = by_oid.len(), "pruned dead registry slots");
        }
        removed
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock().expect("registry lock poisoned");
        RegistryStats {
            known: state.by_oid.len(),
            resident: state
                .by_oid
                .values()
                .filter(|slot| slot.entity.strong_count() > 0)
                .count(),
            next_oid: state.next_oid,
        }
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
