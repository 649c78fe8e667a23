use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use stow_types::{Tid, TypeDescriptor, Value};
use tracing::{debug, info};

use crate::error::{DictionaryError, DictionaryResult};
use crate::file::{DictionaryFile, DictionaryRecord};
use crate::migration::{FieldSource, Migration};

/// One schema version: a TID and the exact layout it names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub tid: Tid,
    pub descriptor: TypeDescriptor,
}

/// How to turn a record written under some TID into a current object.
#[derive(Clone, Debug)]
pub struct DecodePlan {
    /// TID the record was written with.
    pub record_tid: Tid,
    /// Layout the payload is encoded in.
    pub record_layout: Arc<TypeDescriptor>,
    /// Current TID for the record's type.
    pub target_tid: Tid,
    pub target_layout: Arc<TypeDescriptor>,
    /// Migrations to apply in order; empty when the record is current.
    pub steps: Vec<(Migration, Arc<TypeDescriptor>, Arc<TypeDescriptor>)>,
}

impl DecodePlan {
    pub fn is_current(&self) -> bool {
        self.steps.is_empty()
    }

    /// Rewrite values decoded under `record_layout` into `target_layout`.
    pub fn migrate(&self, mut values: Vec<Value>) -> DictionaryResult<Vec<Value>> {
        for (migration, old, new) in &self.steps {
            values = migration.apply(old, new, values)?;
        }
        Ok(values)
    }
}

struct DictionaryState {
    layouts: BTreeMap<Tid, Arc<TypeDescriptor>>,
    by_layout: HashMap<Arc<TypeDescriptor>, Tid>,
    /// Newest TID per type name.
    current: HashMap<String, Tid>,
    /// Keyed by the migration's source TID.
    migrations: HashMap<Tid, Migration>,
    next_tid: Tid,
    file: Option<DictionaryFile>,
}

impl DictionaryState {
    fn empty(file: Option<DictionaryFile>) -> Self {
        Self {
            layouts: BTreeMap::new(),
            by_layout: HashMap::new(),
            current: HashMap::new(),
            migrations: HashMap::new(),
            next_tid: Tid::FIRST,
            file,
        }
    }

    fn persist(&mut self, record: &DictionaryRecord) -> DictionaryResult<()> {
        match self.file.as_mut() {
            Some(file) => file.append(record),
            None => Ok(()),
        }
    }

    fn insert_layout(&mut self, tid: Tid, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let layout = Arc::new(descriptor);
        self.layouts.insert(tid, Arc::clone(&layout));
        self.by_layout.entry(Arc::clone(&layout)).or_insert(tid);
        let current = self.current.entry(layout.name().to_string()).or_insert(tid);
        if tid > *current {
            *current = tid;
        }
        if tid >= self.next_tid {
            self.next_tid = tid.next();
        }
        layout
    }

    fn layout(&self, tid: Tid) -> DictionaryResult<&Arc<TypeDescriptor>> {
        self.layouts
            .get(&tid)
            .ok_or(DictionaryError::UnknownTypeId(tid))
    }

    /// TID for `descriptor`, allocating one if the layout is new.
    ///
    /// A new layout for a known name succeeds the name's current layout
    /// through an inferred migration, unless the previous TID is
    /// `declared_from`, whose migration the caller records itself.
    fn allocate(&mut self, descriptor: &TypeDescriptor, declared_from: Option<Tid>) -> DictionaryResult<Tid> {
        if let Some(&tid) = self.by_layout.get(descriptor) {
            return Ok(tid);
        }
        let tid = self.next_tid;
        let previous = self.current.get(descriptor.name()).copied();
        let entry = TypeEntry {
            tid,
            descriptor: descriptor.clone(),
        };
        self.persist(&DictionaryRecord::Type(entry))?;
        self.insert_layout(tid, descriptor.clone());
        debug!(%tid, type_name = descriptor.name(), "registered type layout");
        if let Some(previous) = previous.filter(|p| Some(*p) != declared_from) {
            self.infer_migration(previous, tid)?;
        }
        Ok(tid)
    }

    /// Link `from` to `to` by field names unless `from` already migrates.
    fn infer_migration(&mut self, from: Tid, to: Tid) -> DictionaryResult<()> {
        if self.migrations.contains_key(&from) {
            return Ok(());
        }
        let old = Arc::clone(self.layout(from)?);
        let new = Arc::clone(self.layout(to)?);
        let migration = Migration::inferred(from, &old, to, &new);
        self.persist(&DictionaryRecord::Migration(migration.clone()))?;
        self.migrations.insert(from, migration);
        info!(%from, %to, type_name = new.name(), "inferred type migration");
        Ok(())
    }
}

/// Append-only registry of persistent layouts, shared by every channel.
///
/// All state sits behind one mutex. Entries are only ever added; an
/// existing TID's layout never changes.
pub struct TypeDictionary {
    state: Mutex<DictionaryState>,
}

impl TypeDictionary {
    /// A dictionary that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(DictionaryState::empty(None)),
        }
    }

    /// Open a file-backed dictionary, replaying every recorded addition.
    pub fn open(path: &Path, sync: bool) -> DictionaryResult<Self> {
        let (file, records) = DictionaryFile::open(path, sync)?;
        let mut state = DictionaryState::empty(None);
        for record in records {
            match record {
                DictionaryRecord::Type(entry) => {
                    if let Some(existing) = state.layouts.get(&entry.tid) {
                        if **existing != entry.descriptor {
                            return Err(DictionaryError::LayoutConflict {
                                tid: entry.tid,
                                existing: Box::new((**existing).clone()),
                                incoming: Box::new(entry.descriptor),
                            });
                        }
                        continue;
                    }
                    state.insert_layout(entry.tid, entry.descriptor);
                }
                DictionaryRecord::Migration(m) => {
                    state.migrations.insert(m.from, m);
                }
            }
        }
        state.file = Some(file);
        info!(path = ?path, types = state.layouts.len(), migrations = state.migrations.len(), "type dictionary loaded");
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// TID for an exact layout, allocated on first use.
    pub fn type_id_for(&self, descriptor: &TypeDescriptor) -> DictionaryResult<Tid> {
        let mut state = self.state.lock().expect("dictionary lock poisoned");
        state.allocate(descriptor, None)
    }

    /// TID for an exact layout if it is already registered.
    pub fn find(&self, descriptor: &TypeDescriptor) -> Option<Tid> {
        let state = self.state.lock().expect("dictionary lock poisoned");
        state.by_layout.get(descriptor).copied()
    }

    pub fn layout_for(&self, tid: Tid) -> DictionaryResult<Arc<TypeDescriptor>> {
        let state = self.state.lock().expect("dictionary lock poisoned");
        state.layout(tid).cloned()
    }

    /// Newest TID registered for a type name.
    pub fn current_tid(&self, type_name: &str) -> Option<Tid> {
        let state = self.state.lock().expect("dictionary lock poisoned");
        state.current.get(type_name).copied()
    }

    /// Register `new_layout` as the successor of `old_tid`.
    ///
    /// `overrides` maps new field names to their source; fields not named
    /// there copy the same-named old field or start at their zero value.
    pub fn evolve(
        &self,
        old_tid: Tid,
        new_layout: &TypeDescriptor,
        overrides: &[(String, FieldSource)],
    ) -> DictionaryResult<Tid> {
        let mut state = self.state.lock().expect("dictionary lock poisoned");
        let old = Arc::clone(state.layout(old_tid)?);
        if old.name() != new_layout.name() {
            return Err(DictionaryError::TypeNameMismatch {
                tid: old_tid,
                expected: old.name().to_string(),
                actual: new_layout.name().to_string(),
            });
        }
        // a declared migration replaces an inferred one
        if let Some(existing) = state.migrations.get(&old_tid).filter(|m| !m.inferred) {
            return Err(DictionaryError::MigrationExists {
                from: old_tid,
                to: existing.to,
            });
        }

        let probe = state.next_tid;
        let planned_to = state.by_layout.get(new_layout).copied().unwrap_or(probe);
        let migration = Migration::plan(old_tid, &old, planned_to, new_layout, overrides)?;
        let new_tid = state.allocate(new_layout, Some(old_tid))?;
        debug_assert_eq!(new_tid, planned_to);

        state.persist(&DictionaryRecord::Migration(migration.clone()))?;
        state.migrations.insert(old_tid, migration);
        info!(from = %old_tid, to = %new_tid, type_name = new_layout.name(), "type evolved");
        Ok(new_tid)
    }

    /// Work out how to decode a record written under `record_tid`.
    pub fn decode_plan(&self, record_tid: Tid) -> DictionaryResult<DecodePlan> {
        let state = self.state.lock().expect("dictionary lock poisoned");
        let record_layout = Arc::clone(state.layout(record_tid)?);
        let target_tid = state
            .current
            .get(record_layout.name())
            .copied()
            .unwrap_or(record_tid);

        let mut steps = Vec::new();
        let mut at = record_tid;
        while at != target_tid {
            let migration = state
                .migrations
                .get(&at)
                .ok_or(DictionaryError::NoMigrationPath {
                    from: record_tid,
                    to: target_tid,
                })?;
            if migration.to <= at {
                return Err(DictionaryError::NoMigrationPath {
                    from: record_tid,
                    to: target_tid,
                });
            }
            let old = Arc::clone(state.layout(migration.from)?);
            let new = Arc::clone(state.layout(migration.to)?);
            steps.push((migration.clone(), old, new));
            at = migration.to;
        }

        Ok(DecodePlan {
            record_tid,
            record_layout,
            target_tid,
            target_layout: Arc::clone(state.layout(target_tid)?),
            steps,
        })
    }

    /// Entries for the given TIDs, for shipping to a peer.
    pub fn delta_for(&self, tids: impl IntoIterator<Item = Tid>) -> DictionaryResult<Vec<TypeEntry>> {
        let state = self.state.lock().expect("dictionary lock poisoned");
        let mut wanted: Vec<Tid> = tids.into_iter().collect();
        wanted.sort();
        wanted.dedup();
        wanted
            .into_iter()
            .map(|tid| {
                Ok(TypeEntry {
                    tid,
                    descriptor: (**state.layout(tid)?).clone(),
                })
            })
            .collect()
    }

    /// Merge entries received from a peer. Returns how many were new.
    pub fn import(&self, entries: &[TypeEntry]) -> DictionaryResult<usize> {
        let mut state = self.state.lock().expect("dictionary lock poisoned");
        let mut added = 0;
        for entry in entries {
            if let Some(existing) = state.layouts.get(&entry.tid) {
                if **existing != entry.descriptor {
                    return Err(DictionaryError::LayoutConflict {
                        tid: entry.tid,
                        existing: Box::new((**existing).clone()),
                        incoming: Box::new(entry.descriptor.clone()),
                    });
                }
                continue;
            }
            let previous = state.current.get(entry.descriptor.name()).copied();
            state.persist(&DictionaryRecord::Type(entry.clone()))?;
            state.insert_layout(entry.tid, entry.descriptor.clone());
            match previous {
                Some(previous) if previous < entry.tid => state.infer_migration(previous, entry.tid)?,
                Some(previous) => state.infer_migration(entry.tid, previous)?,
                None => {}
            }
            added += 1;
        }
        if added > 0 {
            debug!(added, "imported dictionary entries");
        }
        Ok(added)
    }

    /// All registered entries in TID order.
    pub fn entries(&self) -> Vec<TypeEntry> {
        let state = self.state.lock().expect("dictionary lock poisoned");
        state
            .layouts
            .iter()
            .map(|(tid, layout)| TypeEntry {
                tid: *tid,
                descriptor: (**layout).clone(),
            })
            .collect()
    }

    pub fn migrations(&self) -> Vec<Migration> {
        let state = self.state.lock().expect("dictionary lock poisoned");
        let mut all: Vec<Migration> = state.migrations.values().cloned().collect();
        all.sort_by_key(|m| m.from);
        all
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("dictionary lock poisoned").layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeDictionary {
    fn default() -> Self {
        Self::in_memory()
    }
}
