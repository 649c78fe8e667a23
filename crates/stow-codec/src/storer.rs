use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use stow_dictionary::TypeDictionary;
use stow_registry::ObjectRegistry;
use stow_types::{EntityRef, Oid, Reference, Tid};
use tracing::debug;

use crate::encode::encode_payload;
use crate::error::{CodecError, CodecResult};
use crate::record::BinaryRecord;

/// How far a store follows references.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreMode {
    /// Store the requested objects plus referenced objects that have never
    /// been assigned an OID.
    #[default]
    Lazy,
    /// Store every resident object reachable from the requested ones.
    Eager,
}

/// What to do with references whose target is not in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StubPolicy {
    /// Write the stub's OID; the target is already stored.
    #[default]
    Keep,
    /// Fail, because the receiver cannot load the target.
    Reject,
}

/// Records produced by one store.
#[derive(Clone, Debug, Default)]
pub struct StoreBatch {
    /// OIDs of the objects passed to [`Storer::store`], in call order.
    pub roots: Vec<Oid>,
    pub records: Vec<BinaryRecord>,
    /// OIDs first allocated during this store. If the batch never reaches
    /// storage they should be forgotten again.
    pub fresh: Vec<Oid>,
}

impl StoreBatch {
    pub fn tids(&self) -> BTreeSet<Tid> {
        self.records.iter().map(|r| r.tid).collect()
    }

    pub fn byte_len(&self) -> u64 {
        self.records.iter().map(BinaryRecord::total_length).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Walks object graphs and renders one record per object.
///
/// Every object is queued at most once per storer: an OID enters the `seen`
/// set before its fields are encoded, so cyclic graphs terminate.
pub struct Storer<'a> {
    registry: &'a ObjectRegistry,
    dictionary: &'a TypeDictionary,
    mode: StoreMode,
    stubs: StubPolicy,
    seen: HashSet<Oid>,
    pending: VecDeque<(Oid, Tid, EntityRef)>,
    batch: StoreBatch,
}

impl<'a> Storer<'a> {
    pub fn new(registry: &'a ObjectRegistry, dictionary: &'a TypeDictionary, mode: StoreMode) -> Self {
        Self {
            registry,
            dictionary,
            mode,
            stubs: StubPolicy::default(),
            seen: HashSet::new(),
            pending: VecDeque::new(),
            batch: StoreBatch::default(),
        }
    }

    pub fn with_stub_policy(mut self, stubs: StubPolicy) -> Self {
        self.stubs = stubs;
        self
    }

    /// Store `entity` and whatever the mode pulls in with it.
    pub fn store(&mut self, entity: &EntityRef) -> CodecResult<Oid> {
        let tid = self.dictionary.type_id_for(entity.descriptor())?;
        let resolution = self.registry.resolve(entity, tid)?;
        if resolution.is_new {
            self.batch.fresh.push(resolution.oid);
        }
        if self.seen.insert(resolution.oid) {
            self.pending
                .push_back((resolution.oid, tid, Arc::clone(entity)));
        }
        self.batch.roots.push(resolution.oid);
        self.drain()?;
        Ok(resolution.oid)
    }

    pub fn finish(self) -> StoreBatch {
        debug!(
            records = self.batch.records.len(),
            fresh = self.batch.fresh.len(),
            mode = ?self.mode,
            "store batch rendered"
        );
        self.batch
    }

    fn drain(&mut self) -> CodecResult<()> {
        while let Some((oid, tid, entity)) = self.pending.pop_front() {
            let values = entity.values();
            let payload = encode_payload(entity.descriptor(), &values, |r| self.reference_oid(r))?;
            self.batch.records.push(BinaryRecord::new(tid, oid, payload));
        }
        Ok(())
    }

    fn reference_oid(&mut self, reference: &Reference) -> CodecResult<Oid> {
        match reference {
            Reference::Null => Ok(Oid::NULL),
            Reference::Stub(oid) => match self.stubs {
                StubPolicy::Keep => Ok(*oid),
                StubPolicy::Reject => Err(CodecError::UnresolvedStub { oid: *oid }),
            },
            Reference::Resident(target) => {
                let tid = self.dictionary.type_id_for(target.descriptor())?;
                let resolution = self.registry.resolve(target, tid)?;
                if resolution.is_new {
                    self.batch.fresh.push(resolution.oid);
                }
                let follow = resolution.is_new || self.mode == StoreMode::Eager;
                if follow && self.seen.insert(resolution.oid) {
                    self.pending
                        .push_back((resolution.oid, tid, Arc::clone(target)));
                }
                Ok(resolution.oid)
            }
        }
    }
}
