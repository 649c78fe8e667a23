use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stow_backup::{
    BackupConfig, BackupHandler, BackupSink, BlobStore, LocalBlobStore, SyncReport, VerifyReport,
};
use stow_codec::{decode_record, BinaryRecord, CodecResult, StoreBatch, StoreMode, Storer};
use stow_dictionary::{FieldSource, TypeDictionary};
use stow_registry::{ObjectRegistry, RegistryStats};
use stow_storage::{ChannelStats, HousekeepingReport, RecordView, StorageSystem};
use stow_types::{EntityRef, ObjectLoader, Oid, Tid, TypeDescriptor};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, DICTIONARY_FILE_NAME};
use crate::error::{EngineError, EngineResult};
use crate::integrity::{self, IntegrityReport};

/// Figures across all channels plus the shared tables.
#[derive(Clone, Debug)]
pub struct EngineStats {
    pub channels: Vec<ChannelStats>,
    pub registry: RegistryStats,
    pub types: usize,
    pub root: Option<Oid>,
}

impl EngineStats {
    pub fn live_records(&self) -> usize {
        self.channels.iter().map(|c| c.live_records).sum()
    }

    pub fn file_count(&self) -> usize {
        self.channels.iter().map(|c| c.file_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.channels.iter().map(|c| c.total_bytes).sum()
    }

    pub fn live_bytes(&self) -> u64 {
        self.channels.iter().map(|c| c.live_bytes).sum()
    }
}

#[derive(Default)]
struct RootState {
    oid: Option<Oid>,
    /// Held so the root graph stays resident.
    entity: Option<EntityRef>,
}

/// An embedded object-graph store.
///
/// Owns the channel threads, the type dictionary and the identity registry.
/// Every method takes `&self`; the engine can be shared across threads.
pub struct EmbeddedStorage {
    config: EngineConfig,
    registry: Arc<ObjectRegistry>,
    dictionary: Arc<TypeDictionary>,
    storage: StorageSystem,
    root: Mutex<RootState>,
}

impl EmbeddedStorage {
    /// Open (or create) the store described by `config` with a fresh
    /// identity registry.
    pub fn start(config: EngineConfig) -> EngineResult<Self> {
        Self::start_with_registry(config, Arc::new(ObjectRegistry::new()))
    }

    /// Open the store using `registry` for object identity.
    ///
    /// Start-up order: dictionary, channels (each rebuilding its index),
    /// OID floor, initial backup synchronization, root pointer. A failed
    /// backup synchronization aborts the start with the aggregated report.
    pub fn start_with_registry(config: EngineConfig, registry: Arc<ObjectRegistry>) -> EngineResult<Self> {
        config.storage.validate()?;
        fs::create_dir_all(&config.storage.root)?;
        let dictionary_path = config.dictionary_path();
        if let Some(parent) = dictionary_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let dictionary = Arc::new(TypeDictionary::open(&dictionary_path, config.storage.sync_writes)?);

        let backup = config.backup.as_ref().map(|settings| {
            let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&settings.directory));
            Arc::new(BackupHandler::new(store, settings.handler_config())) as Arc<dyn BackupSink>
        });
        let storage = StorageSystem::start(config.storage.clone(), backup)?;

        if let Some(highest) = storage.highest_oid()? {
            registry.ensure_oid_floor(highest)?;
        }
        if config.backup.is_some() {
            let synced = storage.backup_pass(None)?;
            let bytes: u64 = synced.iter().map(|r| r.bytes_copied).sum();
            info!(channels = synced.len(), bytes, "initial backup synchronization done");
        }

        let root_oid = storage
            .load(Oid::ROOTS)?
            .and_then(|record| record.root_target())
            .filter(|oid| !oid.is_null());

        let engine = Self {
            config,
            registry,
            dictionary,
            storage,
            root: Mutex::new(RootState {
                oid: root_oid,
                entity: None,
            }),
        };
        match engine.root() {
            Ok(_) => {}
            Err(EngineError::NotFound(oid)) => warn!(%oid, "stored root is missing"),
            Err(e) => return Err(e),
        }

        info!(
            root = %engine.config.storage.root.display(),
            channels = engine.config.storage.channel_count,
            types = engine.dictionary.len(),
            "embedded storage started"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn dictionary(&self) -> &Arc<TypeDictionary> {
        &self.dictionary
    }

    pub fn channel_count(&self) -> u32 {
        self.storage.channel_count()
    }

    // ------------------------------------------------------------------
    // Root
    // ------------------------------------------------------------------

    /// Store `entity` and make it the root. Returns its OID.
    pub fn set_root(&self, entity: &EntityRef) -> EngineResult<Oid> {
        let mut storer = Storer::new(&self.registry, &self.dictionary, StoreMode::Lazy);
        let stored = storer.store(entity);
        let mut batch = storer.finish();
        let oid = self.settle(stored, &batch)?;
        batch.records.push(BinaryRecord::roots(oid));
        self.commit(batch)?;

        let mut root = self.root.lock().expect("root lock poisoned");
        root.oid = Some(oid);
        root.entity = Some(Arc::clone(entity));
        info!(%oid, "root set");
        Ok(oid)
    }

    /// The root object, loaded on first access.
    pub fn root(&self) -> EngineResult<Option<EntityRef>> {
        let mut root = self.root.lock().expect("root lock poisoned");
        if let Some(entity) = &root.entity {
            return Ok(Some(Arc::clone(entity)));
        }
        let Some(oid) = root.oid else {
            return Ok(None);
        };
        let entity = self.load(oid)?;
        root.entity = Some(Arc::clone(&entity));
        Ok(Some(entity))
    }

    pub fn root_oid(&self) -> Option<Oid> {
        self.root.lock().expect("root lock poisoned").oid
    }

    // ------------------------------------------------------------------
    // Store / load / delete
    // ------------------------------------------------------------------

    /// Store `entity` plus every referenced object that has no OID yet.
    pub fn store(&self, entity: &EntityRef) -> EngineResult<Oid> {
        self.store_with(StoreMode::Lazy, std::slice::from_ref(entity))
            .map(|oids| oids[0])
    }

    /// Store `entity` and every resident object reachable from it.
    pub fn store_eager(&self, entity: &EntityRef) -> EngineResult<Oid> {
        self.store_with(StoreMode::Eager, std::slice::from_ref(entity))
            .map(|oids| oids[0])
    }

    /// Store several objects as one batch.
    pub fn store_all(&self, entities: &[EntityRef]) -> EngineResult<Vec<Oid>> {
        self.store_with(StoreMode::Lazy, entities)
    }

    fn store_with(&self, mode: StoreMode, entities: &[EntityRef]) -> EngineResult<Vec<Oid>> {
        let mut storer = Storer::new(&self.registry, &self.dictionary, mode);
        let stored: CodecResult<Vec<Oid>> = entities.iter().map(|e| storer.store(e)).collect();
        let batch = storer.finish();
        let oids = self.settle(stored, &batch)?;
        self.commit(batch)?;
        Ok(oids)
    }

    /// Unwrap a storer result, releasing the batch's fresh OIDs on failure.
    fn settle<T>(&self, stored: CodecResult<T>, batch: &StoreBatch) -> EngineResult<T> {
        stored.map_err(|e| {
            self.forget_fresh(batch);
            e.into()
        })
    }

    fn commit(&self, batch: StoreBatch) -> EngineResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let records = batch.records.len();
        let bytes = batch.byte_len();
        let fresh = batch.fresh.len();
        if let Err(e) = self.storage.store(batch.records) {
            for &oid in &batch.fresh {
                self.registry.forget(oid);
            }
            return Err(e.into());
        }
        debug!(records, bytes, fresh, "batch stored");
        Ok(())
    }

    fn forget_fresh(&self, batch: &StoreBatch) {
        for &oid in &batch.fresh {
            self.registry.forget(oid);
        }
    }

    /// The object stored under `oid`, resident or freshly loaded.
    ///
    /// References of a loaded object come back as stubs unless their target
    /// is already resident; follow them with [`Entity::reference`] and this
    /// engine as the loader.
    ///
    /// [`Entity::reference`]: stow_types::Entity::reference
    pub fn load(&self, oid: Oid) -> EngineResult<EntityRef> {
        if oid.is_reserved() {
            return Err(EngineError::ReservedOid(oid));
        }
        if let Some(resident) = self.registry.lookup(oid) {
            return Ok(resident);
        }
        let record = self.storage.load(oid)?.ok_or(EngineError::NotFound(oid))?;
        let decoded = decode_record(&record, &self.dictionary, &self.registry)?;
        let tid = decoded.tid;
        let entity = decoded.into_entity()?;
        Ok(self.registry.bind_or_existing(oid, tid, &entity)?)
    }

    /// Delete stored objects. Returns how many were stored.
    ///
    /// Deleting the root also clears the root pointer.
    pub fn delete(&self, oids: &[Oid]) -> EngineResult<usize> {
        if let Some(&oid) = oids.iter().find(|oid| oid.is_reserved()) {
            return Err(EngineError::ReservedOid(oid));
        }
        let mut root = self.root.lock().expect("root lock poisoned");
        let clears_root = root.oid.is_some_and(|r| oids.contains(&r));
        if clears_root {
            self.storage.store(vec![BinaryRecord::roots(Oid::NULL)])?;
            root.oid = None;
            root.entity = None;
        }
        drop(root);

        let deleted = self.storage.delete(oids)?;
        for &oid in oids {
            self.registry.forget(oid);
        }
        debug!(requested = oids.len(), deleted, "objects deleted");
        Ok(deleted)
    }

    /// Register `new_layout` as the successor of the stored layout `old`.
    /// Records written under `old` are migrated when loaded.
    pub fn evolve_type(
        &self,
        old: &TypeDescriptor,
        new_layout: &TypeDescriptor,
        overrides: &[(String, FieldSource)],
    ) -> EngineResult<Tid> {
        let old_tid = self
            .dictionary
            .find(old)
            .ok_or_else(|| EngineError::UnknownType(old.name().to_string()))?;
        Ok(self.dictionary.evolve(old_tid, new_layout, overrides)?)
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    /// Synchronize every channel with the configured backup. Problems from
    /// all channels come back as one [`EngineError::Disrupted`].
    pub fn backup_pass(&self) -> EngineResult<Vec<SyncReport>> {
        Ok(self.storage.backup_pass(None)?)
    }

    /// Compare every channel's files with the backup by digest.
    pub fn verify_backup(&self) -> EngineResult<Vec<VerifyReport>> {
        Ok(self.storage.verify_backup()?)
    }

    /// Copy all channel files and the type dictionary into `target`.
    ///
    /// Repeating the export into the same store only copies what changed.
    pub fn export_to(&self, target: Arc<dyn BlobStore>) -> EngineResult<Vec<SyncReport>> {
        let sink = Arc::new(BackupHandler::new(Arc::clone(&target), BackupConfig::default()));
        let reports = self.storage.backup_pass(Some(sink))?;

        let dictionary = match fs::read(self.config.dictionary_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        target.delete(DICTIONARY_FILE_NAME)?;
        target.write_range(DICTIONARY_FILE_NAME, 0, &dictionary)?;

        info!(
            channels = reports.len(),
            bytes = reports.iter().map(|r| r.bytes_copied).sum::<u64>(),
            "storage exported"
        );
        Ok(reports)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Run one housekeeping slice on every channel now, then drop registry
    /// slots of objects no longer in memory.
    pub fn issue_housekeeping(&self, budget: Duration) -> EngineResult<HousekeepingReport> {
        let report = self.storage.issue_housekeeping(budget)?;
        let pruned = self.registry.prune();
        debug!(?report, pruned, "housekeeping issued");
        Ok(report)
    }

    /// Check that every live record decodes and every reference resolves.
    pub fn check_integrity(&self) -> EngineResult<IntegrityReport> {
        integrity::check(&self.storage, &self.dictionary, &self.registry)
    }

    pub fn stats(&self) -> EngineResult<EngineStats> {
        Ok(EngineStats {
            channels: self.storage.stats()?,
            registry: self.registry.stats(),
            types: self.dictionary.len(),
            root: self.root_oid(),
        })
    }

    /// Every record in a channel's files, superseded copies included.
    pub fn records(&self, channel: u32) -> EngineResult<Vec<RecordView>> {
        Ok(self.storage.records(channel)?)
    }

    /// Stop every channel. Dropping the engine does the same.
    pub fn shutdown(mut self) {
        self.storage.shutdown();
        info!(root = %self.config.storage.root.display(), "embedded storage stopped");
    }
}

impl ObjectLoader for EmbeddedStorage {
    type Error = EngineError;

    fn load_object(&self, oid: Oid) -> EngineResult<EntityRef> {
        self.load(oid)
    }
}

impl std::fmt::Debug for EmbeddedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedStorage")
            .field("root", &self.config.storage.root)
            .field("channels", &self.config.storage.channel_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use stow_backup::InMemoryBlobStore;
    use stow_types::{Entity, FieldDescriptor, PrimitiveKind};

    use super::*;
    use crate::config::BackupSettings;

    fn person_type() -> Arc<TypeDescriptor> {
        Arc::new(
            TypeDescriptor::new(
                "Person",
                vec![
                    FieldDescriptor::text("name"),
                    FieldDescriptor::primitive("age", PrimitiveKind::I32),
                    FieldDescriptor::reference("friend"),
                ],
            )
            .unwrap(),
        )
    }

    fn person(name: &str, age: i32) -> EntityRef {
        let p = Entity::with_defaults(person_type());
        p.set("name", name).unwrap();
        p.set("age", age).unwrap();
        p
    }

    fn config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::new(dir.join("data"), 2);
        config.storage.sync_writes = false;
        config
    }

    // ------------------------------------------------------------------
    // Store and load
    // ------------------------------------------------------------------

    #[test]
    fn store_assigns_stable_oids() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let alice = person("alice", 30);
        let first = engine.store(&alice).unwrap();
        let second = engine.store(&alice).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_reserved());
        assert!(Arc::ptr_eq(&engine.load(first).unwrap(), &alice));
    }

    #[test]
    fn lazy_store_skips_known_references() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let alice = person("alice", 30);
        let bob = person("bob", 40);
        alice.set_reference("friend", &bob).unwrap();
        engine.store(&alice).unwrap();

        bob.set("age", 41).unwrap();
        engine.store(&alice).unwrap();
        let bob_oid = engine.registry().peek(&bob).unwrap();
        drop(alice);
        drop(bob);
        engine.registry().prune();
        // the lazy store did not rewrite bob
        assert_eq!(engine.load(bob_oid).unwrap().get("age").unwrap().as_i64(), Some(40));
    }

    #[test]
    fn eager_store_rewrites_the_whole_graph() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let alice = person("alice", 30);
        let bob = person("bob", 40);
        alice.set_reference("friend", &bob).unwrap();
        engine.store(&alice).unwrap();

        bob.set("age", 41).unwrap();
        engine.store_eager(&alice).unwrap();
        let bob_oid = engine.registry().peek(&bob).unwrap();
        drop(alice);
        drop(bob);
        engine.registry().prune();
        assert_eq!(engine.load(bob_oid).unwrap().get("age").unwrap().as_i64(), Some(41));
    }

    #[test]
    fn stubs_load_through_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (alice_oid, bob_oid) = {
            let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
            let alice = person("alice", 30);
            let bob = person("bob", 40);
            alice.set_reference("friend", &bob).unwrap();
            let alice_oid = engine.store(&alice).unwrap();
            (alice_oid, engine.registry().peek(&bob).unwrap())
        };

        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let alice = engine.load(alice_oid).unwrap();
        let friend = alice.get("friend").unwrap();
        assert_eq!(friend.as_reference().unwrap().stub_oid(), Some(bob_oid));

        let bob = alice.reference("friend", &engine).unwrap().unwrap();
        assert_eq!(bob.get("name").unwrap().as_text(), Some("bob"));
        // the stub was replaced in place
        assert!(alice.get("friend").unwrap().as_reference().unwrap().resident().is_some());
    }

    #[test]
    fn reserved_and_unknown_oids_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        assert!(matches!(engine.load(Oid::ROOTS), Err(EngineError::ReservedOid(_))));
        assert!(matches!(engine.load(Oid::FIRST), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn failed_store_releases_fresh_oids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ObjectRegistry::new());
        let foreign = person("foreign", 1);
        registry.bind(Oid::FIRST, Tid::new(999_999_999), &foreign).unwrap();
        let engine = EmbeddedStorage::start_with_registry(config(dir.path()), Arc::clone(&registry)).unwrap();

        let alice = person("alice", 30);
        alice.set_reference("friend", &foreign).unwrap();
        let err = engine.store(&alice).unwrap_err();
        assert!(err.is_consistency());
        assert_eq!(registry.peek(&alice), None);
        assert_eq!(engine.stats().unwrap().live_records(), 0);
    }

    // ------------------------------------------------------------------
    // Root and delete
    // ------------------------------------------------------------------

    #[test]
    fn root_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
            assert!(engine.root().unwrap().is_none());
            engine.set_root(&person("root", 1)).unwrap();
            engine.shutdown();
        }
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let root = engine.root().unwrap().unwrap();
        assert_eq!(root.get("name").unwrap().as_text(), Some("root"));
        assert_eq!(engine.stats().unwrap().root, engine.root_oid());
    }

    #[test]
    fn deleting_the_root_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
            let oid = engine.set_root(&person("root", 1)).unwrap();
            assert_eq!(engine.delete(&[oid]).unwrap(), 1);
            assert!(engine.root().unwrap().is_none());
            assert!(matches!(engine.load(oid), Err(EngineError::NotFound(_))));
        }
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        assert!(engine.root_oid().is_none());
        assert!(matches!(engine.delete(&[Oid::ROOTS]), Err(EngineError::ReservedOid(_))));
    }

    #[test]
    fn oid_allocation_continues_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
            engine.store(&person("a", 1)).unwrap()
        };
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let second = engine.store(&person("b", 2)).unwrap();
        assert!(second > first);
    }

    // ------------------------------------------------------------------
    // Schema evolution
    // ------------------------------------------------------------------

    #[test]
    fn evolved_type_migrates_old_records() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let oid = engine.store(&person("carol", 52)).unwrap();
        engine.registry().prune();

        let v2 = TypeDescriptor::new(
            "Person",
            vec![
                FieldDescriptor::text("full_name"),
                FieldDescriptor::primitive("age", PrimitiveKind::I64),
                FieldDescriptor::reference("friend"),
                FieldDescriptor::primitive("active", PrimitiveKind::Bool),
            ],
        )
        .unwrap();
        engine
            .evolve_type(
                &person_type(),
                &v2,
                &[("full_name".to_string(), FieldSource::Field("name".to_string()))],
            )
            .unwrap();

        let carol = engine.load(oid).unwrap();
        assert_eq!(carol.descriptor().as_ref(), &v2);
        assert_eq!(carol.get("full_name").unwrap().as_text(), Some("carol"));
        assert_eq!(carol.get("age").unwrap().as_i64(), Some(52));
        assert_eq!(carol.get("active").unwrap().as_bool(), Some(false));

        let unknown = TypeDescriptor::new("Ghost", vec![]).unwrap();
        assert!(matches!(
            engine.evolve_type(&unknown, &v2, &[]),
            Err(EngineError::UnknownType(_))
        ));
    }

    // ------------------------------------------------------------------
    // Backup, export, integrity
    // ------------------------------------------------------------------

    #[test]
    fn backup_follows_every_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).with_backup(BackupSettings::new(dir.path().join("backup")));
        let engine = EmbeddedStorage::start(config).unwrap();
        for i in 0..20 {
            engine.store(&person(&format!("p{i}"), i)).unwrap();
        }
        let reports = engine.verify_backup().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(VerifyReport::is_converged));
        let synced = engine.backup_pass().unwrap();
        assert!(synced.iter().all(|r| r.bytes_copied == 0));
    }

    #[test]
    fn export_copies_files_and_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        for i in 0..10 {
            engine.store(&person(&format!("p{i}"), i)).unwrap();
        }

        let target = Arc::new(InMemoryBlobStore::new());
        let reports = engine.export_to(target.clone()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(target.len(DICTIONARY_FILE_NAME).unwrap().unwrap() > 0);
        assert_eq!(target.list("channel_").unwrap().len(), 2);

        let again = engine.export_to(target).unwrap();
        assert!(again.iter().all(|r| r.bytes_copied == 0));
    }

    #[test]
    fn integrity_check_finds_dangling_references() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedStorage::start(config(dir.path())).unwrap();
        let alice = person("alice", 30);
        let bob = person("bob", 40);
        alice.set_reference("friend", &bob).unwrap();
        let alice_oid = engine.set_root(&alice).unwrap();
        assert!(engine.check_integrity().unwrap().is_clean());

        let bob_oid = engine.registry().peek(&bob).unwrap();
        engine.delete(&[bob_oid]).unwrap();
        let report = engine.check_integrity().unwrap();
        assert_eq!(
            report.problems,
            vec![crate::integrity::IntegrityProblem::DanglingReference {
                from: alice_oid,
                to: bob_oid
            }]
        );
    }
}
