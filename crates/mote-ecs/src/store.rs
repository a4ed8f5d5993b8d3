//! The [`EntityStore`]: identity assignment, live entries, registration and
//! scan parallelism.
//!
//! All store state sits behind one [`parking_lot::RwLock`]. Mutating
//! operations take it exclusively; lookups and scans take it shared. Each
//! entity lives in its own `Arc<RwLock<E>>` that the caller keeps a handle
//! to, so ids written by the store are visible to the caller immediately.
//!
//! Every entry records the entity's descriptor and a shared handle to its
//! dynamic table at insertion time. Scans therefore never lock entity cells.
//! Lock order is entity cell, then store, then dynamic table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::component::{Component, ComponentRegistry};
use crate::descriptor::{DescriptorCache, TypeDescriptor};
use crate::dynamic::DynamicComponents;
use crate::entity::{shared, Entity, EntityCell, EntityId, IdAllocator, Shared};
use crate::query::EntityWrap;
use crate::StoreError;

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Store construction options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of workers used by scans. `1` scans on the calling thread.
    pub parallelism: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { parallelism: 1 }
    }
}

// ---------------------------------------------------------------------------
// Entries and state
// ---------------------------------------------------------------------------

/// One live entity as seen by the store.
pub(crate) struct Entry {
    pub(crate) id: EntityId,
    pub(crate) descriptor: Arc<TypeDescriptor>,
    pub(crate) cell: EntityCell,
    /// Shared handle to the entity's table, `None` for static entities.
    pub(crate) dynamic: Option<DynamicComponents>,
}

impl Entry {
    pub(crate) fn new(
        id: EntityId,
        descriptor: Arc<TypeDescriptor>,
        cell: EntityCell,
        dynamic: Option<DynamicComponents>,
    ) -> Self {
        Self {
            id,
            descriptor,
            cell,
            dynamic,
        }
    }

    pub(crate) fn wrap(&self) -> EntityWrap {
        EntityWrap::new(self.id, Arc::clone(&self.cell), self.descriptor.name())
    }
}

/// Builds a default instance of a registered entity type, for import.
#[derive(Clone)]
pub(crate) struct EntityFactory {
    pub(crate) descriptor: Arc<TypeDescriptor>,
    pub(crate) make: fn() -> EntityCell,
}

fn make_default<E: Entity + Default>() -> EntityCell {
    shared(E::default())
}

pub(crate) struct StoreState {
    pub(crate) alloc: IdAllocator,
    pub(crate) entries: HashMap<EntityId, Arc<Entry>>,
    pub(crate) descriptors: DescriptorCache,
    pub(crate) components: ComponentRegistry,
    pub(crate) factories: HashMap<&'static str, EntityFactory>,
    parallelism: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
}

fn build_pool(parallelism: usize) -> Result<Option<Arc<rayon::ThreadPool>>, StoreError> {
    match parallelism {
        0 => Err(StoreError::InvalidArgument {
            reason: "parallelism must be at least 1".to_owned(),
        }),
        1 => Ok(None),
        n => rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .thread_name(|i| format!("mote-scan-{i}"))
            .build()
            .map(|pool| Some(Arc::new(pool)))
            .map_err(|e| StoreError::InvalidArgument {
                reason: format!("failed to start {n} scan workers: {e}"),
            }),
    }
}

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// An in-process collection of entities keyed by [`EntityId`].
pub struct EntityStore {
    state: RwLock<StoreState>,
}

impl EntityStore {
    /// Create an empty store that scans sequentially.
    pub fn new() -> Self {
        Self::from_parts(1, None)
    }

    /// Create an empty store from a [`StoreConfig`].
    pub fn with_config(config: StoreConfig) -> Result<Self, StoreError> {
        let pool = build_pool(config.parallelism)?;
        Ok(Self::from_parts(config.parallelism, pool))
    }

    fn from_parts(parallelism: usize, pool: Option<Arc<rayon::ThreadPool>>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                alloc: IdAllocator::new(),
                entries: HashMap::new(),
                descriptors: DescriptorCache::new(),
                components: ComponentRegistry::new(),
                factories: HashMap::new(),
                parallelism,
                pool,
            }),
        }
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read()
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write()
    }

    // -- insertion / removal ------------------------------------------------

    /// Insert an entity and return its id.
    ///
    /// An entity whose id is [`EntityId::NONE`] receives the next allocated
    /// id. A preset id is kept and the allocator moves past it. Fails with
    /// [`StoreError::AlreadyExists`] if the id is already live and with
    /// [`StoreError::InvalidArgument`] if no id is left to allocate after it.
    pub fn add<E: Entity>(&self, entity: &Shared<E>) -> Result<EntityId, StoreError> {
        let mut guard = entity.write();
        let dynamic = guard.dynamic_components().map(DynamicComponents::share);
        let mut state = self.state.write();
        let descriptor = state.descriptors.describe(&*guard)?;

        let preset = guard.entity_id();
        let id = if preset.is_some() {
            if state.entries.contains_key(&preset) {
                return Err(StoreError::AlreadyExists { id: preset });
            }
            state.alloc.observe(preset)?;
            preset
        } else {
            state.alloc.allocate()?
        };
        guard.set_entity_id(id);

        let cell: EntityCell = entity.clone();
        debug!(entity = %id, entity_type = descriptor.name(), "entity added");
        state
            .entries
            .insert(id, Arc::new(Entry::new(id, descriptor, cell, dynamic)));
        Ok(id)
    }

    /// Wrap `entity` in a [`Shared`] handle and insert it.
    pub fn spawn<E: Entity>(&self, entity: E) -> Result<Shared<E>, StoreError> {
        let handle = shared(entity);
        self.add(&handle)?;
        Ok(handle)
    }

    /// Remove an entity and reset its id to [`EntityId::NONE`].
    ///
    /// Fails with [`StoreError::NoIdentity`] if the entity has no id, and
    /// with [`StoreError::EntityNotFound`] if its id is not live or belongs
    /// to a different entity.
    pub fn remove<E: Entity + ?Sized>(&self, entity: &Arc<RwLock<E>>) -> Result<(), StoreError> {
        let mut guard = entity.write();
        let id = guard.entity_id();
        if id.is_none() {
            return Err(StoreError::NoIdentity);
        }

        let target = Arc::as_ptr(entity).cast::<()>();
        let mut state = self.state.write();
        let same_cell = state
            .entries
            .get(&id)
            .is_some_and(|entry| Arc::as_ptr(&entry.cell).cast::<()>() == target);
        if !same_cell {
            return Err(StoreError::EntityNotFound { id });
        }
        state.entries.remove(&id);
        drop(state);

        guard.set_entity_id(EntityId::NONE);
        debug!(entity = %id, "entity removed");
        Ok(())
    }

    /// Remove the entity with the given id, returning a handle to it.
    ///
    /// Must not be called for an entity whose view is running on the
    /// current thread.
    pub fn remove_by_id(&self, id: EntityId) -> Result<EntityWrap, StoreError> {
        if id.is_none() {
            return Err(StoreError::NoIdentity);
        }
        let entry = self
            .state
            .write()
            .entries
            .remove(&id)
            .ok_or(StoreError::EntityNotFound { id })?;

        let mut entity = entry.cell.write();
        if entity.entity_id() == id {
            entity.set_entity_id(EntityId::NONE);
        }
        drop(entity);
        debug!(entity = %id, "entity removed");
        Ok(entry.wrap())
    }

    // -- lookup ---------------------------------------------------------------

    /// Look up a live entity.
    pub fn get(&self, id: EntityId) -> Result<EntityWrap, StoreError> {
        self.get_or_none(id)
            .ok_or(StoreError::EntityNotFound { id })
    }

    /// Look up a live entity, `None` on miss.
    pub fn get_or_none(&self, id: EntityId) -> Option<EntityWrap> {
        self.state.read().entries.get(&id).map(|entry| entry.wrap())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.state.read().entries.contains_key(&id)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Wrap a shared entity without consulting the store.
    pub fn access<E: Entity>(&self, entity: &Shared<E>) -> EntityWrap {
        let id = entity.read().entity_id();
        let cell: EntityCell = entity.clone();
        EntityWrap::new(id, cell, crate::component::component_name::<E>())
    }

    // -- registration ---------------------------------------------------------

    /// Describe entity type `E` up front and make it constructible by
    /// [`replace_all`](Self::replace_all).
    ///
    /// Also registers every static component of `E`.
    pub fn register_entity_type<E: Entity + Default>(&self) -> Result<(), StoreError> {
        let is_dynamic = E::default().dynamic_components().is_some();
        let mut state = self.state.write();
        let descriptor = state.descriptors.describe_with::<E>(is_dynamic)?;
        for info in descriptor.components() {
            state.components.register_info(*info)?;
        }
        state.factories.insert(
            descriptor.name(),
            EntityFactory {
                descriptor: Arc::clone(&descriptor),
                make: make_default::<E>,
            },
        );
        debug!(entity_type = descriptor.name(), "entity type registered");
        Ok(())
    }

    /// Make component type `T` decodable by name.
    pub fn register_component_type<T: Component>(&self) -> Result<(), StoreError> {
        self.state.write().components.register::<T>()
    }

    // -- parallelism ----------------------------------------------------------

    /// Set the number of scan workers. `0` is rejected.
    pub fn set_parallelism(&self, parallelism: usize) -> Result<(), StoreError> {
        let pool = build_pool(parallelism)?;
        let mut state = self.state.write();
        state.parallelism = parallelism;
        state.pool = pool;
        debug!(parallelism, "scan parallelism changed");
        Ok(())
    }

    pub fn parallelism(&self) -> usize {
        self.state.read().parallelism
    }

    // -- scanning -------------------------------------------------------------

    /// Collect every live entry accepted by `pred`.
    ///
    /// With parallelism `n > 1` the entries are split into `n` contiguous
    /// ranges filtered on the worker pool and merged under a mutex. The
    /// store lock is held shared until every worker has finished.
    pub(crate) fn scan<F>(&self, pred: F) -> Vec<Arc<Entry>>
    where
        F: Fn(&Entry) -> bool + Sync,
    {
        let state = self.state.read();
        let entries: Vec<&Arc<Entry>> = state.entries.values().collect();

        let pool = match &state.pool {
            Some(pool) if state.parallelism > 1 && entries.len() > 1 => pool,
            _ => {
                let hits: Vec<Arc<Entry>> = entries
                    .into_iter()
                    .filter(|entry| pred(entry))
                    .cloned()
                    .collect();
                trace!(hits = hits.len(), total = state.entries.len(), "sequential scan");
                return hits;
            }
        };

        let chunk_len = entries.len().div_ceil(state.parallelism);
        let merged: Mutex<Vec<Arc<Entry>>> = Mutex::new(Vec::new());
        pool.scope(|scope| {
            for chunk in entries.chunks(chunk_len) {
                let merged = &merged;
                let pred = &pred;
                scope.spawn(move |_| {
                    let local: Vec<Arc<Entry>> = chunk
                        .iter()
                        .filter(|entry| pred(entry))
                        .map(|entry| Arc::clone(*entry))
                        .collect();
                    merged.lock().extend(local);
                });
            }
        });

        let hits = merged.into_inner();
        trace!(
            hits = hits.len(),
            total = entries.len(),
            workers = state.parallelism,
            "parallel scan"
        );
        hits
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("EntityStore")
            .field("entities", &state.entries.len())
            .field("descriptors", &state.descriptors.len())
            .field("parallelism", &state.parallelism)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::BaseDynamicEntity;
    use crate::entity::BaseEntity;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(i32);

    #[derive(Default)]
    struct Unit {
        base: BaseEntity,
        health: Health,
    }
    crate::impl_entity!(Unit { base; health: Health });

    #[derive(Default)]
    struct Ghost {
        base: BaseDynamicEntity,
    }
    crate::impl_entity!(dynamic Ghost { base; });

    #[test]
    fn add_assigns_increasing_ids() {
        let store = EntityStore::new();
        let a = store.spawn(Unit::default()).unwrap();
        let b = store.spawn(Unit::default()).unwrap();
        let a_id = a.read().entity_id();
        let b_id = b.read().entity_id();
        assert!(a_id.is_some());
        assert!(a_id < b_id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn preset_id_is_kept_and_skipped_by_allocator() {
        let store = EntityStore::new();
        let mut unit = Unit::default();
        unit.set_entity_id(EntityId::from_raw(10));
        let unit = shared(unit);
        assert_eq!(store.add(&unit).unwrap(), EntityId::from_raw(10));

        let next = store.spawn(Unit::default()).unwrap();
        assert_eq!(next.read().entity_id(), EntityId::from_raw(11));
    }

    #[test]
    fn preset_id_at_end_of_id_space_is_rejected() {
        let store = EntityStore::new();
        let first = store.spawn(Unit::default()).unwrap();

        let mut unit = Unit::default();
        unit.set_entity_id(EntityId::from_raw(u64::MAX));
        let unit = shared(unit);
        let err = store.add(&unit).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
        assert_eq!(store.len(), 1);
        assert!(!store.contains(EntityId::from_raw(u64::MAX)));

        // The allocator is untouched and never hands out id 0.
        let next = store.spawn(Unit::default()).unwrap();
        assert_eq!(first.read().entity_id(), EntityId::from_raw(1));
        assert_eq!(next.read().entity_id(), EntityId::from_raw(2));
    }

    #[test]
    fn adding_live_id_twice_fails() {
        let store = EntityStore::new();
        let unit = store.spawn(Unit::default()).unwrap();
        let id = unit.read().entity_id();
        assert!(matches!(
            store.add(&unit),
            Err(StoreError::AlreadyExists { id: dup }) if dup == id
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_resets_identity() {
        let store = EntityStore::new();
        let unit = store.spawn(Unit::default()).unwrap();
        let id = unit.read().entity_id();

        store.remove(&unit).unwrap();
        assert!(unit.read().entity_id().is_none());
        assert!(!store.contains(id));
        assert!(store.get(id).unwrap_err().is_not_found());
        assert!(matches!(store.remove(&unit), Err(StoreError::NoIdentity)));
    }

    #[test]
    fn remove_rejects_impostor_with_same_id() {
        let store = EntityStore::new();
        let real = store.spawn(Unit::default()).unwrap();
        let id = real.read().entity_id();

        let mut fake = Unit::default();
        fake.set_entity_id(id);
        let fake = shared(fake);
        assert!(matches!(
            store.remove(&fake),
            Err(StoreError::EntityNotFound { .. })
        ));
        assert!(store.contains(id));
    }

    #[test]
    fn remove_through_erased_handle() {
        let store = EntityStore::new();
        let unit = store.spawn(Unit::default()).unwrap();
        let erased: EntityCell = unit.clone();
        store.remove(&erased).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn remove_by_id_returns_entity() {
        let store = EntityStore::new();
        let unit = store.spawn(Unit::default()).unwrap();
        let id = unit.read().entity_id();

        let removed = store.remove_by_id(id).unwrap();
        assert_eq!(removed.id(), id);
        assert!(!removed.is_valid());
        assert!(unit.read().entity_id().is_none());
        assert!(matches!(
            store.remove_by_id(id),
            Err(StoreError::EntityNotFound { .. })
        ));
        assert!(matches!(
            store.remove_by_id(EntityId::NONE),
            Err(StoreError::NoIdentity)
        ));
    }

    #[test]
    fn readded_entity_gets_fresh_id() {
        let store = EntityStore::new();
        let unit = store.spawn(Unit::default()).unwrap();
        let first = unit.read().entity_id();
        store.remove(&unit).unwrap();
        let second = store.add(&unit).unwrap();
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn get_or_none_and_access() {
        let store = EntityStore::new();
        assert!(store.get_or_none(EntityId::from_raw(1)).is_none());

        let ghost = store.spawn(Ghost::default()).unwrap();
        let id = ghost.read().entity_id();
        let wrap = store.get_or_none(id).unwrap();
        assert_eq!(wrap.type_name(), "Ghost");

        let direct = store.access(&ghost);
        assert_eq!(direct.id(), id);
        assert!(direct.is_valid());
    }

    #[test]
    fn parallelism_validation() {
        let store = EntityStore::new();
        assert_eq!(store.parallelism(), 1);
        assert!(matches!(
            store.set_parallelism(0),
            Err(StoreError::InvalidArgument { .. })
        ));
        store.set_parallelism(3).unwrap();
        assert_eq!(store.parallelism(), 3);
        store.set_parallelism(1).unwrap();
        assert_eq!(store.parallelism(), 1);
    }

    #[test]
    fn config_defaults_and_validation() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(EntityStore::with_config(StoreConfig { parallelism: 0 }).is_err());
        let store = EntityStore::with_config(StoreConfig { parallelism: 2 }).unwrap();
        assert_eq!(store.parallelism(), 2);
    }

    #[test]
    fn registration_populates_caches() {
        let store = EntityStore::new();
        store.register_entity_type::<Unit>().unwrap();
        store.register_entity_type::<Ghost>().unwrap();
        store.register_component_type::<Health>().unwrap();

        let state = store.read_state();
        assert_eq!(state.descriptors.names(), vec!["Ghost", "Unit"]);
        assert!(state.components.lookup_by_name("Health").is_some());
        assert!(state.factories.contains_key("Unit"));
        assert!(state.factories["Ghost"].descriptor.is_dynamic());
    }

    #[test]
    fn scan_filters_sequential_and_parallel() {
        let store = EntityStore::new();
        for _ in 0..20 {
            store.spawn(Unit::default()).unwrap();
            store.spawn(Ghost::default()).unwrap();
        }
        let seq = store.scan(|entry| entry.dynamic.is_some()).len();
        store.set_parallelism(4).unwrap();
        let par = store.scan(|entry| entry.dynamic.is_some()).len();
        assert_eq!(seq, 20);
        assert_eq!(par, 20);
    }

    #[test]
    fn debug_reports_counts() {
        let store = EntityStore::new();
        store.spawn(Unit::default()).unwrap();
        let text = format!("{store:?}");
        assert!(text.contains("entities: 1"));
        assert!(text.contains("parallelism: 1"));
    }
}
