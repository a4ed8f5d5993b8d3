//! Export, import and snapshot support.
//!
//! [`EntityStore::enumerate`] flattens every live entity into an
//! [`EntityRecord`] of JSON component values. [`EntityStore::replace_all`]
//! does the inverse, rebuilding the live collection from records. A
//! [`StoreSnapshot`] bundles the records with the allocator position and a
//! BLAKE3 content hash, so a saved store can be verified before it is
//! restored.
//!
//! Import only works for entity and component types registered with the
//! store beforehand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dynamic::DynamicComponents;
use crate::entity::{EntityId, IdAllocator};
use crate::store::{EntityStore, Entry, StoreState};
use crate::StoreError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Serialized form of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    /// Bare name of the entity type.
    pub type_name: String,
    /// Static components by bare name.
    /// Uses `BTreeMap` for deterministic serialization order.
    pub components: BTreeMap<String, Value>,
    /// Dynamic components by bare name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dynamic: BTreeMap<String, Value>,
}

/// A serializable, content-hashed copy of a store's entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// The id the allocator will hand out next.
    pub next_id: u64,
    /// Every live entity, sorted by id.
    pub entities: Vec<EntityRecord>,
    /// BLAKE3 hex digest of `next_id` and `entities`.
    pub hash: String,
}

fn compute_hash(next_id: u64, entities: &[EntityRecord]) -> Result<String, StoreError> {
    #[derive(Serialize)]
    struct Hashable<'a> {
        next_id: u64,
        entities: &'a [EntityRecord],
    }

    let json_bytes = serde_json::to_vec(&Hashable { next_id, entities })
        .map_err(|e| StoreError::SnapshotFormat { details: e.to_string() })?;
    Ok(blake3::hash(&json_bytes).to_hex().to_string())
}

impl StoreSnapshot {
    /// Build a snapshot and compute its hash.
    pub fn new(next_id: u64, entities: Vec<EntityRecord>) -> Result<Self, StoreError> {
        let hash = compute_hash(next_id, &entities)?;
        Ok(Self {
            next_id,
            entities,
            hash,
        })
    }

    /// Check the stored hash against the contents.
    pub fn verify(&self) -> Result<(), StoreError> {
        let actual = compute_hash(self.next_id, &self.entities)?;
        if actual != self.hash {
            return Err(StoreError::SnapshotHashMismatch {
                expected: self.hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::SnapshotFormat {
            details: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::SnapshotFormat {
            details: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Rebuild entries from records without touching the live store.
fn stage(
    state: &StoreState,
    records: Vec<EntityRecord>,
) -> Result<HashMap<EntityId, Arc<Entry>>, StoreError> {
    let mut staged: HashMap<EntityId, Arc<Entry>> = HashMap::with_capacity(records.len());

    for record in records {
        let id = record.id;
        if id.is_none() {
            return Err(StoreError::InvalidArgument {
                reason: format!("`{}` record has no id", record.type_name),
            });
        }
        if staged.contains_key(&id) {
            return Err(StoreError::AlreadyExists { id });
        }

        let factory = state.factories.get(record.type_name.as_str()).ok_or_else(|| {
            let mut registered: Vec<&str> = state.factories.keys().copied().collect();
            registered.sort_unstable();
            StoreError::UnknownEntityType {
                name: record.type_name.clone(),
                registered: registered.join(", "),
            }
        })?;
        let descriptor = &factory.descriptor;

        let cell = (factory.make)();
        let dynamic = {
            let mut entity = cell.write();
            entity.set_entity_id(id);

            for (name, value) in record.components {
                let info = descriptor.component_by_name(&name).ok_or_else(|| {
                    StoreError::UnknownComponent {
                        name: name.clone(),
                        registered: descriptor
                            .components()
                            .iter()
                            .map(|c| c.name())
                            .collect::<Vec<_>>()
                            .join(", "),
                    }
                })?;
                let slot = entity
                    .component_mut(info.type_id())
                    .ok_or(StoreError::ComponentNotFound { component: name })?;
                info.assign_json(slot, value)?;
            }

            if !record.dynamic.is_empty() {
                let table = entity.dynamic_components().ok_or_else(|| StoreError::InvalidArgument {
                    reason: format!("entity type `{}` has no dynamic components", descriptor.name()),
                })?;
                for (name, value) in record.dynamic {
                    let info = state.components.lookup_by_name(&name).ok_or_else(|| {
                        StoreError::UnknownComponent {
                            name: name.clone(),
                            registered: state.components.registered_names().join(", "),
                        }
                    })?;
                    table.insert_boxed(info.decode(value)?)?;
                }
            }

            entity.dynamic_components().map(DynamicComponents::share)
        };

        staged.insert(id, Arc::new(Entry::new(id, Arc::clone(descriptor), cell, dynamic)));
    }

    Ok(staged)
}

// ---------------------------------------------------------------------------
// Store export / import
// ---------------------------------------------------------------------------

impl EntityStore {
    /// Serialize every live entity, sorted by id.
    ///
    /// Reads every entity cell, so calling this (or
    /// [`capture_snapshot`](Self::capture_snapshot)) from inside a `view` or
    /// `view_specific` callback deadlocks on the entity being viewed.
    pub fn enumerate(&self) -> Result<Vec<EntityRecord>, StoreError> {
        let entries: Vec<Arc<Entry>> = self.read_state().entries.values().cloned().collect();

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let entity = entry.cell.read();
            let mut components = BTreeMap::new();
            for info in entry.descriptor.components() {
                let value = entity
                    .component(info.type_id())
                    .ok_or_else(|| StoreError::ComponentNotFound {
                        component: info.name().to_owned(),
                    })?;
                components.insert(info.name().to_owned(), info.to_json(value)?);
            }

            let mut dynamic = BTreeMap::new();
            if let Some(table) = &entry.dynamic {
                for component in table.list() {
                    dynamic.insert(component.component_name().to_owned(), component.to_json()?);
                }
            }

            records.push(EntityRecord {
                id: entry.id,
                type_name: entry.descriptor.name().to_owned(),
                components,
                dynamic,
            });
        }

        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Replace every live entity with ones rebuilt from `records`.
    ///
    /// All records are decoded before anything changes; on error the store
    /// is left as it was. Entities that were live before lose their ids.
    /// The allocator is reset to one past the largest imported id, or to 1
    /// when `records` is empty.
    pub fn replace_all(&self, records: Vec<EntityRecord>) -> Result<(), StoreError> {
        self.replace_entries(records, None)
    }

    /// Capture the live entities and allocator position.
    pub fn capture_snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let entities = self.enumerate()?;
        let next_id = self.read_state().alloc.peek_next().to_raw();
        StoreSnapshot::new(next_id, entities)
    }

    /// Restore a verified snapshot, including the allocator position.
    ///
    /// Fails with [`StoreError::SnapshotHashMismatch`] and leaves the store
    /// untouched if the snapshot's hash does not match its contents.
    pub fn restore_from_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        if let Err(e) = snapshot.verify() {
            warn!(error = %e, "rejecting snapshot");
            return Err(e);
        }
        self.replace_entries(snapshot.entities.clone(), Some(snapshot.next_id))
    }

    fn replace_entries(
        &self,
        records: Vec<EntityRecord>,
        next_id: Option<u64>,
    ) -> Result<(), StoreError> {
        let count = records.len();
        let staged = {
            let state = self.read_state();
            stage(&state, records)
        };
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, records = count, "rejecting import");
                return Err(e);
            }
        };

        let max_id = staged.keys().copied().max().unwrap_or(EntityId::NONE);
        let alloc = match next_id {
            Some(next) => {
                let mut alloc = IdAllocator::restore(next);
                alloc.observe(max_id).map(|()| alloc)
            }
            None => IdAllocator::after(max_id),
        };
        let alloc = match alloc {
            Ok(alloc) => alloc,
            Err(e) => {
                warn!(error = %e, records = count, "rejecting import");
                return Err(e);
            }
        };

        let previous = {
            let mut state = self.write_state();
            state.alloc = alloc;
            std::mem::replace(&mut state.entries, staged)
        };

        for entry in previous.into_values() {
            let mut entity = entry.cell.write();
            if entity.entity_id() == entry.id {
                entity.set_entity_id(EntityId::NONE);
            }
        }
        debug!(entities = count, "store contents replaced");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::BaseDynamicEntity;
    use crate::entity::{BaseEntity, Entity};

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(i32);

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Velocity {
        dx: i32,
        dy: i32,
    }

    #[derive(Default)]
    struct Unit {
        base: BaseEntity,
        health: Health,
    }
    crate::impl_entity!(Unit { base; health: Health });

    #[derive(Default)]
    struct Drone {
        base: BaseDynamicEntity,
    }
    crate::impl_entity!(dynamic Drone { base; });

    fn registered_store() -> EntityStore {
        let store = EntityStore::new();
        store.register_entity_type::<Unit>().unwrap();
        store.register_entity_type::<Drone>().unwrap();
        store.register_component_type::<Velocity>().unwrap();
        store
    }

    #[test]
    fn enumerate_is_sorted_and_split() {
        let store = registered_store();
        store
            .spawn(Unit {
                health: Health(7),
                ..Default::default()
            })
            .unwrap();
        let drone = Drone::default();
        drone.base.set_component(Velocity { dx: 1, dy: 2 }).unwrap();
        store.spawn(drone).unwrap();

        let records = store.enumerate().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, EntityId::from_raw(1));
        assert_eq!(records[0].type_name, "Unit");
        assert_eq!(records[0].components["Health"], serde_json::json!(7));
        assert!(records[0].dynamic.is_empty());
        assert_eq!(records[1].dynamic["Velocity"], serde_json::json!({ "dx": 1, "dy": 2 }));
    }

    fn unit_record(id: u64) -> EntityRecord {
        EntityRecord {
            id: EntityId::from_raw(id),
            type_name: "Unit".to_owned(),
            components: BTreeMap::from([("Health".to_owned(), serde_json::json!(5))]),
            dynamic: BTreeMap::new(),
        }
    }

    #[test]
    fn replace_all_resets_allocator_to_imported_ids() {
        let store = registered_store();
        for _ in 0..10 {
            store.spawn(Unit::default()).unwrap();
        }

        store.replace_all(vec![unit_record(2)]).unwrap();
        assert_eq!(store.len(), 1);
        let next = store.spawn(Unit::default()).unwrap();
        assert_eq!(next.read().entity_id(), EntityId::from_raw(3));

        store.replace_all(Vec::new()).unwrap();
        let first = store.spawn(Unit::default()).unwrap();
        assert_eq!(first.read().entity_id(), EntityId::from_raw(1));
    }

    #[test]
    fn replace_all_rejects_last_id_without_changes() {
        let store = registered_store();
        let keep = store.spawn(Unit::default()).unwrap();

        let err = store.replace_all(vec![unit_record(u64::MAX)]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
        assert_eq!(store.len(), 1);
        assert_eq!(keep.read().entity_id(), EntityId::from_raw(1));

        let next = store.spawn(Unit::default()).unwrap();
        assert_eq!(next.read().entity_id(), EntityId::from_raw(2));
    }

    #[test]
    fn replace_all_rebuilds_entities() {
        let source = registered_store();
        source
            .spawn(Unit {
                health: Health(3),
                ..Default::default()
            })
            .unwrap();
        let drone = Drone::default();
        drone.base.set_component(Velocity { dx: 5, dy: 5 }).unwrap();
        source.spawn(drone).unwrap();
        let records = source.enumerate().unwrap();

        let target = registered_store();
        let old = target.spawn(Unit::default()).unwrap();
        target.replace_all(records.clone()).unwrap();

        assert_eq!(target.enumerate().unwrap(), records);
        assert!(old.read().entity_id().is_none());
        assert_eq!(target.iterate_all::<(Velocity,)>().len(), 1);

        let next = target.spawn(Unit::default()).unwrap();
        assert_eq!(next.read().entity_id(), EntityId::from_raw(3));
    }

    #[test]
    fn replace_all_rejects_unknown_type_without_changes() {
        let store = registered_store();
        store.spawn(Unit::default()).unwrap();
        let before = store.enumerate().unwrap();

        let bad = vec![EntityRecord {
            id: EntityId::from_raw(9),
            type_name: "Dragon".to_owned(),
            components: BTreeMap::new(),
            dynamic: BTreeMap::new(),
        }];
        let err = store.replace_all(bad).unwrap_err();
        assert!(matches!(err, StoreError::UnknownEntityType { .. }));
        assert_eq!(store.enumerate().unwrap(), before);
    }

    #[test]
    fn replace_all_rejects_bad_records() {
        let store = registered_store();
        let record = |id: u64, health: Value| EntityRecord {
            id: EntityId::from_raw(id),
            type_name: "Unit".to_owned(),
            components: BTreeMap::from([("Health".to_owned(), health)]),
            dynamic: BTreeMap::new(),
        };

        assert!(matches!(
            store.replace_all(vec![record(0, serde_json::json!(1))]),
            Err(StoreError::InvalidArgument { .. })
        ));
        assert!(matches!(
            store.replace_all(vec![record(1, serde_json::json!(1)), record(1, serde_json::json!(2))]),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(matches!(
            store.replace_all(vec![record(1, serde_json::json!("x"))]),
            Err(StoreError::ComponentDeserializationError { .. })
        ));

        let mut unknown = record(1, serde_json::json!(1));
        unknown.dynamic.insert("Mana".to_owned(), serde_json::json!(3));
        assert!(matches!(
            store.replace_all(vec![unknown]),
            Err(StoreError::InvalidArgument { .. })
        ));

        let mut drone = record(2, serde_json::json!(1));
        drone.type_name = "Drone".to_owned();
        drone.components.clear();
        drone.dynamic.insert("Mana".to_owned(), serde_json::json!(3));
        assert!(matches!(
            store.replace_all(vec![drone]),
            Err(StoreError::UnknownComponent { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_round_trip_keeps_allocator() {
        let store = registered_store();
        for i in 0..4 {
            store
                .spawn(Unit {
                    health: Health(i),
                    ..Default::default()
                })
                .unwrap();
        }
        let last = store.spawn(Unit::default()).unwrap();
        store.remove(&last).unwrap();

        let snapshot = store.capture_snapshot().unwrap();
        assert_eq!(snapshot.next_id, 6);
        snapshot.verify().unwrap();

        let json = snapshot.to_json().unwrap();
        let loaded = StoreSnapshot::from_json(&json).unwrap();
        assert_eq!(loaded, snapshot);

        let restored = registered_store();
        restored.restore_from_snapshot(&loaded).unwrap();
        assert_eq!(restored.len(), 4);
        let next = restored.spawn(Unit::default()).unwrap();
        assert_eq!(next.read().entity_id(), EntityId::from_raw(6));
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let store = registered_store();
        store.spawn(Unit::default()).unwrap();
        let mut snapshot = store.capture_snapshot().unwrap();
        snapshot.entities[0]
            .components
            .insert("Health".to_owned(), serde_json::json!(1000));

        let target = registered_store();
        let err = target.restore_from_snapshot(&snapshot).unwrap_err();
        assert!(matches!(err, StoreError::SnapshotHashMismatch { .. }));
        assert!(target.is_empty());
    }

    #[test]
    fn malformed_json_is_format_error() {
        assert!(matches!(
            StoreSnapshot::from_json("{ not json"),
            Err(StoreError::SnapshotFormat { .. })
        ));
    }
}
