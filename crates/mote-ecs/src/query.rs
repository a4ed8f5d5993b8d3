//! Queries over the store and callback views of matched entities.
//!
//! A query names a [`ComponentSet`], a tuple of one to four component
//! types. An entity matches when every requested type is either one of its
//! static components or, for dynamic entities, present in its table.
//!
//! ## Views
//!
//! [`EntityWrap::view`] works on copies. Each requested component is cloned
//! out of the entity (static field first, then the dynamic table), the
//! callback mutates the copies, and only a successful callback writes them
//! back to where they came from. A failing callback leaves the entity
//! untouched. The entity's write lock is held for the whole
//! read-callback-write sequence, so opening a second view on the same entity
//! from inside a callback deadlocks.
//!
//! [`EntityWrap::view_specific`] hands the callback the concrete entity
//! instead, with no copying.

use std::any::TypeId;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::component::{component_name, Component, ComponentInfo};
use crate::entity::{Entity, EntityCell, EntityId};
use crate::store::{EntityStore, Entry};
use crate::StoreError;

/// Boxed error returned by a failing view callback.
pub type BoxError = Box<dyn Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Component resolution
// ---------------------------------------------------------------------------

/// Where a view found a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A field of the entity struct.
    Static,
    /// An entry in the entity's dynamic table.
    Dynamic,
}

fn missing<T: Component>() -> StoreError {
    StoreError::ComponentNotFound {
        component: component_name::<T>().to_owned(),
    }
}

/// Clone component `T` out of `entity`.
fn fetch_one<T: Component>(entity: &dyn Entity) -> Result<(T, Source), StoreError> {
    if let Some(value) = entity
        .component(TypeId::of::<T>())
        .and_then(|c| c.downcast_ref::<T>())
    {
        return Ok((value.clone(), Source::Static));
    }
    match entity.dynamic_components() {
        Some(table) => table.get::<T>().map(|value| (value, Source::Dynamic)),
        None => Err(missing::<T>()),
    }
}

/// Write `value` back to the place it was fetched from.
fn store_one<T: Component>(entity: &mut dyn Entity, value: T, source: Source) -> Result<(), StoreError> {
    match source {
        Source::Static => {
            let slot = entity
                .component_mut(TypeId::of::<T>())
                .and_then(|c| c.downcast_mut::<T>())
                .ok_or_else(missing::<T>)?;
            *slot = value;
            Ok(())
        }
        Source::Dynamic => entity
            .dynamic_components()
            .ok_or_else(missing::<T>)?
            .set(value),
    }
}

fn source_at(sources: &[Source], idx: usize) -> Result<Source, StoreError> {
    sources
        .get(idx)
        .copied()
        .ok_or_else(|| StoreError::InvalidCallback {
            reason: format!("no recorded source for component #{idx}"),
        })
}

/// Reject component sets that name the same type twice.
fn validate_distinct(infos: &[ComponentInfo]) -> Result<(), StoreError> {
    for (i, info) in infos.iter().enumerate() {
        if infos[..i].iter().any(|prev| prev.type_id() == info.type_id()) {
            return Err(StoreError::InvalidCallback {
                reason: format!("component `{}` is requested more than once", info.name()),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ComponentSet
// ---------------------------------------------------------------------------

/// A tuple of component types requested by a query or view.
pub trait ComponentSet: Sized {
    /// Infos of the requested components, in tuple order.
    fn infos() -> Vec<ComponentInfo>;

    /// Clone every requested component out of `entity`.
    fn fetch(entity: &dyn Entity) -> Result<(Self, Vec<Source>), StoreError>;

    /// Write the components back to the recorded sources.
    fn write_back(self, entity: &mut dyn Entity, sources: &[Source]) -> Result<(), StoreError>;
}

impl<A: Component> ComponentSet for (A,) {
    fn infos() -> Vec<ComponentInfo> {
        vec![ComponentInfo::of::<A>()]
    }

    fn fetch(entity: &dyn Entity) -> Result<(Self, Vec<Source>), StoreError> {
        let (a, sa) = fetch_one::<A>(entity)?;
        Ok(((a,), vec![sa]))
    }

    fn write_back(self, entity: &mut dyn Entity, sources: &[Source]) -> Result<(), StoreError> {
        store_one(entity, self.0, source_at(sources, 0)?)
    }
}

impl<A: Component, B: Component> ComponentSet for (A, B) {
    fn infos() -> Vec<ComponentInfo> {
        vec![ComponentInfo::of::<A>(), ComponentInfo::of::<B>()]
    }

    fn fetch(entity: &dyn Entity) -> Result<(Self, Vec<Source>), StoreError> {
        let (a, sa) = fetch_one::<A>(entity)?;
        let (b, sb) = fetch_one::<B>(entity)?;
        Ok(((a, b), vec![sa, sb]))
    }

    fn write_back(self, entity: &mut dyn Entity, sources: &[Source]) -> Result<(), StoreError> {
        let (a, b) = self;
        store_one(entity, a, source_at(sources, 0)?)?;
        store_one(entity, b, source_at(sources, 1)?)
    }
}

impl<A: Component, B: Component, C: Component> ComponentSet for (A, B, C) {
    fn infos() -> Vec<ComponentInfo> {
        vec![
            ComponentInfo::of::<A>(),
            ComponentInfo::of::<B>(),
            ComponentInfo::of::<C>(),
        ]
    }

    fn fetch(entity: &dyn Entity) -> Result<(Self, Vec<Source>), StoreError> {
        let (a, sa) = fetch_one::<A>(entity)?;
        let (b, sb) = fetch_one::<B>(entity)?;
        let (c, sc) = fetch_one::<C>(entity)?;
        Ok(((a, b, c), vec![sa, sb, sc]))
    }

    fn write_back(self, entity: &mut dyn Entity, sources: &[Source]) -> Result<(), StoreError> {
        let (a, b, c) = self;
        store_one(entity, a, source_at(sources, 0)?)?;
        store_one(entity, b, source_at(sources, 1)?)?;
        store_one(entity, c, source_at(sources, 2)?)
    }
}

impl<A: Component, B: Component, C: Component, D: Component> ComponentSet for (A, B, C, D) {
    fn infos() -> Vec<ComponentInfo> {
        vec![
            ComponentInfo::of::<A>(),
            ComponentInfo::of::<B>(),
            ComponentInfo::of::<C>(),
            ComponentInfo::of::<D>(),
        ]
    }

    fn fetch(entity: &dyn Entity) -> Result<(Self, Vec<Source>), StoreError> {
        let (a, sa) = fetch_one::<A>(entity)?;
        let (b, sb) = fetch_one::<B>(entity)?;
        let (c, sc) = fetch_one::<C>(entity)?;
        let (d, sd) = fetch_one::<D>(entity)?;
        Ok(((a, b, c, d), vec![sa, sb, sc, sd]))
    }

    fn write_back(self, entity: &mut dyn Entity, sources: &[Source]) -> Result<(), StoreError> {
        let (a, b, c, d) = self;
        store_one(entity, a, source_at(sources, 0)?)?;
        store_one(entity, b, source_at(sources, 1)?)?;
        store_one(entity, c, source_at(sources, 2)?)?;
        store_one(entity, d, source_at(sources, 3)?)
    }
}

// ---------------------------------------------------------------------------
// ViewOutcome
// ---------------------------------------------------------------------------

/// Return type accepted from view callbacks.
///
/// `()` always succeeds. `Result<(), E>` fails with the boxed error.
pub trait ViewOutcome {
    fn into_result(self) -> Result<(), BoxError>;
}

impl ViewOutcome for () {
    fn into_result(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E: Into<BoxError>> ViewOutcome for Result<(), E> {
    fn into_result(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// EntityWrap
// ---------------------------------------------------------------------------

/// A cheap handle to one entity, as returned by lookups and scans.
#[derive(Clone)]
pub struct EntityWrap {
    id: EntityId,
    cell: EntityCell,
    type_name: &'static str,
}

impl EntityWrap {
    pub(crate) fn new(id: EntityId, cell: EntityCell, type_name: &'static str) -> Self {
        Self {
            id,
            cell,
            type_name,
        }
    }

    /// The id observed when this handle was created.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The id the entity carries now.
    pub fn current_id(&self) -> EntityId {
        self.cell.read().entity_id()
    }

    /// Whether the entity still carries the id it was looked up by.
    pub fn is_valid(&self) -> bool {
        self.id.is_some() && self.current_id() == self.id
    }

    /// Bare name of the concrete entity type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Clone out one component, static or dynamic.
    pub fn component<T: Component>(&self) -> Result<T, StoreError> {
        let entity = self.cell.read();
        fetch_one::<T>(&*entity).map(|(value, _)| value)
    }

    /// Run `f` on copies of the components in `Q` and write them back if it
    /// succeeds.
    ///
    /// Fails with [`StoreError::ComponentNotFound`] before `f` runs if any
    /// component is missing, with [`StoreError::InvalidCallback`] if `Q`
    /// names a type twice, and with [`StoreError::Callback`] if `f` fails.
    pub fn view<Q, F, R>(&self, f: F) -> Result<(), StoreError>
    where
        Q: ComponentSet,
        F: FnOnce(&mut Q) -> R,
        R: ViewOutcome,
    {
        validate_distinct(&Q::infos())?;
        let mut entity = self.cell.write();
        let (mut set, sources) = Q::fetch(&*entity)?;
        f(&mut set).into_result().map_err(StoreError::Callback)?;
        set.write_back(&mut *entity, &sources)
    }

    /// Run `f` on the concrete entity.
    ///
    /// Fails with [`StoreError::InvalidCallback`] before `f` runs if the
    /// entity is not an `E`.
    pub fn view_specific<E, F, R>(&self, f: F) -> Result<(), StoreError>
    where
        E: Entity,
        F: FnOnce(&mut E) -> R,
        R: ViewOutcome,
    {
        let mut entity = self.cell.write();
        let concrete = entity
            .as_any_mut()
            .downcast_mut::<E>()
            .ok_or_else(|| StoreError::InvalidCallback {
                reason: format!(
                    "entity {} is a `{}`, not a `{}`",
                    self.id,
                    self.type_name,
                    component_name::<E>()
                ),
            })?;
        f(concrete).into_result().map_err(StoreError::Callback)
    }
}

impl fmt::Debug for EntityWrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityWrap")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// QueryResult
// ---------------------------------------------------------------------------

/// Entities matched by a scan. Order is unspecified unless the scan says
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    entities: Vec<EntityWrap>,
}

impl QueryResult {
    fn from_entries(entries: Vec<Arc<Entry>>) -> Self {
        Self {
            entities: entries.iter().map(|entry| entry.wrap()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntityWrap> {
        self.entities.iter()
    }

    /// Ids of the matched entities.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(EntityWrap::id).collect()
    }

    pub fn into_vec(self) -> Vec<EntityWrap> {
        self.entities
    }
}

impl IntoIterator for QueryResult {
    type Item = EntityWrap;
    type IntoIter = std::vec::IntoIter<EntityWrap>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a EntityWrap;
    type IntoIter = std::slice::Iter<'a, EntityWrap>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.iter()
    }
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

fn entry_has(entry: &Entry, info: &ComponentInfo) -> bool {
    entry.descriptor.has_component(info.type_id())
        || entry
            .dynamic
            .as_ref()
            .is_some_and(|table| table.has_type(info.name(), info.type_id()))
}

fn entry_has_name(entry: &Entry, name: &str) -> bool {
    entry.descriptor.component_by_name(name).is_some()
        || entry
            .dynamic
            .as_ref()
            .is_some_and(|table| table.has_name(name))
}

impl EntityStore {
    /// Every entity holding all components in `Q`, statically or
    /// dynamically.
    pub fn iterate_all<Q: ComponentSet>(&self) -> QueryResult {
        let infos = Q::infos();
        let hits = self.scan(|entry| infos.iter().all(|info| entry_has(entry, info)));
        trace!(components = infos.len(), hits = hits.len(), "iterate_all");
        QueryResult::from_entries(hits)
    }

    /// Like [`iterate_all`](Self::iterate_all), with components given by
    /// bare name.
    pub fn iterate_all_by_name(&self, names: &[&str]) -> QueryResult {
        let hits = self.scan(|entry| names.iter().all(|name| entry_has_name(entry, name)));
        QueryResult::from_entries(hits)
    }

    /// Every entity whose concrete type is exactly `E`.
    pub fn iterate_by_exact_type<E: Entity>(&self) -> QueryResult {
        let type_id = TypeId::of::<E>();
        let hits = self.scan(|entry| entry.descriptor.type_id() == type_id);
        QueryResult::from_entries(hits)
    }

    /// Live entities among `ids`, in input order. Misses are skipped.
    pub fn iterate_by_id(&self, ids: &[EntityId]) -> QueryResult {
        let state = self.read_state();
        let entities = ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|entry| entry.wrap())
            .collect();
        QueryResult { entities }
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

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Pos {
        x: i32,
        y: i32,
    }

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Velocity {
        dx: i32,
        dy: i32,
    }

    #[derive(Default)]
    struct Unit {
        base: BaseEntity,
        health: Health,
        pos: Pos,
    }
    crate::impl_entity!(Unit { base; health: Health, pos: Pos });

    #[derive(Default)]
    struct Tower {
        base: BaseEntity,
        health: Health,
        pos: Pos,
    }
    crate::impl_entity!(Tower { base; health: Health, pos: Pos });

    #[derive(Default)]
    struct Drone {
        base: BaseDynamicEntity,
        pos: Pos,
    }
    crate::impl_entity!(dynamic Drone { base; pos: Pos });

    fn populated() -> EntityStore {
        let store = EntityStore::new();
        for _ in 0..3 {
            store.spawn(Unit::default()).unwrap();
        }
        store.spawn(Tower::default()).unwrap();
        let drone = Drone::default();
        drone.base.set_component(Velocity { dx: 1, dy: 1 }).unwrap();
        store.spawn(drone).unwrap();
        store.spawn(Drone::default()).unwrap();
        store
    }

    #[test]
    fn iterate_all_matches_static_and_dynamic() {
        let store = populated();
        assert_eq!(store.iterate_all::<(Pos,)>().len(), 6);
        assert_eq!(store.iterate_all::<(Health, Pos)>().len(), 4);
        assert_eq!(store.iterate_all::<(Pos, Velocity)>().len(), 1);
        assert!(store.iterate_all::<(Velocity, Health)>().is_empty());
    }

    #[test]
    fn iterate_all_by_name_matches_names() {
        let store = populated();
        assert_eq!(store.iterate_all_by_name(&["Health", "Pos"]).len(), 4);
        assert_eq!(store.iterate_all_by_name(&["Velocity"]).len(), 1);
        assert_eq!(store.iterate_all_by_name(&[]).len(), 6);
    }

    #[test]
    fn exact_type_excludes_lookalikes() {
        let store = populated();
        let units = store.iterate_by_exact_type::<Unit>();
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|w| w.type_name() == "Unit"));
        assert_eq!(store.iterate_by_exact_type::<Tower>().len(), 1);
    }

    #[test]
    fn iterate_by_id_skips_misses_and_keeps_order() {
        let store = populated();
        let ids = [
            EntityId::from_raw(3),
            EntityId::from_raw(999),
            EntityId::from_raw(1),
        ];
        let found = store.iterate_by_id(&ids);
        assert_eq!(found.ids(), vec![EntityId::from_raw(3), EntityId::from_raw(1)]);
    }

    #[test]
    fn parallel_scans_agree_with_sequential() {
        let store = populated();
        let mut expected = store.iterate_all::<(Pos,)>().ids();
        expected.sort();
        for workers in [2, 4, 8] {
            store.set_parallelism(workers).unwrap();
            let mut got = store.iterate_all::<(Pos,)>().ids();
            got.sort();
            assert_eq!(got, expected, "parallelism {workers}");
        }
    }

    #[test]
    fn view_writes_back_static_and_dynamic() {
        let store = populated();
        let hit = store.iterate_all::<(Pos, Velocity)>().into_vec().remove(0);

        hit.view(|(pos, vel): &mut (Pos, Velocity)| {
            pos.x += vel.dx;
            vel.dx = 10;
        })
        .unwrap();

        let again = store.get(hit.id()).unwrap();
        assert_eq!(again.component::<Pos>().unwrap(), Pos { x: 1, y: 0 });
        assert_eq!(again.component::<Velocity>().unwrap().dx, 10);
    }

    #[test]
    fn failing_view_leaves_components_untouched() {
        let store = populated();
        let unit = store.iterate_by_exact_type::<Unit>().into_vec().remove(0);

        let err = unit
            .view(|(health,): &mut (Health,)| {
                health.0 = -50;
                Err::<(), _>("refused")
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Callback(_)));
        assert_eq!(unit.component::<Health>().unwrap(), Health(0));
    }

    #[test]
    fn view_missing_component_skips_callback() {
        let store = populated();
        let unit = store.iterate_by_exact_type::<Unit>().into_vec().remove(0);
        let mut called = false;
        let err = unit
            .view(|_: &mut (Velocity,)| {
                called = true;
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::ComponentNotFound { .. }));
        assert!(!called);
    }

    #[test]
    fn view_rejects_duplicate_types() {
        let store = populated();
        let unit = store.iterate_by_exact_type::<Unit>().into_vec().remove(0);
        let err = unit.view(|_: &mut (Pos, Pos)| {}).unwrap_err();
        assert!(matches!(err, StoreError::InvalidCallback { .. }));
    }

    #[test]
    fn view_specific_checks_concrete_type() {
        let store = populated();
        let tower = store.iterate_by_exact_type::<Tower>().into_vec().remove(0);

        tower
            .view_specific(|t: &mut Tower| {
                t.health.0 = 99;
            })
            .unwrap();
        assert_eq!(tower.component::<Health>().unwrap(), Health(99));

        let err = tower.view_specific(|_: &mut Unit| {}).unwrap_err();
        assert!(matches!(err, StoreError::InvalidCallback { .. }));
    }

    #[test]
    fn view_callback_may_query_the_store() {
        let store = populated();
        let unit = store.iterate_by_exact_type::<Unit>().into_vec().remove(0);
        unit.view(|(health,): &mut (Health,)| {
            health.0 = store.iterate_all::<(Pos,)>().len() as i32;
        })
        .unwrap();
        assert_eq!(unit.component::<Health>().unwrap(), Health(6));
    }
}
