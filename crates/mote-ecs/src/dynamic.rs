//! Runtime component tables for entities that attach components on the fly.
//!
//! A [`DynamicComponents`] table maps bare component names to boxed values
//! behind its own [`parking_lot::Mutex`]. The store keeps a second handle to
//! every dynamic entity's table, so scans can test membership without
//! locking the entity itself. Every operation takes the lock for its own
//! duration only; no user code runs while it is held.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::component::{component_name, Component};
use crate::entity::EntityId;
use crate::StoreError;

// ---------------------------------------------------------------------------
// AnyComponent
// ---------------------------------------------------------------------------

/// Object-safe view of a component value of unknown type.
pub trait AnyComponent: Any + Send + Sync {
    /// Bare component name.
    fn component_name(&self) -> &'static str;

    /// Full Rust type path.
    fn type_path(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    fn clone_boxed(&self) -> Box<dyn AnyComponent>;

    fn to_json(&self) -> Result<Value, StoreError>;
}

impl<T: Component> AnyComponent for T {
    fn component_name(&self) -> &'static str {
        component_name::<T>()
    }

    fn type_path(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn clone_boxed(&self) -> Box<dyn AnyComponent> {
        Box::new(self.clone())
    }

    fn to_json(&self) -> Result<Value, StoreError> {
        serde_json::to_value(self).map_err(|e| StoreError::ComponentSerializationError {
            component: component_name::<T>().to_owned(),
            details: e.to_string(),
        })
    }
}

impl Clone for Box<dyn AnyComponent> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

impl fmt::Debug for dyn AnyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyComponent({})", self.component_name())
    }
}

// ---------------------------------------------------------------------------
// DynamicComponents
// ---------------------------------------------------------------------------

type Table = HashMap<&'static str, Box<dyn AnyComponent>>;

/// A mutex-guarded, name-keyed component table.
///
/// `Clone` produces an independent deep copy. The store shares the same
/// table through a crate-internal handle instead.
#[derive(Default)]
pub struct DynamicComponents {
    inner: Arc<Mutex<Table>>,
}

fn slot_collision(name: &str, existing: &dyn AnyComponent, incoming: &str) -> StoreError {
    StoreError::NameCollision {
        name: name.to_owned(),
        existing: existing.type_path().to_owned(),
        incoming: incoming.to_owned(),
    }
}

fn not_found(name: &str) -> StoreError {
    StoreError::ComponentNotFound {
        component: name.to_owned(),
    }
}

impl DynamicComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the same underlying table.
    pub(crate) fn share(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Insert or overwrite the component of type `T`.
    ///
    /// Fails with [`StoreError::NameCollision`] if the slot for `T`'s bare
    /// name holds a value of a different type.
    pub fn set<T: Component>(&self, value: T) -> Result<(), StoreError> {
        self.insert_boxed(Box::new(value))
    }

    /// Insert or overwrite a type-erased component.
    pub fn insert_boxed(&self, value: Box<dyn AnyComponent>) -> Result<(), StoreError> {
        let name = value.component_name();
        let mut table = self.inner.lock();
        if let Some(existing) = table.get(name) {
            if existing.as_any().type_id() != value.as_any().type_id() {
                return Err(slot_collision(name, &**existing, value.type_path()));
            }
        }
        table.insert(name, value);
        Ok(())
    }

    /// Remove and return the component of type `T`.
    pub fn remove<T: Component>(&self) -> Result<T, StoreError> {
        let name = component_name::<T>();
        let mut table = self.inner.lock();
        match table.get(name) {
            None => return Err(not_found(name)),
            Some(existing) if !existing.as_any().is::<T>() => {
                return Err(slot_collision(
                    name,
                    &**existing,
                    std::any::type_name::<T>(),
                ));
            }
            Some(_) => {}
        }
        let boxed = table.remove(name).ok_or_else(|| not_found(name))?;
        boxed
            .into_any()
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| not_found(name))
    }

    /// Remove and return the component stored under `name`.
    pub fn remove_by_name(&self, name: &str) -> Result<Box<dyn AnyComponent>, StoreError> {
        self.inner.lock().remove(name).ok_or_else(|| not_found(name))
    }

    /// Clone out the component of type `T`.
    pub fn get<T: Component>(&self) -> Result<T, StoreError> {
        let name = component_name::<T>();
        let table = self.inner.lock();
        let existing = table.get(name).ok_or_else(|| not_found(name))?;
        existing.as_any().downcast_ref::<T>().cloned().ok_or_else(|| {
            slot_collision(name, &**existing, std::any::type_name::<T>())
        })
    }

    /// Clone out the component stored under `name`.
    pub fn get_by_name(&self, name: &str) -> Result<Box<dyn AnyComponent>, StoreError> {
        self.inner
            .lock()
            .get(name)
            .map(|c| c.clone_boxed())
            .ok_or_else(|| not_found(name))
    }

    /// Whether a component of exactly type `T` is present.
    pub fn has<T: Component>(&self) -> bool {
        self.has_type(component_name::<T>(), TypeId::of::<T>())
    }

    pub(crate) fn has_type(&self, name: &str, type_id: TypeId) -> bool {
        self.inner
            .lock()
            .get(name)
            .is_some_and(|c| c.as_any().type_id() == type_id)
    }

    /// Whether any component is stored under `name`.
    pub fn has_name(&self, name: &str) -> bool {
        self.inner.lock().contains_key(name)
    }

    /// Snapshot of all components, sorted by name.
    pub fn list(&self) -> Vec<Box<dyn AnyComponent>> {
        let mut components: Vec<Box<dyn AnyComponent>> =
            self.inner.lock().values().map(|c| c.clone_boxed()).collect();
        components.sort_by_key(|c| c.component_name());
        components
    }

    /// Names of all stored components, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.inner.lock().keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Clone for DynamicComponents {
    fn clone(&self) -> Self {
        let copy: Table = self
            .inner
            .lock()
            .iter()
            .map(|(name, c)| (*name, c.clone_boxed()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(copy)),
        }
    }
}

impl fmt::Debug for DynamicComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicComponents")
            .field("components", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BaseDynamicEntity
// ---------------------------------------------------------------------------

/// Identity state plus a dynamic component table, to embed in an entity
/// struct declared with `impl_entity!(dynamic ...)`.
///
/// The store keeps a handle to the table taken when the entity was added.
/// Do not replace the `BaseDynamicEntity` (or assign a clone over it) while
/// the entity is stored: scans and `enumerate` would keep reading the old
/// table. Mutate it through [`set_component`](Self::set_component) and
/// [`remove_component`](Self::remove_component) instead.
#[derive(Debug, Clone, Default)]
pub struct BaseDynamicEntity {
    id: EntityId,
    components: DynamicComponents,
}

impl BaseDynamicEntity {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    /// The underlying table.
    pub fn components(&self) -> &DynamicComponents {
        &self.components
    }

    /// Attach or overwrite a component.
    pub fn set_component<T: Component>(&self, value: T) -> Result<(), StoreError> {
        self.components.set(value)
    }

    /// Detach a component, returning it.
    pub fn remove_component<T: Component>(&self) -> Result<T, StoreError> {
        self.components.remove::<T>()
    }

    /// Clone out an attached component.
    pub fn get_component<T: Component>(&self) -> Result<T, StoreError> {
        self.components.get::<T>()
    }

    /// `Ok(())` if a component of type `T` is attached, otherwise
    /// [`StoreError::ComponentNotFound`].
    pub fn has_component<T: Component>(&self) -> Result<(), StoreError> {
        if self.components.has::<T>() {
            Ok(())
        } else {
            Err(not_found(component_name::<T>()))
        }
    }

    /// Snapshot of every attached component.
    pub fn list_components(&self) -> Vec<Box<dyn AnyComponent>> {
        self.components.list()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
