//! Component naming, type-erased metadata, and the name registry.
//!
//! A component is identified by its *bare name*: the last path segment of
//! [`std::any::type_name`] with any generic arguments stripped
//! (`game::units::Health` becomes `Health`). Static lookups additionally use
//! `TypeId`, so only name-keyed paths (dynamic tables, import) can observe a
//! clash, and those paths reject one with [`StoreError::NameCollision`].
//!
//! [`ComponentInfo`] carries the function pointers needed to move a component
//! across the JSON boundary without knowing its concrete type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::dynamic::AnyComponent;
use crate::StoreError;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Marker for values usable as components.
///
/// Blanket-implemented; any `Clone + Send + Sync + Serialize +
/// DeserializeOwned + 'static` type qualifies.
pub trait Component: Any + Clone + Send + Sync + Serialize + DeserializeOwned {}

impl<T> Component for T where T: Any + Clone + Send + Sync + Serialize + DeserializeOwned {}

/// Strip module path and generic arguments from a full type path.
pub fn bare_type_name(path: &'static str) -> &'static str {
    let without_generics = match path.find('<') {
        Some(idx) => &path[..idx],
        None => path,
    };
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// The bare name of `T`.
pub fn component_name<T: ?Sized + 'static>() -> &'static str {
    bare_type_name(std::any::type_name::<T>())
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

type ToJsonFn = fn(&dyn Any) -> Result<Value, StoreError>;
type AssignJsonFn = fn(&mut dyn Any, Value) -> Result<(), StoreError>;
type DecodeFn = fn(Value) -> Result<Box<dyn AnyComponent>, StoreError>;

/// Type-erased description of one component type.
#[derive(Clone, Copy)]
pub struct ComponentInfo {
    name: &'static str,
    type_path: &'static str,
    type_id: TypeId,
    to_json: ToJsonFn,
    assign_json: AssignJsonFn,
    decode: DecodeFn,
}

impl ComponentInfo {
    /// Build the info for component type `T`.
    pub fn of<T: Component>() -> Self {
        Self {
            name: component_name::<T>(),
            type_path: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            to_json: to_json_erased::<T>,
            assign_json: assign_json_erased::<T>,
            decode: decode_erased::<T>,
        }
    }

    /// Bare component name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Full Rust type path, used in collision reports.
    pub fn type_path(&self) -> &'static str {
        self.type_path
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Serialize a value of this component type.
    pub fn to_json(&self, value: &dyn Any) -> Result<Value, StoreError> {
        (self.to_json)(value)
    }

    /// Decode `value` and overwrite `slot` with it. `slot` is untouched on error.
    pub fn assign_json(&self, slot: &mut dyn Any, value: Value) -> Result<(), StoreError> {
        (self.assign_json)(slot, value)
    }

    /// Decode `value` into a boxed component.
    pub fn decode(&self, value: Value) -> Result<Box<dyn AnyComponent>, StoreError> {
        (self.decode)(value)
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("name", &self.name)
            .field("type_path", &self.type_path)
            .finish()
    }
}

fn type_mismatch<T: Component>() -> StoreError {
    StoreError::InvalidArgument {
        reason: format!("value is not a `{}`", std::any::type_name::<T>()),
    }
}

fn decode_value<T: Component>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::ComponentDeserializationError {
        component: component_name::<T>().to_owned(),
        details: e.to_string(),
    })
}

fn to_json_erased<T: Component>(value: &dyn Any) -> Result<Value, StoreError> {
    let value = value.downcast_ref::<T>().ok_or_else(type_mismatch::<T>)?;
    serde_json::to_value(value).map_err(|e| StoreError::ComponentSerializationError {
        component: component_name::<T>().to_owned(),
        details: e.to_string(),
    })
}

fn assign_json_erased<T: Component>(slot: &mut dyn Any, value: Value) -> Result<(), StoreError> {
    let slot = slot.downcast_mut::<T>().ok_or_else(type_mismatch::<T>)?;
    *slot = decode_value::<T>(value)?;
    Ok(())
}

fn decode_erased<T: Component>(value: Value) -> Result<Box<dyn AnyComponent>, StoreError> {
    Ok(Box::new(decode_value::<T>(value)?))
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping bare component names to their [`ComponentInfo`].
///
/// Registering the same type twice is a no-op. Registering a different type
/// under an already-taken bare name fails with
/// [`StoreError::NameCollision`].
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_name: HashMap<&'static str, ComponentInfo>,
    by_type: HashMap<TypeId, &'static str>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register component type `T`.
    pub fn register<T: Component>(&mut self) -> Result<(), StoreError> {
        self.register_info(ComponentInfo::of::<T>())
    }

    /// Register an already-built [`ComponentInfo`].
    pub fn register_info(&mut self, info: ComponentInfo) -> Result<(), StoreError> {
        if let Some(existing) = self.by_name.get(info.name) {
            if existing.type_id == info.type_id {
                return Ok(());
            }
            return Err(StoreError::NameCollision {
                name: info.name.to_owned(),
                existing: existing.type_path.to_owned(),
                incoming: info.type_path.to_owned(),
            });
        }
        self.by_type.insert(info.type_id, info.name);
        self.by_name.insert(info.name, info);
        Ok(())
    }

    /// Look up a component by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<&ComponentInfo> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|name| self.by_name.get(name))
    }

    /// Look up a component by bare name.
    pub fn lookup_by_name(&self, name: &str) -> Option<&ComponentInfo> {
        self.by_name.get(name)
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
