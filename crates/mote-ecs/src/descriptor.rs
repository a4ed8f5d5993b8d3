//! Per-entity-type descriptors.
//!
//! A [`TypeDescriptor`] records which static components an entity type
//! carries and whether its instances have a dynamic table. Descriptors are
//! computed once per type, on first insertion or explicit registration, and
//! are then shared by `Arc` with every store entry of that type.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::component::{bare_type_name, ComponentInfo};
use crate::entity::Entity;
use crate::StoreError;

// ---------------------------------------------------------------------------
// TypeDescriptor
// ---------------------------------------------------------------------------

/// Static shape of one entity type.
#[derive(Debug)]
pub struct TypeDescriptor {
    name: &'static str,
    type_path: &'static str,
    type_id: TypeId,
    is_dynamic: bool,
    components: Vec<ComponentInfo>,
    component_types: HashSet<TypeId>,
}

impl TypeDescriptor {
    /// Describe entity type `E`.
    pub fn of<E: Entity>(is_dynamic: bool) -> Self {
        let components = E::component_infos();
        let component_types = components.iter().map(|c| c.type_id()).collect();
        let type_path = std::any::type_name::<E>();
        Self {
            name: bare_type_name(type_path),
            type_path,
            type_id: TypeId::of::<E>(),
            is_dynamic,
            components,
            component_types,
        }
    }

    /// Bare entity type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_path(&self) -> &'static str {
        self.type_path
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Whether instances carry a dynamic component table.
    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    /// Static components in declaration order.
    pub fn components(&self) -> &[ComponentInfo] {
        &self.components
    }

    /// O(1) static membership test.
    pub fn has_component(&self, type_id: TypeId) -> bool {
        self.component_types.contains(&type_id)
    }

    /// Static component with the given bare name.
    pub fn component_by_name(&self, name: &str) -> Option<&ComponentInfo> {
        self.components.iter().find(|c| c.name() == name)
    }
}

// ---------------------------------------------------------------------------
// DescriptorCache
// ---------------------------------------------------------------------------

/// Write-once cache of [`TypeDescriptor`]s keyed by bare entity type name.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    by_name: HashMap<&'static str, Arc<TypeDescriptor>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the descriptor for `E`, computing it on first use.
    ///
    /// Fails with [`StoreError::NameCollision`] if a different entity type
    /// with the same bare name was described earlier.
    pub fn describe<E: Entity>(&mut self, entity: &E) -> Result<Arc<TypeDescriptor>, StoreError> {
        self.describe_with::<E>(entity.dynamic_components().is_some())
    }

    pub(crate) fn describe_with<E: Entity>(
        &mut self,
        is_dynamic: bool,
    ) -> Result<Arc<TypeDescriptor>, StoreError> {
        let name = bare_type_name(std::any::type_name::<E>());
        if let Some(existing) = self.by_name.get(name) {
            if existing.type_id == TypeId::of::<E>() {
                return Ok(Arc::clone(existing));
            }
            return Err(StoreError::NameCollision {
                name: name.to_owned(),
                existing: existing.type_path.to_owned(),
                incoming: std::any::type_name::<E>().to_owned(),
            });
        }
        let descriptor = Arc::new(TypeDescriptor::of::<E>(is_dynamic));
        self.by_name.insert(name, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Cached descriptor by bare type name.
    pub fn get(&self, name: &str) -> Option<&Arc<TypeDescriptor>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Described type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
