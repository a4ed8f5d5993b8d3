//! Entity identifiers, identity allocation, and the [`Entity`] trait.
//!
//! An [`EntityId`] is a plain 64-bit handle. The value `0` is reserved as
//! [`EntityId::NONE`] and never designates a live entity. The
//! [`IdAllocator`] hands out strictly increasing ids starting at 1 and never
//! reuses a value, so a removed-then-re-added entity always gets a fresh id.
//!
//! Entity types describe their static components at compile time through
//! [`Entity::component_infos`] and `TypeId`-keyed accessors. The
//! [`impl_entity!`](crate::impl_entity) macro writes those impls for the
//! common "identity field + component fields" struct layout.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::component::ComponentInfo;
use crate::dynamic::DynamicComponents;
use crate::StoreError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A unique entity identifier. `0` means "no entity".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

/// Alias for [`EntityId::NONE`].
pub const ENTITY_NONE: EntityId = EntityId::NONE;

impl EntityId {
    /// The reserved "no entity" id.
    pub const NONE: EntityId = EntityId(0);

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// `true` for [`EntityId::NONE`].
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// `true` for any assigned id.
    #[inline]
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "EntityId(none)")
        } else {
            write!(f, "EntityId({})", self.0)
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// IdAllocator
// ---------------------------------------------------------------------------

/// Hands out monotonically increasing [`EntityId`]s.
///
/// Ids are never recycled. Ids that enter the store from outside (preset by
/// the caller or restored from a snapshot) are reported through
/// [`observe`](Self::observe) so that later allocations cannot collide with
/// them.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    /// The id the next call to `allocate` returns.
    next: u64,
}

impl IdAllocator {
    /// Create an allocator whose first id is 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate a fresh id.
    ///
    /// Fails with [`StoreError::InvalidArgument`] once the id space is
    /// exhausted; the allocator is left unchanged.
    pub fn allocate(&mut self) -> Result<EntityId, StoreError> {
        let next = successor(self.next)?;
        let id = EntityId(self.next);
        self.next = next;
        Ok(id)
    }

    /// Make sure future allocations are greater than `id`.
    ///
    /// Fails without moving the allocator if no id greater than `id` exists.
    pub fn observe(&mut self, id: EntityId) -> Result<(), StoreError> {
        if id.0 >= self.next {
            self.next = successor(id.0)?;
        }
        Ok(())
    }

    /// An allocator whose next id is one past `id`.
    pub fn after(id: EntityId) -> Result<Self, StoreError> {
        Ok(Self {
            next: successor(id.0)?,
        })
    }

    /// The id the next allocation will return, without consuming it.
    pub fn peek_next(&self) -> EntityId {
        EntityId(self.next)
    }

    /// Rebuild an allocator from a captured `next` value. `0` is clamped to 1.
    pub fn restore(next: u64) -> Self {
        Self { next: next.max(1) }
    }
}

fn successor(raw: u64) -> Result<u64, StoreError> {
    raw.checked_add(1).ok_or_else(|| StoreError::InvalidArgument {
        reason: format!("entity id space exhausted after {raw}"),
    })
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Entity trait
// ---------------------------------------------------------------------------

/// A value with an identity and a fixed set of static components.
///
/// Implementations are normally generated by [`impl_entity!`](crate::impl_entity).
/// A hand-written impl must keep `component_infos`, `component` and
/// `component_mut` in agreement: every type listed by `component_infos`
/// must be reachable through both accessors.
pub trait Entity: Any + Send + Sync {
    /// The current id, [`EntityId::NONE`] when not stored.
    fn entity_id(&self) -> EntityId;

    /// Overwrite the id. Called by the store on add and remove.
    fn set_entity_id(&mut self, id: EntityId);

    /// Static components declared by this type, in declaration order.
    fn component_infos() -> Vec<ComponentInfo>
    where
        Self: Sized;

    /// Borrow the static component of type `type_id`, if declared.
    fn component(&self, type_id: TypeId) -> Option<&dyn Any>;

    /// Mutably borrow the static component of type `type_id`, if declared.
    fn component_mut(&mut self, type_id: TypeId) -> Option<&mut dyn Any>;

    /// The runtime component table, for entities that carry one.
    fn dynamic_components(&self) -> Option<&DynamicComponents> {
        None
    }

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An entity shared between the caller and the store.
pub type Shared<E> = Arc<RwLock<E>>;

/// Type-erased form of [`Shared`] held by the store.
pub type EntityCell = Arc<RwLock<dyn Entity>>;

/// Wrap an entity so it can be handed to [`EntityStore::add`](crate::store::EntityStore::add).
pub fn shared<E: Entity>(entity: E) -> Shared<E> {
    Arc::new(RwLock::new(entity))
}

// ---------------------------------------------------------------------------
// BaseEntity
// ---------------------------------------------------------------------------

/// Identity state to embed in a static entity struct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseEntity {
    id: EntityId,
}

impl BaseEntity {
    /// The stored id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Overwrite the stored id.
    pub fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }
}

// ---------------------------------------------------------------------------
// impl_entity!
// ---------------------------------------------------------------------------

/// Implement [`Entity`](crate::entity::Entity) for a struct that embeds an
/// identity field plus one field per static component.
///
/// The identity field is a [`BaseEntity`](crate::entity::BaseEntity) for
/// static entities, or a [`BaseDynamicEntity`](crate::dynamic::BaseDynamicEntity)
/// when the `dynamic` prefix is used.
///
/// ```
/// use mote_ecs::prelude::*;
///
/// #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// struct Pos { x: i32, y: i32 }
///
/// #[derive(Default)]
/// struct Unit { base: BaseEntity, pos: Pos }
/// mote_ecs::impl_entity!(Unit { base; pos: Pos });
///
/// #[derive(Default)]
/// struct Ghost { base: BaseDynamicEntity, pos: Pos }
/// mote_ecs::impl_entity!(dynamic Ghost { base; pos: Pos });
///
/// assert_eq!(Unit::component_infos()[0].name(), "Pos");
/// ```
///
/// If two fields share a component type, lookups resolve to the first one.
#[macro_export]
macro_rules! impl_entity {
    (@impl $ty:ty, $base:ident, [$($field:ident : $comp:ty),*], { $($extra:tt)* }) => {
        impl $crate::entity::Entity for $ty {
            fn entity_id(&self) -> $crate::entity::EntityId {
                self.$base.id()
            }

            fn set_entity_id(&mut self, id: $crate::entity::EntityId) {
                self.$base.set_id(id)
            }

            fn component_infos() -> ::std::vec::Vec<$crate::component::ComponentInfo> {
                ::std::vec![$($crate::component::ComponentInfo::of::<$comp>()),*]
            }

            fn component(
                &self,
                type_id: ::std::any::TypeId,
            ) -> ::core::option::Option<&dyn ::std::any::Any> {
                $(
                    if type_id == ::std::any::TypeId::of::<$comp>() {
                        return ::core::option::Option::Some(&self.$field as &dyn ::std::any::Any);
                    }
                )*
                let _ = type_id;
                ::core::option::Option::None
            }

            fn component_mut(
                &mut self,
                type_id: ::std::any::TypeId,
            ) -> ::core::option::Option<&mut dyn ::std::any::Any> {
                $(
                    if type_id == ::std::any::TypeId::of::<$comp>() {
                        return ::core::option::Option::Some(
                            &mut self.$field as &mut dyn ::std::any::Any,
                        );
                    }
                )*
                let _ = type_id;
                ::core::option::Option::None
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            $($extra)*
        }
    };
    (dynamic $ty:ty { $base:ident ; $($field:ident : $comp:ty),* $(,)? }) => {
        $crate::impl_entity!(@impl $ty, $base, [$($field : $comp),*], {
            fn dynamic_components(
                &self,
            ) -> ::core::option::Option<&$crate::dynamic::DynamicComponents> {
                ::core::option::Option::Some(self.$base.components())
            }
        });
    };
    ($ty:ty { $base:ident ; $($field:ident : $comp:ty),* $(,)? }) => {
        $crate::impl_entity!(@impl $ty, $base, [$($field : $comp),*], {});
    };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
