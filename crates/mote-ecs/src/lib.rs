//! Mote ECS -- a lightweight in-process entity store with typed views.
//!
//! Entities are plain structs made of component fields. The store assigns
//! each one a stable [`EntityId`](entity::EntityId), records which components
//! its type carries, and answers queries by component set. Entities that
//! embed a [`BaseDynamicEntity`](dynamic::BaseDynamicEntity) can also attach
//! and detach components at runtime. Matched entities are read and mutated
//! through callback views.
//!
//! # Quick Start
//!
//! ```
//! use mote_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! #[derive(Default)]
//! struct Ship { base: BaseEntity, pos: Position, vel: Velocity }
//! mote_ecs::impl_entity!(Ship { base; pos: Position, vel: Velocity });
//!
//! let store = EntityStore::new();
//! let ship = store
//!     .spawn(Ship { vel: Velocity { dx: 1.0, dy: 0.0 }, ..Default::default() })
//!     .unwrap();
//!
//! for wrap in store.iterate_all::<(Position, Velocity)>() {
//!     wrap.view(|(pos, vel): &mut (Position, Velocity)| {
//!         pos.x += vel.dx;
//!         pos.y += vel.dy;
//!     })
//!     .unwrap();
//! }
//!
//! assert_eq!(ship.read().pos, Position { x: 1.0, y: 0.0 });
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod descriptor;
pub mod dynamic;
pub mod entity;
pub mod query;
pub mod snapshot;
pub mod store;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live entity has this id.
    #[error("entity {id} not found")]
    EntityNotFound { id: entity::EntityId },

    /// The entity does not carry the requested component.
    #[error("component '{component}' not found")]
    ComponentNotFound { component: String },

    /// The entity has no id and so cannot be in the store.
    #[error("entity has no identity")]
    NoIdentity,

    /// An entity with this id is already live.
    #[error("entity {id} already exists")]
    AlreadyExists { id: entity::EntityId },

    /// The callback or component set does not fit the entity.
    #[error("invalid callback: {reason}")]
    InvalidCallback { reason: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Two different types share a bare name.
    #[error("name '{name}' is already used by `{existing}`, cannot register `{incoming}`")]
    NameCollision {
        name: String,
        existing: String,
        incoming: String,
    },

    /// An import referenced an entity type that was never registered.
    #[error("entity type '{name}' not registered. Registered entity types: [{registered}]")]
    UnknownEntityType { name: String, registered: String },

    /// A component name that is not registered where it was used.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// Deserialization of a component value failed.
    #[error("failed to deserialize component '{component}': {details}")]
    ComponentDeserializationError { component: String, details: String },

    #[error("failed to serialize component '{component}': {details}")]
    ComponentSerializationError { component: String, details: String },

    /// A snapshot document could not be encoded or decoded.
    #[error("malformed snapshot: {details}")]
    SnapshotFormat { details: String },

    /// A snapshot's contents do not match its hash.
    #[error("snapshot hash mismatch: expected {expected}, computed {actual}")]
    SnapshotHashMismatch { expected: String, actual: String },

    /// A view callback returned an error.
    #[error("view callback failed: {0}")]
    Callback(query::BoxError),
}

impl StoreError {
    /// Whether this is a missing-entity or missing-component error.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::EntityNotFound { .. } | StoreError::ComponentNotFound { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{component_name, Component, ComponentInfo, ComponentRegistry};
    pub use crate::descriptor::{DescriptorCache, TypeDescriptor};
    pub use crate::dynamic::{AnyComponent, BaseDynamicEntity, DynamicComponents};
    pub use crate::entity::{shared, BaseEntity, Entity, EntityId, Shared, ENTITY_NONE};
    pub use crate::query::{ComponentSet, EntityWrap, QueryResult, ViewOutcome};
    pub use crate::snapshot::{EntityRecord, StoreSnapshot};
    pub use crate::store::{EntityStore, StoreConfig};
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
