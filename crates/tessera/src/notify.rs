//! # Scene Notifications
//!
//! Turns scene-level events into deferred snapshot mutations.
//!
//! ```text
//! any thread ──SceneEvent──> SceneNotifier ──add_command──────────────> next write
//!                                          └─request_singleton_action─┘
//! ```
//!
//! Nothing here touches a snapshot directly: every change lands at the start
//! of the next simulation cycle, in submission order.

use std::sync::Arc;

use tessera_core::{EntityInstance, RenderState, SyncResult, TripleBuffer};

/// Singleton action tag: rebuild the packed entity array.
pub const REBUFFER_ENTITIES: &str = "rebuffer-entities";

/// Scene changes reported by the world model or by tools.
#[derive(Clone, Debug, PartialEq)]
pub enum SceneEvent {
    /// An entity was added (or replaced).
    EntityAdded(EntityInstance),
    /// An entity was removed.
    EntityRemoved {
        /// Entity ID.
        entity_id: u32,
    },
    /// An entity's material changed.
    MaterialChanged {
        /// Entity ID.
        entity_id: u32,
        /// New material index.
        material: u32,
    },
    /// The scene finished loading; the entity array must be rebuilt.
    SceneInitialized,
}

/// Packs the entity array in entity ID order and drops the stale
/// visibility list (it indexes the old order).
fn rebuffer_entities(state: &mut RenderState) {
    let mut entities = state.entities().to_vec();
    entities.sort_unstable_by_key(|e| e.entity_id);
    state.clear_entities();
    for entity in entities {
        state.upsert_entity(entity);
    }
}

/// Routes [`SceneEvent`]s into a [`TripleBuffer`].
#[derive(Clone, Debug)]
pub struct SceneNotifier {
    buffer: Arc<TripleBuffer>,
}

impl SceneNotifier {
    /// Creates a notifier and registers its singleton actions on `buffer`.
    #[must_use]
    pub fn new(buffer: Arc<TripleBuffer>) -> Self {
        buffer.register_singleton_action(REBUFFER_ENTITIES, rebuffer_entities);
        Self { buffer }
    }

    /// Queues the mutation for `event`.
    ///
    /// # Errors
    ///
    /// Only if a singleton action is missing from the buffer's registry.
    pub fn notify(&self, event: SceneEvent) -> SyncResult<()> {
        tracing::debug!("scene event: {:?}", event);
        match event {
            SceneEvent::EntityAdded(instance) => {
                self.buffer.add_command(move |state| state.upsert_entity(instance));
            }
            SceneEvent::EntityRemoved { entity_id } => {
                self.buffer.add_command(move |state| {
                    state.remove_entity(entity_id);
                });
            }
            SceneEvent::MaterialChanged { entity_id, material } => {
                self.buffer.add_command(move |state| {
                    if !state.set_material(entity_id, material) {
                        tracing::debug!("material change for unknown entity {}", entity_id);
                    }
                });
            }
            SceneEvent::SceneInitialized => {
                self.buffer.request_singleton_action(REBUFFER_ENTITIES)?;
            }
        }
        Ok(())
    }
}
