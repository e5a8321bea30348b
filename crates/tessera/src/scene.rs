//! # Scene Collaborators
//!
//! The world model and the spatial index live outside the frame sync core.
//! The simulation thread drives both once per cycle:
//!
//! ```text
//! scene.advance(dt) → begin_write → scene.write_state → visibility.query → commit
//! ```

use tessera_core::{BufferHandle, CameraData, EntityInstance, RenderState};

/// The world model.
pub trait Scene: Send + 'static {
    /// Advances the simulation by `seconds`.
    fn advance(&mut self, seconds: f32);

    /// Writes this cycle's state into the write snapshot (direct writes).
    ///
    /// Deferred commands and singleton actions have already been applied.
    fn write_state(&mut self, state: &mut RenderState);
}

/// Spatial index answering "what can the camera see".
pub trait Visibility: Send + 'static {
    /// Fills `visible` (already cleared) with indices into `entities`.
    fn query(&mut self, camera: &CameraData, entities: &[EntityInstance], visible: &mut Vec<u32>);
}

/// Visibility that culls nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllVisible;

impl Visibility for AllVisible {
    fn query(&mut self, _camera: &CameraData, entities: &[EntityInstance], visible: &mut Vec<u32>) {
        visible.extend((0..entities.len()).filter_map(|i| u32::try_from(i).ok()));
    }
}

/// Distance from the camera to the entity it follows.
pub const FOLLOW_DISTANCE: f32 = 10.0;

/// One entity moving at constant velocity, with a camera following it.
///
/// Camera and entity are written in the same cycle, so any snapshot where
/// `camera.x != entity.x` was torn.
#[derive(Clone, Debug)]
pub struct MovingEntityScene {
    entity_id: u32,
    position: [f32; 3],
    velocity: [f32; 3],
    steps: u64,
}

impl MovingEntityScene {
    /// Creates the scene with entity `entity_id` at the origin.
    #[must_use]
    pub fn new(entity_id: u32, velocity: [f32; 3]) -> Self {
        Self {
            entity_id,
            position: [0.0; 3],
            velocity,
            steps: 0,
        }
    }

    /// Current entity position.
    #[must_use]
    pub fn position(&self) -> [f32; 3] {
        self.position
    }

    /// Simulation steps taken.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Camera position for an entity at `position`.
    #[must_use]
    pub fn camera_for(position: [f32; 3]) -> [f32; 4] {
        [position[0], position[1], position[2] + FOLLOW_DISTANCE, 1.0]
    }
}

impl Scene for MovingEntityScene {
    fn advance(&mut self, seconds: f32) {
        for (p, v) in self.position.iter_mut().zip(self.velocity) {
            *p += v * seconds;
        }
        self.steps += 1;
    }

    fn write_state(&mut self, state: &mut RenderState) {
        let position = self.position;
        match state.entity_mut(self.entity_id) {
            Some(entity) => entity.set_position(position),
            None => state.upsert_entity(EntityInstance::new(self.entity_id, position, 0, BufferHandle::NONE)),
        }

        let mut camera = *state.camera();
        camera.position = Self::camera_for(position);
        state.set_camera(camera);
    }
}
