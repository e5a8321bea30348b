//! # Scene-State Snapshot
//!
//! One frame's worth of simulation output, consumed by rendering.
//!
//! A [`RenderState`] is writable only while it is the triple buffer's WRITE
//! slot. Committing it freezes it until the slot is recycled; setters check
//! this in debug builds.
//!
//! The GPU-facing payloads (`CameraData`, lights, `EntityInstance`) are
//! `Pod`, so the backend can upload them with `bytemuck::cast_slice`
//! without any per-frame conversion.

use bytemuck::{Pod, Zeroable};

/// Deferred mutation captured from an asynchronous producer.
///
/// Applied to the next write snapshot just before the producer's direct writes.
pub type StateCommand = Box<dyn FnOnce(&mut RenderState) + Send + 'static>;

/// 4x4 identity matrix.
pub const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Opaque handle to a geometry buffer owned by the graphics backend.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct BufferHandle(pub u32);

impl BufferHandle {
    /// Handle that refers to no buffer.
    pub const NONE: Self = Self(u32::MAX);

    /// Returns true if this handle refers to no buffer.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}

/// Camera matrices for one frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraData {
    /// World-to-view matrix.
    pub view: [[f32; 4]; 4],
    /// View-to-clip matrix.
    pub projection: [[f32; 4]; 4],
    /// Camera world position (xyz), w unused.
    pub position: [f32; 4],
}

impl CameraData {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl Default for CameraData {
    fn default() -> Self {
        Self {
            view: IDENTITY,
            projection: IDENTITY,
            position: [0.0; 4],
        }
    }
}

/// The scene's single directional light (sun).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DirectionalLight {
    /// Direction the light travels (xyz), intensity in w.
    pub direction_intensity: [f32; 4],
    /// Linear RGB color, w unused.
    pub color: [f32; 4],
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction_intensity: [0.0, -1.0, 0.0, 1.0],
            color: [1.0, 1.0, 1.0, 0.0],
        }
    }
}

/// A point light.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PointLight {
    /// World position (xyz), range in w.
    pub position_range: [f32; 4],
    /// Linear RGB color (xyz), intensity in w.
    pub color_intensity: [f32; 4],
}

/// One drawable entity: transform, material and geometry reference.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct EntityInstance {
    /// Model-to-world matrix (column-major, translation in row 3).
    pub transform: [[f32; 4]; 4],
    /// Stable entity identifier.
    pub entity_id: u32,
    /// Material index.
    pub material: u32,
    /// Geometry buffer.
    pub geometry: BufferHandle,
    _pad: u32,
}

impl EntityInstance {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Creates an instance at `position` with an identity rotation.
    #[must_use]
    pub fn new(entity_id: u32, position: [f32; 3], material: u32, geometry: BufferHandle) -> Self {
        let mut transform = IDENTITY;
        transform[3] = [position[0], position[1], position[2], 1.0];
        Self {
            transform,
            entity_id,
            material,
            geometry,
            _pad: 0,
        }
    }

    /// World-space translation.
    #[inline]
    #[must_use]
    pub fn position(&self) -> [f32; 3] {
        let t = self.transform[3];
        [t[0], t[1], t[2]]
    }

    /// Moves the instance, keeping rotation/scale.
    #[inline]
    pub fn set_position(&mut self, position: [f32; 3]) {
        self.transform[3] = [position[0], position[1], position[2], 1.0];
    }
}

/// Per-frame scene snapshot.
#[derive(Debug, Clone, Default)]
pub struct RenderState {
    generation: u64,
    committed: bool,
    camera: CameraData,
    directional_light: DirectionalLight,
    point_lights: Vec<PointLight>,
    entities: Vec<EntityInstance>,
    /// Indices into `entities`, filled by the visibility query.
    visible: Vec<u32>,
}

impl RenderState {
    /// Creates an empty, never-written snapshot (generation 0).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulation cycle that produced this snapshot. 0 means never written.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true once the snapshot has been committed.
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    #[inline]
    fn debug_assert_writable(&self) {
        debug_assert!(
            !self.committed,
            "write to committed snapshot (generation {})",
            self.generation
        );
    }

    // =========================================================================
    // Lifecycle (driven by the triple buffer)
    // =========================================================================

    /// Brings a recycled slot up to date with the latest committed snapshot.
    ///
    /// Reuses this snapshot's allocations.
    pub(crate) fn sync_from(&mut self, latest: &Self) {
        self.camera = latest.camera;
        self.directional_light = latest.directional_light;
        self.point_lights.clone_from(&latest.point_lights);
        self.entities.clone_from(&latest.entities);
        self.visible.clone_from(&latest.visible);
    }

    /// Reopens the snapshot for writing as `generation`.
    pub(crate) fn begin_cycle(&mut self, generation: u64) {
        self.generation = generation;
        self.committed = false;
    }

    /// Freezes the snapshot.
    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    // =========================================================================
    // Camera and lights
    // =========================================================================

    /// Camera for this frame.
    #[inline]
    #[must_use]
    pub fn camera(&self) -> &CameraData {
        &self.camera
    }

    /// Sets the camera.
    pub fn set_camera(&mut self, camera: CameraData) {
        self.debug_assert_writable();
        self.camera = camera;
    }

    /// The directional light.
    #[inline]
    #[must_use]
    pub fn directional_light(&self) -> &DirectionalLight {
        &self.directional_light
    }

    /// Sets the directional light.
    pub fn set_directional_light(&mut self, light: DirectionalLight) {
        self.debug_assert_writable();
        self.directional_light = light;
    }

    /// Point lights.
    #[inline]
    #[must_use]
    pub fn point_lights(&self) -> &[PointLight] {
        &self.point_lights
    }

    /// Replaces all point lights.
    pub fn set_point_lights(&mut self, lights: &[PointLight]) {
        self.debug_assert_writable();
        self.point_lights.clear();
        self.point_lights.extend_from_slice(lights);
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// All entity instances.
    #[inline]
    #[must_use]
    pub fn entities(&self) -> &[EntityInstance] {
        &self.entities
    }

    /// Looks up an entity by id.
    #[must_use]
    pub fn entity(&self, entity_id: u32) -> Option<&EntityInstance> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    /// Mutable lookup by id.
    pub fn entity_mut(&mut self, entity_id: u32) -> Option<&mut EntityInstance> {
        self.debug_assert_writable();
        self.entities.iter_mut().find(|e| e.entity_id == entity_id)
    }

    /// Inserts an entity, or replaces the one with the same id.
    pub fn upsert_entity(&mut self, instance: EntityInstance) {
        self.debug_assert_writable();
        match self.entities.iter_mut().find(|e| e.entity_id == instance.entity_id) {
            Some(existing) => *existing = instance,
            None => self.entities.push(instance),
        }
    }

    /// Removes an entity. Returns false if it was not present.
    ///
    /// Clears the visibility list, which indexes into the entity array.
    pub fn remove_entity(&mut self, entity_id: u32) -> bool {
        self.debug_assert_writable();
        let Some(index) = self.entities.iter().position(|e| e.entity_id == entity_id) else {
            return false;
        };
        self.entities.swap_remove(index);
        self.visible.clear();
        true
    }

    /// Changes an entity's material. Returns false if it was not present.
    pub fn set_material(&mut self, entity_id: u32, material: u32) -> bool {
        match self.entity_mut(entity_id) {
            Some(entity) => {
                entity.material = material;
                true
            }
            None => false,
        }
    }

    /// Removes every entity.
    pub fn clear_entities(&mut self) {
        self.debug_assert_writable();
        self.entities.clear();
        self.visible.clear();
    }

    // =========================================================================
    // Visibility
    // =========================================================================

    /// Indices of visible entities.
    #[inline]
    #[must_use]
    pub fn visible(&self) -> &[u32] {
        &self.visible
    }

    /// Visible entity instances.
    pub fn visible_entities(&self) -> impl Iterator<Item = &EntityInstance> + '_ {
        self.visible
            .iter()
            .filter_map(|&i| self.entities.get(i as usize))
    }

    /// Splits the snapshot into the inputs and output of a visibility query.
    pub fn visibility_io(&mut self) -> (&CameraData, &[EntityInstance], &mut Vec<u32>) {
        self.debug_assert_writable();
        (&self.camera, &self.entities, &mut self.visible)
    }

    // =========================================================================
    // GPU upload views
    // =========================================================================

    /// Camera as raw bytes for a uniform buffer.
    #[must_use]
    pub fn camera_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(&self.camera)
    }

    /// Entity instances as raw bytes for an instance buffer.
    #[must_use]
    pub fn entity_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.entities)
    }

    /// Point lights as raw bytes for a storage buffer.
    #[must_use]
    pub fn point_light_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.point_lights)
    }
}
