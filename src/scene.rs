// =============================================================================
// SCENE - Cube geometry, animation and frame statistics
// =============================================================================

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::time::Duration;

/// Vertex layout shared with `shaders/cube.vert` (location 0 and 1).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 3]) -> Self {
        Self { position, color }
    }
}

pub const CUBE_VERTICES: [Vertex; 8] = [
    Vertex::new([-1.0, -1.0, -1.0], [0.0, 0.0, 0.0]),
    Vertex::new([-1.0, 1.0, -1.0], [0.0, 1.0, 0.0]),
    Vertex::new([1.0, 1.0, -1.0], [1.0, 1.0, 0.0]),
    Vertex::new([1.0, -1.0, -1.0], [1.0, 0.0, 0.0]),
    Vertex::new([-1.0, -1.0, 1.0], [0.0, 0.0, 1.0]),
    Vertex::new([-1.0, 1.0, 1.0], [0.0, 1.0, 1.0]),
    Vertex::new([1.0, 1.0, 1.0], [1.0, 1.0, 1.0]),
    Vertex::new([1.0, -1.0, 1.0], [1.0, 0.0, 1.0]),
];

/// Two triangles per face
pub const CUBE_INDICES: [u16; 36] = [
    0, 1, 2, 0, 2, 3, // front
    4, 6, 5, 4, 7, 6, // back
    4, 5, 1, 4, 1, 0, // left
    3, 2, 6, 3, 6, 7, // right
    1, 5, 6, 1, 6, 2, // top
    4, 0, 3, 4, 3, 7, // bottom
];

/// Static geometry uploaded once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SceneDescription<'a> {
    pub vertices: &'a [Vertex],
    pub indices: &'a [u16],
}

impl SceneDescription<'static> {
    pub fn cube() -> Self {
        Self {
            vertices: &CUBE_VERTICES,
            indices: &CUBE_INDICES,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Animation
// ─────────────────────────────────────────────────────────────────────────────

const DEGREES_PER_SECOND: f32 = 90.0;
/// One full turn; elapsed time wraps here so the angle keeps its precision
const PERIOD_SECONDS: f32 = 360.0 / DEGREES_PER_SECOND;
const FOV_Y_DEGREES: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 100.0;

/// Spins the cube about (0, 1, 1) and builds the matrix pushed to the vertex
/// shader.
#[derive(Debug, Default)]
pub struct Animation {
    elapsed: f32,
}

impl Animation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, delta: Duration) {
        self.elapsed = (self.elapsed + delta.as_secs_f32()) % PERIOD_SECONDS;
    }

    pub fn angle_degrees(&self) -> f32 {
        self.elapsed * DEGREES_PER_SECOND
    }

    pub fn model(&self) -> Mat4 {
        let axis = Vec3::new(0.0, 1.0, 1.0).normalize();
        Mat4::from_axis_angle(axis, self.angle_degrees().to_radians())
    }

    pub fn view() -> Mat4 {
        Mat4::look_at_lh(Vec3::new(0.0, 0.0, -10.0), Vec3::ZERO, Vec3::Y)
    }

    /// Left-handed perspective with 0..1 depth. Vulkan's clip space has +Y
    /// pointing down, so Y is flipped.
    pub fn projection(aspect_ratio: f32) -> Mat4 {
        let mut projection =
            Mat4::perspective_lh(FOV_Y_DEGREES.to_radians(), aspect_ratio, Z_NEAR, Z_FAR);
        projection.y_axis.y = -projection.y_axis.y;
        projection
    }

    pub fn model_view_projection(&self, aspect_ratio: f32) -> Mat4 {
        Self::projection(aspect_ratio) * Self::view() * self.model()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FPS
// ─────────────────────────────────────────────────────────────────────────────

/// Frames per second, reported once a second has elapsed.
#[derive(Debug, Default)]
pub struct FrameCounter {
    frames: u32,
    elapsed: Duration,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one frame. Returns the rate when a full second has gone by.
    pub fn tick(&mut self, delta: Duration) -> Option<f64> {
        self.frames += 1;
        self.elapsed += delta;
        if self.elapsed <= Duration::from_secs(1) {
            return None;
        }
        let fps = f64::from(self.frames) / self.elapsed.as_secs_f64();
        self.frames = 0;
        self.elapsed = Duration::ZERO;
        Some(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn vertex_layout_matches_the_shader() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&CUBE_VERTICES).len(), 8 * 24);
    }

    #[test]
    fn indices_stay_inside_the_vertex_array() {
        assert!(CUBE_INDICES
            .iter()
            .all(|&i| (i as usize) < CUBE_VERTICES.len()));
        assert_eq!(CUBE_INDICES.len() % 3, 0);
    }

    #[test]
    fn rotation_is_ninety_degrees_per_second() {
        let mut animation = Animation::new();
        animation.update(Duration::from_millis(500));
        assert!((animation.angle_degrees() - 45.0).abs() < 1e-3);

        animation.update(Duration::from_secs(4));
        assert!((animation.angle_degrees() - 45.0).abs() < 1e-2);
    }

    #[test]
    fn origin_lands_in_front_of_the_camera() {
        let mvp = Animation::new().model_view_projection(16.0 / 9.0);
        let clip = mvp * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let depth = clip.z / clip.w;
        assert!(clip.w > 0.0);
        assert!((0.0..=1.0).contains(&depth));
        assert!((clip.x / clip.w).abs() < 1e-5);
    }

    #[test]
    fn up_is_flipped_for_vulkan_clip_space() {
        let mvp = Animation::new().model_view_projection(1.0);
        let clip = mvp * Vec4::new(0.0, 1.0, 0.0, 1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn fps_is_reported_once_per_second() {
        let mut counter = FrameCounter::new();
        let frame = Duration::from_millis(10);
        let reports: Vec<f64> = (0..250).filter_map(|_| counter.tick(frame)).collect();

        assert_eq!(reports.len(), 2);
        assert!((reports[0] - 101.0 / 1.01).abs() < 1e-6);
    }
}
