//! Camera controller system
//!
//! The free-fly controller drives a [`Camera`] from an explicit
//! [`InputState`] snapshot, so frames can be replayed without a window.

use glam::{Vec2, Vec3};

use super::Camera;
use crate::config;

/// Input state sampled once per frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputState {
    /// W
    pub forward: bool,
    /// S
    pub backward: bool,
    /// A
    pub left: bool,
    /// D
    pub right: bool,
    /// Space
    pub up: bool,
    /// Z
    pub down: bool,

    /// Cursor offset from the viewport center, in pixels
    pub mouse_delta: Vec2,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-frame deltas (call after update)
    pub fn reset_deltas(&mut self) {
        self.mouse_delta = Vec2::ZERO;
    }

    /// Movement direction in camera space, before normalization
    fn movement(&self) -> Vec3 {
        let axis = |negative: bool, positive: bool| match (negative, positive) {
            (true, false) => -1.0,
            (false, true) => 1.0,
            _ => 0.0,
        };
        Vec3::new(
            axis(self.left, self.right),
            axis(self.down, self.up),
            axis(self.forward, self.backward),
        )
    }
}

/// Abstract camera controller trait
pub trait CameraController {
    /// Update the camera based on input and delta time
    fn update(&mut self, camera: &mut Camera, input: &InputState, dt: f32);

    /// Get the controller name for debugging
    fn name(&self) -> &'static str;
}

/// Free-fly camera controller
///
/// - W/S and A/D: move along the camera's forward and right axes
/// - Space/Z: move along world up
/// - Mouse: yaw and pitch from the cursor's offset to the viewport center
#[derive(Debug, Clone)]
pub struct FreeFlyController {
    /// Movement speed in units per second
    pub move_speed: f32,
    /// Degrees per pixel
    pub mouse_sensitivity: f32,
    /// Pitch is clamped to `[-pitch_limit, pitch_limit]` degrees
    pub pitch_limit: f32,
}

impl Default for FreeFlyController {
    fn default() -> Self {
        Self {
            move_speed: config::CAMERA_SPEED,
            mouse_sensitivity: config::CAMERA_SENSITIVITY,
            pitch_limit: config::CAMERA_PITCH_LIMIT,
        }
    }
}

impl FreeFlyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.move_speed = speed;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.mouse_sensitivity = sensitivity;
        self
    }
}

impl CameraController for FreeFlyController {
    fn update(&mut self, camera: &mut Camera, input: &InputState, dt: f32) {
        if input.mouse_delta != Vec2::ZERO {
            camera.yaw -= input.mouse_delta.x * self.mouse_sensitivity;
            camera.pitch -= input.mouse_delta.y * self.mouse_sensitivity;
        }
        camera.pitch = camera.pitch.clamp(-self.pitch_limit, self.pitch_limit);

        let movement = input.movement().normalize_or_zero();
        if movement == Vec3::ZERO {
            return;
        }
        let velocity = camera.right() * movement.x + Vec3::Y * movement.y + camera.forward() * movement.z;
        camera.position += velocity * self.move_speed * dt;
    }

    fn name(&self) -> &'static str {
        "FreeFly"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_no_input_leaves_camera_unchanged() {
        let mut camera = Camera::default();
        let before = camera.clone();
        FreeFlyController::new().update(&mut camera, &InputState::new(), 0.5);
        assert_eq!(camera, before);
    }

    // Default sensitivity turns 0.05 degrees per pixel, so 2400 pixels ask for 120 degrees
    #[rstest]
    #[case(-2400.0, 89.0)]
    #[case(2400.0, -89.0)]
    #[case(-200.0, 10.0)]
    fn test_pitch_is_clamped(#[case] delta_y: f32, #[case] expected: f32) {
        let mut camera = Camera::new(Vec3::ZERO, 0.0, 0.0);
        let input = InputState {
            mouse_delta: Vec2::new(0.0, delta_y),
            ..Default::default()
        };
        FreeFlyController::new().update(&mut camera, &input, 0.0);
        assert!((camera.pitch - expected).abs() < 1e-4, "pitch {}", camera.pitch);
    }

    #[test]
    fn test_mouse_turns_against_delta() {
        let mut camera = Camera::new(Vec3::ZERO, 0.0, 0.0);
        let input = InputState {
            mouse_delta: Vec2::new(20.0, -40.0),
            ..Default::default()
        };
        FreeFlyController::new().update(&mut camera, &input, 0.0);
        assert!((camera.yaw + 1.0).abs() < 1e-5);
        assert!((camera.pitch - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_w_moves_against_forward() {
        let mut camera = Camera::new(Vec3::ZERO, 0.0, 0.0);
        let input = InputState {
            forward: true,
            ..Default::default()
        };
        FreeFlyController::new().update(&mut camera, &input, 0.5);
        assert!((camera.position - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn test_diagonal_movement_is_normalized() {
        let mut camera = Camera::new(Vec3::ZERO, 0.0, 0.0);
        let input = InputState {
            right: true,
            up: true,
            ..Default::default()
        };
        FreeFlyController::new().update(&mut camera, &input, 1.0);
        assert!((camera.position.length() - config::CAMERA_SPEED).abs() < 1e-5);
        assert!(camera.position.x > 0.0 && camera.position.y > 0.0);
    }

    #[test]
    fn test_opposite_keys_cancel() {
        let mut camera = Camera::default();
        let before = camera.position;
        let input = InputState {
            left: true,
            right: true,
            ..Default::default()
        };
        FreeFlyController::new().update(&mut camera, &input, 1.0);
        assert_eq!(camera.position, before);
    }
}
