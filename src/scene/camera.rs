//! Camera system

use crate::pipeline::constants::{CameraConstants, PixelShaderConstants};
use glam::{EulerRot, Mat3, Mat4, Vec3};

/// Camera projection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Projection {
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }
}

/// First-person camera oriented by yaw and pitch, in degrees
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(2.68, 0.48, -1.13),
            yaw: 119.85,
            pitch: -14.50,
            projection: Projection::default(),
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32) -> Self {
        Self {
            position,
            yaw,
            pitch,
            projection: Projection::default(),
        }
    }

    /// Pitch about X, then yaw about Y
    pub fn orientation(&self) -> Mat3 {
        Mat3::from_euler(EulerRot::YXZ, self.yaw.to_radians(), self.pitch.to_radians(), 0.0)
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation() * Vec3::Z
    }

    pub fn right(&self) -> Vec3 {
        self.orientation() * Vec3::X
    }

    /// Get the view matrix
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_lh(self.position, self.forward(), Vec3::Y)
    }

    /// Get the projection matrix
    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    pub fn constants(&self) -> CameraConstants {
        CameraConstants {
            view: self.view_matrix(),
            projection: self.projection_matrix(),
        }
    }

    pub fn pixel_constants(&self, tone_mapping_mode: u32) -> PixelShaderConstants {
        PixelShaderConstants {
            eye_position: self.position.to_array(),
            tone_mapping_mode,
        }
    }

    /// Update aspect ratio for perspective projection
    pub fn set_aspect(&mut self, width: f32, height: f32) {
        self.projection.set_aspect(width / height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_angles_look_down_z() {
        let camera = Camera::new(Vec3::ZERO, 0.0, 0.0);
        assert!((camera.forward() - Vec3::Z).length() < 1e-6);
        assert!((camera.right() - Vec3::X).length() < 1e-6);
    }

    #[test]
    fn test_yaw_turns_about_y() {
        let camera = Camera::new(Vec3::ZERO, 90.0, 0.0);
        assert!((camera.forward() - Vec3::X).length() < 1e-6);
        assert!((camera.right() - Vec3::NEG_Z).length() < 1e-6);
    }

    #[test]
    fn test_view_maps_forward_to_z() {
        let camera = Camera::default();
        let view = camera.view_matrix();
        let ahead = view.transform_point3(camera.position + camera.forward());
        assert!((ahead - Vec3::Z).length() < 1e-5, "{ahead}");
        assert_eq!(camera.pixel_constants(0).eye_position, camera.position.to_array());
    }
}
