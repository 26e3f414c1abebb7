use crate::math::{Mat4, Vec3};
use crate::worker::Bounds;

const WORLD_UP: Vec3 = Vec3::new(0.0, 1.0, 0.0);

/// Orbit camera around `target`; yaw and pitch in radians.
#[derive(Debug, Clone)]
pub struct Camera {
    pub target: Vec3,
    pub distance: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub fov: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn new(target: Vec3, distance: f32) -> Self {
        Self {
            target,
            distance,
            yaw: 0.0,
            pitch: 0.0,
            fov: std::f32::consts::PI / 3.0,
            near: 0.1,
            far: 1000.0,
        }
    }

    /// Unit vector from the target towards the eye.
    fn offset_dir(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.cos() * self.pitch.cos(),
        )
    }

    pub fn position(&self) -> Vec3 {
        self.target + self.offset_dir() * self.distance
    }

    pub fn forward(&self) -> Vec3 {
        -self.offset_dir()
    }

    /// World-to-camera transform; the dataset has no model transform of its
    /// own, so this is also its model-view.
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to(self.position(), self.forward(), WORLD_UP)
    }

    pub fn projection(&self, width: f32, height: f32) -> Mat4 {
        Mat4::perspective(self.fov, width / height.max(1.0), self.near, self.far)
    }

    /// Centres on `bounds` and backs off far enough to see all of it.
    pub fn frame_bounds(&mut self, bounds: &Bounds) {
        let [cx, cy, cz] = bounds.center();
        self.target = Vec3::new(cx, cy, cz);
        let extent = Vec3::new(
            bounds.max[0] - bounds.min[0],
            bounds.max[1] - bounds.min[1],
            bounds.max[2] - bounds.min[2],
        );
        let radius = (extent.length() * 0.5).max(1e-3);
        self.distance = radius / (self.fov * 0.5).tan().max(1e-3) + radius;
        self.far = self.far.max(self.distance + radius * 2.0);
    }
}

pub fn reset(camera: &mut Camera) {
    *camera = Camera::new(Vec3::ZERO, 5.0);
}

pub fn orbit(camera: &mut Camera, delta_yaw: f32, delta_pitch: f32) {
    camera.yaw += delta_yaw;
    camera.pitch = (camera.pitch + delta_pitch).clamp(-1.5, 1.5);
}

pub fn zoom(camera: &mut Camera, factor: f32) {
    camera.distance = (camera.distance * factor).clamp(camera.near * 2.0, camera.far * 0.5);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_orbit_looks_down_negative_z() {
        let mut camera = Camera::new(Vec3::ZERO, 1.0);
        reset(&mut camera);
        let eye = camera.position();
        assert!((eye.z - 5.0).abs() < 1e-5);
        let view = camera.view_matrix();
        // The origin sits 5 units in front of the camera.
        let p = view.transform_point4(Vec3::ZERO);
        assert!((p[2] + 5.0).abs() < 1e-5);
    }

    #[test]
    fn orbit_keeps_distance_and_clamps_pitch() {
        let mut camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), 4.0);
        orbit(&mut camera, 1.0, 10.0);
        assert_eq!(camera.pitch, 1.5);
        let d = (camera.position() - camera.target).length();
        assert!((d - 4.0).abs() < 1e-4);
    }

    #[test]
    fn framing_fits_bounds_in_view() {
        let mut camera = Camera::new(Vec3::ZERO, 1.0);
        camera.frame_bounds(&Bounds {
            min: [-2.0, -2.0, -2.0],
            max: [2.0, 2.0, 2.0],
        });
        assert_eq!(camera.target, Vec3::ZERO);
        let planes = camera
            .projection(100.0, 100.0)
            .mul_mat(&camera.view_matrix())
            .frustum_planes();
        for corner in [[-2.0, -2.0, -2.0], [2.0, 2.0, 2.0], [2.0, -2.0, 2.0]] {
            assert!(crate::sort::inside_frustum(&planes, &corner));
        }
    }
}
