//! Head and eye poses, and the per-frame pose source abstraction
//!
//! Poses use the engine convention: left-handed, +Y up, +Z forward. Some
//! trackers report right-handed matrices; [`MutablePose3D::set_right_handed`]
//! converts them by flipping the Z axis on both sides.

use std::ops::Deref;

use glam::{Mat3, Mat4, Quat, Vec3};

use crate::profile::DeviceProfile;
use crate::projection::Eye;

/// Converts between left- and right-handed coordinates.
pub const FLIP_Z: Mat4 = Mat4::from_cols(
    glam::Vec4::X,
    glam::Vec4::Y,
    glam::Vec4::NEG_Z,
    glam::Vec4::W,
);

/// Rotation whose forward (+Z) axis points along `forward`, with `up`
/// as close to +Y as possible. A zero forward gives the identity.
pub fn look_rotation(forward: Vec3, up: Vec3) -> Quat {
    let z = forward.normalize_or_zero();
    if z == Vec3::ZERO {
        return Quat::IDENTITY;
    }
    let x = up.cross(z).normalize_or_zero();
    if x == Vec3::ZERO {
        return Quat::from_rotation_arc(Vec3::Z, z);
    }
    let y = z.cross(x);
    Quat::from_mat3(&Mat3::from_cols(x, y, z)).normalize()
}

/// Position and orientation, with the matching rigid transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose3D {
    position: Vec3,
    orientation: Quat,
    matrix: Mat4,
}

impl Default for Pose3D {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose3D {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
        matrix: Mat4::IDENTITY,
    };

    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
            matrix: Mat4::from_rotation_translation(orientation, position),
        }
    }

    /// Extracts position and orientation from a rigid transform.
    pub fn from_matrix(matrix: &Mat4) -> Self {
        let position = matrix.col(3).truncate();
        let orientation = look_rotation(matrix.col(2).truncate(), matrix.col(1).truncate());
        Self { position, orientation, matrix: *matrix }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn matrix(&self) -> &Mat4 {
        &self.matrix
    }

    /// The same transform in right-handed coordinates.
    pub fn right_handed_matrix(&self) -> Mat4 {
        FLIP_Z * self.matrix * FLIP_Z
    }
}

/// A pose the pose source can overwrite in place.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MutablePose3D(Pose3D);

impl MutablePose3D {
    pub fn new() -> Self {
        Self(Pose3D::IDENTITY)
    }

    pub fn set(&mut self, position: Vec3, orientation: Quat) {
        self.0 = Pose3D::new(position, orientation);
    }

    pub fn set_matrix(&mut self, matrix: &Mat4) {
        self.0 = Pose3D::from_matrix(matrix);
    }

    /// Absorbs a right-handed transform.
    pub fn set_right_handed(&mut self, matrix: &Mat4) {
        self.set_matrix(&(FLIP_Z * *matrix * FLIP_Z));
    }

    pub fn pose(&self) -> Pose3D {
        self.0
    }
}

impl Deref for MutablePose3D {
    type Target = Pose3D;

    fn deref(&self) -> &Pose3D {
        &self.0
    }
}

/// Edge-triggered events for one frame.
///
/// Returned from [`PoseSource::update_state`]; each flag is set in exactly
/// the frame the event arrived and is gone from the next frame's value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameEvents {
    /// The viewer's trigger (magnet or touch) was pulled.
    pub triggered: bool,
    /// The viewer was tilted sideways.
    pub tilted: bool,
    /// A new device profile was paired.
    pub profile_changed: bool,
    pub back_button_pressed: bool,
}

impl FrameEvents {
    pub fn any(&self) -> bool {
        self.triggered || self.tilted || self.profile_changed || self.back_button_pressed
    }
}

/// Supplier of head and eye poses.
///
/// `update_state` samples the tracker at most once per frame number;
/// repeated calls for the same frame return the cached events and leave
/// the poses untouched.
pub trait PoseSource {
    fn update_state(&mut self, frame: u64) -> FrameEvents;

    /// Head pose in the tracking space, as of the last sampled frame.
    fn head_pose(&self) -> Pose3D;

    /// Eye pose relative to the head.
    fn eye_pose(&self, eye: Eye) -> Pose3D;

    /// Profile reported by the device, if the source knows one.
    fn current_profile(&self) -> Option<DeviceProfile> {
        None
    }

    /// Resets the head yaw to face forward.
    fn recenter(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn from_matrix_recovers_position_and_rotation() {
        let rot = Quat::from_rotation_y(0.7) * Quat::from_rotation_x(-0.2);
        let pos = Vec3::new(0.1, 1.6, -2.0);
        let pose = Pose3D::from_matrix(&Mat4::from_rotation_translation(rot, pos));
        assert!(close(pose.position(), pos));
        assert!(pose.orientation().dot(rot).abs() > 0.99999);
    }

    #[test]
    fn right_handed_round_trip() {
        let rot = Quat::from_rotation_y(0.4);
        let pose = Pose3D::new(Vec3::new(0.0, 0.0, 1.0), rot);
        let mut m = MutablePose3D::new();
        m.set_right_handed(&pose.right_handed_matrix());
        assert!(close(m.position(), pose.position()));
        assert!(m.orientation().dot(rot).abs() > 0.99999);
    }

    #[test]
    fn right_handed_flips_depth() {
        let pose = Pose3D::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY);
        let rh = pose.right_handed_matrix();
        assert_eq!(rh.col(3).truncate(), Vec3::new(1.0, 2.0, -3.0));
    }

    #[test]
    fn zero_forward_is_identity() {
        assert_eq!(look_rotation(Vec3::ZERO, Vec3::Y), Quat::IDENTITY);
    }

    #[test]
    fn default_events_are_quiet() {
        assert!(!FrameEvents::default().any());
        let e = FrameEvents { tilted: true, ..Default::default() };
        assert!(e.any());
    }
}
