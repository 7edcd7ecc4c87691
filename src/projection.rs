//! Per-eye off-axis projections and viewports
//!
//! Projections are built in GL clip-space convention (depth in [-1, 1]) with
//! `near = 1, far = 1000`; callers rewrite the clip planes for the real
//! camera with [`fix_clip_planes`]. The wgpu backend converts the final
//! matrix with [`gl_to_wgpu_depth`].

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::profile::DeviceProfile;
use crate::viewport::{Rect, TanAngles};

/// Near plane the calculator's matrices are normalized to.
pub const DEFAULT_NEAR: f32 = 1.0;
/// Far plane the calculator's matrices are normalized to.
pub const DEFAULT_FAR: f32 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Eye {
    Left,
    Right,
    Center,
}

impl Eye {
    /// Left and right, in render order.
    pub const STEREO: [Eye; 2] = [Eye::Left, Eye::Right];

    /// Index into per-eye arrays: 0 for left, 1 for right and center.
    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right | Eye::Center => 1,
        }
    }
}

/// Whether the frame will be seen through the lens distortion or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distortion {
    /// Rendered into the stereo screen and seen through the lenses.
    Distorted,
    /// As if there were no lenses: the visible part of the physical screen.
    Undistorted,
}

/// Row/column access to a column-major [`Mat4`].
pub trait MatrixExt {
    fn at(&self, row: usize, col: usize) -> f32;
    fn set(&mut self, row: usize, col: usize, value: f32);
}

impl MatrixExt for Mat4 {
    fn at(&self, row: usize, col: usize) -> f32 {
        self.col(col)[row]
    }

    fn set(&mut self, row: usize, col: usize, value: f32) {
        self.col_mut(col)[row] = value;
    }
}

/// Off-axis perspective projection from tangent-angle extents.
pub fn make_projection(l: f32, t: f32, r: f32, b: f32, near: f32, far: f32) -> Mat4 {
    let mut m = Mat4::ZERO;
    m.set(0, 0, 2.0 * near / (r - l));
    m.set(1, 1, 2.0 * near / (t - b));
    m.set(0, 2, (r + l) / (r - l));
    m.set(1, 2, (t + b) / (t - b));
    m.set(2, 2, (near + far) / (near - far));
    m.set(2, 3, 2.0 * near * far / (near - far));
    m.set(3, 2, -1.0);
    m
}

/// Rewrites the depth terms of a projection for new clip planes.
pub fn fix_clip_planes(proj: &mut Mat4, near: f32, far: f32) {
    proj.set(2, 2, (near + far) / (near - far));
    proj.set(2, 3, 2.0 * near * far / (near - far));
}

/// Adapts a calculator projection to a camera drawing into `rect`, then
/// applies the camera's clip planes.
pub fn fix_projection(proj: &mut Mat4, rect: &Rect, near: f32, far: f32) {
    let x = proj.at(0, 0) * rect.height / rect.width / 2.0;
    proj.set(0, 0, x);
    fix_clip_planes(proj, near, far);
}

/// Maps an eye camera rect expressed in stereo-screen halves onto the
/// visible viewport on the physical display, for rendering straight to
/// the screen.
pub fn fix_viewport(rect: &Rect, eye: Eye, viewport: &Rect) -> Rect {
    let mut out = *rect;
    if eye == Eye::Right {
        out.x -= 0.5;
    }
    out.width *= 2.0 * viewport.width;
    out.x = viewport.x + 2.0 * out.x * viewport.width;
    out.height *= viewport.height;
    out.y = viewport.y + out.y * viewport.height;
    out
}

/// Fits a rect laid out for the profile's screen aspect into a preview
/// window of a different aspect, letterboxing as needed.
pub fn fix_preview_viewport(rect: &Rect, profile_aspect: f32, window_aspect: f32) -> Rect {
    let mut out = *rect;
    let cmp = profile_aspect / window_aspect;
    if cmp < 1.0 {
        out.width *= cmp;
        out.x *= cmp;
        out.x += (1.0 - cmp) / 2.0;
    } else {
        out.height /= cmp;
        out.y /= cmp;
    }
    out
}

/// Converts a GL-style projection (clip z in [-w, w]) into wgpu's [0, w].
pub fn gl_to_wgpu_depth(proj: Mat4) -> Mat4 {
    let correction = Mat4::from_cols(
        Vec4::X,
        Vec4::Y,
        Vec4::new(0.0, 0.0, 0.5, 0.0),
        Vec4::new(0.0, 0.0, 0.5, 1.0),
    );
    correction * proj
}

/// Projections and viewports for one device profile.
///
/// Only the left eye is derived from the profile; the right eye is its
/// mirror image. Rebuild the calculator when the profile changes.
#[derive(Debug, Clone)]
pub struct ProjectionCalculator {
    profile: DeviceProfile,
    lens: TanAngles,
    no_lens: TanAngles,
    visible_rect: Rect,
}

impl ProjectionCalculator {
    pub fn new(profile: &DeviceProfile) -> Self {
        let lens = profile.left_eye_visible_tan_angles();
        let no_lens = profile.left_eye_no_lens_tan_angles();
        let visible_rect = profile.left_eye_visible_screen_rect(&no_lens);
        Self { profile: *profile, lens, no_lens, visible_rect }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Left eye frustum as seen through the lens.
    pub fn lens_tan_angles(&self) -> &TanAngles {
        &self.lens
    }

    /// Left eye frustum without the lens.
    pub fn no_lens_tan_angles(&self) -> &TanAngles {
        &self.no_lens
    }

    /// Tangent extents for an eye in a mode.
    pub fn tan_angles(&self, eye: Eye, mode: Distortion) -> TanAngles {
        let left = match mode {
            Distortion::Distorted => self.lens,
            Distortion::Undistorted => self.no_lens,
        };
        match eye {
            Eye::Left => left,
            Eye::Right => left.mirrored(),
            Eye::Center => {
                let half = left.left.abs().max(left.right.abs());
                TanAngles::new(-half, left.top, half, left.bottom)
            }
        }
    }

    /// Projection normalized to `near = 1, far = 1000`.
    pub fn projection(&self, eye: Eye, mode: Distortion) -> Mat4 {
        let left = match eye {
            Eye::Center => self.tan_angles(Eye::Center, mode),
            _ => self.tan_angles(Eye::Left, mode),
        };
        let mut proj = make_projection(
            left.left,
            left.top,
            left.right,
            left.bottom,
            DEFAULT_NEAR,
            DEFAULT_FAR,
        );
        if eye == Eye::Right {
            let skew = proj.at(0, 2);
            proj.set(0, 2, -skew);
        }
        proj
    }

    /// Normalized screen rect the eye renders into.
    pub fn viewport(&self, eye: Eye, mode: Distortion) -> Rect {
        match (mode, eye) {
            (_, Eye::Center) => Rect::FULL,
            (Distortion::Distorted, Eye::Left) => Rect::new(0.0, 0.0, 0.5, 1.0),
            (Distortion::Distorted, Eye::Right) => Rect::new(0.5, 0.0, 0.5, 1.0),
            (Distortion::Undistorted, Eye::Left) => self.visible_rect,
            (Distortion::Undistorted, Eye::Right) => {
                let mut rect = self.visible_rect;
                rect.x = 1.0 - self.visible_rect.x_max();
                rect
            }
        }
    }

    /// View-space translation of an eye from the head center.
    pub fn eye_offset(&self, eye: Eye) -> Vec3 {
        let half = self.profile.viewer.lenses.separation / 2.0;
        match eye {
            Eye::Left => Vec3::new(-half, 0.0, 0.0),
            Eye::Right => Vec3::new(half, 0.0, 0.0),
            Eye::Center => Vec3::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> ProjectionCalculator {
        ProjectionCalculator::new(&DeviceProfile::default())
    }

    #[test]
    fn left_and_right_are_mirror_images() {
        let c = calc();
        for mode in [Distortion::Distorted, Distortion::Undistorted] {
            let l = c.projection(Eye::Left, mode);
            let r = c.projection(Eye::Right, mode);
            assert_eq!(l.at(0, 0), r.at(0, 0));
            assert_eq!(l.at(1, 1), r.at(1, 1));
            assert_eq!(l.at(0, 2), -r.at(0, 2));
            assert_eq!(l.at(1, 2), r.at(1, 2));
        }
    }

    #[test]
    fn distorted_viewports_split_screen_at_half() {
        let c = calc();
        let l = c.viewport(Eye::Left, Distortion::Distorted);
        let r = c.viewport(Eye::Right, Distortion::Distorted);
        assert_eq!(l.x, 0.0);
        assert_eq!(l.x_max(), 0.5);
        assert_eq!(r.x, 0.5);
        assert_eq!(r.x_max(), 1.0);
        assert_eq!((l.y, l.height, r.y, r.height), (0.0, 1.0, 0.0, 1.0));
    }

    #[test]
    fn undistorted_right_viewport_mirrors_left() {
        let c = calc();
        let l = c.viewport(Eye::Left, Distortion::Undistorted);
        let r = c.viewport(Eye::Right, Distortion::Undistorted);
        assert!((r.x - (1.0 - l.x_max())).abs() < 1e-6);
        assert_eq!(r.width, l.width);
        assert_eq!(r.y, l.y);
    }

    #[test]
    fn unclipped_vertical_fov_matches_max_fov() {
        let proj = calc().projection(Eye::Left, Distortion::Distorted);
        let expected = 1.0 / (40.0f32 * std::f32::consts::PI / 180.0).tan();
        assert!((proj.at(1, 1) - expected).abs() < 1e-4);
        assert_eq!(proj.at(3, 2), -1.0);
        assert_eq!(proj.at(3, 3), 0.0);
    }

    #[test]
    fn center_eye_is_horizontally_symmetric() {
        let proj = calc().projection(Eye::Center, Distortion::Distorted);
        assert!(proj.at(0, 2).abs() < 1e-6);
        assert_eq!(calc().eye_offset(Eye::Center), Vec3::ZERO);
    }

    #[test]
    fn clip_planes_are_rewritten() {
        let mut proj = calc().projection(Eye::Left, Distortion::Distorted);
        fix_clip_planes(&mut proj, 0.3, 100.0);
        // A point on the near plane lands at clip depth -1.
        let p = proj * Vec4::new(0.0, 0.0, -0.3, 1.0);
        assert!((p.z / p.w + 1.0).abs() < 1e-4);
        let p = proj * Vec4::new(0.0, 0.0, -100.0, 1.0);
        assert!((p.z / p.w - 1.0).abs() < 1e-4);
    }

    #[test]
    fn wgpu_depth_range_is_zero_to_one() {
        let mut proj = calc().projection(Eye::Left, Distortion::Distorted);
        fix_clip_planes(&mut proj, 0.5, 50.0);
        let proj = gl_to_wgpu_depth(proj);
        let near = proj * Vec4::new(0.0, 0.0, -0.5, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, -50.0, 1.0);
        assert!((near.z / near.w).abs() < 1e-4);
        assert!((far.z / far.w - 1.0).abs() < 1e-4);
    }

    #[test]
    fn eye_offsets_follow_lens_separation() {
        let c = calc();
        assert_eq!(c.eye_offset(Eye::Left).x, -0.03);
        assert_eq!(c.eye_offset(Eye::Right).x, 0.03);
    }

    #[test]
    fn direct_render_viewport_lands_in_visible_rect() {
        let visible = Rect::new(0.05, 0.1, 0.4, 0.8);
        let right_visible = Rect::new(0.55, 0.1, 0.4, 0.8);
        let left = fix_viewport(&Rect::new(0.0, 0.0, 0.5, 1.0), Eye::Left, &visible);
        assert_eq!(left, visible);
        let right = fix_viewport(&Rect::new(0.5, 0.0, 0.5, 1.0), Eye::Right, &right_visible);
        assert!((right.x - 0.55).abs() < 1e-6);
        assert!((right.width - 0.4).abs() < 1e-6);
    }

    #[test]
    fn preview_fit_letterboxes_wide_window() {
        let rect = fix_preview_viewport(&Rect::FULL, 16.0 / 9.0, 2.0);
        assert!(rect.width < 1.0);
        assert!((rect.x * 2.0 + rect.width - 1.0).abs() < 1e-6);
        let rect = fix_preview_viewport(&Rect::FULL, 2.0, 16.0 / 9.0);
        assert_eq!(rect.width, 1.0);
        assert!(rect.height < 1.0);
    }
}
