//! Normalized screen rectangles and tangent-angle frustum extents

use glam::Vec2;

/// Normalized screen-space rectangle, origin at the bottom left.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    /// The whole screen.
    pub const FULL: Self = Self { x: 0.0, y: 0.0, width: 1.0, height: 1.0 };

    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn x_max(&self) -> f32 {
        self.x + self.width
    }

    pub fn y_max(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Moves the rect so its center lands on `center`, keeping its size.
    pub fn set_center(&mut self, center: Vec2) {
        self.x = center.x - self.width / 2.0;
        self.y = center.y - self.height / 2.0;
    }

    /// Converts to a pixel rect `(x, y, w, h)` on a target of the given size.
    ///
    /// The y axis is flipped so the result has a top-left origin, which is
    /// what wgpu viewports expect.
    pub fn to_pixels(&self, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let w = self.width * width as f32;
        let h = self.height * height as f32;
        let x = self.x * width as f32;
        let y = height as f32 - h - self.y * height as f32;
        (x, y, w, h)
    }
}

/// Frustum extents as tangents of the half-angles from the view axis.
///
/// `left` and `bottom` are normally negative.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TanAngles {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl TanAngles {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Same extents from degrees away from the axis on each side.
    pub fn from_degrees(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left: -left.to_radians().tan(),
            top: top.to_radians().tan(),
            right: right.to_radians().tan(),
            bottom: -bottom.to_radians().tan(),
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.top - self.bottom
    }

    /// Horizontal mirror image, i.e. the other eye's frustum.
    pub fn mirrored(&self) -> Self {
        Self {
            left: -self.right,
            top: self.top,
            right: -self.left,
            bottom: self.bottom,
        }
    }

    /// Keeps, on every side, whichever extent is closer to the axis.
    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            left: self.left.max(other.left),
            top: self.top.min(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Point inside the frustum at normalized coordinates `(u, v)` in `[0, 1]`.
    pub fn lerp(&self, u: f32, v: f32) -> Vec2 {
        Vec2::new(
            self.left + (self.right - self.left) * u,
            self.bottom + (self.top - self.bottom) * v,
        )
    }

    /// Inverse of [`TanAngles::lerp`].
    pub fn normalize(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            (p.x - self.left) / (self.right - self.left),
            (p.y - self.bottom) / (self.top - self.bottom),
        )
    }

    /// Radius of the farthest frustum corner.
    pub fn max_radius(&self) -> f32 {
        let x = self.left.abs().max(self.right.abs());
        let y = self.top.abs().max(self.bottom.abs());
        (x * x + y * y).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrored_twice_is_identity() {
        let t = TanAngles::new(-0.7, 0.8, 0.84, -0.8);
        assert_eq!(t.mirrored().mirrored(), t);
        assert_eq!(t.mirrored().width(), t.width());
    }

    #[test]
    fn lerp_and_normalize_agree() {
        let t = TanAngles::new(-0.6, 0.7, 0.9, -0.5);
        let p = t.lerp(0.25, 0.75);
        let uv = t.normalize(p);
        assert!((uv.x - 0.25).abs() < 1e-6);
        assert!((uv.y - 0.75).abs() < 1e-6);
    }

    #[test]
    fn pixel_rect_flips_y() {
        let r = Rect::new(0.5, 0.0, 0.5, 0.25);
        assert_eq!(r.to_pixels(200, 100), (100.0, 75.0, 100.0, 25.0));
    }
}
