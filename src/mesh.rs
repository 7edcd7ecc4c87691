//! Distortion correction mesh
//!
//! The mesh redraws the stereo screen onto the display so that, seen
//! through the lenses, the image looks undistorted. Each eye gets a regular
//! `width x height` grid. Vertex positions live on a plane one unit in front
//! of an orthographic camera that spans the screen height: y in
//! `[-0.5, 0.5]`, x scaled by the physical screen aspect.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::distortion::DistortionModel;
use crate::profile::DeviceProfile;
use crate::viewport::{Rect, TanAngles};

/// Which side of the correction is warped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeshMode {
    /// Regular texture grid, vertices moved by the inverse distortion.
    #[default]
    DistortVertices,
    /// Regular vertex grid, texture coordinates moved by the distortion.
    DistortTexture,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

impl MeshVertex {
    const ATTRIBS: [wgpu::VertexAttribute; 3] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x2, 2 => Float32x4];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBS,
        }
    }
}

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

/// Two-eye correction mesh. Left eye vertices and indices come first.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionMesh {
    id: u64,
    vertices: Vec<MeshVertex>,
    indices: Vec<u32>,
    width: usize,
    height: usize,
    mode: MeshMode,
    screen_aspect: f32,
}

impl DistortionMesh {
    /// Unique per build; a GPU copy is stale when the id differs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn vertices(&self) -> &[MeshVertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Index range of one eye's submesh (0 = left, 1 = right).
    pub fn eye_indices(&self, eye: usize) -> &[u32] {
        let per_eye = self.indices.len() / 2;
        &self.indices[eye * per_eye..(eye + 1) * per_eye]
    }

    pub fn grid_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn mode(&self) -> MeshMode {
        self.mode
    }

    /// Physical screen width over height; the x extent of the mesh plane
    /// is `±0.5 * screen_aspect`.
    pub fn screen_aspect(&self) -> f32 {
        self.screen_aspect
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Builds [`DistortionMesh`]es for a grid size and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistortionMeshBuilder {
    width: usize,
    height: usize,
    mode: MeshMode,
}

impl Default for DistortionMeshBuilder {
    fn default() -> Self {
        Self { width: 40, height: 40, mode: MeshMode::DistortVertices }
    }
}

impl DistortionMeshBuilder {
    /// Grids smaller than 2x2 are widened to 2x2.
    pub fn new(width: usize, height: usize, mode: MeshMode) -> Self {
        Self { width: width.max(2), height: height.max(2), mode }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn mode(&self) -> MeshMode {
        self.mode
    }

    pub fn build(&self, profile: &DeviceProfile) -> DistortionMesh {
        let (positions, uvs) = self.compute_points(profile);
        let colors = self.compute_colors(&uvs);
        let vertices = positions
            .iter()
            .zip(&uvs)
            .zip(&colors)
            .map(|((p, uv), color)| MeshVertex {
                position: [p.x, p.y, 1.0],
                uv: [uv.x, uv.y],
                color: *color,
            })
            .collect();
        let indices = self.compute_indices();
        debug!(
            "Built {}x{} distortion mesh ({:?}, {} triangles)",
            self.width,
            self.height,
            self.mode,
            indices.len() / 3
        );
        DistortionMesh {
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
            vertices,
            indices,
            width: self.width,
            height: self.height,
            mode: self.mode,
            screen_aspect: profile.screen_aspect(),
        }
    }

    fn compute_points(&self, profile: &DeviceProfile) -> (Vec<Vec2>, Vec<Vec2>) {
        let model = profile.distortion_model();
        let mut lens = profile.left_eye_visible_tan_angles();
        let mut no_lens = profile.left_eye_no_lens_tan_angles();
        let mut viewport = profile.left_eye_visible_screen_rect(&no_lens);
        let aspect = profile.screen_aspect();

        let count = 2 * self.width * self.height;
        let mut positions = Vec::with_capacity(count);
        let mut uvs = Vec::with_capacity(count);
        for e in 0..2 {
            for j in 0..self.height {
                for i in 0..self.width {
                    let u = i as f32 / (self.width - 1) as f32;
                    let v = j as f32 / (self.height - 1) as f32;
                    let (pos, st) = match self.mode {
                        MeshMode::DistortVertices => {
                            distort_vertex(&model, &lens, &no_lens, u, v)
                        }
                        MeshMode::DistortTexture => {
                            distort_texcoord(&model, &lens, &no_lens, u, v)
                        }
                    };
                    positions.push(to_screen_plane(pos, &viewport, aspect));
                    uvs.push(Vec2::new((st.x + e as f32) / 2.0, st.y));
                }
            }
            lens = lens.mirrored();
            no_lens = no_lens.mirrored();
            viewport.x = 1.0 - viewport.x_max();
        }
        (positions, uvs)
    }

    fn compute_colors(&self, uvs: &[Vec2]) -> Vec<[f32; 4]> {
        let (w, h) = (self.width, self.height);
        let mut colors = Vec::with_capacity(uvs.len());
        for uv in uvs {
            let vidx = colors.len() % (w * h);
            let (i, j) = (vidx % w, vidx / w);
            let border = match self.mode {
                MeshMode::DistortVertices => i == 0 || j == 0 || i == w - 1 || j == h - 1,
                MeshMode::DistortTexture => {
                    let s = (uv.x * 2.0 - 1.0).abs();
                    s <= 0.0 || uv.y <= 0.0 || s >= 1.0 || uv.y >= 1.0
                }
            };
            colors.push(if border { BLACK } else { WHITE });
        }
        colors
    }

    /// Two triangles per cell, diagonals pointing at the grid center.
    fn compute_indices(&self) -> Vec<u32> {
        let (w, h) = (self.width, self.height);
        let half_width = w / 2;
        let half_height = h / 2;
        let mut indices = Vec::with_capacity(2 * (w - 1) * (h - 1) * 6);
        let mut vidx = 0u32;
        let wu = w as u32;
        for _ in 0..2 {
            for j in 0..h {
                for i in 0..w {
                    if i > 0 && j > 0 {
                        if (i <= half_width) == (j <= half_height) {
                            indices.extend_from_slice(&[
                                vidx,
                                vidx - wu,
                                vidx - wu - 1,
                                vidx - wu - 1,
                                vidx - 1,
                                vidx,
                            ]);
                        } else {
                            indices.extend_from_slice(&[
                                vidx - 1,
                                vidx,
                                vidx - wu,
                                vidx - wu,
                                vidx - wu - 1,
                                vidx - 1,
                            ]);
                        }
                    }
                    vidx += 1;
                }
            }
        }
        indices
    }
}

/// `r / d`, treating the lens axis itself as unscaled.
fn radial_scale(from: f32, to: f32) -> f32 {
    if from > 0.0 {
        to / from
    } else {
        1.0
    }
}

/// Texture at the regular grid point; vertex pulled back through the lens.
fn distort_vertex(
    model: &DistortionModel,
    lens: &TanAngles,
    no_lens: &TanAngles,
    u: f32,
    v: f32,
) -> (Vec2, Vec2) {
    let xy = lens.lerp(u, v);
    let d = xy.length();
    let r = model.distort_inverse(d);
    let pq = xy * radial_scale(d, r);
    (no_lens.normalize(pq), Vec2::new(u, v))
}

/// Vertex at the regular grid point; texture pushed out through the lens.
fn distort_texcoord(
    model: &DistortionModel,
    lens: &TanAngles,
    no_lens: &TanAngles,
    u: f32,
    v: f32,
) -> (Vec2, Vec2) {
    let pq = no_lens.lerp(u, v);
    let r = pq.length();
    let d = model.distort(r);
    let xy = pq * radial_scale(r, d);
    let st = lens.normalize(xy).clamp(Vec2::ZERO, Vec2::ONE);
    (Vec2::new(u, v), st)
}

/// Viewport-normalized point to the mesh plane.
fn to_screen_plane(p: Vec2, viewport: &Rect, aspect: f32) -> Vec2 {
    Vec2::new(
        (viewport.x + p.x * viewport.width - 0.5) * aspect,
        viewport.y + p.y * viewport.height - 0.5,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(mode: MeshMode) -> DistortionMesh {
        DistortionMeshBuilder::new(40, 40, mode).build(&DeviceProfile::default())
    }

    #[test]
    fn grid_counts() {
        let mesh = build(MeshMode::DistortVertices);
        assert_eq!(mesh.vertices().len(), 3200);
        assert_eq!(mesh.indices().len(), 18252);
        assert_eq!(mesh.triangle_count(), 2 * 39 * 39 * 2);
    }

    #[test]
    fn vignette_marks_grid_border() {
        let mesh = build(MeshMode::DistortVertices);
        for (n, vertex) in mesh.vertices().iter().enumerate() {
            let (i, j) = (n % 40, (n / 40) % 40);
            let border = i == 0 || j == 0 || i == 39 || j == 39;
            let expected = if border { BLACK } else { WHITE };
            assert_eq!(vertex.color, expected, "vertex {n}");
        }
    }

    #[test]
    fn each_eye_indexes_its_own_vertices() {
        let mesh = build(MeshMode::DistortVertices);
        assert!(mesh.eye_indices(0).iter().all(|&i| i < 1600));
        assert!(mesh.eye_indices(1).iter().all(|&i| (1600..3200).contains(&i)));
    }

    #[test]
    fn texture_coords_split_atlas() {
        let mesh = build(MeshMode::DistortVertices);
        let (left, right) = mesh.vertices().split_at(1600);
        assert!(left.iter().all(|v| (0.0..=0.5).contains(&v.uv[0])));
        assert!(right.iter().all(|v| (0.5..=1.0).contains(&v.uv[0])));
    }

    #[test]
    fn right_eye_mirrors_left() {
        let mesh = build(MeshMode::DistortVertices);
        let v = mesh.vertices();
        for j in 0..40 {
            for i in 0..40 {
                let l = v[j * 40 + (39 - i)].position;
                let r = v[1600 + j * 40 + i].position;
                assert!((l[0] + r[0]).abs() < 1e-4, "({i}, {j})");
                assert!((l[1] - r[1]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn vertices_stay_on_screen_plane() {
        let mesh = build(MeshMode::DistortVertices);
        let half_width = mesh.screen_aspect() / 2.0 + 1e-4;
        for v in mesh.vertices() {
            assert!(v.position[0].abs() <= half_width);
            assert!(v.position[1].abs() <= 0.5 + 1e-4);
            assert_eq!(v.position[2], 1.0);
        }
    }

    #[test]
    fn distort_texture_clamps_uvs() {
        let mesh = build(MeshMode::DistortTexture);
        assert_eq!(mesh.vertices().len(), 3200);
        for v in mesh.vertices() {
            assert!((0.0..=1.0).contains(&v.uv[0]));
            assert!((0.0..=1.0).contains(&v.uv[1]));
        }
        // Grid corners of the left eye sample the outer atlas edge.
        assert_eq!(mesh.vertices()[0].color, BLACK);
    }

    #[test]
    fn diagonals_point_at_center() {
        let mesh = DistortionMeshBuilder::new(4, 4, MeshMode::DistortVertices)
            .build(&DeviceProfile::default());
        // First cell (i=1, j=1) is in the lower-left quadrant.
        assert_eq!(&mesh.indices()[..6], &[5, 1, 0, 0, 4, 5]);
        // Cell (i=3, j=1) is lower-right and flips its diagonal.
        assert_eq!(&mesh.indices()[12..18], &[6, 7, 3, 3, 2, 6]);
    }

    #[test]
    fn degenerate_profile_does_not_panic() {
        let mut profile = DeviceProfile::default();
        profile.viewer.max_fov = crate::profile::MaxFov::uniform(0.0);
        let mesh = DistortionMeshBuilder::new(8, 8, MeshMode::DistortVertices).build(&profile);
        assert_eq!(mesh.vertices().len(), 128);
    }

    #[test]
    fn tiny_grid_is_widened() {
        let builder = DistortionMeshBuilder::new(0, 1, MeshMode::DistortTexture);
        assert_eq!((builder.width(), builder.height()), (2, 2));
        let mesh = builder.build(&DeviceProfile::default());
        assert_eq!(mesh.vertices().len(), 8);
        assert_eq!(mesh.indices().len(), 12);
    }
}
