//! Final pass from the stereo screen to the display
//!
//! The correction strategy is chosen once from the platform's capabilities.
//! Each frame the compositor then either hands the frame to the native
//! service, draws the stereo screen through the correction mesh, or runs the
//! full-screen undistortion shader.

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::context::{RenderContext, RenderTargetAllocator, StereoScreen};
use crate::distortion::RadialDistortion;
use crate::mesh::DistortionMesh;
use crate::projection::{Distortion, Eye, ProjectionCalculator};
use crate::viewport::{Rect, TanAngles};

/// How lens distortion gets corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrectionStrategy {
    /// The platform VR service corrects the frame.
    Native,
    /// Redraw through the distortion mesh.
    #[default]
    #[serde(rename = "mesh")]
    MeshBased,
    /// Redraw with the full-screen undistortion shader.
    #[serde(rename = "shader")]
    ShaderBased,
    /// No correction pass; eyes render straight to the display.
    None,
}

/// What the platform can do, gathered once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub native_distortion: bool,
    pub render_targets: bool,
    /// Reasons native correction is unavailable.
    pub diagnostics: Vec<String>,
}

impl Capabilities {
    pub fn probe(
        native: Option<&dyn NativeDistortion>,
        alloc: &dyn RenderTargetAllocator,
    ) -> Self {
        let mut diagnostics = Vec::new();
        let native_distortion = match native {
            Some(native) => native.supports_native_distortion_correction(&mut diagnostics),
            None => {
                diagnostics.push("no native VR service".to_string());
                false
            }
        };
        Self {
            native_distortion,
            render_targets: alloc.supports_render_targets(),
            diagnostics,
        }
    }
}

impl CorrectionStrategy {
    /// Best available strategy at or below `preferred`:
    /// native, then mesh or shader, then none.
    pub fn select(preferred: CorrectionStrategy, caps: &Capabilities) -> Self {
        let mut strategy = preferred;
        if strategy == CorrectionStrategy::Native && !caps.native_distortion {
            warn!(
                "Native distortion correction unavailable: {}",
                caps.diagnostics.join("; ")
            );
            strategy = CorrectionStrategy::MeshBased;
        }
        if matches!(strategy, CorrectionStrategy::MeshBased | CorrectionStrategy::ShaderBased)
            && !caps.render_targets
        {
            warn!("Render targets are not supported; distortion correction disabled");
            strategy = CorrectionStrategy::None;
        }
        info!("Distortion correction strategy: {:?}", strategy);
        strategy
    }
}

/// Lens correction provided by the platform VR service.
pub trait NativeDistortion {
    /// Appends human readable reasons when unsupported.
    fn supports_native_distortion_correction(&self, diagnostics: &mut Vec<String>) -> bool;

    fn set_distortion_correction_enabled(&mut self, enabled: bool);

    /// Presents the frame, correcting the stereo screen if one was used.
    fn post_render(&mut self, stereo_screen: Option<&StereoScreen>);
}

/// GPU side of the correction passes.
pub trait CompositorBackend {
    fn draw_mesh(&mut self, stereo_screen: &StereoScreen, mesh: &DistortionMesh);

    fn draw_undistortion(&mut self, stereo_screen: &StereoScreen, shader: &ShaderUndistortion);

    /// The stereo screen is fully redrawn next frame; its contents may go.
    fn discard(&mut self, stereo_screen: &StereoScreen);
}

/// Per-eye uniform block of the undistortion shader.
///
/// Frusta are `[left, top, right, bottom]` tangents, the viewport is
/// `[x, y, w, h]` on the display, and the forward coefficients are split
/// over two vectors with the eye index in the last slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UndistortionUniforms {
    pub lens: [f32; 4],
    pub no_lens: [f32; 4],
    pub viewport: [f32; 4],
    pub coefficients: [f32; 4],
    /// `k5, k6, eye index, unused`.
    pub coefficients_ext: [f32; 4],
}

fn tan_array(t: &TanAngles) -> [f32; 4] {
    [t.left, t.top, t.right, t.bottom]
}

fn rect_array(r: &Rect) -> [f32; 4] {
    [r.x, r.y, r.width, r.height]
}

/// Full-screen undistortion: the per-pixel form of the mesh's
/// distort-texture mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShaderUndistortion {
    pub eyes: [UndistortionUniforms; 2],
}

impl ShaderUndistortion {
    pub fn new(calc: &ProjectionCalculator) -> Self {
        let k = calc.profile().viewer.distortion;
        let k = k.coefficients();
        let eye = |e: Eye, index: f32| UndistortionUniforms {
            lens: tan_array(&calc.tan_angles(e, Distortion::Distorted)),
            no_lens: tan_array(&calc.tan_angles(e, Distortion::Undistorted)),
            viewport: rect_array(&calc.viewport(e, Distortion::Undistorted)),
            coefficients: [k[0], k[1], k[2], k[3]],
            coefficients_ext: [k[4], k[5], index, 0.0],
        };
        Self { eyes: [eye(Eye::Left, 0.0), eye(Eye::Right, 1.0)] }
    }

    /// Stereo screen coordinate (bottom-left origin) sampled for a display
    /// position in `[0, 1]^2`, or `None` where the display stays black.
    /// The WGSL fragment shader implements the same steps.
    pub fn sample_uv(&self, screen_pos: Vec2) -> Option<Vec2> {
        let e = if screen_pos.x < 0.5 { 0 } else { 1 };
        let u = &self.eyes[e];
        let [vx, vy, vw, vh] = u.viewport;
        let local = Vec2::new((screen_pos.x - vx) / vw, (screen_pos.y - vy) / vh);
        if !(0.0..=1.0).contains(&local.x) || !(0.0..=1.0).contains(&local.y) {
            return None;
        }
        let [nl, nt, nr, nb] = u.no_lens;
        let no_lens = TanAngles::new(nl, nt, nr, nb);
        let [ll, lt, lr, lb] = u.lens;
        let lens = TanAngles::new(ll, lt, lr, lb);
        let k = RadialDistortion::from_coefficients(&[
            u.coefficients[0],
            u.coefficients[1],
            u.coefficients[2],
            u.coefficients[3],
            u.coefficients_ext[0],
            u.coefficients_ext[1],
        ]);

        let pq = no_lens.lerp(local.x, local.y);
        let r = pq.length();
        let xy = if r > 0.0 { pq * (k.distort(r) / r) } else { pq };
        let st = lens.normalize(xy);
        if !(0.0..=1.0).contains(&st.x) || !(0.0..=1.0).contains(&st.y) {
            return None;
        }
        Some(Vec2::new((st.x + u.coefficients_ext[2]) / 2.0, st.y))
    }
}

/// Dispatches the final pass for the selected strategy.
pub struct Compositor {
    native: Option<Box<dyn NativeDistortion>>,
}

impl Compositor {
    /// Enables the native service's own correction only when it was chosen.
    pub fn new(strategy: CorrectionStrategy, mut native: Option<Box<dyn NativeDistortion>>) -> Self {
        if let Some(native) = native.as_mut() {
            native.set_distortion_correction_enabled(strategy == CorrectionStrategy::Native);
        }
        Self { native }
    }

    /// Informs the native service of a strategy change.
    pub fn set_strategy(&mut self, strategy: CorrectionStrategy) {
        if let Some(native) = self.native.as_mut() {
            native.set_distortion_correction_enabled(strategy == CorrectionStrategy::Native);
        }
    }

    pub fn post_render(
        &mut self,
        ctx: &mut RenderContext,
        stereo_screen: Option<StereoScreen>,
        backend: &mut dyn CompositorBackend,
    ) {
        match ctx.strategy() {
            CorrectionStrategy::Native => {
                if let Some(native) = self.native.as_mut() {
                    native.post_render(stereo_screen.as_ref());
                }
            }
            CorrectionStrategy::MeshBased => {
                if let Some(screen) = stereo_screen {
                    backend.draw_mesh(&screen, ctx.distortion_mesh());
                    backend.discard(&screen);
                }
            }
            CorrectionStrategy::ShaderBased => {
                if let Some(screen) = stereo_screen {
                    let shader = ShaderUndistortion::new(ctx.calculator());
                    backend.draw_undistortion(&screen, &shader);
                    backend.discard(&screen);
                }
            }
            CorrectionStrategy::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::mesh::{DistortionMeshBuilder, MeshMode};
    use crate::profile::DeviceProfile;

    struct NoTargets(bool);

    impl RenderTargetAllocator for NoTargets {
        fn supports_render_targets(&self) -> bool {
            self.0
        }

        fn allocate(&mut self, _: u32, _: u32) -> Result<StereoScreen> {
            unreachable!()
        }

        fn release(&mut self, _: StereoScreen) {}
    }

    struct Service {
        supported: bool,
    }

    impl NativeDistortion for Service {
        fn supports_native_distortion_correction(&self, diagnostics: &mut Vec<String>) -> bool {
            if !self.supported {
                diagnostics.push("old driver".into());
                diagnostics.push("no vsync".into());
            }
            self.supported
        }

        fn set_distortion_correction_enabled(&mut self, _: bool) {}

        fn post_render(&mut self, _: Option<&StereoScreen>) {}
    }

    #[test]
    fn native_preferred_and_available() {
        let caps = Capabilities::probe(Some(&Service { supported: true }), &NoTargets(true));
        assert_eq!(
            CorrectionStrategy::select(CorrectionStrategy::Native, &caps),
            CorrectionStrategy::Native
        );
    }

    #[test]
    fn native_falls_back_to_mesh_with_diagnostics() {
        let caps = Capabilities::probe(Some(&Service { supported: false }), &NoTargets(true));
        assert_eq!(caps.diagnostics, vec!["old driver", "no vsync"]);
        assert_eq!(
            CorrectionStrategy::select(CorrectionStrategy::Native, &caps),
            CorrectionStrategy::MeshBased
        );
    }

    #[test]
    fn no_render_targets_means_no_correction() {
        let caps = Capabilities::probe(None, &NoTargets(false));
        for preferred in [
            CorrectionStrategy::Native,
            CorrectionStrategy::MeshBased,
            CorrectionStrategy::ShaderBased,
        ] {
            assert_eq!(CorrectionStrategy::select(preferred, &caps), CorrectionStrategy::None);
        }
    }

    #[test]
    fn shader_matches_distort_texture_mesh() {
        let profile = DeviceProfile::default();
        let shader = ShaderUndistortion::new(&ProjectionCalculator::new(&profile));
        let mesh = DistortionMeshBuilder::new(20, 20, MeshMode::DistortTexture).build(&profile);
        let aspect = mesh.screen_aspect();
        let mut checked = 0;
        for v in mesh.vertices() {
            // Skip the vignette ring, where the mesh clamps instead of clipping.
            if v.color[0] == 0.0 {
                continue;
            }
            let pos = Vec2::new(v.position[0] / aspect + 0.5, v.position[1] + 0.5);
            let Some(uv) = shader.sample_uv(pos) else {
                continue;
            };
            assert!((uv.x - v.uv[0]).abs() < 1e-3, "{pos:?}");
            assert!((uv.y - v.uv[1]).abs() < 1e-3, "{pos:?}");
            checked += 1;
        }
        assert!(checked > 100, "only {checked} samples compared");
    }

    #[test]
    fn outside_visible_rect_is_black() {
        let profile = DeviceProfile::default();
        let shader = ShaderUndistortion::new(&ProjectionCalculator::new(&profile));
        assert_eq!(shader.sample_uv(Vec2::new(0.25, 0.001)), None);
        assert!(shader.sample_uv(Vec2::new(0.25, 0.5)).is_some());
    }
}
