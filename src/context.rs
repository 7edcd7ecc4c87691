//! Render context: the one active profile and everything derived from it
//!
//! Holds the device profile, the projection calculator, the cached
//! distortion mesh and the stereo screen handle. Components borrow the
//! context for the frame instead of reaching for global state.

use log::{error, info, warn};

use crate::compositor::CorrectionStrategy;
use crate::config::StereoConfig;
use crate::error::{Result, StereoError};
use crate::mesh::{DistortionMesh, DistortionMeshBuilder};
use crate::profile::DeviceProfile;
use crate::projection::ProjectionCalculator;

/// Smallest and largest allowed stereo screen scale.
pub const STEREO_SCREEN_SCALE_RANGE: (f32, f32) = (0.1, 10.0);

/// Opaque handle to a render target owned by an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetId(pub u64);

/// Shared render target holding both eyes side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StereoScreen {
    pub id: RenderTargetId,
    pub width: u32,
    pub height: u32,
}

/// Platform side of render target management.
pub trait RenderTargetAllocator {
    /// Whether offscreen render targets exist at all on this platform.
    fn supports_render_targets(&self) -> bool;

    fn allocate(&mut self, width: u32, height: u32) -> Result<StereoScreen>;

    fn release(&mut self, screen: StereoScreen);
}

/// Stereo screen size: the display scaled and rounded to whole pixels.
pub fn stereo_screen_size(display: (u32, u32), scale: f32) -> (u32, u32) {
    let w = (display.0 as f32 * scale).round().max(1.0) as u32;
    let h = (display.1 as f32 * scale).round().max(1.0) as u32;
    (w, h)
}

pub struct RenderContext {
    profile: DeviceProfile,
    calculator: ProjectionCalculator,
    mesh_builder: DistortionMeshBuilder,
    mesh: Option<DistortionMesh>,
    stereo_screen: Option<StereoScreen>,
    stereo_screen_scale: f32,
    strategy: CorrectionStrategy,
    vr_mode: bool,
    display_size: (u32, u32),
    profile_changed: bool,
    frame: u64,
    warned_no_targets: bool,
}

impl RenderContext {
    pub fn new(profile: DeviceProfile, strategy: CorrectionStrategy) -> Self {
        Self {
            calculator: ProjectionCalculator::new(&profile),
            profile,
            mesh_builder: DistortionMeshBuilder::default(),
            mesh: None,
            stereo_screen: None,
            stereo_screen_scale: 1.0,
            strategy,
            vr_mode: true,
            display_size: (1, 1),
            profile_changed: false,
            frame: 0,
            warned_no_targets: false,
        }
    }

    /// Context for a loaded configuration and an already selected strategy.
    pub fn from_config(config: &StereoConfig, strategy: CorrectionStrategy) -> Self {
        let mut ctx = Self::new(config.device_profile(), strategy);
        ctx.mesh_builder =
            DistortionMeshBuilder::new(config.mesh_width, config.mesh_height, config.mesh_mode);
        ctx.set_stereo_screen_scale(config.stereo_screen_scale);
        ctx.vr_mode = config.vr_mode;
        ctx
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn calculator(&self) -> &ProjectionCalculator {
        &self.calculator
    }

    /// Replaces the active profile. Derived projections are recomputed and
    /// the mesh is rebuilt on next use.
    pub fn set_profile(&mut self, profile: DeviceProfile) {
        if profile == self.profile {
            return;
        }
        info!(
            "Device profile changed: screen {:.3}x{:.3} m, lens separation {:.3} m",
            profile.screen.width, profile.screen.height, profile.viewer.lenses.separation
        );
        self.profile = profile;
        self.calculator = ProjectionCalculator::new(&profile);
        self.mesh = None;
        self.profile_changed = true;
    }

    /// True during the frame in which the profile was replaced.
    pub fn profile_changed(&self) -> bool {
        self.profile_changed
    }

    pub fn strategy(&self) -> CorrectionStrategy {
        self.strategy
    }

    /// Switches correction strategy; the stereo screen is recreated lazily.
    pub fn set_strategy(&mut self, strategy: CorrectionStrategy, alloc: &mut dyn RenderTargetAllocator) {
        if strategy != self.strategy {
            info!("Distortion correction: {:?} -> {:?}", self.strategy, strategy);
            self.strategy = strategy;
            self.release_stereo_screen(alloc);
        }
    }

    pub fn vr_mode(&self) -> bool {
        self.vr_mode
    }

    pub fn set_vr_mode(&mut self, enabled: bool) {
        self.vr_mode = enabled;
    }

    pub fn display_size(&self) -> (u32, u32) {
        self.display_size
    }

    pub fn set_display_size(&mut self, width: u32, height: u32) {
        self.display_size = (width.max(1), height.max(1));
    }

    /// Display aspect ratio (width over height).
    pub fn display_aspect(&self) -> f32 {
        self.display_size.0 as f32 / self.display_size.1 as f32
    }

    pub fn stereo_screen_scale(&self) -> f32 {
        self.stereo_screen_scale
    }

    pub fn set_stereo_screen_scale(&mut self, scale: f32) {
        let (lo, hi) = STEREO_SCREEN_SCALE_RANGE;
        self.stereo_screen_scale = scale.clamp(lo, hi);
    }

    pub fn mesh_builder(&self) -> &DistortionMeshBuilder {
        &self.mesh_builder
    }

    /// Changes mesh resolution or mode; the mesh is rebuilt on next use.
    pub fn set_mesh_builder(&mut self, builder: DistortionMeshBuilder) {
        if builder != self.mesh_builder {
            self.mesh_builder = builder;
            self.mesh = None;
        }
    }

    /// The correction mesh for the active profile, built on first use.
    pub fn distortion_mesh(&mut self) -> &DistortionMesh {
        let builder = self.mesh_builder;
        let profile = self.profile;
        self.mesh.get_or_insert_with(|| {
            info!("Building distortion mesh {}x{}", builder.width(), builder.height());
            builder.build(&profile)
        })
    }

    /// Whether this frame needs the shared stereo target at all.
    pub fn needs_stereo_screen(&self) -> bool {
        self.vr_mode && self.strategy != CorrectionStrategy::None
    }

    /// Currently allocated stereo screen, without allocating.
    pub fn current_stereo_screen(&self) -> Option<StereoScreen> {
        self.stereo_screen
    }

    /// Returns the stereo screen for this frame, allocating or resizing it
    /// as needed.
    ///
    /// `Ok(None)` means no stereo screen is wanted or the platform cannot
    /// provide one; eyes then render straight to the display. Mesh and
    /// shader correction need a stereo screen, so without render targets
    /// the strategy drops to [`CorrectionStrategy::None`] and eyes carry
    /// vertex-warp data instead. An error means allocation failed and
    /// stereo should be skipped this frame.
    pub fn stereo_screen(&mut self, alloc: &mut dyn RenderTargetAllocator) -> Result<Option<StereoScreen>> {
        if !self.needs_stereo_screen() {
            self.release_stereo_screen(alloc);
            return Ok(None);
        }

        let (width, height) = stereo_screen_size(self.display_size, self.stereo_screen_scale);
        if let Some(screen) = self.stereo_screen {
            if screen.width == width && screen.height == height {
                return Ok(Some(screen));
            }
            self.release_stereo_screen(alloc);
        }

        if !alloc.supports_render_targets() {
            if matches!(self.strategy, CorrectionStrategy::MeshBased | CorrectionStrategy::ShaderBased) {
                warn!(
                    "Render targets are not supported; {:?} correction replaced by vertex warping",
                    self.strategy
                );
                self.strategy = CorrectionStrategy::None;
            } else if !self.warned_no_targets {
                warn!("Render targets are not supported; rendering stereo straight to the display");
                self.warned_no_targets = true;
            }
            return Ok(None);
        }

        match alloc.allocate(width, height) {
            Ok(screen) => {
                info!("Created stereo screen {}x{}", screen.width, screen.height);
                self.stereo_screen = Some(screen);
                Ok(Some(screen))
            }
            Err(e) => {
                error!("Stereo screen allocation failed: {}", e);
                Err(match e {
                    StereoError::RenderTargetAllocation(_) => e,
                    other => StereoError::RenderTargetAllocation(other.to_string()),
                })
            }
        }
    }

    pub fn release_stereo_screen(&mut self, alloc: &mut dyn RenderTargetAllocator) {
        if let Some(screen) = self.stereo_screen.take() {
            info!("Releasing stereo screen {}x{}", screen.width, screen.height);
            alloc.release(screen);
        }
    }

    /// Frame counter used as the pose source's frame number.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Clears per-frame flags and advances the frame counter.
    pub fn end_frame(&mut self) {
        self.profile_changed = false;
        self.frame += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ScreenModel, ViewerModel};

    #[derive(Default)]
    struct CountingAllocator {
        unsupported: bool,
        fail: bool,
        next: u64,
        live: Vec<StereoScreen>,
    }

    impl RenderTargetAllocator for CountingAllocator {
        fn supports_render_targets(&self) -> bool {
            !self.unsupported
        }

        fn allocate(&mut self, width: u32, height: u32) -> Result<StereoScreen> {
            if self.fail {
                return Err(StereoError::RenderTargetAllocation("out of memory".into()));
            }
            self.next += 1;
            let screen = StereoScreen { id: RenderTargetId(self.next), width, height };
            self.live.push(screen);
            Ok(screen)
        }

        fn release(&mut self, screen: StereoScreen) {
            self.live.retain(|s| *s != screen);
        }
    }

    fn context() -> RenderContext {
        let mut ctx = RenderContext::new(DeviceProfile::default(), CorrectionStrategy::MeshBased);
        ctx.set_display_size(1920, 1080);
        ctx
    }

    #[test]
    fn stereo_screen_is_lazy_and_reused() {
        let mut ctx = context();
        let mut alloc = CountingAllocator::default();
        assert!(ctx.current_stereo_screen().is_none());
        let a = ctx.stereo_screen(&mut alloc).unwrap().unwrap();
        let b = ctx.stereo_screen(&mut alloc).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!((a.width, a.height), (1920, 1080));
        assert_eq!(alloc.live.len(), 1);
    }

    #[test]
    fn scale_change_recreates_stereo_screen() {
        let mut ctx = context();
        let mut alloc = CountingAllocator::default();
        ctx.stereo_screen(&mut alloc).unwrap();
        ctx.set_stereo_screen_scale(0.5);
        let s = ctx.stereo_screen(&mut alloc).unwrap().unwrap();
        assert_eq!((s.width, s.height), (960, 540));
        assert_eq!(alloc.live, vec![s]);

        ctx.set_stereo_screen_scale(100.0);
        assert_eq!(ctx.stereo_screen_scale(), 10.0);
    }

    #[test]
    fn no_stereo_screen_without_correction_or_vr() {
        let mut ctx = context();
        let mut alloc = CountingAllocator::default();
        ctx.stereo_screen(&mut alloc).unwrap();
        ctx.set_vr_mode(false);
        assert_eq!(ctx.stereo_screen(&mut alloc).unwrap(), None);
        assert!(alloc.live.is_empty());

        ctx.set_vr_mode(true);
        ctx.set_strategy(CorrectionStrategy::None, &mut alloc);
        assert_eq!(ctx.stereo_screen(&mut alloc).unwrap(), None);
    }

    #[test]
    fn unsupported_targets_degrade_to_direct_render() {
        let mut ctx = context();
        let mut alloc = CountingAllocator { unsupported: true, ..Default::default() };
        assert_eq!(ctx.stereo_screen(&mut alloc).unwrap(), None);
        assert_eq!(ctx.strategy(), CorrectionStrategy::None);
        assert!(!ctx.needs_stereo_screen());

        let mut ctx = RenderContext::new(DeviceProfile::default(), CorrectionStrategy::ShaderBased);
        assert_eq!(ctx.stereo_screen(&mut alloc).unwrap(), None);
        assert_eq!(ctx.strategy(), CorrectionStrategy::None);
    }

    #[test]
    fn native_correction_survives_missing_targets() {
        let mut ctx = RenderContext::new(DeviceProfile::default(), CorrectionStrategy::Native);
        let mut alloc = CountingAllocator { unsupported: true, ..Default::default() };
        assert_eq!(ctx.stereo_screen(&mut alloc).unwrap(), None);
        assert_eq!(ctx.strategy(), CorrectionStrategy::Native);
    }

    #[test]
    fn stereo_screen_size_scales_display() {
        assert_eq!(stereo_screen_size((1920, 1080), 1.0), (1920, 1080));
        assert_eq!(stereo_screen_size((1920, 1080), 0.25), (480, 270));
        assert_eq!(stereo_screen_size((3, 3), 0.1), (1, 1));
    }

    #[test]
    fn tiny_mesh_builder_still_builds() {
        let mut ctx = context();
        ctx.set_mesh_builder(DistortionMeshBuilder::new(0, 0, crate::mesh::MeshMode::DistortVertices));
        assert_eq!(ctx.distortion_mesh().grid_size(), (2, 2));
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut ctx = context();
        let mut alloc = CountingAllocator { fail: true, ..Default::default() };
        assert!(matches!(
            ctx.stereo_screen(&mut alloc),
            Err(StereoError::RenderTargetAllocation(_))
        ));
    }

    #[test]
    fn profile_change_rebuilds_mesh_once() {
        let mut ctx = context();
        let first = ctx.distortion_mesh().clone();
        assert_eq!(ctx.distortion_mesh(), &first);

        ctx.set_profile(DeviceProfile::known(ScreenModel::Nexus6, ViewerModel::CardboardMay2015));
        assert!(ctx.profile_changed());
        assert_ne!(ctx.distortion_mesh(), &first);

        ctx.end_frame();
        assert!(!ctx.profile_changed());
        assert_eq!(ctx.frame(), 1);
    }

    #[test]
    fn same_profile_is_not_a_change() {
        let mut ctx = context();
        ctx.set_profile(DeviceProfile::default());
        assert!(!ctx.profile_changed());
    }
}
