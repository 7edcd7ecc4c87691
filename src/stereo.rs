//! Stereo camera rig: two eye cameras driven by one mono camera
//!
//! Each frame the eye cameras copy the mono camera's settings, take the
//! per-eye projection from the [`ProjectionCalculator`], and are placed by
//! the eye pose, scaled for stereo comfort and FOV matching.
//!
//! [`ProjectionCalculator`]: crate::projection::ProjectionCalculator

use glam::{Mat4, Vec3, Vec4};
use log::debug;

use crate::compositor::CorrectionStrategy;
use crate::config::StereoConfig;
use crate::context::{RenderContext, RenderTargetId, StereoScreen};
use crate::pose::{Pose3D, PoseSource, FLIP_Z};
use crate::projection::{
    fix_preview_viewport, fix_projection, fix_viewport, Distortion, Eye, MatrixExt,
};
use crate::viewport::Rect;

fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Hermite interpolation between `from` and `to`.
fn smooth_step(from: f32, to: f32, t: f32) -> f32 {
    let t = clamp01(t);
    let t = -2.0 * t * t * t + 3.0 * t * t;
    to * t + from * (1.0 - t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearFlags {
    #[default]
    Skybox,
    SolidColor,
    DepthOnly,
    Nothing,
}

/// Settings an eye camera copies from the mono camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    pub clear_flags: ClearFlags,
    pub background: [f32; 4],
    pub culling_mask: u32,
    pub near: f32,
    pub far: f32,
    /// Vertical field of view in degrees.
    pub fov_y: f32,
    /// Normalized rect on the display or target.
    pub rect: Rect,
    /// Draw order among cameras.
    pub depth: f32,
    /// Offscreen target instead of the display.
    pub target: Option<RenderTargetId>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            clear_flags: ClearFlags::Skybox,
            background: [0.0, 0.0, 0.0, 1.0],
            culling_mask: u32::MAX,
            near: 0.3,
            far: 1000.0,
            fov_y: 60.0,
            rect: Rect::FULL,
            depth: 0.0,
            target: None,
        }
    }
}

/// The application's ordinary camera.
#[derive(Debug, Clone, PartialEq)]
pub struct MonoCamera {
    pub settings: CameraSettings,
    /// Body transform; the tracked head pose is applied on top of it.
    pub transform: Mat4,
    /// False while the eye cameras render in its place.
    pub enabled: bool,
}

impl Default for MonoCamera {
    fn default() -> Self {
        Self::new(CameraSettings::default())
    }
}

impl MonoCamera {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings, transform: Mat4::IDENTITY, enabled: true }
    }

    /// Symmetric GL-style projection for the given aspect ratio.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh_gl(
            self.settings.fov_y.to_radians(),
            aspect,
            self.settings.near,
            self.settings.far,
        )
    }

    /// World scale along the camera's forward axis.
    pub fn z_scale(&self) -> f32 {
        self.transform.z_axis.truncate().length()
    }
}

/// Knobs of the stereo controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoSettings {
    pub stereo_multiplier: f32,
    pub match_mono_fov: f32,
    pub match_by_zoom: f32,
    pub screen_parallax: f32,
    pub stereo_padding_x: f32,
    pub stereo_padding_y: f32,
    pub check_stereo_comfort: bool,
    pub comfortable_viewing_range: (f32, f32),
    pub direct_render: bool,
    pub keep_stereo_updated: bool,
    pub stereo_adjust_smoothing: f32,
    pub track_rotation: bool,
    pub track_position: bool,
}

impl Default for StereoSettings {
    fn default() -> Self {
        Self::from(&StereoConfig::default())
    }
}

impl From<&StereoConfig> for StereoSettings {
    fn from(c: &StereoConfig) -> Self {
        Self {
            stereo_multiplier: c.stereo_multiplier,
            match_mono_fov: c.match_mono_fov,
            match_by_zoom: c.match_by_zoom,
            screen_parallax: c.screen_parallax,
            stereo_padding_x: c.stereo_padding_x,
            stereo_padding_y: c.stereo_padding_y,
            check_stereo_comfort: c.check_stereo_comfort,
            comfortable_viewing_range: (
                c.comfortable_viewing_range[0],
                c.comfortable_viewing_range[1],
            ),
            direct_render: c.direct_render,
            keep_stereo_updated: c.keep_stereo_updated,
            stereo_adjust_smoothing: c.stereo_adjust_smoothing,
            track_rotation: c.track_rotation,
            track_position: c.track_position,
        }
    }
}

/// The object the viewer is looking at: a sphere in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterOfInterest {
    pub position: Vec3,
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoAdjustment {
    /// Multiplier on the eye separation.
    pub ipd_scale: f32,
    /// Forward shift of both eyes, in local units.
    pub eye_offset: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Mono,
    Stereo,
}

/// Where an eye renders this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyeTarget {
    /// Straight into its half of the stereo screen.
    StereoScreen,
    /// Into a full-size temporary target, then blitted into its half.
    TemporaryThenBlit,
    /// Straight to the display, uncorrected.
    Display,
    /// The mono camera's own offscreen target.
    MonoTarget(RenderTargetId),
}

/// Data for shaders that pre-warp geometry when no correction pass runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexWarp {
    /// Projection of the visible screen area without the lens.
    pub real_projection: Mat4,
    /// Eye clip space back to world, then into the undistorted frustum.
    pub fix_projection: Mat4,
    /// Texture to NDC helper: `(p00, p11, p02 - 1, p12 - 1) / 2`.
    pub projection_vec: Vec4,
    /// Same as `projection_vec` for the undistorted projection.
    pub unprojection_vec: Vec4,
}

/// Everything a scene renderer needs to draw one eye.
#[derive(Debug, Clone, PartialEq)]
pub struct EyeRenderRequest {
    pub eye: Eye,
    pub settings: CameraSettings,
    pub camera_to_world: Mat4,
    /// World to view space, right-handed, looking down -Z.
    pub view: Mat4,
    /// GL clip-space projection.
    pub projection: Mat4,
    /// Normalized rect on the target chosen by `target`.
    pub viewport: Rect,
    pub target: EyeTarget,
    pub vertex_warp: Option<VertexWarp>,
}

/// Draws the application's scene.
pub trait SceneRenderer {
    fn render_mono(&mut self, camera: &MonoCamera, view: Mat4, projection: Mat4);

    fn render_eye(&mut self, request: &EyeRenderRequest, stereo_screen: Option<&StereoScreen>);
}

/// One eye of the rig.
#[derive(Debug, Clone, PartialEq)]
pub struct EyeCamera {
    pub eye: Eye,
    /// Layers XORed into the copied culling mask, for per-eye content.
    pub toggle_culling_mask: u32,
    pub enabled: bool,
    settings: CameraSettings,
    projection: Mat4,
    local_position: Option<Vec3>,
}

impl EyeCamera {
    fn new(eye: Eye) -> Self {
        Self {
            eye,
            toggle_culling_mask: 0,
            enabled: false,
            settings: CameraSettings::default(),
            projection: Mat4::IDENTITY,
            local_position: None,
        }
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn projection(&self) -> &Mat4 {
        &self.projection
    }

    /// Position relative to the head, once placed.
    pub fn local_position(&self) -> Option<Vec3> {
        self.local_position
    }
}

pub struct StereoController {
    pub settings: StereoSettings,
    mono: MonoCamera,
    eyes: [EyeCamera; 2],
    center_of_interest: Option<CenterOfInterest>,
    preview_aspect: Option<f32>,
    state: RenderState,
}

impl StereoController {
    pub fn new(settings: StereoSettings, mono: MonoCamera) -> Self {
        Self {
            settings,
            mono,
            eyes: [EyeCamera::new(Eye::Left), EyeCamera::new(Eye::Right)],
            center_of_interest: None,
            preview_aspect: None,
            state: RenderState::Mono,
        }
    }

    pub fn from_config(config: &StereoConfig, mono: MonoCamera) -> Self {
        Self::new(StereoSettings::from(config), mono)
    }

    pub fn mono_camera(&self) -> &MonoCamera {
        &self.mono
    }

    pub fn mono_camera_mut(&mut self) -> &mut MonoCamera {
        &mut self.mono
    }

    /// Left or right eye camera. The center eye has no camera of its own.
    pub fn eye_camera(&self, eye: Eye) -> Option<&EyeCamera> {
        match eye {
            Eye::Left => Some(&self.eyes[0]),
            Eye::Right => Some(&self.eyes[1]),
            Eye::Center => None,
        }
    }

    pub fn eye_camera_mut(&mut self, eye: Eye) -> Option<&mut EyeCamera> {
        match eye {
            Eye::Left => Some(&mut self.eyes[0]),
            Eye::Right => Some(&mut self.eyes[1]),
            Eye::Center => None,
        }
    }

    pub fn center_of_interest(&self) -> Option<CenterOfInterest> {
        self.center_of_interest
    }

    pub fn set_center_of_interest(&mut self, coi: Option<CenterOfInterest>) {
        self.center_of_interest = coi;
    }

    /// Aspect of a desktop preview window the display is fitted into.
    pub fn set_preview_aspect(&mut self, aspect: Option<f32>) {
        self.preview_aspect = aspect;
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    /// Swaps the mono camera for the eye cameras, or back.
    pub fn begin_frame(&mut self, state: RenderState) {
        if state != self.state {
            debug!("Stereo controller: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        let stereo = state == RenderState::Stereo;
        self.mono.enabled = !stereo;
        for eye in &mut self.eyes {
            eye.enabled = stereo;
        }
    }

    /// Re-enables the mono camera so it stays valid between frames.
    pub fn end_frame(&mut self) {
        self.mono.enabled = true;
        for eye in &mut self.eyes {
            eye.enabled = false;
        }
    }

    /// Head transform in world space, honoring the tracking switches.
    pub fn head_to_world(&self, head: &Pose3D) -> Mat4 {
        let rotation = if self.settings.track_rotation {
            head.orientation()
        } else {
            glam::Quat::IDENTITY
        };
        let position = if self.settings.track_position {
            head.position()
        } else {
            Vec3::ZERO
        };
        self.mono.transform * Mat4::from_rotation_translation(rotation, position)
    }

    /// View and projection for the plain mono render.
    pub fn mono_view_projection(&self, ctx: &RenderContext, head: &Pose3D) -> (Mat4, Mat4) {
        let view = FLIP_Z * self.head_to_world(head).inverse();
        (view, self.mono.projection(ctx.display_aspect()))
    }

    /// Eye separation scale and forward offset for the current center of
    /// interest.
    ///
    /// `proj11` is the eye projection's vertical term and `mono11` the mono
    /// camera's. Without a center of interest the separation is just the
    /// stereo multiplier.
    pub fn compute_stereo_adjustment(
        &self,
        camera_position: Vec3,
        z_scale: f32,
        proj11: f32,
        mono11: f32,
    ) -> StereoAdjustment {
        let mut adj = StereoAdjustment {
            ipd_scale: self.settings.stereo_multiplier,
            eye_offset: 0.0,
        };
        let Some(coi) = self.center_of_interest else {
            return adj;
        };

        let distance = (coi.position - camera_position).length();
        let radius = coi.radius.clamp(0.0, distance);
        // Move the eyes so the object keeps the angular size it has in the
        // mono camera.
        let scale = proj11 / mono11;
        let offset = (radius * radius + (distance * distance - radius * radius) * scale * scale).sqrt();
        adj.eye_offset = (distance - offset) * clamp01(self.settings.match_mono_fov) / z_scale;

        if self.settings.check_stereo_comfort {
            let (min, max) = self.settings.comfortable_viewing_range;
            if min < max {
                let min_distance = (distance - radius) / z_scale - adj.eye_offset;
                adj.ipd_scale *= min_distance / min_distance.clamp(min, max);
            }
        }
        adj
    }

    /// Eye position relative to the head.
    pub fn compute_stereo_eye_position<P: PoseSource + ?Sized>(
        &self,
        eye: Eye,
        adj: &StereoAdjustment,
        pose: &P,
    ) -> Vec3 {
        pose.eye_pose(eye).position() * adj.ipd_scale + Vec3::Z * adj.eye_offset
    }

    /// The mono camera's rect squeezed into one half of the stereo screen.
    ///
    /// `parx, pary` are the eye projection's skew terms, used to give
    /// picture-in-picture cameras an apparent depth.
    pub fn make_side_by_side(&self, eye: Eye, parx: f32, pary: f32) -> Rect {
        let mono_rect = self.mono.settings.rect;
        let mut rect = mono_rect;

        let mut center = rect.center();
        center.x = lerp(center.x, 0.5, clamp01(self.settings.stereo_padding_x));
        center.y = lerp(center.y, 0.5, clamp01(self.settings.stereo_padding_y));
        rect.set_center(center);

        // Each eye only gets half the width; shrink narrow rects less.
        let width = smooth_step(-0.5, 0.5, (rect.width + 1.0) / 2.0);
        rect.x += (rect.width - width) / 2.0;
        rect.width = width;

        // Split the space outside the rect proportionally in each half.
        rect.x *= (0.5 - rect.width) / (1.0 - rect.width);
        if eye == Eye::Right {
            rect.x += 0.5;
        }

        let parallax = clamp01(self.settings.screen_parallax);
        if mono_rect.width < 1.0 && parallax > 0.0 {
            rect.x -= parx / 4.0 * parallax;
            rect.y -= pary / 2.0 * parallax;
        }
        rect
    }

    /// Places one eye camera for this frame and returns its render request.
    ///
    /// [`Eye::Center`] yields a request for a single centered view.
    pub fn update_stereo_values<P: PoseSource + ?Sized>(
        &mut self,
        eye: Eye,
        ctx: &RenderContext,
        pose: &P,
        stereo_screen: Option<&StereoScreen>,
        dt: f32,
    ) -> EyeRenderRequest {
        let calc = ctx.calculator();
        let mono = &self.mono;
        let near = mono.settings.near;
        let far = mono.settings.far;

        let mut proj = calc.projection(eye, Distortion::Distorted);
        let mut real_proj = calc.projection(eye, Distortion::Undistorted);

        let mut settings = mono.settings;
        let toggle = self.eye_camera(eye).map_or(0, |c| c.toggle_culling_mask);
        settings.culling_mask ^= toggle;
        settings.rect = self.make_side_by_side(eye, proj.at(0, 2), proj.at(1, 2));

        fix_projection(&mut proj, &settings.rect, near, far);
        fix_projection(&mut real_proj, &settings.rect, near, far);

        // Zoom towards the mono camera's FOV. Lerp the reciprocal so the
        // zoom is linear in frustum width.
        let mono11 = mono.projection(ctx.display_aspect()).at(1, 1);
        let blend = clamp01(self.settings.match_by_zoom) * clamp01(self.settings.match_mono_fov);
        let p11 = proj.at(1, 1);
        let zoom = 1.0 / lerp(1.0 / p11, 1.0 / mono11, blend) / p11;
        proj.set(0, 0, proj.at(0, 0) * zoom);
        proj.set(1, 1, p11 * zoom);

        let head_to_world = self.head_to_world(&pose.head_pose());
        let adj = self.compute_stereo_adjustment(
            head_to_world.col(3).truncate(),
            mono.z_scale(),
            proj.at(1, 1),
            mono11,
        );
        let target_position = self.compute_stereo_eye_position(eye, &adj, pose);

        let smoothing = self.settings.stereo_adjust_smoothing;
        let interp = if (self.settings.keep_stereo_updated || self.center_of_interest.is_some())
            && smoothing + dt > 0.0
        {
            dt / (smoothing + dt)
        } else {
            1.0
        };

        // IPD scaling changes the vergence of the two frusta.
        let nominal = pose.eye_pose(eye).position();
        let skew_y = if nominal.y == 0.0 { 1.0 } else { adj.ipd_scale };
        proj.set(0, 2, proj.at(0, 2) * adj.ipd_scale.abs());
        proj.set(1, 2, proj.at(1, 2) * skew_y.abs());

        let (target, viewport) = match (mono.settings.target, stereo_screen) {
            (Some(id), _) => (EyeTarget::MonoTarget(id), settings.rect),
            (None, Some(_)) if self.settings.direct_render => (EyeTarget::StereoScreen, settings.rect),
            (None, Some(_)) => (EyeTarget::TemporaryThenBlit, settings.rect),
            (None, None) => {
                let visible = calc.viewport(eye, Distortion::Undistorted);
                let mut rect = fix_viewport(&settings.rect, eye, &visible);
                if let Some(window_aspect) = self.preview_aspect {
                    rect = fix_preview_viewport(&rect, ctx.profile().screen_aspect(), window_aspect);
                }
                (EyeTarget::Display, rect)
            }
        };
        settings.rect = viewport;

        // The center eye has no camera, so it is placed without smoothing
        // and leaves the stereo cameras untouched.
        let snap = ctx.profile_changed();
        let local = match self.eye_camera_mut(eye) {
            Some(camera) => {
                let local = match camera.local_position {
                    Some(previous) if !snap => previous.lerp(target_position, interp),
                    _ => target_position,
                };
                camera.local_position = Some(local);
                camera.settings = settings;
                camera.projection = proj;
                local
            }
            None => target_position,
        };

        let camera_to_world = head_to_world * Mat4::from_translation(local);
        let view = FLIP_Z * camera_to_world.inverse();

        let vertex_warp = (ctx.strategy() == CorrectionStrategy::None).then(|| VertexWarp {
            real_projection: real_proj,
            fix_projection: view.inverse() * proj.inverse() * real_proj,
            projection_vec: projection_vec(&proj),
            unprojection_vec: projection_vec(&real_proj),
        });

        EyeRenderRequest {
            eye,
            settings,
            camera_to_world,
            view,
            projection: proj,
            viewport,
            target,
            vertex_warp,
        }
    }
}

fn projection_vec(p: &Mat4) -> Vec4 {
    Vec4::new(p.at(0, 0), p.at(1, 1), p.at(0, 2) - 1.0, p.at(1, 2) - 1.0) / 2.0
}
