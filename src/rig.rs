//! Per-frame driver tying pose source, stereo controller and compositor
//! together.

use log::{error, info};

use crate::compositor::{Compositor, CompositorBackend, CorrectionStrategy};
use crate::context::{RenderContext, RenderTargetAllocator};
use crate::pose::{FrameEvents, PoseSource};
use crate::projection::Eye;
use crate::stereo::{RenderState, SceneRenderer, StereoController};

/// What a frame ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    pub events: FrameEvents,
    pub rendered: RenderState,
}

/// A stereo camera rig: the render context, one controller, its pose
/// source and the compositor.
pub struct StereoRig<P: PoseSource> {
    pub context: RenderContext,
    pub controller: StereoController,
    pose: P,
    compositor: Compositor,
}

impl<P: PoseSource> StereoRig<P> {
    pub fn new(
        context: RenderContext,
        controller: StereoController,
        pose: P,
        compositor: Compositor,
    ) -> Self {
        Self { context, controller, pose, compositor }
    }

    pub fn pose_source(&self) -> &P {
        &self.pose
    }

    pub fn pose_source_mut(&mut self) -> &mut P {
        &mut self.pose
    }

    pub fn recenter(&mut self) {
        info!("Recentering head tracking");
        self.pose.recenter();
    }

    /// Changes the correction strategy at runtime.
    pub fn set_strategy(&mut self, strategy: CorrectionStrategy, alloc: &mut dyn RenderTargetAllocator) {
        self.context.set_strategy(strategy, alloc);
        self.compositor.set_strategy(strategy);
    }

    /// Runs one frame: sample poses, render mono or stereo, composite,
    /// then clear the per-frame flags.
    pub fn render_frame<S, B>(&mut self, scene: &mut S, backend: &mut B, dt: f32) -> FrameReport
    where
        S: SceneRenderer,
        B: RenderTargetAllocator + CompositorBackend,
    {
        let frame = self.context.frame();
        let events = self.pose.update_state(frame);
        if events.profile_changed {
            if let Some(profile) = self.pose.current_profile() {
                self.context.set_profile(profile);
            }
        }

        let rendered = if self.context.vr_mode() {
            match self.context.stereo_screen(backend) {
                Ok(stereo_screen) => {
                    self.controller.begin_frame(RenderState::Stereo);
                    for eye in Eye::STEREO {
                        let request = self.controller.update_stereo_values(
                            eye,
                            &self.context,
                            &self.pose,
                            stereo_screen.as_ref(),
                            dt,
                        );
                        scene.render_eye(&request, stereo_screen.as_ref());
                    }
                    self.compositor.post_render(&mut self.context, stereo_screen, backend);
                    RenderState::Stereo
                }
                Err(e) => {
                    error!("Skipping stereo for frame {}: {}", frame, e);
                    self.render_mono(scene);
                    RenderState::Mono
                }
            }
        } else {
            self.context.release_stereo_screen(backend);
            self.render_mono(scene);
            RenderState::Mono
        };

        self.controller.end_frame();
        self.context.end_frame();
        FrameReport { frame, events, rendered }
    }

    fn render_mono<S: SceneRenderer>(&mut self, scene: &mut S) {
        self.controller.begin_frame(RenderState::Mono);
        let head = self.pose.head_pose();
        let (view, projection) = self.controller.mono_view_projection(&self.context, &head);
        scene.render_mono(self.controller.mono_camera(), view, projection);
    }
}
